//! In-memory schema backend.
//!
//! Tracks schema names and their structure version in a `BTreeMap` behind a
//! `tokio::sync::RwLock`. Not durable; used by unit tests and local runs.
//! A structure step can be made to fail on demand so callers can exercise
//! the partially-created namespace path.
use super::structure::{self, StructureStep};
use super::{SchemaBackend, SchemaError, SchemaResult};
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
pub struct InMemorySchemaBackend {
    schemas: RwLock<BTreeMap<String, i32>>,
    fail_at: RwLock<Option<i32>>,
}

impl InMemorySchemaBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the step with `version` fail until [`Self::clear_failures`].
    pub async fn fail_structure_step(&self, version: i32) {
        *self.fail_at.write().await = Some(version);
    }

    pub async fn clear_failures(&self) {
        *self.fail_at.write().await = None;
    }
}

#[async_trait]
impl SchemaBackend for InMemorySchemaBackend {
    async fn create_schema(&self, schema: &str) -> SchemaResult<()> {
        self.schemas
            .write()
            .await
            .entry(schema.to_string())
            .or_insert(0);
        Ok(())
    }

    async fn apply_structure(&self, schema: &str, steps: &[StructureStep]) -> SchemaResult<i32> {
        let fail_at = *self.fail_at.read().await;
        let mut schemas = self.schemas.write().await;
        let current = schemas
            .get_mut(schema)
            .ok_or_else(|| SchemaError::NotFound(schema.to_string()))?;
        for step in structure::pending_steps(steps, *current) {
            step.render(schema)?;
            if fail_at == Some(step.version) {
                return Err(SchemaError::StructureFailed {
                    schema: schema.to_string(),
                    version: step.version,
                    reason: "injected failure".into(),
                });
            }
            *current = step.version;
        }
        Ok(*current)
    }

    async fn structure_version(&self, schema: &str) -> SchemaResult<Option<i32>> {
        Ok(self.schemas.read().await.get(schema).copied())
    }

    async fn schema_exists(&self, schema: &str) -> SchemaResult<bool> {
        Ok(self.schemas.read().await.contains_key(schema))
    }

    async fn list_schemas(&self, prefix: &str) -> SchemaResult<Vec<String>> {
        Ok(self
            .schemas
            .read()
            .await
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn drop_schema(&self, schema: &str) -> SchemaResult<bool> {
        Ok(self.schemas.write().await.remove(schema).is_some())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
