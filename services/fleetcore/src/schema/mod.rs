//! Per-tenant storage namespaces.
//!
//! # Purpose
//! Creates, migrates, inspects, and (behind an explicit confirmation phrase)
//! destroys the isolated schema that holds one tenant's data.
//!
//! # Lifecycle
//! `Absent -> Creating -> Ready -> Destroying -> Absent`. A namespace is
//! `Creating` while it exists but has not reached the latest structure
//! version; a failed structure step leaves it there (no automatic rollback)
//! and the caller either retries [`SchemaManager::migrate`] or destroys it.
//!
//! # Key invariants
//! - Schema names only come from [`crate::ident::tenant_schema_name`].
//! - Catalog lookups bind names as parameters; DDL interpolates only quoted
//!   identifiers.
//! - [`SchemaManager::destroy_namespace`] is the only destructive operation
//!   and requires `DELETE_TENANT_<tenantId>` verbatim.
//!
//! # Backends
//! [`memory::InMemorySchemaBackend`] for tests and local runs,
//! [`postgres::PostgresSchemaBackend`] for real deployments.
pub mod memory;
pub mod postgres;
pub mod structure;

use crate::ident::{self, IdentError, TENANT_SCHEMA_PREFIX};
use async_trait::async_trait;
use std::sync::Arc;
use structure::{StructureStep, TENANT_STRUCTURE};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error(transparent)]
    Ident(#[from] IdentError),
    #[error("destroying tenant {tenant_id} requires its exact confirmation phrase")]
    ConfirmationRequired { tenant_id: String },
    #[error("structure step {version} failed for {schema}: {reason}")]
    StructureFailed {
        schema: String,
        version: i32,
        reason: String,
    },
    #[error("namespace {0} does not exist")]
    NotFound(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type SchemaResult<T> = Result<T, SchemaError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamespaceState {
    Absent,
    Creating,
    Ready,
    Destroying,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantNamespace {
    pub tenant_id: String,
    pub schema: String,
    pub state: NamespaceState,
    pub structure_version: i32,
}

/// Storage operations the manager needs. Names passed in are already
/// validated; implementations still quote them before building SQL.
#[async_trait]
pub trait SchemaBackend: Send + Sync {
    async fn create_schema(&self, schema: &str) -> SchemaResult<()>;
    /// Apply `steps` newer than the recorded version; return the new version.
    async fn apply_structure(&self, schema: &str, steps: &[StructureStep]) -> SchemaResult<i32>;
    /// `None` when the schema is absent, `Some(0)` when it has no structure.
    async fn structure_version(&self, schema: &str) -> SchemaResult<Option<i32>>;
    async fn schema_exists(&self, schema: &str) -> SchemaResult<bool>;
    /// Names starting with `prefix`, any order.
    async fn list_schemas(&self, prefix: &str) -> SchemaResult<Vec<String>>;
    /// Drop the schema and everything inside it. Returns whether it existed.
    async fn drop_schema(&self, schema: &str) -> SchemaResult<bool>;
    fn backend_name(&self) -> &'static str;
}

#[derive(Clone)]
pub struct SchemaManager {
    backend: Arc<dyn SchemaBackend>,
    steps: &'static [StructureStep],
}

impl SchemaManager {
    pub fn new(backend: Arc<dyn SchemaBackend>) -> Self {
        Self::with_structure(backend, TENANT_STRUCTURE)
    }

    pub fn with_structure(backend: Arc<dyn SchemaBackend>, steps: &'static [StructureStep]) -> Self {
        Self { backend, steps }
    }

    pub fn latest_structure_version(&self) -> i32 {
        structure::latest_version(self.steps)
    }

    /// Phrase a caller must echo back to destroy `tenant_id`.
    pub fn confirmation_phrase(tenant_id: &str) -> String {
        format!("DELETE_TENANT_{tenant_id}")
    }

    /// Map a schema name back to its (sanitized) tenant id.
    pub fn namespace_to_tenant_id(schema: &str) -> Option<String> {
        ident::schema_to_tenant_id(schema)
    }

    /// Create the namespace for `tenant_id` and apply its structure.
    ///
    /// # Errors
    /// - [`SchemaError::Ident`] for an id that fails the identifier guard;
    ///   nothing is created.
    /// - [`SchemaError::StructureFailed`] when a step fails. The schema is
    ///   left in place in the `Creating` state.
    pub async fn create_namespace(&self, tenant_id: &str) -> SchemaResult<TenantNamespace> {
        let schema = ident::tenant_schema_name(tenant_id)?;
        self.backend.create_schema(&schema).await?;
        tracing::info!(tenant_id, schema = %schema, "tenant namespace created");
        self.apply(tenant_id, schema).await
    }

    /// Bring an existing namespace up to the latest structure version.
    pub async fn migrate(&self, tenant_id: &str) -> SchemaResult<TenantNamespace> {
        let schema = ident::tenant_schema_name(tenant_id)?;
        if !self.backend.schema_exists(&schema).await? {
            return Err(SchemaError::NotFound(schema));
        }
        self.apply(tenant_id, schema).await
    }

    async fn apply(&self, tenant_id: &str, schema: String) -> SchemaResult<TenantNamespace> {
        let version = match self.backend.apply_structure(&schema, self.steps).await {
            Ok(version) => version,
            Err(err) => {
                tracing::warn!(
                    tenant_id,
                    schema = %schema,
                    error = %err,
                    "tenant structure not applied; namespace left in creating state"
                );
                return Err(err);
            }
        };
        Ok(TenantNamespace {
            tenant_id: tenant_id.to_string(),
            state: self.state_for(Some(version)),
            schema,
            structure_version: version,
        })
    }

    pub async fn namespace_exists(&self, tenant_id: &str) -> SchemaResult<bool> {
        let schema = ident::tenant_schema_name(tenant_id)?;
        self.backend.schema_exists(&schema).await
    }

    pub async fn namespace_state(&self, tenant_id: &str) -> SchemaResult<NamespaceState> {
        let schema = ident::tenant_schema_name(tenant_id)?;
        let version = self.backend.structure_version(&schema).await?;
        Ok(self.state_for(version))
    }

    fn state_for(&self, version: Option<i32>) -> NamespaceState {
        match version {
            None => NamespaceState::Absent,
            Some(v) if v >= self.latest_structure_version() => NamespaceState::Ready,
            Some(_) => NamespaceState::Creating,
        }
    }

    /// All tenant namespaces, ascending.
    pub async fn list_namespaces(&self) -> SchemaResult<Vec<String>> {
        let mut names: Vec<String> = self
            .backend
            .list_schemas(TENANT_SCHEMA_PREFIX)
            .await?
            .into_iter()
            .filter(|name| ident::is_tenant_schema(name))
            .collect();
        names.sort();
        metrics::gauge!("fleetcore_tenant_namespaces").set(names.len() as f64);
        Ok(names)
    }

    /// Drop the namespace of `tenant_id` and everything in it.
    ///
    /// # Errors
    /// - [`SchemaError::ConfirmationRequired`] unless `confirmation` equals
    ///   [`SchemaManager::confirmation_phrase`] exactly.
    pub async fn destroy_namespace(&self, tenant_id: &str, confirmation: &str) -> SchemaResult<()> {
        let schema = ident::tenant_schema_name(tenant_id)?;
        if confirmation != Self::confirmation_phrase(tenant_id) {
            tracing::warn!(tenant_id, "namespace destroy refused: confirmation mismatch");
            return Err(SchemaError::ConfirmationRequired {
                tenant_id: tenant_id.to_string(),
            });
        }
        tracing::warn!(tenant_id, schema = %schema, state = ?NamespaceState::Destroying, "destroying tenant namespace");
        let existed = self.backend.drop_schema(&schema).await?;
        tracing::warn!(tenant_id, schema = %schema, existed, "tenant namespace destroyed");
        Ok(())
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.backend_name()
    }
}
