//! Postgres schema backend.
//!
//! # Purpose
//! Owns the DDL for tenant namespaces: `CREATE SCHEMA`, structure steps, and
//! `DROP SCHEMA ... CASCADE`.
//!
//! # Key invariants
//! - Catalog lookups (`pg_namespace`, `to_regclass`) bind names as parameters.
//! - DDL only ever interpolates output of [`quote_identifier`].
//! - Each structure step runs in its own transaction together with the row
//!   that records it, so a crash never leaves a step half-recorded.
//!
//! # Concurrency model
//! Concurrent migrators of the same schema serialize on a transaction-scoped
//! advisory lock keyed by the schema name and re-read the version after
//! acquiring it, so a step is applied at most once. `CREATE SCHEMA` and the
//! structure table's DDL run under the same lock, so first-time migrators
//! never race on the catalog.
use super::structure::{self, STRUCTURE_TABLE, StructureStep};
use super::{SchemaBackend, SchemaError, SchemaResult};
use crate::ident::quote_identifier;
use async_trait::async_trait;
use sqlx::{Executor, PgPool, Postgres, Transaction};

#[derive(Debug, Clone)]
pub struct PostgresSchemaBackend {
    pool: PgPool,
}

impl PostgresSchemaBackend {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn structure_table(schema: &str) -> SchemaResult<String> {
        Ok(format!(
            "{}.{}",
            quote_identifier(schema)?,
            quote_identifier(STRUCTURE_TABLE)?
        ))
    }

    async fn apply_step(&self, schema: &str, step: &StructureStep) -> SchemaResult<Option<i32>> {
        let table = Self::structure_table(schema)?;
        let rendered = step.render(schema)?;
        let mut tx = self.pool.begin().await?;
        lock_schema(&mut tx, schema).await?;
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                version INT PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )"
        ))
        .execute(&mut *tx)
        .await?;

        let current: i32 = sqlx::query_scalar(&format!(
            "SELECT COALESCE(MAX(version), 0) FROM {table}"
        ))
        .fetch_one(&mut *tx)
        .await?;
        if current >= step.version {
            tx.rollback().await?;
            return Ok(None);
        }

        (&mut *tx)
            .execute(sqlx::raw_sql(&rendered))
            .await
            .map_err(|err| SchemaError::StructureFailed {
                schema: schema.to_string(),
                version: step.version,
                reason: err.to_string(),
            })?;
        sqlx::query(&format!("INSERT INTO {table} (version, name) VALUES ($1, $2)"))
            .bind(step.version)
            .bind(step.name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::info!(schema, version = step.version, step = step.name, "structure step applied");
        Ok(Some(step.version))
    }
}

/// Serialize DDL on one schema until the transaction ends.
async fn lock_schema(tx: &mut Transaction<'_, Postgres>, schema: &str) -> SchemaResult<()> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
        .bind(format!("fleetcore.structure.{schema}"))
        .execute(&mut **tx)
        .await?;
    Ok(())
}

#[async_trait]
impl SchemaBackend for PostgresSchemaBackend {
    async fn create_schema(&self, schema: &str) -> SchemaResult<()> {
        let quoted = quote_identifier(schema)?;
        let mut tx = self.pool.begin().await?;
        lock_schema(&mut tx, schema).await?;
        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {quoted}"))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn apply_structure(&self, schema: &str, steps: &[StructureStep]) -> SchemaResult<i32> {
        let current = self.structure_version(schema).await?.unwrap_or(0);
        for step in structure::pending_steps(steps, current) {
            self.apply_step(schema, &step).await?;
        }
        Ok(self.structure_version(schema).await?.unwrap_or(0))
    }

    async fn structure_version(&self, schema: &str) -> SchemaResult<Option<i32>> {
        if !self.schema_exists(schema).await? {
            return Ok(None);
        }
        let table = Self::structure_table(schema)?;
        let tracked: bool = sqlx::query_scalar("SELECT to_regclass($1) IS NOT NULL")
            .bind(&table)
            .fetch_one(&self.pool)
            .await?;
        if !tracked {
            return Ok(Some(0));
        }
        let version: i32 = sqlx::query_scalar(&format!(
            "SELECT COALESCE(MAX(version), 0) FROM {table}"
        ))
        .fetch_one(&self.pool)
        .await?;
        Ok(Some(version))
    }

    async fn schema_exists(&self, schema: &str) -> SchemaResult<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM pg_catalog.pg_namespace WHERE nspname::text = $1)",
        )
        .bind(schema)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn list_schemas(&self, prefix: &str) -> SchemaResult<Vec<String>> {
        let pattern = format!("{}%", prefix.replace('\\', "\\\\").replace('_', "\\_"));
        let names: Vec<String> = sqlx::query_scalar(
            r#"SELECT nspname::text FROM pg_catalog.pg_namespace
               WHERE nspname::text LIKE $1 ESCAPE '\'
               ORDER BY nspname ASC"#,
        )
        .bind(pattern)
        .fetch_all(&self.pool)
        .await?;
        Ok(names)
    }

    async fn drop_schema(&self, schema: &str) -> SchemaResult<bool> {
        let existed = self.schema_exists(schema).await?;
        let quoted = quote_identifier(schema)?;
        sqlx::query(&format!("DROP SCHEMA IF EXISTS {quoted} CASCADE"))
            .execute(&self.pool)
            .await?;
        Ok(existed)
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}
