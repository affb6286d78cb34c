//! Postgres audit sink backed by the shared `audit_log` table.
//!
//! The table is cross-tenant on purpose so platform admins can query it
//! without touching tenant namespaces. Indexes on `(tenant_id, created_at)`
//! and `(user_id, created_at)` back the two query paths. `created_at` is
//! always the database's `now()`, never the writer's clock.
use super::{AuditEvent, AuditQuery, AuditRecord, AuditResult, AuditSink};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::types::Json;

#[derive(Debug, Clone)]
pub struct PostgresAuditSink {
    pool: PgPool,
}

impl PostgresAuditSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct AuditRow {
    id: i64,
    action: String,
    tenant_id: String,
    user_id: String,
    metadata: Json<serde_json::Value>,
    ip_address: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<AuditRow> for AuditRecord {
    fn from(row: AuditRow) -> Self {
        Self {
            id: row.id,
            action: row.action,
            tenant_id: row.tenant_id,
            user_id: row.user_id,
            metadata: row.metadata.0,
            ip_address: row.ip_address,
            timestamp: row.created_at,
        }
    }
}

const SELECT_COLUMNS: &str =
    "SELECT id, action, tenant_id, user_id, metadata, ip_address, created_at FROM audit_log";

#[async_trait]
impl AuditSink for PostgresAuditSink {
    async fn insert(&self, event: AuditEvent) -> AuditResult<AuditRecord> {
        let row = sqlx::query_as::<_, AuditRow>(
            r#"INSERT INTO audit_log (action, tenant_id, user_id, metadata, ip_address)
               VALUES ($1, $2, $3, $4, $5)
               RETURNING id, action, tenant_id, user_id, metadata, ip_address, created_at"#,
        )
        .bind(&event.action)
        .bind(&event.tenant_id)
        .bind(&event.user_id)
        .bind(Json(&event.metadata))
        .bind(&event.ip_address)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn query_by_tenant(&self, tenant_id: &str, query: &AuditQuery) -> AuditResult<Vec<AuditRecord>> {
        let rows = sqlx::query_as::<_, AuditRow>(&format!(
            "{SELECT_COLUMNS} WHERE tenant_id = $1 AND ($2::text IS NULL OR action = $2)
             ORDER BY created_at DESC, id DESC LIMIT $3 OFFSET $4"
        ))
        .bind(tenant_id)
        .bind(&query.action)
        .bind(i64::from(query.effective_limit()))
        .bind(i64::from(query.offset))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(AuditRecord::from).collect())
    }

    async fn query_by_user(&self, user_id: &str, query: &AuditQuery) -> AuditResult<Vec<AuditRecord>> {
        let rows = sqlx::query_as::<_, AuditRow>(&format!(
            "{SELECT_COLUMNS} WHERE user_id = $1 AND ($2::text IS NULL OR action = $2)
             ORDER BY created_at DESC, id DESC LIMIT $3 OFFSET $4"
        ))
        .bind(user_id)
        .bind(&query.action)
        .bind(i64::from(query.effective_limit()))
        .bind(i64::from(query.offset))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(AuditRecord::from).collect())
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}
