//! Tenant lifecycle and bot credentials.
use super::{Actor, Platform, PlatformError, PlatformResult};
use crate::audit::AuditAction;
use crate::consistency::batch::chunked_update;
use crate::consistency::optimistic::VersionedRow;
use crate::consistency::unique::{DuplicatePolicy, UniqueGuard};
use crate::consistency::{ConsistencyError, ConsistencyResult, SqlValue, run_in_transaction};
use crate::crypto::{self, CryptoError};
use crate::ident::{self, TableRef};
use crate::ratelimit::policy::RateLimitPolicy;
use crate::schema::TenantNamespace;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::PgConnection;
use std::fmt;
use std::str::FromStr;

const TENANTS_TABLE: &str = "tenants";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BotStatus {
    Running,
    Stopped,
    Crashed,
}

impl BotStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BotStatus::Running => "running",
            BotStatus::Stopped => "stopped",
            BotStatus::Crashed => "crashed",
        }
    }

    /// Audit action for moving from `previous` to `self`.
    pub fn transition_action(self, previous: BotStatus) -> AuditAction {
        match (previous, self) {
            (BotStatus::Running, BotStatus::Running) => AuditAction::BotRestarted,
            (_, BotStatus::Running) => AuditAction::BotStarted,
            (_, BotStatus::Stopped) => AuditAction::BotStopped,
            (_, BotStatus::Crashed) => AuditAction::BotCrashed,
        }
    }
}

impl fmt::Display for BotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BotStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "running" => Ok(BotStatus::Running),
            "stopped" => Ok(BotStatus::Stopped),
            "crashed" => Ok(BotStatus::Crashed),
            other => Err(format!("unknown bot status {other:?}")),
        }
    }
}

/// Tenant as seen by callers; never carries the token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tenant {
    pub tenant_id: String,
    pub schema_name: String,
    pub display_name: String,
    pub owner_id: String,
    pub bot_status: BotStatus,
    pub version: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewTenant {
    pub tenant_id: String,
    pub display_name: String,
    pub bot_token: String,
}

/// Outcome of a legacy re-encryption sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReencryptReport {
    pub scanned: usize,
    /// Rows rewritten and audited.
    pub rotated: usize,
    /// Rows whose token changed between scan and update; left alone.
    pub skipped: usize,
    pub failed: usize,
    pub chunks: usize,
}

/// Legacy tokens found by [`Platform::scan_legacy_tokens`], re-encrypted in
/// memory and not yet stored.
#[derive(Default)]
pub struct LegacySweep {
    scanned: usize,
    failed: usize,
    pending: Vec<PendingToken>,
}

impl LegacySweep {
    pub fn scanned(&self) -> usize {
        self.scanned
    }

    pub fn failed(&self) -> usize {
        self.failed
    }

    /// Tenants whose token will be rewritten, in scan order.
    pub fn tenant_ids(&self) -> impl Iterator<Item = &str> {
        self.pending.iter().map(|token| token.tenant_id.as_str())
    }
}

#[derive(Clone)]
struct PendingToken {
    tenant_id: String,
    scanned: String,
    fresh: String,
}

#[derive(sqlx::FromRow)]
struct DbTenant {
    tenant_id: String,
    schema_name: String,
    display_name: String,
    owner_id: String,
    bot_status: String,
    version: i64,
    created_at: DateTime<Utc>,
}

fn tenant_from_db(row: DbTenant) -> PlatformResult<Tenant> {
    Ok(Tenant {
        bot_status: row
            .bot_status
            .parse()
            .map_err(PlatformError::InvalidInput)?,
        tenant_id: row.tenant_id,
        schema_name: row.schema_name,
        display_name: row.display_name,
        owner_id: row.owner_id,
        version: row.version,
        created_at: row.created_at,
    })
}

fn tenant_not_found(tenant_id: &str) -> PlatformError {
    PlatformError::NotFound {
        entity: "tenant".into(),
        id: tenant_id.to_string(),
    }
}

fn validate_display_name(name: &str) -> PlatformResult<()> {
    let trimmed = name.trim();
    if trimmed.is_empty() || trimmed.chars().count() > 100 {
        return Err(PlatformError::InvalidInput(
            "Display names must be 1-100 characters.".into(),
        ));
    }
    Ok(())
}

impl Platform {
    pub async fn get_tenant(&self, tenant_id: &str) -> PlatformResult<Tenant> {
        let row = sqlx::query_as::<_, DbTenant>(
            r#"SELECT tenant_id, schema_name, display_name, owner_id, bot_status, version, created_at
               FROM tenants WHERE tenant_id = $1"#,
        )
        .bind(tenant_id)
        .fetch_optional(self.pool())
        .await?;
        row.map(tenant_from_db)
            .unwrap_or_else(|| Err(tenant_not_found(tenant_id)))
    }

    /// Register a tenant, store its encrypted token, and create its namespace.
    ///
    /// # Errors
    /// - [`PlatformError::RateLimited`] past the create-tenant policy.
    /// - [`PlatformError::Ident`] for an unusable tenant id.
    /// - [`PlatformError::Consistency`] with `AlreadyExists` when the tenant
    ///   (or another id sanitizing to the same namespace) exists.
    /// - [`PlatformError::Schema`] when the namespace cannot be brought to
    ///   `Ready`; the tenant row stays and `migrate` can finish the job.
    pub async fn provision_tenant(&self, actor: &Actor, request: NewTenant) -> PlatformResult<(Tenant, TenantNamespace)> {
        let schema_name = ident::tenant_schema_name(&request.tenant_id)?;
        validate_display_name(&request.display_name)?;
        self.enforce(RateLimitPolicy::CreateTenant, actor, &request.tenant_id)
            .await?;
        let encrypted = self.crypto.encrypt(&request.bot_token)?;

        let guard = UniqueGuard::new("tenant", TableRef::new(TENANTS_TABLE), DuplicatePolicy::Reject)
            .key("schema_name", schema_name.clone());
        let extra = vec![
            ("tenant_id".to_string(), SqlValue::from(request.tenant_id.clone())),
            ("display_name".to_string(), SqlValue::from(request.display_name.trim())),
            ("owner_id".to_string(), SqlValue::from(actor.user_id.clone())),
            ("encrypted_token".to_string(), SqlValue::from(encrypted)),
        ];
        run_in_transaction(self.pool(), self.retry_policy(), |_| {}, |conn| {
            let guard = guard.clone();
            let extra = extra.clone();
            Box::pin(async move { guard.insert(conn, &extra).await })
        })
        .await?;

        let namespace = match self.schemas().create_namespace(&request.tenant_id).await {
            Ok(namespace) => namespace,
            Err(err) => {
                tracing::error!(
                    tenant_id = %request.tenant_id,
                    error = %err,
                    "tenant registered but namespace not ready"
                );
                return Err(err.into());
            }
        };

        self.audit()
            .append(actor.event(AuditAction::TenantCreated, &request.tenant_id).with_metadata(json!({
                "schema": namespace.schema,
                "structureVersion": namespace.structure_version,
            })))
            .await;
        tracing::info!(tenant_id = %request.tenant_id, schema = %namespace.schema, "tenant provisioned");

        let tenant = self.get_tenant(&request.tenant_id).await?;
        Ok((tenant, namespace))
    }

    /// Replace the bot token if the tenant row is still at `expected_version`.
    ///
    /// Returns the new row version.
    ///
    /// # Errors
    /// - [`PlatformError::Consistency`] with `OptimisticLock` when another
    ///   rotation or update won; reload and retry.
    pub async fn rotate_bot_token(
        &self,
        actor: &Actor,
        tenant_id: &str,
        new_token: &str,
        expected_version: i64,
    ) -> PlatformResult<i64> {
        ident::tenant_schema_name(tenant_id)?;
        self.enforce(RateLimitPolicy::UpdateCredentials, actor, tenant_id)
            .await?;
        let encrypted = self.crypto.encrypt(new_token)?;

        let row = VersionedRow::new("tenant", TableRef::new(TENANTS_TABLE), "tenant_id", tenant_id);
        let set = vec![("encrypted_token".to_string(), SqlValue::from(encrypted))];
        let version = run_in_transaction(self.pool(), self.retry_policy(), |_| {}, |conn| {
            let row = row.clone();
            let set = set.clone();
            Box::pin(async move { row.update(conn, expected_version, &set).await })
        })
        .await
        .map_err(|err| match err {
            ConsistencyError::NotFound { .. } => tenant_not_found(tenant_id),
            other => other.into(),
        })?;

        self.audit()
            .append(actor.event(AuditAction::TokenRotated, tenant_id).with_metadata(json!({
                "version": version,
            })))
            .await;
        Ok(version)
    }

    /// Decrypt the bot token for immediate use. Callers must not log it.
    ///
    /// # Errors
    /// - [`PlatformError::Crypto`] with `AuthenticationFailed` when the
    ///   stored envelope was tampered with or encrypted under another key.
    ///   An `integrity_violation` audit record is written first.
    pub async fn reveal_bot_token(&self, actor: &Actor, tenant_id: &str) -> PlatformResult<String> {
        let envelope: Option<String> =
            sqlx::query_scalar("SELECT encrypted_token FROM tenants WHERE tenant_id = $1")
                .bind(tenant_id)
                .fetch_optional(self.pool())
                .await?;
        let envelope = envelope.ok_or_else(|| tenant_not_found(tenant_id))?;

        match self.crypto.decrypt(&envelope) {
            Ok(token) => {
                self.audit()
                    .append(actor.event(AuditAction::CredentialsAccessed, tenant_id).with_metadata(json!({
                        "legacyFormat": crypto::is_legacy_encryption(&envelope),
                    })))
                    .await;
                Ok(token)
            }
            Err(CryptoError::AuthenticationFailed) => {
                tracing::error!(tenant_id, "stored bot token failed authentication");
                self.audit()
                    .append(actor.event(AuditAction::IntegrityViolation, tenant_id).with_metadata(json!({
                        "field": "encrypted_token",
                    })))
                    .await;
                Err(CryptoError::AuthenticationFailed.into())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Record a bot process transition and return the previous status.
    pub async fn set_bot_status(&self, actor: &Actor, tenant_id: &str, status: BotStatus) -> PlatformResult<BotStatus> {
        ident::tenant_schema_name(tenant_id)?;
        self.enforce(RateLimitPolicy::OperateBot, actor, tenant_id).await?;

        let id = tenant_id.to_string();
        let previous = run_in_transaction(self.pool(), self.retry_policy(), |_| {}, |conn| {
            Box::pin(swap_bot_status(conn, id.clone(), status))
        })
        .await?
        .ok_or_else(|| tenant_not_found(tenant_id))?;
        let previous: BotStatus = previous.parse().map_err(PlatformError::InvalidInput)?;

        self.audit()
            .append(actor.event(status.transition_action(previous), tenant_id).with_metadata(json!({
                "from": previous,
                "to": status,
            })))
            .await;
        Ok(previous)
    }

    /// Drop the tenant's namespace and registration.
    ///
    /// # Errors
    /// - [`PlatformError::Schema`] with `ConfirmationRequired` unless
    ///   `confirmation` is exactly `DELETE_TENANT_<tenantId>`; nothing is
    ///   touched in that case.
    pub async fn destroy_tenant(&self, actor: &Actor, tenant_id: &str, confirmation: &str) -> PlatformResult<()> {
        self.schemas()
            .destroy_namespace(tenant_id, confirmation)
            .await?;
        let deleted = sqlx::query("DELETE FROM tenants WHERE tenant_id = $1")
            .bind(tenant_id)
            .execute(self.pool())
            .await?
            .rows_affected();

        self.audit()
            .append(actor.event(AuditAction::TenantDeleted, tenant_id).with_metadata(json!({
                "registrationRemoved": deleted > 0,
            })))
            .await;
        Ok(())
    }

    /// Bring every registered tenant's namespace to the latest structure.
    ///
    /// Stops at the first namespace that fails; the ones before it stay
    /// migrated.
    pub async fn migrate_tenant_namespaces(&self) -> PlatformResult<Vec<TenantNamespace>> {
        let tenant_ids: Vec<String> = sqlx::query_scalar("SELECT tenant_id FROM tenants ORDER BY tenant_id")
            .fetch_all(self.pool())
            .await?;
        let mut migrated = Vec::with_capacity(tenant_ids.len());
        for tenant_id in tenant_ids {
            let namespace = self.schemas().migrate(&tenant_id).await?;
            tracing::info!(
                tenant_id = %tenant_id,
                structure_version = namespace.structure_version,
                "tenant namespace migrated"
            );
            migrated.push(namespace);
        }
        Ok(migrated)
    }

    /// Re-encrypt every stored token that is in a legacy envelope.
    ///
    /// Equivalent to [`Platform::scan_legacy_tokens`] followed by
    /// [`Platform::apply_legacy_sweep`].
    pub async fn reencrypt_legacy_tokens(&self, actor: &Actor, chunk_size: usize) -> PlatformResult<ReencryptReport> {
        let sweep = self.scan_legacy_tokens(actor).await?;
        self.apply_legacy_sweep(actor, sweep, chunk_size).await
    }

    /// Find legacy tokens and re-encrypt them in memory without writing.
    ///
    /// Tokens that fail to decrypt are counted in `failed`, and tampered ones
    /// are audited as integrity violations.
    pub async fn scan_legacy_tokens(&self, actor: &Actor) -> PlatformResult<LegacySweep> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT tenant_id, encrypted_token FROM tenants ORDER BY tenant_id")
                .fetch_all(self.pool())
                .await?;

        let mut sweep = LegacySweep {
            scanned: rows.len(),
            ..LegacySweep::default()
        };
        for (tenant_id, envelope) in rows {
            if !crypto::needs_rotation(&envelope) {
                continue;
            }
            match self.crypto.reencrypt(&envelope) {
                Ok(fresh) => sweep.pending.push(PendingToken {
                    tenant_id,
                    scanned: envelope,
                    fresh,
                }),
                Err(err) => {
                    sweep.failed += 1;
                    tracing::warn!(tenant_id = %tenant_id, error = %err, "legacy token not re-encrypted");
                    if err == CryptoError::AuthenticationFailed {
                        self.audit()
                            .append(actor.event(AuditAction::IntegrityViolation, &tenant_id))
                            .await;
                    }
                }
            }
        }
        Ok(sweep)
    }

    /// Store the tokens of `sweep`, `chunk_size` rows per transaction.
    ///
    /// A row whose token changed since the scan is left alone and counted in
    /// `skipped`. Every rewritten row is audited, including those of chunks
    /// committed before a failing one.
    ///
    /// # Errors
    /// - [`PlatformError::Consistency`] from the first chunk that fails after
    ///   retries; earlier chunks stay committed.
    pub async fn apply_legacy_sweep(
        &self,
        actor: &Actor,
        sweep: LegacySweep,
        chunk_size: usize,
    ) -> PlatformResult<ReencryptReport> {
        let outcome = chunked_update(self.pool(), self.retry_policy(), sweep.pending, chunk_size, |conn, token| {
            Box::pin(replace_token(conn, token))
        })
        .await;
        let (completed, error) = match outcome {
            Ok(completed) => (completed, None),
            Err(failure) => (failure.completed, Some(failure.error)),
        };

        let report = ReencryptReport {
            scanned: sweep.scanned,
            rotated: completed.applied.len(),
            skipped: completed.rows - completed.applied.len(),
            failed: sweep.failed,
            chunks: completed.chunks,
        };
        for tenant_id in &completed.applied {
            self.audit()
                .append(actor.event(AuditAction::CredentialsReencrypted, tenant_id))
                .await;
        }

        if let Some(error) = error {
            tracing::warn!(rotated = report.rotated, error = %error, "legacy token sweep stopped");
            return Err(PlatformError::Consistency(error));
        }
        tracing::info!(
            scanned = report.scanned,
            rotated = report.rotated,
            skipped = report.skipped,
            failed = report.failed,
            "legacy token sweep finished"
        );
        Ok(report)
    }
}

async fn swap_bot_status(conn: &mut PgConnection, tenant_id: String, status: BotStatus) -> ConsistencyResult<Option<String>> {
    let previous: Option<String> =
        sqlx::query_scalar("SELECT bot_status FROM tenants WHERE tenant_id = $1 FOR UPDATE")
            .bind(&tenant_id)
            .fetch_optional(&mut *conn)
            .await?;
    if previous.is_some() {
        sqlx::query("UPDATE tenants SET bot_status = $1, updated_at = now() WHERE tenant_id = $2")
            .bind(status.as_str())
            .bind(&tenant_id)
            .execute(&mut *conn)
            .await?;
    }
    Ok(previous)
}

/// Compare-and-set on the scanned envelope; `Some(tenant_id)` when written.
async fn replace_token(conn: &mut PgConnection, token: PendingToken) -> ConsistencyResult<Option<String>> {
    let result = sqlx::query(
        r#"UPDATE tenants SET encrypted_token = $1, version = version + 1, updated_at = now()
           WHERE tenant_id = $2 AND encrypted_token = $3"#,
    )
    .bind(&token.fresh)
    .bind(&token.tenant_id)
    .bind(&token.scanned)
    .execute(&mut *conn)
    .await?;
    if result.rows_affected() == 1 {
        Ok(Some(token.tenant_id))
    } else {
        tracing::debug!(tenant_id = %token.tenant_id, "token changed since scan; left alone");
        Ok(None)
    }
}
