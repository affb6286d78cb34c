//! Per-tenant bot settings under optimistic locking.
//!
//! [`Platform::update_settings`] surfaces a stale write to the caller so a
//! dashboard can show "someone else changed this". Background jobs use
//! [`Platform::update_settings_with_retry`], which re-reads and re-applies
//! its change on conflict.
use super::{Actor, Platform, PlatformError, PlatformResult};
use crate::audit::AuditAction;
use crate::consistency::optimistic::VersionedRow;
use crate::consistency::{ConsistencyError, SqlValue, retry_with_backoff, run_in_transaction};
use crate::ident::TableRef;
use crate::ratelimit::policy::RateLimitPolicy;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub const SETTINGS_ROW_ID: &str = "default";
pub const MAX_PREFIX_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct TenantSettings {
    pub command_prefix: String,
    pub locale: String,
    pub data: sqlx::types::Json<Value>,
    pub version: i64,
}

/// Fields to change; `None` leaves a field as it is.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SettingsUpdate {
    pub command_prefix: Option<String>,
    pub locale: Option<String>,
    pub data: Option<Value>,
}

impl SettingsUpdate {
    pub fn is_empty(&self) -> bool {
        self.command_prefix.is_none() && self.locale.is_none() && self.data.is_none()
    }

    fn validate(&self) -> PlatformResult<()> {
        if let Some(prefix) = &self.command_prefix {
            let len = prefix.chars().count();
            if len == 0 || len > MAX_PREFIX_LEN || prefix.chars().any(char::is_whitespace) {
                return Err(PlatformError::InvalidInput(format!(
                    "Command prefixes must be 1-{MAX_PREFIX_LEN} characters without spaces."
                )));
            }
        }
        if let Some(locale) = &self.locale {
            let valid = (2..=10).contains(&locale.len())
                && locale.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
            if !valid {
                return Err(PlatformError::InvalidInput("Unknown locale.".into()));
            }
        }
        if let Some(data) = &self.data {
            if !data.is_object() {
                return Err(PlatformError::InvalidInput(
                    "Settings data must be a JSON object.".into(),
                ));
            }
        }
        Ok(())
    }

    fn columns(&self) -> Vec<(String, SqlValue)> {
        let mut columns = Vec::new();
        if let Some(prefix) = &self.command_prefix {
            columns.push(("command_prefix".to_string(), SqlValue::from(prefix.clone())));
        }
        if let Some(locale) = &self.locale {
            columns.push(("locale".to_string(), SqlValue::from(locale.clone())));
        }
        if let Some(data) = &self.data {
            columns.push(("data".to_string(), SqlValue::Json(data.clone())));
        }
        columns
    }

    /// Changed field names, for audit metadata.
    fn changed_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.command_prefix.is_some() {
            fields.push("commandPrefix");
        }
        if self.locale.is_some() {
            fields.push("locale");
        }
        if self.data.is_some() {
            fields.push("data");
        }
        fields
    }
}

impl Platform {
    pub async fn get_settings(&self, tenant_id: &str) -> PlatformResult<TenantSettings> {
        let table = TableRef::in_tenant(tenant_id, "settings")?.qualified()?;
        sqlx::query_as::<_, TenantSettings>(&format!(
            "SELECT command_prefix, locale, data, version FROM {table} WHERE id = $1"
        ))
        .bind(SETTINGS_ROW_ID)
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| PlatformError::NotFound {
            entity: "settings".into(),
            id: tenant_id.to_string(),
        })
    }

    /// Apply `update` if the settings are still at `expected_version`.
    ///
    /// # Errors
    /// - [`PlatformError::Consistency`] with `OptimisticLock` (carrying both
    ///   versions) when the settings changed since they were read.
    pub async fn update_settings(
        &self,
        actor: &Actor,
        tenant_id: &str,
        update: SettingsUpdate,
        expected_version: i64,
    ) -> PlatformResult<TenantSettings> {
        update.validate()?;
        self.enforce(RateLimitPolicy::AccessApi, actor, tenant_id).await?;
        self.write_settings(actor, tenant_id, &update, expected_version).await
    }

    /// Read the current settings, derive an update with `change`, and write
    /// it; on a version conflict start over from a fresh read.
    ///
    /// `change` may run several times.
    pub async fn update_settings_with_retry<F>(
        &self,
        actor: &Actor,
        tenant_id: &str,
        change: F,
    ) -> PlatformResult<TenantSettings>
    where
        F: Fn(&TenantSettings) -> SettingsUpdate,
    {
        self.enforce(RateLimitPolicy::AccessApi, actor, tenant_id).await?;
        let policy = self.retry_policy().clone().retrying_conflicts();
        let change = &change;
        retry_with_backoff(
            &policy,
            |event| {
                tracing::debug!(tenant_id, attempt = event.attempt, "settings update conflicted; re-reading");
            },
            |_| async move {
                let current = self.get_settings(tenant_id).await?;
                let update = change(&current);
                update.validate()?;
                self.write_settings(actor, tenant_id, &update, current.version).await
            },
        )
        .await
    }

    async fn write_settings(
        &self,
        actor: &Actor,
        tenant_id: &str,
        update: &SettingsUpdate,
        expected_version: i64,
    ) -> PlatformResult<TenantSettings> {
        let row = VersionedRow::new(
            "settings",
            TableRef::in_tenant(tenant_id, "settings")?,
            "id",
            SETTINGS_ROW_ID,
        );
        let columns = update.columns();
        let version = run_in_transaction(self.pool(), self.retry_policy(), |_| {}, |conn| {
            let row = row.clone();
            let columns = columns.clone();
            Box::pin(async move { row.update(conn, expected_version, &columns).await })
        })
        .await
        .map_err(|err| match err {
            ConsistencyError::NotFound { .. } => PlatformError::NotFound {
                entity: "settings".into(),
                id: tenant_id.to_string(),
            },
            other => other.into(),
        })?;

        self.audit()
            .append(actor.event(AuditAction::SettingsUpdated, tenant_id).with_metadata(json!({
                "fields": update.changed_fields(),
                "version": version,
            })))
            .await;
        self.get_settings(tenant_id).await
    }
}
