//! Append-only audit trail of security-relevant actions.
//!
//! # Purpose
//! Records tenant lifecycle transitions, bot process transitions, credential
//! access and rotation, rate-limit trips, and privileged admin actions.
//!
//! # Key invariants
//! - Records are never updated or deleted here; retention is external.
//! - [`AuditLog::append`] is best effort: a sink failure is logged and
//!   counted, never returned to the operation being audited.
//! - Queries return newest first, ties broken by insertion order.
//!
//! # Security model
//! Metadata is free-form JSON written by call sites in this crate. It must
//! never carry plaintext secrets or envelopes.
pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

pub const DEFAULT_QUERY_LIMIT: u32 = 50;
pub const MAX_QUERY_LIMIT: u32 = 500;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit sink unavailable: {0}")]
    Unavailable(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type AuditResult<T> = Result<T, AuditError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditCategory {
    TenantLifecycle,
    BotLifecycle,
    Security,
    RateLimit,
    Admin,
}

/// Actions the platform itself records. The sink stores the string form and
/// accepts any other string too, see [`AuditEvent::custom`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    TenantCreated,
    TenantUpdated,
    TenantDeleted,
    TenantSuspended,
    SettingsUpdated,
    BotStarted,
    BotStopped,
    BotRestarted,
    BotCrashed,
    TokenRotated,
    TokenValidated,
    TokenInvalid,
    CredentialsAccessed,
    IntegrityViolation,
    RateLimitExceeded,
    AdminAccess,
    AdminOverride,
    CredentialsReencrypted,
}

impl AuditAction {
    pub const ALL: [AuditAction; 18] = [
        AuditAction::TenantCreated,
        AuditAction::TenantUpdated,
        AuditAction::TenantDeleted,
        AuditAction::TenantSuspended,
        AuditAction::SettingsUpdated,
        AuditAction::BotStarted,
        AuditAction::BotStopped,
        AuditAction::BotRestarted,
        AuditAction::BotCrashed,
        AuditAction::TokenRotated,
        AuditAction::TokenValidated,
        AuditAction::TokenInvalid,
        AuditAction::CredentialsAccessed,
        AuditAction::IntegrityViolation,
        AuditAction::RateLimitExceeded,
        AuditAction::AdminAccess,
        AuditAction::AdminOverride,
        AuditAction::CredentialsReencrypted,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AuditAction::TenantCreated => "tenant_created",
            AuditAction::TenantUpdated => "tenant_updated",
            AuditAction::TenantDeleted => "tenant_deleted",
            AuditAction::TenantSuspended => "tenant_suspended",
            AuditAction::SettingsUpdated => "settings_updated",
            AuditAction::BotStarted => "bot_started",
            AuditAction::BotStopped => "bot_stopped",
            AuditAction::BotRestarted => "bot_restarted",
            AuditAction::BotCrashed => "bot_crashed",
            AuditAction::TokenRotated => "token_rotated",
            AuditAction::TokenValidated => "token_validated",
            AuditAction::TokenInvalid => "token_invalid",
            AuditAction::CredentialsAccessed => "credentials_accessed",
            AuditAction::IntegrityViolation => "integrity_violation",
            AuditAction::RateLimitExceeded => "rate_limit_exceeded",
            AuditAction::AdminAccess => "admin_access",
            AuditAction::AdminOverride => "admin_override",
            AuditAction::CredentialsReencrypted => "credentials_reencrypted",
        }
    }

    pub fn category(self) -> AuditCategory {
        match self {
            AuditAction::TenantCreated
            | AuditAction::TenantUpdated
            | AuditAction::TenantDeleted
            | AuditAction::TenantSuspended
            | AuditAction::SettingsUpdated => AuditCategory::TenantLifecycle,
            AuditAction::BotStarted
            | AuditAction::BotStopped
            | AuditAction::BotRestarted
            | AuditAction::BotCrashed => AuditCategory::BotLifecycle,
            AuditAction::TokenRotated
            | AuditAction::TokenValidated
            | AuditAction::TokenInvalid
            | AuditAction::CredentialsAccessed
            | AuditAction::IntegrityViolation
            | AuditAction::CredentialsReencrypted => AuditCategory::Security,
            AuditAction::RateLimitExceeded => AuditCategory::RateLimit,
            AuditAction::AdminAccess | AuditAction::AdminOverride => AuditCategory::Admin,
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditAction {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        AuditAction::ALL
            .into_iter()
            .find(|action| action.as_str() == value)
            .ok_or_else(|| format!("unknown audit action {value:?}"))
    }
}

/// A record about to be appended.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEvent {
    pub action: String,
    pub tenant_id: String,
    pub user_id: String,
    pub metadata: Value,
    pub ip_address: Option<String>,
}

impl AuditEvent {
    pub fn new(action: AuditAction, tenant_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self::custom(action.as_str(), tenant_id, user_id)
    }

    /// Event with an action string outside [`AuditAction`].
    pub fn custom(
        action: impl Into<String>,
        tenant_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            action: action.into(),
            tenant_id: tenant_id.into(),
            user_id: user_id.into(),
            metadata: Value::Object(Default::default()),
            ip_address: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_ip(mut self, ip_address: impl Into<String>) -> Self {
        self.ip_address = Some(ip_address.into());
        self
    }
}

/// A persisted, immutable audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub id: i64,
    pub action: String,
    pub tenant_id: String,
    pub user_id: String,
    pub metadata: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl AuditRecord {
    /// Typed action, when the stored string is one this build knows.
    pub fn known_action(&self) -> Option<AuditAction> {
        self.action.parse().ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditQuery {
    pub limit: u32,
    pub offset: u32,
    pub action: Option<String>,
}

impl Default for AuditQuery {
    fn default() -> Self {
        Self {
            limit: DEFAULT_QUERY_LIMIT,
            offset: 0,
            action: None,
        }
    }
}

impl AuditQuery {
    pub fn with_action(mut self, action: AuditAction) -> Self {
        self.action = Some(action.as_str().to_string());
        self
    }

    /// Limit clamped to `1..=MAX_QUERY_LIMIT`.
    pub fn effective_limit(&self) -> u32 {
        self.limit.clamp(1, MAX_QUERY_LIMIT)
    }
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Store `event`. The sink stamps `timestamp` from its own clock so
    /// records written by many hosts order consistently.
    async fn insert(&self, event: AuditEvent) -> AuditResult<AuditRecord>;
    async fn query_by_tenant(&self, tenant_id: &str, query: &AuditQuery) -> AuditResult<Vec<AuditRecord>>;
    async fn query_by_user(&self, user_id: &str, query: &AuditQuery) -> AuditResult<Vec<AuditRecord>>;
    fn backend_name(&self) -> &'static str;
}

#[derive(Clone)]
pub struct AuditLog {
    sink: Arc<dyn AuditSink>,
}

impl AuditLog {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink }
    }

    /// Append `event`, swallowing sink failures.
    ///
    /// Returns the stored record, or `None` when the sink failed.
    pub async fn append(&self, event: AuditEvent) -> Option<AuditRecord> {
        let action = event.action.clone();
        let tenant_id = event.tenant_id.clone();
        match self.try_append(event).await {
            Ok(record) => Some(record),
            Err(err) => {
                metrics::counter!("fleetcore_audit_write_failures_total").increment(1);
                tracing::warn!(
                    action = %action,
                    tenant_id = %tenant_id,
                    backend = self.sink.backend_name(),
                    error = %err,
                    "audit record not persisted"
                );
                None
            }
        }
    }

    /// Append `event` and report sink failures to the caller.
    pub async fn try_append(&self, event: AuditEvent) -> AuditResult<AuditRecord> {
        self.sink.insert(event).await
    }

    pub async fn query_by_tenant(&self, tenant_id: &str, query: &AuditQuery) -> AuditResult<Vec<AuditRecord>> {
        self.sink.query_by_tenant(tenant_id, query).await
    }

    pub async fn query_by_user(&self, user_id: &str, query: &AuditQuery) -> AuditResult<Vec<AuditRecord>> {
        self.sink.query_by_user(user_id, query).await
    }

    pub fn backend_name(&self) -> &'static str {
        self.sink.backend_name()
    }
}
