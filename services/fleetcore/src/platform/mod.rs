//! Tenant operations composed from the core components.
//!
//! # Purpose
//! [`Platform`] is what request handlers and jobs call. Each operation
//! validates identifiers, applies the relevant rate-limit policy, does its
//! writes through the consistency helpers, and appends an audit record
//! after the primary write commits.
//!
//! # Key invariants
//! - Bot tokens are encrypted before they reach a statement and decrypted
//!   only in [`Platform::reveal_bot_token`]. Neither form is logged.
//! - Audit appends are best effort and never fail the operation.
//! - Crypto runs outside transactions so retries never re-encrypt.
//!
//! # Construction
//! Built once at process start and shared by reference. Every dependency is
//! injected; tests build their own instance.
pub mod error;
pub mod giveaways;
pub mod settings;
pub mod tenants;
pub mod tickets;

pub use error::{PlatformError, PlatformResult};

use crate::audit::postgres::PostgresAuditSink;
use crate::audit::{AuditAction, AuditEvent, AuditLog};
use crate::consistency::RetryPolicy;
use crate::crypto::EncryptionService;
use crate::ratelimit::memory::InMemoryCounterStore;
use crate::ratelimit::policy::RateLimitPolicy;
use crate::ratelimit::RateLimiter;
use crate::schema::SchemaManager;
use crate::schema::postgres::PostgresSchemaBackend;
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;

/// Who is performing an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub user_id: String,
    pub ip_address: Option<String>,
}

impl Actor {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ip_address: None,
        }
    }

    pub fn with_ip(mut self, ip_address: impl Into<String>) -> Self {
        self.ip_address = Some(ip_address.into());
        self
    }

    pub(crate) fn event(&self, action: AuditAction, tenant_id: &str) -> AuditEvent {
        let event = AuditEvent::new(action, tenant_id, self.user_id.clone());
        match &self.ip_address {
            Some(ip) => event.with_ip(ip.clone()),
            None => event,
        }
    }
}

#[derive(Clone)]
pub struct Platform {
    pool: PgPool,
    crypto: Arc<EncryptionService>,
    schemas: SchemaManager,
    limiter: RateLimiter,
    audit: AuditLog,
    retry: RetryPolicy,
}

impl Platform {
    /// Postgres-backed schemas and audit, in-process rate limiting, default
    /// retry policy. Swap parts with the `with_*` methods.
    pub fn new(pool: PgPool, crypto: Arc<EncryptionService>) -> Self {
        Self {
            schemas: SchemaManager::new(Arc::new(PostgresSchemaBackend::new(pool.clone()))),
            limiter: RateLimiter::new(Arc::new(InMemoryCounterStore::new())),
            audit: AuditLog::new(Arc::new(PostgresAuditSink::new(pool.clone()))),
            retry: RetryPolicy::default(),
            pool,
            crypto,
        }
    }

    pub fn with_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_schemas(mut self, schemas: SchemaManager) -> Self {
        self.schemas = schemas;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn schemas(&self) -> &SchemaManager {
        &self.schemas
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Consume one unit of `policy` for the actor; deny with an audit record.
    async fn enforce(&self, policy: RateLimitPolicy, actor: &Actor, tenant_id: &str) -> PlatformResult<()> {
        let decision = self.limiter.check_policy(policy, &actor.user_id).await?;
        if decision.allowed {
            return Ok(());
        }
        let retry_after_secs = decision.retry_after_secs().unwrap_or(1);
        self.audit
            .append(actor.event(AuditAction::RateLimitExceeded, tenant_id).with_metadata(json!({
                "action": policy.action(),
                "limit": decision.limit,
                "retryAfterSecs": retry_after_secs,
            })))
            .await;
        Err(PlatformError::RateLimited {
            action: policy.action().to_string(),
            retry_after_secs,
        })
    }
}
