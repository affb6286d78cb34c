//! Fixed-window rate limiting over a shared counter store.
//!
//! # Purpose
//! Answers "may this subject perform this action now?" and consumes one unit
//! of the bucket in the same step.
//!
//! # Key invariants
//! - Bucket keys are `ratelimit:<action>:<subject>` and both segments pass
//!   [`crate::ident::validate_key_segment`] before reaching the store.
//! - `allowed = count <= limit`, `remaining = max(0, limit - count)`.
//! - The counter resets only when its window expires or on [`RateLimiter::reset`].
//!
//! # Failure policy
//! Store errors and timeouts never surface to the caller. Under
//! [`FailMode::Open`] (the default) the request is allowed with full
//! `remaining`; under [`FailMode::Closed`] it is denied. Either way the
//! decision is marked `degraded` and a store-error counter is bumped. Under
//! fail-open, limits are best effort during a store outage.
pub mod memory;
pub mod policy;
pub mod redis;

use crate::ident::{IdentError, IdentResult, validate_key_segment};
use async_trait::async_trait;
use chrono::Utc;
use policy::RateLimitPolicy;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub const KEY_PREFIX: &str = "ratelimit";
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum CounterError {
    #[error("counter store unavailable: {0}")]
    Unavailable(String),
    #[error("counter store timed out after {0:?}")]
    Timeout(Duration),
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

pub type CounterResult<T> = Result<T, CounterError>;

/// Bucket state right after an increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterState {
    pub count: u64,
    /// Remaining lifetime of the window, if the store could report it.
    pub ttl: Option<Duration>,
}

/// Storage for fixed-window counters.
///
/// `increment` must be atomic per key and must set the expiry to `window`
/// on the first hit of a window.
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn increment(&self, key: &str, window: Duration) -> CounterResult<CounterState>;
    async fn reset(&self, key: &str) -> CounterResult<()>;
    fn backend_name(&self) -> &'static str;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    action: String,
    key: String,
}

impl RateLimitKey {
    /// Build `ratelimit:<action>:<subject>`.
    ///
    /// # Errors
    /// - [`crate::ident::IdentError::InvalidIdentifier`] when either segment
    ///   is empty, too long, or outside `[A-Za-z0-9_.:-]`, or when `action`
    ///   contains `:`. The subject may contain `:`; the first separator after
    ///   the prefix always ends the action.
    pub fn new(action: &str, subject: &str) -> IdentResult<Self> {
        validate_key_segment(action)?;
        if action.contains(':') {
            return Err(IdentError::InvalidIdentifier(action.to_string()));
        }
        validate_key_segment(subject)?;
        Ok(Self {
            action: action.to_string(),
            key: format!("{KEY_PREFIX}:{action}:{subject}"),
        })
    }

    pub fn for_policy(policy: RateLimitPolicy, subject: &str) -> IdentResult<Self> {
        Self::new(policy.action(), subject)
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailMode {
    #[default]
    Open,
    Closed,
}

impl FromStr for FailMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "open" => Ok(FailMode::Open),
            "closed" => Ok(FailMode::Closed),
            other => Err(format!("unknown rate limit fail mode {other:?}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    /// Unix timestamp (seconds) at which the window resets.
    pub reset_at: i64,
    pub limit: u32,
    /// Time until the window resets.
    pub reset_after: Duration,
    /// True when the store failed and the fail mode decided.
    pub degraded: bool,
}

impl RateLimitDecision {
    /// `X-RateLimit-*` headers for the API layer.
    pub fn headers(&self) -> [(&'static str, String); 3] {
        [
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", self.reset_at.to_string()),
        ]
    }

    /// Whole seconds a denied caller should wait, rounded up.
    pub fn retry_after_secs(&self) -> Option<u64> {
        if self.allowed {
            return None;
        }
        let secs = self.reset_after.as_secs() + u64::from(self.reset_after.subsec_nanos() > 0);
        Some(secs.max(1))
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    fail_mode: FailMode,
    timeout: Duration,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self {
            store,
            fail_mode: FailMode::default(),
            timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    pub fn with_fail_mode(mut self, fail_mode: FailMode) -> Self {
        self.fail_mode = fail_mode;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn fail_mode(&self) -> FailMode {
        self.fail_mode
    }

    pub fn backend_name(&self) -> &'static str {
        self.store.backend_name()
    }

    /// Consume one unit of `key` and decide.
    ///
    /// A zero `window` is treated as one second.
    pub async fn check_and_consume(
        &self,
        key: &RateLimitKey,
        limit: u32,
        window: Duration,
    ) -> RateLimitDecision {
        let window = window.max(Duration::from_secs(1));
        let outcome = tokio::time::timeout(self.timeout, self.store.increment(key.as_str(), window))
            .await
            .unwrap_or(Err(CounterError::Timeout(self.timeout)));

        match outcome {
            Ok(state) => {
                let reset_after = state.ttl.unwrap_or(window);
                let allowed = state.count <= u64::from(limit);
                let remaining = u64::from(limit).saturating_sub(state.count) as u32;
                if !allowed {
                    metrics::counter!("fleetcore_ratelimit_denied_total", "action" => key.action().to_string())
                        .increment(1);
                    tracing::debug!(key = %key, count = state.count, limit, "rate limit exceeded");
                }
                decision(allowed, remaining, limit, reset_after, false)
            }
            Err(err) => {
                metrics::counter!("fleetcore_ratelimit_store_errors_total", "backend" => self.store.backend_name())
                    .increment(1);
                tracing::warn!(
                    key = %key,
                    error = %err,
                    fail_mode = ?self.fail_mode,
                    "rate limit store unavailable"
                );
                match self.fail_mode {
                    FailMode::Open => decision(true, limit, limit, window, true),
                    FailMode::Closed => decision(false, 0, limit, window, true),
                }
            }
        }
    }

    /// Apply a pre-defined policy to `subject`.
    ///
    /// # Errors
    /// - [`crate::ident::IdentError::InvalidIdentifier`] for an unusable
    ///   subject; nothing is consumed.
    pub async fn check_policy(
        &self,
        policy: RateLimitPolicy,
        subject: &str,
    ) -> IdentResult<RateLimitDecision> {
        let key = RateLimitKey::for_policy(policy, subject)?;
        Ok(self
            .check_and_consume(&key, policy.limit(), policy.window())
            .await)
    }

    /// Clear a bucket unconditionally.
    pub async fn reset(&self, key: &RateLimitKey) -> CounterResult<()> {
        tokio::time::timeout(self.timeout, self.store.reset(key.as_str()))
            .await
            .unwrap_or(Err(CounterError::Timeout(self.timeout)))?;
        tracing::info!(key = %key, "rate limit bucket reset");
        Ok(())
    }
}

fn decision(
    allowed: bool,
    remaining: u32,
    limit: u32,
    reset_after: Duration,
    degraded: bool,
) -> RateLimitDecision {
    let reset_at = Utc::now().timestamp() + reset_after.as_secs() as i64;
    RateLimitDecision {
        allowed,
        remaining,
        reset_at,
        limit,
        reset_after,
        degraded,
    }
}
