//! Bounded retry with exponential backoff, and the transaction runner built
//! on it.
//!
//! # Key invariants
//! - At most `max_attempts` executions; the last error is returned unchanged.
//! - Only errors that report [`Retryable::is_transient`] are retried, plus
//!   [`Retryable::is_conflict`] when the policy opts in.
//! - Delay before retry `n` (zero-based) is `min(base * multiplier^n, max_delay)`.
use futures::future::BoxFuture;
use sqlx::{PgConnection, PgPool};
use std::future::Future;
use std::time::Duration;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(50);
pub const DEFAULT_MULTIPLIER: f64 = 2.0;
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(2);

/// Error classification consulted by the retry loop.
pub trait Retryable {
    /// Deadlocks, serialization failures, lost insert races.
    fn is_transient(&self) -> bool;

    /// Optimistic-lock conflicts. Only retried when the policy opts in.
    fn is_conflict(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub retry_optimistic_conflicts: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            multiplier: DEFAULT_MULTIPLIER,
            max_delay: DEFAULT_MAX_DELAY,
            retry_optimistic_conflicts: false,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            ..Self::default()
        }
    }

    /// Same policy, additionally retrying optimistic-lock conflicts.
    pub fn retrying_conflicts(mut self) -> Self {
        self.retry_optimistic_conflicts = true;
        self
    }

    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(retry.min(32) as i32);
        let micros = (self.base_delay.as_micros() as f64 * factor).min(self.max_delay.as_micros() as f64);
        Duration::from_micros(micros.round() as u64)
    }

    pub fn should_retry<E: Retryable>(&self, err: &E) -> bool {
        err.is_transient() || (self.retry_optimistic_conflicts && err.is_conflict())
    }

    /// Delay before the next attempt, or `None` when `err` after `attempt`
    /// (one-based) must be returned.
    pub fn backoff_after<E: Retryable>(&self, attempt: u32, err: &E) -> Option<Duration> {
        if attempt >= self.max_attempts.max(1) || !self.should_retry(err) {
            return None;
        }
        Some(self.delay_for(attempt - 1))
    }
}

/// Passed to the caller's retry observer before each backoff sleep.
#[derive(Debug)]
pub struct RetryEvent<'a, E> {
    /// Attempt that just failed, one-based.
    pub attempt: u32,
    pub delay: Duration,
    pub error: &'a E,
}

fn record_retry<E: std::fmt::Display>(attempt: u32, delay: Duration, err: &E) {
    metrics::counter!("fleetcore_tx_retries_total").increment(1);
    tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying after transient failure");
}

/// Run `op` until it succeeds, fails permanently, or attempts run out.
///
/// `op` receives the one-based attempt number.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    mut on_retry: impl FnMut(&RetryEvent<'_, E>),
    mut op: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + std::fmt::Display,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let Some(delay) = policy.backoff_after(attempt, &err) else {
                    return Err(err);
                };
                record_retry(attempt, delay, &err);
                on_retry(&RetryEvent {
                    attempt,
                    delay,
                    error: &err,
                });
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Run `work` in a READ COMMITTED transaction, retrying the whole
/// transaction on transient failures.
///
/// `work` may run more than once, so it must not carry side effects outside
/// the transaction. Anything it captures must be owned by the returned
/// future (clone before `Box::pin(async move { .. })`).
///
/// # Errors
/// - Whatever `work` returns, or begin/commit failures converted through
///   `From<sqlx::Error>`, once attempts are exhausted or the error is not
///   retryable.
///
/// # Example
/// ```rust,no_run
/// use fleetcore::consistency::{ConsistencyError, RetryPolicy, run_in_transaction};
///
/// async fn read_one(conn: &mut sqlx::PgConnection) -> Result<i64, ConsistencyError> {
///     Ok(sqlx::query_scalar("SELECT 1::BIGINT").fetch_one(conn).await?)
/// }
///
/// async fn run(pool: &sqlx::PgPool) -> Result<i64, ConsistencyError> {
///     run_in_transaction(pool, &RetryPolicy::default(), |_| {}, |conn| {
///         Box::pin(read_one(conn))
///     })
///     .await
/// }
/// ```
pub async fn run_in_transaction<T, E, F>(
    pool: &PgPool,
    policy: &RetryPolicy,
    mut on_retry: impl FnMut(&RetryEvent<'_, E>),
    mut work: F,
) -> Result<T, E>
where
    F: for<'c> FnMut(&'c mut PgConnection) -> BoxFuture<'c, Result<T, E>>,
    E: From<sqlx::Error> + Retryable + std::fmt::Display,
{
    let mut attempt = 1;
    loop {
        match attempt_transaction(pool, &mut work).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let Some(delay) = policy.backoff_after(attempt, &err) else {
                    return Err(err);
                };
                record_retry(attempt, delay, &err);
                on_retry(&RetryEvent {
                    attempt,
                    delay,
                    error: &err,
                });
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

async fn attempt_transaction<T, E, F>(pool: &PgPool, work: &mut F) -> Result<T, E>
where
    F: for<'c> FnMut(&'c mut PgConnection) -> BoxFuture<'c, Result<T, E>>,
    E: From<sqlx::Error>,
{
    let mut tx = pool.begin().await?;
    sqlx::query("SET TRANSACTION ISOLATION LEVEL READ COMMITTED")
        .execute(&mut *tx)
        .await?;
    let value = work(&mut *tx).await?;
    tx.commit().await?;
    Ok(value)
}
