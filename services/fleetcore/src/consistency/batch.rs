//! Bulk updates in bounded chunks.
//!
//! Each chunk runs in its own retried transaction. Processing stops at the
//! first chunk that still fails after retries; chunks before it stay
//! committed and are reported in [`BatchFailure::completed`].
//!
//! Work for one item returns `Some(output)` when it changed something and
//! `None` when it found nothing to do (for example a compare-and-set that
//! matched no row). Only outputs of committed chunks are reported.
use super::retry::{RetryPolicy, Retryable, run_in_transaction};
use futures::future::BoxFuture;
use sqlx::{PgConnection, PgPool};
use std::fmt;
use std::ops::Range;

pub const DEFAULT_CHUNK_SIZE: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport<O> {
    pub chunks: usize,
    /// Items processed in committed chunks, applied or not.
    pub rows: usize,
    /// Outputs of the items that changed something, in input order.
    pub applied: Vec<O>,
}

impl<O> Default for BatchReport<O> {
    fn default() -> Self {
        Self {
            chunks: 0,
            rows: 0,
            applied: Vec::new(),
        }
    }
}

/// A chunk failed after retries; earlier chunks stay committed.
#[derive(Debug)]
pub struct BatchFailure<O, E> {
    pub completed: BatchReport<O>,
    pub error: E,
}

impl<O, E: fmt::Display> fmt::Display for BatchFailure<O, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "batch stopped after {} committed chunks: {}",
            self.completed.chunks, self.error
        )
    }
}

impl<O: fmt::Debug, E: fmt::Debug + fmt::Display> std::error::Error for BatchFailure<O, E> {}

/// Index ranges of at most `chunk_size` items covering `0..total`.
///
/// A `chunk_size` of zero is treated as one.
pub fn plan_chunks(total: usize, chunk_size: usize) -> Vec<Range<usize>> {
    let size = chunk_size.max(1);
    (0..total)
        .step_by(size)
        .map(|start| start..(start + size).min(total))
        .collect()
}

/// Apply `work` to every item, `chunk_size` items per transaction.
///
/// `work` may run more than once for the items of a retried chunk.
pub async fn chunked_update<I, O, E, F>(
    pool: &PgPool,
    policy: &RetryPolicy,
    items: Vec<I>,
    chunk_size: usize,
    work: F,
) -> Result<BatchReport<O>, BatchFailure<O, E>>
where
    I: Clone + Send + 'static,
    O: Send + 'static,
    E: From<sqlx::Error> + Retryable + std::fmt::Display + Send + 'static,
    F: for<'c> Fn(&'c mut PgConnection, I) -> BoxFuture<'c, Result<Option<O>, E>> + Clone + Send + Sync + 'static,
{
    let mut report = BatchReport::default();
    for range in plan_chunks(items.len(), chunk_size) {
        let chunk: Vec<I> = items[range].to_vec();
        let rows = chunk.len();
        let outcome = run_in_transaction(pool, policy, |_| {}, |conn| {
            let chunk = chunk.clone();
            let work = work.clone();
            Box::pin(async move {
                let mut applied = Vec::new();
                for item in chunk {
                    if let Some(output) = work(&mut *conn, item).await? {
                        applied.push(output);
                    }
                }
                Ok::<Vec<O>, E>(applied)
            })
        })
        .await;
        match outcome {
            Ok(applied) => {
                report.chunks += 1;
                report.rows += rows;
                report.applied.extend(applied);
            }
            Err(error) => {
                tracing::warn!(
                    chunks = report.chunks,
                    rows = report.rows,
                    error = %error,
                    "batch update stopped"
                );
                return Err(BatchFailure {
                    completed: report,
                    error,
                });
            }
        }
    }
    Ok(report)
}
