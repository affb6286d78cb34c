//! Race-safe building blocks for write paths.
//!
//! # Purpose
//! Every write that must avoid duplicate ids or lost updates goes through
//! one of these helpers:
//! - [`retry`]: transaction runner with deadlock/serialization retry.
//! - [`sequence`]: per-scope monotonic counters (ticket numbers).
//! - [`unique`]: duplicate-insert guard with an explicit [`unique::DuplicatePolicy`].
//! - [`optimistic`]: version-checked updates.
//! - [`batch`]: bounded chunks, one retried transaction per chunk.
//!
//! # Ordering guarantees
//! Only the optimistic-lock and sequence helpers order work across
//! transactions. No global lock is ever taken; the sequence helper locks a
//! single scope for the lifetime of one transaction.
//!
//! # Cancellation
//! Retries bound the number of attempts, not wall-clock time. Callers that
//! need a deadline wrap the call in `tokio::time::timeout`.
pub mod batch;
pub mod optimistic;
pub mod retry;
pub mod sequence;
pub mod unique;

use crate::ident::IdentError;
use sqlx::{Postgres, QueryBuilder};
use thiserror::Error;

pub use retry::{RetryEvent, RetryPolicy, Retryable, retry_with_backoff, run_in_transaction};

pub const SQLSTATE_UNIQUE_VIOLATION: &str = "23505";
pub const SQLSTATE_DEADLOCK: &str = "40P01";
pub const SQLSTATE_SERIALIZATION: &str = "40001";

#[derive(Debug, Error)]
pub enum ConsistencyError {
    #[error("concurrent update on {entity} {id}: expected version {expected}, found {actual}")]
    OptimisticLock {
        entity: String,
        id: String,
        expected: i64,
        actual: i64,
    },
    #[error("{entity} already exists: {key}")]
    AlreadyExists { entity: String, key: String },
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },
    #[error("deadlock detected")]
    Deadlock(#[source] sqlx::Error),
    #[error("serialization failure")]
    Serialization(#[source] sqlx::Error),
    #[error("concurrent insert of the same {entity}")]
    DuplicateRace { entity: String },
    #[error(transparent)]
    Ident(#[from] IdentError),
    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),
}

pub type ConsistencyResult<T> = Result<T, ConsistencyError>;

impl From<sqlx::Error> for ConsistencyError {
    fn from(err: sqlx::Error) -> Self {
        match sqlstate(&err).as_deref() {
            Some(SQLSTATE_DEADLOCK) => ConsistencyError::Deadlock(err),
            Some(SQLSTATE_SERIALIZATION) => ConsistencyError::Serialization(err),
            _ => ConsistencyError::Database(err),
        }
    }
}

impl Retryable for ConsistencyError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            ConsistencyError::Deadlock(_)
                | ConsistencyError::Serialization(_)
                | ConsistencyError::DuplicateRace { .. }
        )
    }

    fn is_conflict(&self) -> bool {
        matches!(self, ConsistencyError::OptimisticLock { .. })
    }
}

/// SQLSTATE of a database error, if any.
pub fn sqlstate(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().map(|code| code.into_owned()),
        _ => None,
    }
}

pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    sqlstate(err).as_deref() == Some(SQLSTATE_UNIQUE_VIOLATION)
}

/// A bound value for dynamically assembled statements.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Text(String),
    Int(i64),
    Json(serde_json::Value),
    Null,
}

impl SqlValue {
    /// Bind the value, or push an untyped `NULL` so it fits any column type.
    pub(crate) fn push_bind(&self, builder: &mut QueryBuilder<'_, Postgres>) {
        match self {
            SqlValue::Text(value) => builder.push_bind(value.clone()),
            SqlValue::Int(value) => builder.push_bind(*value),
            SqlValue::Json(value) => builder.push_bind(sqlx::types::Json(value.clone())),
            SqlValue::Null => builder.push("NULL"),
        };
    }

    /// Rendering for error messages and logs.
    pub fn display(&self) -> String {
        match self {
            SqlValue::Text(value) => value.clone(),
            SqlValue::Int(value) => value.to_string(),
            SqlValue::Json(_) => "<json>".to_string(),
            SqlValue::Null => "null".to_string(),
        }
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Int(value)
    }
}

impl From<serde_json::Value> for SqlValue {
    fn from(value: serde_json::Value) -> Self {
        SqlValue::Json(value)
    }
}

/// Column/value pairs used by the guard and the versioned update.
pub type Columns = Vec<(String, SqlValue)>;

/// Push `"a" = $1 AND "b" = $2`, quoting every column.
pub(crate) fn push_conditions(
    builder: &mut QueryBuilder<'_, Postgres>,
    columns: &[(String, SqlValue)],
) -> ConsistencyResult<()> {
    for (index, (column, value)) in columns.iter().enumerate() {
        if index > 0 {
            builder.push(" AND ");
        }
        builder.push(crate::ident::quote_identifier(column)?);
        match value {
            SqlValue::Null => {
                builder.push(" IS NULL");
            }
            value => {
                builder.push(" = ");
                value.push_bind(builder);
            }
        }
    }
    Ok(())
}

pub(crate) fn describe_key(columns: &[(String, SqlValue)]) -> String {
    columns
        .iter()
        .map(|(column, value)| format!("{column}={}", value.display()))
        .collect::<Vec<_>>()
        .join(",")
}
