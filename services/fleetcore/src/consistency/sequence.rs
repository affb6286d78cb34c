//! Per-scope monotonic counters computed as `max(existing) + 1`.
//!
//! # Concurrency model
//! `max + 1` alone is racy under READ COMMITTED: two allocators can read
//! the same max. [`next_in_sequence`] first takes a transaction-scoped
//! advisory lock keyed by the scope, so allocators for one scope run one at
//! a time and the second sees the first's committed row. The column must
//! also carry a unique constraint; if anything bypasses the lock, the
//! constraint rejects the duplicate and the retry wrapper re-runs the
//! transaction.
//!
//! Run the allocation and the insert that uses it in the same transaction,
//! or the lock is released before the value is claimed.
use super::{ConsistencyResult, SqlValue, push_conditions};
use crate::ident::{TableRef, quote_identifier};
use sqlx::{PgConnection, Postgres, QueryBuilder};

#[derive(Debug, Clone, PartialEq)]
pub struct SequenceScope {
    pub table: TableRef,
    pub column: String,
    /// Optional parent filter, e.g. `("giveaway_id", 7)`.
    pub partition: Option<(String, SqlValue)>,
}

impl SequenceScope {
    pub fn new(table: TableRef, column: impl Into<String>) -> Self {
        Self {
            table,
            column: column.into(),
            partition: None,
        }
    }

    pub fn partitioned_by(mut self, column: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        self.partition = Some((column.into(), value.into()));
        self
    }

    /// Advisory lock key; distinct scopes map to distinct strings.
    pub fn lock_key(&self) -> String {
        match &self.partition {
            Some((column, value)) => format!(
                "fleetcore.seq.{}.{}.{}={}",
                self.table.label(),
                self.column,
                column,
                value.display()
            ),
            None => format!("fleetcore.seq.{}.{}", self.table.label(), self.column),
        }
    }

    fn max_query(&self) -> ConsistencyResult<QueryBuilder<'static, Postgres>> {
        let mut builder = QueryBuilder::new("SELECT MAX(");
        builder.push(quote_identifier(&self.column)?);
        builder.push(")::BIGINT FROM ");
        builder.push(self.table.qualified()?);
        if let Some(partition) = &self.partition {
            builder.push(" WHERE ");
            push_conditions(&mut builder, std::slice::from_ref(partition))?;
        }
        Ok(builder)
    }
}

/// Value following `current_max`; sequences start at 1.
pub fn next_after(current_max: Option<i64>) -> i64 {
    current_max.unwrap_or(0) + 1
}

/// Lock `scope` for the rest of the transaction and return its next value.
///
/// # Errors
/// - [`super::ConsistencyError::Ident`] when the table or column names
///   fail the identifier guard.
/// - Database errors, classified for the retry wrapper.
pub async fn next_in_sequence(conn: &mut PgConnection, scope: &SequenceScope) -> ConsistencyResult<i64> {
    let mut query = scope.max_query()?;
    sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
        .bind(scope.lock_key())
        .execute(&mut *conn)
        .await?;
    let current: Option<i64> = query.build_query_scalar().fetch_one(&mut *conn).await?;
    Ok(next_after(current))
}
