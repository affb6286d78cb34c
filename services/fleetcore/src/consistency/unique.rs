//! Duplicate-insert guard.
//!
//! Checks for a row with the natural key, then inserts it and optionally
//! bumps a denormalized counter on the parent, all inside the caller's
//! transaction. What happens when the key already exists is an explicit
//! [`DuplicatePolicy`] chosen per call site.
//!
//! Two transactions can both miss the row and race to insert. The table's
//! unique constraint rejects the loser; that violation surfaces as
//! [`ConsistencyError::DuplicateRace`], which the retry wrapper treats as
//! transient, so the next attempt finds the winner's row and applies the
//! policy. The parent counter is only bumped by the transaction whose
//! insert committed.
use super::{
    Columns, ConsistencyError, ConsistencyResult, SqlValue, describe_key, is_unique_violation,
    push_conditions,
};
use crate::ident::{TableRef, quote_identifier};
use sqlx::{PgConnection, Postgres, QueryBuilder};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicatePolicy {
    /// Fail with [`ConsistencyError::AlreadyExists`].
    Reject,
    /// Succeed with [`InsertOutcome::Existing`] and change nothing.
    ReturnExisting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Created,
    Existing,
}

impl InsertOutcome {
    pub fn was_created(self) -> bool {
        self == InsertOutcome::Created
    }
}

/// Denormalized counter on the parent row, incremented once per insert.
#[derive(Debug, Clone, PartialEq)]
pub struct ParentCounter {
    pub table: TableRef,
    pub key_column: String,
    pub key: SqlValue,
    pub counter_column: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UniqueGuard {
    pub entity: String,
    pub table: TableRef,
    pub key: Columns,
    pub policy: DuplicatePolicy,
    pub counter: Option<ParentCounter>,
}

impl UniqueGuard {
    pub fn new(entity: impl Into<String>, table: TableRef, policy: DuplicatePolicy) -> Self {
        Self {
            entity: entity.into(),
            table,
            key: Vec::new(),
            policy,
            counter: None,
        }
    }

    pub fn key(mut self, column: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        self.key.push((column.into(), value.into()));
        self
    }

    pub fn counting(mut self, counter: ParentCounter) -> Self {
        self.counter = Some(counter);
        self
    }

    fn exists_query(&self) -> ConsistencyResult<QueryBuilder<'static, Postgres>> {
        let mut builder = QueryBuilder::new("SELECT EXISTS(SELECT 1 FROM ");
        builder.push(self.table.qualified()?);
        builder.push(" WHERE ");
        push_conditions(&mut builder, &self.key)?;
        builder.push(")");
        Ok(builder)
    }

    fn insert_query(&self, extra: &[(String, SqlValue)]) -> ConsistencyResult<QueryBuilder<'static, Postgres>> {
        let columns: Vec<&(String, SqlValue)> = self.key.iter().chain(extra.iter()).collect();
        let mut builder = QueryBuilder::new("INSERT INTO ");
        builder.push(self.table.qualified()?);
        builder.push(" (");
        for (index, (column, _)) in columns.iter().enumerate() {
            if index > 0 {
                builder.push(", ");
            }
            builder.push(quote_identifier(column)?);
        }
        builder.push(") VALUES (");
        for (index, (_, value)) in columns.iter().enumerate() {
            if index > 0 {
                builder.push(", ");
            }
            value.push_bind(&mut builder);
        }
        builder.push(")");
        Ok(builder)
    }

    fn counter_query(counter: &ParentCounter) -> ConsistencyResult<QueryBuilder<'static, Postgres>> {
        let column = quote_identifier(&counter.counter_column)?;
        let mut builder = QueryBuilder::new("UPDATE ");
        builder.push(counter.table.qualified()?);
        builder.push(format!(" SET {column} = {column} + 1 WHERE "));
        push_conditions(
            &mut builder,
            &[(counter.key_column.clone(), counter.key.clone())],
        )?;
        Ok(builder)
    }

    /// Insert the row keyed by `self.key` plus `extra` columns.
    ///
    /// # Errors
    /// - [`ConsistencyError::AlreadyExists`] under [`DuplicatePolicy::Reject`]
    ///   when the key is taken.
    /// - [`ConsistencyError::DuplicateRace`] when a concurrent insert won;
    ///   the transaction is aborted and should be retried.
    /// - [`ConsistencyError::NotFound`] when the parent counter row is missing.
    pub async fn insert(
        &self,
        conn: &mut PgConnection,
        extra: &[(String, SqlValue)],
    ) -> ConsistencyResult<InsertOutcome> {
        let mut exists = self.exists_query()?;
        let taken: bool = exists.build_query_scalar().fetch_one(&mut *conn).await?;
        if taken {
            return match self.policy {
                DuplicatePolicy::Reject => Err(ConsistencyError::AlreadyExists {
                    entity: self.entity.clone(),
                    key: describe_key(&self.key),
                }),
                DuplicatePolicy::ReturnExisting => Ok(InsertOutcome::Existing),
            };
        }

        let mut insert = self.insert_query(extra)?;
        if let Err(err) = insert.build().execute(&mut *conn).await {
            if is_unique_violation(&err) {
                tracing::debug!(entity = %self.entity, "lost insert race; retrying");
                return Err(ConsistencyError::DuplicateRace {
                    entity: self.entity.clone(),
                });
            }
            return Err(err.into());
        }

        if let Some(counter) = &self.counter {
            let mut update = Self::counter_query(counter)?;
            let result = update.build().execute(&mut *conn).await?;
            if result.rows_affected() == 0 {
                return Err(ConsistencyError::NotFound {
                    entity: counter.table.label(),
                    id: counter.key.display(),
                });
            }
        }
        Ok(InsertOutcome::Created)
    }
}
