//! Version-checked updates.
//!
//! A versioned row carries a `version BIGINT` column. An update names the
//! version it was computed from; if the stored version differs, the update
//! fails with [`ConsistencyError::OptimisticLock`] instead of overwriting.
//! On success the version grows by exactly one.
//!
//! The row is read `FOR UPDATE`, so two writers with the same expected
//! version serialize: the first commits, the second then sees the bumped
//! version and fails.
use super::{Columns, ConsistencyError, ConsistencyResult, SqlValue, push_conditions};
use crate::ident::{TableRef, quote_identifier};
use sqlx::{PgConnection, Postgres, QueryBuilder};

pub const VERSION_COLUMN: &str = "version";

/// Compare an expected version against the stored one.
pub fn check_version(entity: &str, id: &str, expected: i64, actual: i64) -> ConsistencyResult<()> {
    if expected != actual {
        return Err(ConsistencyError::OptimisticLock {
            entity: entity.to_string(),
            id: id.to_string(),
            expected,
            actual,
        });
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub struct VersionedRow {
    pub entity: String,
    pub table: TableRef,
    pub id_column: String,
    pub id: SqlValue,
}

impl VersionedRow {
    pub fn new(
        entity: impl Into<String>,
        table: TableRef,
        id_column: impl Into<String>,
        id: impl Into<SqlValue>,
    ) -> Self {
        Self {
            entity: entity.into(),
            table,
            id_column: id_column.into(),
            id: id.into(),
        }
    }

    fn id_condition(&self) -> [(String, SqlValue); 1] {
        [(self.id_column.clone(), self.id.clone())]
    }

    fn lock_query(&self) -> ConsistencyResult<QueryBuilder<'static, Postgres>> {
        let mut builder = QueryBuilder::new("SELECT ");
        builder.push(quote_identifier(VERSION_COLUMN)?);
        builder.push(" FROM ");
        builder.push(self.table.qualified()?);
        builder.push(" WHERE ");
        push_conditions(&mut builder, &self.id_condition())?;
        builder.push(" FOR UPDATE");
        Ok(builder)
    }

    fn update_query(&self, expected: i64, set: &[(String, SqlValue)]) -> ConsistencyResult<QueryBuilder<'static, Postgres>> {
        let version = quote_identifier(VERSION_COLUMN)?;
        let mut builder = QueryBuilder::new("UPDATE ");
        builder.push(self.table.qualified()?);
        builder.push(" SET ");
        for (column, value) in set {
            if column == VERSION_COLUMN {
                continue;
            }
            builder.push(quote_identifier(column)?);
            builder.push(" = ");
            value.push_bind(&mut builder);
            builder.push(", ");
        }
        builder.push(format!("{version} = {version} + 1 WHERE "));
        push_conditions(&mut builder, &self.id_condition())?;
        builder.push(format!(" AND {version} = "));
        builder.push_bind(expected);
        builder.push(format!(" RETURNING {version}"));
        Ok(builder)
    }

    /// Lock the row and return its current version.
    ///
    /// # Errors
    /// - [`ConsistencyError::NotFound`] when no row matches.
    pub async fn lock_version(&self, conn: &mut PgConnection) -> ConsistencyResult<i64> {
        let mut query = self.lock_query()?;
        let version: Option<i64> = query.build_query_scalar().fetch_optional(&mut *conn).await?;
        version.ok_or_else(|| ConsistencyError::NotFound {
            entity: self.entity.clone(),
            id: self.id.display(),
        })
    }

    /// Apply `set` if the stored version equals `expected`; return the new
    /// version.
    ///
    /// A `version` entry in `set` is ignored; the column is always bumped by
    /// one.
    ///
    /// # Errors
    /// - [`ConsistencyError::OptimisticLock`] carrying both versions on a
    ///   mismatch; nothing is written.
    /// - [`ConsistencyError::NotFound`] when the row is missing.
    pub async fn update(
        &self,
        conn: &mut PgConnection,
        expected: i64,
        set: &Columns,
    ) -> ConsistencyResult<i64> {
        let actual = self.lock_version(conn).await?;
        check_version(&self.entity, &self.id.display(), expected, actual)?;

        let mut update = self.update_query(expected, set)?;
        let bumped: Option<i64> = update.build_query_scalar().fetch_optional(&mut *conn).await?;
        match bumped {
            Some(version) => Ok(version),
            None => {
                let actual = self.lock_version(conn).await?;
                Err(ConsistencyError::OptimisticLock {
                    entity: self.entity.clone(),
                    id: self.id.display(),
                    expected,
                    actual,
                })
            }
        }
    }
}
