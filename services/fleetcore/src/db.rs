//! Postgres pool construction and platform-level migrations.
//!
//! Per-tenant tables are not migrated here; they belong to each tenant
//! namespace and are applied by [`crate::schema::SchemaManager`].
use crate::config::PostgresConfig;
use sqlx::PgPool;
use sqlx::migrate::MigrateError;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] MigrateError),
}

pub type DbResult<T> = Result<T, DbError>;

/// Open a pool and bring the platform tables up to date.
///
/// # Security notes
/// - Avoid logging `pg.url`; it may contain credentials.
pub async fn connect(pg: &PostgresConfig) -> DbResult<PgPool> {
    let pool = connect_without_migrations(pg).await?;
    // Migrations run before anything is served so callers can assume the
    // platform tables exist.
    migrate(&pool).await?;
    Ok(pool)
}

pub async fn connect_without_migrations(pg: &PostgresConfig) -> DbResult<PgPool> {
    let connect_options = PgConnectOptions::from_str(&pg.url)?;
    let pool = PgPoolOptions::new()
        .max_connections(pg.max_connections)
        .acquire_timeout(Duration::from_millis(pg.acquire_timeout_ms))
        .connect_with(connect_options)
        .await?;
    Ok(pool)
}

pub async fn migrate(pool: &PgPool) -> DbResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("platform migrations applied");
    Ok(())
}
