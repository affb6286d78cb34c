//! fleetcore maintenance binary.
//!
//! # Purpose
//! Runs platform and tenant migrations, the legacy-credential sweep, or a
//! metrics endpoint for a long-lived process.
//!
//! # Usage
//! ```text
//! fleetcore migrate
//! fleetcore reencrypt-legacy [--chunk-size N] [--actor USER_ID]
//! fleetcore serve
//! ```
use anyhow::{Context, anyhow};
use clap::{Parser, Subcommand};
use fleetcore::config::PlatformConfig;
use fleetcore::crypto::EncryptionService;
use fleetcore::platform::{Actor, Platform};
use fleetcore::ratelimit::RateLimiter;
use fleetcore::ratelimit::memory::InMemoryCounterStore;
use fleetcore::ratelimit::redis::RedisCounterStore;
use fleetcore::{db, observability};
use std::future::Future;
use std::sync::Arc;

const DEFAULT_CHUNK_SIZE: usize = 100;
const SYSTEM_ACTOR: &str = "system";

#[derive(Parser, Debug)]
#[command(name = "fleetcore")]
#[command(about = "Tenant migrations, credential maintenance and metrics for the bot platform")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
enum Command {
    /// Apply pending structure steps to every registered tenant namespace
    Migrate,
    /// Rewrite legacy bot token envelopes in the current format
    ReencryptLegacy {
        /// Rows per transaction
        #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE, value_parser = parse_chunk_size)]
        chunk_size: usize,

        /// User id recorded as the actor in the audit log
        #[arg(long, default_value = SYSTEM_ACTOR)]
        actor: String,
    },
    /// Serve /metrics until Ctrl-C
    Serve,
}

fn parse_chunk_size(value: &str) -> Result<usize, String> {
    match value.parse::<usize>() {
        Ok(0) => Err("must be positive".to_string()),
        Ok(size) => Ok(size),
        Err(err) => Err(err.to_string()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = PlatformConfig::from_env().context("fleetcore config")?;
    run_with_shutdown(args.command, config, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

async fn run_with_shutdown<F>(command: Command, config: PlatformConfig, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let metrics_handle = observability::init_observability("fleetcore");
    match command {
        Command::Migrate => {
            let platform = build_platform(&config).await?;
            let migrated = platform.migrate_tenant_namespaces().await?;
            tracing::info!(namespaces = migrated.len(), "migrations complete");
        }
        Command::ReencryptLegacy { chunk_size, actor } => {
            let platform = build_platform(&config).await?;
            let report = platform
                .reencrypt_legacy_tokens(&Actor::new(actor), chunk_size)
                .await?;
            if report.failed > 0 {
                return Err(anyhow!(
                    "{} of {} credentials could not be re-encrypted",
                    report.failed,
                    report.scanned
                ));
            }
        }
        Command::Serve => {
            let platform = build_platform(&config)
                .await?
                .with_limiter(build_limiter(&config).await?);
            tracing::info!(
                addr = %config.metrics_bind,
                schemas = platform.schemas().backend_name(),
                limiter = platform.limiter().backend_name(),
                audit = platform.audit().backend_name(),
                "fleetcore metrics listening"
            );
            observability::serve_metrics_with_shutdown(metrics_handle, config.metrics_bind, shutdown)
                .await?;
        }
    }
    Ok(())
}

/// Platform without a shared limiter; `migrate` and `reencrypt-legacy`
/// never consume rate limits.
async fn build_platform(config: &PlatformConfig) -> anyhow::Result<Platform> {
    let crypto = EncryptionService::derive(config.encryption.clone())
        .await
        .context("encryption service")?;
    let pool = db::connect(config.require_postgres()?)
        .await
        .context("connect postgres")?;
    Ok(Platform::new(pool, crypto).with_retry(config.retry.clone()))
}

/// Redis-backed when a URL is configured. A Redis that is down at start-up
/// does not stop the process: the store keeps trying to connect and each
/// decision meanwhile follows the configured fail mode.
async fn build_limiter(config: &PlatformConfig) -> anyhow::Result<RateLimiter> {
    let limiter = match &config.ratelimit.redis_url {
        Some(url) => {
            let store = RedisCounterStore::lazy(url).context("parse redis url")?;
            match tokio::time::timeout(config.ratelimit.timeout, store.warm_up()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::warn!(
                    error = %err,
                    fail_mode = ?config.ratelimit.fail_mode,
                    "redis unavailable at start-up; rate limits follow the fail mode until it recovers"
                ),
                Err(_) => tracing::warn!(
                    timeout = ?config.ratelimit.timeout,
                    fail_mode = ?config.ratelimit.fail_mode,
                    "redis connect timed out at start-up; rate limits follow the fail mode until it recovers"
                ),
            }
            RateLimiter::new(Arc::new(store))
        }
        None => RateLimiter::new(Arc::new(InMemoryCounterStore::new())),
    };
    Ok(limiter
        .with_fail_mode(config.ratelimit.fail_mode)
        .with_timeout(config.ratelimit.timeout))
}
