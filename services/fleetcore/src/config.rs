use crate::consistency::RetryPolicy;
use crate::crypto::{DEFAULT_KDF_LOG_N, EncryptionSettings};
use crate::ratelimit::{DEFAULT_STORE_TIMEOUT, FailMode};
use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::fmt::Display;
use std::fs;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_METRICS_BIND: &str = "0.0.0.0:9102";
const DEFAULT_PG_MAX_CONNECTIONS: u32 = 10;
const DEFAULT_PG_ACQUIRE_TIMEOUT_MS: u64 = 5000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostgresConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// In-memory counters when unset.
    pub redis_url: Option<String>,
    pub fail_mode: FailMode,
    pub timeout: Duration,
}

// Platform configuration sourced from environment variables, with an
// optional YAML file (FLEETCORE_CONFIG) overriding the non-secret fields.
#[derive(Debug, Clone)]
pub struct PlatformConfig {
    pub encryption: EncryptionSettings,
    pub postgres: Option<PostgresConfig>,
    pub ratelimit: RateLimitConfig,
    pub retry: RetryPolicy,
    pub metrics_bind: SocketAddr,
}

#[derive(Debug, Default, Deserialize)]
struct PlatformConfigOverride {
    database_url: Option<String>,
    pg_max_connections: Option<u32>,
    pg_acquire_timeout_ms: Option<u64>,
    redis_url: Option<String>,
    ratelimit_fail_mode: Option<String>,
    ratelimit_timeout_ms: Option<u64>,
    tx_max_attempts: Option<u32>,
    tx_base_delay_ms: Option<u64>,
    metrics_bind: Option<String>,
}

impl PlatformConfig {
    pub fn from_env() -> Result<Self> {
        let mut config = Self::from_env_only()?;
        if let Ok(path) = std::env::var("FLEETCORE_CONFIG") {
            let contents =
                fs::read_to_string(&path).with_context(|| format!("read FLEETCORE_CONFIG: {path}"))?;
            config.apply_yaml(&contents)?;
        }
        Ok(config)
    }

    fn from_env_only() -> Result<Self> {
        let master_key = required("FLEETCORE_ENCRYPTION_KEY")?;
        let installation_salt = required("FLEETCORE_INSTALLATION_SALT")?;
        let kdf_log_n = parse_or("FLEETCORE_KDF_LOG_N", DEFAULT_KDF_LOG_N)?;

        let postgres = match first_var(&["FLEETCORE_DATABASE_URL", "DATABASE_URL"]) {
            Some(url) => Some(PostgresConfig {
                url,
                max_connections: parse_or("FLEETCORE_PG_MAX_CONNECTIONS", DEFAULT_PG_MAX_CONNECTIONS)?,
                acquire_timeout_ms: parse_or(
                    "FLEETCORE_PG_ACQUIRE_TIMEOUT_MS",
                    DEFAULT_PG_ACQUIRE_TIMEOUT_MS,
                )?,
            }),
            None => None,
        };

        let ratelimit = RateLimitConfig {
            redis_url: first_var(&["FLEETCORE_REDIS_URL", "REDIS_URL"]),
            fail_mode: parse_or("FLEETCORE_RATELIMIT_FAIL_MODE", FailMode::default())?,
            timeout: Duration::from_millis(parse_or(
                "FLEETCORE_RATELIMIT_TIMEOUT_MS",
                DEFAULT_STORE_TIMEOUT.as_millis() as u64,
            )?),
        };

        let defaults = RetryPolicy::default();
        let retry = RetryPolicy::new(
            parse_or("FLEETCORE_TX_MAX_ATTEMPTS", defaults.max_attempts)?,
            Duration::from_millis(parse_or(
                "FLEETCORE_TX_BASE_DELAY_MS",
                defaults.base_delay.as_millis() as u64,
            )?),
        );

        let metrics_bind = std::env::var("FLEETCORE_METRICS_BIND")
            .unwrap_or_else(|_| DEFAULT_METRICS_BIND.to_string())
            .parse()
            .with_context(|| "parse FLEETCORE_METRICS_BIND")?;

        Ok(Self {
            encryption: EncryptionSettings::new(master_key, installation_salt).with_kdf_log_n(kdf_log_n),
            postgres,
            ratelimit,
            retry,
            metrics_bind,
        })
    }

    fn apply_yaml(&mut self, contents: &str) -> Result<()> {
        let override_cfg: PlatformConfigOverride =
            serde_yaml::from_str(contents).with_context(|| "parse fleetcore config yaml")?;
        if let Some(url) = override_cfg.database_url {
            let postgres = self.postgres.get_or_insert_with(|| PostgresConfig {
                url: String::new(),
                max_connections: DEFAULT_PG_MAX_CONNECTIONS,
                acquire_timeout_ms: DEFAULT_PG_ACQUIRE_TIMEOUT_MS,
            });
            postgres.url = url;
        }
        if let Some(postgres) = self.postgres.as_mut() {
            if let Some(value) = override_cfg.pg_max_connections {
                postgres.max_connections = value;
            }
            if let Some(value) = override_cfg.pg_acquire_timeout_ms {
                postgres.acquire_timeout_ms = value;
            }
        }
        if let Some(value) = override_cfg.redis_url {
            self.ratelimit.redis_url = Some(value);
        }
        if let Some(value) = override_cfg.ratelimit_fail_mode {
            self.ratelimit.fail_mode = value
                .parse()
                .map_err(|err| anyhow!("parse ratelimit_fail_mode: {err}"))?;
        }
        if let Some(value) = override_cfg.ratelimit_timeout_ms {
            self.ratelimit.timeout = Duration::from_millis(value);
        }
        if let Some(value) = override_cfg.tx_max_attempts {
            self.retry.max_attempts = value;
        }
        if let Some(value) = override_cfg.tx_base_delay_ms {
            self.retry.base_delay = Duration::from_millis(value);
        }
        if let Some(value) = override_cfg.metrics_bind {
            self.metrics_bind = value.parse().with_context(|| "parse metrics_bind")?;
        }
        Ok(())
    }

    pub fn require_postgres(&self) -> Result<&PostgresConfig> {
        self.postgres
            .as_ref()
            .context("FLEETCORE_DATABASE_URL or DATABASE_URL must be set")
    }
}

fn required(key: &str) -> Result<String> {
    match std::env::var(key) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(anyhow!("{key} must be set")),
    }
}

fn first_var(keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| std::env::var(key).ok())
        .find(|value| !value.is_empty())
}

fn parse_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match std::env::var(key) {
        Ok(value) => value.parse().map_err(|err| anyhow!("parse {key}: {err}")),
        Err(_) => Ok(default),
    }
}
