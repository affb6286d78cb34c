//! Redis counter store.
//!
//! # Purpose
//! Shares buckets across every process of the platform through one Redis
//! endpoint.
//!
//! # Key invariants
//! - Increment, first-hit expiry, and TTL read happen in one Lua script so a
//!   bucket can never be left without an expiry between round trips.
//! - A key that somehow lost its TTL gets one on the next hit.
//! - Keys arrive pre-validated as `ratelimit:<action>:<subject>`.
//! - Connecting is lazy; a failed connect leaves the store unconnected and
//!   the next operation tries again.
use super::{CounterResult, CounterState, CounterStore};
use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

const INCREMENT_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
local ttl = redis.call('PTTL', KEYS[1])
if count == 1 or ttl < 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
  ttl = tonumber(ARGV[1])
end
return {count, ttl}
"#;

#[derive(Clone)]
pub struct RedisCounterStore {
    client: redis::Client,
    conn: Arc<OnceCell<ConnectionManager>>,
    script: redis::Script,
}

impl RedisCounterStore {
    /// Open a managed connection to `url` now.
    ///
    /// # Errors
    /// - [`super::CounterError::Redis`] for an unparsable URL or when the
    ///   initial connection fails.
    ///
    /// # Security notes
    /// - Do not log `url`; it may carry a password.
    pub async fn connect(url: &str) -> CounterResult<Self> {
        let store = Self::lazy(url)?;
        store.connection().await?;
        Ok(store)
    }

    /// Parse `url` without connecting. The connection is opened by the
    /// first operation and retried by later ones until it succeeds, so an
    /// outage at start-up is handled per request by the limiter's fail mode.
    ///
    /// # Errors
    /// - [`super::CounterError::Redis`] for an unparsable URL.
    pub fn lazy(url: &str) -> CounterResult<Self> {
        Ok(Self {
            client: redis::Client::open(url)?,
            conn: Arc::new(OnceCell::new()),
            script: redis::Script::new(INCREMENT_SCRIPT),
        })
    }

    /// Whether a connection has been established.
    pub fn is_connected(&self) -> bool {
        self.conn.initialized()
    }

    /// Try to connect now if no connection is open yet.
    pub async fn warm_up(&self) -> CounterResult<()> {
        self.connection().await.map(|_| ())
    }

    async fn connection(&self) -> CounterResult<ConnectionManager> {
        let conn = self
            .conn
            .get_or_try_init(|| ConnectionManager::new(self.client.clone()))
            .await?;
        Ok(conn.clone())
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment(&self, key: &str, window: Duration) -> CounterResult<CounterState> {
        let window_ms = window.as_millis().max(1) as u64;
        let mut conn = self.connection().await?;
        let (count, ttl_ms): (i64, i64) = self
            .script
            .key(key)
            .arg(window_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(CounterState {
            count: count.max(0) as u64,
            ttl: (ttl_ms >= 0).then(|| Duration::from_millis(ttl_ms as u64)),
        })
    }

    async fn reset(&self, key: &str) -> CounterResult<()> {
        let mut conn = self.connection().await?;
        let _: i64 = conn.del(key).await?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}
