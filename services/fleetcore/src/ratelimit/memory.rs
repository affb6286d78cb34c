//! In-process counter store.
//!
//! Fixed windows keyed by bucket name, using `tokio::time::Instant` so tests
//! can drive expiry with `tokio::time::pause`/`advance`. An expired bucket is
//! replaced on its next increment, and every `sweep_interval` increments the
//! whole map is swept so buckets of subjects that never come back are freed.
use super::{CounterResult, CounterState, CounterStore};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

pub const DEFAULT_SWEEP_INTERVAL: u64 = 1024;

#[derive(Debug, Clone, Copy)]
struct Bucket {
    count: u64,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct Buckets {
    map: HashMap<String, Bucket>,
    increments: u64,
}

impl Buckets {
    fn sweep(&mut self, now: Instant) -> usize {
        let before = self.map.len();
        self.map.retain(|_, bucket| bucket.expires_at > now);
        before - self.map.len()
    }
}

#[derive(Debug)]
pub struct InMemoryCounterStore {
    buckets: Mutex<Buckets>,
    sweep_interval: u64,
}

impl Default for InMemoryCounterStore {
    fn default() -> Self {
        Self {
            buckets: Mutex::new(Buckets::default()),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sweep expired buckets every `interval` increments (at least 1).
    pub fn with_sweep_interval(mut self, interval: u64) -> Self {
        self.sweep_interval = interval.max(1);
        self
    }

    /// Number of buckets held, including expired ones not yet swept.
    pub async fn len(&self) -> usize {
        self.buckets.lock().await.map.len()
    }

    /// Drop every expired bucket now; returns how many were dropped.
    pub async fn sweep_expired(&self) -> usize {
        self.buckets.lock().await.sweep(Instant::now())
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn increment(&self, key: &str, window: Duration) -> CounterResult<CounterState> {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().await;
        buckets.increments += 1;
        if buckets.increments % self.sweep_interval == 0 {
            let dropped = buckets.sweep(now);
            if dropped > 0 {
                tracing::debug!(dropped, live = buckets.map.len(), "expired rate limit buckets swept");
            }
        }

        let bucket = buckets.map.entry(key.to_string()).or_insert(Bucket {
            count: 0,
            expires_at: now + window,
        });
        if bucket.expires_at <= now {
            *bucket = Bucket {
                count: 0,
                expires_at: now + window,
            };
        }
        bucket.count += 1;
        Ok(CounterState {
            count: bucket.count,
            ttl: Some(bucket.expires_at - now),
        })
    }

    async fn reset(&self, key: &str) -> CounterResult<()> {
        self.buckets.lock().await.map.remove(key);
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
