//! Shared counter store abstraction.
//!
//! The store owns every piece of mutable state the engine relies on. Each
//! operation here is a single atomic round trip; the limiters never compose
//! separate read and write calls to reach an admission decision.

mod memory;
#[cfg(feature = "redis")]
mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::clock::SharedClock;
use crate::config::{StoreBackend, StoreConfig};
use crate::error::{Result, StoreError};

pub use memory::MemoryCounterStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisCounterStore;

/// Point-in-time view of one counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CounterSnapshot {
    /// Current count, zero when the counter does not exist
    pub count: u64,
    /// Time left before the store expires the counter
    pub ttl: Option<Duration>,
}

/// A conditional increment weighted against the previous bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightedAdmission {
    /// Counter for the bucket `now` falls in
    pub current_key: String,
    /// Counter for the bucket immediately before it
    pub previous_key: String,
    /// Share of the previous bucket still inside the sliding window, `(0, 1]`
    pub previous_weight: f64,
    /// Admit while `previous * weight + current + 1 <= limit`
    pub limit: u64,
    /// Expiry set on the current counter when it is created
    pub ttl: Duration,
}

/// What the store saw while evaluating a [`WeightedAdmission`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeightedOutcome {
    pub admitted: bool,
    /// Previous bucket count
    pub previous: u64,
    /// Current bucket count, including this request when admitted
    pub current: u64,
}

impl WeightedAdmission {
    /// The admission rule, shared by every store implementation.
    pub fn admits(&self, previous: u64, current: u64) -> bool {
        previous as f64 * self.previous_weight + current as f64 + 1.0 <= self.limit as f64
    }
}

/// Trait for shared counter store implementations.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increment `key` and return the new count.
    ///
    /// The expiry is set only when this call creates the counter.
    async fn increment(&self, key: &str, ttl: Duration) -> std::result::Result<u64, StoreError>;

    /// Read a counter without modifying it.
    async fn read(&self, key: &str) -> std::result::Result<CounterSnapshot, StoreError>;

    /// Atomically read both buckets and increment the current one if the
    /// weighted count leaves room for one more request.
    async fn admit_weighted(
        &self,
        request: &WeightedAdmission,
    ) -> std::result::Result<WeightedOutcome, StoreError>;

    /// Atomically decrement `key`, never below zero, returning the new count.
    async fn decrement(&self, key: &str) -> std::result::Result<u64, StoreError>;

    /// Short name used in logs.
    fn backend_name(&self) -> &'static str;
}

/// Build the store selected by configuration.
pub async fn connect(config: &StoreConfig, clock: SharedClock) -> Result<Arc<dyn CounterStore>> {
    match config.backend {
        StoreBackend::Memory => {
            tracing::info!("Using in-process counter store; limits are not shared across replicas");
            Ok(Arc::new(MemoryCounterStore::with_clock(clock)))
        }
        #[cfg(feature = "redis")]
        StoreBackend::Redis => {
            let store = RedisCounterStore::connect(
                &config.redis_url,
                &config.key_prefix,
                Duration::from_millis(config.connect_timeout_ms),
            )
            .await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "redis"))]
        StoreBackend::Redis => Err(crate::error::TurnstileError::Config(
            "redis store requested but the `redis` feature is disabled".to_string(),
        )),
    }
}
