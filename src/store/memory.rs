//! In-process counter store.
//!
//! Counts are only shared between limiters in the same process. Useful for
//! tests and single-replica deployments; expiry is applied lazily on access.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, trace};

use super::{CounterSnapshot, CounterStore, WeightedAdmission, WeightedOutcome};
use crate::clock::{system_clock, SharedClock};
use crate::error::StoreError;

/// Expired counters are swept once every this many counter creations.
const SWEEP_EVERY: u64 = 1024;

#[derive(Debug, Clone, Copy)]
struct Counter {
    count: u64,
    expires_at: DateTime<Utc>,
}

impl Counter {
    fn fresh(now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            count: 0,
            expires_at: chrono::Duration::from_std(ttl)
                .ok()
                .and_then(|ttl| now.checked_add_signed(ttl))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Counter store backed by a concurrent map.
///
/// Each operation holds the map entry's shard lock for its whole duration,
/// which gives the same per-key atomicity a remote store provides.
///
/// Every bucket is a new key, so expired counters are swept from the map
/// periodically as new ones are created. No background task is involved.
#[derive(Debug)]
pub struct MemoryCounterStore {
    counters: DashMap<String, Counter>,
    clock: SharedClock,
    created: AtomicU64,
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCounterStore {
    /// Create a store using the system clock.
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    /// Create a store whose expiry follows `clock`.
    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            counters: DashMap::new(),
            clock,
            created: AtomicU64::new(0),
        }
    }

    /// Number of stored counters, expired ones included until next touched.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Drop every expired counter, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.counters.len();
        self.counters.retain(|_, c| c.is_live(now));
        before.saturating_sub(self.counters.len())
    }

    /// Count a counter creation and sweep when one is due.
    ///
    /// Must not be called while holding a map guard.
    fn after_create(&self) {
        let created = self.created.fetch_add(1, Ordering::Relaxed) + 1;
        if created % SWEEP_EVERY == 0 {
            let purged = self.purge_expired();
            debug!(purged = purged, remaining = self.counters.len(), "Swept memory counters");
        }
    }

    fn live_count(&self, key: &str, now: DateTime<Utc>) -> u64 {
        self.counters
            .get(key)
            .filter(|c| c.is_live(now))
            .map(|c| c.count)
            .unwrap_or(0)
    }

    /// Returns the new count and whether the counter was (re)created.
    fn increment_locked(&self, key: &str, ttl: Duration, now: DateTime<Utc>) -> (u64, bool) {
        let mut created = false;
        let mut entry = self.counters.entry(key.to_string()).or_insert_with(|| {
            created = true;
            Counter::fresh(now, ttl)
        });
        if !entry.is_live(now) {
            *entry = Counter::fresh(now, ttl);
            created = true;
        }
        entry.count += 1;
        (entry.count, created)
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        let now = self.clock.now();
        let (count, created) = self.increment_locked(key, ttl, now);
        trace!(key = %key, count = count, "Incremented memory counter");
        if created {
            self.after_create();
        }
        Ok(count)
    }

    async fn read(&self, key: &str) -> Result<CounterSnapshot, StoreError> {
        let now = self.clock.now();
        let live = self
            .counters
            .get(key)
            .filter(|c| c.is_live(now))
            .map(|c| CounterSnapshot {
                count: c.count,
                ttl: (c.expires_at - now).to_std().ok(),
            });

        match live {
            Some(snapshot) => Ok(snapshot),
            None => {
                self.counters.remove_if(key, |_, c| !c.is_live(now));
                Ok(CounterSnapshot::default())
            }
        }
    }

    async fn admit_weighted(
        &self,
        request: &WeightedAdmission,
    ) -> Result<WeightedOutcome, StoreError> {
        let now = self.clock.now();

        // Copy the previous count out before locking the current entry; both
        // keys may live in the same shard.
        let previous = self.live_count(&request.previous_key, now);

        let (outcome, created) = {
            let mut created = false;
            let mut entry = self
                .counters
                .entry(request.current_key.clone())
                .or_insert_with(|| {
                    created = true;
                    Counter::fresh(now, request.ttl)
                });
            if !entry.is_live(now) {
                *entry = Counter::fresh(now, request.ttl);
                created = true;
            }

            let admitted = request.admits(previous, entry.count);
            if admitted {
                entry.count += 1;
            }

            let outcome = WeightedOutcome {
                admitted,
                previous,
                current: entry.count,
            };
            (outcome, created)
        };

        if created {
            self.after_create();
        }
        Ok(outcome)
    }

    async fn decrement(&self, key: &str) -> Result<u64, StoreError> {
        let now = self.clock.now();
        let remaining = match self.counters.get_mut(key) {
            Some(mut counter) if counter.is_live(now) => {
                counter.count = counter.count.saturating_sub(1);
                counter.count
            }
            _ => 0,
        };
        Ok(remaining)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::context::CallContext;
    use crate::ratelimit::{FixedWindowLimiter, Limiter, RateLimitKey, TimeWindow, WindowPolicy};
    use std::sync::Arc;

    fn store_with_clock() -> (MemoryCounterStore, ManualClock) {
        let clock = ManualClock::at_millis(1_700_000_000_000);
        (MemoryCounterStore::with_clock(Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn test_increment_sets_ttl_on_create_only() {
        let (store, clock) = store_with_clock();
        let ttl = Duration::from_secs(1);

        assert_eq!(store.increment("k", ttl).await.unwrap(), 1);
        clock.advance(Duration::from_millis(600));
        assert_eq!(store.increment("k", ttl).await.unwrap(), 2);

        // The second increment must not have pushed the expiry out
        let snapshot = store.read("k").await.unwrap();
        assert_eq!(snapshot.count, 2);
        assert_eq!(snapshot.ttl, Some(Duration::from_millis(400)));

        clock.advance(Duration::from_millis(400));
        assert_eq!(store.read("k").await.unwrap(), CounterSnapshot::default());
        assert_eq!(store.increment("k", ttl).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_read_is_side_effect_free() {
        let (store, _clock) = store_with_clock();
        store.increment("k", Duration::from_secs(5)).await.unwrap();

        for _ in 0..3 {
            assert_eq!(store.read("k").await.unwrap().count, 1);
        }
        assert_eq!(store.read("missing").await.unwrap().count, 0);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_expired_entries_removed_on_read() {
        let (store, clock) = store_with_clock();
        store.increment("k", Duration::from_secs(1)).await.unwrap();
        clock.advance(Duration::from_secs(2));

        store.read("k").await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_admit_weighted() {
        let (store, _clock) = store_with_clock();
        let ttl = Duration::from_secs(2);
        for _ in 0..4 {
            store.increment("prev", ttl).await.unwrap();
        }

        let request = WeightedAdmission {
            current_key: "cur".to_string(),
            previous_key: "prev".to_string(),
            previous_weight: 0.5,
            limit: 4,
            ttl,
        };

        // 4 * 0.5 = 2 carried over, room for two more
        let first = store.admit_weighted(&request).await.unwrap();
        assert_eq!(first, WeightedOutcome { admitted: true, previous: 4, current: 1 });
        let second = store.admit_weighted(&request).await.unwrap();
        assert!(second.admitted);
        let third = store.admit_weighted(&request).await.unwrap();
        assert_eq!(third, WeightedOutcome { admitted: false, previous: 4, current: 2 });
    }

    #[tokio::test]
    async fn test_decrement_floors_at_zero() {
        let (store, _clock) = store_with_clock();
        store.increment("k", Duration::from_secs(1)).await.unwrap();

        assert_eq!(store.decrement("k").await.unwrap(), 0);
        assert_eq!(store.decrement("k").await.unwrap(), 0);
        assert_eq!(store.decrement("missing").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_purge_expired_keeps_live_counters() {
        let (store, clock) = store_with_clock();
        store.increment("short", Duration::from_secs(1)).await.unwrap();
        store.increment("long", Duration::from_secs(60)).await.unwrap();

        clock.advance(Duration::from_secs(2));
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.read("long").await.unwrap().count, 1);
    }

    #[tokio::test]
    async fn test_old_buckets_do_not_accumulate() {
        let (store, clock) = store_with_clock();
        let store = Arc::new(store);
        let shared: SharedClock = Arc::new(clock.clone());
        let policy = WindowPolicy::per(TimeWindow::Second, 5).unwrap();
        let limiter = FixedWindowLimiter::new(store.clone(), policy).with_clock(shared);
        let ctx = CallContext::background();
        let key = RateLimitKey::user("42");

        // One new bucket key per second, never read again once it closes
        for _ in 0..5_000 {
            limiter.admit(&ctx, &key).await.unwrap();
            limiter.describe(&ctx, &key).await.unwrap();
            clock.advance(Duration::from_secs(1));
        }

        assert!(store.len() <= SWEEP_EVERY as usize, "store holds {} counters", store.len());
    }

    #[tokio::test]
    async fn test_weighted_admissions_are_swept_too() {
        let (store, clock) = store_with_clock();
        for i in 0..(SWEEP_EVERY * 2) {
            let request = WeightedAdmission {
                current_key: format!("cur:{}", i),
                previous_key: format!("cur:{}", i.saturating_sub(1)),
                previous_weight: 0.5,
                limit: 10,
                ttl: Duration::from_secs(2),
            };
            store.admit_weighted(&request).await.unwrap();
            clock.advance(Duration::from_secs(1));
        }

        assert!(store.len() <= SWEEP_EVERY as usize);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_weighted_admissions_are_serialized() {
        let store = Arc::new(MemoryCounterStore::new());
        for _ in 0..6 {
            store.increment("prev", Duration::from_secs(60)).await.unwrap();
        }
        let request = Arc::new(WeightedAdmission {
            current_key: "cur".to_string(),
            previous_key: "prev".to_string(),
            previous_weight: 0.5,
            limit: 20,
            ttl: Duration::from_secs(60),
        });

        let mut handles = Vec::new();
        for _ in 0..100 {
            let store = store.clone();
            let request = request.clone();
            handles.push(tokio::spawn(async move {
                store.admit_weighted(&request).await.unwrap().admitted
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            admitted += handle.await.unwrap() as u32;
        }
        // 6 * 0.5 carried over leaves room for 17
        assert_eq!(admitted, 17);
        assert_eq!(store.read("cur").await.unwrap().count, 17);
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_serialized() {
        let store = Arc::new(MemoryCounterStore::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..100 {
                    store.increment("hot", Duration::from_secs(60)).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(store.read("hot").await.unwrap().count, 800);
    }
}
