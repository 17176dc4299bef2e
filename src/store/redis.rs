//! Redis-backed counter store.
//!
//! Every operation is a single Lua script invocation or an atomic pipeline, so
//! concurrent replicas see serialized updates per key.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use tracing::{info, trace};

use super::{CounterSnapshot, CounterStore, WeightedAdmission, WeightedOutcome};
use crate::error::StoreError;

/// Increment, setting the expiry only when the counter is created.
/// Returns the new count.
const INCREMENT_SCRIPT: &str = r#"
local current = redis.call('INCR', KEYS[1])
if current == 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return current
"#;

/// Weighted two-bucket admission.
/// KEYS: current, previous. ARGV: previous weight, limit, ttl ms.
/// Returns {admitted, previous, current}.
const WEIGHTED_SCRIPT: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
local previous = tonumber(redis.call('GET', KEYS[2]) or '0')
local weight = tonumber(ARGV[1])
local limit = tonumber(ARGV[2])

if previous * weight + current + 1 <= limit then
    current = redis.call('INCR', KEYS[1])
    if current == 1 then
        redis.call('PEXPIRE', KEYS[1], ARGV[3])
    end
    return {1, previous, current}
end
return {0, previous, current}
"#;

/// Decrement without going below zero. Returns the new count.
const DECREMENT_SCRIPT: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current > 0 then
    return redis.call('DECR', KEYS[1])
end
return 0
"#;

/// Counter store shared by every replica through Redis.
pub struct RedisCounterStore {
    conn: ConnectionManager,
    key_prefix: String,
    increment: Script,
    weighted: Script,
    decrement: Script,
}

impl std::fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("key_prefix", &self.key_prefix)
            .finish()
    }
}

impl RedisCounterStore {
    /// Connect to Redis, giving up after `connect_timeout`.
    pub async fn connect(
        url: &str,
        key_prefix: &str,
        connect_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let client = Client::open(url).map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let conn = tokio::time::timeout(connect_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| StoreError::Timeout)??;

        info!(url = %url, key_prefix = %key_prefix, "Connected to Redis counter store");

        Ok(Self {
            conn,
            key_prefix: key_prefix.to_string(),
            increment: Script::new(INCREMENT_SCRIPT),
            weighted: Script::new(WEIGHTED_SCRIPT),
            decrement: Script::new(DECREMENT_SCRIPT),
        })
    }

    fn make_key(&self, key: &str) -> String {
        format!("{}:{}", self.key_prefix, key)
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

fn non_negative(value: i64, what: &str) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::Protocol(format!("negative {}: {}", what, value)))
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        let redis_key = self.make_key(key);
        let mut conn = self.conn.clone();

        let count: i64 = self
            .increment
            .key(&redis_key)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;

        trace!(key = %redis_key, count = count, "Incremented Redis counter");
        non_negative(count, "count")
    }

    async fn read(&self, key: &str) -> Result<CounterSnapshot, StoreError> {
        let redis_key = self.make_key(key);
        let mut conn = self.conn.clone();

        let (count, pttl): (Option<i64>, i64) = redis::pipe()
            .atomic()
            .get(&redis_key)
            .pttl(&redis_key)
            .query_async(&mut conn)
            .await?;

        // PTTL is -2 for a missing key and -1 for a key without expiry
        let ttl = u64::try_from(pttl).ok().map(Duration::from_millis);
        Ok(CounterSnapshot {
            count: non_negative(count.unwrap_or(0), "count")?,
            ttl,
        })
    }

    async fn admit_weighted(
        &self,
        request: &WeightedAdmission,
    ) -> Result<WeightedOutcome, StoreError> {
        let current_key = self.make_key(&request.current_key);
        let previous_key = self.make_key(&request.previous_key);
        let mut conn = self.conn.clone();

        let reply: Vec<i64> = self
            .weighted
            .key(&current_key)
            .key(&previous_key)
            .arg(format!("{:.9}", request.previous_weight))
            .arg(request.limit)
            .arg(ttl_millis(request.ttl))
            .invoke_async(&mut conn)
            .await?;

        match reply.as_slice() {
            [admitted, previous, current] => Ok(WeightedOutcome {
                admitted: *admitted == 1,
                previous: non_negative(*previous, "previous count")?,
                current: non_negative(*current, "current count")?,
            }),
            other => Err(StoreError::Protocol(format!(
                "weighted admission returned {} values",
                other.len()
            ))),
        }
    }

    async fn decrement(&self, key: &str) -> Result<u64, StoreError> {
        let redis_key = self.make_key(key);
        let mut conn = self.conn.clone();

        let count: i64 = self
            .decrement
            .key(&redis_key)
            .invoke_async(&mut conn)
            .await?;
        non_negative(count, "count")
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn get_test_store() -> Option<RedisCounterStore> {
        let url = std::env::var("REDIS_URL")
            .unwrap_or_else(|_| "redis://localhost:6379".to_string());
        let prefix = format!("turnstile_test:{}", uuid::Uuid::new_v4());
        RedisCounterStore::connect(&url, &prefix, Duration::from_secs(1))
            .await
            .ok()
    }

    #[tokio::test]
    async fn test_redis_increment_and_read() {
        let store = match get_test_store().await {
            Some(s) => s,
            None => return,
        };

        assert_eq!(store.increment("k", Duration::from_secs(5)).await.unwrap(), 1);
        assert_eq!(store.increment("k", Duration::from_secs(5)).await.unwrap(), 2);

        let snapshot = store.read("k").await.unwrap();
        assert_eq!(snapshot.count, 2);
        assert!(snapshot.ttl.is_some_and(|ttl| ttl <= Duration::from_secs(5)));

        let missing = store.read("missing").await.unwrap();
        assert_eq!(missing, CounterSnapshot::default());
    }

    #[tokio::test]
    async fn test_redis_counter_expires() {
        let store = match get_test_store().await {
            Some(s) => s,
            None => return,
        };

        store.increment("short", Duration::from_millis(200)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(store.read("short").await.unwrap().count, 0);
    }

    #[tokio::test]
    async fn test_redis_weighted_admission() {
        let store = match get_test_store().await {
            Some(s) => s,
            None => return,
        };

        for _ in 0..4 {
            store.increment("prev", Duration::from_secs(10)).await.unwrap();
        }
        let request = WeightedAdmission {
            current_key: "cur".to_string(),
            previous_key: "prev".to_string(),
            previous_weight: 0.5,
            limit: 4,
            ttl: Duration::from_secs(10),
        };

        assert!(store.admit_weighted(&request).await.unwrap().admitted);
        assert!(store.admit_weighted(&request).await.unwrap().admitted);
        let denied = store.admit_weighted(&request).await.unwrap();
        assert_eq!(denied, WeightedOutcome { admitted: false, previous: 4, current: 2 });
    }

    #[tokio::test]
    async fn test_redis_decrement_floors_at_zero() {
        let store = match get_test_store().await {
            Some(s) => s,
            None => return,
        };

        store.increment("refund", Duration::from_secs(5)).await.unwrap();
        assert_eq!(store.decrement("refund").await.unwrap(), 0);
        assert_eq!(store.decrement("refund").await.unwrap(), 0);
    }
}
