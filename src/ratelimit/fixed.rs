//! Fixed-window limiter.
//!
//! Counts requests in time-aligned buckets. A caller can spend a full quota at
//! the end of one bucket and another right after the boundary; the sliding
//! limiter exists for callers that cannot tolerate that burst.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, trace};

use super::backend::Limiter;
use super::decision::{Algorithm, Decision};
use super::key::RateLimitKey;
use super::window::{counter_key, WindowPolicy};
use crate::clock::{system_clock, SharedClock};
use crate::context::CallContext;
use crate::error::AdmissionError;
use crate::store::CounterStore;

/// A fixed-window limiter backed by the shared counter store.
pub struct FixedWindowLimiter {
    store: Arc<dyn CounterStore>,
    policy: WindowPolicy,
    clock: SharedClock,
}

impl FixedWindowLimiter {
    /// Create a new fixed-window limiter.
    pub fn new(store: Arc<dyn CounterStore>, policy: WindowPolicy) -> Self {
        Self {
            store,
            policy,
            clock: system_clock(),
        }
    }

    /// Use `clock` for bucket boundaries instead of the system clock.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn policy(&self) -> &WindowPolicy {
        &self.policy
    }
}

#[async_trait]
impl Limiter for FixedWindowLimiter {
    async fn admit(
        &self,
        ctx: &CallContext,
        key: &RateLimitKey,
    ) -> Result<Decision, AdmissionError> {
        let now = self.clock.now();
        let bucket = self.policy.bucket_at(now);
        let store_key = counter_key(&self.policy, key.as_str(), &bucket);

        trace!(
            key = %key,
            policy = %self.policy.name(),
            bucket = bucket.start_millis(),
            "Checking fixed window"
        );

        let count = ctx
            .run(self.store.increment(&store_key, self.policy.window()))
            .await?;

        let limit = self.policy.limit();
        let allowed = count <= limit;
        if !allowed {
            debug!(
                key = %key,
                policy = %self.policy.name(),
                count = count,
                limit = limit,
                "Fixed window limit exceeded"
            );
        }

        Ok(Decision::new(
            &self.policy,
            Algorithm::Fixed,
            allowed,
            limit.saturating_sub(count),
            &bucket,
        ))
    }

    async fn describe(
        &self,
        ctx: &CallContext,
        key: &RateLimitKey,
    ) -> Result<Decision, AdmissionError> {
        let now = self.clock.now();
        let bucket = self.policy.bucket_at(now);
        let store_key = counter_key(&self.policy, key.as_str(), &bucket);

        let snapshot = ctx.run(self.store.read(&store_key)).await?;
        let remaining = self.policy.limit().saturating_sub(snapshot.count);

        Ok(Decision::new(
            &self.policy,
            Algorithm::Fixed,
            remaining > 0,
            remaining,
            &bucket,
        ))
    }

    async fn refund(
        &self,
        ctx: &CallContext,
        key: &RateLimitKey,
        decision: &Decision,
    ) -> Result<(), AdmissionError> {
        let bucket = self.policy.bucket_starting(decision.bucket_start());
        let store_key = counter_key(&self.policy, key.as_str(), &bucket);
        let count = ctx.run(self.store.decrement(&store_key)).await?;
        trace!(key = %key, policy = %self.policy.name(), count = count, "Refunded fixed window");
        Ok(())
    }
}
