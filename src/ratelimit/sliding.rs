//! Sliding-window limiter.
//!
//! Approximates a continuous window by weighting the previous bucket's count
//! by how much of it still overlaps the window ending now:
//!
//! ```text
//! effective = previous * (1 - elapsed_fraction) + current
//! ```
//!
//! State stays at two counters per key and policy. The result is an
//! approximation: across two consecutive buckets at most `2 * limit` requests
//! can be admitted, and strictly fewer unless traffic is perfectly aligned to
//! the boundary.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use super::backend::Limiter;
use super::decision::{Algorithm, Decision};
use super::key::RateLimitKey;
use super::window::{counter_key, Bucket, WindowPolicy};
use crate::clock::{system_clock, SharedClock};
use crate::context::CallContext;
use crate::error::AdmissionError;
use crate::store::{CounterStore, WeightedAdmission};

/// Tolerance applied before rounding a weighted count up.
const WEIGHT_EPSILON: f64 = 1e-9;

/// A sliding-window limiter backed by the shared counter store.
pub struct SlidingWindowLimiter {
    store: Arc<dyn CounterStore>,
    policy: WindowPolicy,
    clock: SharedClock,
}

impl SlidingWindowLimiter {
    /// Create a new sliding-window limiter with a default policy.
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

    /// Check and count one request for `key` against an explicit policy.
    pub async fn admit_with_policy(
        &self,
        ctx: &CallContext,
        key: &RateLimitKey,
        policy: &WindowPolicy,
    ) -> Result<Decision, AdmissionError> {
        let now = self.clock.now();
        let bucket = policy.bucket_at(now);
        let weight = previous_weight(&bucket, now);

        let request = WeightedAdmission {
            current_key: counter_key(policy, key.as_str(), &bucket),
            previous_key: counter_key(policy, key.as_str(), &bucket.previous()),
            previous_weight: weight,
            limit: policy.limit(),
            // The counter must outlive its own bucket to serve as "previous"
            ttl: policy.window().saturating_mul(2),
        };

        trace!(
            key = %key,
            policy = %policy.name(),
            bucket = bucket.start_millis(),
            weight = weight,
            "Checking sliding window"
        );

        let outcome = ctx.run(self.store.admit_weighted(&request)).await?;
        let effective = outcome.previous as f64 * weight + outcome.current as f64;

        if !outcome.admitted {
            debug!(
                key = %key,
                policy = %policy.name(),
                previous = outcome.previous,
                current = outcome.current,
                effective = effective,
                limit = policy.limit(),
                "Sliding window limit exceeded"
            );
        }

        Ok(Decision::new(
            policy,
            Algorithm::Sliding,
            outcome.admitted,
            remaining(policy.limit(), effective),
            &bucket,
        ))
    }
}

/// Share of the previous bucket still inside the window ending at `now`.
fn previous_weight(bucket: &Bucket, now: DateTime<Utc>) -> f64 {
    1.0 - bucket.elapsed_fraction(now)
}

/// `max(0, limit - ceil(effective))`.
fn remaining(limit: u64, effective: f64) -> u64 {
    let used = (effective - WEIGHT_EPSILON).ceil().max(0.0);
    if used >= limit as f64 {
        0
    } else {
        limit - used as u64
    }
}

#[async_trait]
impl Limiter for SlidingWindowLimiter {
    async fn admit(
        &self,
        ctx: &CallContext,
        key: &RateLimitKey,
    ) -> Result<Decision, AdmissionError> {
        self.admit_with_policy(ctx, key, &self.policy).await
    }

    async fn describe(
        &self,
        ctx: &CallContext,
        key: &RateLimitKey,
    ) -> Result<Decision, AdmissionError> {
        let now = self.clock.now();
        let bucket = self.policy.bucket_at(now);
        let weight = previous_weight(&bucket, now);

        let current_key = counter_key(&self.policy, key.as_str(), &bucket);
        let previous_key = counter_key(&self.policy, key.as_str(), &bucket.previous());

        // Two reads may interleave with writers; harmless for a read-only view
        let current = ctx.run(self.store.read(&current_key)).await?;
        let previous = ctx.run(self.store.read(&previous_key)).await?;

        let effective = previous.count as f64 * weight + current.count as f64;
        let allowed = effective + 1.0 <= self.policy.limit() as f64;

        Ok(Decision::new(
            &self.policy,
            Algorithm::Sliding,
            allowed,
            remaining(self.policy.limit(), effective),
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
        ctx.run(self.store.decrement(&store_key)).await?;
        Ok(())
    }
}
