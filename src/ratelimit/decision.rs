//! The per-call admission answer and its quota metadata.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::window::{Bucket, WindowPolicy};

/// Counting algorithm that produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    Fixed,
    Sliding,
}

/// Outcome of a single admission check or quota lookup.
///
/// Built fresh on every call and never stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Requests allowed per window
    pub limit: u64,
    /// Requests left in the current window
    pub remaining: u64,
    /// When the current bucket closes
    pub reset: DateTime<Utc>,
    /// Configured window length
    pub window: Duration,
    /// Name of the policy that produced this decision
    pub policy: String,
    pub algorithm: Algorithm,
}

impl Decision {
    pub(crate) fn new(
        policy: &WindowPolicy,
        algorithm: Algorithm,
        allowed: bool,
        remaining: u64,
        bucket: &Bucket,
    ) -> Self {
        Self {
            allowed,
            limit: policy.limit(),
            remaining,
            reset: bucket.end(),
            window: policy.window(),
            policy: policy.name().to_string(),
            algorithm,
        }
    }

    /// Reset time as unix seconds, rounded up so clients never retry early.
    pub fn reset_unix(&self) -> i64 {
        let millis = self.reset.timestamp_millis();
        millis.div_euclid(1000) + i64::from(millis.rem_euclid(1000) != 0)
    }

    /// Start of the bucket this decision was computed against.
    pub fn bucket_start(&self) -> DateTime<Utc> {
        self.reset - chrono::Duration::from_std(self.window).unwrap_or(chrono::Duration::zero())
    }

    /// How long a client should wait before retrying, at least one second.
    pub fn retry_after(&self, now: DateTime<Utc>) -> Duration {
        let wait = (self.reset - now).to_std().unwrap_or(Duration::ZERO);
        let secs = wait.as_secs() + u64::from(wait.subsec_nanos() != 0);
        Duration::from_secs(secs.max(1))
    }

    /// Whether `self` leaves the caller less headroom than `other`.
    ///
    /// Lower remaining wins; on a tie the later reset wins.
    pub fn is_tighter_than(&self, other: &Decision) -> bool {
        self.remaining < other.remaining
            || (self.remaining == other.remaining && self.reset > other.reset)
    }
}
