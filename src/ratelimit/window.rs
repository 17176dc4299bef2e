//! Window policies and time-aligned buckets.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PolicyError;

/// Named window sizes used for the common tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeWindow {
    /// Per-second rate limiting
    Second,
    /// Per-minute rate limiting
    Minute,
    /// Per-hour rate limiting
    Hour,
    /// Per-day rate limiting
    Day,
}

impl TimeWindow {
    /// Get the duration of this time window.
    pub fn duration(&self) -> Duration {
        match self {
            TimeWindow::Second => Duration::from_secs(1),
            TimeWindow::Minute => Duration::from_secs(60),
            TimeWindow::Hour => Duration::from_secs(3600),
            TimeWindow::Day => Duration::from_secs(86400),
        }
    }

    /// The tier name conventionally used for this window.
    pub fn name(&self) -> &'static str {
        match self {
            TimeWindow::Second => "second",
            TimeWindow::Minute => "minute",
            TimeWindow::Hour => "hour",
            TimeWindow::Day => "day",
        }
    }
}

/// Immutable limit configuration for one tier.
///
/// Construction is the only place a policy is validated, so every policy
/// reachable at request time has a positive limit and window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WindowPolicy {
    name: String,
    limit: u64,
    window: Duration,
}

impl WindowPolicy {
    /// Create a policy allowing `limit` requests per `window`.
    pub fn new(name: impl Into<String>, limit: u64, window: Duration) -> Result<Self, PolicyError> {
        let name = name.into();
        if name.is_empty() {
            return Err(PolicyError::EmptyName);
        }
        if limit == 0 {
            return Err(PolicyError::ZeroLimit(name));
        }
        if window.is_zero() {
            return Err(PolicyError::ZeroWindow(name));
        }
        if window.as_millis() == 0 {
            return Err(PolicyError::SubMillisecondWindow(name));
        }
        // Buckets align to whole milliseconds; a remainder would make a
        // decision's bucket start disagree with the stored counter key
        if window.subsec_nanos() % 1_000_000 != 0 {
            return Err(PolicyError::FractionalMillisecondWindow(name));
        }
        Ok(Self {
            name,
            limit,
            window,
        })
    }

    /// Create a policy for a named window, using the window's name as the tier name.
    pub fn per(window: TimeWindow, limit: u64) -> Result<Self, PolicyError> {
        Self::new(window.name(), limit, window.duration())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Window length in whole milliseconds, the resolution buckets are aligned to.
    pub fn window_millis(&self) -> i64 {
        i64::try_from(self.window.as_millis()).unwrap_or(i64::MAX)
    }

    /// The bucket containing `now`.
    pub fn bucket_at(&self, now: DateTime<Utc>) -> Bucket {
        Bucket::containing(now, self.window_millis())
    }

    /// The bucket that started at `start`.
    pub fn bucket_starting(&self, start: DateTime<Utc>) -> Bucket {
        Bucket {
            start_ms: start.timestamp_millis(),
            window_ms: self.window_millis(),
        }
    }
}

/// One time-aligned instance of a window, `[start, start + window)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Bucket {
    start_ms: i64,
    window_ms: i64,
}

impl Bucket {
    /// `floor(now / window) * window`, in milliseconds since the unix epoch.
    pub fn containing(now: DateTime<Utc>, window_ms: i64) -> Self {
        let now_ms = now.timestamp_millis();
        Self {
            start_ms: now_ms.div_euclid(window_ms) * window_ms,
            window_ms,
        }
    }

    /// Bucket start in milliseconds since the unix epoch.
    pub fn start_millis(&self) -> i64 {
        self.start_ms
    }

    pub fn start(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.start_ms).unwrap_or_default()
    }

    /// The instant this bucket closes and the next one opens.
    pub fn end(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.start_ms.saturating_add(self.window_ms))
            .unwrap_or_default()
    }

    /// The bucket immediately before this one.
    pub fn previous(&self) -> Self {
        Self {
            start_ms: self.start_ms - self.window_ms,
            window_ms: self.window_ms,
        }
    }

    /// How far into this bucket `now` is, in `[0, 1)`.
    pub fn elapsed_fraction(&self, now: DateTime<Utc>) -> f64 {
        let elapsed = (now.timestamp_millis() - self.start_ms).clamp(0, self.window_ms - 1);
        elapsed as f64 / self.window_ms as f64
    }
}

/// Store key for one counter: `<policy>:<rate limit key>:<bucket start ms>`.
pub(crate) fn counter_key(policy: &WindowPolicy, key: &str, bucket: &Bucket) -> String {
    format!("{}:{}:{}", policy.name(), key, bucket.start_millis())
}
