//! Error types for the Turnstile admission engine.

use thiserror::Error;

/// Failures talking to the shared counter store.
///
/// These are never folded into an allow or deny answer; the caller of the
/// engine decides what an unreachable store means.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached or rejected the command
    #[error("Counter store unavailable: {0}")]
    Unavailable(String),

    /// The call context deadline passed before the store answered
    #[error("Counter store call timed out")]
    Timeout,

    /// The call context was cancelled while the store call was in flight
    #[error("Counter store call cancelled")]
    Cancelled,

    /// The store answered with something we could not interpret
    #[error("Unexpected counter store reply: {0}")]
    Protocol(String),
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            StoreError::Timeout
        } else {
            StoreError::Unavailable(err.to_string())
        }
    }
}

/// Rejections raised while building a [`crate::ratelimit::WindowPolicy`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("policy '{0}' must allow at least one request per window")]
    ZeroLimit(String),

    #[error("policy '{0}' must have a non-zero window")]
    ZeroWindow(String),

    #[error("policy '{0}' window must be at least one millisecond")]
    SubMillisecondWindow(String),

    #[error("policy '{0}' window must be a whole number of milliseconds")]
    FractionalMillisecondWindow(String),

    #[error("policy name must not be empty")]
    EmptyName,
}

/// Per-request error returned by every limiter.
///
/// Kept separate from a denial so middleware can pick its own status code.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("Admission check failed: {0}")]
    Store(#[from] StoreError),
}

/// Main error type for Turnstile startup and tooling.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid window policy
    #[error("Policy error: {0}")]
    Policy(#[from] PolicyError),

    /// Counter store errors during startup
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
