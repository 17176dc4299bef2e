//! Limiter trait shared by every counting algorithm and by composites.

use async_trait::async_trait;

use super::decision::Decision;
use super::key::RateLimitKey;
use crate::context::CallContext;
use crate::error::AdmissionError;

/// Trait for limiter implementations.
///
/// Fixed, sliding and hierarchical limiters all implement this, so the
/// middleware and the hierarchical composite can hold any of them as
/// `Arc<dyn Limiter>`.
#[async_trait]
pub trait Limiter: Send + Sync {
    /// Check and count one request for `key`.
    ///
    /// The check and the increment happen in one atomic store operation.
    async fn admit(
        &self,
        ctx: &CallContext,
        key: &RateLimitKey,
    ) -> Result<Decision, AdmissionError>;

    /// Current quota for `key` without counting a request.
    async fn describe(
        &self,
        ctx: &CallContext,
        key: &RateLimitKey,
    ) -> Result<Decision, AdmissionError>;

    /// Check and count one request, returning only the verdict.
    async fn allow(&self, ctx: &CallContext, key: &RateLimitKey) -> Result<bool, AdmissionError> {
        Ok(self.admit(ctx, key).await?.allowed)
    }

    /// Give back the unit consumed by an earlier admitted `decision`.
    ///
    /// Used by the hierarchical limiter when a later tier denies. Limiters that
    /// cannot attribute a decision to a single counter leave this a no-op.
    async fn refund(
        &self,
        _ctx: &CallContext,
        _key: &RateLimitKey,
        _decision: &Decision,
    ) -> Result<(), AdmissionError> {
        Ok(())
    }
}
