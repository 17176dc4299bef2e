//! Hierarchical limiter composing several tiers.
//!
//! Tiers are evaluated in registration order and the first denial wins.
//! Register the finest tier first (second before minute before hour) so a
//! burst is rejected before it costs a round trip for every coarser tier.
//!
//! Each tier checks and counts in a single step. A request admitted by the
//! per-second tier and then denied by the per-minute tier has therefore
//! already used one unit of per-second quota. [`TierRollback`] decides whether
//! that unit is handed back.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::backend::Limiter;
use super::decision::{Algorithm, Decision};
use super::key::RateLimitKey;
use crate::clock::{system_clock, SharedClock};
use crate::context::CallContext;
use crate::error::AdmissionError;

/// What happens to earlier tiers' counts when a later tier denies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierRollback {
    /// Keep the units consumed by tiers that admitted the request.
    #[default]
    Retain,
    /// Refund the units consumed by tiers that admitted the request.
    ///
    /// Refunds are best effort: a failed refund is logged and the denial
    /// stands.
    Compensate,
}

struct Tier {
    name: String,
    limiter: Arc<dyn Limiter>,
}

/// One tier's answer within a composite decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierDecision {
    pub tier: String,
    pub decision: Decision,
}

/// Composite decision with the per-tier detail that produced it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TieredDecision {
    /// The decision reported to the caller
    pub decision: Decision,
    /// Decisions from every tier that was evaluated, in order
    pub tiers: Vec<TierDecision>,
    /// Name of the tier that denied, if any
    pub denied_by: Option<String>,
}

/// A limiter that admits only when every registered tier admits.
pub struct HierarchicalLimiter {
    tiers: Vec<Tier>,
    rollback: TierRollback,
    clock: SharedClock,
}

impl Default for HierarchicalLimiter {
    fn default() -> Self {
        Self {
            tiers: Vec::new(),
            rollback: TierRollback::default(),
            clock: system_clock(),
        }
    }
}

impl HierarchicalLimiter {
    /// Create an empty hierarchical limiter that retains partial counts.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the rollback behaviour.
    pub fn with_rollback(mut self, rollback: TierRollback) -> Self {
        self.rollback = rollback;
        self
    }

    /// Clock used for the decision reported when no tiers are registered.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Register a tier. Startup only; tiers are evaluated in the order added.
    pub fn add_limiter(&mut self, name: impl Into<String>, limiter: Arc<dyn Limiter>) {
        self.tiers.push(Tier {
            name: name.into(),
            limiter,
        });
    }

    /// Builder form of [`add_limiter`](Self::add_limiter).
    pub fn tier(mut self, name: impl Into<String>, limiter: Arc<dyn Limiter>) -> Self {
        self.add_limiter(name, limiter);
        self
    }

    pub fn rollback(&self) -> TierRollback {
        self.rollback
    }

    /// Registered tier names, in evaluation order.
    pub fn tier_names(&self) -> Vec<&str> {
        self.tiers.iter().map(|t| t.name.as_str()).collect()
    }

    /// Check every tier and return the per-tier detail.
    pub async fn admit_detailed(
        &self,
        ctx: &CallContext,
        key: &RateLimitKey,
    ) -> Result<TieredDecision, AdmissionError> {
        let mut evaluated: Vec<TierDecision> = Vec::with_capacity(self.tiers.len());

        for (index, tier) in self.tiers.iter().enumerate() {
            let decision = tier.limiter.admit(ctx, key).await?;
            trace!(
                key = %key,
                tier = %tier.name,
                allowed = decision.allowed,
                remaining = decision.remaining,
                "Tier evaluated"
            );

            if !decision.allowed {
                debug!(
                    key = %key,
                    tier = %tier.name,
                    skipped = self.tiers.len() - index - 1,
                    "Hierarchical limit exceeded"
                );

                if self.rollback == TierRollback::Compensate {
                    self.refund_admitted(ctx, key, &evaluated).await;
                }

                evaluated.push(TierDecision {
                    tier: tier.name.clone(),
                    decision: decision.clone(),
                });
                return Ok(TieredDecision {
                    decision,
                    tiers: evaluated,
                    denied_by: Some(tier.name.clone()),
                });
            }

            evaluated.push(TierDecision {
                tier: tier.name.clone(),
                decision,
            });
        }

        Ok(TieredDecision {
            decision: self.tightest(&evaluated),
            tiers: evaluated,
            denied_by: None,
        })
    }

    async fn refund_admitted(
        &self,
        ctx: &CallContext,
        key: &RateLimitKey,
        admitted: &[TierDecision],
    ) {
        for (tier, entry) in self.tiers.iter().zip(admitted) {
            if let Err(e) = tier.limiter.refund(ctx, key, &entry.decision).await {
                warn!(key = %key, tier = %tier.name, error = %e, "Failed to refund tier");
            }
        }
    }
}

impl HierarchicalLimiter {
    /// The decision leaving the least headroom, or an unrestricted one when no
    /// tiers are registered.
    fn tightest(&self, decisions: &[TierDecision]) -> Decision {
        decisions
            .iter()
            .map(|t| &t.decision)
            .reduce(|acc, d| if d.is_tighter_than(acc) { d } else { acc })
            .cloned()
            .unwrap_or_else(|| self.unrestricted())
    }

    fn unrestricted(&self) -> Decision {
        Decision {
            allowed: true,
            limit: u64::MAX,
            remaining: u64::MAX,
            reset: self.clock.now(),
            window: std::time::Duration::ZERO,
            policy: String::new(),
            algorithm: Algorithm::Fixed,
        }
    }
}

#[async_trait]
impl Limiter for HierarchicalLimiter {
    async fn admit(
        &self,
        ctx: &CallContext,
        key: &RateLimitKey,
    ) -> Result<Decision, AdmissionError> {
        Ok(self.admit_detailed(ctx, key).await?.decision)
    }

    async fn describe(
        &self,
        ctx: &CallContext,
        key: &RateLimitKey,
    ) -> Result<Decision, AdmissionError> {
        let mut tiers = Vec::with_capacity(self.tiers.len());
        for tier in &self.tiers {
            tiers.push(TierDecision {
                tier: tier.name.clone(),
                decision: tier.limiter.describe(ctx, key).await?,
            });
        }

        let mut decision = self.tightest(&tiers);
        decision.allowed = tiers.iter().all(|t| t.decision.allowed);
        Ok(decision)
    }
}
