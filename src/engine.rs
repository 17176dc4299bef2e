//! Assembles limiters, the counter store and the middleware from configuration.

use std::sync::Arc;

use tracing::info;

use crate::clock::{system_clock, SharedClock};
use crate::config::{TierAlgorithm, Topology, TurnstileConfig};
use crate::context::CallContext;
use crate::error::{AdmissionError, Result, TurnstileError};
use crate::middleware::AdmissionLayer;
use crate::ratelimit::{
    Decision, FixedWindowLimiter, HierarchicalLimiter, KeyDeriver, Limiter, RateLimitKey,
    SlidingWindowLimiter, WindowPolicy,
};
use crate::store::{self, CounterStore};

/// A configured admission engine.
pub struct Engine {
    config: TurnstileConfig,
    store: Arc<dyn CounterStore>,
    limiter: Arc<dyn Limiter>,
    deriver: KeyDeriver,
    clock: SharedClock,
}

impl Engine {
    /// Connect to the configured store and build the configured topology.
    pub async fn from_config(config: TurnstileConfig) -> Result<Self> {
        // Validate before paying for a store connection
        config.build_policies()?;
        let clock = system_clock();
        let store = store::connect(&config.store, clock.clone()).await?;
        Self::with_store(config, store, clock)
    }

    /// Build the configured topology over an existing store.
    pub fn with_store(
        config: TurnstileConfig,
        store: Arc<dyn CounterStore>,
        clock: SharedClock,
    ) -> Result<Self> {
        let policies = config.build_policies()?;
        let deriver = config.keys.to_deriver()?;
        let limiter = build_limiter(&config, &store, &clock, policies)?;

        info!(
            store = store.backend_name(),
            topology = ?config.limits.topology,
            tiers = config.limits.tiers.len(),
            "Admission engine ready"
        );

        Ok(Self {
            config,
            store,
            limiter,
            deriver,
            clock,
        })
    }

    pub fn config(&self) -> &TurnstileConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn CounterStore> {
        self.store.clone()
    }

    pub fn limiter(&self) -> Arc<dyn Limiter> {
        self.limiter.clone()
    }

    pub fn deriver(&self) -> &KeyDeriver {
        &self.deriver
    }

    /// A context bounded by the configured call timeout.
    pub fn call_context(&self) -> CallContext {
        match self.config.call_timeout() {
            Some(timeout) => CallContext::with_timeout(timeout),
            None => CallContext::background(),
        }
    }

    /// Check and count one request for `key`.
    pub async fn admit(&self, key: &RateLimitKey) -> std::result::Result<Decision, AdmissionError> {
        self.limiter.admit(&self.call_context(), key).await
    }

    /// Current quota for `key` without counting a request.
    pub async fn describe(
        &self,
        key: &RateLimitKey,
    ) -> std::result::Result<Decision, AdmissionError> {
        self.limiter.describe(&self.call_context(), key).await
    }

    /// Tower layer enforcing this engine in front of an HTTP service.
    pub fn layer(&self) -> AdmissionLayer {
        AdmissionLayer::new(self.limiter.clone())
            .with_deriver(self.deriver.clone())
            .with_fail_mode(self.config.middleware.fail_mode)
            .with_call_timeout(self.config.call_timeout())
            .with_clock(self.clock.clone())
    }
}

fn build_limiter(
    config: &TurnstileConfig,
    store: &Arc<dyn CounterStore>,
    clock: &SharedClock,
    policies: Vec<WindowPolicy>,
) -> Result<Arc<dyn Limiter>> {
    let fixed = |policy: WindowPolicy| -> Arc<dyn Limiter> {
        Arc::new(FixedWindowLimiter::new(store.clone(), policy).with_clock(clock.clone()))
    };
    let sliding = |policy: WindowPolicy| -> Arc<dyn Limiter> {
        Arc::new(SlidingWindowLimiter::new(store.clone(), policy).with_clock(clock.clone()))
    };

    match config.limits.topology {
        topology @ (Topology::Fixed | Topology::Sliding) => {
            let policy = policies
                .into_iter()
                .next()
                .ok_or_else(|| TurnstileError::Config("no tier configured".to_string()))?;
            Ok(match topology {
                Topology::Sliding => sliding(policy),
                _ => fixed(policy),
            })
        }
        Topology::Hierarchical => {
            let mut hierarchy = HierarchicalLimiter::new()
                .with_rollback(config.limits.rollback)
                .with_clock(clock.clone());
            for policy in policies {
                let name = policy.name().to_string();
                let tier = match config.limits.tier_algorithm {
                    TierAlgorithm::Fixed => fixed(policy),
                    TierAlgorithm::Sliding => sliding(policy),
                };
                hierarchy.add_limiter(name, tier);
            }
            Ok(Arc::new(hierarchy))
        }
    }
}
