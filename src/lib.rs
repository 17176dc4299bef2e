//! Turnstile - Multi-tier Request Admission Engine
//!
//! This crate decides, per inbound request, whether a caller may proceed under
//! one or more time-windowed quotas. Counters live in a shared store (Redis, or
//! an in-process map for single-replica use) so every replica enforces the
//! same budget. Limiters compose into tiers, and a tower layer applies them in
//! front of any `http` service.

pub mod clock;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod middleware;
pub mod ratelimit;
pub mod store;
