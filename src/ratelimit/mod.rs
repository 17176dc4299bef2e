//! Admission logic: keys, window policies and the limiters built on them.

mod backend;
mod decision;
mod fixed;
mod hierarchical;
mod key;
mod sliding;
mod window;

pub use backend::Limiter;
pub use decision::{Algorithm, Decision};
pub use fixed::FixedWindowLimiter;
pub use hierarchical::{HierarchicalLimiter, TierDecision, TierRollback, TieredDecision};
pub use key::{AuthenticatedPrincipal, KeyDeriver, PeerAddr, RateLimitKey};
pub use sliding::SlidingWindowLimiter;
pub use window::{Bucket, TimeWindow, WindowPolicy};
