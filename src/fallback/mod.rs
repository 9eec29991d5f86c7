//! In-process substitutes for backend features.
//!
//! When the backend is unavailable the degradation coordinator serves reads and
//! writes from the [`MemoryFallbackCache`] and rate limits with the
//! [`BasicRateLimiter`]. Both use short `parking_lot` locks that are never held
//! across an await point.

pub mod cache;
pub mod rate_limiter;

pub use cache::{CacheStats, MemoryFallbackCache};
pub use rate_limiter::{BasicRateLimiter, RateLimitDecision};
