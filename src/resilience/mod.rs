//! Fault isolation primitives.
//!
//! The [`CircuitBreaker`] wraps any fallible async call; the backend connection
//! manager puts one in front of connection resolution so a dead backend is detected
//! once and then skipped instead of being hammered on every request.
//!
//! ```rust,no_run
//! use sentinelq::config::CircuitBreakerConfig;
//! use sentinelq::resilience::CircuitBreaker;
//!
//! # async fn example() {
//! let breaker = CircuitBreaker::new("llm_api", &CircuitBreakerConfig::default());
//! let result = breaker
//!     .call(|| async { Ok::<_, std::io::Error>("analysis") })
//!     .await;
//! # }
//! ```

pub mod circuit_breaker;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerError, CircuitBreakerSnapshot, CircuitState,
};
