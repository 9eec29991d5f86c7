//! Sliding-window rate limiter kept in process memory.
//!
//! Only meaningful within one process: each replica of the service keeps its own
//! windows, so the effective limit while degraded is per instance.

use crate::config::{CacheConfig, DurationExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Answer to "may this identifier make another request?"
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Human-readable reason when denied
    pub reason: Option<String>,
}

impl RateLimitDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn deny(limit: u32, window: Duration) -> Self {
        Self {
            allowed: false,
            reason: Some(format!(
                "Rate limit exceeded: {limit} requests per {}s",
                window.as_secs_f64()
            )),
        }
    }
}

#[derive(Debug)]
struct LimiterState {
    windows: HashMap<String, VecDeque<Instant>>,
    last_cleanup: Instant,
}

/// Per-identifier sliding window of request timestamps
#[derive(Debug)]
pub struct BasicRateLimiter {
    state: Mutex<LimiterState>,
    idle_timeout: Duration,
    cleanup_interval: Duration,
}

impl BasicRateLimiter {
    pub fn new(config: &CacheConfig) -> Self {
        Self::with_timeouts(
            config.limiter_idle_secs.secs(),
            config.limiter_cleanup_interval_secs.secs(),
        )
    }

    /// Limiter dropping identifiers idle for `idle_timeout`, swept at most every
    /// `cleanup_interval`
    pub fn with_timeouts(idle_timeout: Duration, cleanup_interval: Duration) -> Self {
        Self {
            state: Mutex::new(LimiterState {
                windows: HashMap::new(),
                last_cleanup: Instant::now(),
            }),
            idle_timeout,
            cleanup_interval,
        }
    }

    /// Record a request for `identifier` unless `limit` requests already fall inside
    /// the trailing `window`.
    pub fn is_allowed(&self, identifier: &str, limit: u32, window: Duration) -> RateLimitDecision {
        let now = Instant::now();
        let mut state = self.state.lock();

        if now.duration_since(state.last_cleanup) >= self.cleanup_interval {
            Self::sweep(&mut state, now, self.idle_timeout);
        }

        let timestamps = state.windows.entry(identifier.to_string()).or_default();
        while timestamps
            .front()
            .is_some_and(|oldest| now.duration_since(*oldest) >= window)
        {
            timestamps.pop_front();
        }

        if timestamps.len() >= limit as usize {
            return RateLimitDecision::deny(limit, window);
        }

        timestamps.push_back(now);
        RateLimitDecision::allow()
    }

    fn sweep(state: &mut LimiterState, now: Instant, idle_timeout: Duration) -> usize {
        let before = state.windows.len();
        state.windows.retain(|_, timestamps| {
            timestamps
                .back()
                .is_some_and(|latest| now.duration_since(*latest) < idle_timeout)
        });
        state.last_cleanup = now;

        let removed = before - state.windows.len();
        if removed > 0 {
            tracing::debug!(removed, "Dropped idle rate limit identifiers");
        }
        removed
    }

    /// Drop idle identifiers now; returns how many were removed
    pub fn cleanup(&self) -> usize {
        let mut state = self.state.lock();
        Self::sweep(&mut state, Instant::now(), self.idle_timeout)
    }

    /// Identifiers currently tracked
    pub fn tracked_identifiers(&self) -> usize {
        self.state.lock().windows.len()
    }

    /// Forget everything
    pub fn clear(&self) {
        self.state.lock().windows.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> BasicRateLimiter {
        BasicRateLimiter::with_timeouts(Duration::from_secs(3600), Duration::from_secs(300))
    }

    #[test]
    fn test_limit_is_enforced_per_identifier() {
        let limiter = limiter();
        let window = Duration::from_secs(60);

        for _ in 0..3 {
            assert!(limiter.is_allowed("alice", 3, window).allowed);
        }
        let denied = limiter.is_allowed("alice", 3, window);
        assert!(!denied.allowed);
        assert!(denied.reason.unwrap().contains("3 requests"));

        assert!(limiter.is_allowed("bob", 3, window).allowed);
        assert_eq!(limiter.tracked_identifiers(), 2);
    }

    #[test]
    fn test_window_slides() {
        let limiter = limiter();
        let window = Duration::from_millis(50);

        assert!(limiter.is_allowed("alice", 1, window).allowed);
        assert!(!limiter.is_allowed("alice", 1, window).allowed);

        std::thread::sleep(Duration::from_millis(60));
        assert!(limiter.is_allowed("alice", 1, window).allowed);
    }

    #[test]
    fn test_zero_limit_denies() {
        assert!(!limiter().is_allowed("alice", 0, Duration::from_secs(1)).allowed);
    }

    #[test]
    fn test_idle_identifiers_are_cleaned() {
        let limiter =
            BasicRateLimiter::with_timeouts(Duration::from_millis(20), Duration::from_millis(10));
        limiter.is_allowed("alice", 5, Duration::from_secs(1));
        std::thread::sleep(Duration::from_millis(30));

        // The next call triggers the periodic sweep before recording bob
        limiter.is_allowed("bob", 5, Duration::from_secs(1));
        assert_eq!(limiter.tracked_identifiers(), 1);

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(limiter.cleanup(), 1);
        assert_eq!(limiter.tracked_identifiers(), 0);
    }
}
