//! # Circuit Breaker
//!
//! Classic three-state breaker: Closed (calls flow), Open (calls fail fast without
//! running) and Half-Open (one trial call decides between the two). Failures in the
//! closed state are forgiven one at a time by later successes, so a dependency that
//! fails occasionally never trips the breaker while one that keeps failing does.

use crate::config::CircuitBreakerConfig;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation - all calls are allowed through
    Closed,
    /// Failure mode - all calls fail fast without executing
    Open,
    /// Testing recovery - a single trial call is in flight or allowed
    HalfOpen,
}

/// Errors returned by [`CircuitBreaker::call`]
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open, the operation was not invoked
    #[error("Circuit breaker is open for {component}")]
    CircuitOpen {
        /// Breaker name
        component: String,
    },

    /// Operation ran and failed; the failure was recorded
    #[error("Operation failed: {0}")]
    OperationFailed(E),
}

/// Point-in-time view of a breaker for dashboards
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerSnapshot {
    /// Breaker name
    pub name: String,
    /// Current state
    pub state: CircuitState,
    /// Current (forgiving) failure count
    pub failure_count: u32,
    /// Seconds since the last recorded failure
    pub secs_since_last_failure: Option<f64>,
    /// Calls that reached the operation
    pub total_calls: u64,
    /// Calls rejected without running
    pub rejected_calls: u64,
    /// Times the breaker moved to open
    pub times_opened: u64,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure_time: Option<Instant>,
    trial_in_flight: bool,
    total_calls: u64,
    rejected_calls: u64,
    times_opened: u64,
}

/// Guards calls into an unreliable dependency.
///
/// All reads and writes of the state happen under one lock, taken once before the
/// call (admission) and once after it (recording). The lock is never held while the
/// operation runs.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    timeout: Duration,
    inner: Mutex<BreakerState>,
}

#[derive(Debug, Clone, Copy)]
enum Admission {
    Normal,
    Trial,
}

/// A call the breaker let through. Dropping it unsettled (the caller's future was
/// cancelled) releases a half-open trial and counts it as failed.
struct AdmissionGuard<'a> {
    breaker: &'a CircuitBreaker,
    admission: Admission,
    settled: bool,
}

impl AdmissionGuard<'_> {
    fn succeeded(mut self) {
        self.settled = true;
        self.breaker.record_success(self.admission);
    }

    fn failed(mut self) {
        self.settled = true;
        self.breaker.record_failure(self.admission);
    }
}

impl Drop for AdmissionGuard<'_> {
    fn drop(&mut self) {
        if self.settled || !matches!(self.admission, Admission::Trial) {
            return;
        }
        warn!(component = %self.breaker.name, "Half-open trial cancelled, reopening circuit");
        self.breaker.record_failure(self.admission);
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given name and configuration
    pub fn new(name: impl Into<String>, config: &CircuitBreakerConfig) -> Self {
        let name = name.into();
        info!(
            component = %name,
            failure_threshold = config.failure_threshold,
            timeout_ms = config.timeout_ms,
            "Circuit breaker initialized"
        );

        Self {
            name,
            failure_threshold: config.failure_threshold.max(1),
            timeout: config.timeout(),
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure_time: None,
                trial_in_flight: false,
                total_calls: 0,
                rejected_calls: 0,
                times_opened: 0,
            }),
        }
    }

    /// Breaker name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current circuit state
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Current failure count
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    /// Execute an operation with circuit breaker protection
    pub async fn call<F, T, E, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let guard = match self.admit() {
            Some(admission) => AdmissionGuard {
                breaker: self,
                admission,
                settled: false,
            },
            None => {
                return Err(CircuitBreakerError::CircuitOpen {
                    component: self.name.clone(),
                });
            }
        };

        let result = operation().await;

        match &result {
            Ok(_) => guard.succeeded(),
            Err(_) => guard.failed(),
        }

        result.map_err(CircuitBreakerError::OperationFailed)
    }

    fn admit(&self) -> Option<Admission> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.total_calls += 1;
                Some(Admission::Normal)
            }
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure_time
                    .map_or(Duration::MAX, |at| at.elapsed());
                if elapsed >= self.timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    inner.total_calls += 1;
                    info!(component = %self.name, "Circuit breaker half-open (testing recovery)");
                    Some(Admission::Trial)
                } else {
                    inner.rejected_calls += 1;
                    None
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    inner.rejected_calls += 1;
                    None
                } else {
                    inner.trial_in_flight = true;
                    inner.total_calls += 1;
                    Some(Admission::Trial)
                }
            }
        }
    }

    fn record_success(&self, admission: Admission) {
        let mut inner = self.inner.lock();
        if matches!(admission, Admission::Trial) {
            inner.trial_in_flight = false;
        }

        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.failure_count = 0;
                info!(component = %self.name, "Circuit breaker closed (recovered)");
            }
            CircuitState::Closed => {
                inner.failure_count = inner.failure_count.saturating_sub(1);
            }
            // A call admitted while closed finished after the breaker opened.
            CircuitState::Open => {
                debug!(component = %self.name, "Late success recorded while circuit is open");
            }
        }
    }

    fn record_failure(&self, admission: Admission) {
        let mut inner = self.inner.lock();
        if matches!(admission, Admission::Trial) {
            inner.trial_in_flight = false;
        }

        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure_time = Some(Instant::now());

        let trial_failed = inner.state == CircuitState::HalfOpen;
        if inner.failure_count >= self.failure_threshold || trial_failed {
            if inner.state != CircuitState::Open {
                inner.times_opened += 1;
                error!(
                    component = %self.name,
                    failure_count = inner.failure_count,
                    failure_threshold = self.failure_threshold,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Circuit breaker opened (failing fast)"
                );
            }
            inner.state = CircuitState::Open;
        }
    }

    /// Force the circuit open (operator action)
    pub fn force_open(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Open;
        inner.last_failure_time = Some(Instant::now());
        inner.times_opened += 1;
        error!(component = %self.name, "Circuit breaker forced open");
    }

    /// Force the circuit closed and forget past failures (operator action)
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.trial_in_flight = false;
        info!(component = %self.name, "Circuit breaker reset");
    }

    /// Snapshot for status reporting
    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let inner = self.inner.lock();
        CircuitBreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            secs_since_last_failure: inner.last_failure_time.map(|at| at.elapsed().as_secs_f64()),
            total_calls: inner.total_calls,
            rejected_calls: inner.rejected_calls,
            times_opened: inner.times_opened,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    fn breaker(threshold: u32, timeout_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            &CircuitBreakerConfig {
                failure_threshold: threshold,
                timeout_ms,
            },
        )
    }

    async fn fail(cb: &CircuitBreaker, calls: &AtomicUsize) -> Result<(), CircuitBreakerError<&'static str>> {
        cb.call(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>("boom")
        })
        .await
    }

    async fn succeed(cb: &CircuitBreaker, calls: &AtomicUsize) -> Result<(), CircuitBreakerError<&'static str>> {
        cb.call(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<(), &'static str>(())
        })
        .await
    }

    #[tokio::test]
    async fn test_normal_operation() {
        let cb = breaker(3, 100);
        let calls = AtomicUsize::new(0);

        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(succeed(&cb, &calls).await.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cb.snapshot().total_calls, 1);
    }

    #[tokio::test]
    async fn test_opens_at_threshold_and_fails_fast() {
        let cb = breaker(3, 10_000);
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let result = fail(&cb, &calls).await;
            assert!(matches!(result, Err(CircuitBreakerError::OperationFailed("boom"))));
        }
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        for _ in 0..5 {
            let result = succeed(&cb, &calls).await;
            assert!(matches!(result, Err(CircuitBreakerError::CircuitOpen { .. })));
        }
        // The wrapped function never ran while open
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(cb.snapshot().rejected_calls, 5);
    }

    #[tokio::test]
    async fn test_success_forgives_one_failure() {
        let cb = breaker(3, 10_000);
        let calls = AtomicUsize::new(0);

        let _ = fail(&cb, &calls).await;
        let _ = fail(&cb, &calls).await;
        assert_eq!(cb.failure_count(), 2);

        let _ = succeed(&cb, &calls).await;
        assert_eq!(cb.failure_count(), 1);

        let _ = fail(&cb, &calls).await;
        assert_eq!(cb.state(), CircuitState::Closed);
        let _ = fail(&cb, &calls).await;
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_half_open_success_closes() {
        let cb = breaker(1, 50);
        let calls = AtomicUsize::new(0);

        let _ = fail(&cb, &calls).await;
        assert_eq!(cb.state(), CircuitState::Open);

        sleep(Duration::from_millis(70)).await;

        assert!(succeed(&cb, &calls).await.is_ok());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let cb = breaker(2, 50);
        let calls = AtomicUsize::new(0);

        let _ = fail(&cb, &calls).await;
        let _ = fail(&cb, &calls).await;
        assert_eq!(cb.state(), CircuitState::Open);

        sleep(Duration::from_millis(70)).await;

        assert!(fail(&cb, &calls).await.is_err());
        assert_eq!(cb.state(), CircuitState::Open);

        // Timer restarted by the failed trial
        assert!(matches!(
            succeed(&cb, &calls).await,
            Err(CircuitBreakerError::CircuitOpen { .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_single_trial_while_half_open() {
        let cb = std::sync::Arc::new(breaker(1, 20));
        let calls = AtomicUsize::new(0);
        let _ = fail(&cb, &calls).await;
        sleep(Duration::from_millis(30)).await;

        let slow = {
            let cb = cb.clone();
            tokio::spawn(async move {
                cb.call(|| async {
                    sleep(Duration::from_millis(100)).await;
                    Ok::<_, &'static str>("trial")
                })
                .await
                .is_ok()
            })
        };
        sleep(Duration::from_millis(20)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let concurrent = succeed(&cb, &calls).await;
        assert!(matches!(concurrent, Err(CircuitBreakerError::CircuitOpen { .. })));

        assert!(slow.await.unwrap());
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_cancelled_trial_releases_half_open() {
        let cb = breaker(1, 50);
        let calls = AtomicUsize::new(0);
        assert!(fail(&cb, &calls).await.is_err());
        assert_eq!(cb.state(), CircuitState::Open);

        sleep(Duration::from_millis(60)).await;
        let cancelled = tokio::time::timeout(
            Duration::from_millis(5),
            cb.call(|| async {
                sleep(Duration::from_secs(1)).await;
                Ok::<(), &'static str>(())
            }),
        )
        .await;
        assert!(cancelled.is_err());
        assert_eq!(cb.state(), CircuitState::Open);

        sleep(Duration::from_millis(60)).await;
        assert!(succeed(&cb, &calls).await.is_ok());
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_force_operations() {
        let cb = breaker(5, 60_000);
        cb.force_open();
        assert_eq!(cb.state(), CircuitState::Open);
        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
    }
}
