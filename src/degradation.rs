//! Graceful degradation.
//!
//! The [`DegradationCoordinator`] tracks a small health state machine per named
//! service and routes calls either to the real implementation or to an in-process
//! fallback:
//!
//! ```text
//! HEALTHY ──first failed check──▶ DEGRADED ──second──▶ UNAVAILABLE
//!    ▲                               │                    │  ▲
//!    └──────────success──────────────┘     recovery loop  ▼  │ failed probe
//!    └──────────────────────────────────────────────── RECOVERING
//! ```
//!
//! A failed primary call inside [`execute_with_fallback`] moves a service straight to
//! UNAVAILABLE. While UNAVAILABLE only the fallback runs; the recovery loop probes the
//! service with exponential backoff and restores it.
//!
//! [`execute_with_fallback`]: DegradationCoordinator::execute_with_fallback

use crate::backend::{BackendManager, BackendMetrics};
use crate::config::{CacheConfig, DegradationConfig, DurationExt};
use crate::diagnostics::{AlertSeverity, PerformanceCollector};
use crate::error::{BackendFailure, SentinelError, SentinelResult};
use crate::fallback::{BasicRateLimiter, CacheStats, MemoryFallbackCache, RateLimitDecision};
use crate::supervisor::{ShutdownSignal, Supervisor, TaskKind};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

/// Name under which the backend is tracked
pub const BACKEND_SERVICE: &str = "backend";

/// Key written and read back when probing a recovering backend
const PROBE_KEY: &str = "health:probe";

/// Health of one service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceStatus {
    Healthy,
    Degraded,
    Unavailable,
    Recovering,
}

impl ServiceStatus {
    fn severity(self) -> u8 {
        match self {
            Self::Healthy => 0,
            Self::Degraded => 1,
            Self::Recovering => 2,
            Self::Unavailable => 3,
        }
    }
}

/// Which substitute is serving a service's traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FallbackMode {
    None,
    MemoryCache,
    BasicRateLimiting,
    SimplifiedProcessing,
}

/// Health record of one service; only the coordinator mutates it
#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub name: String,
    pub status: ServiceStatus,
    pub last_success: Option<SystemTime>,
    pub last_failure: Option<SystemTime>,
    /// Failures since the service was last healthy
    pub failure_count: u32,
    /// Failed recovery probes since the service was last healthy
    pub recovery_attempts: u32,
    pub fallback_mode: FallbackMode,
    pub error_message: Option<String>,
}

impl ServiceHealth {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: ServiceStatus::Healthy,
            last_success: None,
            last_failure: None,
            failure_count: 0,
            recovery_attempts: 0,
            fallback_mode: FallbackMode::None,
            error_message: None,
        }
    }

    fn since_last_failure(&self) -> Duration {
        self.last_failure
            .and_then(|at| at.elapsed().ok())
            .unwrap_or(Duration::MAX)
    }
}

/// Everything the coordinator knows, for status endpoints
#[derive(Debug, Clone, Serialize)]
pub struct DegradationReport {
    /// Worst status across services
    pub overall_status: ServiceStatus,
    pub backend_available: bool,
    pub services: Vec<ServiceHealth>,
    pub backend: BackendMetrics,
    pub cache: CacheStats,
    pub rate_limited_identifiers: usize,
    pub generated_at: SystemTime,
}

/// Health check and recovery probe for a service other than the backend
#[async_trait]
pub trait ServiceProbe: Send + Sync {
    /// Run one cheap operation that proves the service works
    async fn check(&self) -> SentinelResult<()>;
}

/// Tracks service health and serves fallbacks
pub struct DegradationCoordinator {
    backend: Arc<BackendManager>,
    config: DegradationConfig,
    cache: MemoryFallbackCache,
    limiter: BasicRateLimiter,
    services: RwLock<HashMap<String, ServiceHealth>>,
    probes: RwLock<HashMap<String, Arc<dyn ServiceProbe>>>,
    diagnostics: Option<Arc<PerformanceCollector>>,
}

impl std::fmt::Debug for DegradationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DegradationCoordinator")
            .field("backend", &self.backend)
            .field("services", &self.services.read().len())
            .finish_non_exhaustive()
    }
}

impl DegradationCoordinator {
    /// Create a coordinator tracking the backend
    pub fn new(
        backend: Arc<BackendManager>,
        config: DegradationConfig,
        cache_config: &CacheConfig,
    ) -> Self {
        let mut services = HashMap::new();
        services.insert(BACKEND_SERVICE.to_string(), ServiceHealth::new(BACKEND_SERVICE));

        Self {
            backend,
            config,
            cache: MemoryFallbackCache::new(cache_config),
            limiter: BasicRateLimiter::new(cache_config),
            services: RwLock::new(services),
            probes: RwLock::new(HashMap::new()),
            diagnostics: None,
        }
    }

    /// Report transitions to a collector
    pub fn with_diagnostics(mut self, collector: Arc<PerformanceCollector>) -> Self {
        self.diagnostics = Some(collector);
        self
    }

    /// The backend this coordinator guards
    pub fn backend(&self) -> &Arc<BackendManager> {
        &self.backend
    }

    /// The memory fallback cache
    pub fn cache(&self) -> &MemoryFallbackCache {
        &self.cache
    }

    /// Start tracking `name`, optionally with a probe used by the health and
    /// recovery loops
    pub fn register_service(&self, name: &str, probe: Option<Arc<dyn ServiceProbe>>) {
        self.services
            .write()
            .entry(name.to_string())
            .or_insert_with(|| ServiceHealth::new(name));
        if let Some(probe) = probe {
            self.probes.write().insert(name.to_string(), probe);
        }
    }

    fn status_of(&self, service: &str) -> ServiceStatus {
        if let Some(health) = self.services.read().get(service) {
            return health.status;
        }
        self.register_service(service, None);
        ServiceStatus::Healthy
    }

    fn alert(&self, severity: AlertSeverity, service: &str, message: String) {
        if let Some(diagnostics) = &self.diagnostics {
            diagnostics.raise_alert(severity, service, message);
        }
    }

    /// Soft failure: HEALTHY → DEGRADED
    pub fn mark_degraded(&self, service: &str, reason: &str) {
        let transitioned = {
            let mut services = self.services.write();
            let health = services
                .entry(service.to_string())
                .or_insert_with(|| ServiceHealth::new(service));
            health.failure_count += 1;
            health.last_failure = Some(SystemTime::now());
            health.error_message = Some(reason.to_string());
            if health.status == ServiceStatus::Healthy {
                health.status = ServiceStatus::Degraded;
                health.fallback_mode = FallbackMode::MemoryCache;
                true
            } else {
                false
            }
        };

        if transitioned {
            warn!(service, reason, "Service degraded, memory cache fallback enabled");
            self.alert(AlertSeverity::Warning, service, format!("degraded: {reason}"));
        }
    }

    /// Hard failure: any state → UNAVAILABLE
    pub fn mark_unavailable(&self, service: &str, reason: &str) {
        let previous = {
            let mut services = self.services.write();
            let health = services
                .entry(service.to_string())
                .or_insert_with(|| ServiceHealth::new(service));
            let previous = health.status;
            health.failure_count += 1;
            health.last_failure = Some(SystemTime::now());
            health.error_message = Some(reason.to_string());
            if previous == ServiceStatus::Recovering {
                health.recovery_attempts += 1;
            }
            health.status = ServiceStatus::Unavailable;
            health.fallback_mode = if service == BACKEND_SERVICE {
                FallbackMode::BasicRateLimiting
            } else {
                FallbackMode::SimplifiedProcessing
            };
            previous
        };

        if previous == ServiceStatus::Unavailable {
            debug!(service, reason, "Service still unavailable");
        } else {
            error!(service, reason, from = ?previous, "Service unavailable, using fallback");
            self.alert(AlertSeverity::Critical, service, format!("unavailable: {reason}"));
        }
    }

    fn mark_recovering(&self, service: &str) {
        if let Some(health) = self.services.write().get_mut(service) {
            health.status = ServiceStatus::Recovering;
        }
        info!(service, "Attempting service recovery");
    }

    /// Any state → HEALTHY, counters reset
    pub fn mark_healthy(&self, service: &str) {
        let previous = {
            let mut services = self.services.write();
            let health = services
                .entry(service.to_string())
                .or_insert_with(|| ServiceHealth::new(service));
            let previous = health.status;
            health.status = ServiceStatus::Healthy;
            health.last_success = Some(SystemTime::now());
            health.failure_count = 0;
            health.recovery_attempts = 0;
            health.fallback_mode = FallbackMode::None;
            health.error_message = None;
            previous
        };

        if previous != ServiceStatus::Healthy {
            info!(service, from = ?previous, "Service recovered");
            self.alert(AlertSeverity::Info, service, "recovered".to_string());
        }
    }

    fn record_success(&self, service: &str, status_before: ServiceStatus) {
        if status_before == ServiceStatus::Healthy {
            if let Some(health) = self.services.write().get_mut(service) {
                health.last_success = Some(SystemTime::now());
            }
        } else {
            self.mark_healthy(service);
        }
    }

    /// Run `primary` for `service`, falling back when the service is unavailable or
    /// the primary fails.
    pub async fn execute_with_fallback<T, P, PFut, F, FFut>(
        &self,
        service: &str,
        primary: P,
        fallback: F,
    ) -> SentinelResult<T>
    where
        P: FnOnce() -> PFut,
        PFut: Future<Output = SentinelResult<T>>,
        F: FnOnce() -> FFut,
        FFut: Future<Output = SentinelResult<T>>,
    {
        self.execute(service, primary, Some(fallback)).await
    }

    /// Like [`execute_with_fallback`](Self::execute_with_fallback) with no fallback:
    /// an unavailable service fails with [`SentinelError::ServiceUnavailable`] and
    /// primary errors propagate.
    pub async fn execute_guarded<T, P, PFut>(&self, service: &str, primary: P) -> SentinelResult<T>
    where
        P: FnOnce() -> PFut,
        PFut: Future<Output = SentinelResult<T>>,
    {
        self.execute(
            service,
            primary,
            None::<fn() -> std::future::Ready<SentinelResult<T>>>,
        )
        .await
    }

    async fn execute<T, P, PFut, F, FFut>(
        &self,
        service: &str,
        primary: P,
        fallback: Option<F>,
    ) -> SentinelResult<T>
    where
        P: FnOnce() -> PFut,
        PFut: Future<Output = SentinelResult<T>>,
        F: FnOnce() -> FFut,
        FFut: Future<Output = SentinelResult<T>>,
    {
        let status = self.status_of(service);

        if status == ServiceStatus::Unavailable {
            return match fallback {
                Some(fallback) => {
                    debug!(service, "Service unavailable, serving fallback");
                    fallback().await
                }
                None => Err(SentinelError::ServiceUnavailable {
                    service: service.to_string(),
                }),
            };
        }

        match primary().await {
            Ok(value) => {
                self.record_success(service, status);
                Ok(value)
            }
            Err(e) => {
                self.mark_unavailable(service, &e.to_string());
                match fallback {
                    Some(fallback) => fallback().await,
                    None => Err(e),
                }
            }
        }
    }

    /// Read `key` from the backend, or from the memory cache while it is down.
    pub async fn get_with_fallback(&self, key: &str) -> SentinelResult<Option<String>> {
        let backend = &self.backend;
        self.execute_with_fallback(
            BACKEND_SERVICE,
            || async move { Ok(backend.get(key).await?) },
            || async move { Ok(self.cache.get(key)) },
        )
        .await
    }

    /// Write `key` with a TTL to the backend, or to the memory cache while it is down.
    pub async fn set_with_fallback(&self, key: &str, value: &str, ttl: Duration) -> SentinelResult<()> {
        let backend = &self.backend;
        let ttl_secs = ttl.as_secs().max(1);
        self.execute_with_fallback(
            BACKEND_SERVICE,
            || async move { Ok(backend.setex(key, ttl_secs, value).await?) },
            || async move {
                self.cache.set(key, value, Some(ttl));
                Ok(())
            },
        )
        .await
    }

    /// Sliding-window rate limit: backend sorted set when available, process-local
    /// limiter otherwise.
    pub async fn rate_limit_check_with_fallback(
        &self,
        identifier: &str,
        limit: u32,
        window: Duration,
    ) -> SentinelResult<RateLimitDecision> {
        self.execute_with_fallback(
            BACKEND_SERVICE,
            || self.backend_rate_limit(identifier, limit, window),
            || async move { Ok(self.limiter.is_allowed(identifier, limit, window)) },
        )
        .await
    }

    async fn backend_rate_limit(
        &self,
        identifier: &str,
        limit: u32,
        window: Duration,
    ) -> SentinelResult<RateLimitDecision> {
        let key = self.backend.key(&format!("ratelimit:{identifier}"));
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        let window_start = now - window.as_secs_f64();

        self.backend
            .zremrangebyscore(&key, f64::NEG_INFINITY, window_start)
            .await?;
        let count = self
            .backend
            .zcount(&key, window_start, f64::INFINITY)
            .await?;
        if count >= u64::from(limit) {
            return Ok(RateLimitDecision::deny(limit, window));
        }

        let member = format!("{now:.6}:{}", uuid::Uuid::new_v4());
        self.backend.zadd(&key, &member, now).await?;
        self.backend
            .expire(&key, window.as_secs_f64().ceil() as u64 + 1)
            .await?;
        Ok(RateLimitDecision::allow())
    }

    /// Health record of one service
    pub fn get_service_status(&self, service: &str) -> Option<ServiceHealth> {
        self.services.read().get(service).cloned()
    }

    /// Whole-system view
    pub fn get_comprehensive_status(&self) -> DegradationReport {
        let mut services: Vec<ServiceHealth> = self.services.read().values().cloned().collect();
        services.sort_by(|a, b| a.name.cmp(&b.name));
        let overall_status = services
            .iter()
            .map(|s| s.status)
            .max_by_key(|s| s.severity())
            .unwrap_or(ServiceStatus::Healthy);

        DegradationReport {
            overall_status,
            backend_available: self.backend.is_available(),
            services,
            backend: self.backend.metrics(),
            cache: self.cache.stats(),
            rate_limited_identifiers: self.limiter.tracked_identifiers(),
            generated_at: SystemTime::now(),
        }
    }

    async fn probe(&self, service: &str) -> Option<bool> {
        if service == BACKEND_SERVICE {
            return Some(self.backend.is_available());
        }
        let probe = self.probes.read().get(service).cloned()?;
        Some(probe.check().await.is_ok())
    }

    /// One pass of the health loop: escalate failing services one step, restore
    /// degraded ones that pass.
    pub async fn check_health(&self) {
        let services: Vec<(String, ServiceStatus)> = self
            .services
            .read()
            .iter()
            .map(|(name, health)| (name.clone(), health.status))
            .collect();

        for (name, status) in services {
            let Some(healthy) = self.probe(&name).await else {
                continue;
            };
            match (healthy, status) {
                (false, ServiceStatus::Healthy) => self.mark_degraded(&name, "health check failed"),
                (false, ServiceStatus::Degraded) => {
                    self.mark_unavailable(&name, "health check failed repeatedly")
                }
                (true, ServiceStatus::Degraded) => self.mark_healthy(&name),
                _ => {}
            }
        }
    }

    /// One pass of the recovery loop over UNAVAILABLE services whose backoff elapsed.
    pub async fn attempt_recovery(&self) {
        let candidates: Vec<String> = self
            .services
            .read()
            .values()
            .filter(|h| h.status == ServiceStatus::Unavailable)
            .filter(|h| h.since_last_failure() >= self.config.recovery_delay(h.recovery_attempts))
            .map(|h| h.name.clone())
            .collect();

        for name in candidates {
            let has_probe = name == BACKEND_SERVICE || self.probes.read().contains_key(&name);
            self.mark_recovering(&name);
            if !has_probe {
                // The next guarded call tries the primary again
                continue;
            }

            let outcome = if name == BACKEND_SERVICE {
                self.recover_backend().await
            } else {
                let probe = self.probes.read().get(&name).cloned();
                match probe {
                    Some(probe) => probe.check().await,
                    None => continue,
                }
            };

            match outcome {
                Ok(()) => {
                    self.mark_healthy(&name);
                    if name == BACKEND_SERVICE {
                        self.cache.clear();
                        self.limiter.clear();
                    }
                }
                Err(e) => self.mark_unavailable(&name, &format!("recovery failed: {e}")),
            }
        }
    }

    async fn recover_backend(&self) -> SentinelResult<()> {
        self.backend.initialize().await?;
        let key = self.backend.key(PROBE_KEY);
        self.backend.setex(&key, 10, "ok").await?;
        match self.backend.get(&key).await? {
            Some(value) if value == "ok" => Ok(()),
            _ => Err(BackendFailure::protocol("recovery probe read back a different value").into()),
        }
    }

    /// Spawn the health and recovery loops under `supervisor`
    pub fn spawn_monitors(self: &Arc<Self>, supervisor: &Supervisor) {
        supervisor.spawn(
            "degradation-health",
            TaskKind::Monitor,
            Arc::clone(self).run_health_monitor(supervisor.signal()),
        );
        supervisor.spawn(
            "degradation-recovery",
            TaskKind::Monitor,
            Arc::clone(self).run_recovery_monitor(supervisor.signal()),
        );
    }

    async fn run_health_monitor(self: Arc<Self>, mut shutdown: ShutdownSignal) {
        let mut ticker = interval(self.config.health_check_interval_secs.max(1).secs());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.check_health().await,
            }
        }
        debug!("Degradation health monitor stopped");
    }

    async fn run_recovery_monitor(self: Arc<Self>, mut shutdown: ShutdownSignal) {
        let mut ticker = interval(self.config.recovery_check_interval_secs.max(1).secs());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.attempt_recovery().await,
            }
        }
        debug!("Degradation recovery monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendClient, InMemoryBackend, MemoryConnector};
    use crate::config::SentinelConfig;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio_test::{assert_err, assert_ok};

    async fn setup(degradation: DegradationConfig) -> (DegradationCoordinator, Arc<InMemoryBackend>) {
        let config = SentinelConfig::testing();
        let connector = MemoryConnector::new();
        let node = connector.backend();
        let manager = Arc::new(BackendManager::new(
            config.backend.clone(),
            &config.circuit_breaker,
            Arc::new(connector),
        ));
        assert_ok!(manager.initialize().await);
        (
            DegradationCoordinator::new(manager, degradation, &config.cache),
            node,
        )
    }

    fn immediate_recovery() -> DegradationConfig {
        DegradationConfig {
            max_backoff_delay_secs: 0,
            ..SentinelConfig::testing().degradation
        }
    }

    struct FlagProbe(AtomicBool);

    #[async_trait]
    impl ServiceProbe for FlagProbe {
        async fn check(&self) -> SentinelResult<()> {
            if self.0.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(SentinelError::handler("probe failed"))
            }
        }
    }

    #[tokio::test]
    async fn test_round_trip_with_healthy_backend() {
        let (coordinator, node) = setup(SentinelConfig::testing().degradation).await;

        assert_ok!(coordinator.set_with_fallback("k", "v", Duration::from_secs(60)).await);
        assert_eq!(
            assert_ok!(coordinator.get_with_fallback("k").await),
            Some("v".to_string())
        );
        assert_eq!(assert_ok!(node.get("k").await), Some("v".to_string()));
        assert!(coordinator.cache().is_empty());
        assert_eq!(
            coordinator.get_service_status(BACKEND_SERVICE).unwrap().status,
            ServiceStatus::Healthy
        );
    }

    #[tokio::test]
    async fn test_round_trip_with_backend_down() {
        let (coordinator, node) = setup(SentinelConfig::testing().degradation).await;
        node.set_available(false);

        assert_ok!(coordinator.set_with_fallback("k", "v", Duration::from_secs(60)).await);
        assert_eq!(
            assert_ok!(coordinator.get_with_fallback("k").await),
            Some("v".to_string())
        );

        let health = coordinator.get_service_status(BACKEND_SERVICE).unwrap();
        assert_eq!(health.status, ServiceStatus::Unavailable);
        assert_eq!(health.fallback_mode, FallbackMode::BasicRateLimiting);
        assert!(health.error_message.is_some());
        assert_eq!(coordinator.cache().len(), 1);

        node.set_available(true);
        assert_eq!(assert_ok!(node.get("k").await), None);
    }

    #[tokio::test]
    async fn test_unavailable_service_skips_primary() {
        let (coordinator, _node) = setup(SentinelConfig::testing().degradation).await;
        let calls = AtomicUsize::new(0);

        coordinator.mark_unavailable("llm", "quota exhausted");
        let result: SentinelResult<()> = coordinator
            .execute_guarded("llm", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(SentinelError::ServiceUnavailable { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let value = coordinator
            .execute_with_fallback(
                "llm",
                || async { Ok("primary") },
                || async { Ok("fallback") },
            )
            .await;
        assert_eq!(assert_ok!(value), "fallback");
    }

    #[tokio::test]
    async fn test_primary_failure_without_fallback_propagates() {
        let (coordinator, _node) = setup(SentinelConfig::testing().degradation).await;

        let result: SentinelResult<()> = coordinator
            .execute_guarded("llm", || async { Err(SentinelError::handler("boom")) })
            .await;
        assert!(matches!(result, Err(SentinelError::HandlerFailed { .. })));
        assert_eq!(
            coordinator.get_service_status("llm").unwrap().fallback_mode,
            FallbackMode::SimplifiedProcessing
        );
    }

    #[tokio::test]
    async fn test_health_checks_escalate_and_restore() {
        let (coordinator, _node) = setup(SentinelConfig::testing().degradation).await;
        let probe = Arc::new(FlagProbe(AtomicBool::new(false)));
        coordinator.register_service("llm", Some(probe.clone()));

        coordinator.check_health().await;
        let health = coordinator.get_service_status("llm").unwrap();
        assert_eq!(health.status, ServiceStatus::Degraded);
        assert_eq!(health.fallback_mode, FallbackMode::MemoryCache);

        probe.0.store(true, Ordering::SeqCst);
        coordinator.check_health().await;
        assert_eq!(
            coordinator.get_service_status("llm").unwrap().status,
            ServiceStatus::Healthy
        );

        probe.0.store(false, Ordering::SeqCst);
        coordinator.check_health().await;
        coordinator.check_health().await;
        assert_eq!(
            coordinator.get_service_status("llm").unwrap().status,
            ServiceStatus::Unavailable
        );
        // The backend is fine throughout
        assert_eq!(
            coordinator.get_service_status(BACKEND_SERVICE).unwrap().status,
            ServiceStatus::Healthy
        );
    }

    #[tokio::test]
    async fn test_backend_recovery_clears_cache() {
        let (coordinator, node) = setup(immediate_recovery()).await;
        node.set_available(false);
        assert_ok!(coordinator.set_with_fallback("k", "cached", Duration::from_secs(60)).await);
        assert_eq!(coordinator.cache().len(), 1);

        // Still down: the probe fails and the attempt is counted
        coordinator.attempt_recovery().await;
        let health = coordinator.get_service_status(BACKEND_SERVICE).unwrap();
        assert_eq!(health.status, ServiceStatus::Unavailable);
        assert_eq!(health.recovery_attempts, 1);

        node.set_available(true);
        coordinator.attempt_recovery().await;
        let health = coordinator.get_service_status(BACKEND_SERVICE).unwrap();
        assert_eq!(health.status, ServiceStatus::Healthy);
        assert_eq!(health.recovery_attempts, 0);
        assert!(coordinator.cache().is_empty());
        assert!(coordinator.backend().is_available());
    }

    #[tokio::test]
    async fn test_recovery_waits_for_backoff() {
        let (coordinator, _node) = setup(SentinelConfig::testing().degradation).await;
        coordinator.mark_unavailable("llm", "down");
        coordinator.register_service("llm", Some(Arc::new(FlagProbe(AtomicBool::new(true)))));

        // testing() backoff is 1s; the failure just happened
        coordinator.attempt_recovery().await;
        assert_eq!(
            coordinator.get_service_status("llm").unwrap().status,
            ServiceStatus::Unavailable
        );
    }

    #[tokio::test]
    async fn test_probeless_service_recovers_on_next_success() {
        let (coordinator, _node) = setup(immediate_recovery()).await;
        coordinator.mark_unavailable("llm", "down");

        coordinator.attempt_recovery().await;
        assert_eq!(
            coordinator.get_service_status("llm").unwrap().status,
            ServiceStatus::Recovering
        );

        let value = coordinator.execute_guarded("llm", || async { Ok(42) }).await;
        assert_eq!(assert_ok!(value), 42);
        assert_eq!(
            coordinator.get_service_status("llm").unwrap().status,
            ServiceStatus::Healthy
        );
    }

    #[tokio::test]
    async fn test_failed_call_while_recovering_counts_attempt() {
        let (coordinator, _node) = setup(immediate_recovery()).await;
        coordinator.mark_unavailable("llm", "down");
        coordinator.attempt_recovery().await;

        let result: SentinelResult<()> = coordinator
            .execute_guarded("llm", || async { Err(SentinelError::handler("still down")) })
            .await;
        assert_err!(result);
        let health = coordinator.get_service_status("llm").unwrap();
        assert_eq!(health.status, ServiceStatus::Unavailable);
        assert_eq!(health.recovery_attempts, 1);
    }

    #[tokio::test]
    async fn test_rate_limit_uses_backend_then_local_limiter() {
        let (coordinator, node) = setup(SentinelConfig::testing().degradation).await;
        let window = Duration::from_secs(60);

        for _ in 0..2 {
            assert!(assert_ok!(coordinator.rate_limit_check_with_fallback("+15550001", 2, window).await).allowed);
        }
        let denied = assert_ok!(coordinator.rate_limit_check_with_fallback("+15550001", 2, window).await);
        assert!(!denied.allowed);
        assert!(denied.reason.is_some());
        assert_eq!(
            assert_ok!(node.zcount("sentinelq:ratelimit:+15550001", f64::NEG_INFINITY, f64::INFINITY).await),
            2
        );

        node.set_available(false);
        // The local limiter starts from an empty window
        assert!(assert_ok!(coordinator.rate_limit_check_with_fallback("+15550001", 2, window).await).allowed);
        assert_eq!(
            coordinator.get_service_status(BACKEND_SERVICE).unwrap().status,
            ServiceStatus::Unavailable
        );
    }

    #[tokio::test]
    async fn test_comprehensive_status_reports_worst_service() {
        let (coordinator, _node) = setup(SentinelConfig::testing().degradation).await;
        let collector = Arc::new(PerformanceCollector::new());
        let coordinator = coordinator.with_diagnostics(Arc::clone(&collector));

        coordinator.mark_degraded("pdf", "slow");
        let report = coordinator.get_comprehensive_status();
        assert_eq!(report.overall_status, ServiceStatus::Degraded);
        assert_eq!(report.services.len(), 2);
        assert!(report.backend_available);

        coordinator.mark_unavailable("llm", "down");
        assert_eq!(
            coordinator.get_comprehensive_status().overall_status,
            ServiceStatus::Unavailable
        );
        assert_eq!(collector.snapshot().total_alerts, 2);

        let json = serde_json::to_value(coordinator.get_comprehensive_status()).unwrap();
        assert_eq!(json["overall_status"], "UNAVAILABLE");
    }
}
