//! Backend connection manager.
//!
//! Owns the primary connection and any replicas, resolves a healthy connection for
//! every command through a circuit breaker, enforces per-command deadlines and keeps
//! the `is_available()` flag every upstream component branches on.

use super::{BackendConnector, SharedClient, redact_url, validate_url};
use crate::config::{BackendConfig, CircuitBreakerConfig, DurationExt};
use crate::error::{BackendFailure, BackendResult, SentinelResult};
use crate::resilience::{CircuitBreaker, CircuitBreakerError, CircuitBreakerSnapshot};
use crate::supervisor::ShutdownSignal;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::time::{MissedTickBehavior, interval, timeout};
use tracing::{debug, error, info, warn};

/// Exponential moving average weight kept from the previous value
const EMA_KEEP: f64 = 0.9;

#[derive(Debug, Default)]
struct MetricsState {
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    average_latency_ms: Option<f64>,
    active_connections: u32,
    peak_connections: u32,
    fallback_activations: u64,
    last_error: Option<String>,
}

/// Snapshot of the manager's health and traffic counters
#[derive(Debug, Clone, Serialize)]
pub struct BackendMetrics {
    /// Commands that reached connection resolution
    pub total_requests: u64,
    /// Commands that completed
    pub successful_requests: u64,
    /// Commands that failed for any reason
    pub failed_requests: u64,
    /// Rolling average command latency
    pub average_latency_ms: f64,
    /// Successful / total, in percent (100 when idle)
    pub uptime_percentage: f64,
    /// Commands in flight right now
    pub active_connections: u32,
    /// Highest number of commands ever in flight at once
    pub peak_connections: u32,
    /// Times the manager entered fallback mode
    pub fallback_activations: u64,
    /// Whether `initialize()` has succeeded at least once
    pub initialized: bool,
    /// Whether commands are currently short-circuited
    pub fallback_mode: bool,
    /// Redacted primary URL
    pub primary_url: String,
    /// Connected replicas
    pub replica_count: usize,
    /// Last failure message, if any
    pub last_error: Option<String>,
    /// Breaker guarding connection resolution
    pub circuit_breaker: CircuitBreakerSnapshot,
    /// Seconds since the manager was created
    pub uptime_secs: u64,
}

/// Owns the backend connections; all backend traffic goes through here
pub struct BackendManager {
    config: BackendConfig,
    connector: Arc<dyn BackendConnector>,
    breaker: CircuitBreaker,
    primary: RwLock<Option<SharedClient>>,
    replicas: RwLock<Vec<(String, SharedClient)>>,
    initialized: AtomicBool,
    fallback_mode: AtomicBool,
    last_health_check: Mutex<Option<(Instant, bool)>>,
    metrics: Mutex<MetricsState>,
    created_at: Instant,
}

impl std::fmt::Debug for BackendManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendManager")
            .field("url", &redact_url(&self.config.url))
            .field("initialized", &self.initialized.load(Ordering::Relaxed))
            .field("fallback_mode", &self.fallback_mode.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

struct InFlight<'a>(&'a Mutex<MetricsState>);

impl<'a> InFlight<'a> {
    fn enter(metrics: &'a Mutex<MetricsState>) -> Self {
        let mut m = metrics.lock();
        m.active_connections += 1;
        m.peak_connections = m.peak_connections.max(m.active_connections);
        Self(metrics)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut m = self.0.lock();
        m.active_connections = m.active_connections.saturating_sub(1);
    }
}

impl BackendManager {
    /// Create a manager; no connection is made until [`initialize`](Self::initialize)
    pub fn new(
        config: BackendConfig,
        breaker_config: &CircuitBreakerConfig,
        connector: Arc<dyn BackendConnector>,
    ) -> Self {
        Self {
            config,
            connector,
            breaker: CircuitBreaker::new("backend", breaker_config),
            primary: RwLock::new(None),
            replicas: RwLock::new(Vec::new()),
            initialized: AtomicBool::new(false),
            fallback_mode: AtomicBool::new(false),
            last_health_check: Mutex::new(None),
            metrics: Mutex::new(MetricsState::default()),
            created_at: Instant::now(),
        }
    }

    /// Backend configuration
    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Build a key under the configured prefix
    pub fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.config.key_prefix, suffix)
    }

    /// Connect the primary (and replicas).
    ///
    /// Any failure leaves the manager in fallback mode. Malformed URLs are rejected
    /// before the connector is touched.
    pub async fn initialize(&self) -> SentinelResult<()> {
        if let Err(e) = validate_url(&self.config.url) {
            self.enter_fallback("invalid primary URL");
            return Err(e);
        }
        for replica in &self.config.replica_urls {
            if let Err(e) = validate_url(replica) {
                self.enter_fallback("invalid replica URL");
                return Err(e);
            }
        }

        let connect_timeout = self.config.connection_timeout_ms.millis();
        let redacted = redact_url(&self.config.url);
        info!(url = %redacted, replicas = self.config.replica_urls.len(), "Initializing backend connection");

        let primary = match self.connect_and_ping(&self.config.url, connect_timeout).await {
            Ok(client) => client,
            Err(failure) => {
                error!(url = %redacted, error = %failure, "Backend initialization failed");
                self.metrics.lock().last_error = Some(failure.to_string());
                self.enter_fallback("initialization failed");
                return Err(failure.into());
            }
        };

        let mut replicas = Vec::new();
        for url in &self.config.replica_urls {
            match self.connect_and_ping(url, connect_timeout).await {
                Ok(client) => replicas.push((redact_url(url), client)),
                Err(failure) => {
                    warn!(url = %redact_url(url), error = %failure, "Replica unavailable, skipping");
                }
            }
        }

        *self.primary.write() = Some(primary);
        *self.replicas.write() = replicas;
        *self.last_health_check.lock() = Some((Instant::now(), true));
        self.initialized.store(true, Ordering::SeqCst);
        self.exit_fallback("initialized");

        Ok(())
    }

    async fn connect_and_ping(&self, url: &str, connect_timeout: Duration) -> BackendResult<SharedClient> {
        let client = timeout(connect_timeout, self.connector.connect(url, connect_timeout))
            .await
            .map_err(|_| BackendFailure::Timeout {
                timeout_ms: connect_timeout.as_millis() as u64,
            })??;

        timeout(connect_timeout, client.ping())
            .await
            .map_err(|_| BackendFailure::Timeout {
                timeout_ms: connect_timeout.as_millis() as u64,
            })??;

        Ok(client)
    }

    /// `initialized && !fallback_mode`
    pub fn is_available(&self) -> bool {
        self.initialized.load(Ordering::SeqCst) && !self.fallback_mode.load(Ordering::SeqCst)
    }

    /// Whether commands are currently short-circuited
    pub fn is_fallback_mode(&self) -> bool {
        self.fallback_mode.load(Ordering::SeqCst)
    }

    /// Switch to fallback mode; returns `true` on the transition
    pub fn enter_fallback(&self, reason: &str) -> bool {
        let entered = !self.fallback_mode.swap(true, Ordering::SeqCst);
        if entered {
            self.metrics.lock().fallback_activations += 1;
            warn!(reason, "Backend entering fallback mode");
        }
        entered
    }

    fn exit_fallback(&self, reason: &str) {
        if self.fallback_mode.swap(false, Ordering::SeqCst) {
            info!(reason, "Backend recovered, leaving fallback mode");
        }
    }

    /// Resolve a healthy connection: cached-healthy primary, pinged primary, then
    /// replicas with a fast ping.
    pub async fn get_connection(&self) -> BackendResult<SharedClient> {
        let primary = self.primary.read().clone();
        let Some(primary) = primary else {
            return Err(BackendFailure::unavailable("backend not initialized"));
        };

        let cache_ttl = self.config.health_cache_ttl_ms.millis();
        let cached_healthy = matches!(
            *self.last_health_check.lock(),
            Some((at, true)) if at.elapsed() < cache_ttl
        );
        if cached_healthy {
            return Ok(primary);
        }

        let ping_timeout = self.config.command_timeout_ms.millis();
        let healthy = matches!(timeout(ping_timeout, primary.ping()).await, Ok(Ok(())));
        *self.last_health_check.lock() = Some((Instant::now(), healthy));
        if healthy {
            return Ok(primary);
        }

        let replicas = self.replicas.read().clone();
        let fast_ping = self.config.replica_ping_timeout_ms.millis();
        for (url, replica) in replicas {
            if matches!(timeout(fast_ping, replica.ping()).await, Ok(Ok(()))) {
                debug!(replica = %url, "Primary unhealthy, using replica");
                return Ok(replica);
            }
        }

        Err(BackendFailure::unavailable("no healthy connection"))
    }

    /// Run one backend command.
    ///
    /// Connection resolution goes through the circuit breaker and the command runs
    /// under the per-command deadline. Failures come back as a tagged
    /// [`BackendFailure`]; a timeout additionally switches the manager into fallback
    /// mode.
    pub async fn execute_command<T, F, Fut>(&self, op: &str, command: F) -> BackendResult<T>
    where
        F: FnOnce(SharedClient) -> Fut,
        Fut: Future<Output = BackendResult<T>>,
    {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(BackendFailure::unavailable("backend not initialized"));
        }
        if self.is_fallback_mode() {
            return Err(BackendFailure::unavailable("backend in fallback mode"));
        }

        self.metrics.lock().total_requests += 1;
        let _in_flight = InFlight::enter(&self.metrics);
        let started = Instant::now();

        let client = match self.breaker.call(|| self.get_connection()).await {
            Ok(client) => client,
            Err(CircuitBreakerError::CircuitOpen { component }) => {
                let failure = BackendFailure::CircuitOpen { component };
                self.record_failure(op, &failure);
                return Err(failure);
            }
            Err(CircuitBreakerError::OperationFailed(failure)) => {
                self.record_failure(op, &failure);
                return Err(failure);
            }
        };

        let command_timeout = self.config.command_timeout_ms.millis();
        match timeout(command_timeout, command(client)).await {
            Ok(Ok(value)) => {
                self.record_success(started.elapsed());
                Ok(value)
            }
            Ok(Err(failure)) => {
                self.record_failure(op, &failure);
                Err(failure)
            }
            Err(_) => {
                let failure = BackendFailure::Timeout {
                    timeout_ms: self.config.command_timeout_ms,
                };
                self.record_failure(op, &failure);
                self.enter_fallback("command timeout");
                Err(failure)
            }
        }
    }

    fn record_success(&self, latency: Duration) {
        let latency_ms = latency.as_secs_f64() * 1000.0;
        let mut m = self.metrics.lock();
        m.successful_requests += 1;
        m.average_latency_ms = Some(match m.average_latency_ms {
            Some(avg) => avg * EMA_KEEP + latency_ms * (1.0 - EMA_KEEP),
            None => latency_ms,
        });
    }

    fn record_failure(&self, op: &str, failure: &BackendFailure) {
        warn!(op, error = %failure, "Backend command failed");
        let mut m = self.metrics.lock();
        m.failed_requests += 1;
        m.last_error = Some(format!("{op}: {failure}"));
    }

    /// Ping the primary directly; success leaves fallback mode, failure enters it.
    pub async fn health_check(&self) -> bool {
        let primary = self.primary.read().clone();
        let Some(primary) = primary else {
            // Never connected: a health check is a reconnection attempt.
            return self.initialize().await.is_ok();
        };

        let ping_timeout = self.config.command_timeout_ms.millis();
        let healthy = matches!(timeout(ping_timeout, primary.ping()).await, Ok(Ok(())));
        *self.last_health_check.lock() = Some((Instant::now(), healthy));

        if healthy {
            self.exit_fallback("health check succeeded");
        } else {
            self.enter_fallback("health check failed");
        }
        healthy
    }

    /// Periodic health check until shutdown
    pub async fn run_health_monitor(self: Arc<Self>, mut shutdown: ShutdownSignal) {
        let period = self.config.health_check_interval_secs.max(1).secs();
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        info!(interval_secs = period.as_secs(), "Backend health monitor started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let healthy = self.health_check().await;
                    debug!(healthy, "Backend health check");
                }
            }
        }
        info!("Backend health monitor stopped");
    }

    /// Metrics snapshot
    pub fn metrics(&self) -> BackendMetrics {
        let m = self.metrics.lock();
        let uptime_percentage = if m.total_requests == 0 {
            100.0
        } else {
            m.successful_requests as f64 / m.total_requests as f64 * 100.0
        };

        BackendMetrics {
            total_requests: m.total_requests,
            successful_requests: m.successful_requests,
            failed_requests: m.failed_requests,
            average_latency_ms: m.average_latency_ms.unwrap_or(0.0),
            uptime_percentage,
            active_connections: m.active_connections,
            peak_connections: m.peak_connections,
            fallback_activations: m.fallback_activations,
            initialized: self.initialized.load(Ordering::SeqCst),
            fallback_mode: self.is_fallback_mode(),
            primary_url: redact_url(&self.config.url),
            replica_count: self.replicas.read().len(),
            last_error: m.last_error.clone(),
            circuit_breaker: self.breaker.snapshot(),
            uptime_secs: self.created_at.elapsed().as_secs(),
        }
    }

    /// The breaker guarding connection resolution
    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// `GET`; `Ok(None)` when the key is missing
    pub async fn get(&self, key: &str) -> BackendResult<Option<String>> {
        self.execute_command("GET", |c| async move { c.get(key).await })
            .await
    }

    /// `SET` without expiry
    pub async fn set(&self, key: &str, value: &str) -> BackendResult<()> {
        self.execute_command("SET", |c| async move { c.set(key, value).await })
            .await
    }

    /// `SETEX`: write with a TTL in seconds
    pub async fn setex(&self, key: &str, ttl_secs: u64, value: &str) -> BackendResult<()> {
        self.execute_command("SETEX", |c| async move { c.setex(key, ttl_secs, value).await })
            .await
    }

    /// `DEL`; returns the number of keys removed
    pub async fn del(&self, key: &str) -> BackendResult<u64> {
        self.execute_command("DEL", |c| async move { c.del(key).await })
            .await
    }

    /// `LPUSH` onto the producer end; returns the new length
    pub async fn lpush(&self, key: &str, value: &str) -> BackendResult<u64> {
        self.execute_command("LPUSH", |c| async move { c.lpush(key, value).await })
            .await
    }

    /// `RPOP` from the consumer end
    pub async fn rpop(&self, key: &str) -> BackendResult<Option<String>> {
        self.execute_command("RPOP", |c| async move { c.rpop(key).await })
            .await
    }

    /// `LLEN`
    pub async fn llen(&self, key: &str) -> BackendResult<u64> {
        self.execute_command("LLEN", |c| async move { c.llen(key).await })
            .await
    }

    /// `ZADD` one member; returns the number of new members
    pub async fn zadd(&self, key: &str, member: &str, score: f64) -> BackendResult<u64> {
        self.execute_command("ZADD", |c| async move { c.zadd(key, member, score).await })
            .await
    }

    /// `ZCOUNT` over the inclusive score range
    pub async fn zcount(&self, key: &str, min: f64, max: f64) -> BackendResult<u64> {
        self.execute_command("ZCOUNT", |c| async move { c.zcount(key, min, max).await })
            .await
    }

    /// `ZREMRANGEBYSCORE`; returns the number of members removed
    pub async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> BackendResult<u64> {
        self.execute_command("ZREMRANGEBYSCORE", |c| async move {
            c.zremrangebyscore(key, min, max).await
        })
        .await
    }

    /// `EXPIRE`; `false` when the key does not exist
    pub async fn expire(&self, key: &str, ttl_secs: u64) -> BackendResult<bool> {
        self.execute_command("EXPIRE", |c| async move { c.expire(key, ttl_secs).await })
            .await
    }

    /// `PING` through the breaker and command timeout
    pub async fn ping(&self) -> BackendResult<()> {
        self.execute_command("PING", |c| async move { c.ping().await })
            .await
    }

    /// `INFO` server report
    pub async fn info(&self) -> BackendResult<String> {
        self.execute_command("INFO", |c| async move { c.info().await })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendClient, InMemoryBackend, MemoryConnector};
    use crate::config::SentinelConfig;
    use crate::error::SentinelError;
    use crate::resilience::CircuitState;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct CountingConnector {
        inner: MemoryConnector,
        connects: AtomicUsize,
    }

    #[async_trait]
    impl BackendConnector for CountingConnector {
        async fn connect(&self, url: &str, timeout: Duration) -> BackendResult<SharedClient> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.inner.connect(url, timeout).await
        }
    }

    fn manager_with(
        backend: BackendConfig,
        connector: Arc<dyn BackendConnector>,
    ) -> BackendManager {
        let config = SentinelConfig::testing();
        BackendManager::new(backend, &config.circuit_breaker, connector)
    }

    fn memory_manager() -> (BackendManager, Arc<InMemoryBackend>) {
        let connector = MemoryConnector::new();
        let node = connector.backend();
        let manager = manager_with(SentinelConfig::testing().backend, Arc::new(connector));
        (manager, node)
    }

    #[tokio::test]
    async fn test_invalid_url_fails_before_connecting() {
        let connector = Arc::new(CountingConnector {
            inner: MemoryConnector::new(),
            connects: AtomicUsize::new(0),
        });
        let manager = manager_with(BackendConfig::with_url("localhost:6379"), connector.clone());

        let result = manager.initialize().await;
        assert!(matches!(result, Err(SentinelError::InvalidBackendUrl { .. })));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 0);
        assert!(!manager.is_available());
    }

    #[tokio::test]
    async fn test_initialize_and_round_trip() {
        let (manager, _node) = memory_manager();
        assert!(!manager.is_available());
        assert!(manager.get("k").await.is_err());

        manager.initialize().await.unwrap();
        assert!(manager.is_available());

        manager.setex("k", 60, "v").await.unwrap();
        assert_eq!(manager.get("k").await.unwrap(), Some("v".to_string()));
        assert_eq!(manager.get("missing").await.unwrap(), None);

        let metrics = manager.metrics();
        assert_eq!(metrics.total_requests, 3);
        assert_eq!(metrics.successful_requests, 3);
        assert_eq!(metrics.uptime_percentage, 100.0);
        assert_eq!(metrics.peak_connections, 1);
        assert_eq!(metrics.active_connections, 0);
    }

    #[tokio::test]
    async fn test_initialize_failure_enters_fallback() {
        let (manager, node) = memory_manager();
        node.set_available(false);

        assert!(manager.initialize().await.is_err());
        assert!(manager.is_fallback_mode());
        assert!(!manager.is_available());
        assert!(manager.metrics().last_error.is_some());
    }

    #[tokio::test]
    async fn test_command_timeout_enters_fallback() {
        let connector = MemoryConnector::new();
        let node = connector.backend();
        // Long health cache so the command itself, not the ping, hits the deadline
        let backend = BackendConfig {
            command_timeout_ms: 50,
            health_cache_ttl_ms: 60_000,
            ..SentinelConfig::testing().backend
        };
        let manager = manager_with(backend, Arc::new(connector));
        manager.initialize().await.unwrap();

        node.set_latency(Duration::from_millis(20));
        assert!(manager.get("k").await.is_ok());

        node.set_latency(Duration::from_millis(200));
        let result = manager.get("k").await;
        assert!(matches!(result, Err(BackendFailure::Timeout { .. })));
        assert!(manager.is_fallback_mode());
        assert!(!manager.is_available());

        // Short-circuited without touching the node
        node.set_latency(Duration::ZERO);
        let before = node.command_count();
        assert!(matches!(manager.get("k").await, Err(BackendFailure::Unavailable { .. })));
        assert_eq!(node.command_count(), before);

        assert!(manager.health_check().await);
        assert!(manager.is_available());
    }

    #[tokio::test]
    async fn test_failover_to_replica() {
        let primary = Arc::new(InMemoryBackend::new());
        let replica = Arc::new(InMemoryBackend::new());
        let connector = MemoryConnector::new()
            .with_node("memory://primary", primary.clone())
            .with_node("memory://replica", replica.clone());
        let backend = BackendConfig::with_url("memory://primary").with_replica("memory://replica");
        let manager = manager_with(
            BackendConfig {
                health_cache_ttl_ms: 0,
                ..backend
            },
            Arc::new(connector),
        );
        manager.initialize().await.unwrap();
        assert_eq!(manager.metrics().replica_count, 1);

        primary.set_available(false);
        manager.set("k", "from-replica").await.unwrap();
        assert_eq!(replica.get("k").await.unwrap(), Some("from-replica".to_string()));
    }

    #[tokio::test]
    async fn test_breaker_opens_when_no_healthy_connection() {
        let (manager, node) = memory_manager();
        manager.initialize().await.unwrap();
        node.set_available(false);

        // testing() config: threshold 3
        for _ in 0..3 {
            assert!(matches!(
                manager.get("k").await,
                Err(BackendFailure::Unavailable { .. })
            ));
        }
        assert_eq!(manager.circuit_breaker().state(), CircuitState::Open);
        assert!(matches!(
            manager.get("k").await,
            Err(BackendFailure::CircuitOpen { .. })
        ));
        assert_eq!(manager.metrics().failed_requests, 4);
    }

    #[tokio::test]
    async fn test_health_check_toggles_fallback() {
        let (manager, node) = memory_manager();
        manager.initialize().await.unwrap();

        node.set_available(false);
        assert!(!manager.health_check().await);
        assert!(!manager.is_available());
        assert_eq!(manager.metrics().fallback_activations, 1);

        node.set_available(true);
        assert!(manager.health_check().await);
        assert!(manager.is_available());
    }

    #[tokio::test]
    async fn test_latency_is_moving_average() {
        let (manager, _node) = memory_manager();
        manager.initialize().await.unwrap();
        manager.record_success(Duration::from_millis(100));
        manager.record_success(Duration::from_millis(200));
        let avg = manager.metrics().average_latency_ms;
        assert!((avg - 110.0).abs() < 1e-6, "got {avg}");
    }
}
