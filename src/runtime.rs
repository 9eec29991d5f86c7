//! Composition root.
//!
//! A [`Runtime`] owns exactly one of each long-lived component and wires them
//! together: the backend manager, the degradation coordinator on top of it, the task
//! processor on top of that and the diagnostics collector fed by both. Everything is
//! shared by `Arc`; there is no global state.
//!
//! # Examples
//!
//! ```rust,no_run
//! use sentinelq::prelude::*;
//! use serde_json::{Value, json};
//!
//! #[tokio::main]
//! async fn main() -> SentinelResult<()> {
//!     let mut config = SentinelConfig::production();
//!     config.apply_env_overrides()?;
//!     config.logging.init_tracing();
//!
//!     let runtime = Runtime::new(config)?;
//!     runtime
//!         .processor()
//!         .register_handler("scam_check", |payload: Value| async move {
//!             Ok(json!({ "checked": payload["message_id"] }))
//!         })
//!         .await;
//!
//!     runtime.start().await?;
//!     runtime.wait_for_shutdown().await
//! }
//! ```

use crate::backend::{BackendConnector, BackendManager, MemoryConnector, redact_url};
use crate::config::{DurationExt, SentinelConfig};
use crate::degradation::{DegradationCoordinator, DegradationReport};
use crate::diagnostics::{DiagnosticsSnapshot, PerformanceCollector};
use crate::error::{SentinelError, SentinelResult};
use crate::processor::{QueueStatus, TaskProcessor};
use crate::supervisor::{Supervisor, TaskKind};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;

/// Everything an operator dashboard needs, in one document
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeStatus {
    pub degradation: DegradationReport,
    pub queue: QueueStatus,
    pub diagnostics: DiagnosticsSnapshot,
}

/// Owner of the backend, coordinator, processor and diagnostics
pub struct Runtime {
    config: SentinelConfig,
    backend: Arc<BackendManager>,
    coordinator: Arc<DegradationCoordinator>,
    processor: TaskProcessor,
    diagnostics: Arc<PerformanceCollector>,
    monitors: Mutex<Option<Supervisor>>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("backend", &redact_url(&self.config.backend.url))
            .field("processor", &self.processor)
            .finish_non_exhaustive()
    }
}

/// Connector matching the URL scheme
fn default_connector(url: &str) -> Arc<dyn BackendConnector> {
    #[cfg(feature = "redis-backend")]
    {
        if !url.starts_with("memory://") {
            return Arc::new(crate::backend::RedisConnector);
        }
    }
    tracing::info!(url = %redact_url(url), "Using in-process backend");
    Arc::new(MemoryConnector::new())
}

impl Runtime {
    /// Build a runtime for `config`, connecting to Redis unless the URL is `memory://`
    pub fn new(config: SentinelConfig) -> SentinelResult<Self> {
        let connector = default_connector(&config.backend.url);
        Self::with_connector(config, connector)
    }

    /// Build a runtime over a custom connector
    pub fn with_connector(config: SentinelConfig, connector: Arc<dyn BackendConnector>) -> SentinelResult<Self> {
        config
            .validate()
            .map_err(|errors| SentinelError::config(errors.join("; ")))?;

        let diagnostics = Arc::new(PerformanceCollector::new());
        let backend = Arc::new(BackendManager::new(
            config.backend.clone(),
            &config.circuit_breaker,
            connector,
        ));
        let coordinator = Arc::new(
            DegradationCoordinator::new(
                Arc::clone(&backend),
                config.degradation.clone(),
                &config.cache,
            )
            .with_diagnostics(Arc::clone(&diagnostics)),
        );
        let processor = TaskProcessor::new(
            config.processor.clone(),
            Arc::clone(&coordinator),
            Arc::clone(&diagnostics),
        );

        Ok(Self {
            config,
            backend,
            coordinator,
            processor,
            diagnostics,
            monitors: Mutex::new(None),
        })
    }

    /// Connect, start the monitor loops and the processor.
    ///
    /// An unreachable backend is not an error: the runtime starts degraded and the
    /// recovery loop keeps trying.
    pub async fn start(&self) -> SentinelResult<()> {
        if self.monitors.lock().is_some() {
            return Err(SentinelError::AlreadyRunning);
        }

        if let Err(e) = self.backend.initialize().await {
            tracing::warn!(error = %e, "Backend unavailable at startup, running degraded");
            self.coordinator
                .mark_unavailable(crate::degradation::BACKEND_SERVICE, &e.to_string());
        }

        let supervisor = Supervisor::new("runtime-monitors");
        supervisor.spawn(
            "backend-health",
            TaskKind::Monitor,
            Arc::clone(&self.backend).run_health_monitor(supervisor.signal()),
        );
        self.coordinator.spawn_monitors(&supervisor);
        *self.monitors.lock() = Some(supervisor);

        if let Err(e) = self.processor.start().await {
            self.stop_monitors().await;
            return Err(e);
        }

        tracing::info!(
            backend = %redact_url(&self.config.backend.url),
            backend_available = self.backend.is_available(),
            workers = self.config.processor.worker_count,
            "Runtime started"
        );
        Ok(())
    }

    /// Drain the processor, then stop the monitors.
    pub async fn shutdown(&self) -> SentinelResult<()> {
        if self.monitors.lock().is_none() {
            return Err(SentinelError::NotRunning);
        }
        tracing::info!("Shutting down runtime...");

        let drained = self.processor.stop().await;
        self.stop_monitors().await;

        tracing::info!("Runtime stopped");
        drained
    }

    async fn stop_monitors(&self) {
        let supervisor = self.monitors.lock().take();
        if let Some(supervisor) = supervisor {
            supervisor
                .shutdown(self.config.processor.shutdown_timeout_secs.secs())
                .await;
        }
    }

    /// Wait for Ctrl+C, then shut down.
    pub async fn wait_for_shutdown(&self) -> SentinelResult<()> {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Received shutdown signal"),
            Err(e) => tracing::error!(error = %e, "Unable to listen for shutdown signal"),
        }
        self.shutdown().await
    }

    pub fn is_running(&self) -> bool {
        self.monitors.lock().is_some()
    }

    pub fn config(&self) -> &SentinelConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<BackendManager> {
        &self.backend
    }

    pub fn coordinator(&self) -> &Arc<DegradationCoordinator> {
        &self.coordinator
    }

    pub fn processor(&self) -> &TaskProcessor {
        &self.processor
    }

    pub fn diagnostics(&self) -> &Arc<PerformanceCollector> {
        &self.diagnostics
    }

    /// Combined status of every component
    pub async fn status(&self) -> RuntimeStatus {
        RuntimeStatus {
            degradation: self.coordinator.get_comprehensive_status(),
            queue: self.processor.get_queue_status().await,
            diagnostics: self.diagnostics.snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::degradation::{BACKEND_SERVICE, ServiceStatus};
    use crate::intake::InboundMessage;
    use crate::task::TaskStatus;
    use serde_json::{Value, json};
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    fn runtime_with_node() -> (Runtime, Arc<InMemoryBackend>) {
        let connector = MemoryConnector::new();
        let node = connector.backend();
        let runtime = Runtime::with_connector(SentinelConfig::testing(), Arc::new(connector)).unwrap();
        (runtime, node)
    }

    async fn wait_for_status(runtime: &Runtime, task_id: &str, expected: TaskStatus) {
        for _ in 0..150 {
            if assert_ok!(runtime.processor().get_task_status(task_id).await) == Some(expected) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("task {task_id} never reached {expected:?}");
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = SentinelConfig::testing();
        config.processor.worker_count = 0;
        let err = assert_err!(Runtime::with_connector(config, Arc::new(MemoryConnector::new())));
        assert!(matches!(err, SentinelError::ConfigError { .. }));
    }

    #[tokio::test]
    async fn test_message_flows_through_runtime() {
        let (runtime, _) = runtime_with_node();
        runtime
            .processor()
            .register_handler("scam_check", |payload: Value| async move {
                let body = payload["body"].as_str().unwrap_or_default().to_lowercase();
                Ok(json!({ "suspicious": body.contains("fee") }))
            })
            .await;
        assert_ok!(runtime.start().await);
        assert!(runtime.is_running());
        assert!(runtime.backend().is_available());

        let task = assert_ok!(
            InboundMessage::new("SM9", "whatsapp:+15550123", "Registration fee required")
                .into_task("scam_check", None)
        );
        let task_id = assert_ok!(runtime.processor().queue_task(task).await);
        wait_for_status(&runtime, &task_id, TaskStatus::Completed).await;

        let result = assert_ok!(runtime.processor().get_task_result(&task_id).await).unwrap();
        assert_eq!(result.result, Some(json!({"suspicious": true})));

        let status = runtime.status().await;
        assert_eq!(status.queue.completed, 1);
        assert!(status.degradation.backend_available);

        assert_ok!(runtime.shutdown().await);
        assert!(!runtime.is_running());
        assert!(matches!(runtime.shutdown().await, Err(SentinelError::NotRunning)));
    }

    #[tokio::test]
    async fn test_starts_degraded_without_backend() {
        let (runtime, node) = runtime_with_node();
        node.set_available(false);
        runtime
            .processor()
            .register_handler("echo", |payload: Value| async move { Ok(payload) })
            .await;

        assert_ok!(runtime.start().await);
        assert!(!runtime.backend().is_available());
        assert_eq!(
            runtime
                .coordinator()
                .get_service_status(BACKEND_SERVICE)
                .unwrap()
                .status,
            ServiceStatus::Unavailable
        );

        let task = runtime.processor().new_task("echo", json!("inline"));
        let task_id = assert_ok!(runtime.processor().queue_task(task).await);
        wait_for_status(&runtime, &task_id, TaskStatus::Completed).await;

        assert!(matches!(runtime.start().await, Err(SentinelError::AlreadyRunning)));
        assert_ok!(runtime.shutdown().await);
    }
}
