//! Handler registry for the task processor.
//!
//! Maps a task type to the async handler that executes it and keeps per-type
//! execution statistics. The registry is read on every task and written only when
//! handlers are registered, so it sits behind a `tokio::sync::RwLock`.
//!
//! # Examples
//!
//! ```rust
//! use sentinelq::prelude::*;
//! use serde_json::{Value, json};
//!
//! # async fn example() {
//! let registry = HandlerRegistry::new();
//! registry
//!     .register("scam_check", |payload: Value| async move {
//!         let body = payload["body"].as_str().unwrap_or_default();
//!         Ok(json!({ "suspicious": body.contains("registration fee") }))
//!     })
//!     .await;
//!
//! assert!(registry.is_registered("scam_check").await);
//! # }
//! ```

use crate::error::{SentinelError, SentinelResult};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::RwLock;

/// Weight of the newest sample in the moving averages
const EMA_ALPHA: f64 = 0.1;

/// Executes the payload of one task type.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Run the task. Errors are retried by the processor up to the task's
    /// `max_attempts`.
    async fn handle(&self, payload: Value) -> SentinelResult<Value>;
}

#[async_trait]
impl<F, Fut> TaskHandler for F
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = SentinelResult<Value>> + Send + 'static,
{
    async fn handle(&self, payload: Value) -> SentinelResult<Value> {
        (self)(payload).await
    }
}

/// Statistics for one task type.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HandlerStats {
    /// Total number of executions
    pub total_executed: u64,
    /// Number of successful executions
    pub successful: u64,
    /// Number of failed executions (excluding timeouts)
    pub failed: u64,
    /// Number of executions that hit their deadline
    pub timed_out: u64,
    /// Average execution time
    pub avg_duration: Option<Duration>,
    /// Last execution time
    pub last_executed: Option<SystemTime>,
}

/// Summary of the registry state.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrySummary {
    /// Registered task types, sorted
    pub registered_types: Vec<String>,
    /// Total number of executions
    pub total_executed: u64,
    /// Total number of successful executions
    pub total_successful: u64,
    /// Total number of failed or timed out executions
    pub total_failed: u64,
}

/// Registry of task handlers keyed by task type.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
    stats: RwLock<HashMap<String, HandlerStats>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry").finish_non_exhaustive()
    }
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for `task_type`.
    pub async fn register<H>(&self, task_type: impl Into<String>, handler: H)
    where
        H: TaskHandler + 'static,
    {
        self.register_arc(task_type, Arc::new(handler)).await;
    }

    /// Register a shared handler.
    pub async fn register_arc(&self, task_type: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        let task_type = task_type.into();
        tracing::info!("Registering task handler: {}", task_type);

        let replaced = self
            .handlers
            .write()
            .await
            .insert(task_type.clone(), handler)
            .is_some();
        if replaced {
            tracing::warn!("Handler for {} replaced", task_type);
        }

        self.stats.write().await.entry(task_type).or_default();
    }

    /// Look up the handler for `task_type`.
    pub async fn get(&self, task_type: &str) -> SentinelResult<Arc<dyn TaskHandler>> {
        self.handlers
            .read()
            .await
            .get(task_type)
            .cloned()
            .ok_or_else(|| SentinelError::HandlerNotFound {
                task_type: task_type.to_string(),
            })
    }

    /// Check if a task type is registered.
    pub async fn is_registered(&self, task_type: &str) -> bool {
        self.handlers.read().await.contains_key(task_type)
    }

    /// Get all registered task types.
    pub async fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.read().await.keys().cloned().collect();
        types.sort();
        types
    }

    /// Get statistics for a task type.
    pub async fn get_stats(&self, task_type: &str) -> Option<HandlerStats> {
        self.stats.read().await.get(task_type).cloned()
    }

    /// Record one execution. Unregistered task types are not tracked.
    pub(crate) async fn record_execution(
        &self,
        task_type: &str,
        result: &SentinelResult<Value>,
        duration: Duration,
    ) {
        let mut stats = self.stats.write().await;
        // Entries are created by `register_arc`.
        let Some(entry) = stats.get_mut(task_type) else {
            return;
        };

        entry.total_executed += 1;
        entry.last_executed = Some(SystemTime::now());

        match result {
            Ok(_) => entry.successful += 1,
            Err(SentinelError::Timeout { .. }) => entry.timed_out += 1,
            Err(_) => entry.failed += 1,
        }

        entry.avg_duration = Some(match entry.avg_duration {
            Some(avg) => {
                let nanos = EMA_ALPHA * duration.as_nanos() as f64
                    + (1.0 - EMA_ALPHA) * avg.as_nanos() as f64;
                Duration::from_nanos(nanos as u64)
            }
            None => duration,
        });
    }

    /// Get a summary of the registry state.
    pub async fn summary(&self) -> RegistrySummary {
        let registered_types = self.registered_types().await;
        let stats = self.stats.read().await;

        RegistrySummary {
            registered_types,
            total_executed: stats.values().map(|s| s.total_executed).sum(),
            total_successful: stats.values().map(|s| s.successful).sum(),
            total_failed: stats.values().map(|s| s.failed + s.timed_out).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Upper;

    #[async_trait]
    impl TaskHandler for Upper {
        async fn handle(&self, payload: Value) -> SentinelResult<Value> {
            let text = payload
                .as_str()
                .ok_or_else(|| SentinelError::handler("expected a string payload"))?;
            Ok(json!(text.to_uppercase()))
        }
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = HandlerRegistry::new();
        registry.register("upper", Upper).await;
        registry
            .register("echo", |payload: Value| async move { Ok(payload) })
            .await;

        assert_eq!(registry.registered_types().await, vec!["echo", "upper"]);

        let handler = registry.get("upper").await.unwrap();
        assert_eq!(handler.handle(json!("hi")).await.unwrap(), json!("HI"));
        assert!(handler.handle(json!(1)).await.is_err());

        let echo = registry.get("echo").await.unwrap();
        assert_eq!(echo.handle(json!({"a": 1})).await.unwrap(), json!({"a": 1}));
    }

    #[tokio::test]
    async fn test_missing_handler() {
        let registry = HandlerRegistry::new();
        assert!(matches!(
            registry.get("nope").await,
            Err(SentinelError::HandlerNotFound { task_type }) if task_type == "nope"
        ));
    }

    #[tokio::test]
    async fn test_stats_tracking() {
        let registry = HandlerRegistry::new();
        registry.register("upper", Upper).await;

        registry
            .record_execution("upper", &Ok(json!(null)), Duration::from_millis(100))
            .await;
        registry
            .record_execution(
                "upper",
                &Err(SentinelError::Timeout { timeout_ms: 10 }),
                Duration::from_millis(200),
            )
            .await;
        registry
            .record_execution("upper", &Err(SentinelError::handler("x")), Duration::from_millis(100))
            .await;

        let stats = registry.get_stats("upper").await.unwrap();
        assert_eq!(stats.total_executed, 3);
        assert_eq!(stats.successful, 1);
        assert_eq!(stats.timed_out, 1);
        assert_eq!(stats.failed, 1);
        // 100 → 110 → 109
        let avg = stats.avg_duration.unwrap().as_secs_f64();
        assert!((avg - 0.109).abs() < 1e-6, "got {avg}");

        let summary = registry.summary().await;
        assert_eq!(summary.total_executed, 3);
        assert_eq!(summary.total_failed, 2);
    }

    #[tokio::test]
    async fn test_unregistered_types_are_not_tracked() {
        let registry = HandlerRegistry::new();
        for i in 0..50 {
            let err = SentinelError::HandlerNotFound {
                task_type: format!("bogus-{i}"),
            };
            registry
                .record_execution(&format!("bogus-{i}"), &Err(err), Duration::from_millis(1))
                .await;
        }

        assert!(registry.get_stats("bogus-0").await.is_none());
        assert_eq!(registry.stats.read().await.len(), 0);
        assert_eq!(registry.summary().await.total_executed, 0);
    }
}
