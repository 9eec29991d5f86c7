//! The background task processor.
//!
//! Tasks are serialized into one backend list per priority tier and drained by a pool
//! of workers, HIGH before NORMAL before LOW. Failed attempts are re-queued with an
//! exponential backoff until the task's `max_attempts` is spent, then moved to the
//! dead-letter list. When the backend is unreachable a task is executed immediately
//! in-process instead, so producers only ever see three outcomes: queued, processed
//! inline, or rejected for capacity.
//!
//! # Examples
//!
//! ```rust,no_run
//! use sentinelq::prelude::*;
//! use serde_json::{Value, json};
//!
//! # async fn example(processor: TaskProcessor) -> SentinelResult<()> {
//! processor
//!     .register_handler("scam_check", |payload: Value| async move {
//!         Ok(json!({ "verdict": "legitimate", "input": payload }))
//!     })
//!     .await;
//! processor.start().await?;
//!
//! let task = ProcessingTask::new("scam_check", json!({"body": "Pay $30 to start"}))
//!     .with_priority(TaskPriority::High);
//! let task_id = processor.queue_task(task).await?;
//!
//! let status = processor.get_task_status(&task_id).await?;
//! processor.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod registry;
mod worker;

pub use registry::{HandlerRegistry, HandlerStats, RegistrySummary, TaskHandler};

use crate::backend::BackendManager;
use crate::config::{DurationExt, ProcessorConfig};
use crate::degradation::DegradationCoordinator;
use crate::diagnostics::{AlertSeverity, PerformanceCollector};
use crate::error::{SentinelError, SentinelResult};
use crate::supervisor::{ShutdownSignal, Supervisor, TaskKind};
use crate::task::{DeadLetter, ProcessingTask, TaskId, TaskPriority, TaskResult, TaskStatus};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant, SystemTime};
use tokio::task::JoinSet;
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};

/// Dead letters kept in memory when the backend cannot take them
const LOCAL_DEAD_LETTER_CAPACITY: usize = 1000;

/// Weight kept from the previous processing-time average
const EMA_KEEP: f64 = 0.9;

/// Depth ratio above which the queue reports backpressure
const DEPTH_PRESSURE: f64 = 0.8;
/// Worker utilization above which the queue reports backpressure
const UTILIZATION_PRESSURE: f64 = 0.9;
/// Average processing time, as a share of the timeout, that reports backpressure
const LATENCY_PRESSURE: f64 = 0.8;

/// Processor health as judged by its monitor loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessorHealth {
    /// All workers alive, backend reachable, no backpressure
    Healthy,
    /// Running, but on the inline fallback, short of workers or under pressure
    Degraded,
    /// Running with no live workers
    Critical,
    /// Not started
    Stopped,
}

/// Snapshot returned by [`TaskProcessor::get_queue_status`]
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub high_depth: u64,
    pub normal_depth: u64,
    pub low_depth: u64,
    /// Backend depth across tiers, or in-flight inline executions when the backend
    /// is unavailable
    pub total_depth: u64,
    pub inline_executions: usize,
    pub queued: u64,
    pub completed: u64,
    /// Failed attempts, including ones that were retried
    pub failed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub active_workers: usize,
    pub busy_workers: usize,
    pub average_processing_time_ms: f64,
    pub backpressure: bool,
    pub backend_available: bool,
    pub running: bool,
}

#[derive(Debug, Default)]
struct ProcessorCounters {
    queued: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    active_workers: AtomicUsize,
    busy_workers: AtomicUsize,
    average_processing_ms: Mutex<Option<f64>>,
    backpressure: AtomicBool,
}

impl ProcessorCounters {
    fn record_processing_time(&self, elapsed: Duration) {
        let sample = elapsed.as_secs_f64() * 1000.0;
        let mut avg = self.average_processing_ms.lock();
        *avg = Some(match *avg {
            Some(previous) => previous * EMA_KEEP + sample * (1.0 - EMA_KEEP),
            None => sample,
        });
    }

    fn average_processing_ms(&self) -> f64 {
        self.average_processing_ms.lock().unwrap_or(0.0)
    }
}

/// State shared between the processor handle, its workers and inline executions
pub(crate) struct ProcessorCore {
    config: ProcessorConfig,
    coordinator: Arc<DegradationCoordinator>,
    registry: HandlerRegistry,
    counters: ProcessorCounters,
    inline: Mutex<JoinSet<()>>,
    local_dead_letters: Mutex<VecDeque<DeadLetter>>,
    diagnostics: Arc<PerformanceCollector>,
    running: AtomicBool,
    /// Set while `stop()` drains inline executions
    draining: watch::Sender<bool>,
}

impl ProcessorCore {
    fn backend(&self) -> &Arc<BackendManager> {
        self.coordinator.backend()
    }

    fn queue_key(&self, priority: TaskPriority) -> String {
        self.backend().key(&format!("queue:{}", priority.as_str()))
    }

    fn status_key(&self, task_id: &str) -> String {
        self.backend().key(&format!("status:{task_id}"))
    }

    fn result_key(&self, task_id: &str) -> String {
        self.backend().key(&format!("result:{task_id}"))
    }

    fn dead_letter_key(&self) -> String {
        self.backend().key("dead_letter")
    }

    fn status_ttl(&self) -> Duration {
        self.config.status_ttl_secs.secs()
    }

    /// Inline executions still running (finished ones are reaped first)
    fn inline_count(&self) -> usize {
        let mut inline = self.inline.lock();
        while inline.try_join_next().is_some() {}
        inline.len()
    }

    async fn tier_depths(&self) -> SentinelResult<[u64; 3]> {
        let mut depths = [0; 3];
        for (slot, priority) in depths.iter_mut().zip(TaskPriority::POLL_ORDER) {
            *slot = self.backend().llen(&self.queue_key(priority)).await?;
        }
        Ok(depths)
    }

    /// Current depth and whether it came from the backend
    async fn current_depth(&self) -> (u64, bool) {
        if self.backend().is_available() {
            match self.tier_depths().await {
                Ok(depths) => return (depths.iter().sum(), true),
                Err(e) => tracing::warn!(error = %e, "Could not read queue depth, assuming backend down"),
            }
        }
        (self.inline_count() as u64, false)
    }

    pub(crate) async fn queue_task(self: &Arc<Self>, task: ProcessingTask) -> SentinelResult<TaskId> {
        self.enqueue(task, TaskStatus::Pending).await
    }

    async fn enqueue(self: &Arc<Self>, mut task: ProcessingTask, status: TaskStatus) -> SentinelResult<TaskId> {
        let (depth, backend_ok) = self.current_depth().await;
        let max_queue_size = self.config.max_queue_size;
        if depth >= max_queue_size as u64 {
            tracing::warn!(depth, max_queue_size, task_type = %task.task_type, "Queue full, rejecting task");
            return Err(SentinelError::QueueFull {
                depth: depth as usize,
                max_queue_size,
            });
        }

        if task.task_id.is_empty() {
            task.task_id = uuid::Uuid::new_v4().to_string();
        }
        let task_id = task.task_id.clone();
        let payload = task.to_json()?;

        self.set_status(&task_id, status).await;

        let mut queued = false;
        if backend_ok {
            match self.backend().lpush(&self.queue_key(task.priority), &payload).await {
                Ok(_) => queued = true,
                Err(e) => {
                    tracing::warn!(task_id = %task_id, error = %e, "Queue push failed, executing inline")
                }
            }
        }

        if queued {
            tracing::debug!(
                task_id = %task_id,
                task_type = %task.task_type,
                priority = task.priority.as_str(),
                correlation_id = %task.correlation_id,
                "Task queued"
            );
        } else {
            self.spawn_inline(task);
        }

        self.counters.queued.fetch_add(1, Ordering::Relaxed);
        Ok(task_id)
    }

    /// Run a task in-process right away, honoring its schedule.
    fn spawn_inline(self: &Arc<Self>, task: ProcessingTask) {
        tracing::debug!(task_id = %task.task_id, task_type = %task.task_type, "Executing task inline");
        let core = Arc::clone(self);
        let mut inline = self.inline.lock();
        while inline.try_join_next().is_some() {}
        inline.spawn(run_inline(core, task));
    }

    async fn set_status(&self, task_id: &str, status: TaskStatus) {
        let key = self.status_key(task_id);
        let value = match serde_json::to_string(&status) {
            Ok(value) => value,
            Err(e) => {
                tracing::error!(task_id, error = %e, "Could not serialize task status");
                return;
            }
        };
        if let Err(e) = self
            .coordinator
            .set_with_fallback(&key, &value, self.status_ttl())
            .await
        {
            tracing::warn!(task_id, ?status, error = %e, "Could not record task status");
        }
    }

    async fn store_result(&self, result: &TaskResult) {
        let key = self.result_key(&result.task_id);
        let stored = match serde_json::to_string(result) {
            Ok(value) => {
                self.coordinator
                    .set_with_fallback(&key, &value, self.status_ttl())
                    .await
            }
            Err(e) => Err(e.into()),
        };
        if let Err(e) = stored {
            tracing::warn!(task_id = %result.task_id, error = %e, "Could not record task result");
        }
    }

    async fn get_task_status(&self, task_id: &str) -> SentinelResult<Option<TaskStatus>> {
        let raw = self.coordinator.get_with_fallback(&self.status_key(task_id)).await?;
        raw.map(|raw| serde_json::from_str(&raw).map_err(SentinelError::from))
            .transpose()
    }

    async fn get_task_result(&self, task_id: &str) -> SentinelResult<Option<TaskResult>> {
        let raw = self.coordinator.get_with_fallback(&self.result_key(task_id)).await?;
        raw.map(|raw| serde_json::from_str(&raw).map_err(SentinelError::from))
            .transpose()
    }

    async fn queue_status(&self) -> QueueStatus {
        let backend_available = self.backend().is_available();
        let depths = if backend_available {
            self.tier_depths().await.unwrap_or_default()
        } else {
            [0; 3]
        };
        let inline_executions = self.inline_count();
        let total_depth = if backend_available {
            depths.iter().sum()
        } else {
            inline_executions as u64
        };

        QueueStatus {
            high_depth: depths[0],
            normal_depth: depths[1],
            low_depth: depths[2],
            total_depth,
            inline_executions,
            queued: self.counters.queued.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            retried: self.counters.retried.load(Ordering::Relaxed),
            dead_lettered: self.counters.dead_lettered.load(Ordering::Relaxed),
            active_workers: self.counters.active_workers.load(Ordering::Relaxed),
            busy_workers: self.counters.busy_workers.load(Ordering::Relaxed),
            average_processing_time_ms: self.counters.average_processing_ms(),
            backpressure: self.counters.backpressure.load(Ordering::Relaxed),
            backend_available,
            running: self.running.load(Ordering::SeqCst),
        }
    }

    /// Recompute the backpressure flag and feed the collector.
    async fn report_metrics(&self) -> QueueStatus {
        let mut status = self.queue_status().await;
        let max = self.config.max_queue_size.max(1) as f64;
        let utilization = if self.config.worker_count == 0 {
            0.0
        } else {
            status.busy_workers as f64 / self.config.worker_count as f64
        };
        let timeout_ms = self.config.processing_timeout_ms as f64;

        let mut reasons = Vec::new();
        if status.total_depth as f64 > max * DEPTH_PRESSURE {
            reasons.push(format!("queue depth {} of {}", status.total_depth, self.config.max_queue_size));
        }
        if utilization > UTILIZATION_PRESSURE {
            reasons.push(format!("worker utilization {:.0}%", utilization * 100.0));
        }
        if status.average_processing_time_ms > timeout_ms * LATENCY_PRESSURE {
            reasons.push(format!(
                "average processing time {:.0}ms near timeout {}ms",
                status.average_processing_time_ms, self.config.processing_timeout_ms
            ));
        }

        let backpressure = !reasons.is_empty();
        let was = self.counters.backpressure.swap(backpressure, Ordering::Relaxed);
        status.backpressure = backpressure;

        self.diagnostics.set_queue_depth(status.total_depth as usize);
        if backpressure && !was {
            let message = reasons.join(", ");
            tracing::warn!(reasons = %message, "Backpressure detected");
            self.diagnostics
                .raise_alert(AlertSeverity::Warning, "processor", format!("backpressure: {message}"));
        } else if !backpressure && was {
            tracing::info!("Backpressure cleared");
        }

        if status.dead_lettered >= self.config.dead_letter_threshold as u64 && status.dead_lettered > 0 {
            tracing::warn!(
                dead_lettered = status.dead_lettered,
                threshold = self.config.dead_letter_threshold,
                "Dead-letter count at or above threshold"
            );
        }

        tracing::info!(
            depth = status.total_depth,
            high = status.high_depth,
            normal = status.normal_depth,
            low = status.low_depth,
            completed = status.completed,
            failed = status.failed,
            dead_lettered = status.dead_lettered,
            busy = status.busy_workers,
            avg_ms = status.average_processing_time_ms,
            "Task processor metrics"
        );
        status
    }

    fn health(&self) -> ProcessorHealth {
        if !self.running.load(Ordering::SeqCst) {
            return ProcessorHealth::Stopped;
        }
        let active = self.counters.active_workers.load(Ordering::Relaxed);
        if active == 0 && self.config.worker_count > 0 {
            ProcessorHealth::Critical
        } else if active < self.config.worker_count
            || !self.backend().is_available()
            || self.counters.backpressure.load(Ordering::Relaxed)
        {
            ProcessorHealth::Degraded
        } else {
            ProcessorHealth::Healthy
        }
    }

    async fn run_health_monitor(self: Arc<Self>, mut shutdown: ShutdownSignal) {
        let mut ticker = interval(self.config.health_check_interval_secs.max(1).secs());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        let started = Instant::now();

        tracing::info!("Task processor health monitor started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let health = self.health();
                    let active = self.counters.active_workers.load(Ordering::Relaxed);
                    match health {
                        ProcessorHealth::Critical => tracing::error!(
                            workers = active,
                            expected = self.config.worker_count,
                            "HEALTH CHECK - CRITICAL: all workers are gone"
                        ),
                        ProcessorHealth::Degraded => tracing::warn!(
                            workers = active,
                            expected = self.config.worker_count,
                            backend_available = self.backend().is_available(),
                            "HEALTH CHECK - DEGRADED"
                        ),
                        _ => tracing::debug!(
                            workers = active,
                            uptime_secs = started.elapsed().as_secs(),
                            "HEALTH CHECK - HEALTHY"
                        ),
                    }
                }
            }
        }
        tracing::info!("Task processor health monitor stopped");
    }

    async fn run_metrics_monitor(self: Arc<Self>, mut shutdown: ShutdownSignal) {
        let mut ticker = interval(self.config.metrics_interval_secs.max(1).secs());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.report_metrics().await;
                }
            }
        }
        tracing::info!("Task processor metrics monitor stopped");
    }

    /// Wait for every inline execution, spawned ones included. Executions still
    /// waiting out a retry delay start at once.
    async fn drain_inline(&self) {
        self.draining.send_replace(true);
        loop {
            let mut batch = std::mem::take(&mut *self.inline.lock());
            if batch.is_empty() {
                break;
            }
            tracing::info!(remaining = batch.len(), "Draining inline executions");
            while let Some(joined) = batch.join_next().await {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "Inline execution failed");
                }
            }
        }
        self.draining.send_replace(false);
    }
}

/// Entry point of an inline execution
async fn run_inline(core: Arc<ProcessorCore>, task: ProcessingTask) {
    if let Some(wait) = task
        .scheduled_at
        .and_then(|at| at.duration_since(SystemTime::now()).ok())
    {
        let mut draining = core.draining.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = async { let _ = draining.wait_for(|drain| *drain).await; } => {
                tracing::debug!(task_id = %task.task_id, "Processor stopping, running scheduled task now");
            }
        }
    }
    core.execute(task).await;
}

/// Background task processor.
pub struct TaskProcessor {
    core: Arc<ProcessorCore>,
    supervisor: Mutex<Option<Supervisor>>,
}

impl std::fmt::Debug for TaskProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskProcessor")
            .field("workers", &self.core.config.worker_count)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl TaskProcessor {
    /// Create a processor over the coordinator's backend
    pub fn new(
        config: ProcessorConfig,
        coordinator: Arc<DegradationCoordinator>,
        diagnostics: Arc<PerformanceCollector>,
    ) -> Self {
        Self {
            core: Arc::new(ProcessorCore {
                config,
                coordinator,
                registry: HandlerRegistry::new(),
                counters: ProcessorCounters::default(),
                inline: Mutex::new(JoinSet::new()),
                local_dead_letters: Mutex::new(VecDeque::new()),
                diagnostics,
                running: AtomicBool::new(false),
                draining: watch::channel(false).0,
            }),
            supervisor: Mutex::new(None),
        }
    }

    /// Processor configuration
    pub fn config(&self) -> &ProcessorConfig {
        &self.core.config
    }

    /// Register the handler for a task type
    pub async fn register_handler<H>(&self, task_type: impl Into<String>, handler: H)
    where
        H: TaskHandler + 'static,
    {
        self.core.registry.register(task_type, handler).await;
    }

    /// The handler registry
    pub fn registry(&self) -> &HandlerRegistry {
        &self.core.registry
    }

    /// Build a task carrying this processor's retry and timeout defaults
    pub fn new_task(&self, task_type: impl Into<String>, payload: serde_json::Value) -> ProcessingTask {
        ProcessingTask::new(task_type, payload)
            .with_max_attempts(self.core.config.retry_attempts)
            .with_timeout(self.core.config.processing_timeout())
    }

    /// Queue a task.
    ///
    /// Fails with [`SentinelError::QueueFull`] when the three tiers together hold
    /// `max_queue_size` tasks. When the backend is unavailable the task runs
    /// in-process immediately.
    pub async fn queue_task(&self, task: ProcessingTask) -> SentinelResult<TaskId> {
        self.core.queue_task(task).await
    }

    /// Start the worker pool and the monitor loops
    pub async fn start(&self) -> SentinelResult<()> {
        if self
            .core
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SentinelError::AlreadyRunning);
        }

        let config = &self.core.config;
        tracing::info!(
            workers = config.worker_count,
            max_queue_size = config.max_queue_size,
            "Starting task processor"
        );

        let supervisor = Supervisor::new("task-processor");
        for worker_id in 0..config.worker_count {
            supervisor.spawn(
                format!("worker-{worker_id}"),
                TaskKind::Worker,
                worker::run_worker(Arc::clone(&self.core), worker_id, supervisor.signal()),
            );
        }
        supervisor.spawn(
            "processor-health",
            TaskKind::Monitor,
            Arc::clone(&self.core).run_health_monitor(supervisor.signal()),
        );
        supervisor.spawn(
            "processor-metrics",
            TaskKind::Monitor,
            Arc::clone(&self.core).run_metrics_monitor(supervisor.signal()),
        );
        *self.supervisor.lock() = Some(supervisor);

        tracing::info!("Task processor started");
        Ok(())
    }

    /// Stop: signal, stop monitors, let every worker finish its current task, then
    /// drain inline executions. Work in progress is never aborted; each attempt is
    /// bounded by its handler timeout.
    pub async fn stop(&self) -> SentinelResult<()> {
        if self
            .core
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SentinelError::NotRunning);
        }

        tracing::info!("Stopping task processor...");
        let grace = self.core.config.shutdown_timeout_secs.secs();
        let supervisor = self.supervisor.lock().take();
        if let Some(supervisor) = supervisor {
            let report = supervisor.shutdown(grace).await;
            tracing::info!(
                clean = report.clean,
                aborted = report.aborted,
                failed = report.failed,
                "Worker shutdown result"
            );
        }
        self.core.drain_inline().await;

        tracing::info!("Task processor stopped");
        Ok(())
    }

    /// Whether `start()` has been called without a matching `stop()`
    pub fn is_running(&self) -> bool {
        self.core.running.load(Ordering::SeqCst)
    }

    /// Depths, counters and the backpressure flag
    pub async fn get_queue_status(&self) -> QueueStatus {
        self.core.queue_status().await
    }

    /// Run one metrics pass now (also done periodically while running)
    pub async fn report_metrics(&self) -> QueueStatus {
        self.core.report_metrics().await
    }

    /// Health as the monitor loop sees it
    pub fn health(&self) -> ProcessorHealth {
        self.core.health()
    }

    /// Last recorded status of a task
    pub async fn get_task_status(&self, task_id: &str) -> SentinelResult<Option<TaskStatus>> {
        self.core.get_task_status(task_id).await
    }

    /// Terminal result of a task, once written
    pub async fn get_task_result(&self, task_id: &str) -> SentinelResult<Option<TaskResult>> {
        self.core.get_task_result(task_id).await
    }

    /// Remove the oldest dead letter, from the backend or the local list
    pub async fn pop_dead_letter(&self) -> SentinelResult<Option<DeadLetter>> {
        let backend = self.core.backend();
        if backend.is_available() {
            if let Some(raw) = backend.rpop(&self.core.dead_letter_key()).await? {
                return Ok(Some(serde_json::from_str(&raw)?));
            }
        }
        Ok(self.core.local_dead_letters.lock().pop_front())
    }

    /// Dead letters the backend could not take, oldest first
    pub fn local_dead_letters(&self) -> Vec<DeadLetter> {
        self.core.local_dead_letters.lock().iter().cloned().collect()
    }
}
