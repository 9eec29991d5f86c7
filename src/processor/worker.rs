//! Worker loop and task execution.
//!
//! A worker polls the tiers in priority order, runs at most one task at a time and
//! settles it: completed, re-queued with a backoff, or dead-lettered. Inline
//! executions go through the same [`ProcessorCore::execute`].

use super::{LOCAL_DEAD_LETTER_CAPACITY, ProcessorCore};
use crate::config::DurationExt;
use crate::diagnostics::AlertSeverity;
use crate::error::{BackendFailure, SentinelError, SentinelResult};
use crate::supervisor::ShutdownSignal;
use crate::task::{DeadLetter, ProcessingTask, TaskPriority, TaskResult, TaskStatus};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant, SystemTime};
use tokio::time::{sleep, timeout};

/// Pause after a poll that failed on the backend
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Increments a gauge for as long as it lives
struct GaugeGuard<'a>(&'a AtomicUsize);

impl<'a> GaugeGuard<'a> {
    fn new(gauge: &'a AtomicUsize) -> Self {
        gauge.fetch_add(1, Ordering::Relaxed);
        Self(gauge)
    }
}

impl Drop for GaugeGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Poll until shutdown is signalled. A task in progress is always finished.
pub(super) async fn run_worker(core: Arc<ProcessorCore>, worker_id: usize, mut shutdown: ShutdownSignal) {
    let _alive = GaugeGuard::new(&core.counters.active_workers);
    let poll_interval = core.config.poll_interval_ms.millis();
    tracing::info!(worker_id, "Worker started");

    while !shutdown.is_cancelled() {
        let pause = match core.poll_once(worker_id).await {
            Ok(true) => continue,
            Ok(false) => poll_interval,
            Err(e) => {
                tracing::error!(worker_id, error = %e, "Worker poll failed");
                ERROR_BACKOFF
            }
        };

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = sleep(pause) => {}
        }
    }

    tracing::info!(worker_id, "Worker stopped");
}

impl ProcessorCore {
    /// Take and run the first due task, HIGH before NORMAL before LOW.
    ///
    /// Returns whether a task was executed.
    async fn poll_once(self: &Arc<Self>, worker_id: usize) -> SentinelResult<bool> {
        if !self.backend().is_available() {
            return Ok(false);
        }

        let now = SystemTime::now();
        for priority in TaskPriority::POLL_ORDER {
            let key = self.queue_key(priority);
            let Some(raw) = self.backend().rpop(&key).await? else {
                continue;
            };

            let task = match ProcessingTask::from_json(&raw) {
                Ok(task) => task,
                Err(e) => {
                    tracing::error!(worker_id, queue = %key, error = %e, "Dropping malformed task");
                    continue;
                }
            };

            if !task.is_due(now) {
                // Back to the producer end; the tier below may have due work.
                if let Err(e) = self.backend().lpush(&key, &raw).await {
                    tracing::warn!(task_id = %task.task_id, error = %e, "Could not re-queue scheduled task");
                    self.spawn_inline(task);
                }
                continue;
            }

            let _busy = GaugeGuard::new(&self.counters.busy_workers);
            tracing::debug!(worker_id, task_id = %task.task_id, priority = priority.as_str(), "Worker picked task");
            self.execute(task).await;
            return Ok(true);
        }

        Ok(false)
    }

    /// Run one attempt of `task` and settle its outcome.
    pub(super) async fn execute(self: &Arc<Self>, mut task: ProcessingTask) {
        let task_id = task.task_id.clone();
        self.set_status(&task_id, TaskStatus::Processing).await;

        let started = Instant::now();
        let outcome = self.run_handler(&task).await;
        let elapsed = started.elapsed();

        self.registry
            .record_execution(&task.task_type, &outcome, elapsed)
            .await;
        self.diagnostics.record_latency(&task.task_type, elapsed);
        self.counters.record_processing_time(elapsed);

        match outcome {
            Ok(value) => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    task_id = %task_id,
                    task_type = %task.task_type,
                    correlation_id = %task.correlation_id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Task completed"
                );
                self.set_status(&task_id, TaskStatus::Completed).await;
                self.store_result(&TaskResult {
                    task_id: task_id.clone(),
                    status: TaskStatus::Completed,
                    result: Some(value),
                    error: None,
                    processing_time: elapsed,
                    completed_at: SystemTime::now(),
                    attempts: task.attempts + 1,
                })
                .await;
            }
            Err(err @ SentinelError::HandlerNotFound { .. }) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                task.attempts += 1;
                self.dead_letter(task, err.to_string(), elapsed).await;
            }
            Err(err) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                task.attempts += 1;

                if !task.can_retry() {
                    self.dead_letter(task, err.to_string(), elapsed).await;
                    return;
                }

                let delay = self.config.retry_delay(task.attempts);
                let Some(retry_at) = SystemTime::now().checked_add(delay) else {
                    let reason = format!("{err} (retry delay {delay:?} out of range)");
                    self.dead_letter(task, reason, elapsed).await;
                    return;
                };
                task.scheduled_at = Some(retry_at);
                tracing::warn!(
                    task_id = %task_id,
                    attempt = task.attempts,
                    max_attempts = task.max_attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %err,
                    "Task failed, scheduling retry"
                );

                match self.enqueue(task.clone(), TaskStatus::Failed).await {
                    Ok(_) => {
                        self.counters.retried.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(rejected) => {
                        let reason = format!("{err} (retry rejected: {rejected})");
                        self.dead_letter(task, reason, elapsed).await;
                    }
                }
            }
        }
    }

    /// Run the handler on its own task so a deadline can cut it off.
    async fn run_handler(&self, task: &ProcessingTask) -> SentinelResult<Value> {
        let handler = self.registry.get(&task.task_type).await?;
        let deadline = task
            .timeout
            .unwrap_or_else(|| self.config.processing_timeout());

        let payload = task.payload.clone();
        let mut handle = tokio::spawn(async move { handler.handle(payload).await });

        match timeout(deadline, &mut handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(SentinelError::handler_with_source(
                "handler panicked",
                join_error,
            )),
            Err(_) => {
                handle.abort();
                Err(SentinelError::Timeout {
                    timeout_ms: deadline.as_millis() as u64,
                })
            }
        }
    }

    async fn dead_letter(&self, task: ProcessingTask, error: String, elapsed: Duration) {
        self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
        let task_id = task.task_id.clone();
        let attempts = task.attempts;
        tracing::error!(
            task_id = %task_id,
            task_type = %task.task_type,
            attempts,
            error = %error,
            "Task moved to dead-letter queue"
        );
        self.diagnostics.raise_alert(
            AlertSeverity::Warning,
            "processor",
            format!("task {task_id} ({}) dead-lettered: {error}", task.task_type),
        );

        let letter = DeadLetter {
            task,
            error: error.clone(),
            dead_lettered_at: SystemTime::now(),
        };
        if let Err(e) = self.push_dead_letter(&letter).await {
            tracing::warn!(task_id = %task_id, error = %e, "Keeping dead letter in memory");
            let mut local = self.local_dead_letters.lock();
            if local.len() == LOCAL_DEAD_LETTER_CAPACITY {
                local.pop_front();
            }
            local.push_back(letter);
        }

        self.set_status(&task_id, TaskStatus::DeadLetter).await;
        self.store_result(&TaskResult {
            task_id,
            status: TaskStatus::DeadLetter,
            result: None,
            error: Some(error),
            processing_time: elapsed,
            completed_at: SystemTime::now(),
            attempts,
        })
        .await;
    }

    async fn push_dead_letter(&self, letter: &DeadLetter) -> SentinelResult<()> {
        if !self.backend().is_available() {
            return Err(BackendFailure::unavailable("fallback mode").into());
        }
        let raw = serde_json::to_string(letter)?;
        self.backend().lpush(&self.dead_letter_key(), &raw).await?;
        Ok(())
    }
}
