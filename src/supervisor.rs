//! Ownership of background loops.
//!
//! Every long-running task in the crate is spawned through a [`Supervisor`]. It hands
//! out [`ShutdownSignal`]s, keeps each `JoinHandle` under a name, and on shutdown
//! signals once, then awaits monitors before workers.

use futures::future::join_all;
use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Cooperative cancellation handle observed by supervised loops
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Whether shutdown has been requested
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown is requested (or the supervisor is gone)
    pub async fn cancelled(&mut self) {
        // An Err from wait_for means the sender dropped; treat as cancellation.
        let _ = self.rx.wait_for(|stop| *stop).await;
    }
}

/// How a supervised task is stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Periodic loop; aborted if it overruns the grace period
    Monitor,
    /// Finishes its current unit of work before exiting; never aborted
    Worker,
}

#[derive(Debug)]
struct SupervisedTask {
    name: String,
    kind: TaskKind,
    handle: JoinHandle<()>,
}

/// Outcome of [`Supervisor::shutdown`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Tasks that exited on their own
    pub clean: usize,
    /// Monitors aborted after the grace period
    pub aborted: usize,
    /// Tasks that panicked
    pub failed: usize,
}

enum Outcome {
    Clean,
    Aborted,
    Failed,
}

/// Owns a group of background tasks and their shutdown order
#[derive(Debug)]
pub struct Supervisor {
    name: String,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<SupervisedTask>>,
}

impl Supervisor {
    /// Create a supervisor with no tasks
    pub fn new(name: impl Into<String>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            name: name.into(),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// A signal tied to this supervisor
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.shutdown_tx.subscribe(),
        }
    }

    /// Whether shutdown has been requested
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Spawn and take ownership of a task
    pub fn spawn<F>(&self, name: impl Into<String>, kind: TaskKind, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        tracing::debug!(supervisor = %self.name, task = %name, ?kind, "Spawning supervised task");
        let handle = tokio::spawn(task);
        self.tasks.lock().push(SupervisedTask { name, kind, handle });
    }

    /// Number of tasks not yet reaped by a shutdown
    pub fn task_count(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Signal shutdown, await monitors (aborting stragglers after `grace`), then
    /// await workers until each has finished its current work. Tasks of one kind are
    /// awaited together.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        self.shutdown_tx.send_replace(true);

        let tasks = std::mem::take(&mut *self.tasks.lock());
        let (monitors, workers): (Vec<_>, Vec<_>) =
            tasks.into_iter().partition(|t| t.kind == TaskKind::Monitor);

        tracing::info!(
            supervisor = %self.name,
            monitors = monitors.len(),
            workers = workers.len(),
            grace_ms = grace.as_millis() as u64,
            "Shutting down supervised tasks"
        );

        let mut report = ShutdownReport::default();
        for group in [monitors, workers] {
            let outcomes = join_all(group.into_iter().map(|task| self.await_task(task, grace))).await;
            for outcome in outcomes {
                match outcome {
                    Outcome::Clean => report.clean += 1,
                    Outcome::Aborted => report.aborted += 1,
                    Outcome::Failed => report.failed += 1,
                }
            }
        }

        tracing::info!(
            supervisor = %self.name,
            clean = report.clean,
            aborted = report.aborted,
            failed = report.failed,
            "Supervisor shutdown complete"
        );
        report
    }

    async fn await_task(&self, mut task: SupervisedTask, grace: Duration) -> Outcome {
        let joined = match task.kind {
            TaskKind::Worker => Ok((&mut task.handle).await),
            TaskKind::Monitor => timeout(grace, &mut task.handle).await,
        };
        match joined {
            Ok(Ok(())) => Outcome::Clean,
            Ok(Err(e)) => {
                tracing::error!(supervisor = %self.name, task = %task.name, error = %e, "Supervised task failed");
                Outcome::Failed
            }
            Err(_) => {
                tracing::warn!(supervisor = %self.name, task = %task.name, "Monitor overran grace period, aborting");
                task.handle.abort();
                Outcome::Aborted
            }
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_signal_reaches_loops() {
        let supervisor = Supervisor::new("test");
        let ticks = Arc::new(AtomicUsize::new(0));

        let mut signal = supervisor.signal();
        let counter = Arc::clone(&ticks);
        supervisor.spawn("ticker", TaskKind::Monitor, async move {
            loop {
                tokio::select! {
                    _ = signal.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(5)) => {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(supervisor.task_count(), 1);

        let report = supervisor.shutdown(Duration::from_secs(1)).await;
        assert_eq!(report, ShutdownReport { clean: 1, aborted: 0, failed: 0 });
        assert!(ticks.load(Ordering::SeqCst) > 0);
        assert!(supervisor.is_shutting_down());
        assert_eq!(supervisor.task_count(), 0);
    }

    #[tokio::test]
    async fn test_workers_finish_current_work() {
        let supervisor = Supervisor::new("test");
        let finished = Arc::new(AtomicBool::new(false));

        let signal = supervisor.signal();
        let done = Arc::clone(&finished);
        supervisor.spawn("worker", TaskKind::Worker, async move {
            while !signal.is_cancelled() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            // Work in flight when the signal lands
            tokio::time::sleep(Duration::from_millis(20)).await;
            done.store(true, Ordering::SeqCst);
        });

        let report = supervisor.shutdown(Duration::from_secs(1)).await;
        assert_eq!(report.clean, 1);
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_stragglers_are_aborted() {
        let supervisor = Supervisor::new("test");
        supervisor.spawn("stuck", TaskKind::Monitor, async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        supervisor.spawn("panics", TaskKind::Worker, async {
            panic!("boom");
        });

        let report = supervisor.shutdown(Duration::from_millis(50)).await;
        assert_eq!(report, ShutdownReport { clean: 0, aborted: 1, failed: 1 });
    }

    #[tokio::test]
    async fn test_workers_outlive_grace_period() {
        let supervisor = Supervisor::new("test");
        let finished = Arc::new(AtomicBool::new(false));

        let done = Arc::clone(&finished);
        supervisor.spawn("slow-worker", TaskKind::Worker, async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            done.store(true, Ordering::SeqCst);
        });

        let report = supervisor.shutdown(Duration::from_millis(20)).await;
        assert_eq!(report, ShutdownReport { clean: 1, aborted: 0, failed: 0 });
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_signal_after_drop_is_cancelled() {
        let supervisor = Supervisor::new("test");
        let mut signal = supervisor.signal();
        drop(supervisor);
        assert!(signal.is_cancelled());
        signal.cancelled().await;
    }
}
