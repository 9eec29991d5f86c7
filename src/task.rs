//! Task definitions: the unit of deferred work and its status records.

use crate::error::SentinelResult;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

/// Unique identifier for a task
pub type TaskId = String;

/// Default number of attempts before a task is dead-lettered
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Priority tier of a task. Workers drain `High` before `Normal` before `Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    /// Background work
    Low,
    /// Default tier
    Normal,
    /// User-facing work
    High,
}

impl Default for TaskPriority {
    fn default() -> Self {
        TaskPriority::Normal
    }
}

impl TaskPriority {
    /// Tiers in the order workers poll them
    pub const POLL_ORDER: [TaskPriority; 3] =
        [TaskPriority::High, TaskPriority::Normal, TaskPriority::Low];

    /// Lowercase name used in queue keys
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Low => "low",
            TaskPriority::Normal => "normal",
            TaskPriority::High => "high",
        }
    }
}

/// Status of a task, stored keyed by task id with a bounded TTL
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Task is waiting to be processed
    Pending,
    /// Task is currently being processed
    Processing,
    /// Task completed successfully
    Completed,
    /// Last attempt failed; a retry is scheduled
    Failed,
    /// Task exhausted its attempts (terminal)
    DeadLetter,
}

impl TaskStatus {
    /// Whether no further automatic action will happen for this task
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::DeadLetter)
    }
}

/// A unit of deferred work as it travels through the queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingTask {
    /// Unique task identifier; generated by `queue_task` when empty
    pub task_id: TaskId,
    /// Key into the handler registry
    pub task_type: String,
    /// Handler-specific payload
    pub payload: serde_json::Value,
    /// Priority tier
    pub priority: TaskPriority,
    /// When the task was built
    pub created_at: SystemTime,
    /// Invisible to workers until this instant (retry backoff)
    pub scheduled_at: Option<SystemTime>,
    /// Failed attempts so far
    pub attempts: u32,
    /// Attempts allowed before dead-lettering
    pub max_attempts: u32,
    /// Propagated for tracing across the webhook and the workers
    pub correlation_id: String,
    /// Per-attempt deadline; `None` uses the processor default
    pub timeout: Option<Duration>,
}

impl ProcessingTask {
    /// Create a normal-priority task with default retry settings
    pub fn new(task_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            task_id: String::new(),
            task_type: task_type.into(),
            payload,
            priority: TaskPriority::Normal,
            created_at: SystemTime::now(),
            scheduled_at: None,
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            correlation_id: String::new(),
            timeout: None,
        }
    }

    /// Set the priority tier
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Set an explicit task id
    pub fn with_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = task_id.into();
        self
    }

    /// Set the maximum number of attempts
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the correlation id
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    /// Set the per-attempt deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Whether the task may be picked up at `now`
    pub fn is_due(&self, now: SystemTime) -> bool {
        self.scheduled_at.is_none_or(|at| at <= now)
    }

    /// Whether another attempt is allowed after the current failure count
    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Serialize for storage in a backend list
    pub fn to_json(&self) -> SentinelResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from a backend list entry
    pub fn from_json(data: &str) -> SentinelResult<Self> {
        Ok(serde_json::from_str(data)?)
    }
}

/// Outcome record written once a task reaches a terminal state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    /// Task identifier
    pub task_id: TaskId,
    /// Terminal status
    pub status: TaskStatus,
    /// Handler output on success
    pub result: Option<serde_json::Value>,
    /// Last error on failure
    pub error: Option<String>,
    /// Duration of the final attempt
    pub processing_time: Duration,
    /// When the record was written
    pub completed_at: SystemTime,
    /// Attempts consumed (failed attempts for dead letters)
    pub attempts: u32,
}

/// Entry pushed onto the dead-letter queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// The task as it was when it gave up
    pub task: ProcessingTask,
    /// Last error message
    pub error: String,
    /// When it was dead-lettered
    pub dead_lettered_at: SystemTime,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_json_preserves_fields() {
        let task = ProcessingTask::new("scam_check", json!({"body": "Send $50 to apply"}))
            .with_id("task-1")
            .with_priority(TaskPriority::High)
            .with_correlation_id("SM123")
            .with_timeout(Duration::from_millis(1500));
        let mut task = task;
        task.attempts = 2;
        task.scheduled_at = Some(task.created_at + Duration::from_nanos(123_456_789));

        let decoded = ProcessingTask::from_json(&task.to_json().unwrap()).unwrap();
        assert_eq!(decoded, task);
        assert_eq!(decoded.priority, TaskPriority::High);
        assert_eq!(decoded.attempts, 2);
        assert_eq!(decoded.scheduled_at, task.scheduled_at);
    }

    #[test]
    fn test_due_and_retry_rules() {
        let now = SystemTime::now();
        let mut task = ProcessingTask::new("t", json!({})).with_max_attempts(2);
        assert!(task.is_due(now));

        task.scheduled_at = Some(now + Duration::from_secs(5));
        assert!(!task.is_due(now));
        assert!(task.is_due(now + Duration::from_secs(5)));

        task.attempts = 1;
        assert!(task.can_retry());
        task.attempts = 2;
        assert!(!task.can_retry());
    }

    #[test]
    fn test_status_terminality() {
        assert!(TaskStatus::DeadLetter.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(!TaskStatus::Failed.is_terminal());
        assert_eq!(
            serde_json::to_string(&TaskStatus::DeadLetter).unwrap(),
            "\"DEAD_LETTER\""
        );
    }
}
