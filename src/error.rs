//! Error types for sentinelq operations.
//!
//! Two layers of failure exist. [`BackendFailure`] classifies everything that can go
//! wrong talking to the cache/queue backend; those failures are absorbed by the
//! connection manager and the degradation coordinator and turned into state.
//! [`SentinelError`] is what crosses the public API boundary.

use thiserror::Error;

/// Result type used throughout sentinelq.
pub type SentinelResult<T> = Result<T, SentinelError>;

/// Result of a single backend command.
///
/// `Ok(None)` from a read means "no such value", never "the command failed".
pub type BackendResult<T> = Result<T, BackendFailure>;

/// Tagged reason a backend command did not happen.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendFailure {
    /// The command or the connection attempt exceeded its deadline
    #[error("backend operation timed out after {timeout_ms}ms")]
    Timeout {
        /// Deadline that was exceeded
        timeout_ms: u64,
    },

    /// No usable connection (not initialized, fallback mode, refused, no healthy node)
    #[error("backend unavailable: {reason}")]
    Unavailable {
        /// Why the backend could not be reached
        reason: String,
    },

    /// The backend answered with something we could not use
    #[error("backend protocol error: {message}")]
    Protocol {
        /// Error message
        message: String,
    },

    /// The circuit breaker guarding the backend is open
    #[error("circuit breaker '{component}' is open")]
    CircuitOpen {
        /// Breaker name
        component: String,
    },
}

impl BackendFailure {
    /// Create an unavailability failure
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }

    /// Create a protocol failure
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Whether the failure should push the manager into fallback mode on its own
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Main error type for sentinelq operations.
#[derive(Error, Debug)]
pub enum SentinelError {
    /// The task queue reached its capacity
    #[error("Task queue is full ({depth} queued, max {max_queue_size})")]
    QueueFull {
        /// Depth observed when the task was rejected
        depth: usize,
        /// Configured capacity
        max_queue_size: usize,
    },

    /// No handler registered for a task type
    #[error("No handler registered for task type '{task_type}'")]
    HandlerNotFound {
        /// The task type that wasn't found
        task_type: String,
    },

    /// A task handler returned an error
    #[error("Task handler failed: {message}")]
    HandlerFailed {
        /// Error message
        message: String,
        /// Optional underlying error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// An operation exceeded its deadline
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout in milliseconds
        timeout_ms: u64,
    },

    /// Configuration error
    #[error("Configuration error: {message}")]
    ConfigError {
        /// Error message
        message: String,
    },

    /// The backend URL was rejected before any connection attempt
    #[error("Invalid backend URL: {reason}")]
    InvalidBackendUrl {
        /// Why the URL was rejected
        reason: String,
    },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backend failure that reached a caller
    #[error("Backend error: {0}")]
    Backend(#[from] BackendFailure),

    /// A service is unavailable and no fallback was provided
    #[error("Service '{service}' is unavailable and no fallback is available")]
    ServiceUnavailable {
        /// Service name
        service: String,
    },

    /// The processor is already running
    #[error("Task processor is already running")]
    AlreadyRunning,

    /// The processor is not running
    #[error("Task processor is not running")]
    NotRunning,
}

impl SentinelError {
    /// Create a handler failure from a plain message
    pub fn handler(message: impl Into<String>) -> Self {
        Self::HandlerFailed {
            message: message.into(),
            source: None,
        }
    }

    /// Create a handler failure wrapping an underlying error
    pub fn handler_with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::HandlerFailed {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigError {
            message: message.into(),
        }
    }

    /// Whether this error is the queue's capacity rejection
    pub fn is_capacity(&self) -> bool {
        matches!(self, Self::QueueFull { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_failure_converts() {
        let err: SentinelError = BackendFailure::Timeout { timeout_ms: 250 }.into();
        assert!(matches!(err, SentinelError::Backend(BackendFailure::Timeout { .. })));
        assert!(err.to_string().contains("250ms"));
    }

    #[test]
    fn test_capacity_classification() {
        let err = SentinelError::QueueFull {
            depth: 10,
            max_queue_size: 10,
        };
        assert!(err.is_capacity());
        assert!(!SentinelError::handler("boom").is_capacity());
    }
}
