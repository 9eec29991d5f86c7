//! # sentinelq
//!
//! Resilient background processing for a messaging webhook.
//!
//! ## Features
//!
//! - **Priority Queue**: HIGH, NORMAL and LOW tiers stored in Redis lists
//! - **Retries and Dead Letters**: exponential backoff, then a dead-letter queue
//! - **Circuit Breaker**: backend calls short-circuit while the backend is failing
//! - **Graceful Degradation**: memory cache, local rate limiting and inline execution
//!   whenever the backend is unreachable, with automatic recovery
//! - **Observability**: structured `tracing` logs and an in-process diagnostics collector
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sentinelq::prelude::*;
//! use serde_json::{Value, json};
//!
//! #[tokio::main]
//! async fn main() -> SentinelResult<()> {
//!     let config = SentinelConfig::development();
//!     config.logging.init_tracing();
//!
//!     let runtime = Runtime::new(config)?;
//!     runtime
//!         .processor()
//!         .register_handler("scam_check", |payload: Value| async move {
//!             Ok(json!({ "verdict": "legitimate", "message": payload["message_id"] }))
//!         })
//!         .await;
//!     runtime.start().await?;
//!
//!     let task = InboundMessage::new("SM1", "whatsapp:+15550100", "Pay $50 to get the job")
//!         .into_task("scam_check", None)?;
//!     let task_id = runtime.processor().queue_task(task).await?;
//!     println!("queued {task_id}");
//!
//!     runtime.wait_for_shutdown().await
//! }
//! ```

pub mod backend;
pub mod config;
pub mod degradation;
pub mod diagnostics;
pub mod error;
pub mod fallback;
pub mod intake;
pub mod processor;
pub mod resilience;
pub mod runtime;
pub mod supervisor;
pub mod task;

pub mod prelude {
    pub use crate::backend::{BackendClient, BackendConnector, BackendManager};
    pub use crate::config::*;
    pub use crate::degradation::{DegradationCoordinator, FallbackMode, ServiceProbe, ServiceStatus};
    pub use crate::error::{BackendFailure, BackendResult, SentinelError, SentinelResult};
    pub use crate::intake::{InboundMessage, MediaDescriptor};
    pub use crate::processor::{HandlerRegistry, QueueStatus, TaskHandler, TaskProcessor};
    pub use crate::runtime::Runtime;
    pub use crate::task::{DeadLetter, ProcessingTask, TaskId, TaskPriority, TaskResult, TaskStatus};
    pub use async_trait::async_trait;
}

pub use crate::config::*;
pub use crate::error::{BackendFailure, BackendResult, SentinelError, SentinelResult};
pub use crate::processor::{TaskHandler, TaskProcessor};
pub use crate::runtime::Runtime;
pub use crate::task::{ProcessingTask, TaskId, TaskPriority, TaskStatus};
pub use async_trait::async_trait;
