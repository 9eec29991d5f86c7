//! Conversion of inbound webhook messages into processing tasks.
//!
//! The webhook acknowledges the provider quickly and hands the actual check to the
//! [`TaskProcessor`](crate::processor::TaskProcessor). Messages carrying media need
//! the slower analysis path and are queued ahead of plain text.
//!
//! ```rust
//! use sentinelq::intake::{InboundMessage, MediaDescriptor};
//! use sentinelq::task::TaskPriority;
//!
//! let message = InboundMessage::new("SM42", "whatsapp:+15550100", "Is this job offer real?")
//!     .with_media(MediaDescriptor::new("https://media.example/abc", "image/jpeg"));
//! assert_eq!(message.priority(), TaskPriority::High);
//!
//! let task = message.into_task("scam_check", None).unwrap();
//! assert_eq!(task.correlation_id, "SM42");
//! assert_eq!(task.priority, TaskPriority::High);
//! ```

use crate::error::SentinelResult;
use crate::task::{ProcessingTask, TaskPriority};
use serde::{Deserialize, Serialize};

/// Attachment on an inbound message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaDescriptor {
    pub url: String,
    pub content_type: String,
}

impl MediaDescriptor {
    pub fn new(url: impl Into<String>, content_type: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            content_type: content_type.into(),
        }
    }

    pub fn is_image(&self) -> bool {
        self.content_type.starts_with("image/")
    }
}

/// A message as received by the webhook
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Provider message id; becomes the task's correlation id
    pub message_id: String,
    pub sender: String,
    pub body: String,
    #[serde(default)]
    pub media: Vec<MediaDescriptor>,
}

impl InboundMessage {
    pub fn new(message_id: impl Into<String>, sender: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            sender: sender.into(),
            body: body.into(),
            media: Vec::new(),
        }
    }

    pub fn with_media(mut self, media: MediaDescriptor) -> Self {
        self.media.push(media);
        self
    }

    pub fn has_media(&self) -> bool {
        !self.media.is_empty()
    }

    /// Media-bearing messages are HIGH, everything else NORMAL
    pub fn priority(&self) -> TaskPriority {
        if self.has_media() {
            TaskPriority::High
        } else {
            TaskPriority::Normal
        }
    }

    /// Build the task for `task_type`. `priority` overrides [`Self::priority`].
    ///
    /// The whole message becomes the payload.
    pub fn into_task(self, task_type: &str, priority: Option<TaskPriority>) -> SentinelResult<ProcessingTask> {
        let priority = priority.unwrap_or_else(|| self.priority());
        let correlation_id = self.message_id.clone();
        let payload = serde_json::to_value(&self)?;

        tracing::debug!(
            correlation_id = %correlation_id,
            media = self.media.len(),
            priority = priority.as_str(),
            "Inbound message converted to task"
        );

        Ok(ProcessingTask::new(task_type, payload)
            .with_priority(priority)
            .with_correlation_id(correlation_id))
    }
}
