//! Events emitted towards the host platform.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::object::ObjectKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Normal,
    Warning,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Normal => f.write_str("Normal"),
            EventType::Warning => f.write_str("Warning"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub object: ObjectKey,
    pub event_type: EventType,
    pub reason: String,
    pub message: String,
    /// Revision the event refers to, when there is one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn normal(object: ObjectKey, reason: &str, message: impl Into<String>) -> Self {
        Self::new(object, EventType::Normal, reason, message)
    }

    pub fn warning(object: ObjectKey, reason: &str, message: impl Into<String>) -> Self {
        Self::new(object, EventType::Warning, reason, message)
    }

    fn new(object: ObjectKey, event_type: EventType, reason: &str, message: impl Into<String>) -> Self {
        Self {
            object,
            event_type,
            reason: reason.to_string(),
            message: message.into(),
            revision: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }
}

/// Sink for events. Implementations must not block the pipeline.
pub trait EventRecorder: Send + Sync {
    fn record(&self, event: Event);
}

/// Recorder that writes events to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogRecorder;

impl EventRecorder for LogRecorder {
    fn record(&self, event: Event) {
        let revision = event.revision.as_deref().unwrap_or("");
        match event.event_type {
            EventType::Normal => info!(
                object = %event.object,
                reason = %event.reason,
                revision,
                "{}",
                event.message
            ),
            EventType::Warning => warn!(
                object = %event.object,
                reason = %event.reason,
                revision,
                "{}",
                event.message
            ),
        }
    }
}
