//! Run event bus: progress of background runs, published for delivery.
//!
//! The run registry publishes here; SSE/WebSocket layers subscribe and
//! forward what they care about without being coupled to the registry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::attachment::Attachment;

/// Lifecycle status of a background run. Terminal once not `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Aborted,
    Error,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        self != Self::Running
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events published while background runs progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    /// A run changed status (always a terminal transition).
    Status {
        run_id: String,
        name: String,
        status: RunStatus,
        timestamp: DateTime<Utc>,
    },

    /// Throttled partial output from a running run.
    Delta {
        run_id: String,
        name: String,
        text: String,
    },

    /// A run produced an attachment.
    Attachment {
        run_id: String,
        name: String,
        attachment: Attachment,
    },
}

impl RunEvent {
    /// SSE event name for this event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Status { .. } => "status",
            Self::Delta { .. } => "delta",
            Self::Attachment { .. } => "attachment",
        }
    }

    pub fn run_id(&self) -> &str {
        match self {
            Self::Status { run_id, .. }
            | Self::Delta { run_id, .. }
            | Self::Attachment { run_id, .. } => run_id,
        }
    }
}

/// A broadcast-based event bus for run events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub.
pub struct EventBus {
    sender: broadcast::Sender<Arc<RunEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: RunEvent) {
        if let Err(e) = self.sender.send(Arc::new(event)) {
            tracing::trace!(event = e.0.event_type(), "No subscribers for run event");
        }
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<RunEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn event_bus_publish_subscribe() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(RunEvent::Status {
            run_id: "run_1".into(),
            name: "researcher".into(),
            status: RunStatus::Completed,
            timestamp: Utc::now(),
        });

        let event = rx.recv().await.unwrap();
        match event.as_ref() {
            RunEvent::Status { run_id, status, .. } => {
                assert_eq!(run_id, "run_1");
                assert_eq!(*status, RunStatus::Completed);
            }
            _ => panic!("Expected Status event"),
        }
    }

    #[test]
    fn event_bus_no_subscribers_doesnt_panic() {
        let bus = EventBus::new(16);
        bus.publish(RunEvent::Delta {
            run_id: "run_1".into(),
            name: "writer".into(),
            text: "partial".into(),
        });
    }

    #[test]
    fn event_serialization_uses_type_tag() {
        let event = RunEvent::Delta {
            run_id: "run_9".into(),
            name: "writer".into(),
            text: "hi".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"delta""#));
        assert_eq!(event.event_type(), "delta");
        assert_eq!(event.run_id(), "run_9");
    }

    #[test]
    fn terminal_statuses() {
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Aborted.is_terminal());
        assert!(RunStatus::Error.is_terminal());
        assert_eq!(RunStatus::Error.to_string(), "error");
    }
}
