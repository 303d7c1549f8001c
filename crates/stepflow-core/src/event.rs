use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::RunId;

/// Lifecycle event kinds pushed to an [`EventSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    RunStarted,
    RunCompleted,
    RunFailed,
    RunCancelled,
    NodeQueued,
    NodeRunning,
    NodeCompleted,
    NodeFailed,
    NodeSkipped,
    NodeCancelled,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunStarted => "run_started",
            Self::RunCompleted => "run_completed",
            Self::RunFailed => "run_failed",
            Self::RunCancelled => "run_cancelled",
            Self::NodeQueued => "node_queued",
            Self::NodeRunning => "node_running",
            Self::NodeCompleted => "node_completed",
            Self::NodeFailed => "node_failed",
            Self::NodeSkipped => "node_skipped",
            Self::NodeCancelled => "node_cancelled",
        }
    }

    /// Whether this event ends a run.
    pub fn is_run_terminal(&self) -> bool {
        matches!(
            self,
            Self::RunCompleted | Self::RunFailed | Self::RunCancelled
        )
    }

    /// Whether this event ends a node.
    pub fn is_node_terminal(&self) -> bool {
        matches!(
            self,
            Self::NodeCompleted | Self::NodeFailed | Self::NodeSkipped | Self::NodeCancelled
        )
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single progress event of a workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub run_id: RunId,
    pub node_key: Option<String>,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

impl RunEvent {
    pub fn run(run_id: &RunId, event_type: EventType, payload: Value) -> Self {
        Self {
            run_id: run_id.clone(),
            node_key: None,
            event_type,
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn node(run_id: &RunId, node_key: &str, event_type: EventType, payload: Value) -> Self {
        Self {
            run_id: run_id.clone(),
            node_key: Some(node_key.to_string()),
            event_type,
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// Push interface for run events. Implementations must not block.
pub trait EventSink: Send + Sync + 'static {
    fn emit(&self, event: RunEvent);
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<RunEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: RunEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<RunEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventSink for EventBus {
    fn emit(&self, event: RunEvent) {
        self.publish(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_bus_delivers_to_subscribers() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let run_id = RunId::from("run-1");

        bus.emit(RunEvent::node(&run_id, "a", EventType::NodeQueued, json!({})));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.run_id, run_id);
        assert_eq!(event.node_key.as_deref(), Some("a"));
        assert_eq!(event.event_type, EventType::NodeQueued);
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let bus = EventBus::default();
        bus.publish(RunEvent::run(&RunId::new(), EventType::RunStarted, json!({})));
    }

    #[test]
    fn test_event_wire_format() {
        let event = RunEvent::run(&RunId::from("r"), EventType::RunCancelled, json!({"x": 1}));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "run_cancelled");
        assert_eq!(json["run_id"], "r");
        assert!(json["node_key"].is_null());
        assert!(EventType::RunCancelled.is_run_terminal());
        assert!(EventType::NodeSkipped.is_node_terminal());
        assert!(!EventType::NodeRunning.is_node_terminal());
    }
}
