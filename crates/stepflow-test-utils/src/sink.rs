use std::sync::Mutex;

use stepflow_core::event::{EventSink, EventType, RunEvent};

/// Event sink that keeps every event in memory, in emission order.
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<RunEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RunEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn event_types(&self) -> Vec<EventType> {
        self.events.lock().unwrap().iter().map(|e| e.event_type).collect()
    }

    /// Event types emitted for one node, in order.
    pub fn node_events(&self, key: &str) -> Vec<EventType> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.node_key.as_deref() == Some(key))
            .map(|e| e.event_type)
            .collect()
    }

    /// The run-level events (no node key), in order.
    pub fn run_events(&self) -> Vec<EventType> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.node_key.is_none())
            .map(|e| e.event_type)
            .collect()
    }

    /// First event of `event_type` for `key`, if any.
    pub fn find(&self, key: &str, event_type: EventType) -> Option<RunEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.node_key.as_deref() == Some(key) && e.event_type == event_type)
            .cloned()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

impl EventSink for CollectingSink {
    fn emit(&self, event: RunEvent) {
        self.events.lock().unwrap().push(event);
    }
}
