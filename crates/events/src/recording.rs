//! Recording publisher for tests: keeps every event in submission order.

use async_trait::async_trait;
use parking_lot::Mutex;

use voicebridge_core::{CallEvent, EventPublisher, PublishError};

#[derive(Default)]
pub struct RecordingEventPublisher {
    events: Mutex<Vec<CallEvent>>,
}

impl RecordingEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// All recorded events, in the order they were published.
    pub fn events(&self) -> Vec<CallEvent> {
        self.events.lock().clone()
    }

    /// Events for one call, preserving submission order (the per-key
    /// ordering the bus guarantees).
    pub fn events_for_call(&self, call_id: &str) -> Vec<CallEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.call_id == call_id)
            .cloned()
            .collect()
    }

    /// Event type strings for one call, for order assertions.
    pub fn types_for_call(&self, call_id: &str) -> Vec<&'static str> {
        self.events_for_call(call_id)
            .iter()
            .map(|e| e.event_type())
            .collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(&self, event: &CallEvent) -> Result<(), PublishError> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}
