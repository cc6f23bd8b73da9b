//! Event recorder that keeps events in memory.

use std::sync::{Arc, Mutex};

use crate::events::{Event, EventRecorder, EventType};

#[derive(Debug, Clone, Default)]
pub struct MemoryRecorder {
    events: Arc<Mutex<Vec<Event>>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn with_reason(&self, reason: &str) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| e.reason == reason)
            .collect()
    }

    pub fn warnings(&self) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| e.event_type == EventType::Warning)
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

impl EventRecorder for MemoryRecorder {
    fn record(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}
