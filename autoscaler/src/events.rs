use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

/// What an event is attached to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventObject {
    Pod(String),
    NodePool(String),
    NodeClaim(String),
    NodeOverlay(String),
}

#[derive(Debug, Clone)]
pub struct Event {
    pub object: EventObject,
    pub reason: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Bounded in-memory recorder of control-plane events, kept for
/// observability consumers and tests.
pub struct EventRecorder {
    events: Mutex<VecDeque<Event>>,
    capacity: usize,
}

impl EventRecorder {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn record(&self, object: EventObject, reason: &str, message: &str) {
        let mut events = self.events.lock().unwrap();
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(Event {
            object,
            reason: reason.to_string(),
            message: message.to_string(),
            timestamp: Utc::now(),
        });
    }

    pub fn events_for(&self, object: &EventObject) -> Vec<Event> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| &e.object == object)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EventRecorder {
    fn default() -> Self {
        Self::new(1024)
    }
}
