//! Session lifecycle events.
//!
//! Dispatcher, scheduler, correlator and payment trigger report what they did
//! to a session through an `Arc<dyn EventSink>`. The server wires in
//! [`TracingSink`]; tests capture events to assert on them.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::types::{EventType, NurtureEvent};

pub trait EventSink: Send + Sync {
    fn emit(&self, event: NurtureEvent);
}

/// Drops every event.
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _event: NurtureEvent) {}
}

/// Logs each session event at debug level.
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: NurtureEvent) {
        tracing::debug!(
            event_type = ?event.event_type,
            session_id = %event.session_id,
            stage = ?event.stage,
            detail = ?event.detail,
            "Session event"
        );
    }
}

/// Keeps emitted session events in memory.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<NurtureEvent>>,
}

impl CaptureSink {
    pub fn count_type(&self, event_type: EventType) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    /// Most recent event of the given type.
    pub fn last_of(&self, event_type: EventType) -> Option<NurtureEvent> {
        self.events
            .lock()
            .iter()
            .rev()
            .find(|e| e.event_type == event_type)
            .cloned()
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, event: NurtureEvent) {
        self.events.lock().push(event);
    }
}

/// Stamps a session event with a fresh id and the current time.
pub fn make_event(
    event_type: EventType,
    session_id: Uuid,
    stage: Option<u32>,
    detail: Option<String>,
) -> NurtureEvent {
    NurtureEvent {
        event_id: Uuid::new_v4(),
        event_type,
        session_id,
        stage,
        detail,
        timestamp: Utc::now(),
    }
}

pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpSink)
}

pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::default())
}
