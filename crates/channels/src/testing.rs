//! In-process doubles for the external send and attribution capabilities.
//! Used by unit and integration tests across the workspace.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use nurture_core::attribution::{AttributionApi, ConversionEvent};
use nurture_core::channels::{MessageSender, OutboundMessage, SendReceipt};
use nurture_core::error::{NurtureError, NurtureResult};
use parking_lot::Mutex;

/// Records every accepted message; can be told to fail or stall.
#[derive(Default)]
pub struct RecordingSender {
    sent: Mutex<Vec<OutboundMessage>>,
    failures_remaining: AtomicUsize,
    delay: Mutex<Option<Duration>>,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` sends fail with a transient error.
    pub fn fail_next(&self, n: usize) {
        self.failures_remaining.store(n, Ordering::SeqCst);
    }

    /// Every send sleeps this long before answering.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }
}

#[async_trait]
impl MessageSender for RecordingSender {
    async fn send(&self, message: &OutboundMessage) -> NurtureResult<SendReceipt> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failing = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(NurtureError::Send("simulated provider outage".into()));
        }

        let mut sent = self.sent.lock();
        sent.push(message.clone());
        Ok(SendReceipt {
            provider_message_id: format!("test-{}", sent.len()),
            accepted_at: Utc::now(),
        })
    }

    fn provider_name(&self) -> &'static str {
        "recording"
    }
}

/// Contract double of the attribution API: it keeps one event per
/// (event name, event id), whichever channel delivered it first.
#[derive(Default)]
pub struct RecordingAttributionApi {
    accepted: Mutex<Vec<ConversionEvent>>,
    seen: Mutex<HashSet<(String, String)>>,
    submissions: AtomicUsize,
    fail: bool,
}

impl RecordingAttributionApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Simulates the browser pixel emitting the same logical event.
    pub fn receive_from_browser(&self, event_name: &str, event_id: &str) {
        self.accept(ConversionEvent {
            event_name: event_name.to_string(),
            event_id: event_id.to_string(),
            event_time: Utc::now(),
            event_source_url: String::new(),
            action_source: "website".to_string(),
            user_data: Default::default(),
            custom_data: serde_json::Value::Null,
        });
    }

    fn accept(&self, event: ConversionEvent) {
        let key = (event.event_name.clone(), event.event_id.clone());
        if self.seen.lock().insert(key) {
            self.accepted.lock().push(event);
        }
    }

    /// Deduplicated events, as the attribution API would count them.
    pub fn accepted(&self) -> Vec<ConversionEvent> {
        self.accepted.lock().clone()
    }

    /// Server-side submissions received, duplicates included.
    pub fn submissions(&self) -> usize {
        self.submissions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AttributionApi for RecordingAttributionApi {
    async fn submit(&self, event: &ConversionEvent) -> NurtureResult<()> {
        self.submissions.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(NurtureError::Attribution("simulated 500".into()));
        }
        self.accept(event.clone());
        Ok(())
    }
}
