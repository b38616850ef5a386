//! Engagement correlator: maps provider webhook events back onto history
//! entries and opt-out flags.
//!
//! Each event in a batch is handled on its own; a malformed or unmatched
//! event is dropped without affecting the rest of the batch. Open and click
//! flags are first-write-wins, so replayed batches change nothing.

use std::sync::Arc;

use tracing::{debug, info, warn};

use nurture_channels::email::parse_event;
use nurture_core::error::{NurtureError, NurtureResult};
use nurture_core::event_bus::{make_event, EventSink};
use nurture_core::types::{EngagementEvent, EngagementKind, EventType, InboundSignal, CONFIRMATION_TAG};

use crate::store::SessionStore;
use crate::types::IngestSummary;

/// What applying one signal did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    Recorded { approximate: bool },
    Duplicate,
    OptedOut,
    AlreadyOptedOut,
    Ignored,
}

pub struct EngagementCorrelator {
    store: SessionStore,
    event_sink: Arc<dyn EventSink>,
}

impl EngagementCorrelator {
    pub fn new(store: SessionStore) -> Self {
        Self {
            store,
            event_sink: nurture_core::event_bus::noop_sink(),
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Applies a provider batch. Never fails as a whole.
    pub fn ingest(&self, batch: &[serde_json::Value]) -> IngestSummary {
        let mut summary = IngestSummary::default();

        for raw in batch {
            let applied = parse_event(raw).and_then(|signal| self.apply(signal));
            match applied {
                Ok(Applied::Recorded { approximate }) => {
                    summary.applied += 1;
                    if approximate {
                        summary.approximate += 1;
                    }
                }
                Ok(Applied::Duplicate) | Ok(Applied::AlreadyOptedOut) => summary.duplicates += 1,
                Ok(Applied::OptedOut) => summary.opt_outs += 1,
                Ok(Applied::Ignored) => summary.ignored += 1,
                Err(e) => {
                    summary.dropped += 1;
                    metrics::counter!("nurture.engagement.dropped", "kind" => e.kind())
                        .increment(1);
                    debug!(error = %e, "Dropped engagement event");
                }
            }
        }

        metrics::counter!("nurture.engagement.applied").increment(summary.applied as u64);
        info!(
            received = batch.len(),
            applied = summary.applied,
            duplicates = summary.duplicates,
            opt_outs = summary.opt_outs,
            dropped = summary.dropped,
            "Engagement batch processed"
        );
        summary
    }

    /// Applies a single classified signal.
    pub fn apply(&self, signal: InboundSignal) -> NurtureResult<Applied> {
        match signal {
            InboundSignal::Engagement(event) => self.apply_engagement(event),
            InboundSignal::OptOut {
                session_id,
                occurred_at,
            } => {
                if self.store.opt_out(&session_id, occurred_at)? {
                    info!(session_id = %session_id, "Session opted out via provider event");
                    self.event_sink.emit(make_event(
                        EventType::OptedOut,
                        session_id,
                        None,
                        Some("provider_event".into()),
                    ));
                    Ok(Applied::OptedOut)
                } else {
                    Ok(Applied::AlreadyOptedOut)
                }
            }
            InboundSignal::Ignored { kind } => {
                debug!(kind = %kind, "Ignoring delivery event");
                Ok(Applied::Ignored)
            }
        }
    }

    fn apply_engagement(&self, event: EngagementEvent) -> NurtureResult<Applied> {
        if event.correlation_tag.as_deref() == Some(CONFIRMATION_TAG) {
            return Ok(Applied::Ignored);
        }

        let session_id = event.session_id;
        let applied = self.store.update(&session_id, |s| {
            // Exact match by tag; fall back to stage number only when the
            // provider did not echo the tag back.
            let (entry, approximate) = match (&event.correlation_tag, event.stage) {
                (Some(tag), _) => (s.history_by_tag_mut(tag), false),
                (None, Some(stage)) => (s.history.iter_mut().find(|h| h.stage == stage), true),
                (None, None) => {
                    return Err(NurtureError::MalformedPayload(
                        "event carries neither tag nor stage".into(),
                    ))
                }
            };
            let entry = entry.ok_or_else(|| {
                NurtureError::MalformedPayload(format!(
                    "no history entry for {:?}/{:?}",
                    event.correlation_tag, event.stage
                ))
            })?;
            let stage = entry.stage;

            let fresh = match event.kind {
                EngagementKind::Opened if !entry.opened => {
                    entry.opened = true;
                    entry.opened_at = Some(event.occurred_at);
                    true
                }
                EngagementKind::Clicked if !entry.clicked => {
                    entry.clicked = true;
                    entry.clicked_at = Some(event.occurred_at);
                    entry.clicked_url = event.url.clone();
                    true
                }
                _ => false,
            };
            if !fresh {
                return Ok((Applied::Duplicate, stage));
            }
            s.updated_at = event.occurred_at.max(s.updated_at);
            Ok((Applied::Recorded { approximate }, stage))
        })?;

        let (applied, stage) = applied;
        if let Applied::Recorded { approximate } = applied {
            if approximate {
                warn!(session_id = %session_id, stage, "Engagement matched by stage number only");
            }
            self.event_sink.emit(make_event(
                EventType::EngagementRecorded,
                session_id,
                Some(stage),
                Some(format!("{:?}", event.kind).to_lowercase()),
            ));
        }
        Ok(applied)
    }
}
