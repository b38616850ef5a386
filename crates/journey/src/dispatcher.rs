//! Delivery dispatcher: claim, bind, send, commit.
//!
//! A stage is sent under a short claim on the session record so that two
//! overlapping sweeps cannot both send it. The history entry, stage and
//! `last_sent_at` are written together only after the provider accepted the
//! message; any failure releases the claim and leaves the record as it was.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use nurture_core::channels::{MessageSender, OutboundMessage, SendReceipt, TrackingAttributes};
use nurture_core::config::{DeliveryConfig, LinksConfig};
use nurture_core::error::{NurtureError, NurtureResult};
use nurture_core::event_bus::{make_event, EventSink};
use nurture_core::templates::{ContentBinder, TemplateKey};
use nurture_core::types::{
    correlation_tag, DispatchClaim, EventType, PersonalizationSnapshot, Scenario, CONFIRMATION_TAG,
};

use crate::personalization::ensure_snapshot;
use crate::store::SessionStore;
use crate::types::DispatchOutcome;

enum Claim {
    Acquired {
        to: String,
        scenario: Scenario,
        snapshot: PersonalizationSnapshot,
        claim: DispatchClaim,
    },
    Busy,
    Ineligible,
}

pub struct DeliveryDispatcher {
    store: SessionStore,
    sender: Arc<dyn MessageSender>,
    binder: Arc<dyn ContentBinder>,
    links: LinksConfig,
    send_timeout: Duration,
    claim_ttl: chrono::Duration,
    event_sink: Arc<dyn EventSink>,
}

impl DeliveryDispatcher {
    pub fn new(
        store: SessionStore,
        sender: Arc<dyn MessageSender>,
        binder: Arc<dyn ContentBinder>,
        links: LinksConfig,
        delivery: &DeliveryConfig,
    ) -> NurtureResult<Self> {
        // A claim must outlive the send it guards, or a second sweep could
        // take it over mid-flight.
        let claim_ttl_ms = u64::try_from(delivery.claim_ttl_secs)
            .unwrap_or(0)
            .saturating_mul(1000);
        if delivery.send_timeout_ms == 0 || delivery.send_timeout_ms >= claim_ttl_ms {
            return Err(NurtureError::Config(format!(
                "delivery.send_timeout_ms ({}) must be positive and below delivery.claim_ttl_secs ({}s)",
                delivery.send_timeout_ms, delivery.claim_ttl_secs
            )));
        }
        Ok(Self {
            store,
            sender,
            binder,
            links,
            send_timeout: Duration::from_millis(delivery.send_timeout_ms),
            claim_ttl: chrono::Duration::seconds(delivery.claim_ttl_secs),
            event_sink: nurture_core::event_bus::noop_sink(),
        })
    }

    pub fn claim_ttl(&self) -> chrono::Duration {
        self.claim_ttl
    }

    /// Attach an event sink for emitting lifecycle events.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Sends `stage` for the session and commits it to history.
    ///
    /// `Err` means nothing was recorded and the stage stays pending; the
    /// scheduler may retry while the send window is still open.
    pub async fn dispatch(
        &self,
        session_id: Uuid,
        stage: u32,
        now: DateTime<Utc>,
    ) -> NurtureResult<DispatchOutcome> {
        let (to, scenario, snapshot, claim) = match self.claim(session_id, stage, now)? {
            Claim::Acquired {
                to,
                scenario,
                snapshot,
                claim,
            } => (to, scenario, snapshot, claim),
            Claim::Busy => {
                debug!(session_id = %session_id, stage, "Dispatch skipped, session busy");
                return Ok(DispatchOutcome::Busy);
            }
            Claim::Ineligible => return Ok(DispatchOutcome::Ineligible),
        };

        let tag = correlation_tag(scenario, stage);
        let started = Instant::now();
        let sent = self
            .bind_and_send(
                TemplateKey::Stage { scenario, stage },
                &snapshot,
                to,
                TrackingAttributes {
                    session_id,
                    correlation_tag: tag.clone(),
                    scenario: Some(scenario),
                    stage: Some(stage),
                },
            )
            .await;

        let receipt = match sent {
            Ok(receipt) => receipt,
            Err(e) => {
                self.release(session_id, claim);
                metrics::counter!("nurture.dispatch.failed", "kind" => e.kind()).increment(1);
                warn!(
                    session_id = %session_id,
                    stage,
                    scenario = scenario.as_str(),
                    error = %e,
                    "Stage dispatch failed"
                );
                self.event_sink.emit(make_event(
                    EventType::DispatchFailed,
                    session_id,
                    Some(stage),
                    Some(e.kind().to_string()),
                ));
                return Err(e);
            }
        };

        let provider_message_id = receipt.provider_message_id.clone();
        self.store.update(&session_id, |s| {
            s.record_dispatch(stage, Some(receipt.provider_message_id), now)
        })?;

        metrics::counter!("nurture.dispatch.sent", "scenario" => scenario.as_str()).increment(1);
        metrics::histogram!("nurture.dispatch.latency_ms")
            .record(started.elapsed().as_secs_f64() * 1000.0);
        info!(
            session_id = %session_id,
            stage,
            tag = %tag,
            provider = self.sender.provider_name(),
            "Stage dispatched"
        );
        self.event_sink.emit(make_event(
            EventType::StageDispatched,
            session_id,
            Some(stage),
            Some(tag.clone()),
        ));

        Ok(DispatchOutcome::Sent {
            stage,
            correlation_tag: tag,
            provider_message_id,
        })
    }

    /// Sends the one-off payment confirmation. Returns `false` when it was
    /// already sent or there is no address to send to. Confirmations do not
    /// touch the stage sequence.
    pub async fn dispatch_confirmation(
        &self,
        session_id: Uuid,
        now: DateTime<Utc>,
    ) -> NurtureResult<bool> {
        let links = &self.links;
        let claimed = self.store.update(&session_id, |s| {
            if s.confirmation_sent_at.is_some() {
                return Ok(None);
            }
            let Some(to) = s.email.clone().filter(|e| !e.trim().is_empty()) else {
                return Ok(None);
            };
            s.confirmation_sent_at = Some(now);
            let snapshot = ensure_snapshot(s, links, now);
            Ok(Some((to, s.scenario, snapshot)))
        })?;

        let Some((to, scenario, snapshot)) = claimed else {
            debug!(session_id = %session_id, "Confirmation not sent");
            return Ok(false);
        };

        let sent = self
            .bind_and_send(
                TemplateKey::PaymentConfirmation,
                &snapshot,
                to,
                TrackingAttributes {
                    session_id,
                    correlation_tag: CONFIRMATION_TAG.to_string(),
                    scenario,
                    stage: None,
                },
            )
            .await;

        if let Err(e) = sent {
            // Unmark so a replayed payment webhook can retry.
            let released = self.store.update(&session_id, |s| {
                if s.confirmation_sent_at == Some(now) {
                    s.confirmation_sent_at = None;
                }
                Ok(())
            });
            if let Err(release_err) = released {
                warn!(session_id = %session_id, error = %release_err, "Failed to unmark confirmation");
            }
            metrics::counter!("nurture.confirmation.failed", "kind" => e.kind()).increment(1);
            warn!(session_id = %session_id, error = %e, "Payment confirmation failed");
            self.event_sink.emit(make_event(
                EventType::DispatchFailed,
                session_id,
                None,
                Some(format!("{CONFIRMATION_TAG}:{}", e.kind())),
            ));
            return Err(e);
        }

        metrics::counter!("nurture.confirmation.sent").increment(1);
        info!(session_id = %session_id, "Payment confirmation sent");
        self.event_sink.emit(make_event(
            EventType::ConfirmationSent,
            session_id,
            None,
            None,
        ));
        Ok(true)
    }

    fn claim(&self, session_id: Uuid, stage: u32, now: DateTime<Utc>) -> NurtureResult<Claim> {
        let links = &self.links;
        let claim_ttl = self.claim_ttl;
        self.store.update(&session_id, |s| {
            let Some(scenario) = s.scenario else {
                return Ok(Claim::Ineligible);
            };
            if !s.is_schedulable() {
                return Ok(Claim::Ineligible);
            }
            if s.stage + 1 != stage {
                return Ok(Claim::Busy);
            }
            if let Some(existing) = s.dispatch_claim {
                if existing.is_live(now, claim_ttl) {
                    return Ok(Claim::Busy);
                }
                warn!(
                    session_id = %session_id,
                    stage = existing.stage,
                    "Taking over stale dispatch claim"
                );
            }
            let Some(to) = s.email.clone() else {
                return Ok(Claim::Ineligible);
            };

            let claim = DispatchClaim {
                stage,
                claimed_at: now,
            };
            s.dispatch_claim = Some(claim);
            let snapshot = ensure_snapshot(s, links, now);
            Ok(Claim::Acquired {
                to,
                scenario,
                snapshot,
                claim,
            })
        })
    }

    fn release(&self, session_id: Uuid, claim: DispatchClaim) {
        let released = self.store.update(&session_id, |s| {
            if s.dispatch_claim == Some(claim) {
                s.dispatch_claim = None;
            }
            Ok(())
        });
        if let Err(e) = released {
            warn!(session_id = %session_id, error = %e, "Failed to release dispatch claim");
        }
    }

    async fn bind_and_send(
        &self,
        key: TemplateKey,
        snapshot: &PersonalizationSnapshot,
        to: String,
        tracking: TrackingAttributes,
    ) -> NurtureResult<SendReceipt> {
        let rendered = self.binder.bind(key, snapshot)?;
        let message = OutboundMessage {
            to,
            subject: rendered.subject,
            html: rendered.html,
            text: rendered.text,
            tracking,
        };
        match tokio::time::timeout(self.send_timeout, self.sender.send(&message)).await {
            Ok(result) => result,
            Err(_) => Err(NurtureError::Timeout(self.send_timeout.as_millis() as u64)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nurture_channels::testing::RecordingSender;
    use nurture_channels::SequenceTemplates;
    use nurture_core::event_bus::capture_sink;
    use nurture_core::types::SessionRecord;

    struct Fixture {
        store: SessionStore,
        sender: Arc<RecordingSender>,
        dispatcher: DeliveryDispatcher,
    }

    fn fixture(delivery: DeliveryConfig) -> Fixture {
        let store = SessionStore::new();
        let sender = Arc::new(RecordingSender::new());
        let dispatcher = DeliveryDispatcher::new(
            store.clone(),
            sender.clone(),
            Arc::new(SequenceTemplates::new()),
            LinksConfig::default(),
            &delivery,
        )
        .unwrap();
        Fixture {
            store,
            sender,
            dispatcher,
        }
    }

    fn enroll(store: &SessionStore, scenario: Scenario, now: DateTime<Utc>) -> Uuid {
        let mut record = SessionRecord::new(Uuid::new_v4(), Some("lead@example.com".into()), now);
        record.assign_scenario(scenario, now).unwrap();
        let id = record.id;
        store.insert(record).unwrap();
        id
    }

    #[tokio::test]
    async fn test_dispatch_commits_history_with_stage() {
        let f = fixture(DeliveryConfig::default());
        let now = Utc::now();
        let id = enroll(&f.store, Scenario::AbandonedCheckout, now);

        let outcome = f.dispatcher.dispatch(id, 1, now).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Sent { stage: 1, ref correlation_tag, .. } if correlation_tag == "C1"));

        let s = f.store.get(&id).unwrap();
        assert_eq!(s.stage, 1);
        assert_eq!(s.history.len(), 1);
        assert_eq!(s.history[0].provider_message_id.as_deref(), Some("test-1"));
        assert_eq!(s.last_sent_at, Some(now));
        assert!(s.dispatch_claim.is_none());
        assert!(s.personalization.is_some());

        let sent = f.sender.sent();
        assert_eq!(sent[0].tracking.correlation_tag, "C1");
        assert_eq!(sent[0].to, "lead@example.com");
    }

    #[tokio::test]
    async fn test_failed_send_leaves_stage_pending() {
        let sink = capture_sink();
        let mut f = fixture(DeliveryConfig::default());
        f.dispatcher = f.dispatcher.with_event_sink(sink.clone());
        let now = Utc::now();
        let id = enroll(&f.store, Scenario::AbandonedFunnel, now);
        f.sender.fail_next(1);

        let err = f.dispatcher.dispatch(id, 1, now).await.unwrap_err();
        assert!(err.is_retryable());
        let s = f.store.get(&id).unwrap();
        assert_eq!(s.stage, 0);
        assert!(s.history.is_empty());
        assert!(s.dispatch_claim.is_none());
        assert_eq!(sink.count_type(EventType::DispatchFailed), 1);

        // Next attempt succeeds.
        assert!(matches!(
            f.dispatcher.dispatch(id, 1, now).await.unwrap(),
            DispatchOutcome::Sent { .. }
        ));
    }

    #[tokio::test]
    async fn test_unmapped_template_is_not_sent() {
        let f = fixture(DeliveryConfig::default());
        let now = Utc::now();
        let id = enroll(&f.store, Scenario::AbandonedCheckout, now);
        f.store
            .update(&id, |s| {
                s.stage = 3;
                Ok(())
            })
            .unwrap();

        let err = f.dispatcher.dispatch(id, 4, now).await.unwrap_err();
        assert!(matches!(err, NurtureError::UnmappedTemplate { stage: 4, .. }));
        assert!(!err.is_retryable());
        assert_eq!(f.sender.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_slow_provider_times_out() {
        let f = fixture(DeliveryConfig {
            send_timeout_ms: 20,
            ..Default::default()
        });
        f.sender.set_delay(Duration::from_millis(200));
        let now = Utc::now();
        let id = enroll(&f.store, Scenario::AbandonedFunnel, now);

        let err = f.dispatcher.dispatch(id, 1, now).await.unwrap_err();
        assert!(matches!(err, NurtureError::Timeout(20)));
        assert_eq!(f.store.get(&id).unwrap().stage, 0);
    }

    #[test]
    fn test_send_timeout_must_fit_inside_claim_ttl() {
        let build = |send_timeout_ms, claim_ttl_secs| {
            DeliveryDispatcher::new(
                SessionStore::new(),
                Arc::new(RecordingSender::new()),
                Arc::new(SequenceTemplates::new()),
                LinksConfig::default(),
                &DeliveryConfig {
                    send_timeout_ms,
                    claim_ttl_secs,
                },
            )
        };
        assert!(build(10_000, 120).is_ok());
        assert!(matches!(build(120_000, 120), Err(NurtureError::Config(_))));
        assert!(matches!(build(300_000, 120), Err(NurtureError::Config(_))));
        assert!(matches!(build(0, 120), Err(NurtureError::Config(_))));
        assert!(matches!(build(10_000, -1), Err(NurtureError::Config(_))));
    }

    #[tokio::test]
    async fn test_live_claim_blocks_second_dispatch() {
        let f = fixture(DeliveryConfig::default());
        let now = Utc::now();
        let id = enroll(&f.store, Scenario::AbandonedFunnel, now);
        f.store
            .update(&id, |s| {
                s.dispatch_claim = Some(DispatchClaim {
                    stage: 1,
                    claimed_at: now,
                });
                Ok(())
            })
            .unwrap();

        assert_eq!(
            f.dispatcher.dispatch(id, 1, now).await.unwrap(),
            DispatchOutcome::Busy
        );
        // An abandoned claim is taken over once it is older than the TTL.
        let later = now + chrono::Duration::seconds(600);
        assert!(matches!(
            f.dispatcher.dispatch(id, 1, later).await.unwrap(),
            DispatchOutcome::Sent { .. }
        ));
    }

    #[tokio::test]
    async fn test_paid_session_is_ineligible() {
        let f = fixture(DeliveryConfig::default());
        let now = Utc::now();
        let id = enroll(&f.store, Scenario::AbandonedFunnel, now);
        f.store
            .update(&id, |s| {
                s.paid = true;
                Ok(())
            })
            .unwrap();
        assert_eq!(
            f.dispatcher.dispatch(id, 1, now).await.unwrap(),
            DispatchOutcome::Ineligible
        );
        assert_eq!(f.sender.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_confirmation_sent_once_without_history() {
        let f = fixture(DeliveryConfig::default());
        let now = Utc::now();
        let id = enroll(&f.store, Scenario::AbandonedCheckout, now);

        assert!(f.dispatcher.dispatch_confirmation(id, now).await.unwrap());
        assert!(!f.dispatcher.dispatch_confirmation(id, now).await.unwrap());

        let s = f.store.get(&id).unwrap();
        assert!(s.history.is_empty());
        assert_eq!(s.stage, 0);
        assert_eq!(s.confirmation_sent_at, Some(now));
        assert_eq!(f.sender.sent()[0].tracking.correlation_tag, CONFIRMATION_TAG);
    }
}
