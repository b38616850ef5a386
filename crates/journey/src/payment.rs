//! Payment completion trigger.
//!
//! Verifies the processor's signed webhook, flips the session to paid
//! exactly once, then sends one confirmation and one `Purchase` conversion.
//! Replays of the same completion are acknowledged without side effects.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tracing::{info, warn};
use uuid::Uuid;

use nurture_channels::ConversionReporter;
use nurture_core::attribution::{ReportOutcome, UserData};
use nurture_core::config::{LinksConfig, PaymentConfig};
use nurture_core::error::{NurtureError, NurtureResult};
use nurture_core::event_bus::{make_event, EventSink};
use nurture_core::types::EventType;

use crate::dispatcher::DeliveryDispatcher;
use crate::state_machine::{SessionState, SessionStateMachine};
use crate::store::SessionStore;
use crate::types::PaymentOutcome;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "Stripe-Signature";
pub const CHECKOUT_COMPLETED: &str = "checkout.session.completed";
pub const REPORT_UNLOCK: &str = "report_unlock";
pub const PURCHASE_EVENT: &str = "Purchase";

/// Checks `t=<unix>,v1=<hex>` signatures over `"{t}.{payload}"`.
#[derive(Clone)]
pub struct SignatureVerifier {
    secret: Vec<u8>,
    tolerance: chrono::Duration,
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("tolerance", &self.tolerance)
            .finish_non_exhaustive()
    }
}

impl SignatureVerifier {
    pub fn new(secret: &str, tolerance_secs: i64) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
            tolerance: chrono::Duration::seconds(tolerance_secs),
        }
    }

    fn mac(&self, timestamp: i64, payload: &[u8]) -> NurtureResult<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| NurtureError::Config(format!("webhook secret: {e}")))?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        Ok(mac)
    }

    /// Produces a header value in the processor's format.
    pub fn sign(&self, payload: &[u8], timestamp: i64) -> NurtureResult<String> {
        let digest = self.mac(timestamp, payload)?.finalize().into_bytes();
        Ok(format!("t={timestamp},v1={}", hex::encode(digest)))
    }

    pub fn verify(&self, header: &str, payload: &[u8], now: DateTime<Utc>) -> NurtureResult<()> {
        let mut timestamp: Option<i64> = None;
        let mut candidates: Vec<Vec<u8>> = Vec::new();
        for part in header.split(',') {
            let Some((key, value)) = part.trim().split_once('=') else {
                continue;
            };
            match key {
                "t" => timestamp = value.parse().ok(),
                "v1" => {
                    if let Ok(bytes) = hex::decode(value) {
                        candidates.push(bytes);
                    }
                }
                _ => {}
            }
        }

        let timestamp = timestamp
            .ok_or_else(|| NurtureError::InvalidSignature("missing timestamp".into()))?;
        if candidates.is_empty() {
            return Err(NurtureError::InvalidSignature("missing v1 signature".into()));
        }
        let skew = now
            .timestamp()
            .checked_sub(timestamp)
            .and_then(i64::checked_abs)
            .ok_or_else(|| NurtureError::InvalidSignature("timestamp out of range".into()))?;
        if skew > self.tolerance.num_seconds() {
            return Err(NurtureError::InvalidSignature(format!(
                "timestamp outside tolerance ({skew}s)"
            )));
        }

        for candidate in &candidates {
            if self.mac(timestamp, payload)?.verify_slice(candidate).is_ok() {
                return Ok(());
            }
        }
        Err(NurtureError::InvalidSignature("signature mismatch".into()))
    }
}

#[derive(Debug, Deserialize)]
struct ProcessorEvent {
    #[serde(rename = "type")]
    event_type: String,
    data: ProcessorEventData,
}

#[derive(Debug, Deserialize)]
struct ProcessorEventData {
    object: CheckoutSession,
}

#[derive(Debug, Deserialize)]
struct CheckoutSession {
    id: String,
    #[serde(default)]
    metadata: HashMap<String, String>,
    #[serde(default)]
    amount_total: Option<i64>,
    #[serde(default)]
    currency: Option<String>,
    #[serde(default)]
    customer_email: Option<String>,
    #[serde(default)]
    customer_details: Option<CustomerDetails>,
}

#[derive(Debug, Deserialize)]
struct CustomerDetails {
    #[serde(default)]
    email: Option<String>,
}

impl CheckoutSession {
    fn session_id(&self) -> Result<Uuid, String> {
        if self.metadata.get("type").map(String::as_str) != Some(REPORT_UNLOCK) {
            return Err("not a report unlock".into());
        }
        let raw = self
            .metadata
            .get("testSessionId")
            .ok_or_else(|| "missing testSessionId".to_string())?;
        Uuid::parse_str(raw.trim()).map_err(|_| format!("bad testSessionId '{raw}'"))
    }

    fn buyer_email(&self) -> Option<String> {
        self.customer_details
            .as_ref()
            .and_then(|d| d.email.clone())
            .or_else(|| self.customer_email.clone())
            .filter(|e| !e.trim().is_empty())
    }
}

pub struct PaymentTrigger {
    store: SessionStore,
    dispatcher: Arc<DeliveryDispatcher>,
    reporter: Arc<ConversionReporter>,
    verifier: Option<SignatureVerifier>,
    links: LinksConfig,
    default_currency: String,
    confirmation_retry: chrono::Duration,
    machine: SessionStateMachine,
    event_sink: Arc<dyn EventSink>,
}

impl PaymentTrigger {
    pub fn new(
        store: SessionStore,
        dispatcher: Arc<DeliveryDispatcher>,
        reporter: Arc<ConversionReporter>,
        payment: &PaymentConfig,
        links: LinksConfig,
    ) -> Self {
        let verifier = payment
            .webhook_secret
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .map(|secret| SignatureVerifier::new(secret, payment.signature_tolerance_secs));
        if verifier.is_none() {
            warn!("No payment webhook secret configured; payment webhooks will be rejected");
        }
        Self {
            store,
            dispatcher,
            reporter,
            verifier,
            links,
            default_currency: payment.default_currency.clone(),
            confirmation_retry: chrono::Duration::seconds(payment.confirmation_retry_secs),
            machine: SessionStateMachine::new(),
            event_sink: nurture_core::event_bus::noop_sink(),
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Handles one raw webhook delivery. `Err` is returned only for
    /// signature and payload problems.
    pub async fn handle(
        &self,
        signature: Option<&str>,
        payload: &[u8],
        now: DateTime<Utc>,
    ) -> NurtureResult<PaymentOutcome> {
        let verifier = self.verifier.as_ref().ok_or_else(|| {
            NurtureError::InvalidSignature("webhook secret not configured".into())
        })?;
        let header = signature
            .ok_or_else(|| NurtureError::InvalidSignature("missing signature header".into()))?;
        if let Err(e) = verifier.verify(header, payload, now) {
            metrics::counter!("nurture.payment.rejected").increment(1);
            warn!(error = %e, "Rejected payment webhook");
            return Err(e);
        }

        let event: ProcessorEvent = serde_json::from_slice(payload)
            .map_err(|e| NurtureError::MalformedPayload(e.to_string()))?;
        if event.event_type != CHECKOUT_COMPLETED {
            return Ok(PaymentOutcome::Ignored {
                reason: format!("event type {}", event.event_type),
            });
        }
        let checkout = event.data.object;
        let session_id = match checkout.session_id() {
            Ok(id) => id,
            Err(reason) => return Ok(PaymentOutcome::Ignored { reason }),
        };

        let buyer_email = checkout.buyer_email();
        let machine = &self.machine;
        let transition = self.store.update(&session_id, |s| {
            let from = SessionState::of(s);
            if from == SessionState::Converted {
                return Ok(None);
            }
            let trigger = machine.check(from, SessionState::Converted)?;
            s.paid = true;
            s.paid_at = Some(now);
            s.dispatch_claim = None;
            if s.email.as_deref().map_or(true, |e| e.trim().is_empty()) {
                s.email = buyer_email.clone();
            }
            s.updated_at = now;
            Ok(Some((from, trigger, s.email.clone(), s.attribution.clone())))
        });

        let (from, trigger, email, attribution) = match transition {
            Ok(Some(applied)) => applied,
            Ok(None) => {
                let confirmation_sent = self.retry_confirmation(session_id, now).await;
                info!(
                    session_id = %session_id,
                    confirmation_sent,
                    "Payment replay, already paid"
                );
                return Ok(PaymentOutcome::AlreadyPaid {
                    session_id,
                    confirmation_sent,
                });
            }
            Err(NurtureError::SessionNotFound(_)) => {
                warn!(session_id = %session_id, "Payment for unknown session");
                return Ok(PaymentOutcome::Ignored {
                    reason: "unknown session".into(),
                });
            }
            Err(e) => return Err(e),
        };

        metrics::counter!("nurture.payment.completed").increment(1);
        info!(
            session_id = %session_id,
            from = from.as_str(),
            trigger,
            checkout_id = %checkout.id,
            "Report unlocked"
        );
        self.event_sink.emit(make_event(
            EventType::PaymentCompleted,
            session_id,
            None,
            Some(checkout.id.clone()),
        ));

        let confirmation_sent = self
            .dispatcher
            .dispatch_confirmation(session_id, now)
            .await
            .unwrap_or(false);

        let event_id = format!("purchase_{}", checkout.id);
        let user = UserData {
            email,
            external_id: Some(session_id.to_string()),
            client_ip: attribution.client_ip,
            user_agent: attribution.user_agent,
            fbp: attribution.fbp,
            fbc: attribution.fbc,
            ..Default::default()
        };
        let currency = checkout
            .currency
            .as_deref()
            .map(str::to_uppercase)
            .unwrap_or_else(|| self.default_currency.clone());
        let custom_data = serde_json::json!({
            "currency": currency,
            "value": checkout.amount_total.map(|cents| cents as f64 / 100.0),
            "content_name": "Full report",
        });
        let source_url = format!("{}/results", self.links.app_url.trim_end_matches('/'));
        let outcome = self
            .reporter
            .report(PURCHASE_EVENT, &event_id, &source_url, &user, custom_data)
            .await;
        if outcome == ReportOutcome::Sent {
            self.event_sink.emit(make_event(
                EventType::ConversionReported,
                session_id,
                None,
                Some(event_id.clone()),
            ));
        }
        outcome.acknowledge(PURCHASE_EVENT, &event_id);

        Ok(PaymentOutcome::Unlocked {
            session_id,
            confirmation_sent,
        })
    }

    /// Resends a confirmation whose first attempt failed, as long as the
    /// payment is recent enough. The dispatcher's atomic mark keeps it to
    /// one message.
    async fn retry_confirmation(&self, session_id: Uuid, now: DateTime<Utc>) -> bool {
        let due = self.store.get(&session_id).is_some_and(|s| {
            s.confirmation_sent_at.is_none()
                && s.paid_at.is_some_and(|paid_at| now - paid_at <= self.confirmation_retry)
        });
        if !due {
            return false;
        }
        info!(session_id = %session_id, "Retrying payment confirmation");
        self.dispatcher
            .dispatch_confirmation(session_id, now)
            .await
            .unwrap_or(false)
    }
}
