//! Enrollment: creates or updates a session and assigns its scenario.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

use nurture_channels::ConversionReporter;
use nurture_core::attribution::UserData;
use nurture_core::config::LinksConfig;
use nurture_core::error::{NurtureError, NurtureResult};
use nurture_core::event_bus::{make_event, EventSink};
use nurture_core::types::{EventType, SessionRecord};

use crate::store::SessionStore;
use crate::types::EnrollmentRequest;

pub const LEAD_EVENT: &str = "Lead";

pub struct EnrollmentService {
    store: SessionStore,
    reporter: Arc<ConversionReporter>,
    links: LinksConfig,
    event_sink: Arc<dyn EventSink>,
}

impl EnrollmentService {
    pub fn new(store: SessionStore, reporter: Arc<ConversionReporter>, links: LinksConfig) -> Self {
        Self {
            store,
            reporter,
            links,
            event_sink: nurture_core::event_bus::noop_sink(),
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Enrolls a session. Re-enrolling into the same scenario refreshes the
    /// captured data but never restarts the sequence; a different scenario
    /// is a conflict.
    pub async fn enroll(
        &self,
        request: EnrollmentRequest,
        now: DateTime<Utc>,
    ) -> NurtureResult<SessionRecord> {
        let email = request.email.trim().to_string();
        if email.is_empty() || !email.contains('@') {
            return Err(NurtureError::MalformedPayload("a valid email is required".into()));
        }

        let session_id = request.session_id.unwrap_or_else(Uuid::new_v4);
        if !self.store.contains(&session_id) {
            // A concurrent enrollment may win the insert; the update below
            // then applies on top of it.
            let _ = self
                .store
                .insert(SessionRecord::new(session_id, Some(email.clone()), now));
        }

        let scenario = request.scenario;
        let (record, newly_assigned) = self.store.update(&session_id, |s| {
            let newly_assigned = s.assign_scenario(scenario, now)?;
            s.email = Some(email.clone());
            if newly_assigned {
                s.assessment = request.assessment.clone();
                s.personalization = None;
            }
            merge_attribution(s, &request);
            s.updated_at = now;
            Ok((s.clone(), newly_assigned))
        })?;

        if newly_assigned {
            metrics::counter!("nurture.sessions.enrolled", "scenario" => scenario.as_str())
                .increment(1);
            info!(session_id = %session_id, scenario = scenario.as_str(), "Session enrolled");
            self.event_sink.emit(make_event(
                EventType::SessionEnrolled,
                session_id,
                None,
                Some(scenario.as_str().to_string()),
            ));
        }

        if let Some(event_id) = request.lead_event_id.as_deref() {
            let user = UserData {
                email: Some(email),
                external_id: Some(session_id.to_string()),
                client_ip: record.attribution.client_ip.clone(),
                user_agent: record.attribution.user_agent.clone(),
                fbp: record.attribution.fbp.clone(),
                fbc: record.attribution.fbc.clone(),
                ..Default::default()
            };
            let source_url = request
                .source_url
                .clone()
                .unwrap_or_else(|| self.links.app_url.clone());
            let outcome = self
                .reporter
                .report(
                    LEAD_EVENT,
                    event_id,
                    &source_url,
                    &user,
                    serde_json::json!({ "content_name": scenario.as_str() }),
                )
                .await;
            outcome.acknowledge(LEAD_EVENT, event_id);
        }

        Ok(record)
    }

    /// Opt-out from the unsubscribe link. Returns `false` when the session
    /// had already opted out.
    pub fn unsubscribe(&self, session_id: Uuid, now: DateTime<Utc>) -> NurtureResult<bool> {
        let changed = self.store.opt_out(&session_id, now)?;
        if changed {
            metrics::counter!("nurture.sessions.opted_out").increment(1);
            info!(session_id = %session_id, "Session unsubscribed via link");
            self.event_sink.emit(make_event(
                EventType::OptedOut,
                session_id,
                None,
                Some("unsubscribe_link".into()),
            ));
        }
        Ok(changed)
    }
}

fn merge_attribution(session: &mut SessionRecord, request: &EnrollmentRequest) {
    let incoming = &request.attribution;
    let current = &mut session.attribution;
    for (slot, value) in [
        (&mut current.fbp, &incoming.fbp),
        (&mut current.fbc, &incoming.fbc),
        (&mut current.client_ip, &incoming.client_ip),
        (&mut current.user_agent, &incoming.user_agent),
    ] {
        if value.is_some() {
            slot.clone_from(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nurture_channels::testing::RecordingAttributionApi;
    use nurture_core::config::AttributionConfig;
    use nurture_core::types::{AssessmentSummary, AttributionContext, Scenario};

    fn request(session_id: Option<Uuid>, scenario: Scenario) -> EnrollmentRequest {
        EnrollmentRequest {
            session_id,
            email: "lead@example.com".into(),
            scenario,
            assessment: AssessmentSummary {
                questions_answered: 7,
                ..Default::default()
            },
            attribution: AttributionContext {
                fbp: Some("fb.1.123.456".into()),
                ..Default::default()
            },
            lead_event_id: None,
            source_url: None,
        }
    }

    fn service() -> (EnrollmentService, SessionStore) {
        let store = SessionStore::new();
        let svc = EnrollmentService::new(
            store.clone(),
            Arc::new(ConversionReporter::disabled()),
            LinksConfig::default(),
        );
        (svc, store)
    }

    #[tokio::test]
    async fn test_enroll_creates_session_at_stage_zero() {
        let (svc, store) = service();
        let now = Utc::now();
        let record = svc
            .enroll(request(None, Scenario::AbandonedFunnel), now)
            .await
            .unwrap();
        assert_eq!(record.stage, 0);
        assert_eq!(record.reference_at, Some(now));
        assert_eq!(record.assessment.questions_answered, 7);
        assert_eq!(record.attribution.fbp.as_deref(), Some("fb.1.123.456"));
        assert!(store.contains(&record.id));
    }

    #[tokio::test]
    async fn test_reenroll_same_scenario_keeps_anchor() {
        let (svc, _) = service();
        let id = Uuid::new_v4();
        let t0 = Utc::now();
        svc.enroll(request(Some(id), Scenario::AbandonedCheckout), t0)
            .await
            .unwrap();
        let again = svc
            .enroll(
                request(Some(id), Scenario::AbandonedCheckout),
                t0 + chrono::Duration::hours(1),
            )
            .await
            .unwrap();
        assert_eq!(again.reference_at, Some(t0));
    }

    #[tokio::test]
    async fn test_different_scenario_conflicts() {
        let (svc, _) = service();
        let id = Uuid::new_v4();
        svc.enroll(request(Some(id), Scenario::AbandonedFunnel), Utc::now())
            .await
            .unwrap();
        let err = svc
            .enroll(request(Some(id), Scenario::ViewedTeaserResult), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, NurtureError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_invalid_email_rejected() {
        let (svc, store) = service();
        let mut req = request(None, Scenario::AbandonedFunnel);
        req.email = "  ".into();
        assert!(svc.enroll(req, Utc::now()).await.is_err());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_lead_reported_with_shared_event_id() {
        let api = Arc::new(RecordingAttributionApi::new());
        let config = AttributionConfig {
            pixel_id: Some("1".into()),
            access_token: Some("t".into()),
            ..Default::default()
        };
        let store = SessionStore::new();
        let svc = EnrollmentService::new(
            store,
            Arc::new(ConversionReporter::new(Some(api.clone()), &config)),
            LinksConfig::default(),
        );

        let mut req = request(None, Scenario::AbandonedFunnel);
        req.lead_event_id = Some("lead_abc".into());
        svc.enroll(req, Utc::now()).await.unwrap();

        api.receive_from_browser(LEAD_EVENT, "lead_abc");
        let accepted = api.accepted();
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].event_id, "lead_abc");
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_session() {
        let (svc, _) = service();
        assert!(matches!(
            svc.unsubscribe(Uuid::new_v4(), Utc::now()),
            Err(NurtureError::SessionNotFound(_))
        ));
    }
}
