//! Meta Conversions API transport and the best-effort conversion reporter.
//!
//! Nothing here ever returns an error to the caller: a conversion report must
//! not block the checkout or enrollment that triggered it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use nurture_core::attribution::{AttributionApi, ConversionEvent, ReportOutcome, UserData};
use nurture_core::config::AttributionConfig;
use nurture_core::error::{NurtureError, NurtureResult};
use tracing::{debug, info, warn};

/// HTTP transport to the Graph API `/{pixel_id}/events` endpoint.
pub struct MetaConversionsApi {
    client: reqwest::Client,
    endpoint: String,
    access_token: String,
    test_event_code: Option<String>,
}

impl MetaConversionsApi {
    /// Returns `None` when the pixel id or access token is missing.
    pub fn from_config(config: &AttributionConfig) -> NurtureResult<Option<Self>> {
        if !config.is_configured() {
            return Ok(None);
        }
        let (Some(pixel_id), Some(access_token)) =
            (config.pixel_id.as_deref(), config.access_token.as_deref())
        else {
            return Ok(None);
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| NurtureError::Config(format!("attribution client: {e}")))?;

        Ok(Some(Self {
            client,
            endpoint: format!(
                "{}/{}/{}/events",
                config.api_base_url.trim_end_matches('/'),
                config.api_version,
                pixel_id.trim()
            ),
            access_token: access_token.trim().to_string(),
            test_event_code: config.test_event_code.clone(),
        }))
    }

    pub fn payload(&self, event: &ConversionEvent) -> serde_json::Value {
        let mut body = serde_json::json!({
            "data": [{
                "event_name": event.event_name,
                "event_time": event.event_time.timestamp(),
                "event_id": event.event_id,
                "event_source_url": event.event_source_url,
                "action_source": event.action_source,
                "user_data": event.user_data,
                "custom_data": event.custom_data,
            }],
            "access_token": self.access_token,
        });
        if let Some(code) = &self.test_event_code {
            body["test_event_code"] = serde_json::Value::String(code.clone());
        }
        body
    }
}

#[async_trait]
impl AttributionApi for MetaConversionsApi {
    async fn submit(&self, event: &ConversionEvent) -> NurtureResult<()> {
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&self.payload(event))
            .send()
            .await
            .map_err(|e| NurtureError::Http(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(NurtureError::Attribution(format!("{status}: {body}")));
        }
        Ok(())
    }
}

/// Deduplicating, never-failing conversion reporter.
pub struct ConversionReporter {
    api: Option<Arc<dyn AttributionApi>>,
    action_source: String,
    timeout: Duration,
    dedup_window: chrono::Duration,
    /// (event name, event id) pairs sent within the dedup window.
    reported: DashMap<(String, String), DateTime<Utc>>,
}

impl ConversionReporter {
    pub fn new(api: Option<Arc<dyn AttributionApi>>, config: &AttributionConfig) -> Self {
        if api.is_none() {
            info!("Conversion reporting unconfigured; events will only be logged");
        }
        Self {
            api,
            action_source: config.action_source.clone(),
            timeout: Duration::from_millis(config.timeout_ms),
            dedup_window: chrono::Duration::seconds(config.dedup_window_secs),
            reported: DashMap::new(),
        }
    }

    /// Builds the Meta transport from config, if credentials are present.
    pub fn from_config(config: &AttributionConfig) -> Self {
        let api = match MetaConversionsApi::from_config(config) {
            Ok(api) => api.map(|a| Arc::new(a) as Arc<dyn AttributionApi>),
            Err(e) => {
                warn!(error = %e, "Failed to build attribution client, reporting disabled");
                None
            }
        };
        Self::new(api, config)
    }

    /// A reporter that only logs.
    pub fn disabled() -> Self {
        Self::new(None, &AttributionConfig::default())
    }

    pub fn is_enabled(&self) -> bool {
        self.api.is_some()
    }

    /// Reports one conversion. `event_id` must be the id every other channel
    /// (e.g. the browser pixel) uses for the same logical event.
    pub async fn report(
        &self,
        event_name: &str,
        event_id: &str,
        source_url: &str,
        user: &UserData,
        custom_data: serde_json::Value,
    ) -> ReportOutcome {
        if event_id.trim().is_empty() {
            return ReportOutcome::Ignored("missing event id".into());
        }

        let Some(api) = &self.api else {
            debug!(event_name, event_id, "Conversion (unconfigured, not sent)");
            return ReportOutcome::Ignored("attribution not configured".into());
        };

        let key = (event_name.to_string(), event_id.to_string());
        if !self.remember(key.clone(), Utc::now()) {
            metrics::counter!("nurture.conversion.duplicate").increment(1);
            return ReportOutcome::Ignored("already reported".into());
        }

        let event = ConversionEvent {
            event_name: event_name.to_string(),
            event_id: event_id.to_string(),
            event_time: Utc::now(),
            event_source_url: source_url.to_string(),
            action_source: self.action_source.clone(),
            user_data: user.hashed(),
            custom_data,
        };

        let outcome = match tokio::time::timeout(self.timeout, api.submit(&event)).await {
            Ok(Ok(())) => {
                metrics::counter!("nurture.conversion.sent", "event" => event_name.to_string())
                    .increment(1);
                ReportOutcome::Sent
            }
            Ok(Err(e)) => ReportOutcome::Failed(e.to_string()),
            Err(_) => ReportOutcome::Failed(
                NurtureError::Timeout(self.timeout.as_millis() as u64).to_string(),
            ),
        };

        if matches!(outcome, ReportOutcome::Failed(_)) {
            metrics::counter!("nurture.conversion.failed").increment(1);
            // Not sent, so a later emission of the same id is not a duplicate.
            self.reported.remove(&key);
        }
        outcome
    }

    /// Records `key` as reported at `now`; `false` if it already was within
    /// the dedup window. Entries older than the window are evicted first.
    fn remember(&self, key: (String, String), now: DateTime<Utc>) -> bool {
        let horizon = now - self.dedup_window;
        self.reported.retain(|_, sent_at| *sent_at > horizon);
        match self.reported.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
        }
    }

    /// Number of (event, id) pairs currently held for dedup.
    pub fn tracked(&self) -> usize {
        self.reported.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingAttributionApi;

    fn configured() -> AttributionConfig {
        AttributionConfig {
            pixel_id: Some("1234".into()),
            access_token: Some("token".into()),
            timeout_ms: 200,
            ..Default::default()
        }
    }

    fn user() -> UserData {
        UserData {
            email: Some("Buyer@Example.com".into()),
            client_ip: Some("198.51.100.4".into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_unconfigured_reporter_is_a_logged_noop() {
        let reporter = ConversionReporter::disabled();
        let outcome = reporter
            .report("Lead", "evt-1", "https://x", &user(), serde_json::json!({}))
            .await;
        assert!(matches!(outcome, ReportOutcome::Ignored(_)));
    }

    #[tokio::test]
    async fn test_report_hashes_pii_and_keeps_event_id() {
        let api = Arc::new(RecordingAttributionApi::new());
        let reporter = ConversionReporter::new(Some(api.clone()), &configured());
        let outcome = reporter
            .report(
                "Purchase",
                "purchase_cs_1",
                "https://app.example/results",
                &user(),
                serde_json::json!({"currency": "USD", "value": 29.0}),
            )
            .await;
        assert_eq!(outcome, ReportOutcome::Sent);

        let events = api.accepted();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_id, "purchase_cs_1");
        assert_ne!(events[0].user_data.em.as_deref(), Some("Buyer@Example.com"));
        assert_eq!(
            events[0].user_data.client_ip_address.as_deref(),
            Some("198.51.100.4")
        );
    }

    #[tokio::test]
    async fn test_repeat_report_from_server_is_suppressed() {
        let api = Arc::new(RecordingAttributionApi::new());
        let reporter = ConversionReporter::new(Some(api.clone()), &configured());
        let first = reporter
            .report("Lead", "lead-9", "u", &user(), serde_json::json!({}))
            .await;
        let second = reporter
            .report("Lead", "lead-9", "u", &user(), serde_json::json!({}))
            .await;
        assert_eq!(first, ReportOutcome::Sent);
        assert!(matches!(second, ReportOutcome::Ignored(_)));
        assert_eq!(api.submissions(), 1);
    }

    #[test]
    fn test_dedup_entries_expire_after_window() {
        let reporter = ConversionReporter::new(None, &configured());
        let t0 = Utc::now();
        let key = |id: &str| ("Lead".to_string(), id.to_string());

        assert!(reporter.remember(key("a"), t0));
        assert!(!reporter.remember(key("a"), t0 + chrono::Duration::hours(47)));
        assert!(reporter.remember(key("b"), t0 + chrono::Duration::hours(1)));
        assert_eq!(reporter.tracked(), 2);

        // "a" aged out and may be reported again; "b" is still held.
        let later = t0 + chrono::Duration::hours(48) + chrono::Duration::seconds(1);
        assert!(reporter.remember(key("a"), later));
        assert!(!reporter.remember(key("b"), later));
        assert_eq!(reporter.tracked(), 2);

        let much_later = later + chrono::Duration::days(3);
        assert!(reporter.remember(key("c"), much_later));
        assert_eq!(reporter.tracked(), 1);
    }

    #[tokio::test]
    async fn test_failures_are_swallowed() {
        let api = Arc::new(RecordingAttributionApi::failing());
        let reporter = ConversionReporter::new(Some(api.clone()), &configured());
        let outcome = reporter
            .report("Purchase", "p-1", "u", &user(), serde_json::json!({}))
            .await;
        assert!(matches!(outcome, ReportOutcome::Failed(_)));
    }

    #[test]
    fn test_meta_payload_shape() {
        let mut config = configured();
        config.test_event_code = Some("TEST123".into());
        let api = MetaConversionsApi::from_config(&config).unwrap().unwrap();
        assert!(api.endpoint.ends_with("/v19.0/1234/events"));

        let event = ConversionEvent {
            event_name: "Lead".into(),
            event_id: "e-1".into(),
            event_time: Utc::now(),
            event_source_url: "https://app.example/test".into(),
            action_source: "website".into(),
            user_data: user().hashed(),
            custom_data: serde_json::json!({}),
        };
        let body = api.payload(&event);
        assert_eq!(body["data"][0]["event_id"], "e-1");
        assert_eq!(body["test_event_code"], "TEST123");
        assert!(body["data"][0]["user_data"]["em"].is_string());
    }
}
