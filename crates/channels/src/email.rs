//! SendGrid email delivery and event webhook parsing.
//!
//! Outbound mail carries the session id and correlation tag as `custom_args`;
//! SendGrid echoes them back on every open/click event, which is how
//! engagement is matched to the history entry that produced it.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use nurture_core::channels::{MessageSender, OutboundMessage, SendReceipt};
use nurture_core::config::SendGridConfig;
use nurture_core::error::{NurtureError, NurtureResult};
use nurture_core::types::{EngagementEvent, EngagementKind, InboundSignal};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

/// SendGrid email provider.
pub struct SendGridProvider {
    config: SendGridConfig,
    client: reqwest::Client,
}

impl SendGridProvider {
    pub fn new(config: SendGridConfig, timeout: Duration) -> NurtureResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NurtureError::Config(format!("sendgrid client: {e}")))?;
        info!(
            from = %config.from_email,
            open_tracking = config.open_tracking,
            click_tracking = config.click_tracking,
            "SendGrid provider initialized"
        );
        Ok(Self { config, client })
    }

    pub fn is_configured(&self) -> bool {
        !self.config.api_key.trim().is_empty()
    }

    /// Builds the v3 `mail/send` request body.
    pub fn build_payload(&self, message: &OutboundMessage) -> serde_json::Value {
        serde_json::json!({
            "personalizations": [{
                "to": [{"email": message.to}],
                "custom_args": message.tracking.custom_args(),
            }],
            "from": {
                "email": self.config.from_email,
                "name": self.config.from_name,
            },
            "subject": message.subject,
            "content": [
                {"type": "text/plain", "value": message.text},
                {"type": "text/html", "value": message.html},
            ],
            "tracking_settings": {
                "click_tracking": {"enable": self.config.click_tracking},
                "open_tracking": {"enable": self.config.open_tracking},
            }
        })
    }
}

#[async_trait]
impl MessageSender for SendGridProvider {
    async fn send(&self, message: &OutboundMessage) -> NurtureResult<SendReceipt> {
        if !self.is_configured() {
            return Err(NurtureError::Config("SendGrid API key is not set".into()));
        }

        debug!(
            session_id = %message.tracking.session_id,
            tag = %message.tracking.correlation_tag,
            subject = %message.subject,
            "Sending email via SendGrid"
        );

        let url = format!(
            "{}/v3/mail/send",
            self.config.api_base_url.trim_end_matches('/')
        );
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&self.build_payload(message))
            .send()
            .await
            .map_err(|e| NurtureError::Http(format!("SendGrid request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            metrics::counter!("nurture.sendgrid.rejected").increment(1);
            return Err(NurtureError::Send(format!("SendGrid returned {status}: {body}")));
        }

        let provider_message_id = resp
            .headers()
            .get("x-message-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or_else(|| format!("sg-{}", Uuid::new_v4()));

        metrics::counter!("nurture.sendgrid.accepted").increment(1);
        Ok(SendReceipt {
            provider_message_id,
            accepted_at: Utc::now(),
        })
    }

    fn provider_name(&self) -> &'static str {
        "sendgrid"
    }
}

// ─── Event Webhook ──────────────────────────────────────────────────────────

/// One element of a SendGrid event webhook batch. Custom args are flattened
/// into the event object by SendGrid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendGridEvent {
    #[serde(default)]
    pub email: String,
    pub timestamp: i64,
    pub event: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub sg_message_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub email_id: Option<String>,
    /// Echoed as a string custom arg, but tolerated as a number.
    #[serde(default)]
    pub stage: Option<serde_json::Value>,
    #[serde(default)]
    pub scenario: Option<String>,
}

impl SendGridEvent {
    fn occurred_at(&self) -> NurtureResult<DateTime<Utc>> {
        Utc.timestamp_opt(self.timestamp, 0)
            .single()
            .ok_or_else(|| NurtureError::MalformedPayload(format!("bad timestamp {}", self.timestamp)))
    }

    fn session_uuid(&self) -> NurtureResult<Uuid> {
        let raw = self
            .session_id
            .as_deref()
            .ok_or_else(|| NurtureError::MalformedPayload("missing session_id".into()))?;
        Uuid::parse_str(raw.trim())
            .map_err(|_| NurtureError::MalformedPayload(format!("bad session_id '{raw}'")))
    }

    fn stage_number(&self) -> Option<u32> {
        match self.stage.as_ref()? {
            serde_json::Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Classifies the provider event. Events that concern a session but lack
    /// a usable session id or timestamp are malformed.
    pub fn into_signal(self) -> NurtureResult<InboundSignal> {
        let kind = match self.event.as_str() {
            "open" => EngagementKind::Opened,
            "click" => EngagementKind::Clicked,
            "unsubscribe" | "group_unsubscribe" | "spamreport" => {
                return Ok(InboundSignal::OptOut {
                    session_id: self.session_uuid()?,
                    occurred_at: self.occurred_at()?,
                });
            }
            _ => return Ok(InboundSignal::Ignored { kind: self.event }),
        };

        let correlation_tag = self
            .email_id
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string);

        Ok(InboundSignal::Engagement(EngagementEvent {
            session_id: self.session_uuid()?,
            kind,
            occurred_at: self.occurred_at()?,
            correlation_tag,
            stage: self.stage_number(),
            url: self.url.clone(),
        }))
    }
}

/// Parses one raw batch element.
pub fn parse_event(raw: &serde_json::Value) -> NurtureResult<InboundSignal> {
    let event: SendGridEvent = serde_json::from_value(raw.clone())
        .map_err(|e| NurtureError::MalformedPayload(e.to_string()))?;
    event.into_signal()
}
