//! Outbound message delivery contract.
//!
//! The act of sending is an opaque external capability; the nurture engine
//! only hands over a rendered message plus tracking attributes that the
//! provider echoes back on its engagement webhooks.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::NurtureResult;
use crate::types::Scenario;

/// Out-of-band attributes attached to a message so inbound engagement events
/// can be matched back to the history entry that produced them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingAttributes {
    pub session_id: Uuid,
    pub correlation_tag: String,
    pub scenario: Option<Scenario>,
    pub stage: Option<u32>,
}

impl TrackingAttributes {
    /// Provider custom-args map. Keys are part of the webhook contract.
    pub fn custom_args(&self) -> BTreeMap<String, String> {
        let mut args = BTreeMap::new();
        args.insert("session_id".to_string(), self.session_id.to_string());
        args.insert("email_id".to_string(), self.correlation_tag.clone());
        if let Some(scenario) = self.scenario {
            args.insert("scenario".to_string(), scenario.as_str().to_string());
        }
        if let Some(stage) = self.stage {
            args.insert("stage".to_string(), stage.to_string());
        }
        args
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub to: String,
    pub subject: String,
    pub html: String,
    pub text: String,
    pub tracking: TrackingAttributes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
    pub provider_message_id: String,
    pub accepted_at: DateTime<Utc>,
}

/// `send(to, subject, html, text, trackingAttributes) -> id | error`.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, message: &OutboundMessage) -> NurtureResult<SendReceipt>;

    fn provider_name(&self) -> &'static str;
}
