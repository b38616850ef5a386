//! Conversion reporting contract for the ads-attribution API.
//!
//! The same logical conversion may be emitted by the browser pixel and by the
//! server; both carry the same `event_id` so the receiving API keeps one.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::NurtureResult;

/// Raw identifying data as known to the application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserData {
    pub email: Option<String>,
    pub phone: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub external_id: Option<String>,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    pub fbp: Option<String>,
    pub fbc: Option<String>,
}

/// Wire form of `UserData`: personal fields are SHA-256 hashed, network and
/// browser-session identifiers pass through untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashedUserData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub em: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ph: Option<String>,
    #[serde(rename = "fn", skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ln: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ip_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_user_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fbp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fbc: Option<String>,
}

/// Normalizes (trim + lowercase) and hashes one identifier. Blank input
/// yields `None` rather than the hash of an empty string.
pub fn hash_identifier(raw: &str) -> Option<String> {
    let normalized = raw.trim().to_lowercase();
    if normalized.is_empty() {
        return None;
    }
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    Some(hex::encode(hasher.finalize()))
}

fn passthrough(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

impl UserData {
    pub fn hashed(&self) -> HashedUserData {
        let hash = |v: &Option<String>| v.as_deref().and_then(hash_identifier);
        HashedUserData {
            em: hash(&self.email),
            ph: hash(&self.phone),
            first_name: hash(&self.first_name),
            ln: hash(&self.last_name),
            external_id: hash(&self.external_id),
            client_ip_address: passthrough(&self.client_ip),
            client_user_agent: passthrough(&self.user_agent),
            fbp: passthrough(&self.fbp),
            fbc: passthrough(&self.fbc),
        }
    }
}

/// One server-side conversion event, ready for transmission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionEvent {
    pub event_name: String,
    pub event_id: String,
    pub event_time: DateTime<Utc>,
    pub event_source_url: String,
    pub action_source: String,
    pub user_data: HashedUserData,
    pub custom_data: serde_json::Value,
}

/// Outcome of a best-effort report. Callers must acknowledge it; none of the
/// variants is an error the caller can act on.
#[must_use = "conversion outcomes must be acknowledged, even when ignored"]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportOutcome {
    Sent,
    Ignored(String),
    Failed(String),
}

impl ReportOutcome {
    /// Records the outcome in the log and drops it.
    pub fn acknowledge(self, event_name: &str, event_id: &str) {
        match self {
            ReportOutcome::Sent => {
                tracing::debug!(event_name, event_id, "conversion reported");
            }
            ReportOutcome::Ignored(reason) => {
                tracing::info!(event_name, event_id, %reason, "conversion not reported");
            }
            ReportOutcome::Failed(reason) => {
                tracing::warn!(event_name, event_id, %reason, "conversion report failed");
            }
        }
    }
}

/// Transport to the attribution API.
#[async_trait]
pub trait AttributionApi: Send + Sync {
    async fn submit(&self, event: &ConversionEvent) -> NurtureResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_normalized_sha256() {
        // sha256("test@example.com")
        let expected = "973dfe463ec85785f5f95af5ba3906eedb2d931c24e69824a89ea65dba4e813b";
        assert_eq!(hash_identifier("  Test@Example.COM ").as_deref(), Some(expected));
        assert_eq!(hash_identifier("   "), None);
    }

    #[test]
    fn test_hashed_user_data_splits_pii_from_passthrough() {
        let user = UserData {
            email: Some("user@example.com".into()),
            first_name: Some("Dana".into()),
            client_ip: Some("203.0.113.9".into()),
            user_agent: Some("Mozilla/5.0".into()),
            fbp: Some("fb.1.1700000000.123".into()),
            ..Default::default()
        };
        let hashed = user.hashed();
        assert_eq!(hashed.em.as_ref().map(|h| h.len()), Some(64));
        assert_ne!(hashed.first_name.as_deref(), Some("Dana"));
        assert_eq!(hashed.client_ip_address.as_deref(), Some("203.0.113.9"));
        assert_eq!(hashed.fbp.as_deref(), Some("fb.1.1700000000.123"));
        assert!(hashed.ph.is_none());

        let json = serde_json::to_value(&hashed).unwrap();
        assert!(json.get("fn").is_some());
        assert!(json.get("ph").is_none());
    }
}
