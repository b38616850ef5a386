use thiserror::Error;
use uuid::Uuid;

use crate::types::Scenario;

pub type NurtureResult<T> = Result<T, NurtureError>;

#[derive(Error, Debug)]
pub enum NurtureError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No template mapped for {scenario:?} stage {stage}")]
    UnmappedTemplate { scenario: Scenario, stage: u32 },

    #[error("Message send failed: {0}")]
    Send(String),

    #[error("Timed out after {0} ms")]
    Timeout(u64),

    #[error("Attribution API error: {0}")]
    Attribution(String),

    #[error("Webhook signature rejected: {0}")]
    InvalidSignature(String),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Session {0} not found")]
    SessionNotFound(Uuid),

    #[error("Conflicting session state: {0}")]
    Conflict(String),

    #[error("HTTP transport error: {0}")]
    Http(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl NurtureError {
    /// Whether the next sweep may try the same operation again.
    ///
    /// Configuration and integrity failures are not retryable; the record is
    /// left as-is and expires once its tolerance window closes.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            NurtureError::Send(_) | NurtureError::Timeout(_) | NurtureError::Http(_)
        )
    }

    /// Short stable label used for metrics and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            NurtureError::Config(_) => "config",
            NurtureError::UnmappedTemplate { .. } => "unmapped_template",
            NurtureError::Send(_) => "send",
            NurtureError::Timeout(_) => "timeout",
            NurtureError::Attribution(_) => "attribution",
            NurtureError::InvalidSignature(_) => "invalid_signature",
            NurtureError::MalformedPayload(_) => "malformed_payload",
            NurtureError::SessionNotFound(_) => "session_not_found",
            NurtureError::Conflict(_) => "conflict",
            NurtureError::Http(_) => "http",
            NurtureError::Serialization(_) => "serialization",
            NurtureError::Internal(_) => "internal",
        }
    }
}
