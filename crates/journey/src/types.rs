use serde::{Deserialize, Serialize};
use uuid::Uuid;

use nurture_core::types::{AssessmentSummary, AttributionContext, Scenario};

/// Result of one stage dispatch attempt that did not error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Sent {
        stage: u32,
        correlation_tag: String,
        provider_message_id: String,
    },
    /// Another dispatch holds the claim or has already advanced the stage.
    Busy,
    /// The session became terminal, lapsed or unreachable before the claim.
    Ineligible,
}

/// Counters for one scheduler sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub examined: usize,
    pub dispatched: usize,
    pub failed: usize,
    pub not_due: usize,
    pub lapsed: usize,
    pub exhausted: usize,
    pub busy: usize,
}

/// Counters for one engagement webhook batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestSummary {
    pub applied: usize,
    pub duplicates: usize,
    /// Applied by stage number because the correlation tag was missing.
    pub approximate: usize,
    pub opt_outs: usize,
    pub ignored: usize,
    pub dropped: usize,
}

/// What a verified payment webhook did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PaymentOutcome {
    Unlocked {
        session_id: Uuid,
        confirmation_sent: bool,
    },
    /// Replay of an already-applied completion. The only possible effect is
    /// a retry of a confirmation that failed to send earlier.
    AlreadyPaid {
        session_id: Uuid,
        confirmation_sent: bool,
    },
    /// Valid signature but not a report-unlock completion.
    Ignored { reason: String },
}

/// Enrollment of a session into a scenario, as submitted by the web client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollmentRequest {
    #[serde(default)]
    pub session_id: Option<Uuid>,
    pub email: String,
    pub scenario: Scenario,
    #[serde(default)]
    pub assessment: AssessmentSummary,
    #[serde(default)]
    pub attribution: AttributionContext,
    /// Event id the browser pixel used for the matching `Lead` event.
    #[serde(default)]
    pub lead_event_id: Option<String>,
    #[serde(default)]
    pub source_url: Option<String>,
}
