use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{NurtureError, NurtureResult};

/// Correlation tag of the one-shot payment confirmation message. It sits
/// outside every stage sequence and never appears in a session's history.
pub const CONFIRMATION_TAG: &str = "PAY";

/// The funnel-exit condition a session was enrolled under. Each scenario maps
/// to exactly one message sequence.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Scenario {
    /// Started the assessment, left before finishing it.
    AbandonedFunnel,
    /// Finished the assessment and saw the free teaser, did not buy.
    ViewedTeaserResult,
    /// Reached checkout and left without paying.
    AbandonedCheckout,
}

impl Scenario {
    pub const ALL: [Scenario; 3] = [
        Scenario::AbandonedFunnel,
        Scenario::ViewedTeaserResult,
        Scenario::AbandonedCheckout,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Scenario::AbandonedFunnel => "abandoned_funnel",
            Scenario::ViewedTeaserResult => "viewed_teaser_result",
            Scenario::AbandonedCheckout => "abandoned_checkout",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Scenario::AbandonedFunnel => "Abandoned Assessment",
            Scenario::ViewedTeaserResult => "Teaser Viewer",
            Scenario::AbandonedCheckout => "Abandoned Checkout",
        }
    }

    /// Letter prefix of every correlation tag issued for this scenario.
    pub fn tag_prefix(&self) -> char {
        match self {
            Scenario::AbandonedFunnel => 'A',
            Scenario::ViewedTeaserResult => 'B',
            Scenario::AbandonedCheckout => 'C',
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scenario {
    type Err = NurtureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Scenario::ALL
            .into_iter()
            .find(|scenario| scenario.as_str() == s)
            .ok_or_else(|| NurtureError::MalformedPayload(format!("unknown scenario '{s}'")))
    }
}

/// Deterministic correlation tag for a (scenario, stage) pair, e.g. `B2`.
/// Scenarios are immutable per session and each stage fires at most once, so
/// the tag is unique within a session's history.
pub fn correlation_tag(scenario: Scenario, stage: u32) -> String {
    format!("{}{}", scenario.tag_prefix(), stage)
}

/// One dispatched stage. Only the engagement fields are ever mutated after
/// the entry is appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub stage: u32,
    pub correlation_tag: String,
    pub sent_at: DateTime<Utc>,
    #[serde(default)]
    pub provider_message_id: Option<String>,
    #[serde(default)]
    pub opened: bool,
    #[serde(default)]
    pub opened_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub clicked: bool,
    #[serde(default)]
    pub clicked_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub clicked_url: Option<String>,
}

impl HistoryEntry {
    pub fn new(stage: u32, correlation_tag: String, sent_at: DateTime<Utc>) -> Self {
        Self {
            stage,
            correlation_tag,
            sent_at,
            provider_message_id: None,
            opened: false,
            opened_at: None,
            clicked: false,
            clicked_at: None,
            clicked_url: None,
        }
    }
}

/// A lease held on a session while the send for `stage` is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchClaim {
    pub stage: u32,
    pub claimed_at: DateTime<Utc>,
}

impl DispatchClaim {
    /// A claim younger than `ttl` still belongs to an in-flight send.
    pub fn is_live(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        now - self.claimed_at < ttl
    }
}

/// Flat output of the external scoring collaborator, captured at enrollment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssessmentSummary {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub dominant_category: Option<String>,
    #[serde(default)]
    pub headline: Option<String>,
    #[serde(default)]
    pub questions_answered: u32,
    /// Question id → human label of the chosen answer.
    #[serde(default)]
    pub answer_labels: BTreeMap<String, String>,
    #[serde(default)]
    pub flags: BTreeMap<String, bool>,
    #[serde(default)]
    pub scores: BTreeMap<String, f64>,
}

/// Cached personalization view used by every message of a sequence.
/// Primitives only; nothing here references other records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonalizationSnapshot {
    pub first_name: String,
    pub dominant_category: String,
    pub headline: String,
    pub questions_answered: u32,
    pub answer_labels: BTreeMap<String, String>,
    pub flags: BTreeMap<String, bool>,
    pub scores: BTreeMap<String, i64>,
    pub app_url: String,
    pub unsubscribe_url: String,
    pub built_at: DateTime<Utc>,
}

impl PersonalizationSnapshot {
    /// Flattens the snapshot into `{{name}}`-style template variables.
    pub fn variables(&self) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();
        vars.insert("first_name".to_string(), self.first_name.clone());
        vars.insert("dominant_category".to_string(), self.dominant_category.clone());
        vars.insert("headline".to_string(), self.headline.clone());
        vars.insert(
            "questions_answered".to_string(),
            self.questions_answered.to_string(),
        );
        vars.insert("app_url".to_string(), self.app_url.clone());
        vars.insert("unsubscribe_url".to_string(), self.unsubscribe_url.clone());
        for (question, label) in &self.answer_labels {
            vars.insert(format!("answer_{question}"), label.clone());
        }
        for (flag, value) in &self.flags {
            vars.insert(format!("flag_{flag}"), value.to_string());
        }
        for (metric, value) in &self.scores {
            vars.insert(format!("score_{metric}"), value.to_string());
        }
        vars
    }
}

/// Browser-side identifiers kept for later server-side conversion reports.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributionContext {
    #[serde(default)]
    pub fbp: Option<String>,
    #[serde(default)]
    pub fbc: Option<String>,
    #[serde(default)]
    pub client_ip: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
}

/// Per-journey nurture state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: Uuid,
    pub email: Option<String>,
    pub scenario: Option<Scenario>,
    pub stage: u32,
    pub reference_at: Option<DateTime<Utc>>,
    pub last_sent_at: Option<DateTime<Utc>>,
    pub paid: bool,
    pub paid_at: Option<DateTime<Utc>>,
    pub opted_out: bool,
    pub opted_out_at: Option<DateTime<Utc>>,
    pub archived: bool,
    /// Stage whose send window was missed; the sequence is closed for good.
    pub lapsed_stage: Option<u32>,
    pub dispatch_claim: Option<DispatchClaim>,
    pub confirmation_sent_at: Option<DateTime<Utc>>,
    pub history: Vec<HistoryEntry>,
    pub assessment: AssessmentSummary,
    pub personalization: Option<PersonalizationSnapshot>,
    pub attribution: AttributionContext,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn new(id: Uuid, email: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            email,
            scenario: None,
            stage: 0,
            reference_at: None,
            last_sent_at: None,
            paid: false,
            paid_at: None,
            opted_out: false,
            opted_out_at: None,
            archived: false,
            lapsed_stage: None,
            dispatch_claim: None,
            confirmation_sent_at: None,
            history: Vec::new(),
            assessment: AssessmentSummary::default(),
            personalization: None,
            attribution: AttributionContext::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Assigns the scenario and stamps the stage-1 anchor. A scenario is
    /// assigned once; re-assigning the same one is a no-op.
    pub fn assign_scenario(&mut self, scenario: Scenario, now: DateTime<Utc>) -> NurtureResult<bool> {
        match self.scenario {
            Some(existing) if existing == scenario => Ok(false),
            Some(existing) => Err(NurtureError::Conflict(format!(
                "session {} already assigned to {existing}",
                self.id
            ))),
            None => {
                self.scenario = Some(scenario);
                self.reference_at = Some(now);
                self.updated_at = now;
                Ok(true)
            }
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.paid || self.opted_out
    }

    /// Has somewhere to send to and has not been archived.
    pub fn is_reachable(&self) -> bool {
        !self.archived && self.email.as_deref().is_some_and(|e| !e.trim().is_empty())
    }

    /// Non-terminal, scenario-assigned, reachable and still open.
    pub fn is_schedulable(&self) -> bool {
        !self.is_terminal()
            && self.scenario.is_some()
            && self.is_reachable()
            && self.lapsed_stage.is_none()
    }

    /// Anchor the next stage's delay is measured from.
    pub fn anchor(&self) -> Option<DateTime<Utc>> {
        if self.stage == 0 {
            self.reference_at
        } else {
            self.last_sent_at
        }
    }

    pub fn history_by_tag_mut(&mut self, tag: &str) -> Option<&mut HistoryEntry> {
        self.history.iter_mut().find(|h| h.correlation_tag == tag)
    }

    /// Applies a successful stage send: history, stage and `last_sent_at`
    /// move together, and the dispatch claim is released.
    pub fn record_dispatch(
        &mut self,
        stage: u32,
        provider_message_id: Option<String>,
        now: DateTime<Utc>,
    ) -> NurtureResult<()> {
        let scenario = self.scenario.ok_or_else(|| {
            NurtureError::Conflict(format!("session {} has no scenario", self.id))
        })?;
        if stage != self.stage + 1 {
            return Err(NurtureError::Conflict(format!(
                "session {} is at stage {}, cannot record stage {stage}",
                self.id, self.stage
            )));
        }
        let tag = correlation_tag(scenario, stage);
        if self.history.iter().any(|h| h.correlation_tag == tag) {
            return Err(NurtureError::Conflict(format!(
                "session {} already holds tag {tag}",
                self.id
            )));
        }

        let mut entry = HistoryEntry::new(stage, tag, now);
        entry.provider_message_id = provider_message_id;
        self.history.push(entry);
        self.stage = stage;
        self.last_sent_at = Some(now);
        self.dispatch_claim = None;
        self.updated_at = now;
        debug_assert_eq!(self.history.len(), self.stage as usize);
        Ok(())
    }
}

/// Kind of tracked engagement on a dispatched message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EngagementKind {
    Opened,
    Clicked,
}

/// A provider-neutral open/click event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngagementEvent {
    pub session_id: Uuid,
    pub kind: EngagementKind,
    pub occurred_at: DateTime<Utc>,
    pub correlation_tag: Option<String>,
    /// Stage number echoed back by the provider; used only when the tag is
    /// missing.
    pub stage: Option<u32>,
    pub url: Option<String>,
}

/// What an inbound provider event means for the nurture state.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundSignal {
    Engagement(EngagementEvent),
    OptOut {
        session_id: Uuid,
        occurred_at: DateTime<Utc>,
    },
    /// Delivery-level noise (processed, delivered, bounce, ...).
    Ignored { kind: String },
}

/// Nurture event emitted to the event sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NurtureEvent {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub session_id: Uuid,
    pub stage: Option<u32>,
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    SessionEnrolled,
    StageDispatched,
    DispatchFailed,
    StageLapsed,
    SequenceExhausted,
    EngagementRecorded,
    OptedOut,
    PaymentCompleted,
    ConfirmationSent,
    ConversionReported,
}
