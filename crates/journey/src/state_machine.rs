use serde::{Deserialize, Serialize};

use nurture_core::error::{NurtureError, NurtureResult};
use nurture_core::types::SessionRecord;

use crate::policy::StageDelayPolicy;

/// Lifecycle of a nurture session, derived from its flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No scenario yet; nothing will be sent.
    Pending,
    Nurturing,
    /// Every stage of the sequence has been sent.
    Exhausted,
    /// A send window was missed and the sequence stopped there.
    Lapsed,
    Converted,
    OptedOut,
    Archived,
}

impl SessionState {
    /// Payment wins over everything else, then the explicit opt-out, then
    /// housekeeping, then sequence position.
    pub fn of(session: &SessionRecord) -> Self {
        if session.paid {
            Self::Converted
        } else if session.opted_out {
            Self::OptedOut
        } else if session.archived {
            Self::Archived
        } else if session.lapsed_stage.is_some() {
            Self::Lapsed
        } else {
            match session.scenario {
                None => Self::Pending,
                Some(scenario) if session.stage >= StageDelayPolicy::sequence_len(scenario) => {
                    Self::Exhausted
                }
                Some(_) => Self::Nurturing,
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Nurturing => "nurturing",
            Self::Exhausted => "exhausted",
            Self::Lapsed => "lapsed",
            Self::Converted => "converted",
            Self::OptedOut => "opted_out",
            Self::Archived => "archived",
        }
    }
}

/// Describes a single valid state transition for a nurture session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: SessionState,
    pub to: SessionState,
    pub trigger: &'static str,
}

/// Enforces the finite set of valid session lifecycle transitions.
#[derive(Debug, Clone)]
pub struct SessionStateMachine {
    transitions: Vec<StateTransition>,
}

impl SessionStateMachine {
    pub fn new() -> Self {
        use SessionState::*;

        let table: [(SessionState, SessionState, &'static str); 17] = [
            // Pending ->
            (Pending, Nurturing, "scenario_assigned"),
            (Pending, Converted, "payment_completed"),
            (Pending, OptedOut, "unsubscribed"),
            (Pending, Archived, "stale"),
            // Nurturing ->
            (Nurturing, Exhausted, "sequence_finished"),
            (Nurturing, Lapsed, "window_missed"),
            (Nurturing, Converted, "payment_completed"),
            (Nurturing, OptedOut, "unsubscribed"),
            (Nurturing, Archived, "stale"),
            // Closed sequences still convert and opt out.
            (Exhausted, Converted, "payment_completed"),
            (Exhausted, OptedOut, "unsubscribed"),
            (Exhausted, Archived, "stale"),
            (Lapsed, Converted, "payment_completed"),
            (Lapsed, OptedOut, "unsubscribed"),
            (Lapsed, Archived, "stale"),
            (Archived, Converted, "payment_completed"),
            (OptedOut, Converted, "payment_completed"),
        ];

        Self {
            transitions: table
                .into_iter()
                .map(|(from, to, trigger)| StateTransition { from, to, trigger })
                .collect(),
        }
    }

    pub fn can_transition(&self, from: SessionState, to: SessionState) -> bool {
        self.transitions.iter().any(|t| t.from == from && t.to == to)
    }

    /// Checks `from -> to` and returns the trigger name for logging.
    pub fn check(&self, from: SessionState, to: SessionState) -> NurtureResult<&'static str> {
        self.transitions
            .iter()
            .find(|t| t.from == from && t.to == to)
            .map(|t| t.trigger)
            .ok_or_else(|| {
                NurtureError::Conflict(format!(
                    "invalid session transition from {} to {}",
                    from.as_str(),
                    to.as_str()
                ))
            })
    }
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
