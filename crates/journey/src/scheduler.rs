//! Campaign scheduler: one sweep over every schedulable session.
//!
//! For each session the next stage fires iff the required delay has elapsed
//! since the anchor and the tolerance window has not closed. A session whose
//! window has closed is marked lapsed and never sends again. Due sessions
//! are dispatched concurrently, bounded by `max_concurrency`; one session's
//! failure never affects another.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use nurture_core::config::SchedulerConfig;
use nurture_core::error::{NurtureError, NurtureResult};
use nurture_core::event_bus::{make_event, EventSink};
use nurture_core::types::EventType;

use crate::dispatcher::DeliveryDispatcher;
use crate::policy::StageDelayPolicy;
use crate::state_machine::{SessionState, SessionStateMachine};
use crate::store::SessionStore;
use crate::types::{DispatchOutcome, SweepReport};

/// Where `now` falls relative to a stage's send window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
    NotDue,
    Due,
    Missed,
}

/// Window is `[delay, delay + tolerance)` measured on `elapsed`.
pub fn evaluate_window(delay: Duration, tolerance: Duration, elapsed: Duration) -> Window {
    if elapsed < delay {
        Window::NotDue
    } else if elapsed < delay + tolerance {
        Window::Due
    } else {
        Window::Missed
    }
}

pub struct CampaignScheduler {
    store: SessionStore,
    policy: StageDelayPolicy,
    dispatcher: Arc<DeliveryDispatcher>,
    tolerance: Duration,
    max_concurrency: usize,
    archive_after: Duration,
    machine: SessionStateMachine,
    event_sink: Arc<dyn EventSink>,
}

impl CampaignScheduler {
    pub fn new(
        store: SessionStore,
        dispatcher: Arc<DeliveryDispatcher>,
        config: &SchedulerConfig,
    ) -> NurtureResult<Self> {
        if config.max_concurrency == 0 {
            return Err(NurtureError::Config(
                "scheduler.max_concurrency must be at least 1".into(),
            ));
        }
        Ok(Self {
            store,
            policy: StageDelayPolicy::new(config.delay_scale)?,
            dispatcher,
            tolerance: Duration::seconds(config.tolerance_secs as i64),
            max_concurrency: config.max_concurrency,
            archive_after: Duration::days(config.archive_after_days),
            machine: SessionStateMachine::new(),
            event_sink: nurture_core::event_bus::noop_sink(),
        })
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    pub fn policy(&self) -> &StageDelayPolicy {
        &self.policy
    }

    /// Runs one sweep at `now`. Safe to run concurrently with itself.
    pub async fn run_once(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        let mut due: Vec<(Uuid, u32, bool)> = Vec::new();

        for session in self.store.snapshot_where(|s| s.is_schedulable()) {
            report.examined += 1;
            let Some(scenario) = session.scenario else {
                continue;
            };
            let next = session.stage + 1;

            let Some(delay) = self.policy.required_delay(scenario, next) else {
                report.exhausted += 1;
                continue;
            };
            let Some(anchor) = session.anchor() else {
                warn!(session_id = %session.id, stage = session.stage, "Session has no anchor");
                report.not_due += 1;
                continue;
            };

            match evaluate_window(delay, self.tolerance, now - anchor) {
                Window::NotDue => report.not_due += 1,
                Window::Due => {
                    let last = next == StageDelayPolicy::sequence_len(scenario);
                    due.push((session.id, next, last));
                }
                Window::Missed => {
                    if self.mark_lapsed(session.id, next, now) {
                        report.lapsed += 1;
                    }
                }
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut tasks = JoinSet::new();
        for (session_id, stage, last) in due {
            let dispatcher = self.dispatcher.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let outcome = dispatcher.dispatch(session_id, stage, now).await;
                (session_id, stage, last, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((session_id, stage, last, Ok(DispatchOutcome::Sent { .. }))) => {
                    report.dispatched += 1;
                    if last {
                        info!(session_id = %session_id, stage, "Sequence complete");
                        self.event_sink.emit(make_event(
                            EventType::SequenceExhausted,
                            session_id,
                            Some(stage),
                            None,
                        ));
                    }
                }
                Ok((_, _, _, Ok(DispatchOutcome::Busy | DispatchOutcome::Ineligible))) => {
                    report.busy += 1
                }
                Ok((session_id, _, _, Err(e))) => {
                    report.failed += 1;
                    debug!(session_id = %session_id, retryable = e.is_retryable(), "Dispatch error");
                }
                Err(e) => {
                    report.failed += 1;
                    error!(error = %e, "Dispatch task panicked");
                }
            }
        }

        metrics::counter!("nurture.sweep.runs").increment(1);
        metrics::gauge!("nurture.sweep.examined").set(report.examined as f64);
        info!(
            examined = report.examined,
            dispatched = report.dispatched,
            failed = report.failed,
            lapsed = report.lapsed,
            busy = report.busy,
            "Sweep complete"
        );
        report
    }

    /// Closes the sequence at `stage`. Returns `false` if the session moved
    /// on (or became terminal) since the sweep snapshot was taken.
    fn mark_lapsed(&self, session_id: Uuid, stage: u32, now: DateTime<Utc>) -> bool {
        let machine = &self.machine;
        let claim_ttl = self.dispatcher.claim_ttl();
        let lapsed = self.store.update(&session_id, |s| {
            if s.stage + 1 != stage {
                return Ok(false);
            }
            if s.dispatch_claim.is_some_and(|c| c.is_live(now, claim_ttl)) {
                return Ok(false);
            }
            let from = SessionState::of(s);
            if !machine.can_transition(from, SessionState::Lapsed) {
                return Ok(false);
            }
            s.lapsed_stage = Some(stage);
            s.dispatch_claim = None;
            s.updated_at = now;
            Ok(true)
        });

        match lapsed {
            Ok(true) => {
                metrics::counter!("nurture.stage.lapsed").increment(1);
                info!(session_id = %session_id, stage, "Send window missed, sequence closed");
                self.event_sink.emit(make_event(
                    EventType::StageLapsed,
                    session_id,
                    Some(stage),
                    None,
                ));
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Failed to mark session lapsed");
                false
            }
        }
    }

    /// Archives unpaid sessions idle for longer than `archive_after`.
    pub fn archive_stale(&self, now: DateTime<Utc>) -> usize {
        let archived = self.store.archive_stale(now - self.archive_after, now);
        metrics::counter!("nurture.sessions.archived").increment(archived.len() as u64);
        archived.len()
    }
}
