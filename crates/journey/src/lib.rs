//! Funnel-abandonment nurture engine: scheduling, delivery, engagement
//! correlation and payment-triggered conversion.

pub mod correlator;
pub mod dispatcher;
pub mod engine;
pub mod enrollment;
pub mod payment;
pub mod personalization;
pub mod policy;
pub mod scheduler;
pub mod state_machine;
pub mod store;
pub mod types;

pub use correlator::EngagementCorrelator;
pub use dispatcher::DeliveryDispatcher;
pub use engine::NurtureEngine;
pub use enrollment::EnrollmentService;
pub use payment::{PaymentTrigger, SignatureVerifier};
pub use policy::StageDelayPolicy;
pub use scheduler::CampaignScheduler;
pub use state_machine::{SessionState, SessionStateMachine};
pub use store::SessionStore;
pub use types::{DispatchOutcome, EnrollmentRequest, IngestSummary, PaymentOutcome, SweepReport};
