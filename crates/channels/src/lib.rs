//! Outbound channel adapters.
//!
//! Email: SendGrid delivery and event webhook parsing.
//! Attribution: Meta Conversions API transport and deduplicating reporter.
//! Templates: compiled-in sequence copy behind the `ContentBinder` contract.

pub mod attribution;
pub mod email;
pub mod templates;
pub mod testing;

pub use attribution::{ConversionReporter, MetaConversionsApi};
pub use email::{SendGridEvent, SendGridProvider};
pub use templates::SequenceTemplates;
