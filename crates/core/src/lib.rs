//! Shared domain types, configuration, error taxonomy and outbound contracts
//! for the nurture engine.

pub mod attribution;
pub mod channels;
pub mod config;
pub mod error;
pub mod event_bus;
pub mod templates;
pub mod types;

pub use config::AppConfig;
pub use error::{NurtureError, NurtureResult};
