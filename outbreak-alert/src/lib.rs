//! Outbreak alert notification pipeline.
//!
//! Fans one risk assessment out to health workers, administrators and
//! citizens over SMS, push and email, and records per-recipient delivery
//! status.

pub mod channels;
pub mod config;
pub mod database;
pub mod domain;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod resolver;
pub mod store;
pub mod template;
pub mod utils;

pub use config::PipelineConfig;
pub use error::{DeliveryError, Error, Result};
pub use orchestrator::{CallbackOutcome, DeliveryOrchestrator, OrchestratorBuilder, StatusCallback};
