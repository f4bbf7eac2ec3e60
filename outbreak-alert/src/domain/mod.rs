//! Domain layer: alert events, recipients and delivery records.

pub mod alert;
pub mod delivery;
pub mod recipient;

pub use alert::{AlertEvent, Location, RiskLevel};
pub use delivery::{
    AttemptKey, AttemptPatch, DeliveryAttempt, DeliveryRecord, DeliveryStatus, DeliverySummary,
    DispatchState, StaleAddress, provider_status_rank,
};
pub use recipient::{Channel, Role, Recipient};
