//! Delivery record persistence.
//!
//! A record is written once per alert with [`DeliveryStore::save`]; after that
//! attempts change only through the keyed, idempotent
//! [`DeliveryStore::update_attempt`] path. Provider callbacks go through
//! [`DeliveryStore::update_attempt_if_newer`], which compares progress and
//! writes in one step.

mod memory;
mod sqlite;

pub use memory::InMemoryDeliveryStore;
pub use sqlite::SqlxDeliveryStore;

use async_trait::async_trait;

use crate::Result;
use crate::domain::{AttemptKey, AttemptPatch, DeliveryRecord};

/// Result of a rank-guarded update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardedUpdate {
    Applied,
    /// The stored provider status is at or beyond the incoming rank.
    Superseded,
    NotFound,
}

#[async_trait]
pub trait DeliveryStore: Send + Sync {
    /// Persist a completed record.
    async fn save(&self, record: &DeliveryRecord) -> Result<()>;

    /// Apply `patch` to one attempt. Returns `false` when no such attempt exists.
    async fn update_attempt(&self, key: &AttemptKey, patch: &AttemptPatch) -> Result<bool>;

    /// Apply `patch` only if the attempt's current provider status ranks below
    /// `rank` (see [`crate::domain::provider_status_rank`]). An unset or
    /// unrecognised current status always ranks lower.
    async fn update_attempt_if_newer(
        &self,
        key: &AttemptKey,
        patch: &AttemptPatch,
        rank: u8,
    ) -> Result<GuardedUpdate>;

    /// Look up the attempt a provider message id belongs to.
    async fn find_attempt_by_provider_message_id(
        &self,
        provider_message_id: &str,
    ) -> Result<Option<AttemptKey>>;

    async fn get_record(&self, alert_id: &str) -> Result<Option<DeliveryRecord>>;
}
