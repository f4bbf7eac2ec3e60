//! In-memory delivery store.

use async_trait::async_trait;
use dashmap::DashMap;

use super::{DeliveryStore, GuardedUpdate};
use crate::Result;
use crate::domain::{AttemptKey, AttemptPatch, DeliveryRecord, provider_status_rank};

/// Records keyed by alert id, with a provider message id index.
#[derive(Debug, Default)]
pub struct InMemoryDeliveryStore {
    records: DashMap<String, DeliveryRecord>,
    by_provider_id: DashMap<String, AttemptKey>,
}

impl InMemoryDeliveryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn index_attempts(&self, record: &DeliveryRecord) {
        for attempt in &record.attempts {
            if let Some(id) = &attempt.provider_message_id {
                self.by_provider_id
                    .insert(id.clone(), attempt.key(record.alert_id()));
            }
        }
    }
}

#[async_trait]
impl DeliveryStore for InMemoryDeliveryStore {
    async fn save(&self, record: &DeliveryRecord) -> Result<()> {
        self.index_attempts(record);
        self.records
            .insert(record.alert_id().to_string(), record.clone());
        Ok(())
    }

    async fn update_attempt(&self, key: &AttemptKey, patch: &AttemptPatch) -> Result<bool> {
        let Some(mut record) = self.records.get_mut(&key.alert_id) else {
            return Ok(false);
        };
        let Some(attempt) = record.attempt_mut(&key.recipient_id, key.channel) else {
            return Ok(false);
        };
        attempt.apply(patch);

        if let Some(id) = &patch.provider_message_id {
            self.by_provider_id.insert(id.clone(), key.clone());
        }
        Ok(true)
    }

    async fn update_attempt_if_newer(
        &self,
        key: &AttemptKey,
        patch: &AttemptPatch,
        rank: u8,
    ) -> Result<GuardedUpdate> {
        // The shard guard is held across compare and write.
        let Some(mut record) = self.records.get_mut(&key.alert_id) else {
            return Ok(GuardedUpdate::NotFound);
        };
        let Some(attempt) = record.attempt_mut(&key.recipient_id, key.channel) else {
            return Ok(GuardedUpdate::NotFound);
        };
        let current = attempt.provider_status.as_deref().and_then(provider_status_rank);
        if current.is_some_and(|current| current >= rank) {
            return Ok(GuardedUpdate::Superseded);
        }
        attempt.apply(patch);

        if let Some(id) = &patch.provider_message_id {
            self.by_provider_id.insert(id.clone(), key.clone());
        }
        Ok(GuardedUpdate::Applied)
    }

    async fn find_attempt_by_provider_message_id(
        &self,
        provider_message_id: &str,
    ) -> Result<Option<AttemptKey>> {
        Ok(self
            .by_provider_id
            .get(provider_message_id)
            .map(|entry| entry.value().clone()))
    }

    async fn get_record(&self, alert_id: &str) -> Result<Option<DeliveryRecord>> {
        Ok(self.records.get(alert_id).map(|entry| entry.value().clone()))
    }
}
