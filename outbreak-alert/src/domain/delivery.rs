//! Delivery attempts and the per-alert delivery record.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::alert::AlertEvent;
use super::recipient::Channel;
use crate::error::DeliveryError;
use crate::{Error, Result};

/// Status of one delivery attempt.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
    RateLimited,
}

impl DeliveryStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Identity of an attempt: one per (alert, recipient, channel).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttemptKey {
    pub alert_id: String,
    pub recipient_id: String,
    pub channel: Channel,
}

impl AttemptKey {
    pub fn new(alert_id: impl Into<String>, recipient_id: impl Into<String>, channel: Channel) -> Self {
        Self {
            alert_id: alert_id.into(),
            recipient_id: recipient_id.into(),
            channel,
        }
    }
}

impl std::fmt::Display for AttemptKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.alert_id, self.recipient_id, self.channel)
    }
}

/// Outcome record for one (alert, recipient, channel) triple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub recipient_id: String,
    pub channel: Channel,
    /// Empty when the directory had no address for the channel.
    pub address: String,
    pub template: String,
    pub variant: Option<String>,
    pub status: DeliveryStatus,
    pub provider_message_id: Option<String>,
    /// Raw status string last reported by the provider (e.g. `delivered`).
    pub provider_status: Option<String>,
    pub error: Option<DeliveryError>,
    pub attempted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeliveryAttempt {
    pub fn pending(
        recipient_id: impl Into<String>,
        channel: Channel,
        address: impl Into<String>,
        template: impl Into<String>,
        variant: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            recipient_id: recipient_id.into(),
            channel,
            address: address.into(),
            template: template.into(),
            variant,
            status: DeliveryStatus::Pending,
            provider_message_id: None,
            provider_status: None,
            error: None,
            attempted_at: now,
            updated_at: now,
        }
    }

    /// Mark as failed without ever reaching a provider.
    pub fn fail(&mut self, error: DeliveryError) {
        self.status = DeliveryStatus::Failed;
        self.error = Some(error);
        self.updated_at = Utc::now();
    }

    /// Apply a keyed update. Applying the same patch twice is a no-op.
    pub fn apply(&mut self, patch: &AttemptPatch) {
        if let Some(status) = patch.status {
            self.status = status;
            if status == DeliveryStatus::Sent {
                self.error = None;
            }
        }
        if let Some(id) = &patch.provider_message_id {
            self.provider_message_id = Some(id.clone());
        }
        if let Some(provider_status) = &patch.provider_status {
            self.provider_status = Some(provider_status.clone());
        }
        if let Some(error) = &patch.error {
            self.error = Some(error.clone());
        }
        self.updated_at = patch.updated_at;
    }

    pub fn key(&self, alert_id: &str) -> AttemptKey {
        AttemptKey::new(alert_id, &self.recipient_id, self.channel)
    }
}

/// Partial update for an existing attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptPatch {
    pub status: Option<DeliveryStatus>,
    pub provider_message_id: Option<String>,
    pub provider_status: Option<String>,
    pub error: Option<DeliveryError>,
    pub updated_at: DateTime<Utc>,
}

impl AttemptPatch {
    pub fn new() -> Self {
        Self {
            status: None,
            provider_message_id: None,
            provider_status: None,
            error: None,
            updated_at: Utc::now(),
        }
    }

    pub fn status(mut self, status: DeliveryStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn provider_message_id(mut self, id: impl Into<String>) -> Self {
        self.provider_message_id = Some(id.into());
        self
    }

    pub fn provider_status(mut self, status: impl Into<String>) -> Self {
        self.provider_status = Some(status.into());
        self
    }

    pub fn error(mut self, error: DeliveryError) -> Self {
        self.error = Some(error);
        self
    }
}

impl Default for AttemptPatch {
    fn default() -> Self {
        Self::new()
    }
}

/// Progress rank of a provider status string; `None` when unrecognised.
///
/// Terminal statuses share the highest rank. Stores compare against this when
/// applying callbacks so an attempt never moves backwards.
pub fn provider_status_rank(status: &str) -> Option<u8> {
    match status {
        "accepted" | "scheduled" | "queued" => Some(0),
        "sending" => Some(1),
        "sent" => Some(2),
        "delivered" | "read" | "undelivered" | "failed" | "canceled" => Some(3),
        _ => None,
    }
}

/// Phase of one dispatch.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DispatchState {
    Received,
    Resolving,
    Rendering,
    Dispatching,
    Aggregating,
    Completed,
}

impl DispatchState {
    pub fn next(&self) -> Option<DispatchState> {
        match self {
            Self::Received => Some(Self::Resolving),
            Self::Resolving => Some(Self::Rendering),
            Self::Rendering => Some(Self::Dispatching),
            Self::Dispatching => Some(Self::Aggregating),
            Self::Aggregating => Some(Self::Completed),
            Self::Completed => None,
        }
    }
}

/// An address the provider permanently rejected (e.g. an unregistered push token).
///
/// Reported to the recipient directory; the pipeline never deactivates it itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaleAddress {
    pub recipient_id: String,
    pub channel: Channel,
    pub address: String,
    pub reason: String,
}

/// Counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliverySummary {
    pub total: usize,
    pub pending: usize,
    pub sent: usize,
    pub failed: usize,
    pub rate_limited: usize,
}

/// All attempts for one alert event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub alert: AlertEvent,
    pub state: DispatchState,
    /// Unique by `(recipient_id, channel)`, in resolution order.
    pub attempts: Vec<DeliveryAttempt>,
    #[serde(default)]
    pub stale_addresses: Vec<StaleAddress>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl DeliveryRecord {
    pub fn new(alert: AlertEvent) -> Self {
        Self {
            alert,
            state: DispatchState::Received,
            attempts: Vec::new(),
            stale_addresses: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn alert_id(&self) -> &str {
        &self.alert.alert_id
    }

    /// Move to `next`, which must be the immediate successor of the current phase.
    pub fn advance(&mut self, next: DispatchState) -> Result<()> {
        if self.state.next() != Some(next) {
            return Err(Error::InvalidStateTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        if next == DispatchState::Completed {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Add an attempt unless one already exists for its key.
    ///
    /// Returns `false` for a duplicate.
    pub fn push_attempt(&mut self, attempt: DeliveryAttempt) -> bool {
        if self.attempt(&attempt.recipient_id, attempt.channel).is_some() {
            return false;
        }
        self.attempts.push(attempt);
        true
    }

    pub fn attempt(&self, recipient_id: &str, channel: Channel) -> Option<&DeliveryAttempt> {
        self.attempts
            .iter()
            .find(|a| a.recipient_id == recipient_id && a.channel == channel)
    }

    pub fn attempt_mut(&mut self, recipient_id: &str, channel: Channel) -> Option<&mut DeliveryAttempt> {
        self.attempts
            .iter_mut()
            .find(|a| a.recipient_id == recipient_id && a.channel == channel)
    }

    /// Index of attempts by key, for bulk merges.
    pub fn attempt_index(&self) -> HashMap<(String, Channel), usize> {
        self.attempts
            .iter()
            .enumerate()
            .map(|(idx, a)| ((a.recipient_id.clone(), a.channel), idx))
            .collect()
    }

    pub fn attempts_for(&self, channel: Channel) -> impl Iterator<Item = &DeliveryAttempt> {
        self.attempts.iter().filter(move |a| a.channel == channel)
    }

    pub fn summary(&self) -> DeliverySummary {
        let mut summary = DeliverySummary {
            total: self.attempts.len(),
            ..Default::default()
        };
        for attempt in &self.attempts {
            match attempt.status {
                DeliveryStatus::Pending => summary.pending += 1,
                DeliveryStatus::Sent => summary.sent += 1,
                DeliveryStatus::Failed => summary.failed += 1,
                DeliveryStatus::RateLimited => summary.rate_limited += 1,
            }
        }
        summary
    }
}
