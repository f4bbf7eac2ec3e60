//! Row models for the delivery tables.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::time::{datetime_to_ms, ms_to_datetime};
use crate::domain::{DeliveryAttempt, DeliveryRecord, StaleAddress};
use crate::{Error, Result};

/// `delivery_record` row.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DeliveryRecordDbModel {
    pub alert_id: String,
    pub risk_level: String,
    pub state: String,
    /// AlertEvent snapshot as JSON.
    pub alert: String,
    /// `Vec<StaleAddress>` as JSON.
    pub stale_addresses: String,
    pub started_at: i64,
    pub completed_at: Option<i64>,
}

/// `delivery_attempt` row.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DeliveryAttemptDbModel {
    pub alert_id: String,
    pub recipient_id: String,
    pub channel: String,
    pub position: i64,
    pub address: String,
    pub template: String,
    pub variant: Option<String>,
    pub status: String,
    pub provider_message_id: Option<String>,
    pub provider_status: Option<String>,
    /// DeliveryError as JSON.
    pub error: Option<String>,
    pub attempted_at: i64,
    pub updated_at: i64,
}

impl DeliveryRecordDbModel {
    pub fn from_record(record: &DeliveryRecord) -> Result<Self> {
        Ok(Self {
            alert_id: record.alert_id().to_string(),
            risk_level: record.alert.risk_level.to_string(),
            state: record.state.to_string(),
            alert: serde_json::to_string(&record.alert)?,
            stale_addresses: serde_json::to_string(&record.stale_addresses)?,
            started_at: datetime_to_ms(record.started_at),
            completed_at: record.completed_at.map(datetime_to_ms),
        })
    }

    /// Rebuild the domain record from this row and its attempt rows.
    pub fn into_record(self, attempts: Vec<DeliveryAttemptDbModel>) -> Result<DeliveryRecord> {
        let state = self
            .state
            .parse()
            .map_err(|_| Error::Other(format!("Unknown dispatch state '{}'", self.state)))?;
        let stale_addresses: Vec<StaleAddress> = serde_json::from_str(&self.stale_addresses)?;
        let attempts = attempts
            .into_iter()
            .map(DeliveryAttemptDbModel::into_attempt)
            .collect::<Result<Vec<_>>>()?;

        Ok(DeliveryRecord {
            alert: serde_json::from_str(&self.alert)?,
            state,
            attempts,
            stale_addresses,
            started_at: ms_to_datetime(self.started_at),
            completed_at: self.completed_at.map(ms_to_datetime),
        })
    }
}

impl DeliveryAttemptDbModel {
    pub fn from_attempt(alert_id: &str, position: usize, attempt: &DeliveryAttempt) -> Result<Self> {
        Ok(Self {
            alert_id: alert_id.to_string(),
            recipient_id: attempt.recipient_id.clone(),
            channel: attempt.channel.to_string(),
            position: position as i64,
            address: attempt.address.clone(),
            template: attempt.template.clone(),
            variant: attempt.variant.clone(),
            status: attempt.status.to_string(),
            provider_message_id: attempt.provider_message_id.clone(),
            provider_status: attempt.provider_status.clone(),
            error: attempt.error.as_ref().map(serde_json::to_string).transpose()?,
            attempted_at: datetime_to_ms(attempt.attempted_at),
            updated_at: datetime_to_ms(attempt.updated_at),
        })
    }

    pub fn into_attempt(self) -> Result<DeliveryAttempt> {
        let channel = self
            .channel
            .parse()
            .map_err(|_| Error::Other(format!("Unknown channel '{}'", self.channel)))?;
        let status = self
            .status
            .parse()
            .map_err(|_| Error::Other(format!("Unknown delivery status '{}'", self.status)))?;

        Ok(DeliveryAttempt {
            recipient_id: self.recipient_id,
            channel,
            address: self.address,
            template: self.template,
            variant: self.variant,
            status,
            provider_message_id: self.provider_message_id,
            provider_status: self.provider_status,
            error: self.error.as_deref().map(serde_json::from_str).transpose()?,
            attempted_at: ms_to_datetime(self.attempted_at),
            updated_at: ms_to_datetime(self.updated_at),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AlertEvent, Channel, DeliveryStatus, RiskLevel};
    use crate::error::DeliveryError;

    #[test]
    fn test_attempt_row_round_trip() {
        let mut attempt = DeliveryAttempt::pending(
            "r1",
            Channel::Sms,
            "+15550001111",
            "outbreak_alert",
            Some("high".to_string()),
        );
        attempt.fail(DeliveryError::Timeout { channel: Channel::Sms });

        let row = DeliveryAttemptDbModel::from_attempt("alert-1", 3, &attempt).unwrap();
        assert_eq!(row.channel, "sms");
        assert_eq!(row.status, "failed");
        assert_eq!(row.position, 3);
        assert!(row.error.as_deref().unwrap().contains("\"timeout\""));

        let back = row.into_attempt().unwrap();
        assert_eq!(back.status, DeliveryStatus::Failed);
        assert_eq!(back.error, attempt.error);
        assert_eq!(back.variant.as_deref(), Some("high"));
    }

    #[test]
    fn test_unknown_status_is_an_error() {
        let attempt = DeliveryAttempt::pending("r1", Channel::Push, "tok", "t", None);
        let mut row = DeliveryAttemptDbModel::from_attempt("a", 0, &attempt).unwrap();
        row.status = "bounced".to_string();
        assert!(row.into_attempt().is_err());
    }

    #[test]
    fn test_record_row() {
        let record = DeliveryRecord::new(AlertEvent::new(RiskLevel::Medium, 0.7).with_id("alert-9"));
        let row = DeliveryRecordDbModel::from_record(&record).unwrap();
        assert_eq!(row.risk_level, "medium");
        assert_eq!(row.state, "received");
        assert_eq!(row.stale_addresses, "[]");

        let back = row.into_record(Vec::new()).unwrap();
        assert_eq!(back.alert_id(), "alert-9");
    }
}
