//! Provider delivery-status callbacks.
//!
//! Twilio-style webhooks report message progress (`queued` -> `sending` ->
//! `sent` -> `delivered`/`undelivered`/`failed`). Callbacks may arrive late,
//! duplicated or out of order; a callback never moves an attempt backwards.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::DeliveryOrchestrator;
use crate::Result;
use crate::domain::{AttemptKey, AttemptPatch, DeliveryStatus, provider_status_rank};
use crate::error::DeliveryError;
use crate::store::GuardedUpdate;

/// Status webhook payload. Accepts both snake_case and Twilio's form field names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCallback {
    #[serde(alias = "MessageSid", alias = "SmsSid")]
    pub message_sid: String,
    #[serde(alias = "MessageStatus", alias = "SmsStatus")]
    pub status: String,
    #[serde(default, alias = "ErrorCode", skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, alias = "ErrorMessage", skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl StatusCallback {
    pub fn new(message_sid: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            message_sid: message_sid.into(),
            status: status.into(),
            error_code: None,
            error_message: None,
        }
    }

    pub fn with_error(mut self, code: impl Into<String>, message: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self.error_message = Some(message.into());
        self
    }
}

/// What a callback did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackOutcome {
    /// The attempt was updated.
    Applied(AttemptKey),
    /// No attempt carries this provider message id (possibly not saved yet).
    Unmatched,
    /// Duplicate, stale or unrecognised status; nothing changed.
    Ignored,
}

/// Progress rank and resulting delivery status of a provider status string.
fn classify_status(status: &str) -> Option<(u8, DeliveryStatus)> {
    let rank = provider_status_rank(status)?;
    let delivery_status = match status {
        "undelivered" | "failed" | "canceled" => DeliveryStatus::Failed,
        _ => DeliveryStatus::Sent,
    };
    Some((rank, delivery_status))
}

impl DeliveryOrchestrator {
    /// Apply a provider status callback through the keyed update path.
    ///
    /// The rank comparison and the write happen in one store call, so
    /// concurrent callbacks for the same message cannot regress it.
    ///
    /// Records are persisted once dispatch completes. A callback that races
    /// ahead of that save returns [`CallbackOutcome::Unmatched`]; webhook
    /// handlers should answer with a retryable status so the provider
    /// redelivers it.
    #[instrument(skip(self, payload), fields(message_sid = %payload.message_sid, status = %payload.status))]
    pub async fn handle_status_callback(&self, payload: StatusCallback) -> Result<CallbackOutcome> {
        let status = payload.status.to_ascii_lowercase();
        let Some((rank, delivery_status)) = classify_status(&status) else {
            warn!("Unrecognised provider status");
            return Ok(CallbackOutcome::Ignored);
        };

        let Some(key) = self
            .store
            .find_attempt_by_provider_message_id(&payload.message_sid)
            .await?
        else {
            debug!("No attempt for provider message id");
            return Ok(CallbackOutcome::Unmatched);
        };

        let mut patch = AttemptPatch::new()
            .status(delivery_status)
            .provider_status(status.clone());
        if delivery_status == DeliveryStatus::Failed {
            let message = payload
                .error_message
                .clone()
                .unwrap_or_else(|| format!("Message {}", status));
            patch = patch.error(DeliveryError::permanent(payload.error_code.clone(), message));
        }

        match self.store.update_attempt_if_newer(&key, &patch, rank).await? {
            GuardedUpdate::Applied => {
                info!(%key, %status, "Applied provider status callback");
                Ok(CallbackOutcome::Applied(key))
            }
            GuardedUpdate::Superseded => {
                debug!(%key, incoming = rank, "Ignoring stale or duplicate status callback");
                Ok(CallbackOutcome::Ignored)
            }
            GuardedUpdate::NotFound => Ok(CallbackOutcome::Unmatched),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_ranks() {
        assert_eq!(classify_status("queued"), Some((0, DeliveryStatus::Sent)));
        assert_eq!(classify_status("delivered"), Some((3, DeliveryStatus::Sent)));
        assert_eq!(classify_status("undelivered"), Some((3, DeliveryStatus::Failed)));
        assert_eq!(classify_status("bogus"), None);
    }

    #[test]
    fn test_twilio_form_field_names() {
        let payload: StatusCallback = serde_json::from_str(
            r#"{"MessageSid": "SM1", "MessageStatus": "undelivered", "ErrorCode": "30003", "ErrorMessage": "Unreachable"}"#,
        )
        .unwrap();
        assert_eq!(payload.message_sid, "SM1");
        assert_eq!(payload.error_code.as_deref(), Some("30003"));

        let payload: StatusCallback =
            serde_json::from_str(r#"{"message_sid": "SM2", "status": "delivered"}"#).unwrap();
        assert_eq!(payload, StatusCallback::new("SM2", "delivered"));
    }
}
