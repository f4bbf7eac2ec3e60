//! Channel adapters.
//!
//! Each adapter turns rendered messages into provider calls for one channel:
//! - SMS (Twilio-style REST API), with per-address rate limiting
//! - Push (FCM HTTP v1), with multicast batches
//! - Email (generic JSON HTTP API)
//!
//! Adapters never return an error for a single item; every input gets an
//! [`AttemptResult`], in input order.

pub mod email;
pub mod push;
pub mod rate_limit;
pub mod retry;
pub mod sms;

pub use email::{EmailAdapter, EmailConfig, EmailProvider, HttpEmailProvider};
pub use push::{
    FcmPushProvider, MulticastResponse, PushAdapter, PushConfig, PushNotification, PushProvider,
    PushSendResponse,
};
pub use rate_limit::{RateLimitConfig, SlidingWindowRateLimiter};
pub use retry::RetryPolicy;
pub use sms::{SmsAdapter, SmsConfig, SmsProvider, SmsReceipt, TwilioSmsProvider};

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use reqwest::StatusCode;

use crate::domain::{AttemptPatch, Channel, DeliveryStatus};
use crate::error::{DeliveryError, ProviderErrorKind};
use crate::template::{RenderOptions, RenderedMessage};

static PHONE_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\+?[1-9][0-9]{1,14}$").unwrap());

static EMAIL_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap());

/// One message for one address.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub recipient_id: String,
    pub address: String,
    pub message: RenderedMessage,
}

impl OutboundMessage {
    pub fn new(
        recipient_id: impl Into<String>,
        address: impl Into<String>,
        message: RenderedMessage,
    ) -> Self {
        Self {
            recipient_id: recipient_id.into(),
            address: address.into(),
            message,
        }
    }
}

/// Adapter outcome for one [`OutboundMessage`].
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptResult {
    pub recipient_id: String,
    pub address: String,
    pub status: DeliveryStatus,
    pub provider_message_id: Option<String>,
    pub provider_status: Option<String>,
    pub error: Option<DeliveryError>,
    /// The provider reported the address itself as no longer valid.
    pub stale: bool,
}

impl AttemptResult {
    pub fn sent(
        item: &OutboundMessage,
        provider_message_id: Option<String>,
        provider_status: Option<String>,
    ) -> Self {
        Self {
            recipient_id: item.recipient_id.clone(),
            address: item.address.clone(),
            status: DeliveryStatus::Sent,
            provider_message_id,
            provider_status,
            error: None,
            stale: false,
        }
    }

    pub fn failed(item: &OutboundMessage, error: DeliveryError) -> Self {
        Self {
            recipient_id: item.recipient_id.clone(),
            address: item.address.clone(),
            status: DeliveryStatus::Failed,
            provider_message_id: None,
            provider_status: None,
            error: Some(error),
            stale: false,
        }
    }

    pub fn rate_limited(item: &OutboundMessage, error: DeliveryError) -> Self {
        Self {
            status: DeliveryStatus::RateLimited,
            ..Self::failed(item, error)
        }
    }

    pub fn mark_stale(mut self) -> Self {
        self.stale = true;
        self
    }

    pub fn to_patch(&self) -> AttemptPatch {
        let mut patch = AttemptPatch::new().status(self.status);
        patch.provider_message_id = self.provider_message_id.clone();
        patch.provider_status = self.provider_status.clone();
        patch.error = self.error.clone();
        patch
    }
}

/// Uniform delivery contract for one channel.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn channel(&self) -> Channel;

    /// Rendering knobs applied to messages for this channel.
    fn render_options(&self) -> RenderOptions {
        RenderOptions::full()
    }

    /// Deliver `items`, returning one result per item in the same order.
    async fn send_batch(&self, items: Vec<OutboundMessage>) -> Vec<AttemptResult>;

    /// Batch-of-one case.
    async fn send_one(&self, item: OutboundMessage) -> AttemptResult {
        let fallback = AttemptResult::failed(
            &item,
            DeliveryError::transient("adapter returned no result"),
        );
        self.send_batch(vec![item]).await.pop().unwrap_or(fallback)
    }
}

/// Check an address before any network call.
pub fn validate_address(channel: Channel, address: &str) -> Result<(), DeliveryError> {
    let reason = match channel {
        Channel::Sms if !PHONE_REGEX.is_match(address) => "not an E.164 phone number",
        Channel::Email if !EMAIL_REGEX.is_match(address) => "not an email address",
        Channel::Push if address.is_empty() || address.chars().any(char::is_whitespace) => {
            "not a device token"
        }
        _ => return Ok(()),
    };
    Err(DeliveryError::InvalidAddress {
        channel,
        address: address.to_string(),
        reason: reason.to_string(),
    })
}

/// Map a non-success HTTP response to a provider error.
///
/// Throttling and server errors are transient; other client errors are permanent.
pub(crate) fn classify_http_failure(
    status: StatusCode,
    code: Option<String>,
    message: impl Into<String>,
) -> DeliveryError {
    let kind = if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        ProviderErrorKind::Transient
    } else {
        ProviderErrorKind::Permanent
    };
    DeliveryError::Provider {
        kind,
        code,
        message: message.into(),
    }
}

/// Connection, TLS and timeout failures are transient.
pub(crate) fn transport_failure(provider: &str, err: reqwest::Error) -> DeliveryError {
    DeliveryError::transient(format!("{} request failed: {}", provider, err))
}
