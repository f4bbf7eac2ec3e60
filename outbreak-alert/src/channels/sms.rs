//! SMS channel.
//!
//! Sends through a Twilio-style Messages API (`POST .../Messages.json`).
//! Items are sent in fixed-size batches with a pause between batches, and
//! each destination number is limited by the shared sliding-window limiter.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use super::rate_limit::{RateLimitConfig, SlidingWindowRateLimiter};
use super::retry::{RetryPolicy, with_transient_retry};
use super::{
    AttemptResult, ChannelAdapter, OutboundMessage, classify_http_failure, transport_failure,
    validate_address,
};
use crate::domain::Channel;
use crate::error::DeliveryError;
use crate::template::RenderOptions;

const DEFAULT_TWILIO_API_BASE: &str = "https://api.twilio.com";

/// Recommendations shown in an SMS body.
const SMS_MAX_LIST_ITEMS: usize = 3;

/// SMS channel configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,
    #[serde(default)]
    pub from_number: String,
    #[serde(default)]
    pub account_sid: String,
    #[serde(default)]
    pub auth_token: String,
    /// Provider webhook for delivery status updates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_callback_url: Option<String>,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_batch_size() -> usize {
    10
}

fn default_batch_delay_ms() -> u64 {
    1000
}

fn default_api_base() -> String {
    DEFAULT_TWILIO_API_BASE.to_string()
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

impl Default for SmsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            batch_size: default_batch_size(),
            batch_delay_ms: default_batch_delay_ms(),
            from_number: String::new(),
            account_sid: String::new(),
            auth_token: String::new(),
            status_callback_url: None,
            api_base: default_api_base(),
            rate_limit: RateLimitConfig::default(),
            retry: RetryPolicy::default(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl SmsConfig {
    pub fn has_credentials(&self) -> bool {
        !self.account_sid.is_empty() && !self.auth_token.is_empty() && !self.from_number.is_empty()
    }
}

/// Provider acknowledgement of a created message.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SmsReceipt {
    pub sid: String,
    pub status: String,
}

/// SMS provider API.
#[async_trait]
pub trait SmsProvider: Send + Sync {
    async fn create_message(&self, to: &str, from: &str, body: &str) -> Result<SmsReceipt, DeliveryError>;
}

#[derive(Debug, Deserialize)]
struct TwilioErrorBody {
    code: Option<i64>,
    message: Option<String>,
}

/// Twilio Messages API client.
pub struct TwilioSmsProvider {
    client: Client,
    api_base: String,
    account_sid: String,
    auth_token: String,
    status_callback_url: Option<String>,
}

impl TwilioSmsProvider {
    pub fn new(config: &SmsConfig, client: Client) -> Self {
        Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            account_sid: config.account_sid.clone(),
            auth_token: config.auth_token.clone(),
            status_callback_url: config.status_callback_url.clone(),
        }
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.api_base, self.account_sid
        )
    }
}

#[async_trait]
impl SmsProvider for TwilioSmsProvider {
    async fn create_message(&self, to: &str, from: &str, body: &str) -> Result<SmsReceipt, DeliveryError> {
        let mut form = vec![("To", to), ("From", from), ("Body", body)];
        if let Some(callback) = self.status_callback_url.as_deref() {
            form.push(("StatusCallback", callback));
        }

        let response = self
            .client
            .post(self.messages_url())
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&form)
            .send()
            .await
            .map_err(|e| transport_failure("Twilio", e))?;

        let status = response.status();
        if status.is_success() {
            // The message exists at Twilio now; a failure past this point must not be retried.
            let text = response.text().await.map_err(|e| {
                DeliveryError::permanent(None, format!("Twilio accepted the message but the response was lost: {}", e))
            })?;
            return parse_receipt(&text);
        }

        let text = response.text().await.unwrap_or_default();
        let parsed: Option<TwilioErrorBody> = serde_json::from_str(&text).ok();
        let code = parsed.as_ref().and_then(|b| b.code).map(|c| c.to_string());
        let message = parsed
            .and_then(|b| b.message)
            .unwrap_or_else(|| format!("{} - {}", status, text));

        warn!("Twilio create message failed: {} - {}", status, message);
        Err(classify_http_failure(status, code, message))
    }
}

/// Parse the body of a successful create-message response.
///
/// An unreadable body is a permanent failure: Twilio already created the
/// message, so sending again would duplicate it.
fn parse_receipt(body: &str) -> Result<SmsReceipt, DeliveryError> {
    serde_json::from_str(body).map_err(|e| {
        warn!("Twilio accepted a message but returned an unreadable receipt: {}", e);
        DeliveryError::permanent(None, format!("Unreadable Twilio receipt: {}", e))
    })
}

/// SMS channel adapter.
pub struct SmsAdapter {
    provider: Arc<dyn SmsProvider>,
    limiter: Arc<SlidingWindowRateLimiter>,
    from_number: String,
    batch_size: usize,
    batch_delay: Duration,
    retry: RetryPolicy,
}

impl SmsAdapter {
    pub fn new(
        provider: Arc<dyn SmsProvider>,
        limiter: Arc<SlidingWindowRateLimiter>,
        config: &SmsConfig,
    ) -> Self {
        Self {
            provider,
            limiter,
            from_number: config.from_number.clone(),
            batch_size: config.batch_size.max(1),
            batch_delay: Duration::from_millis(config.batch_delay_ms),
            retry: config.retry,
        }
    }

    fn rate_limited(&self, item: &OutboundMessage) -> AttemptResult {
        let limits = self.limiter.config();
        AttemptResult::rate_limited(
            item,
            DeliveryError::RateLimited {
                address: item.address.clone(),
                limit: limits.max_per_window,
                window_secs: limits.window_secs,
            },
        )
    }

    async fn deliver(&self, item: &OutboundMessage) -> AttemptResult {
        let provider = &self.provider;
        let from = self.from_number.as_str();
        let result = with_transient_retry(&self.retry, "sms create_message", move || {
            provider.create_message(&item.address, from, &item.message.body)
        })
        .await;

        match result {
            Ok(receipt) => AttemptResult::sent(item, Some(receipt.sid), Some(receipt.status)),
            Err(err) => {
                debug!(recipient_id = %item.recipient_id, error = %err, "SMS send failed");
                AttemptResult::failed(item, err)
            }
        }
    }

    async fn send_chunk(&self, chunk: &[OutboundMessage]) -> Vec<AttemptResult> {
        // Validation and rate limiting happen before any provider call.
        let mut immediate: Vec<Option<AttemptResult>> = Vec::with_capacity(chunk.len());
        for item in chunk {
            let early = match validate_address(Channel::Sms, &item.address) {
                Err(err) => Some(AttemptResult::failed(item, err)),
                Ok(()) if !self.limiter.try_acquire(&item.address) => Some(self.rate_limited(item)),
                Ok(()) => None,
            };
            immediate.push(early);
        }

        let sends = chunk
            .iter()
            .zip(immediate)
            .map(|(item, early)| async move {
                match early {
                    Some(result) => result,
                    None => self.deliver(item).await,
                }
            });
        join_all(sends).await
    }
}

#[async_trait]
impl ChannelAdapter for SmsAdapter {
    fn channel(&self) -> Channel {
        Channel::Sms
    }

    fn render_options(&self) -> RenderOptions {
        RenderOptions::truncated(SMS_MAX_LIST_ITEMS)
    }

    #[instrument(skip(self, items), fields(items = items.len()))]
    async fn send_batch(&self, items: Vec<OutboundMessage>) -> Vec<AttemptResult> {
        let mut results = Vec::with_capacity(items.len());
        let batches = items.chunks(self.batch_size).count();

        for (idx, chunk) in items.chunks(self.batch_size).enumerate() {
            if idx > 0 && !self.batch_delay.is_zero() {
                tokio::time::sleep(self.batch_delay).await;
            }
            results.extend(self.send_chunk(chunk).await);
            debug!("SMS batch {}/{} done ({} items)", idx + 1, batches, chunk.len());
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::tests::item;
    use crate::domain::DeliveryStatus;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Provider returning scripted outcomes; succeeds once the script runs out.
    #[derive(Default)]
    struct ScriptedSmsProvider {
        script: Mutex<VecDeque<Result<SmsReceipt, DeliveryError>>>,
        sent: Mutex<Vec<String>>,
    }

    impl ScriptedSmsProvider {
        fn with_script(script: Vec<Result<SmsReceipt, DeliveryError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                ..Default::default()
            }
        }

        fn calls(&self) -> usize {
            self.sent.lock().len()
        }
    }

    #[async_trait]
    impl SmsProvider for ScriptedSmsProvider {
        async fn create_message(
            &self,
            to: &str,
            _from: &str,
            _body: &str,
        ) -> Result<SmsReceipt, DeliveryError> {
            let n = {
                let mut sent = self.sent.lock();
                sent.push(to.to_string());
                sent.len()
            };
            self.script.lock().pop_front().unwrap_or_else(|| {
                Ok(SmsReceipt {
                    sid: format!("SM{}", n),
                    status: "queued".to_string(),
                })
            })
        }
    }

    fn config() -> SmsConfig {
        SmsConfig {
            enabled: true,
            from_number: "+15550009999".to_string(),
            batch_delay_ms: 0,
            retry: RetryPolicy {
                base_delay_ms: 1,
                max_delay_ms: 1,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn adapter(provider: Arc<ScriptedSmsProvider>) -> SmsAdapter {
        SmsAdapter::new(provider, Arc::new(SlidingWindowRateLimiter::default()), &config())
    }

    #[tokio::test]
    async fn test_sixth_message_to_same_number_is_rate_limited() {
        let provider = Arc::new(ScriptedSmsProvider::default());
        let adapter = adapter(provider.clone());

        let items = (0..6).map(|i| item(&format!("r{}", i), "+15550001111")).collect();
        let results = adapter.send_batch(items).await;

        assert_eq!(results.len(), 6);
        assert!(results[..5].iter().all(|r| r.status == DeliveryStatus::Sent));
        assert_eq!(results[5].status, DeliveryStatus::RateLimited);
        assert!(matches!(results[5].error, Some(DeliveryError::RateLimited { limit: 5, .. })));
        assert_eq!(provider.calls(), 5);
    }

    #[tokio::test]
    async fn test_limiter_is_shared_across_batches() {
        let provider = Arc::new(ScriptedSmsProvider::default());
        let adapter = adapter(provider.clone());

        for _ in 0..5 {
            let result = adapter.send_one(item("r1", "+15550001111")).await;
            assert_eq!(result.status, DeliveryStatus::Sent);
        }
        let result = adapter.send_one(item("r1", "+15550001111")).await;
        assert_eq!(result.status, DeliveryStatus::RateLimited);
    }

    #[tokio::test]
    async fn test_invalid_number_skips_provider() {
        let provider = Arc::new(ScriptedSmsProvider::default());
        let adapter = adapter(provider.clone());

        let result = adapter.send_one(item("r1", "call me maybe")).await;
        assert_eq!(result.status, DeliveryStatus::Failed);
        assert!(matches!(result.error, Some(DeliveryError::InvalidAddress { .. })));
        assert_eq!(provider.calls(), 0);
    }

    #[test]
    fn test_parse_receipt() {
        let receipt = parse_receipt(r#"{"sid": "SM42", "status": "queued", "to": "+15550001111"}"#).unwrap();
        assert_eq!(receipt.sid, "SM42");

        let err = parse_receipt("<html>gateway hiccup</html>").unwrap_err();
        assert!(!err.is_transient());
        assert!(err.is_permanent_provider_error());
    }

    #[tokio::test]
    async fn test_unreadable_receipt_is_not_resent() {
        let unreadable = parse_receipt(r#"{"status": "queued"}"#).unwrap_err();
        let provider = Arc::new(ScriptedSmsProvider::with_script(vec![Err(unreadable)]));
        let adapter = adapter(provider.clone());

        let result = adapter.send_one(item("r1", "+15550001111")).await;

        assert_eq!(result.status, DeliveryStatus::Failed);
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_partial_batch_failure_keeps_order() {
        let provider = Arc::new(ScriptedSmsProvider::with_script(vec![
            Ok(SmsReceipt {
                sid: "SMa".into(),
                status: "queued".into(),
            }),
            Err(DeliveryError::permanent(Some("21211".into()), "invalid 'To' number")),
        ]));
        let adapter = adapter(provider.clone());

        let results = adapter
            .send_batch(vec![item("r1", "+15550001111"), item("r2", "+15550002222")])
            .await;

        assert_eq!(results[0].recipient_id, "r1");
        assert_eq!(results[0].provider_message_id.as_deref(), Some("SMa"));
        assert_eq!(results[1].recipient_id, "r2");
        assert_eq!(results[1].status, DeliveryStatus::Failed);
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_transient_failure_retried_within_attempt() {
        let provider = Arc::new(ScriptedSmsProvider::with_script(vec![Err(
            DeliveryError::transient("503 Service Unavailable"),
        )]));
        let adapter = adapter(provider.clone());

        let result = adapter.send_one(item("r1", "+15550001111")).await;
        assert_eq!(result.status, DeliveryStatus::Sent);
        assert_eq!(result.provider_status.as_deref(), Some("queued"));
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_batches_preserve_order() {
        let provider = Arc::new(ScriptedSmsProvider::default());
        let cfg = SmsConfig {
            batch_size: 2,
            ..config()
        };
        let adapter = SmsAdapter::new(
            provider.clone(),
            Arc::new(SlidingWindowRateLimiter::default()),
            &cfg,
        );

        let items: Vec<_> = (0..5)
            .map(|i| item(&format!("r{}", i), &format!("+1555000111{}", i)))
            .collect();
        let results = adapter.send_batch(items).await;

        let ids: Vec<_> = results.iter().map(|r| r.recipient_id.as_str()).collect();
        assert_eq!(ids, vec!["r0", "r1", "r2", "r3", "r4"]);
        assert_eq!(provider.calls(), 5);
    }

    #[test]
    fn test_sms_truncates_lists() {
        let adapter = adapter(Arc::new(ScriptedSmsProvider::default()));
        assert_eq!(adapter.render_options().max_list_items, Some(3));
    }

    #[test]
    fn test_config_defaults() {
        let config: SmsConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.batch_delay_ms, 1000);
        assert_eq!(config.rate_limit.max_per_window, 5);
        assert_eq!(config.retry.max_transient_retries, 1);
        assert!(!config.has_credentials());
    }
}
