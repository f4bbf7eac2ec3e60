//! Email channel.
//!
//! Sends plain-text mail through a JSON HTTP API authenticated with a bearer
//! key (`POST {api_url}` with `from`, `to`, `subject`, `text`).

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, instrument, warn};

use super::retry::{RetryPolicy, with_transient_retry};
use super::{
    AttemptResult, ChannelAdapter, OutboundMessage, classify_http_failure, transport_failure,
    validate_address,
};
use crate::domain::Channel;
use crate::error::DeliveryError;

/// Email channel configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub api_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub from_address: String,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_batch_size() -> usize {
    50
}

fn default_request_timeout_ms() -> u64 {
    15_000
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            batch_size: default_batch_size(),
            api_url: String::new(),
            api_key: String::new(),
            from_address: String::new(),
            retry: RetryPolicy::default(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl EmailConfig {
    pub fn has_credentials(&self) -> bool {
        !self.api_url.is_empty() && !self.api_key.is_empty() && !self.from_address.is_empty()
    }
}

/// Email provider API.
#[async_trait]
pub trait EmailProvider: Send + Sync {
    /// Returns the provider message id when the API reports one.
    async fn send_email(&self, to: &str, subject: &str, text: &str) -> Result<Option<String>, DeliveryError>;
}

/// Generic JSON email API client.
pub struct HttpEmailProvider {
    client: Client,
    api_url: String,
    api_key: String,
    from_address: String,
}

impl HttpEmailProvider {
    pub fn new(config: &EmailConfig, client: Client) -> Self {
        Self {
            client,
            api_url: config.api_url.clone(),
            api_key: config.api_key.clone(),
            from_address: config.from_address.clone(),
        }
    }
}

#[async_trait]
impl EmailProvider for HttpEmailProvider {
    async fn send_email(&self, to: &str, subject: &str, text: &str) -> Result<Option<String>, DeliveryError> {
        let payload = json!({
            "from": self.from_address,
            "to": [to],
            "subject": subject,
            "text": text,
        });

        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| transport_failure("Email API", e))?;

        let status = response.status();
        if status.is_success() {
            let body: Value = response.json().await.unwrap_or_default();
            let id = body
                .get("id")
                .or_else(|| body.get("message_id"))
                .and_then(Value::as_str)
                .map(str::to_string);
            return Ok(id);
        }

        let body = response.text().await.unwrap_or_default();
        warn!("Email API request failed: {} - {}", status, body);
        Err(classify_http_failure(
            status,
            Some(status.as_u16().to_string()),
            format!("Email API returned {}: {}", status, body),
        ))
    }
}

/// Email channel adapter.
pub struct EmailAdapter {
    provider: Arc<dyn EmailProvider>,
    batch_size: usize,
    retry: RetryPolicy,
}

impl EmailAdapter {
    pub fn new(provider: Arc<dyn EmailProvider>, config: &EmailConfig) -> Self {
        Self {
            provider,
            batch_size: config.batch_size.max(1),
            retry: config.retry,
        }
    }

    async fn deliver(&self, item: &OutboundMessage) -> AttemptResult {
        if let Err(err) = validate_address(Channel::Email, &item.address) {
            return AttemptResult::failed(item, err);
        }

        let provider = &self.provider;
        let result = with_transient_retry(&self.retry, "email send", move || {
            provider.send_email(&item.address, &item.message.title, &item.message.body)
        })
        .await;

        match result {
            Ok(id) => AttemptResult::sent(item, id, None),
            Err(err) => {
                debug!(recipient_id = %item.recipient_id, error = %err, "Email send failed");
                AttemptResult::failed(item, err)
            }
        }
    }
}

#[async_trait]
impl ChannelAdapter for EmailAdapter {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    #[instrument(skip(self, items), fields(items = items.len()))]
    async fn send_batch(&self, items: Vec<OutboundMessage>) -> Vec<AttemptResult> {
        let mut results = Vec::with_capacity(items.len());
        for chunk in items.chunks(self.batch_size) {
            results.extend(join_all(chunk.iter().map(|item| self.deliver(item))).await);
        }
        results
    }
}
