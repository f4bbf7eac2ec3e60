//! Push notification channel.
//!
//! Uses the FCM HTTP v1 API (`POST /v1/projects/{project}/messages:send`).
//! Items are grouped into multicast batches of at most 500 tokens; tokens the
//! provider reports as unregistered or invalid are flagged stale.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, instrument, warn};

use super::retry::RetryPolicy;
use super::{
    AttemptResult, ChannelAdapter, OutboundMessage, classify_http_failure, transport_failure,
    validate_address,
};
use crate::domain::Channel;
use crate::error::DeliveryError;
use crate::template::RenderedMessage;

/// Provider limit on tokens per multicast.
pub const MAX_MULTICAST_TOKENS: usize = 500;

const DEFAULT_FCM_API_BASE: &str = "https://fcm.googleapis.com";

/// Concurrent per-token requests inside one multicast.
const DEFAULT_CONCURRENCY: usize = 16;

/// Error codes meaning the token itself will never work again.
const STALE_TOKEN_CODES: &[&str] = &[
    "UNREGISTERED",
    "INVALID_ARGUMENT",
    "messaging/registration-token-not-registered",
    "messaging/invalid-registration-token",
];

/// Push channel configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub project_id: String,
    /// OAuth2 bearer token for the FCM API.
    #[serde(default)]
    pub access_token: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_batch_size() -> usize {
    MAX_MULTICAST_TOKENS
}

fn default_api_base() -> String {
    DEFAULT_FCM_API_BASE.to_string()
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            batch_size: default_batch_size(),
            project_id: String::new(),
            access_token: String::new(),
            api_base: default_api_base(),
            concurrency: default_concurrency(),
            retry: RetryPolicy::default(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl PushConfig {
    pub fn has_credentials(&self) -> bool {
        !self.project_id.is_empty() && !self.access_token.is_empty()
    }
}

/// Visible part of a push message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PushNotification {
    pub title: String,
    pub body: String,
}

/// Per-token outcome of a multicast.
#[derive(Debug, Clone, PartialEq)]
pub struct PushSendResponse {
    pub message_id: Option<String>,
    pub error: Option<DeliveryError>,
}

impl PushSendResponse {
    pub fn success(message_id: impl Into<String>) -> Self {
        Self {
            message_id: Some(message_id.into()),
            error: None,
        }
    }

    pub fn failure(error: DeliveryError) -> Self {
        Self {
            message_id: None,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Multicast outcome; `responses` follows the token order.
#[derive(Debug, Clone, PartialEq)]
pub struct MulticastResponse {
    pub success_count: usize,
    pub failure_count: usize,
    pub responses: Vec<PushSendResponse>,
}

impl MulticastResponse {
    pub fn from_responses(responses: Vec<PushSendResponse>) -> Self {
        let success_count = responses.iter().filter(|r| r.is_success()).count();
        Self {
            success_count,
            failure_count: responses.len() - success_count,
            responses,
        }
    }
}

/// Push provider API.
#[async_trait]
pub trait PushProvider: Send + Sync {
    async fn send(
        &self,
        token: &str,
        notification: &PushNotification,
        data: &BTreeMap<String, String>,
    ) -> Result<String, DeliveryError>;

    /// Send to many tokens. `Err` means the whole call failed.
    async fn send_multicast(
        &self,
        tokens: &[String],
        notification: &PushNotification,
        data: &BTreeMap<String, String>,
    ) -> Result<MulticastResponse, DeliveryError>;
}

/// FCM HTTP v1 client.
pub struct FcmPushProvider {
    client: Client,
    api_base: String,
    project_id: String,
    access_token: String,
    concurrency: usize,
}

impl FcmPushProvider {
    pub fn new(config: &PushConfig, client: Client) -> Self {
        Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            project_id: config.project_id.clone(),
            access_token: config.access_token.clone(),
            concurrency: config.concurrency.max(1),
        }
    }

    fn send_url(&self) -> String {
        format!("{}/v1/projects/{}/messages:send", self.api_base, self.project_id)
    }
}

/// Pull the most specific error code out of an FCM error body.
fn fcm_error_code(body: &Value) -> Option<String> {
    let error = body.get("error")?;
    let detail_code = error
        .get("details")
        .and_then(Value::as_array)
        .and_then(|details| {
            details
                .iter()
                .find_map(|d| d.get("errorCode").and_then(Value::as_str))
        });
    detail_code
        .or_else(|| error.get("status").and_then(Value::as_str))
        .map(str::to_string)
}

#[async_trait]
impl PushProvider for FcmPushProvider {
    async fn send(
        &self,
        token: &str,
        notification: &PushNotification,
        data: &BTreeMap<String, String>,
    ) -> Result<String, DeliveryError> {
        let payload = json!({
            "message": {
                "token": token,
                "notification": notification,
                "data": data,
            }
        });

        let response = self
            .client
            .post(self.send_url())
            .bearer_auth(&self.access_token)
            .json(&payload)
            .send()
            .await
            .map_err(|e| transport_failure("FCM", e))?;

        let status = response.status();
        let body: Value = response.json().await.unwrap_or_default();

        if status.is_success() {
            return body
                .get("name")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| DeliveryError::transient("FCM response missing message name"));
        }

        let code = fcm_error_code(&body);
        let message = body
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| status.to_string());
        Err(classify_http_failure(status, code, message))
    }

    async fn send_multicast(
        &self,
        tokens: &[String],
        notification: &PushNotification,
        data: &BTreeMap<String, String>,
    ) -> Result<MulticastResponse, DeliveryError> {
        let responses = send_each(self, tokens, notification, data, self.concurrency).await;
        Ok(MulticastResponse::from_responses(responses))
    }
}

/// Send to each token with at most `concurrency` requests in flight.
/// Responses keep token order.
async fn send_each<P>(
    provider: &P,
    tokens: &[String],
    notification: &PushNotification,
    data: &BTreeMap<String, String>,
    concurrency: usize,
) -> Vec<PushSendResponse>
where
    P: PushProvider + ?Sized,
{
    let sends: Vec<_> = tokens
        .iter()
        .map(|token| async move {
            match provider.send(token, notification, data).await {
                Ok(id) => PushSendResponse::success(id),
                Err(err) => PushSendResponse::failure(err),
            }
        })
        .collect();

    stream::iter(sends).buffered(concurrency.max(1)).collect().await
}

/// Whether a per-token error means the token should be retired.
pub fn is_stale_token_error(err: &DeliveryError) -> bool {
    match err {
        DeliveryError::Provider { code: Some(code), .. } if err.is_permanent_provider_error() => {
            STALE_TOKEN_CODES.contains(&code.as_str())
        }
        _ => false,
    }
}

/// FCM data values must be strings.
fn flatten_data(structured: &Value) -> BTreeMap<String, String> {
    let Some(map) = structured.as_object() else {
        return BTreeMap::new();
    };
    map.iter()
        .map(|(k, v)| {
            let value = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), value)
        })
        .collect()
}

/// Push channel adapter.
pub struct PushAdapter {
    provider: Arc<dyn PushProvider>,
    batch_size: usize,
    retry: RetryPolicy,
}

impl PushAdapter {
    pub fn new(provider: Arc<dyn PushProvider>, config: &PushConfig) -> Self {
        Self {
            provider,
            batch_size: config.batch_size.clamp(1, MAX_MULTICAST_TOKENS),
            retry: config.retry,
        }
    }

    /// Multicast one message to `indices`, retrying transient failures.
    async fn multicast(
        &self,
        items: &[OutboundMessage],
        indices: Vec<usize>,
        message: &RenderedMessage,
        results: &mut [Option<AttemptResult>],
    ) {
        let notification = PushNotification {
            title: message.title.clone(),
            body: message.body.clone(),
        };
        let data = flatten_data(&message.structured_data);

        let mut pending = indices;
        let mut retry = 0u32;

        while !pending.is_empty() {
            let tokens: Vec<String> = pending.iter().map(|&i| items[i].address.clone()).collect();
            let can_retry = retry < self.retry.max_transient_retries;

            let responses = match self.provider.send_multicast(&tokens, &notification, &data).await {
                Ok(response) => {
                    debug!(
                        success = response.success_count,
                        failure = response.failure_count,
                        "Push multicast completed"
                    );
                    response.responses
                }
                Err(err) if err.is_transient() && can_retry => {
                    warn!(error = %err, tokens = tokens.len(), "Push multicast failed, retrying");
                    tokio::time::sleep(self.retry.delay_for(retry)).await;
                    retry += 1;
                    continue;
                }
                Err(err) => {
                    for &i in &pending {
                        results[i] = Some(AttemptResult::failed(&items[i], err.clone()));
                    }
                    return;
                }
            };

            let mut next = Vec::new();
            for (pos, &i) in pending.iter().enumerate() {
                let item = &items[i];
                let response = responses.get(pos).cloned().unwrap_or_else(|| {
                    PushSendResponse::failure(DeliveryError::transient(
                        "Provider returned no response for token",
                    ))
                });

                match response.error {
                    None => {
                        results[i] = Some(AttemptResult::sent(item, response.message_id, None));
                    }
                    Some(err) if err.is_transient() && can_retry => next.push(i),
                    Some(err) => {
                        let stale = is_stale_token_error(&err);
                        let result = AttemptResult::failed(item, err);
                        results[i] = Some(if stale { result.mark_stale() } else { result });
                    }
                }
            }

            if !next.is_empty() {
                tokio::time::sleep(self.retry.delay_for(retry)).await;
            }
            pending = next;
            retry += 1;
        }
    }
}

#[async_trait]
impl ChannelAdapter for PushAdapter {
    fn channel(&self) -> Channel {
        Channel::Push
    }

    #[instrument(skip(self, items), fields(items = items.len()))]
    async fn send_batch(&self, items: Vec<OutboundMessage>) -> Vec<AttemptResult> {
        let mut results: Vec<Option<AttemptResult>> = vec![None; items.len()];

        let mut valid = Vec::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
            match validate_address(Channel::Push, &item.address) {
                Ok(()) => valid.push(i),
                Err(err) => results[i] = Some(AttemptResult::failed(item, err)),
            }
        }

        for batch in valid.chunks(self.batch_size) {
            // One multicast per distinct message inside the batch.
            let mut groups: Vec<(&RenderedMessage, Vec<usize>)> = Vec::new();
            for &i in batch {
                let message = &items[i].message;
                match groups.iter_mut().find(|(m, _)| *m == message) {
                    Some((_, indices)) => indices.push(i),
                    None => groups.push((message, vec![i])),
                }
            }

            for (message, indices) in groups {
                self.multicast(&items, indices, message, &mut results).await;
            }
        }

        items
            .iter()
            .zip(results)
            .map(|(item, result)| {
                result.unwrap_or_else(|| {
                    AttemptResult::failed(item, DeliveryError::transient("Push result missing"))
                })
            })
            .collect()
    }
}
