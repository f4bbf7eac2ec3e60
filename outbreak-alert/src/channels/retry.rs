//! Bounded retry for transient provider errors.
//!
//! Retries happen inside one attempt; callers only ever see the final outcome.

use std::future::Future;
use std::time::Duration;

use rand::random;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::debug;

use crate::error::DeliveryError;

/// Retry settings shared by all adapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Extra provider calls after a transient failure.
    #[serde(default = "default_max_transient_retries")]
    pub max_transient_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_transient_retries() -> u32 {
    1
}

fn default_base_delay_ms() -> u64 {
    250
}

fn default_max_delay_ms() -> u64 {
    2000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_transient_retries: default_max_transient_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryPolicy {
    /// No retries and no delay.
    pub fn none() -> Self {
        Self {
            max_transient_retries: 0,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// Exponential backoff with +/-25% jitter.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = self
            .base_delay_ms
            .saturating_mul(1u64 << retry.min(16))
            .min(self.max_delay_ms);

        let jitter_range = exp / 4;
        let delay_ms = if jitter_range > 0 {
            let offset = random::<u64>() % (jitter_range * 2 + 1);
            (exp + offset).saturating_sub(jitter_range)
        } else {
            exp
        };
        Duration::from_millis(delay_ms)
    }
}

/// Run `op`, repeating it while it fails transiently and retries remain.
pub async fn with_transient_retry<T, F, Fut>(
    policy: &RetryPolicy,
    op_name: &'static str,
    mut op: F,
) -> Result<T, DeliveryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DeliveryError>>,
{
    let mut retry = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && retry < policy.max_transient_retries => {
                let delay = policy.delay_for(retry);
                debug!(
                    "Transient {} failure, retrying in {:?} (retry {}/{}): {}",
                    op_name,
                    delay,
                    retry + 1,
                    policy.max_transient_retries,
                    err
                );
                sleep(delay).await;
                retry += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
