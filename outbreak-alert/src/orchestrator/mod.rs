//! Delivery orchestration.
//!
//! `dispatch` drives one alert through
//! `received -> resolving -> rendering -> dispatching -> aggregating -> completed`:
//!
//! 1. Validate the alert and resolve `(recipient, channel)` targets.
//! 2. Render one message per target with the channel's render options.
//! 3. Spawn one task per channel and wait for all of them up to one deadline.
//! 4. Merge results into the record, save it once, then apply anything that
//!    arrives after the deadline through the keyed update path.

mod builder;
mod callbacks;

pub use builder::OrchestratorBuilder;
pub use callbacks::{CallbackOutcome, StatusCallback};

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout_at};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use crate::channels::{AttemptResult, ChannelAdapter, OutboundMessage};
use crate::domain::{
    AlertEvent, AttemptKey, Channel, DeliveryAttempt, DeliveryRecord, DispatchState, StaleAddress,
};
use crate::error::DeliveryError;
use crate::resolver::{RecipientDirectory, RecipientResolver};
use crate::store::DeliveryStore;
use crate::template::{OUTBREAK_ALERT, TemplateEngine, TemplateParams};
use crate::{Error, Result};

/// Orchestrator settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Overall deadline for all channel dispatches of one alert.
    #[serde(default = "default_dispatch_timeout_ms")]
    pub dispatch_timeout_ms: u64,
    /// Template rendered for alerts; the risk level selects the variant.
    #[serde(default = "default_template_name")]
    pub template_name: String,
}

fn default_dispatch_timeout_ms() -> u64 {
    30_000
}

fn default_template_name() -> String {
    OUTBREAK_ALERT.to_string()
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            dispatch_timeout_ms: default_dispatch_timeout_ms(),
            template_name: default_template_name(),
        }
    }
}

impl OrchestratorConfig {
    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }
}

/// One spawned channel dispatch.
struct ChannelTask {
    channel: Channel,
    /// Attempt indices in the record, in item order.
    indices: Vec<usize>,
    handle: JoinHandle<Vec<AttemptResult>>,
}

/// A channel task that outlived the deadline.
struct LateTask {
    channel: Channel,
    keys: Vec<AttemptKey>,
    handle: JoinHandle<Vec<AttemptResult>>,
}

pub struct DeliveryOrchestrator {
    resolver: RecipientResolver,
    templates: Arc<TemplateEngine>,
    adapters: HashMap<Channel, Arc<dyn ChannelAdapter>>,
    store: Arc<dyn DeliveryStore>,
    config: OrchestratorConfig,
    cancel: CancellationToken,
    background: TaskTracker,
}

impl DeliveryOrchestrator {
    pub fn new(
        resolver: RecipientResolver,
        templates: Arc<TemplateEngine>,
        store: Arc<dyn DeliveryStore>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            resolver,
            templates,
            adapters: HashMap::new(),
            store,
            config,
            cancel: CancellationToken::new(),
            background: TaskTracker::new(),
        }
    }

    /// Register (or replace) the adapter for its channel.
    pub fn with_adapter(mut self, adapter: Arc<dyn ChannelAdapter>) -> Self {
        self.adapters.insert(adapter.channel(), adapter);
        self
    }

    pub fn with_cancellation_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn DeliveryStore> {
        &self.store
    }

    pub fn has_adapter(&self, channel: Channel) -> bool {
        self.adapters.contains_key(&channel)
    }

    /// Fan an alert out to its recipients and persist the outcome.
    ///
    /// Per-recipient failures are recorded on the attempts; only a malformed
    /// alert, a directory failure or a store failure returns `Err`.
    #[instrument(skip(self, alert), fields(alert_id = %alert.alert_id, risk_level = %alert.risk_level))]
    pub async fn dispatch(&self, alert: AlertEvent) -> Result<DeliveryRecord> {
        alert.validate()?;
        let template = self.config.template_name.clone();
        let variant = alert.risk_level.as_str();
        if !self.templates.contains(&template, Some(variant)) {
            return Err(Error::validation(format!(
                "No '{}' template for risk level {}",
                template, variant
            )));
        }

        let deadline = Instant::now() + self.config.dispatch_timeout();
        let mut record = DeliveryRecord::new(alert);

        record.advance(DispatchState::Resolving)?;
        let targets = self.resolver.resolve(&record.alert).await?;

        record.advance(DispatchState::Rendering)?;
        let outbound = self.render_targets(&mut record, targets, &template, variant);

        record.advance(DispatchState::Dispatching)?;
        let mut tasks: Vec<ChannelTask> = outbound
            .into_iter()
            .filter_map(|(channel, items)| {
                let adapter = self.adapters.get(&channel)?.clone();
                let (indices, messages): (Vec<usize>, Vec<OutboundMessage>) = items.into_iter().unzip();
                debug!(%channel, items = messages.len(), "Dispatching channel");
                let handle = tokio::spawn(async move { adapter.send_batch(messages).await });
                Some(ChannelTask {
                    channel,
                    indices,
                    handle,
                })
            })
            .collect();

        let outcomes = join_all(
            tasks
                .iter_mut()
                .map(|task| timeout_at(deadline, &mut task.handle)),
        )
        .await;

        record.advance(DispatchState::Aggregating)?;
        let mut late = Vec::new();
        for (task, outcome) in tasks.into_iter().zip(outcomes) {
            match outcome {
                Ok(Ok(results)) => {
                    merge_results(&mut record, task.channel, &task.indices, results);
                }
                Ok(Err(join_err)) => {
                    warn!(channel = %task.channel, error = %join_err, "Channel task failed");
                    let err = DeliveryError::transient(format!("{} dispatch task failed: {}", task.channel, join_err));
                    for &idx in &task.indices {
                        record.attempts[idx].fail(err.clone());
                    }
                }
                Err(_) => {
                    warn!(channel = %task.channel, items = task.indices.len(), "Channel dispatch timed out");
                    let alert_id = record.alert_id().to_string();
                    let mut keys = Vec::with_capacity(task.indices.len());
                    for &idx in &task.indices {
                        let attempt = &mut record.attempts[idx];
                        attempt.fail(DeliveryError::Timeout {
                            channel: task.channel,
                        });
                        keys.push(attempt.key(&alert_id));
                    }
                    late.push(LateTask {
                        channel: task.channel,
                        keys,
                        handle: task.handle,
                    });
                }
            }
        }

        record.advance(DispatchState::Completed)?;
        self.store.save(&record).await?;

        report_stale(self.resolver.directory().as_ref(), &record.stale_addresses).await;
        for task in late {
            self.spawn_late_apply(task);
        }

        let summary = record.summary();
        info!(
            attempts = summary.total,
            sent = summary.sent,
            failed = summary.failed,
            rate_limited = summary.rate_limited,
            stale = record.stale_addresses.len(),
            "Alert dispatch completed"
        );
        Ok(record)
    }

    /// Create one attempt per target and group renderable ones by channel.
    fn render_targets(
        &self,
        record: &mut DeliveryRecord,
        targets: Vec<crate::resolver::ResolvedTarget>,
        template: &str,
        variant: &str,
    ) -> BTreeMap<Channel, Vec<(usize, OutboundMessage)>> {
        let base_params = TemplateParams::for_alert(&record.alert);
        let mut outbound: BTreeMap<Channel, Vec<(usize, OutboundMessage)>> = BTreeMap::new();

        for target in targets {
            let recipient = &target.recipient;
            let channel = target.channel;
            if record.attempt(&recipient.recipient_id, channel).is_some() {
                continue;
            }

            let address = recipient.address_for(channel).unwrap_or_default().to_string();
            let mut attempt = DeliveryAttempt::pending(
                &recipient.recipient_id,
                channel,
                &address,
                template,
                Some(variant.to_string()),
            );

            let message = match self.adapters.get(&channel) {
                None => {
                    attempt.fail(DeliveryError::ChannelUnavailable { channel });
                    None
                }
                Some(_) if address.is_empty() => {
                    attempt.fail(DeliveryError::InvalidAddress {
                        channel,
                        address: String::new(),
                        reason: "no address on file".to_string(),
                    });
                    None
                }
                Some(adapter) => {
                    let mut params = base_params.clone();
                    params.merge_missing(&recipient.attributes);
                    match self
                        .templates
                        .render(template, Some(variant), &params, &adapter.render_options())
                    {
                        Ok(message) => Some(message),
                        Err(err) => {
                            warn!(recipient_id = %recipient.recipient_id, %channel, error = %err, "Render failed");
                            attempt.fail(err);
                            None
                        }
                    }
                }
            };

            let idx = record.attempts.len();
            record.push_attempt(attempt);
            if let Some(message) = message {
                outbound.entry(channel).or_default().push((
                    idx,
                    OutboundMessage::new(&recipient.recipient_id, address, message),
                ));
            }
        }

        outbound
    }

    /// Apply a timed-out channel's results once they arrive.
    fn spawn_late_apply(&self, task: LateTask) {
        let store = self.store.clone();
        let directory = self.resolver.directory().clone();
        let cancel = self.cancel.clone();

        self.background.spawn(async move {
            let LateTask {
                channel,
                keys,
                handle,
            } = task;

            let results = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(%channel, "Shutdown before late results arrived");
                    return;
                }
                joined = handle => match joined {
                    Ok(results) => results,
                    Err(e) => {
                        warn!(%channel, error = %e, "Late channel task failed");
                        return;
                    }
                },
            };

            if results.len() != keys.len() {
                warn!(
                    %channel,
                    expected = keys.len(),
                    got = results.len(),
                    "Adapter returned a mismatched late result count"
                );
            }

            let mut applied = 0usize;
            let mut stale = Vec::new();
            let mut results = results.into_iter();
            for key in &keys {
                // Attempts without a matching result keep their timeout error.
                let Some(result) = results.next().filter(|r| r.recipient_id == key.recipient_id) else {
                    warn!(%key, "No late result for this attempt");
                    continue;
                };
                match store.update_attempt(key, &result.to_patch()).await {
                    Ok(true) => applied += 1,
                    Ok(false) => warn!(%key, "Late result for unknown attempt"),
                    Err(e) => warn!(%key, error = %e, "Failed to apply late result"),
                }
                if result.stale {
                    stale.push(stale_address(channel, &result));
                }
            }
            report_stale(directory.as_ref(), &stale).await;
            info!(%channel, applied, "Applied late delivery results");
        });
    }

    /// Wait for outstanding late-result tasks.
    pub async fn wait_for_background_tasks(&self) {
        self.background.close();
        self.background.wait().await;
        self.background.reopen();
    }

    /// Stop late-result tasks and wait for them to exit.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.background.close();
        self.background.wait().await;
    }
}

/// Merge adapter results (in item order) into the record.
fn merge_results(
    record: &mut DeliveryRecord,
    channel: Channel,
    indices: &[usize],
    results: Vec<AttemptResult>,
) {
    if results.len() != indices.len() {
        warn!(
            %channel,
            expected = indices.len(),
            got = results.len(),
            "Adapter returned a mismatched result count"
        );
    }

    let mut results = results.into_iter();
    for &idx in indices {
        let attempt = &mut record.attempts[idx];
        match results.next() {
            Some(result) if result.recipient_id == attempt.recipient_id => {
                attempt.apply(&result.to_patch());
                if result.stale {
                    record.stale_addresses.push(stale_address(channel, &result));
                }
            }
            _ => attempt.fail(DeliveryError::transient("Adapter returned no result for this item")),
        }
    }
}

fn stale_address(channel: Channel, result: &AttemptResult) -> StaleAddress {
    StaleAddress {
        recipient_id: result.recipient_id.clone(),
        channel,
        address: result.address.clone(),
        reason: result
            .error
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "rejected by provider".to_string()),
    }
}

/// Best-effort; failures are logged and dropped.
async fn report_stale(directory: &dyn RecipientDirectory, stale: &[StaleAddress]) {
    for entry in stale {
        if let Err(e) = directory
            .report_stale_address(&entry.recipient_id, entry.channel, &entry.address, &entry.reason)
            .await
        {
            warn!(
                recipient_id = %entry.recipient_id,
                channel = %entry.channel,
                error = %e,
                "Failed to report stale address"
            );
        }
    }
}
