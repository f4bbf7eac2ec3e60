//! Wires a [`DeliveryOrchestrator`] from a [`PipelineConfig`].

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::DeliveryOrchestrator;
use crate::channels::{
    ChannelAdapter, EmailAdapter, FcmPushProvider, HttpEmailProvider, PushAdapter, SlidingWindowRateLimiter,
    SmsAdapter, TwilioSmsProvider,
};
use crate::config::PipelineConfig;
use crate::database::{init_pool, run_migrations};
use crate::domain::Channel;
use crate::resolver::{RecipientDirectory, RecipientResolver};
use crate::store::{DeliveryStore, InMemoryDeliveryStore, SqlxDeliveryStore};
use crate::template::TemplateEngine;
use crate::utils::http_client::build_provider_client;
use crate::{Error, Result};

/// Builder for [`DeliveryOrchestrator`].
///
/// Explicitly supplied parts win over what the configuration would create.
pub struct OrchestratorBuilder {
    config: PipelineConfig,
    directory: Option<Arc<dyn RecipientDirectory>>,
    store: Option<Arc<dyn DeliveryStore>>,
    templates: Option<Arc<TemplateEngine>>,
    adapters: Vec<Arc<dyn ChannelAdapter>>,
    rate_limiter: Option<Arc<SlidingWindowRateLimiter>>,
    cancel: Option<CancellationToken>,
}

impl OrchestratorBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            directory: None,
            store: None,
            templates: None,
            adapters: Vec::new(),
            rate_limiter: None,
            cancel: None,
        }
    }

    pub fn directory(mut self, directory: Arc<dyn RecipientDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn store(mut self, store: Arc<dyn DeliveryStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn templates(mut self, templates: Arc<TemplateEngine>) -> Self {
        self.templates = Some(templates);
        self
    }

    /// Use this adapter instead of building one from configuration.
    pub fn adapter(mut self, adapter: Arc<dyn ChannelAdapter>) -> Self {
        self.adapters.push(adapter);
        self
    }

    /// Share an SMS rate limiter across orchestrators.
    pub fn rate_limiter(mut self, limiter: Arc<SlidingWindowRateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn cancellation_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub async fn build(self) -> Result<DeliveryOrchestrator> {
        let config = self.config;
        config.validate()?;

        let directory = self
            .directory
            .ok_or_else(|| Error::config("A recipient directory is required"))?;

        let templates = match (self.templates, &config.templates_path) {
            (Some(templates), _) => templates,
            (None, Some(path)) => Arc::new(TemplateEngine::from_file(path)?),
            (None, None) => Arc::new(TemplateEngine::builtin()),
        };

        let store: Arc<dyn DeliveryStore> = match (self.store, &config.database_url) {
            (Some(store), _) => store,
            (None, Some(url)) => {
                let pool = init_pool(url).await?;
                run_migrations(&pool).await?;
                Arc::new(SqlxDeliveryStore::new(pool))
            }
            (None, None) => {
                warn!("No database configured; delivery records are kept in memory only");
                Arc::new(InMemoryDeliveryStore::new())
            }
        };

        let resolver = RecipientResolver::new(directory, config.policy.clone());
        let mut orchestrator =
            DeliveryOrchestrator::new(resolver, templates, store, config.orchestrator.clone());
        if let Some(cancel) = self.cancel {
            orchestrator = orchestrator.with_cancellation_token(cancel);
        }

        let explicit: Vec<Channel> = self.adapters.iter().map(|a| a.channel()).collect();
        for adapter in self.adapters {
            orchestrator = orchestrator.with_adapter(adapter);
        }

        if !explicit.contains(&Channel::Sms)
            && channel_ready(Channel::Sms, config.sms.enabled, config.sms.has_credentials())
        {
            let client = build_provider_client(Duration::from_millis(config.sms.request_timeout_ms));
            let limiter = self
                .rate_limiter
                .unwrap_or_else(|| Arc::new(SlidingWindowRateLimiter::new(config.sms.rate_limit)));
            let provider = Arc::new(TwilioSmsProvider::new(&config.sms, client));
            orchestrator = orchestrator.with_adapter(Arc::new(SmsAdapter::new(provider, limiter, &config.sms)));
        }

        if !explicit.contains(&Channel::Push)
            && channel_ready(Channel::Push, config.push.enabled, config.push.has_credentials())
        {
            let client = build_provider_client(Duration::from_millis(config.push.request_timeout_ms));
            let provider = Arc::new(FcmPushProvider::new(&config.push, client));
            orchestrator = orchestrator.with_adapter(Arc::new(PushAdapter::new(provider, &config.push)));
        }

        if !explicit.contains(&Channel::Email)
            && channel_ready(Channel::Email, config.email.enabled, config.email.has_credentials())
        {
            let client = build_provider_client(Duration::from_millis(config.email.request_timeout_ms));
            let provider = Arc::new(HttpEmailProvider::new(&config.email, client));
            orchestrator = orchestrator.with_adapter(Arc::new(EmailAdapter::new(provider, &config.email)));
        }

        let channels: Vec<String> = [Channel::Sms, Channel::Push, Channel::Email]
            .into_iter()
            .filter(|c| orchestrator.has_adapter(*c))
            .map(|c| c.to_string())
            .collect();
        info!(channels = ?channels, "Delivery orchestrator ready");

        Ok(orchestrator)
    }
}

fn channel_ready(channel: Channel, enabled: bool, has_credentials: bool) -> bool {
    if enabled && !has_credentials {
        warn!(%channel, "Channel enabled without credentials; it will be unavailable");
    }
    enabled && has_credentials
}
