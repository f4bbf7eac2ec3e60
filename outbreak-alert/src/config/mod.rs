//! Pipeline configuration.
//!
//! Loaded from an optional JSON file, then overridden by environment
//! variables (a `.env` file is honoured). Every field has a default.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::channels::push::MAX_MULTICAST_TOKENS;
use crate::channels::{EmailConfig, PushConfig, SmsConfig};
use crate::orchestrator::OrchestratorConfig;
use crate::resolver::RecipientPolicy;
use crate::{Error, Result};

pub const ENV_CONFIG_PATH: &str = "OUTBREAK_ALERT_CONFIG";
pub const ENV_DATABASE_URL: &str = "DATABASE_URL";
pub const ENV_TWILIO_ACCOUNT_SID: &str = "TWILIO_ACCOUNT_SID";
pub const ENV_TWILIO_AUTH_TOKEN: &str = "TWILIO_AUTH_TOKEN";
pub const ENV_TWILIO_FROM_NUMBER: &str = "TWILIO_FROM_NUMBER";
pub const ENV_TWILIO_STATUS_CALLBACK_URL: &str = "TWILIO_STATUS_CALLBACK_URL";
pub const ENV_FCM_PROJECT_ID: &str = "FCM_PROJECT_ID";
pub const ENV_FCM_ACCESS_TOKEN: &str = "FCM_ACCESS_TOKEN";
pub const ENV_EMAIL_API_URL: &str = "EMAIL_API_URL";
pub const ENV_EMAIL_API_KEY: &str = "EMAIL_API_KEY";
pub const ENV_EMAIL_FROM: &str = "EMAIL_FROM";
pub const ENV_DISPATCH_TIMEOUT_MS: &str = "ALERT_DISPATCH_TIMEOUT_MS";

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    /// Risk level -> fan-out rule.
    #[serde(default)]
    pub policy: RecipientPolicy,
    /// JSON template table; built-in templates when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub templates_path: Option<PathBuf>,
    #[serde(default)]
    pub sms: SmsConfig,
    #[serde(default)]
    pub push: PushConfig,
    #[serde(default)]
    pub email: EmailConfig,
    /// SQLite URL; in-memory store when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
}

impl PipelineConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::config(format!("Invalid configuration: {}", e)))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        let config = Self::from_json_str(&content)?;
        info!(path = %path.display(), "Loaded pipeline configuration");
        Ok(config)
    }

    /// Load from `OUTBREAK_ALERT_CONFIG` (if set) plus environment overrides.
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            debug!("No .env file loaded: {}", e);
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Self::from_env`] with an explicit variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match lookup(ENV_CONFIG_PATH).filter(|p| !p.is_empty()) {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(&lookup)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides. Supplying credentials for a channel enables it.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = get(ENV_DATABASE_URL) {
            self.database_url = Some(url);
        }
        if let Some(raw) = get(ENV_DISPATCH_TIMEOUT_MS) {
            self.orchestrator.dispatch_timeout_ms = raw.trim().parse().map_err(|_| {
                Error::config(format!("{} must be an integer, got '{}'", ENV_DISPATCH_TIMEOUT_MS, raw))
            })?;
        }

        let mut sms_overridden = false;
        for (key, field) in [
            (ENV_TWILIO_ACCOUNT_SID, &mut self.sms.account_sid),
            (ENV_TWILIO_AUTH_TOKEN, &mut self.sms.auth_token),
            (ENV_TWILIO_FROM_NUMBER, &mut self.sms.from_number),
        ] {
            if let Some(value) = get(key) {
                *field = value;
                sms_overridden = true;
            }
        }
        if let Some(url) = get(ENV_TWILIO_STATUS_CALLBACK_URL) {
            self.sms.status_callback_url = Some(url);
        }
        if sms_overridden && self.sms.has_credentials() {
            self.sms.enabled = true;
        }

        let mut push_overridden = false;
        for (key, field) in [
            (ENV_FCM_PROJECT_ID, &mut self.push.project_id),
            (ENV_FCM_ACCESS_TOKEN, &mut self.push.access_token),
        ] {
            if let Some(value) = get(key) {
                *field = value;
                push_overridden = true;
            }
        }
        if push_overridden && self.push.has_credentials() {
            self.push.enabled = true;
        }

        let mut email_overridden = false;
        for (key, field) in [
            (ENV_EMAIL_API_URL, &mut self.email.api_url),
            (ENV_EMAIL_API_KEY, &mut self.email.api_key),
            (ENV_EMAIL_FROM, &mut self.email.from_address),
        ] {
            if let Some(value) = get(key) {
                *field = value;
                email_overridden = true;
            }
        }
        if email_overridden && self.email.has_credentials() {
            self.email.enabled = true;
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.orchestrator.dispatch_timeout_ms == 0 {
            return Err(Error::config("dispatch_timeout_ms must be greater than 0"));
        }
        if self.orchestrator.template_name.trim().is_empty() {
            return Err(Error::config("template_name must not be empty"));
        }
        if self.sms.batch_size == 0 || self.push.batch_size == 0 || self.email.batch_size == 0 {
            return Err(Error::config("batch sizes must be greater than 0"));
        }
        if self.push.batch_size > MAX_MULTICAST_TOKENS {
            return Err(Error::config(format!(
                "push batch_size must be at most {}, got {}",
                MAX_MULTICAST_TOKENS, self.push.batch_size
            )));
        }
        if self.sms.rate_limit.max_per_window == 0 || self.sms.rate_limit.window_secs == 0 {
            return Err(Error::config("sms rate_limit values must be greater than 0"));
        }
        if self.email.enabled && !self.email.api_url.is_empty() {
            let url = &self.email.api_url;
            url::Url::parse(url)
                .map_err(|e| Error::config(format!("Invalid email api_url '{}': {}", url, e)))?;
        }
        Ok(())
    }
}
