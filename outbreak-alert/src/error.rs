//! Application-wide error types.
//!
//! [`Error`] covers structural failures that abort a whole dispatch (malformed
//! alert, unreachable directory, persistence failure). Per-recipient outcomes
//! never surface as [`Error`]; they are recorded on the attempt as a
//! [`DeliveryError`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::Channel;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    DatabaseSqlx(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Recipient directory error: {0}")]
    Directory(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn directory(msg: impl Into<String>) -> Self {
        Self::Directory(msg.into())
    }
}

/// Whether a provider failure may succeed if the same call is repeated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    /// Network error, throttling or 5xx. Eligible for the adapter's bounded retry.
    Transient,
    /// Invalid or unregistered address/token, rejected payload, bad credentials.
    Permanent,
}

/// Outcome error of a single delivery attempt.
///
/// Stored on [`crate::domain::DeliveryAttempt`] and persisted as JSON.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeliveryError {
    #[error("Invalid {channel} address '{address}': {reason}")]
    InvalidAddress {
        channel: Channel,
        address: String,
        reason: String,
    },

    #[error("Rate limited: {address} exceeded {limit} messages per {window_secs}s")]
    RateLimited {
        address: String,
        limit: usize,
        window_secs: u64,
    },

    #[error("Provider error ({kind:?}{}): {message}", .code.as_deref().map(|c| format!(", code {c}")).unwrap_or_default())]
    Provider {
        kind: ProviderErrorKind,
        code: Option<String>,
        message: String,
    },

    #[error("Template '{template}' is missing parameter '{key}'")]
    TemplateRender { template: String, key: String },

    #[error("Unknown template '{template}' (variant: {})", .variant.as_deref().unwrap_or("none"))]
    UnknownTemplate {
        template: String,
        variant: Option<String>,
    },

    #[error("Timed out waiting for the {channel} provider")]
    Timeout { channel: Channel },

    #[error("No adapter configured for channel {channel}")]
    ChannelUnavailable { channel: Channel },
}

impl DeliveryError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Provider {
            kind: ProviderErrorKind::Transient,
            code: None,
            message: message.into(),
        }
    }

    pub fn permanent(code: Option<String>, message: impl Into<String>) -> Self {
        Self::Provider {
            kind: ProviderErrorKind::Permanent,
            code,
            message: message.into(),
        }
    }

    /// Whether the adapter may repeat the provider call.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Provider {
                kind: ProviderErrorKind::Transient,
                ..
            }
        )
    }

    pub fn is_permanent_provider_error(&self) -> bool {
        matches!(
            self,
            Self::Provider {
                kind: ProviderErrorKind::Permanent,
                ..
            }
        )
    }
}
