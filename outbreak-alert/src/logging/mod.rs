//! Logging setup: console plus a daily log file, with a filter that can be
//! changed at runtime. Timestamps use the local timezone.

use chrono::Local;
use std::path::Path;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Registry,
    fmt::{self, format::Writer, time::FormatTime},
    layer::SubscriberExt,
    reload::{self, Handle},
    util::SubscriberInitExt,
};

use crate::{Error, Result};

/// Filter used when `RUST_LOG` is unset or invalid.
pub const DEFAULT_LOG_FILTER: &str = "outbreak_alert=info,sqlx=warn,reqwest=warn";

/// Log file prefix; the appender adds `.YYYY-MM-DD`.
pub const LOG_FILE_PREFIX: &str = "outbreak-alert.log";

#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

pub type FilterHandle = Handle<EnvFilter, Registry>;

/// Parse a filter directive such as `outbreak_alert=debug,sqlx=warn`.
pub fn parse_filter(directive: &str) -> Result<EnvFilter> {
    EnvFilter::try_new(directive)
        .map_err(|e| Error::config(format!("Invalid log filter '{}': {}", directive, e)))
}

/// Handle to the installed subscriber's filter.
#[derive(Clone)]
pub struct LoggingConfig {
    handle: FilterHandle,
}

impl LoggingConfig {
    /// Swap the active filter. The old filter stays if `directive` is invalid.
    pub fn set_filter(&self, directive: &str) -> Result<()> {
        let filter = parse_filter(directive)?;
        self.handle
            .reload(filter)
            .map_err(|e| Error::Other(format!("Failed to reload log filter: {}", e)))?;
        info!(%directive, "Log filter updated");
        Ok(())
    }
}

/// Install console and daily-rolling file output under `log_dir`.
///
/// Keep the returned guard alive for the process lifetime; dropping it stops
/// the background file writer.
pub fn init_logging(log_dir: impl AsRef<Path>) -> Result<(LoggingConfig, WorkerGuard)> {
    let log_dir = log_dir.as_ref();
    std::fs::create_dir_all(log_dir).map_err(|e| {
        Error::config(format!("Failed to create log directory {}: {}", log_dir.display(), e))
    })?;

    let (file_writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX));

    let initial = std::env::var("RUST_LOG")
        .ok()
        .and_then(|directive| parse_filter(&directive).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_FILTER));
    let (filter_layer, handle) = reload::Layer::new(initial);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::layer().with_timer(LocalTimer))
        .with(
            fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_timer(LocalTimer),
        )
        .try_init()
        .map_err(|e| Error::Other(format!("Failed to install log subscriber: {}", e)))?;

    info!(log_dir = %log_dir.display(), "Logging initialised");
    Ok((LoggingConfig { handle }, guard))
}
