//! Tracing initialization.

use tracing_subscriber::EnvFilter;

use crate::config::{LogConfig, LogFormat};

/// Installs the global subscriber honoring `LOG_LEVEL` and `LOG_FORMAT`.
/// Safe to call more than once; later calls are no-ops.
pub fn init(log: &LogConfig) {
    let filter = EnvFilter::try_new(&log.level)
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_default();

    let result = match log.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(false)
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .try_init(),
    };
    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
