//! Log subscriber setup.

use tracing_subscriber::EnvFilter;

use crate::config::{Config, LogFormat};

/// Installs the global subscriber described by `config`.
///
/// Only the first call in a process takes effect.
pub fn init(config: &Config) {
    // Directives were checked when the config was loaded.
    let filter = EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let installed = match config.log_format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Plain => builder.try_init(),
    };
    if installed.is_ok() {
        tracing::debug!(filter = %config.log_filter, format = ?config.log_format, "logging ready");
    }
}
