//! Tracing subscriber setup from the `log` section of the config.

use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LogLevel, LoggingConfig};

/// Initialize the global subscriber.
///
/// The configured level is the default directive; the `GHOTI_LOG` env var
/// accepts the usual filter syntax for per-target overrides. Calling this
/// twice (tests) leaves the first subscriber in place.
pub fn init(config: &LoggingConfig) {
    let filter = EnvFilter::builder()
        .with_default_directive(level_filter(config.level).into())
        .with_env_var("GHOTI_LOG")
        .from_env_lossy();

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match config.format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    if result.is_err() {
        tracing::debug!("tracing subscriber was already initialized");
    }
}

fn level_filter(level: LogLevel) -> tracing::metadata::LevelFilter {
    match level {
        LogLevel::Debug => tracing::metadata::LevelFilter::DEBUG,
        LogLevel::Info => tracing::metadata::LevelFilter::INFO,
        LogLevel::Warn => tracing::metadata::LevelFilter::WARN,
        LogLevel::Error => tracing::metadata::LevelFilter::ERROR,
    }
}
