//! Tracing setup: stdout plus one log file per day.

use crate::config::LogConfig;
use crate::error::{Error, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

pub const LOG_FILE_PREFIX: &str = "breakcast.log";

/// Keeps the file writer flushing. Hold it until the process exits.
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

/// Default filter directive: our crate at the configured level, others at warn.
pub fn default_directive(level: &str) -> String {
    format!("warn,breakcast={}", level)
}

/// Install the global subscriber. `RUST_LOG` overrides the configured level.
pub fn init(config: &LogConfig) -> Result<LogGuard> {
    let filter = || {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_directive(&config.level)))
    };

    let stdout_layer = config
        .stdout
        .then(|| fmt::layer().with_target(true).with_filter(filter()));

    let (file_layer, guard) = if config.dir.as_os_str().is_empty() {
        (None, None)
    } else {
        std::fs::create_dir_all(&config.dir)?;
        let appender = rolling::daily(&config.dir, LOG_FILE_PREFIX);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_thread_names(true)
            .with_filter(filter());
        (Some(layer), Some(guard))
    };

    tracing_subscriber::registry()
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| Error::Internal(format!("logging already initialised: {}", e)))?;

    Ok(LogGuard { _file: guard })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directive_scopes_level_to_crate() {
        assert_eq!(default_directive("debug"), "warn,breakcast=debug");
        assert!(EnvFilter::try_new(default_directive("info")).is_ok());
    }
}
