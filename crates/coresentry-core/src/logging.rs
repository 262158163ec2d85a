//! Tracing subscriber setup for the daemon and CLI.
//!
//! `RUST_LOG` wins when set. Otherwise `-v` flags raise the level above the
//! configured one. Output goes to stdout, or is appended to the configured
//! log file without ANSI colours.

use std::fs::OpenOptions;
use std::sync::Mutex;

use coresentry_config::LoggingConfig;
use tracing_subscriber::EnvFilter;

/// Errors from installing the global subscriber.
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to open log file {path}: {source}")]
    File {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to install tracing subscriber: {0}")]
    Install(String),
}

/// Level directive for the given configured level and `-v` count.
pub fn filter_directive(configured: &str, verbosity: u8) -> String {
    match verbosity {
        0 => configured.to_string(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    }
}

fn env_filter(configured: &str, verbosity: u8) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(configured, verbosity)))
}

/// Install the global tracing subscriber.
pub fn init(config: &LoggingConfig, verbosity: u8) -> Result<(), LoggingError> {
    let filter = env_filter(&config.level, verbosity);

    match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| LoggingError::File {
                    path: path.display().to_string(),
                    source,
                })?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
                .map_err(|e| LoggingError::Install(e.to_string()))
        }
        None => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .try_init()
            .map_err(|e| LoggingError::Install(e.to_string())),
    }
}
