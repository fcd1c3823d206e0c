//! Tracing setup: human-readable lines on stdout plus a `current.log` file
//! next to the configuration.

use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub const LOG_FILE_NAME: &str = "current.log";

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("cannot create log directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid log level '{level}': {source}")]
    Level {
        level: String,
        #[source]
        source: tracing_subscriber::filter::ParseError,
    },
    #[error("tracing already initialised: {0}")]
    Init(#[from] tracing_subscriber::util::TryInitError),
}

/// `RUST_LOG` wins over the configured level when set.
fn build_filter(level: &str) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(level).map_err(|source| LoggingError::Level {
        level: level.to_string(),
        source,
    })
}

/// Install the global subscriber. Keep the returned guard alive for the
/// lifetime of the process or buffered file lines are lost.
pub fn init(directory: &Path, level: &str) -> Result<WorkerGuard, LoggingError> {
    std::fs::create_dir_all(directory).map_err(|source| LoggingError::Directory {
        path: directory.to_path_buf(),
        source,
    })?;

    let filter = build_filter(level)?;

    let file_appender = tracing_appender::rolling::never(directory, LOG_FILE_NAME);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let stdout_layer = fmt::layer().with_target(false);
    let file_layer = fmt::layer().with_writer(file_writer).with_ansi(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()?;

    info!(log_file = %directory.join(LOG_FILE_NAME).display(), "logging initialised");
    Ok(guard)
}
