//! Structured logging for gpusched
//!
//! The scheduler itself only emits `tracing` events and spans; this module
//! installs the subscriber that renders them.
//!
//! # Usage
//!
//! Initialize logging once at startup, typically from the `[log]` table of
//! the scheduler config:
//!
//! ```ignore
//! use gpusched_core::config::SchedulerConfig;
//! use gpusched_core::logging::init_logging;
//!
//! let config = SchedulerConfig::load(path)?;
//! init_logging(&config.log)?;
//! ```
//!
//! # Correlation Fields
//!
//! Use these field names consistently in spans and events:
//! - `get_offset`, `put_offset`: ring buffer cursors
//! - `unscheduled_count`, `rescheduled_count`: scheduling state
//! - `pending_fences`: unschedule queue depth
//! - `error`, `reason`: latched command errors and context loss reasons

pub use crate::config::LogFormat;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::Level;
use tracing_subscriber::fmt::time::SystemTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

static LOGGING_INITIALIZED: AtomicBool = AtomicBool::new(false);

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level filter (trace, debug, info, warn, error)
    /// Can be overridden by RUST_LOG environment variable
    pub level: String,

    /// Output format (pretty or json)
    pub format: LogFormat,

    /// Optional path to a log file, written in addition to stderr
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file: None,
        }
    }
}

impl LogConfig {
    /// The configured level as a `tracing` level.
    pub fn level(&self) -> Result<Level, LogError> {
        self.level
            .trim()
            .parse::<Level>()
            .map_err(|_| LogError::InvalidLevel(self.level.clone()))
    }
}

/// Error type for logging initialization
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("logging already initialized")]
    AlreadyInitialized,

    #[error("invalid log level: {0}")]
    InvalidLevel(String),

    #[error("failed to create log file: {0}")]
    FileCreate(#[from] io::Error),

    #[error("failed to set global subscriber: {0}")]
    SetSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Open `path` for appending, creating missing parent directories as 0700
/// and a missing file as 0600 on unix.
fn open_log_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        let mut dirs = std::fs::DirBuilder::new();
        dirs.recursive(true);
        #[cfg(unix)]
        std::os::unix::fs::DirBuilderExt::mode(&mut dirs, 0o700);
        dirs.create(parent)?;
    }

    let mut options = std::fs::OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    std::os::unix::fs::OpenOptionsExt::mode(&mut options, 0o600);
    options.open(path)
}

/// Stderr layer in the configured format, plus a plain (or JSON) file layer.
fn output_layers(format: LogFormat, file: Option<File>) -> Vec<BoxedLayer> {
    let mut layers = Vec::with_capacity(2);
    match format {
        LogFormat::Pretty => {
            layers.push(
                fmt::layer()
                    .with_writer(io::stderr)
                    .with_target(true)
                    .with_ansi(true)
                    .boxed(),
            );
            if let Some(file) = file {
                layers.push(
                    fmt::layer()
                        .with_writer(Arc::new(file))
                        .with_target(true)
                        .with_ansi(false)
                        .boxed(),
                );
            }
        }
        LogFormat::Json => {
            layers.push(json_layer().with_writer(io::stderr).boxed());
            if let Some(file) = file {
                layers.push(json_layer().with_writer(Arc::new(file)).boxed());
            }
        }
    }
    layers
}

fn json_layer<S>() -> fmt::Layer<
    S,
    fmt::format::JsonFields,
    fmt::format::Format<fmt::format::Json, SystemTime>,
> {
    fmt::layer()
        .json()
        .with_timer(SystemTime)
        .with_target(true)
        .with_current_span(true)
        .with_span_list(false)
        .flatten_event(true)
}

/// Initialize the global logging subscriber
///
/// Subsequent calls return `Err(LogError::AlreadyInitialized)`. A rejected
/// config leaves logging uninitialized, so a corrected call may follow.
///
/// The `RUST_LOG` environment variable overrides the configured level,
/// e.g. `RUST_LOG=gpusched_core=trace`.
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    if LOGGING_INITIALIZED.load(Ordering::Acquire) {
        return Err(LogError::AlreadyInitialized);
    }

    let level = config.level()?;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_ascii_lowercase()));
    let file = config.file.as_deref().map(open_log_file).transpose()?;

    if LOGGING_INITIALIZED
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return Err(LogError::AlreadyInitialized);
    }

    let subscriber = tracing_subscriber::registry()
        .with(output_layers(config.format, file))
        .with(env_filter);
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        LOGGING_INITIALIZED.store(false, Ordering::Release);
        return Err(err.into());
    }

    tracing::info!(
        log_level = %level,
        log_format = %config.format,
        log_file = ?config.file,
        "Logging initialized"
    );
    Ok(())
}

/// Check if logging has been initialized
pub fn is_logging_initialized() -> bool {
    LOGGING_INITIALIZED.load(Ordering::Acquire)
}
