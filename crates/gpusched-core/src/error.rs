//! Error types for gpusched-core

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::logging::LogError;

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for gpusched-core
///
/// These are the failures an *owner* of a scheduler can see. Failures that
/// happen while draining the ring buffer are never returned; they are latched
/// on the command buffer's error slot as a [`CommandError`].
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Logging initialization errors
    #[error("Logging error: {0}")]
    Logging(#[from] LogError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// No transfer buffer is registered under this id
    #[error("Unknown transfer buffer: {0}")]
    UnknownTransferBuffer(i32),

    /// The requested consumer offset lies outside the bound ring buffer
    #[error("Get offset {offset} is outside the ring buffer ({entry_count} entries)")]
    InvalidGetOffset { offset: i32, entry_count: i32 },

    /// An offset operation was attempted before any ring buffer was bound
    #[error("No ring buffer is bound")]
    NoRingBuffer,
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("Failed to parse config: {0}")]
    ParseFailed(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Error codes latched on a command buffer's error slot.
///
/// Once any of these is latched the buffer is dead: the scheduler processes
/// no further commands from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Error)]
#[serde(rename_all = "snake_case")]
pub enum CommandError {
    /// A command header declared a size of zero entries.
    #[error("zero-sized command")]
    InvalidSize,
    /// A command extends past the end of the ring buffer.
    #[error("command runs past the end of the ring buffer")]
    OutOfBounds,
    /// The decoder does not know this command id.
    #[error("unknown command")]
    UnknownCommand,
    /// The command's arguments were rejected by the decoder.
    #[error("invalid arguments")]
    InvalidArguments,
    /// The underlying GPU context is gone.
    #[error("context lost")]
    LostContext,
    /// Any other decoder failure.
    #[error("generic error")]
    GenericError,
}

/// Why a context was lost, propagated to the producer side for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextLostReason {
    /// This context caused the loss.
    Guilty,
    /// Another context caused the loss.
    Innocent,
    /// Cause could not be determined.
    #[default]
    Unknown,
}

impl std::fmt::Display for ContextLostReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Guilty => write!(f, "guilty"),
            Self::Innocent => write!(f, "innocent"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}
