//! Custom error types for the recorder.
//!
//! This module defines the primary error type, `DaqError`, for the whole crate.
//! Using the `thiserror` crate, it gives one consistent place to describe what can
//! go wrong between a hardware source and the file on disk.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from `figment`, typically parse or type errors in the
//!   configuration file or environment overrides.
//! - **`Configuration`**: Semantic configuration errors (zero channel count, zero
//!   rotation threshold, bad delimiter). These are raised at registration or
//!   validation time, never in the middle of a run.
//! - **`Io`**: Wraps `std::io::Error`. Per-block write failures inside a drain thread
//!   are *not* surfaced through this variant; they are counted and logged instead.
//! - **`CounterRegressed`** / **`MalformedBlock`**: Integration errors raised when a
//!   source breaks its contract. They are fatal for the affected channel only.
//! - **`Source`**: A source collaborator failed to start or stop.
//! - **`WriterState`**, **`InvalidState`**, **`QueueFull`**: Lifecycle misuse of a
//!   writer or the coordinator, and bounded-queue rejections.
//!
//! By using `#[from]`, `DaqError` can be created from the underlying error types,
//! so the `?` operator works throughout the crate.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Primary error type for the recorder.
#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Source '{channel}' counter went backwards ({previous} -> {current})")]
    CounterRegressed {
        channel: String,
        previous: u64,
        current: u64,
    },

    #[error("Source '{channel}' produced a block of {len} samples, not a non-empty multiple of {channel_count} channels")]
    MalformedBlock {
        channel: String,
        len: usize,
        channel_count: usize,
    },

    #[error("Source error: {0}")]
    Source(String),

    #[error("Writer error: {0}")]
    WriterState(String),

    #[error("Write queue for '{channel}' is full")]
    QueueFull { channel: String },

    #[error("Invalid coordinator state: {0}")]
    InvalidState(String),

    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<DaqError>),
}

impl DaqError {
    /// Whether this error means the source broke its contract.
    ///
    /// Integration errors terminate the affected channel but never the
    /// rest of the pipeline.
    pub fn is_integration_error(&self) -> bool {
        matches!(
            self,
            DaqError::CounterRegressed { .. } | DaqError::MalformedBlock { .. }
        )
    }

    /// Flattens a `ShutdownFailed` into one readable line.
    pub fn summary(&self) -> String {
        match self {
            DaqError::ShutdownFailed(errors) => {
                let combined = errors
                    .iter()
                    .map(|err| err.to_string())
                    .collect::<Vec<_>>()
                    .join("; ");
                format!("Shutdown failed: {combined}")
            }
            other => other.to_string(),
        }
    }
}
