//! Error types for the Pixpress compression pipeline.
//!
//! Errors are organized by concern so callers can decide what to retry:
//! per-file stage failures feed the persistent retry state, persistence
//! failures are surfaced to operators, and queue errors drive ack/nack.

use std::path::PathBuf;
use thiserror::Error;

use crate::types::{FileId, FileStatus};

/// Top-level error type for Pixpress operations.
#[derive(Error, Debug)]
pub enum PixpressError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Per-file pipeline errors
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// Task persistence errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Broker and consumer errors
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// General I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Configuration-specific errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to read the config file from disk
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    /// Failed to parse TOML configuration
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Configuration values are invalid
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Broad failure classes used for logging and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Open/create/copy failures in the read or write stage
    TransientIo,
    /// Decode/resize/encode failures
    Codec,
    /// The run was cancelled before the task finished
    Cancelled,
}

/// Pipeline processing errors, organized by stage.
#[derive(Error, Debug, Clone)]
pub enum PipelineError {
    /// Opening or reading the source failed
    #[error("Read error for {path}: {message}")]
    Read { path: PathBuf, message: String },

    /// Creating or writing the destination failed
    #[error("Write error for {path}: {message}")]
    Write { path: PathBuf, message: String },

    /// Image decoding failed
    #[error("Decode error for {path}: {message}")]
    Decode { path: PathBuf, message: String },

    /// Image encoding failed
    #[error("Encode error for {path}: {message}")]
    Encode { path: PathBuf, message: String },

    /// A blocking codec task panicked or was aborted
    #[error("Transcode task failed for {path}: {message}")]
    Join { path: PathBuf, message: String },

    /// The run was cancelled before this file finished
    #[error("Cancelled before {path} finished")]
    Cancelled { path: PathBuf },
}

impl PipelineError {
    /// Classify the error into its failure class.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Read { .. } | PipelineError::Write { .. } => ErrorKind::TransientIo,
            PipelineError::Decode { .. }
            | PipelineError::Encode { .. }
            | PipelineError::Join { .. } => ErrorKind::Codec,
            PipelineError::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }

    /// Path of the file the error refers to.
    pub fn path(&self) -> &PathBuf {
        match self {
            PipelineError::Read { path, .. }
            | PipelineError::Write { path, .. }
            | PipelineError::Decode { path, .. }
            | PipelineError::Encode { path, .. }
            | PipelineError::Join { path, .. }
            | PipelineError::Cancelled { path } => path,
        }
    }
}

/// Task persistence errors.
#[derive(Error, Debug)]
pub enum StoreError {
    /// No row with this id
    #[error("File task not found: {0}")]
    NotFound(FileId),

    /// The requested status change is not in the transition table
    #[error("Invalid status transition for file {id}: {from} -> {to}")]
    InvalidTransition {
        id: FileId,
        from: FileStatus,
        to: FileStatus,
    },

    /// Underlying database failure
    #[error("Database error: {0}")]
    Database(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Broker, consumer, and batch handler errors.
#[derive(Error, Debug)]
pub enum QueueError {
    /// Queue was never declared
    #[error("Unknown queue: {0}")]
    UnknownQueue(String),

    /// Ack/nack for a delivery the broker is not tracking
    #[error("Unknown delivery tag {tag} on queue {queue}")]
    UnknownDelivery { queue: String, tag: u64 },

    /// The broker connection or delivery stream is closed
    #[error("Broker channel closed")]
    Closed,

    /// Payload could not be parsed as a compression message
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Handler failed as a whole (transport or database level)
    #[error("Batch handler failed: {0}")]
    Handler(String),

    /// Handler returned results that cannot be attributed to the batch
    #[error("Handler returned {returned} results for {submitted} submitted ids")]
    ResultMismatch { submitted: usize, returned: usize },
}

/// Convenience type alias for Pixpress results.
pub type Result<T> = std::result::Result<T, PixpressError>;

/// Convenience type alias for pipeline-specific results.
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_error_kinds() {
        let read = PipelineError::Read {
            path: PathBuf::from("a.png"),
            message: "no such file".to_string(),
        };
        let decode = PipelineError::Decode {
            path: PathBuf::from("a.png"),
            message: "bad header".to_string(),
        };
        let cancelled = PipelineError::Cancelled {
            path: PathBuf::from("a.png"),
        };
        assert_eq!(read.kind(), ErrorKind::TransientIo);
        assert_eq!(decode.kind(), ErrorKind::Codec);
        assert_eq!(cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(read.path(), &PathBuf::from("a.png"));
    }

    #[test]
    fn test_invalid_transition_message() {
        let err = StoreError::InvalidTransition {
            id: 7,
            from: FileStatus::Compressed,
            to: FileStatus::Processing,
        };
        assert_eq!(
            err.to_string(),
            "Invalid status transition for file 7: compressed -> processing"
        );
    }
}
