//! Engine error model.
//!
//! - [`StorageError`]: infrastructure failures from a storage backend
//! - [`ProcessingFailure`]: why a single processing attempt failed (fed to retry policy)
//! - [`EngineError`]: what `start()` can surface to the caller
//!
//! Per-object errors never escape the engine; only setup errors do.

use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;

/// Storage operation error.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("object already exists: {0}")]
    AlreadyExists(String),

    /// External mutation attempted while an engine holds the object.
    #[error("object is locked: {0}")]
    Locked(String),

    /// The caller no longer owns the lock it tries to finalize under.
    #[error("lock lost for object {id}: {reason}")]
    LockLost { id: String, reason: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    pub fn lock_lost(id: impl ToString, reason: impl Into<String>) -> Self {
        Self::LockLost {
            id: id.to_string(),
            reason: reason.into(),
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Cause of a failed processing attempt.
#[derive(Debug, Error)]
pub enum ProcessingFailure {
    /// `process()` returned an error.
    #[error("{0:#}")]
    Error(#[from] anyhow::Error),

    /// `process()` did not return within the processing timeout.
    #[error("processing timed out after {0:?}")]
    Timeout(Duration),

    #[error("processing panicked: {0}")]
    Panicked(String),

    /// The processor asked to advance but declared no success transition.
    #[error("no success transition declared from status {0}")]
    MissingTransition(String),

    /// A claim kept chaining PROCESSING-phase steps past the configured bound.
    #[error("exceeded {0} chained processing steps within one claim")]
    TooManySteps(u32),

    /// `process()` itself moved the object to a FAILED-phase status.
    #[error("processor rejected the object with status {0}")]
    Rejected(String),
}

impl ProcessingFailure {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProcessingFailure::Timeout(_))
    }
}

/// Unrecoverable setup error surfaced by `start()`.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("storage unavailable: {0}")]
    Storage(#[from] StorageError),

    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
}
