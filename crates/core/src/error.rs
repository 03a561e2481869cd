//! Core error model.

use thiserror::Error;

/// Result type used across the core crate.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised while building or parsing core values.
///
/// Keep this focused on deterministic input failures. Storage and processing
/// failures belong to the engine crate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A persisted status code does not belong to the status enum.
    #[error("unknown status code '{code}' for {status_type}")]
    UnknownStatus {
        status_type: &'static str,
        code: String,
    },

    /// A lock owner name was empty or malformed.
    #[error("invalid lock owner: {0}")]
    InvalidLockOwner(String),
}

impl CoreError {
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn unknown_status(status_type: &'static str, code: impl Into<String>) -> Self {
        Self::UnknownStatus {
            status_type,
            code: code.into(),
        }
    }
}
