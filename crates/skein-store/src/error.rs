//! Store error type.

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// Errors surfaced by an [`AtomicStore`](crate::AtomicStore).
#[derive(Debug, Error, Clone, PartialEq, Serialize, Deserialize)]
pub enum StoreError {
    /// The store could not be reached or refused the request.
    #[error("store unavailable: {reason}")]
    Unavailable { reason: String },

    /// Operation against a key holding the wrong kind of value.
    #[error("key '{key}' holds a value of the wrong type")]
    WrongType { key: String },

    /// Increment applied to a value that is not an integer.
    #[error("value at key '{key}' is not an integer")]
    NotInteger { key: String },

    /// An atomic script aborted.
    #[error("script '{script}' failed: {reason}")]
    ScriptFailed { script: String, reason: String },

    /// A command produced a response of an unexpected shape.
    #[error("unexpected response to {command}: {response}")]
    UnexpectedResponse { command: String, response: String },

    /// Any other failure.
    #[error("operation failed: {reason}")]
    Failed { reason: String },
}

impl StoreError {
    /// True for failures that may succeed if the caller simply tries again.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable { .. })
    }
}
