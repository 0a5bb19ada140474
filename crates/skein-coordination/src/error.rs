//! Error types for coordination primitives.

use skein_store::StoreError;
use snafu::Snafu;

/// Errors from coordination primitives.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CoordinationError {
    /// Underlying storage error.
    #[snafu(display("storage error: {source}"))]
    Storage {
        /// The underlying error.
        source: StoreError,
    },

    /// JSON serialization/deserialization error.
    #[snafu(display("serialization error: {source}"))]
    Serialization {
        /// The underlying error.
        source: serde_json::Error,
    },

    /// Data in storage is corrupted or unparseable.
    #[snafu(display("corrupted data in key '{key}': {reason}"))]
    CorruptedData {
        /// The key with corrupted data.
        key: String,
        /// Description of what went wrong.
        reason: String,
    },

    /// A queue message could not be built or decoded.
    #[snafu(display("invalid queue message: {reason}"))]
    InvalidMessage { reason: String },

    /// A store script returned a value of the wrong shape.
    #[snafu(display("unexpected result from script '{script}': {reason}"))]
    UnexpectedScriptResult { script: String, reason: String },

    /// A poll loop is already running for this channel in this consumer.
    #[snafu(display("consumer already running for channel '{channel}'"))]
    AlreadyRunning { channel: String },
}

impl CoordinationError {
    /// True if retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Storage { source } if source.is_transient())
    }
}

impl From<StoreError> for CoordinationError {
    fn from(source: StoreError) -> Self {
        CoordinationError::Storage { source }
    }
}

impl From<serde_json::Error> for CoordinationError {
    fn from(source: serde_json::Error) -> Self {
        CoordinationError::Serialization { source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_unavailable_store_is_transient() {
        let offline: CoordinationError = StoreError::Unavailable {
            reason: "down".into(),
        }
        .into();
        assert!(offline.is_transient());

        let wrong: CoordinationError = StoreError::WrongType { key: "k".into() }.into();
        assert!(!wrong.is_transient());
        assert!(wrong.to_string().contains("storage error"));
    }
}
