//! Error types for protocol decoding and payload validation.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while decoding or validating protocol values.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// JSON encoding or decoding failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A payload was rejected by validation.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A payload of one entity type was used where another was expected.
    #[error("payload type mismatch: expected {expected}, got {actual}")]
    PayloadTypeMismatch {
        /// Expected entity type.
        expected: String,
        /// Actual entity type.
        actual: String,
    },

    /// Unknown entity type name.
    #[error("unknown entity type: {0}")]
    UnknownEntityType(String),

    /// Unknown resolution name.
    #[error("unknown resolution: {0}")]
    UnknownResolution(String),

    /// Malformed query string.
    #[error("invalid query: {0}")]
    InvalidQuery(String),
}

impl ProtocolError {
    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Returns true if the error was caused by caller-supplied data.
    ///
    /// Such errors are never fixed by retrying the same input.
    pub fn is_caller_fault(&self) -> bool {
        !matches!(self, ProtocolError::Json(e) if e.is_io())
    }
}
