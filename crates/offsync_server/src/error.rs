//! Error types for the sync server.

use offsync_protocol::{EntityType, ProtocolError};
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the sync server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Invalid request format.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A payload or message failed to decode or validate.
    #[error(transparent)]
    Payload(#[from] ProtocolError),

    /// Authentication failed.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Unknown route.
    #[error("not found: {0}")]
    NotFound(String),

    /// No such entity.
    #[error("{entity_type} {local_id} not found")]
    EntityNotFound {
        /// Entity type.
        entity_type: EntityType,
        /// Local id.
        local_id: String,
    },

    /// The stored version moved between read and write.
    #[error("version mismatch for {local_id}: expected {expected:?}, found {actual:?}")]
    VersionMismatch {
        /// Local id.
        local_id: String,
        /// Version the writer based its change on.
        expected: Option<u64>,
        /// Version actually stored.
        actual: Option<u64>,
    },

    /// A unique key is already taken.
    #[error("duplicate {field}: {value}")]
    DuplicateKey {
        /// Key name.
        field: &'static str,
        /// Key value.
        value: String,
    },

    /// The entity is deleted.
    #[error("{entity_type} {local_id} is deleted")]
    Deleted {
        /// Entity type.
        entity_type: EntityType,
        /// Local id.
        local_id: String,
    },

    /// Entity storage failed.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// Returns true if this is a client error (4xx).
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status_code())
    }

    /// Returns true if this is a server error (5xx).
    pub fn is_server_error(&self) -> bool {
        self.status_code() >= 500
    }

    /// HTTP status for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            ServerError::InvalidRequest(_) | ServerError::Payload(_) => 400,
            ServerError::AuthenticationFailed(_) => 401,
            ServerError::NotFound(_) | ServerError::EntityNotFound { .. } => 404,
            ServerError::VersionMismatch { .. } | ServerError::DuplicateKey { .. } => 409,
            ServerError::Deleted { .. } => 410,
            ServerError::Persistence(_) | ServerError::Internal(_) => 500,
        }
    }

    /// Short machine-readable code for response bodies.
    pub fn code(&self) -> &'static str {
        match self {
            ServerError::InvalidRequest(_) => "invalid_request",
            ServerError::Payload(_) => "invalid_payload",
            ServerError::AuthenticationFailed(_) => "unauthorized",
            ServerError::NotFound(_) | ServerError::EntityNotFound { .. } => "not_found",
            ServerError::VersionMismatch { .. } => "version_mismatch",
            ServerError::DuplicateKey { .. } => "duplicate",
            ServerError::Deleted { .. } => "deleted",
            ServerError::Persistence(_) => "persistence",
            ServerError::Internal(_) => "internal",
        }
    }
}
