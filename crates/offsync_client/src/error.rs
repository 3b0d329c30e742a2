//! Error types for the sync client and its local storage.

use offsync_protocol::{EntityType, ProtocolError};
use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors raised by storage backends and the record journal.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A journal record failed its checksum.
    #[error("checksum mismatch at offset {offset}: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Offset of the record.
        offset: u64,
        /// Stored checksum.
        expected: u32,
        /// Computed checksum.
        actual: u32,
    },

    /// The journal is structurally corrupted.
    #[error("journal corrupted: {0}")]
    Corrupted(String),

    /// A record could not be encoded or decoded.
    #[error("record codec error: {0}")]
    Codec(String),

    /// The store has been closed.
    #[error("store is closed")]
    Closed,
}

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The server sent something this client cannot interpret.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A payload or message failed to decode or validate.
    #[error(transparent)]
    Payload(#[from] ProtocolError),

    /// Authentication failed.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Server rejected the request with a server-side failure.
    #[error("server error: {0}")]
    ServerError(String),

    /// Local storage failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// The entity awaits conflict resolution and accepts no local writes.
    #[error("{entity_type} {local_id} is in conflict")]
    EntityInConflict {
        /// Entity type.
        entity_type: EntityType,
        /// Local id.
        local_id: String,
    },

    /// The entity is deleted and accepts no further writes.
    #[error("{entity_type} {local_id} is deleted")]
    EntityDeleted {
        /// Entity type.
        entity_type: EntityType,
        /// Local id.
        local_id: String,
    },

    /// No such entity in the local store.
    #[error("{entity_type} {local_id} not found")]
    EntityNotFound {
        /// Entity type.
        entity_type: EntityType,
        /// Local id.
        local_id: String,
    },

    /// No such queue entry.
    #[error("queue entry {0} not found")]
    QueueEntryNotFound(u64),

    /// Sync was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// Timeout.
    #[error("operation timed out")]
    Timeout,

    /// Not connected.
    #[error("not connected to server")]
    NotConnected,
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout => true,
            SyncError::ServerError(_) => true,
            _ => false,
        }
    }

    /// Returns true if the batch never produced a usable response.
    ///
    /// Entries sent in such a batch have their retry counters bumped.
    pub fn is_batch_failure(&self) -> bool {
        matches!(
            self,
            SyncError::Transport { .. }
                | SyncError::Timeout
                | SyncError::ServerError(_)
                | SyncError::Protocol(_)
                | SyncError::AuthenticationFailed(_)
                | SyncError::NotConnected
        )
    }
}
