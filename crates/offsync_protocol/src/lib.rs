//! # offsync Protocol
//!
//! Sync protocol types for the offsync offline-first subsystem.
//!
//! This crate provides:
//! - `Entity` with its sync metadata (`localId`, `serverId`, `version`, status)
//! - Typed payload envelopes for posts, groups and users, each with an
//!   extension map for fields this version does not know about
//! - The per-type field merge policy used by conflict resolution
//! - Mutations, batch/changes/resolve/bulk/status wire messages
//! - `ConflictRecord` and `Resolution`
//! - HTTP-shaped request/response values shared by client and server
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod conflict;
mod entity;
mod error;
mod http;
mod messages;
mod mutation;
mod payload;

pub use conflict::{ConflictRecord, Resolution};
pub use entity::{now_millis, Entity, EntityType, SyncStatus, Timestamp};
pub use error::{ProtocolError, ProtocolResult};
pub use http::{HttpMethod, HttpRequest, HttpResponse};
pub use messages::{
    BatchRequest, BatchResponse, BatchSummary, BulkRequest, BulkResponse, BulkSummary,
    ChangesRequest, ChangesResponse, ConflictItem, ErrorItem, ItemErrorKind, ItemOutcome,
    ResolveRequest, ResolveResponse, SettledItem, StatusResponse,
};
pub use mutation::{Mutation, Operation};
pub use payload::{
    GroupFields, GroupKind, GroupPrivacy, MediaAttachment, MediaKind, Payload, PostFields,
    PostKind, UserFields, Visibility, MAX_GROUP_NAME, MAX_POST_CONTENT, USERNAME_LEN,
};

/// Protocol version spoken by this crate.
pub const PROTOCOL_VERSION: u16 = 1;
