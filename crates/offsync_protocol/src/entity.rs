//! Entities and their sync metadata.

use crate::error::{ProtocolError, ProtocolResult};
use crate::payload::Payload;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;

/// Returns the current wall-clock time in milliseconds.
pub fn now_millis() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as Timestamp)
        .unwrap_or(0)
}

/// Kind of entity carried by the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    /// A post.
    Post,
    /// A group.
    Group,
    /// A user profile.
    User,
}

impl EntityType {
    /// All entity types, in feed order.
    pub const ALL: [EntityType; 3] = [EntityType::Post, EntityType::Group, EntityType::User];

    /// Singular wire name (`post`).
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Post => "post",
            EntityType::Group => "group",
            EntityType::User => "user",
        }
    }

    /// Plural collection name used by the change feed (`posts`).
    pub fn plural(&self) -> &'static str {
        match self {
            EntityType::Post => "posts",
            EntityType::Group => "groups",
            EntityType::User => "users",
        }
    }

    /// Parses a comma separated list of type names.
    ///
    /// Empty input yields every type. Duplicates are dropped.
    pub fn parse_list(input: &str) -> ProtocolResult<Vec<EntityType>> {
        let mut types = Vec::new();
        for part in input.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let ty: EntityType = part.parse()?;
            if !types.contains(&ty) {
                types.push(ty);
            }
        }
        if types.is_empty() {
            types.extend(EntityType::ALL);
        }
        Ok(types)
    }
}

impl FromStr for EntityType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "post" | "posts" => Ok(EntityType::Post),
            "group" | "groups" => Ok(EntityType::Group),
            "user" | "users" => Ok(EntityType::User),
            other => Err(ProtocolError::UnknownEntityType(other.to_string())),
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sync status of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// In agreement with the server of record.
    Synced,
    /// Has local changes not yet accepted by the server.
    Pending,
    /// Rejected on a version mismatch; awaits resolution.
    Conflict,
    /// Terminal; no further pushes are accepted.
    Deleted,
}

impl SyncStatus {
    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Synced => "synced",
            SyncStatus::Pending => "pending",
            SyncStatus::Conflict => "conflict",
            SyncStatus::Deleted => "deleted",
        }
    }

    /// Returns true for the terminal `deleted` status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncStatus::Deleted)
    }
}

impl FromStr for SyncStatus {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "synced" => Ok(SyncStatus::Synced),
            "pending" => Ok(SyncStatus::Pending),
            "conflict" => Ok(SyncStatus::Conflict),
            "deleted" => Ok(SyncStatus::Deleted),
            other => Err(ProtocolError::validation(format!(
                "unknown sync status: {other}"
            ))),
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A post, group or user record with its sync metadata.
///
/// The payload is always of the variant matching `entity_type`; decoding
/// rejects a mismatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "RawEntity")]
pub struct Entity {
    /// Entity kind.
    pub entity_type: EntityType,
    /// Client-assigned idempotency key.
    pub local_id: String,
    /// Server-assigned identifier, absent until the first accepted create.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    /// Optimistic-concurrency counter. Zero means never accepted by a server.
    pub version: u64,
    /// Sync status.
    pub sync_status: SyncStatus,
    /// Last-mutation time in milliseconds; the change feed cursor field.
    pub updated_at: Timestamp,
    /// Domain fields.
    pub payload: Payload,
}

impl Entity {
    /// Creates a new entity with no server identity.
    pub fn new(local_id: impl Into<String>, payload: Payload) -> Self {
        Self {
            entity_type: payload.entity_type(),
            local_id: local_id.into(),
            server_id: None,
            version: 0,
            sync_status: SyncStatus::Pending,
            updated_at: 0,
            payload,
        }
    }

    /// Sets the server identifier.
    pub fn with_server_id(mut self, server_id: impl Into<String>) -> Self {
        self.server_id = Some(server_id.into());
        self
    }

    /// Sets the version.
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Sets the sync status.
    pub fn with_status(mut self, status: SyncStatus) -> Self {
        self.sync_status = status;
        self
    }

    /// Sets the update timestamp.
    pub fn with_updated_at(mut self, updated_at: Timestamp) -> Self {
        self.updated_at = updated_at;
        self
    }

    /// Returns true once a server has assigned an identity.
    pub fn is_known_to_server(&self) -> bool {
        self.server_id.is_some()
    }

    /// Returns true if this copy is a strictly newer revision than `other`.
    ///
    /// Versions decide first; on equal versions the later `updated_at` wins.
    pub fn supersedes(&self, other: &Entity) -> bool {
        self.version > other.version
            || (self.version == other.version && self.updated_at > other.updated_at)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEntity {
    entity_type: EntityType,
    local_id: String,
    #[serde(default)]
    server_id: Option<String>,
    version: u64,
    sync_status: SyncStatus,
    updated_at: Timestamp,
    #[serde(default)]
    payload: serde_json::Value,
}

impl TryFrom<RawEntity> for Entity {
    type Error = ProtocolError;

    fn try_from(raw: RawEntity) -> Result<Self, Self::Error> {
        let payload = Payload::from_value(raw.entity_type, raw.payload)?;
        Ok(Self {
            entity_type: raw.entity_type,
            local_id: raw.local_id,
            server_id: raw.server_id,
            version: raw.version,
            sync_status: raw.sync_status,
            updated_at: raw.updated_at,
            payload,
        })
    }
}
