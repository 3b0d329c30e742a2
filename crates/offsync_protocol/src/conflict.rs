//! Conflict records and resolutions.

use crate::entity::EntityType;
use crate::error::ProtocolError;
use crate::payload::Payload;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A mutation rejected because the client's version was behind the server's.
///
/// Transient: it lives until an operator or policy picks a `Resolution`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "RawConflictRecord")]
pub struct ConflictRecord {
    /// Entity kind.
    pub entity_type: EntityType,
    /// Client idempotency key.
    pub local_id: String,
    /// Server identifier of the contested entity.
    pub server_id: String,
    /// Version the client based its change on.
    pub client_version: u64,
    /// Current server version.
    pub server_version: u64,
    /// Fields the client tried to write.
    pub client_payload: Payload,
    /// Fields currently held by the server.
    pub server_payload: Payload,
}

impl ConflictRecord {
    /// Number of server revisions the client missed.
    pub fn version_gap(&self) -> u64 {
        self.server_version.saturating_sub(self.client_version)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawConflictRecord {
    entity_type: EntityType,
    local_id: String,
    server_id: String,
    client_version: u64,
    server_version: u64,
    #[serde(default)]
    client_payload: serde_json::Value,
    #[serde(default)]
    server_payload: serde_json::Value,
}

impl TryFrom<RawConflictRecord> for ConflictRecord {
    type Error = ProtocolError;

    fn try_from(raw: RawConflictRecord) -> Result<Self, Self::Error> {
        Ok(Self {
            entity_type: raw.entity_type,
            client_payload: Payload::from_value(raw.entity_type, raw.client_payload)?,
            server_payload: Payload::from_value(raw.entity_type, raw.server_payload)?,
            local_id: raw.local_id,
            server_id: raw.server_id,
            client_version: raw.client_version,
            server_version: raw.server_version,
        })
    }
}

/// Operator-chosen outcome for a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    /// Client payload replaces the server payload; version bumps.
    Client,
    /// Server payload is kept; no version bump.
    Server,
    /// Field-level merge; version bumps.
    Merge,
}

impl Resolution {
    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Client => "client",
            Resolution::Server => "server",
            Resolution::Merge => "merge",
        }
    }

    /// Returns true if settling with this resolution writes new data.
    pub fn bumps_version(&self) -> bool {
        !matches!(self, Resolution::Server)
    }
}

impl FromStr for Resolution {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "client" => Ok(Resolution::Client),
            "server" => Ok(Resolution::Server),
            "merge" => Ok(Resolution::Merge),
            other => Err(ProtocolError::UnknownResolution(other.to_string())),
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
