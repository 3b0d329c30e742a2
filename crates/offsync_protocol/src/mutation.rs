//! Mutations pushed from a client to the reconciler.

use crate::entity::EntityType;
use crate::error::{ProtocolError, ProtocolResult};
use crate::payload::Payload;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Kind of mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Entity creation.
    Create,
    /// Entity update.
    Update,
}

impl Operation {
    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
        }
    }
}

impl FromStr for Operation {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Operation::Create),
            "update" => Ok(Operation::Update),
            other => Err(ProtocolError::validation(format!(
                "unknown operation: {other}"
            ))),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single mutation as it travels in a batch.
///
/// The payload stays raw JSON on the wire so that a malformed payload is
/// reported as an item-level error instead of failing the whole batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mutation {
    /// Client idempotency key of the target entity.
    pub local_id: String,
    /// Create or update.
    pub operation: Operation,
    /// Last version of the entity the client knew about.
    #[serde(default)]
    pub client_version: u64,
    /// Unique id of this mutation, used to recognise exact replays.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mutation_id: Option<String>,
    /// Domain fields.
    #[serde(default)]
    pub payload: Value,
}

impl Mutation {
    /// Creates a `create` mutation.
    pub fn create(local_id: impl Into<String>, payload: &Payload) -> ProtocolResult<Self> {
        Ok(Self {
            local_id: local_id.into(),
            operation: Operation::Create,
            client_version: 0,
            mutation_id: None,
            payload: payload.to_value()?,
        })
    }

    /// Creates an `update` mutation against `client_version`.
    pub fn update(
        local_id: impl Into<String>,
        client_version: u64,
        payload: &Payload,
    ) -> ProtocolResult<Self> {
        Ok(Self {
            local_id: local_id.into(),
            operation: Operation::Update,
            client_version,
            mutation_id: None,
            payload: payload.to_value()?,
        })
    }

    /// Sets the mutation id.
    pub fn with_mutation_id(mut self, id: impl Into<String>) -> Self {
        self.mutation_id = Some(id.into());
        self
    }

    /// Decodes the payload as `entity_type`.
    pub fn typed_payload(&self, entity_type: EntityType) -> ProtocolResult<Payload> {
        Payload::from_value(entity_type, self.payload.clone())
    }
}
