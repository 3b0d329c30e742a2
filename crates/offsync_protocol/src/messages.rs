//! Wire messages for the sync endpoints.
//!
//! | Endpoint | Request | Response |
//! |----------|---------|----------|
//! | `POST sync/batch` | `BatchRequest` | `BatchResponse` |
//! | `POST sync/bulk` | `BulkRequest` | `BulkResponse` |
//! | `GET sync/changes` | `ChangesRequest` (query) | `ChangesResponse` |
//! | `POST sync/resolve-conflict` | `ResolveRequest` | `ResolveResponse` |
//! | `GET sync/status` | none | `StatusResponse` |

use crate::conflict::{ConflictRecord, Resolution};
use crate::entity::{Entity, EntityType, Timestamp};
use crate::error::{ProtocolError, ProtocolResult};
use crate::mutation::Mutation;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;
use std::collections::BTreeMap;

/// Batch of mutations for one entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequest {
    /// Entity type of every mutation in the batch.
    pub entity_type: EntityType,
    /// Mutations, oldest first.
    pub operations: Vec<Mutation>,
}

impl BatchRequest {
    /// Creates a batch request.
    pub fn new(entity_type: EntityType, operations: Vec<Mutation>) -> Self {
        Self {
            entity_type,
            operations,
        }
    }
}

/// Classification of a failed item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemErrorKind {
    /// Payload rejected; needs caller correction.
    Validation,
    /// Server storage failed for this item.
    Persistence,
    /// Target entity is deleted; pushes are no longer accepted.
    Deleted,
}

impl ItemErrorKind {
    /// Returns true if resending the same mutation may succeed.
    pub fn retryable(&self) -> bool {
        matches!(self, ItemErrorKind::Persistence)
    }
}

/// A `created` or `updated` item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettledItem {
    /// Position in the request.
    pub index: usize,
    /// Client idempotency key.
    pub local_id: String,
    /// Server identifier.
    pub server_id: String,
    /// Server version after this item.
    pub version: u64,
    /// False when the item was a replay and nothing changed.
    #[serde(default = "default_applied")]
    pub applied: bool,
}

fn default_applied() -> bool {
    true
}

/// A `conflict` item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictItem {
    /// Position in the request.
    pub index: usize,
    /// Both sides of the conflict.
    pub conflict: ConflictRecord,
}

/// An `error` item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorItem {
    /// Position in the request.
    pub index: usize,
    /// Client idempotency key.
    pub local_id: String,
    /// Failure class.
    pub kind: ItemErrorKind,
    /// Underlying cause.
    pub error: String,
}

/// Per-item outcome of a batch, in a single ordered sequence.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    /// New entity created.
    Created(SettledItem),
    /// Existing entity updated, or a replay acknowledged.
    Updated(SettledItem),
    /// Version mismatch.
    Conflict(ConflictItem),
    /// Item failed.
    Error(ErrorItem),
}

impl ItemOutcome {
    /// Position in the request.
    pub fn index(&self) -> usize {
        match self {
            ItemOutcome::Created(i) | ItemOutcome::Updated(i) => i.index,
            ItemOutcome::Conflict(c) => c.index,
            ItemOutcome::Error(e) => e.index,
        }
    }

    /// Client idempotency key.
    pub fn local_id(&self) -> &str {
        match self {
            ItemOutcome::Created(i) | ItemOutcome::Updated(i) => &i.local_id,
            ItemOutcome::Conflict(c) => &c.conflict.local_id,
            ItemOutcome::Error(e) => &e.local_id,
        }
    }

    /// Returns true for `created` and `updated`.
    pub fn is_success(&self) -> bool {
        matches!(self, ItemOutcome::Created(_) | ItemOutcome::Updated(_))
    }
}

/// Aggregate counts for a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    /// Number of items.
    pub total: usize,
    /// Created plus updated.
    pub successful: usize,
    /// Conflicts.
    pub conflicts: usize,
    /// Errors.
    pub errors: usize,
}

/// Response to `POST sync/batch`.
///
/// Every request item appears in exactly one list; each list is in request
/// order and items carry their request `index`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResponse {
    /// Newly created entities.
    pub created: Vec<SettledItem>,
    /// Updated entities and acknowledged replays.
    pub updated: Vec<SettledItem>,
    /// Version conflicts.
    pub conflicts: Vec<ConflictItem>,
    /// Failed items.
    pub errors: Vec<ErrorItem>,
    /// Counts.
    pub summary: BatchSummary,
}

impl BatchResponse {
    /// Builds a response from outcomes in any order.
    pub fn from_outcomes(mut outcomes: Vec<ItemOutcome>) -> Self {
        outcomes.sort_by_key(ItemOutcome::index);
        let mut response = BatchResponse::default();
        for outcome in outcomes {
            match outcome {
                ItemOutcome::Created(i) => response.created.push(i),
                ItemOutcome::Updated(i) => response.updated.push(i),
                ItemOutcome::Conflict(c) => response.conflicts.push(c),
                ItemOutcome::Error(e) => response.errors.push(e),
            }
        }
        response.summary = BatchSummary {
            total: response.len(),
            successful: response.created.len() + response.updated.len(),
            conflicts: response.conflicts.len(),
            errors: response.errors.len(),
        };
        response
    }

    /// Flattens the lists back into one sequence ordered by request index.
    pub fn into_outcomes(self) -> Vec<ItemOutcome> {
        let mut outcomes: Vec<ItemOutcome> = self
            .created
            .into_iter()
            .map(ItemOutcome::Created)
            .chain(self.updated.into_iter().map(ItemOutcome::Updated))
            .chain(self.conflicts.into_iter().map(ItemOutcome::Conflict))
            .chain(self.errors.into_iter().map(ItemOutcome::Error))
            .collect();
        outcomes.sort_by_key(ItemOutcome::index);
        outcomes
    }

    /// Number of items across all lists.
    pub fn len(&self) -> usize {
        self.created.len() + self.updated.len() + self.conflicts.len() + self.errors.len()
    }

    /// Returns true if the response holds no items.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Query of `GET sync/changes`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangesRequest {
    /// Exclusive lower bound on `updatedAt`.
    pub since: Timestamp,
    /// Types to return.
    pub types: Vec<EntityType>,
    /// Per-type cap; the server default applies when absent.
    pub limit: Option<usize>,
}

impl ChangesRequest {
    /// Requests every type since `since`.
    pub fn since(since: Timestamp) -> Self {
        Self {
            since,
            types: EntityType::ALL.to_vec(),
            limit: None,
        }
    }

    /// Restricts the request to `types`.
    pub fn with_types(mut self, types: Vec<EntityType>) -> Self {
        self.types = types;
        self
    }

    /// Sets the per-type limit.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Encodes as a query string (without the leading `?`).
    pub fn to_query(&self) -> String {
        let types: Vec<&str> = self.types.iter().map(EntityType::plural).collect();
        let mut query = format!("since={}&types={}", self.since, types.join(","));
        if let Some(limit) = self.limit {
            query.push_str(&format!("&limit={limit}"));
        }
        query
    }

    /// Decodes a raw, still percent-encoded query string. Missing `since`
    /// means the beginning of time.
    pub fn from_query(query: &str) -> ProtocolResult<Self> {
        let mut request = ChangesRequest::since(0);
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let key = decode_component(key)?;
            let value = decode_component(value)?;
            match key.as_ref() {
                "since" => {
                    request.since = value.parse().map_err(|_| {
                        ProtocolError::InvalidQuery(format!("since must be an integer: {value}"))
                    })?;
                }
                "types" => request.types = EntityType::parse_list(&value)?,
                "limit" => {
                    let limit: usize = value.parse().map_err(|_| {
                        ProtocolError::InvalidQuery(format!("limit must be an integer: {value}"))
                    })?;
                    request.limit = Some(limit);
                }
                _ => {}
            }
        }
        Ok(request)
    }
}

fn decode_component(raw: &str) -> ProtocolResult<Cow<'_, str>> {
    urlencoding::decode(raw)
        .map_err(|_| ProtocolError::InvalidQuery(format!("invalid percent-encoding: {raw}")))
}

/// Response of `GET sync/changes`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangesResponse {
    /// Changed entities keyed by plural type name, ascending `updatedAt`.
    pub changes: BTreeMap<String, Vec<Entity>>,
    /// Server time at query execution.
    pub server_time: Timestamp,
    /// Cursor for the next pull.
    pub cursor: Timestamp,
    /// True when at least one type was truncated by the limit.
    #[serde(default)]
    pub has_more: bool,
}

impl ChangesResponse {
    /// Entities of one type.
    pub fn entities(&self, entity_type: EntityType) -> &[Entity] {
        self.changes
            .get(entity_type.plural())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Number of entities across all types.
    pub fn total(&self) -> usize {
        self.changes.values().map(Vec::len).sum()
    }
}

/// Body of `POST sync/resolve-conflict`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveRequest {
    /// Entity kind.
    pub entity_type: EntityType,
    /// Client idempotency key.
    pub local_id: String,
    /// Server identifier, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    /// Chosen resolution.
    pub resolution: Resolution,
    /// Client payload; required for `client` and `merge`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ResolveRequest {
    /// Builds the request settling `record` with `resolution`.
    pub fn for_conflict(record: &ConflictRecord, resolution: Resolution) -> ProtocolResult<Self> {
        let data = match resolution {
            Resolution::Server => None,
            Resolution::Client | Resolution::Merge => Some(record.client_payload.to_value()?),
        };
        Ok(Self {
            entity_type: record.entity_type,
            local_id: record.local_id.clone(),
            server_id: Some(record.server_id.clone()),
            resolution,
            data,
        })
    }
}

/// Response of `POST sync/resolve-conflict`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveResponse {
    /// Applied resolution.
    pub resolution: Resolution,
    /// Settled entity.
    pub entity: Entity,
}

/// Body of `POST sync/bulk`: mutations for several types at once.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkRequest {
    /// Post mutations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub posts: Option<Vec<Mutation>>,
    /// Group mutations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub groups: Option<Vec<Mutation>>,
    /// User mutations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub users: Option<Vec<Mutation>>,
}

impl BulkRequest {
    /// Non-empty mutation lists with their entity type.
    pub fn sections(&self) -> Vec<(EntityType, &[Mutation])> {
        [
            (EntityType::Post, &self.posts),
            (EntityType::Group, &self.groups),
            (EntityType::User, &self.users),
        ]
        .into_iter()
        .filter_map(|(ty, ops)| ops.as_deref().map(|ops| (ty, ops)))
        .collect()
    }
}

/// Per-type counts of a bulk push.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkSummary {
    /// Created count.
    pub created: usize,
    /// Updated count.
    pub updated: usize,
    /// Conflict count.
    pub conflicts: usize,
    /// Error count.
    pub errors: usize,
}

impl From<&BatchResponse> for BulkSummary {
    fn from(response: &BatchResponse) -> Self {
        Self {
            created: response.created.len(),
            updated: response.updated.len(),
            conflicts: response.conflicts.len(),
            errors: response.errors.len(),
        }
    }
}

/// Response of `POST sync/bulk`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkResponse {
    /// Counts keyed by plural type name.
    pub results: BTreeMap<String, BulkSummary>,
    /// Server time after processing.
    pub server_time: Timestamp,
}

/// Response of `GET sync/status`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    /// Service state, `ok` when healthy.
    pub status: String,
    /// Current server time.
    pub server_time: Timestamp,
    /// Last bulk sync recorded for the calling principal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<Timestamp>,
    /// Live entity counts keyed by plural type name.
    pub entity_counts: BTreeMap<String, usize>,
}
