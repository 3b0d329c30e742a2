//! Change feed for incremental pulls.
//!
//! The cursor of a complete page is a server clock stamp issued atomically
//! with the read, so a write that commits while the response is in flight is
//! stamped above it and shows up on the next pull. A truncated page instead
//! ends at the last `updatedAt` it delivered for the earliest truncated type.

use crate::error::ServerResult;
use crate::repository::EntityRepository;
use offsync_protocol::{ChangesRequest, ChangesResponse, EntityType, Timestamp};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Serves `GET sync/changes`.
pub struct ChangeFeed {
    repository: Arc<dyn EntityRepository>,
}

impl ChangeFeed {
    /// Creates a feed over a repository.
    pub fn new(repository: Arc<dyn EntityRepository>) -> Self {
        Self { repository }
    }

    /// Entities of `types` changed after `since`, at most `limit` per type.
    pub fn pull(
        &self,
        since: Timestamp,
        types: &[EntityType],
        limit: usize,
    ) -> ServerResult<ChangesResponse> {
        let types: Vec<EntityType> = if types.is_empty() {
            EntityType::ALL.to_vec()
        } else {
            types.to_vec()
        };
        let set = self.repository.changed_since(&types, since, limit.max(1))?;

        let mut changes = BTreeMap::new();
        let mut boundary: Option<Timestamp> = None;
        for (entity_type, page) in set.changes {
            if page.truncated {
                if let Some(last) = page.entities.last() {
                    boundary = Some(boundary.map_or(last.updated_at, |b| b.min(last.updated_at)));
                }
            }
            let visible = page
                .entities
                .into_iter()
                .filter(|e| e.payload.is_visible())
                .map(|mut e| {
                    e.payload.redact_private();
                    e
                })
                .collect();
            changes.insert(entity_type.plural().to_string(), visible);
        }

        let response = ChangesResponse {
            changes,
            server_time: self.repository.server_time(),
            cursor: boundary.unwrap_or(set.cursor),
            has_more: boundary.is_some(),
        };
        debug!(
            since,
            cursor = response.cursor,
            total = response.total(),
            has_more = response.has_more,
            "changes served"
        );
        Ok(response)
    }

    /// Serves a decoded request, clamping its limit with `clamp`.
    pub fn serve(
        &self,
        request: &ChangesRequest,
        clamp: impl Fn(Option<usize>) -> usize,
    ) -> ServerResult<ChangesResponse> {
        self.pull(request.since, &request.types, clamp(request.limit))
    }
}
