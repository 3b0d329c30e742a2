//! Conflict resolver.
//!
//! Settles a conflicted entity with an explicit resolution. `client` and
//! `merge` write a new payload and bump the version from the current server
//! version; `server` keeps the stored entity untouched.

use crate::error::{ServerError, ServerResult};
use crate::repository::{EntityRepository, StoredEntity};
use offsync_protocol::{Operation, Payload, Resolution, ResolveRequest, ResolveResponse};
use std::sync::Arc;
use tracing::{debug, info};

const MAX_ATTEMPTS: usize = 3;

/// Serves `POST sync/resolve-conflict`.
pub struct ConflictResolver {
    repository: Arc<dyn EntityRepository>,
}

impl ConflictResolver {
    /// Creates a resolver over a repository.
    pub fn new(repository: Arc<dyn EntityRepository>) -> Self {
        Self { repository }
    }

    /// Applies `request.resolution` and returns the settled entity.
    pub fn resolve(&self, request: &ResolveRequest) -> ServerResult<ResolveResponse> {
        let client_payload = match (request.resolution, &request.data) {
            (Resolution::Server, _) => None,
            (_, Some(data)) => Some(Payload::from_value(request.entity_type, data.clone())?),
            (_, None) => {
                return Err(ServerError::InvalidRequest(format!(
                    "resolution {} requires data",
                    request.resolution
                )))
            }
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let stored = self.lookup(request)?;
            let Some(client) = &client_payload else {
                info!(local_id = %request.local_id, "conflict settled with server copy");
                return Ok(respond(request.resolution, stored));
            };

            let mut next = match request.resolution {
                Resolution::Merge => stored.entity.payload.merge(client)?,
                _ => client.clone(),
            };
            next.validate(Operation::Update)?;
            next.keep_ownership(&stored.entity.payload);

            match self.repository.bump_version(
                request.entity_type,
                &stored.entity.local_id,
                stored.entity.version,
                next,
                None,
            ) {
                Ok(saved) => {
                    info!(
                        local_id = %request.local_id,
                        resolution = %request.resolution,
                        version = saved.entity.version,
                        "conflict settled"
                    );
                    return Ok(respond(request.resolution, saved));
                }
                Err(ServerError::VersionMismatch { .. }) if attempt < MAX_ATTEMPTS => {
                    debug!(local_id = %request.local_id, attempt, "resolution raced, re-reading");
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn lookup(&self, request: &ResolveRequest) -> ServerResult<StoredEntity> {
        let stored = match self
            .repository
            .get_by_local_id(request.entity_type, &request.local_id)?
        {
            Some(stored) => Some(stored),
            None => match &request.server_id {
                Some(server_id) => self
                    .repository
                    .get_by_server_id(request.entity_type, server_id)?,
                None => None,
            },
        };
        let stored = stored.ok_or_else(|| ServerError::EntityNotFound {
            entity_type: request.entity_type,
            local_id: request.local_id.clone(),
        })?;

        if let (Some(asked), Some(actual)) = (&request.server_id, &stored.entity.server_id) {
            if asked != actual {
                return Err(ServerError::InvalidRequest(format!(
                    "serverId {asked} does not belong to {}",
                    request.local_id
                )));
            }
        }
        if stored.is_deleted() {
            return Err(ServerError::Deleted {
                entity_type: request.entity_type,
                local_id: request.local_id.clone(),
            });
        }
        Ok(stored)
    }
}

fn respond(resolution: Resolution, stored: StoredEntity) -> ResolveResponse {
    let mut entity = stored.entity;
    entity.payload.redact_private();
    ResolveResponse { resolution, entity }
}
