//! Reconciler: classifies each pushed mutation against the stored entity.
//!
//! Items are independent. A failing item becomes an `error` outcome and the
//! rest of the batch goes on. Items for the same `localId` run in request
//! order on one worker; distinct entities are spread over a scoped thread
//! pool. Writes are compare-and-swap on the stored version, so two batches
//! racing on one entity never lose an update: the loser re-reads and is
//! classified against what the winner wrote.

use crate::auth::Principal;
use crate::error::{ServerError, ServerResult};
use crate::repository::{EntityRepository, StoredEntity};
use offsync_protocol::{
    BatchRequest, BatchResponse, ConflictItem, ConflictRecord, Entity, EntityType, ErrorItem,
    ItemErrorKind, ItemOutcome, Mutation, Operation, Payload, SettledItem, SyncStatus,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use tracing::{debug, warn};
use uuid::Uuid;

/// Attempts per item before a lost compare-and-swap is reported as a conflict.
const MAX_ATTEMPTS: usize = 3;

/// Applies pushed mutations to the repository.
pub struct Reconciler {
    repository: Arc<dyn EntityRepository>,
    workers: usize,
}

impl Reconciler {
    /// Creates a reconciler running `workers` threads per batch.
    pub fn new(repository: Arc<dyn EntityRepository>, workers: usize) -> Self {
        Self {
            repository,
            workers: workers.max(1),
        }
    }

    /// Reconciles a batch. Every input item appears exactly once in the
    /// response, in request order.
    pub fn reconcile(&self, principal: &Principal, request: &BatchRequest) -> BatchResponse {
        let groups = group_by_entity(&request.operations);
        let workers = self.workers.min(groups.len());

        let outcomes = if workers <= 1 {
            groups
                .iter()
                .flat_map(|group| self.run_group(principal, request.entity_type, group))
                .collect()
        } else {
            self.run_pool(principal, request.entity_type, groups, workers)
        };

        let response = BatchResponse::from_outcomes(outcomes);
        debug!(
            entity_type = %request.entity_type,
            total = response.summary.total,
            successful = response.summary.successful,
            conflicts = response.summary.conflicts,
            errors = response.summary.errors,
            "batch reconciled"
        );
        response
    }

    fn run_pool(
        &self,
        principal: &Principal,
        entity_type: EntityType,
        groups: Vec<Vec<(usize, &Mutation)>>,
        workers: usize,
    ) -> Vec<ItemOutcome> {
        let mut buckets: Vec<Vec<Vec<(usize, &Mutation)>>> = vec![Vec::new(); workers];
        for (i, group) in groups.into_iter().enumerate() {
            buckets[i % workers].push(group);
        }

        thread::scope(|scope| {
            let handles: Vec<_> = buckets
                .into_iter()
                .map(|bucket| {
                    let lost: Vec<(usize, String)> = bucket
                        .iter()
                        .flatten()
                        .map(|(index, m)| (*index, m.local_id.clone()))
                        .collect();
                    let handle = scope.spawn(move || {
                        bucket
                            .iter()
                            .flat_map(|group| self.run_group(principal, entity_type, group))
                            .collect::<Vec<_>>()
                    });
                    (handle, lost)
                })
                .collect();

            let mut outcomes = Vec::new();
            for (handle, lost) in handles {
                match handle.join() {
                    Ok(chunk) => outcomes.extend(chunk),
                    Err(_) => {
                        warn!(items = lost.len(), "reconcile worker panicked");
                        outcomes.extend(lost.into_iter().map(|(index, local_id)| {
                            item_error(
                                index,
                                local_id,
                                ItemErrorKind::Persistence,
                                "worker failed".to_string(),
                            )
                        }));
                    }
                }
            }
            outcomes
        })
    }

    fn run_group(
        &self,
        principal: &Principal,
        entity_type: EntityType,
        group: &[(usize, &Mutation)],
    ) -> Vec<ItemOutcome> {
        group
            .iter()
            .map(|(index, mutation)| self.reconcile_item(principal, entity_type, *index, mutation))
            .collect()
    }

    /// Classifies one mutation. Never fails: every problem becomes an
    /// `error` outcome for this item alone.
    pub fn reconcile_item(
        &self,
        principal: &Principal,
        entity_type: EntityType,
        index: usize,
        mutation: &Mutation,
    ) -> ItemOutcome {
        let local_id = mutation.local_id.clone();
        if local_id.trim().is_empty() {
            return item_error(
                index,
                local_id,
                ItemErrorKind::Validation,
                "localId is required".to_string(),
            );
        }
        let payload = match mutation.typed_payload(entity_type) {
            Ok(payload) => payload,
            Err(e) => return item_error(index, local_id, ItemErrorKind::Validation, e.to_string()),
        };

        for attempt in 1..=MAX_ATTEMPTS {
            match self.try_apply(principal, entity_type, index, mutation, payload.clone()) {
                Ok(outcome) => return outcome,
                Err(ServerError::VersionMismatch { .. }) if attempt < MAX_ATTEMPTS => {
                    debug!(local_id = %local_id, attempt, "lost version race, re-reading");
                }
                Err(ServerError::VersionMismatch { .. }) => {
                    return self.race_lost(entity_type, index, mutation, payload);
                }
                Err(e) => return classify_error(index, local_id, e),
            }
        }
        // unreachable with MAX_ATTEMPTS >= 1
        self.race_lost(entity_type, index, mutation, payload)
    }

    fn try_apply(
        &self,
        principal: &Principal,
        entity_type: EntityType,
        index: usize,
        mutation: &Mutation,
        mut payload: Payload,
    ) -> ServerResult<ItemOutcome> {
        let local_id = &mutation.local_id;
        let Some(stored) = self.repository.get_by_local_id(entity_type, local_id)? else {
            // an update for an unknown localId is a create
            payload.validate(Operation::Create)?;
            payload.stamp_creation(&principal.user_id);
            let server_id = Uuid::new_v4().to_string();
            let entity = Entity::new(local_id.clone(), payload)
                .with_server_id(server_id.clone())
                .with_version(1)
                .with_status(SyncStatus::Synced);
            self.repository
                .upsert(StoredEntity::new(entity, mutation.mutation_id.clone()), None)?;
            debug!(local_id = %local_id, server_id = %server_id, "created");
            return Ok(ItemOutcome::Created(SettledItem {
                index,
                local_id: local_id.clone(),
                server_id,
                version: 1,
                applied: true,
            }));
        };

        if stored.is_deleted() {
            return Err(ServerError::Deleted {
                entity_type,
                local_id: local_id.clone(),
            });
        }

        // A create without a mutationId is a retry keyed on localId alone. A
        // create carrying a different mutationId may hold newer content, so
        // it is judged by the version rule like any update.
        let replay = match &mutation.mutation_id {
            Some(id) => stored.last_mutation_id.as_ref() == Some(id),
            None => mutation.operation == Operation::Create,
        };
        if replay {
            debug!(local_id = %local_id, "acknowledged without change");
            return Ok(ItemOutcome::Updated(settled(index, &stored, false)));
        }

        if mutation.client_version < stored.entity.version {
            debug!(
                local_id = %local_id,
                client_version = mutation.client_version,
                server_version = stored.entity.version,
                "conflict"
            );
            return Ok(ItemOutcome::Conflict(conflict(
                entity_type,
                index,
                mutation,
                payload,
                &stored,
            )));
        }

        payload.validate(Operation::Update)?;
        payload.keep_ownership(&stored.entity.payload);
        let saved = self.repository.bump_version(
            entity_type,
            local_id,
            stored.entity.version,
            payload,
            mutation.mutation_id.clone(),
        )?;
        debug!(local_id = %local_id, version = saved.entity.version, "updated");
        Ok(ItemOutcome::Updated(settled(index, &saved, true)))
    }

    /// Outcome after repeatedly losing the compare-and-swap: a conflict
    /// against whatever the winner wrote.
    fn race_lost(
        &self,
        entity_type: EntityType,
        index: usize,
        mutation: &Mutation,
        payload: Payload,
    ) -> ItemOutcome {
        match self.repository.get_by_local_id(entity_type, &mutation.local_id) {
            Ok(Some(stored)) => {
                ItemOutcome::Conflict(conflict(entity_type, index, mutation, payload, &stored))
            }
            Ok(None) => item_error(
                index,
                mutation.local_id.clone(),
                ItemErrorKind::Persistence,
                "entity vanished during write".to_string(),
            ),
            Err(e) => classify_error(index, mutation.local_id.clone(), e),
        }
    }
}

/// Groups items by `localId`, keeping request order within each group and
/// ordering groups by first appearance.
fn group_by_entity(operations: &[Mutation]) -> Vec<Vec<(usize, &Mutation)>> {
    let mut slots: HashMap<&str, usize> = HashMap::new();
    let mut groups: Vec<Vec<(usize, &Mutation)>> = Vec::new();
    for (index, mutation) in operations.iter().enumerate() {
        let slot = *slots.entry(mutation.local_id.as_str()).or_insert_with(|| {
            groups.push(Vec::new());
            groups.len() - 1
        });
        groups[slot].push((index, mutation));
    }
    groups
}

fn settled(index: usize, stored: &StoredEntity, applied: bool) -> SettledItem {
    SettledItem {
        index,
        local_id: stored.entity.local_id.clone(),
        server_id: stored.entity.server_id.clone().unwrap_or_default(),
        version: stored.entity.version,
        applied,
    }
}

fn conflict(
    entity_type: EntityType,
    index: usize,
    mutation: &Mutation,
    client_payload: Payload,
    stored: &StoredEntity,
) -> ConflictItem {
    let mut server_payload = stored.entity.payload.clone();
    server_payload.redact_private();
    ConflictItem {
        index,
        conflict: ConflictRecord {
            entity_type,
            local_id: mutation.local_id.clone(),
            server_id: stored.entity.server_id.clone().unwrap_or_default(),
            client_version: mutation.client_version,
            server_version: stored.entity.version,
            client_payload,
            server_payload,
        },
    }
}

fn classify_error(index: usize, local_id: String, error: ServerError) -> ItemOutcome {
    let kind = match &error {
        ServerError::Payload(_) | ServerError::InvalidRequest(_) => ItemErrorKind::Validation,
        ServerError::Deleted { .. } => ItemErrorKind::Deleted,
        _ => ItemErrorKind::Persistence,
    };
    if kind == ItemErrorKind::Persistence {
        warn!(local_id = %local_id, error = %error, "item failed");
    }
    item_error(index, local_id, kind, error.to_string())
}

fn item_error(index: usize, local_id: String, kind: ItemErrorKind, error: String) -> ItemOutcome {
    ItemOutcome::Error(ErrorItem {
        index,
        local_id,
        kind,
        error,
    })
}
