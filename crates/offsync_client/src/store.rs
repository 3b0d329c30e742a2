//! Client-side Entity Store.
//!
//! Durable keyed storage for posts, groups and users with their sync
//! metadata. This is the only writer of `syncStatus` and `version` on the
//! client; every write is journaled before it becomes visible.

use crate::error::{SyncError, SyncResult};
use crate::journal::{Journal, JournalRecord, SharedJournal};
use crate::storage::InMemoryBackend;
use offsync_protocol::{
    now_millis, Entity, EntityType, Payload, ProtocolError, SyncStatus, Timestamp,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

type EntityKey = (EntityType, String);

/// Sync bookkeeping persisted next to the entities.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMeta {
    /// Change feed cursor.
    pub cursor: Timestamp,
    /// Completion time of the last successful sync cycle.
    #[serde(default)]
    pub last_sync: Option<Timestamp>,
}

/// Entity counts per sync status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    /// Synced entities.
    pub synced: usize,
    /// Pending entities.
    pub pending: usize,
    /// Entities in conflict.
    pub conflict: usize,
    /// Deleted entities.
    pub deleted: usize,
}

impl StatusCounts {
    fn add(&mut self, status: SyncStatus) {
        match status {
            SyncStatus::Synced => self.synced += 1,
            SyncStatus::Pending => self.pending += 1,
            SyncStatus::Conflict => self.conflict += 1,
            SyncStatus::Deleted => self.deleted += 1,
        }
    }

    /// Sum over all statuses.
    pub fn total(&self) -> usize {
        self.synced + self.pending + self.conflict + self.deleted
    }
}

/// What `apply_remote` did with a pulled entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The entity was not known locally.
    Inserted,
    /// A synced local copy was replaced by a newer revision.
    Updated,
    /// The local copy was already current.
    Unchanged,
    /// The local copy has unsent changes or awaits resolution.
    KeptLocal,
}

#[derive(Default)]
struct StoreState {
    entities: HashMap<EntityKey, Entity>,
    meta: SyncMeta,
}

/// Durable keyed entity storage.
pub struct EntityStore {
    journal: SharedJournal,
    state: RwLock<StoreState>,
}

impl EntityStore {
    /// Creates an empty, non-persistent store.
    pub fn in_memory() -> SyncResult<Self> {
        let (journal, records) = Journal::open(Box::new(InMemoryBackend::new()))?;
        Ok(Self::restore(Arc::new(Mutex::new(journal)), &records))
    }

    /// Rebuilds the store from replayed journal records.
    pub(crate) fn restore(journal: SharedJournal, records: &[JournalRecord]) -> Self {
        let mut state = StoreState::default();
        for record in records {
            match record {
                JournalRecord::Entity(entity) => {
                    state.entities.insert(key_of(entity), entity.clone());
                }
                JournalRecord::Meta(meta) => state.meta = meta.clone(),
                JournalRecord::QueuePut(_) | JournalRecord::QueueRemove(_) => {}
            }
        }
        Self {
            journal,
            state: RwLock::new(state),
        }
    }

    /// Records a local write.
    ///
    /// Creates the entity (status `pending`, version 0) when it is unknown,
    /// generating a `localId` if none is given. Otherwise replaces the payload
    /// and marks the entity `pending`. Entities in `conflict` or `deleted`
    /// accept no writes.
    pub fn record_local_write(
        &self,
        entity_type: EntityType,
        local_id: Option<&str>,
        payload: Payload,
    ) -> SyncResult<Entity> {
        if payload.entity_type() != entity_type {
            return Err(ProtocolError::PayloadTypeMismatch {
                expected: entity_type.to_string(),
                actual: payload.entity_type().to_string(),
            }
            .into());
        }

        let local_id = local_id.map_or_else(new_local_id, str::to_string);
        let mut journal = self.journal.lock();
        let existing = self.get(entity_type, &local_id);

        let entity = match existing {
            Some(current) => {
                match current.sync_status {
                    SyncStatus::Deleted => {
                        return Err(SyncError::EntityDeleted {
                            entity_type,
                            local_id,
                        })
                    }
                    SyncStatus::Conflict => {
                        return Err(SyncError::EntityInConflict {
                            entity_type,
                            local_id,
                        })
                    }
                    SyncStatus::Synced | SyncStatus::Pending => {}
                }
                Entity {
                    payload,
                    sync_status: SyncStatus::Pending,
                    updated_at: now_millis(),
                    ..current
                }
            }
            None => Entity::new(local_id, payload).with_updated_at(now_millis()),
        };

        journal.append(&JournalRecord::Entity(entity.clone()))?;
        self.state
            .write()
            .entities
            .insert(key_of(&entity), entity.clone());
        Ok(entity)
    }

    /// Records a `created`/`updated` reconciler result.
    ///
    /// The entity becomes `synced` unless `more_pending` says later local
    /// writes are still queued for it.
    pub fn apply_push_result(
        &self,
        entity_type: EntityType,
        local_id: &str,
        server_id: &str,
        version: u64,
        more_pending: bool,
    ) -> SyncResult<Entity> {
        self.update(entity_type, local_id, |entity| {
            entity.server_id = Some(server_id.to_string());
            entity.version = entity.version.max(version);
            if entity.sync_status == SyncStatus::Pending && !more_pending {
                entity.sync_status = SyncStatus::Synced;
            }
        })
    }

    /// Flags a version conflict reported by the reconciler.
    pub fn mark_conflict(&self, entity_type: EntityType, local_id: &str) -> SyncResult<Entity> {
        self.update(entity_type, local_id, |entity| {
            if !entity.sync_status.is_terminal() {
                entity.sync_status = SyncStatus::Conflict;
            }
        })
    }

    /// Merges an entity pulled from the change feed.
    ///
    /// Local copies with unsent changes, open conflicts or a deletion are
    /// never overwritten. Re-applying a current entity is a no-op.
    pub fn apply_remote(&self, remote: Entity) -> SyncResult<ApplyOutcome> {
        let mut journal = self.journal.lock();
        let local = self.get(remote.entity_type, &remote.local_id);

        let outcome = match &local {
            None => ApplyOutcome::Inserted,
            Some(l) if l.sync_status != SyncStatus::Synced => ApplyOutcome::KeptLocal,
            Some(l) if remote.supersedes(l) => ApplyOutcome::Updated,
            Some(_) => ApplyOutcome::Unchanged,
        };

        if matches!(outcome, ApplyOutcome::Inserted | ApplyOutcome::Updated) {
            let entity = remote.with_status(SyncStatus::Synced);
            journal.append(&JournalRecord::Entity(entity.clone()))?;
            self.state.write().entities.insert(key_of(&entity), entity);
        }
        Ok(outcome)
    }

    /// Writes an entity settled by the conflict resolver.
    pub fn apply_settled(&self, settled: Entity, more_pending: bool) -> SyncResult<Entity> {
        let mut journal = self.journal.lock();
        let local = self.get(settled.entity_type, &settled.local_id);
        if let Some(l) = &local {
            if l.sync_status == SyncStatus::Deleted {
                return Err(SyncError::EntityDeleted {
                    entity_type: l.entity_type,
                    local_id: l.local_id.clone(),
                });
            }
        }

        let status = if more_pending {
            SyncStatus::Pending
        } else {
            SyncStatus::Synced
        };
        let entity = settled.with_status(status);
        journal.append(&JournalRecord::Entity(entity.clone()))?;
        self.state
            .write()
            .entities
            .insert(key_of(&entity), entity.clone());
        Ok(entity)
    }

    /// Marks an entity deleted. Terminal for sync purposes.
    pub fn mark_deleted(&self, entity_type: EntityType, local_id: &str) -> SyncResult<Entity> {
        self.update(entity_type, local_id, |entity| {
            entity.sync_status = SyncStatus::Deleted;
            entity.updated_at = now_millis();
        })
    }

    /// Gets an entity.
    pub fn get(&self, entity_type: EntityType, local_id: &str) -> Option<Entity> {
        self.state
            .read()
            .entities
            .get(&(entity_type, local_id.to_string()))
            .cloned()
    }

    /// Current version of an entity, if known.
    pub fn version_of(&self, entity_type: EntityType, local_id: &str) -> Option<u64> {
        self.get(entity_type, local_id).map(|e| e.version)
    }

    /// All entities of a type, oldest update first.
    pub fn list(&self, entity_type: EntityType) -> Vec<Entity> {
        let mut entities: Vec<Entity> = self
            .state
            .read()
            .entities
            .values()
            .filter(|e| e.entity_type == entity_type)
            .cloned()
            .collect();
        entities.sort_by(|a, b| {
            a.updated_at
                .cmp(&b.updated_at)
                .then_with(|| a.local_id.cmp(&b.local_id))
        });
        entities
    }

    /// All entities with the given status, across types.
    pub fn list_by_status(&self, status: SyncStatus) -> Vec<Entity> {
        let mut entities: Vec<Entity> = self
            .state
            .read()
            .entities
            .values()
            .filter(|e| e.sync_status == status)
            .cloned()
            .collect();
        entities.sort_by(|a, b| {
            (a.entity_type, &a.local_id).cmp(&(b.entity_type, &b.local_id))
        });
        entities
    }

    /// Entity counts per status.
    pub fn count_by_status(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for entity in self.state.read().entities.values() {
            counts.add(entity.sync_status);
        }
        counts
    }

    /// Number of entities.
    pub fn len(&self) -> usize {
        self.state.read().entities.len()
    }

    /// Returns true if the store holds no entities.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Change feed cursor.
    pub fn cursor(&self) -> Timestamp {
        self.state.read().meta.cursor
    }

    /// Stores the change feed cursor.
    pub fn set_cursor(&self, cursor: Timestamp) -> SyncResult<()> {
        self.update_meta(|meta| meta.cursor = cursor)
    }

    /// Time of the last successful sync cycle.
    pub fn last_sync(&self) -> Option<Timestamp> {
        self.state.read().meta.last_sync
    }

    /// Stores the time of the last successful sync cycle.
    pub fn set_last_sync(&self, at: Timestamp) -> SyncResult<()> {
        self.update_meta(|meta| meta.last_sync = Some(at))
    }

    /// Current sync metadata.
    pub fn meta(&self) -> SyncMeta {
        self.state.read().meta.clone()
    }

    /// Records describing the current state, for journal compaction.
    pub(crate) fn snapshot_records(&self) -> Vec<JournalRecord> {
        let state = self.state.read();
        let mut entities: Vec<&Entity> = state.entities.values().collect();
        entities.sort_by(|a, b| (a.entity_type, &a.local_id).cmp(&(b.entity_type, &b.local_id)));
        entities
            .into_iter()
            .map(|e| JournalRecord::Entity(e.clone()))
            .chain(std::iter::once(JournalRecord::Meta(state.meta.clone())))
            .collect()
    }

    fn update<F>(&self, entity_type: EntityType, local_id: &str, f: F) -> SyncResult<Entity>
    where
        F: FnOnce(&mut Entity),
    {
        let mut journal = self.journal.lock();
        let mut entity = self
            .get(entity_type, local_id)
            .ok_or_else(|| SyncError::EntityNotFound {
                entity_type,
                local_id: local_id.to_string(),
            })?;
        f(&mut entity);

        journal.append(&JournalRecord::Entity(entity.clone()))?;
        debug!(
            entity_type = %entity_type,
            local_id = %local_id,
            version = entity.version,
            status = %entity.sync_status,
            "entity updated"
        );
        self.state
            .write()
            .entities
            .insert(key_of(&entity), entity.clone());
        Ok(entity)
    }

    fn update_meta<F>(&self, f: F) -> SyncResult<()>
    where
        F: FnOnce(&mut SyncMeta),
    {
        let mut journal = self.journal.lock();
        let mut meta = self.meta();
        f(&mut meta);
        journal.append(&JournalRecord::Meta(meta.clone()))?;
        self.state.write().meta = meta;
        Ok(())
    }
}

fn key_of(entity: &Entity) -> EntityKey {
    (entity.entity_type, entity.local_id.clone())
}

/// Generates a fresh client-side identifier.
pub fn new_local_id() -> String {
    format!("local_{}_{}", now_millis(), Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn post(content: &str) -> Payload {
        Payload::from_value(EntityType::Post, json!({ "content": content })).unwrap()
    }

    fn remote(local_id: &str, version: u64, updated_at: Timestamp, content: &str) -> Entity {
        Entity::new(local_id, post(content))
            .with_server_id(format!("S-{local_id}"))
            .with_version(version)
            .with_updated_at(updated_at)
            .with_status(SyncStatus::Synced)
    }

    #[test]
    fn local_write_creates_pending_entity() {
        let store = EntityStore::in_memory().unwrap();
        let entity = store
            .record_local_write(EntityType::Post, None, post("hi"))
            .unwrap();
        assert!(entity.local_id.starts_with("local_"));
        assert_eq!(entity.version, 0);
        assert_eq!(entity.sync_status, SyncStatus::Pending);
        assert_eq!(store.get(EntityType::Post, &entity.local_id), Some(entity));
    }

    #[test]
    fn local_write_rejects_mismatched_payload() {
        let store = EntityStore::in_memory().unwrap();
        let err = store
            .record_local_write(EntityType::Group, Some("G1"), post("hi"))
            .unwrap_err();
        assert!(matches!(err, SyncError::Payload(_)));
    }

    #[test]
    fn push_result_transitions_pending_to_synced() {
        let store = EntityStore::in_memory().unwrap();
        store
            .record_local_write(EntityType::Post, Some("L1"), post("hi"))
            .unwrap();

        let e = store
            .apply_push_result(EntityType::Post, "L1", "S1", 1, false)
            .unwrap();
        assert_eq!(e.server_id.as_deref(), Some("S1"));
        assert_eq!(e.version, 1);
        assert_eq!(e.sync_status, SyncStatus::Synced);
    }

    #[test]
    fn push_result_keeps_pending_when_more_writes_queued() {
        let store = EntityStore::in_memory().unwrap();
        store
            .record_local_write(EntityType::Post, Some("L1"), post("hi"))
            .unwrap();
        let e = store
            .apply_push_result(EntityType::Post, "L1", "S1", 1, true)
            .unwrap();
        assert_eq!(e.sync_status, SyncStatus::Pending);
        assert_eq!(e.version, 1);
    }

    #[test]
    fn conflict_and_deleted_block_local_writes() {
        let store = EntityStore::in_memory().unwrap();
        store
            .record_local_write(EntityType::Post, Some("L1"), post("a"))
            .unwrap();
        store.mark_conflict(EntityType::Post, "L1").unwrap();
        assert!(matches!(
            store.record_local_write(EntityType::Post, Some("L1"), post("b")),
            Err(SyncError::EntityInConflict { .. })
        ));

        store.mark_deleted(EntityType::Post, "L1").unwrap();
        assert!(matches!(
            store.record_local_write(EntityType::Post, Some("L1"), post("c")),
            Err(SyncError::EntityDeleted { .. })
        ));
        // deleted is terminal
        let e = store.mark_conflict(EntityType::Post, "L1").unwrap();
        assert_eq!(e.sync_status, SyncStatus::Deleted);
    }

    #[test]
    fn missing_entity_is_reported() {
        let store = EntityStore::in_memory().unwrap();
        assert!(matches!(
            store.mark_conflict(EntityType::User, "nobody"),
            Err(SyncError::EntityNotFound { .. })
        ));
    }

    #[test]
    fn apply_remote_merge_rules() {
        let store = EntityStore::in_memory().unwrap();

        assert_eq!(
            store.apply_remote(remote("R1", 1, 10, "v1")).unwrap(),
            ApplyOutcome::Inserted
        );
        assert_eq!(
            store.apply_remote(remote("R1", 1, 10, "v1")).unwrap(),
            ApplyOutcome::Unchanged
        );
        assert_eq!(
            store.apply_remote(remote("R1", 2, 20, "v2")).unwrap(),
            ApplyOutcome::Updated
        );
        assert_eq!(
            store.apply_remote(remote("R1", 1, 30, "stale")).unwrap(),
            ApplyOutcome::Unchanged
        );

        store
            .record_local_write(EntityType::Post, Some("R1"), post("local edit"))
            .unwrap();
        assert_eq!(
            store.apply_remote(remote("R1", 3, 40, "v3")).unwrap(),
            ApplyOutcome::KeptLocal
        );
        let local = store.get(EntityType::Post, "R1").unwrap();
        assert_eq!(local.payload, post("local edit"));
        assert_eq!(local.version, 2);
    }

    #[test]
    fn apply_settled_clears_conflict() {
        let store = EntityStore::in_memory().unwrap();
        store
            .record_local_write(EntityType::Post, Some("L1"), post("a"))
            .unwrap();
        store.mark_conflict(EntityType::Post, "L1").unwrap();

        let settled = store
            .apply_settled(remote("L1", 3, 50, "merged"), false)
            .unwrap();
        assert_eq!(settled.sync_status, SyncStatus::Synced);
        assert_eq!(store.version_of(EntityType::Post, "L1"), Some(3));
    }

    #[test]
    fn counts_and_listing() {
        let store = EntityStore::in_memory().unwrap();
        store.apply_remote(remote("A", 1, 5, "a")).unwrap();
        store.apply_remote(remote("B", 1, 3, "b")).unwrap();
        store
            .record_local_write(EntityType::Post, Some("C"), post("c"))
            .unwrap();

        let counts = store.count_by_status();
        assert_eq!(counts.synced, 2);
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.total(), 3);

        let ids: Vec<String> = store
            .list(EntityType::Post)
            .into_iter()
            .take(2)
            .map(|e| e.local_id)
            .collect();
        assert_eq!(ids, vec!["B".to_string(), "A".to_string()]);
        assert_eq!(store.list_by_status(SyncStatus::Pending).len(), 1);
        assert!(store.list(EntityType::Group).is_empty());
    }

    #[test]
    fn cursor_and_last_sync() {
        let store = EntityStore::in_memory().unwrap();
        assert_eq!(store.cursor(), 0);
        assert_eq!(store.last_sync(), None);
        store.set_cursor(42).unwrap();
        store.set_last_sync(99).unwrap();
        assert_eq!(
            store.meta(),
            SyncMeta {
                cursor: 42,
                last_sync: Some(99)
            }
        );
    }
}
