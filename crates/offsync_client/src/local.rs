//! `LocalStore`: the explicitly opened client store.
//!
//! Owns the journal, the Entity Store and the Mutation Queue. Create one per
//! client process and pass it to the `SyncClient` and the UI layer.

use crate::error::SyncResult;
use crate::journal::{Journal, SharedJournal};
use crate::queue::MutationQueue;
use crate::storage::{FileBackend, InMemoryBackend, StorageBackend};
use crate::store::EntityStore;
use offsync_protocol::{Entity, EntityType, Operation, Payload, SyncStatus};
use parking_lot::Mutex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// File name of the journal inside a store directory.
pub const JOURNAL_FILE: &str = "offsync.journal";

/// Journal sizes around a compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CompactStats {
    /// Bytes before.
    pub before: u64,
    /// Bytes after.
    pub after: u64,
    /// Records written.
    pub records: usize,
}

/// The client's local database: entities, queue and sync metadata.
pub struct LocalStore {
    path: Option<PathBuf>,
    journal: SharedJournal,
    entities: EntityStore,
    queue: MutationQueue,
}

impl LocalStore {
    /// Opens (or creates) a store in `dir`.
    pub fn open(dir: impl AsRef<Path>) -> SyncResult<Self> {
        let path = dir.as_ref().join(JOURNAL_FILE);
        let backend = FileBackend::open_with_create_dirs(&path)?;
        Self::with_backend(Box::new(backend), Some(dir.as_ref().to_path_buf()))
    }

    /// Opens an empty, non-persistent store.
    pub fn open_in_memory() -> SyncResult<Self> {
        Self::with_backend(Box::new(InMemoryBackend::new()), None)
    }

    /// Opens a store over any backend.
    pub fn with_backend(
        backend: Box<dyn StorageBackend>,
        path: Option<PathBuf>,
    ) -> SyncResult<Self> {
        let (journal, records) = Journal::open(backend)?;
        let journal = Arc::new(Mutex::new(journal));
        let entities = EntityStore::restore(Arc::clone(&journal), &records);
        let queue = MutationQueue::restore(Arc::clone(&journal), &records);

        let store = Self {
            path,
            journal,
            entities,
            queue,
        };
        let repaired = store.repair_orphans()?;
        info!(
            entities = store.entities.len(),
            queued = store.queue.len(),
            repaired,
            "local store opened"
        );
        Ok(store)
    }

    /// Directory of a file-backed store.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// The Entity Store.
    pub fn entities(&self) -> &EntityStore {
        &self.entities
    }

    /// The Mutation Queue.
    pub fn queue(&self) -> &MutationQueue {
        &self.queue
    }

    /// Records a local write and enqueues its mutation in one step.
    ///
    /// Returns the entity and the queue id of the mutation carrying it.
    pub fn write(
        &self,
        entity_type: EntityType,
        local_id: Option<&str>,
        payload: Payload,
    ) -> SyncResult<(Entity, u64)> {
        let entity = self
            .entities
            .record_local_write(entity_type, local_id, payload)?;
        let queue_id = self.enqueue_for(&entity)?;
        Ok((entity, queue_id))
    }

    /// Marks an entity deleted. Queued mutations for it are flagged stuck
    /// when the next cycle reaches them.
    pub fn delete(&self, entity_type: EntityType, local_id: &str) -> SyncResult<Entity> {
        self.entities.mark_deleted(entity_type, local_id)
    }

    /// Rewrites the journal as a snapshot of the current state.
    pub fn compact(&self) -> SyncResult<CompactStats> {
        let mut journal = self.journal.lock();
        let before = journal.size()?;
        let mut records = self.entities.snapshot_records();
        records.extend(self.queue.snapshot_records());
        journal.compact(&records)?;
        let stats = CompactStats {
            before,
            after: journal.size()?,
            records: records.len(),
        };
        info!(before = stats.before, after = stats.after, "store compacted");
        Ok(stats)
    }

    /// Current journal size in bytes.
    pub fn journal_size(&self) -> SyncResult<u64> {
        Ok(self.journal.lock().size()?)
    }

    /// Syncs and closes the store. Later writes fail.
    pub fn close(&self) -> SyncResult<()> {
        self.journal.lock().close()?;
        info!("local store closed");
        Ok(())
    }

    /// Returns true once closed.
    pub fn is_closed(&self) -> bool {
        self.journal.lock().is_closed()
    }

    /// A write is a create only while the server has never seen the entity
    /// and no earlier create for it is still queued.
    fn enqueue_for(&self, entity: &Entity) -> SyncResult<u64> {
        let unseen = entity.server_id.is_none() && entity.version == 0;
        let operation = if unseen
            && !self
                .queue
                .has_entries_for(entity.entity_type, &entity.local_id, None)
        {
            Operation::Create
        } else {
            Operation::Update
        };
        let payload = entity.payload.to_value()?;
        self.queue.enqueue(
            entity.entity_type,
            operation,
            &entity.local_id,
            payload,
            entity.version,
        )
    }

    /// Re-enqueues pending entities that lost their queue entry, e.g. after a
    /// crash between the entity write and the enqueue.
    fn repair_orphans(&self) -> SyncResult<usize> {
        let mut repaired = 0;
        for entity in self.entities.list_by_status(SyncStatus::Pending) {
            if !self
                .queue
                .has_entries_for(entity.entity_type, &entity.local_id, None)
            {
                warn!(
                    entity_type = %entity.entity_type,
                    local_id = %entity.local_id,
                    "pending entity without queue entry, re-enqueuing"
                );
                self.enqueue_for(&entity)?;
                repaired += 1;
            }
        }
        Ok(repaired)
    }
}

impl Drop for LocalStore {
    fn drop(&mut self) {
        let mut journal = self.journal.lock();
        if !journal.is_closed() {
            if let Err(e) = journal.close() {
                warn!(error = %e, "failed to sync journal on drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{StorageError, SyncError};
    use serde_json::json;
    use tempfile::tempdir;

    fn post(content: &str) -> Payload {
        Payload::from_value(EntityType::Post, json!({ "content": content })).unwrap()
    }

    #[test]
    fn write_records_entity_and_enqueues_create() {
        let store = LocalStore::open_in_memory().unwrap();
        let (entity, queue_id) = store
            .write(EntityType::Post, Some("L1"), post("hi"))
            .unwrap();
        assert_eq!(entity.sync_status, SyncStatus::Pending);

        let entry = store.queue().get(queue_id).unwrap();
        assert_eq!(entry.operation, Operation::Create);
        assert_eq!(entry.local_id, "L1");
        assert_eq!(entry.payload["content"], "hi");
    }

    #[test]
    fn write_after_sync_enqueues_update_with_version() {
        let store = LocalStore::open_in_memory().unwrap();
        let (_, queue_id) = store
            .write(EntityType::Post, Some("L1"), post("hi"))
            .unwrap();
        store
            .entities()
            .apply_push_result(EntityType::Post, "L1", "S1", 1, false)
            .unwrap();
        store.queue().remove(queue_id).unwrap();

        let (_, queue_id) = store
            .write(EntityType::Post, Some("L1"), post("hi there"))
            .unwrap();
        let entry = store.queue().get(queue_id).unwrap();
        assert_eq!(entry.operation, Operation::Update);
        assert_eq!(entry.client_version, 1);
    }

    #[test]
    fn edit_behind_in_flight_create_is_an_update() {
        let store = LocalStore::open_in_memory().unwrap();
        store
            .write(EntityType::Post, Some("L1"), post("hi"))
            .unwrap();
        store.queue().claim_batch(10);

        let (_, queue_id) = store
            .write(EntityType::Post, Some("L1"), post("hi there"))
            .unwrap();
        let entry = store.queue().get(queue_id).unwrap();
        assert_eq!(entry.operation, Operation::Update);
        assert_eq!(store.queue().len(), 2);
    }

    #[test]
    fn reopen_restores_entities_queue_and_cursor() {
        let dir = tempdir().unwrap();
        {
            let store = LocalStore::open(dir.path()).unwrap();
            store
                .write(EntityType::Group, Some("G1"), {
                    Payload::from_value(EntityType::Group, json!({"name": "Rust"})).unwrap()
                })
                .unwrap();
            store.entities().set_cursor(77).unwrap();
            store.close().unwrap();
        }

        let store = LocalStore::open(dir.path()).unwrap();
        assert_eq!(store.path(), Some(dir.path()));
        assert_eq!(store.entities().len(), 1);
        assert_eq!(store.queue().len(), 1);
        assert_eq!(store.entities().cursor(), 77);
    }

    #[test]
    fn compact_preserves_state() {
        let dir = tempdir().unwrap();
        {
            let store = LocalStore::open(dir.path()).unwrap();
            for i in 0..5 {
                store
                    .write(EntityType::Post, Some("L1"), post(&format!("edit {i}")))
                    .unwrap();
            }
            let stats = store.compact().unwrap();
            assert!(stats.after < stats.before);
        }

        let store = LocalStore::open(dir.path()).unwrap();
        let entity = store.entities().get(EntityType::Post, "L1").unwrap();
        assert_eq!(entity.payload, post("edit 4"));
        assert_eq!(store.queue().len(), 1);
    }

    #[test]
    fn orphaned_pending_entity_is_requeued_on_open() {
        let dir = tempdir().unwrap();
        {
            let store = LocalStore::open(dir.path()).unwrap();
            store
                .entities()
                .record_local_write(EntityType::Post, Some("L1"), post("orphan"))
                .unwrap();
            assert!(store.queue().is_empty());
        }

        let store = LocalStore::open(dir.path()).unwrap();
        let entries = store.queue().entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].local_id, "L1");
        assert_eq!(entries[0].operation, Operation::Create);
    }

    #[test]
    fn closed_store_rejects_writes() {
        let store = LocalStore::open_in_memory().unwrap();
        store.close().unwrap();
        assert!(store.is_closed());
        let err = store
            .write(EntityType::Post, Some("L1"), post("late"))
            .unwrap_err();
        assert!(matches!(err, SyncError::Storage(StorageError::Closed)));
    }
}
