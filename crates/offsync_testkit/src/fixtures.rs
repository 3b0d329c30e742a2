//! Test fixtures: payload builders, temporary stores and a faulty repository.

use offsync_client::LocalStore;
use offsync_protocol::{EntityType, Payload, Timestamp};
use offsync_server::{
    ChangeSet, EntityRepository, MemoryRepository, ServerError, ServerResult, StoredEntity,
};
use parking_lot::RwLock;
use serde_json::json;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

/// A post payload with the given content.
pub fn post_payload(content: &str) -> Payload {
    Payload::from_value(EntityType::Post, json!({ "content": content }))
        .expect("post payload")
}

/// A group payload with a name and members.
pub fn group_payload(name: &str, members: &[&str]) -> Payload {
    Payload::from_value(EntityType::Group, json!({ "name": name, "members": members }))
        .expect("group payload")
}

/// A user payload with a phone number and username.
pub fn user_payload(phone: &str, username: &str) -> Payload {
    Payload::from_value(
        EntityType::User,
        json!({ "phone": phone, "username": username }),
    )
    .expect("user payload")
}

/// Content of a post payload.
pub fn post_content(payload: &Payload) -> Option<&str> {
    match payload {
        Payload::Post(p) => p.content.as_deref(),
        _ => None,
    }
}

/// A client store with automatic cleanup.
pub struct TestStore {
    /// The store.
    pub store: Arc<LocalStore>,
    /// The temporary directory (kept alive to prevent cleanup).
    temp_dir: Option<TempDir>,
}

impl TestStore {
    /// Creates an in-memory store.
    pub fn memory() -> Self {
        Self {
            store: Arc::new(LocalStore::open_in_memory().expect("Failed to open in-memory store")),
            temp_dir: None,
        }
    }

    /// Creates a file-backed store in a fresh temporary directory.
    pub fn file() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let store = LocalStore::open(temp_dir.path()).expect("Failed to open file store");
        Self {
            store: Arc::new(store),
            temp_dir: Some(temp_dir),
        }
    }

    /// Directory of a file-backed store.
    pub fn path(&self) -> Option<&Path> {
        self.temp_dir.as_ref().map(TempDir::path)
    }

    /// Closes a file-backed store and opens it again from disk.
    ///
    /// Other holders of the old `Arc` keep a closed store.
    pub fn reopen(&mut self) {
        let dir = self.temp_dir.as_ref().expect("only file stores can reopen");
        self.store.close().expect("Failed to close store");
        self.store = Arc::new(LocalStore::open(dir.path()).expect("Failed to reopen store"));
    }
}

impl std::ops::Deref for TestStore {
    type Target = LocalStore;

    fn deref(&self) -> &Self::Target {
        &self.store
    }
}

/// A repository that fails writes to chosen local ids with a persistence
/// error, and otherwise behaves like `MemoryRepository`.
#[derive(Default)]
pub struct FaultyRepository {
    inner: MemoryRepository,
    failing: RwLock<HashSet<String>>,
}

impl FaultyRepository {
    /// Creates an empty repository that fails nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every write to `local_id` fail.
    pub fn fail_writes_to(&self, local_id: impl Into<String>) {
        self.failing.write().insert(local_id.into());
    }

    /// Lets writes to `local_id` succeed again.
    pub fn heal(&self, local_id: &str) {
        self.failing.write().remove(local_id);
    }

    /// The wrapped repository.
    pub fn inner(&self) -> &MemoryRepository {
        &self.inner
    }
}

impl EntityRepository for FaultyRepository {
    fn get_by_local_id(
        &self,
        entity_type: EntityType,
        local_id: &str,
    ) -> ServerResult<Option<StoredEntity>> {
        self.inner.get_by_local_id(entity_type, local_id)
    }

    fn get_by_server_id(
        &self,
        entity_type: EntityType,
        server_id: &str,
    ) -> ServerResult<Option<StoredEntity>> {
        self.inner.get_by_server_id(entity_type, server_id)
    }

    fn upsert(
        &self,
        record: StoredEntity,
        expected_version: Option<u64>,
    ) -> ServerResult<StoredEntity> {
        if self.failing.read().contains(&record.entity.local_id) {
            return Err(ServerError::Persistence(format!(
                "injected failure for {}",
                record.entity.local_id
            )));
        }
        self.inner.upsert(record, expected_version)
    }

    fn tombstone(&self, entity_type: EntityType, local_id: &str) -> ServerResult<StoredEntity> {
        self.inner.tombstone(entity_type, local_id)
    }

    fn changed_since(
        &self,
        types: &[EntityType],
        since: Timestamp,
        limit: usize,
    ) -> ServerResult<ChangeSet> {
        self.inner.changed_since(types, since, limit)
    }

    fn count(&self, entity_type: EntityType) -> ServerResult<usize> {
        self.inner.count(entity_type)
    }

    fn server_time(&self) -> Timestamp {
        self.inner.server_time()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use offsync_protocol::{Entity, SyncStatus};

    #[test]
    fn payload_builders() {
        assert_eq!(post_content(&post_payload("hi")), Some("hi"));
        assert!(group_payload("g", &["a"]).validate(offsync_protocol::Operation::Create).is_ok());
        assert!(user_payload("555", "al").validate(offsync_protocol::Operation::Create).is_ok());
    }

    #[test]
    fn file_store_reopens() {
        let mut store = TestStore::file();
        store
            .write(EntityType::Post, Some("P1"), post_payload("x"))
            .unwrap();
        store.reopen();
        assert!(store.entities().get(EntityType::Post, "P1").is_some());
        assert!(store.path().is_some());
        assert!(TestStore::memory().path().is_none());
    }

    #[test]
    fn faulty_repository_fails_chosen_ids() {
        let repo = FaultyRepository::new();
        repo.fail_writes_to("bad");
        let record = |id: &str| {
            StoredEntity::new(
                Entity::new(id, post_payload("x"))
                    .with_server_id(format!("S-{id}"))
                    .with_version(1)
                    .with_status(SyncStatus::Synced),
                None,
            )
        };
        assert!(repo.upsert(record("good"), None).is_ok());
        assert!(matches!(
            repo.upsert(record("bad"), None),
            Err(ServerError::Persistence(_))
        ));
        repo.heal("bad");
        assert!(repo.upsert(record("bad"), None).is_ok());
        assert_eq!(repo.inner().len(), 2);
    }
}
