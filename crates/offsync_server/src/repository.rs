//! Server-side entity persistence.
//!
//! The reconciler treats storage as a black box behind `EntityRepository`.
//! Writes are compare-and-swap on the stored version, so concurrent batches
//! never need a lock held across an item.

use crate::clock::ServerClock;
use crate::error::{ServerError, ServerResult};
use offsync_protocol::{Entity, EntityType, Payload, SyncStatus, Timestamp};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

/// An entity as the server stores it.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEntity {
    /// The entity.
    pub entity: Entity,
    /// Id of the last mutation applied to it, for replay detection.
    pub last_mutation_id: Option<String>,
}

impl StoredEntity {
    /// Wraps an entity.
    pub fn new(entity: Entity, last_mutation_id: Option<String>) -> Self {
        Self {
            entity,
            last_mutation_id,
        }
    }

    /// Returns true if the entity is deleted.
    pub fn is_deleted(&self) -> bool {
        self.entity.sync_status == SyncStatus::Deleted
    }
}

/// Changes of one entity type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TypeChanges {
    /// Entities in ascending `updatedAt` order.
    pub entities: Vec<Entity>,
    /// True when more entities matched than the limit allowed.
    pub truncated: bool,
}

/// Result of a change query, read atomically with its cursor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    /// Changes per requested type.
    pub changes: BTreeMap<EntityType, TypeChanges>,
    /// Stamp issued while the query held its snapshot.
    pub cursor: Timestamp,
}

/// Per-entity persistence used by the reconciler, feed and resolver.
pub trait EntityRepository: Send + Sync {
    /// Looks an entity up by its client idempotency key.
    fn get_by_local_id(
        &self,
        entity_type: EntityType,
        local_id: &str,
    ) -> ServerResult<Option<StoredEntity>>;

    /// Looks an entity up by its server identifier.
    fn get_by_server_id(
        &self,
        entity_type: EntityType,
        server_id: &str,
    ) -> ServerResult<Option<StoredEntity>>;

    /// Writes `record` if the stored version equals `expected_version`
    /// (`None`: the entity must not exist yet). Stamps `updatedAt`.
    fn upsert(
        &self,
        record: StoredEntity,
        expected_version: Option<u64>,
    ) -> ServerResult<StoredEntity>;

    /// Replaces the payload and increments the version by one, if the
    /// stored version still equals `expected_version`.
    fn bump_version(
        &self,
        entity_type: EntityType,
        local_id: &str,
        expected_version: u64,
        payload: Payload,
        mutation_id: Option<String>,
    ) -> ServerResult<StoredEntity> {
        let current = self
            .get_by_local_id(entity_type, local_id)?
            .ok_or_else(|| ServerError::EntityNotFound {
                entity_type,
                local_id: local_id.to_string(),
            })?;
        let mut next = current;
        next.entity.payload = payload;
        next.entity.version = expected_version + 1;
        next.last_mutation_id = mutation_id;
        self.upsert(next, Some(expected_version))
    }

    /// Marks an entity deleted. Deleted entities leave the change feed and
    /// accept no further pushes.
    fn tombstone(&self, entity_type: EntityType, local_id: &str) -> ServerResult<StoredEntity>;

    /// Synced entities of each type with `updatedAt > since`, at most
    /// `limit` per type, plus a cursor issued atomically with the read.
    fn changed_since(
        &self,
        types: &[EntityType],
        since: Timestamp,
        limit: usize,
    ) -> ServerResult<ChangeSet>;

    /// Number of live (non-deleted) entities of a type.
    fn count(&self, entity_type: EntityType) -> ServerResult<usize>;

    /// Current server time, for responses.
    fn server_time(&self) -> Timestamp;
}

type Key = (EntityType, String);

#[derive(Default)]
struct Tables {
    by_local: HashMap<Key, StoredEntity>,
    by_server: HashMap<Key, String>,
}

/// In-memory repository over `parking_lot` maps.
pub struct MemoryRepository {
    tables: RwLock<Tables>,
    clock: ServerClock,
}

impl MemoryRepository {
    /// Creates an empty repository on the system clock.
    pub fn new() -> Self {
        Self::with_clock(ServerClock::default())
    }

    /// Creates an empty repository on the given clock.
    pub fn with_clock(clock: ServerClock) -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            clock,
        }
    }

    /// Number of stored entities, deleted ones included.
    pub fn len(&self) -> usize {
        self.tables.read().by_local.len()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityRepository for MemoryRepository {
    fn get_by_local_id(
        &self,
        entity_type: EntityType,
        local_id: &str,
    ) -> ServerResult<Option<StoredEntity>> {
        Ok(self
            .tables
            .read()
            .by_local
            .get(&(entity_type, local_id.to_string()))
            .cloned())
    }

    fn get_by_server_id(
        &self,
        entity_type: EntityType,
        server_id: &str,
    ) -> ServerResult<Option<StoredEntity>> {
        let tables = self.tables.read();
        Ok(tables
            .by_server
            .get(&(entity_type, server_id.to_string()))
            .and_then(|local_id| tables.by_local.get(&(entity_type, local_id.clone())))
            .cloned())
    }

    fn upsert(
        &self,
        mut record: StoredEntity,
        expected_version: Option<u64>,
    ) -> ServerResult<StoredEntity> {
        let entity_type = record.entity.entity_type;
        let key = (entity_type, record.entity.local_id.clone());
        let mut tables = self.tables.write();

        let current = tables.by_local.get(&key);
        let actual = current.map(|s| s.entity.version);
        if actual != expected_version {
            return Err(ServerError::VersionMismatch {
                local_id: key.1,
                expected: expected_version,
                actual,
            });
        }
        let previous_server_id = current.and_then(|s| s.entity.server_id.clone());

        if let Some(server_id) = &record.entity.server_id {
            let index_key = (entity_type, server_id.clone());
            if let Some(owner) = tables.by_server.get(&index_key) {
                if *owner != key.1 {
                    return Err(ServerError::DuplicateKey {
                        field: "serverId",
                        value: server_id.clone(),
                    });
                }
            }
        }

        record.entity.updated_at = self.clock.stamp();
        if let Some(old) = previous_server_id {
            tables.by_server.remove(&(entity_type, old));
        }
        if let Some(server_id) = &record.entity.server_id {
            tables
                .by_server
                .insert((entity_type, server_id.clone()), key.1.clone());
        }
        tables.by_local.insert(key, record.clone());
        Ok(record)
    }

    fn tombstone(&self, entity_type: EntityType, local_id: &str) -> ServerResult<StoredEntity> {
        let current = self
            .get_by_local_id(entity_type, local_id)?
            .ok_or_else(|| ServerError::EntityNotFound {
                entity_type,
                local_id: local_id.to_string(),
            })?;
        if current.is_deleted() {
            return Ok(current);
        }
        let expected = current.entity.version;
        let mut next = current;
        next.entity.sync_status = SyncStatus::Deleted;
        next.entity.version += 1;
        self.upsert(next, Some(expected))
    }

    fn changed_since(
        &self,
        types: &[EntityType],
        since: Timestamp,
        limit: usize,
    ) -> ServerResult<ChangeSet> {
        let tables = self.tables.read();
        let mut changes = BTreeMap::new();

        for &entity_type in types {
            let mut matching: Vec<&Entity> = tables
                .by_local
                .values()
                .map(|s| &s.entity)
                .filter(|e| {
                    e.entity_type == entity_type
                        && e.sync_status == SyncStatus::Synced
                        && e.updated_at > since
                })
                .collect();
            matching.sort_by_key(|e| e.updated_at);

            let truncated = matching.len() > limit;
            changes.insert(
                entity_type,
                TypeChanges {
                    entities: matching.into_iter().take(limit).cloned().collect(),
                    truncated,
                },
            );
        }

        // issued under the read lock: later writes stamp above it
        let cursor = self.clock.stamp();
        Ok(ChangeSet { changes, cursor })
    }

    fn count(&self, entity_type: EntityType) -> ServerResult<usize> {
        Ok(self
            .tables
            .read()
            .by_local
            .values()
            .filter(|s| s.entity.entity_type == entity_type && !s.is_deleted())
            .count())
    }

    fn server_time(&self) -> Timestamp {
        self.clock.wall_time().max(self.clock.last())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;
    use std::sync::Arc;

    fn post(content: &str) -> Payload {
        Payload::from_value(EntityType::Post, json!({ "content": content })).unwrap()
    }

    fn record(local_id: &str, server_id: &str) -> StoredEntity {
        StoredEntity::new(
            Entity::new(local_id, post(local_id))
                .with_server_id(server_id)
                .with_version(1)
                .with_status(SyncStatus::Synced),
            Some(format!("m-{local_id}")),
        )
    }

    fn repo() -> MemoryRepository {
        MemoryRepository::with_clock(ServerClock::new(ManualClock::new(1_000)))
    }

    #[test]
    fn insert_and_lookup() {
        let repo = repo();
        let stored = repo.upsert(record("L1", "S1"), None).unwrap();
        assert_eq!(stored.entity.updated_at, 1_000);

        let by_local = repo.get_by_local_id(EntityType::Post, "L1").unwrap().unwrap();
        let by_server = repo.get_by_server_id(EntityType::Post, "S1").unwrap().unwrap();
        assert_eq!(by_local, by_server);
        assert!(repo.get_by_local_id(EntityType::Group, "L1").unwrap().is_none());
        assert_eq!(repo.count(EntityType::Post).unwrap(), 1);
    }

    #[test]
    fn insert_requires_absence() {
        let repo = repo();
        repo.upsert(record("L1", "S1"), None).unwrap();
        assert!(matches!(
            repo.upsert(record("L1", "S2"), None),
            Err(ServerError::VersionMismatch {
                expected: None,
                actual: Some(1),
                ..
            })
        ));
    }

    #[test]
    fn server_id_is_unique() {
        let repo = repo();
        repo.upsert(record("L1", "S1"), None).unwrap();
        assert!(matches!(
            repo.upsert(record("L2", "S1"), None),
            Err(ServerError::DuplicateKey { .. })
        ));
    }

    #[test]
    fn bump_version_is_compare_and_swap() {
        let repo = repo();
        repo.upsert(record("L1", "S1"), None).unwrap();

        let bumped = repo
            .bump_version(EntityType::Post, "L1", 1, post("v2"), Some("m2".into()))
            .unwrap();
        assert_eq!(bumped.entity.version, 2);
        assert_eq!(bumped.entity.payload, post("v2"));
        assert_eq!(bumped.last_mutation_id.as_deref(), Some("m2"));
        assert!(bumped.entity.updated_at > 1_000);

        // a writer that read version 1 loses
        assert!(matches!(
            repo.bump_version(EntityType::Post, "L1", 1, post("stale"), None),
            Err(ServerError::VersionMismatch { .. })
        ));
        assert!(matches!(
            repo.bump_version(EntityType::Post, "nobody", 1, post("x"), None),
            Err(ServerError::EntityNotFound { .. })
        ));
    }

    #[test]
    fn tombstone_hides_from_feed_and_counts() {
        let repo = repo();
        repo.upsert(record("L1", "S1"), None).unwrap();
        let gone = repo.tombstone(EntityType::Post, "L1").unwrap();
        assert!(gone.is_deleted());
        assert_eq!(gone.entity.version, 2);
        assert_eq!(repo.count(EntityType::Post).unwrap(), 0);

        let set = repo.changed_since(&[EntityType::Post], 0, 10).unwrap();
        assert!(set.changes[&EntityType::Post].entities.is_empty());
        assert_eq!(repo.len(), 1);
    }

    #[test]
    fn changed_since_orders_limits_and_stamps_cursor() {
        let manual = Arc::new(ManualClock::new(100));
        let repo = MemoryRepository::with_clock(ServerClock::new(Arc::clone(&manual)));
        for (i, id) in ["A", "B", "C"].iter().enumerate() {
            manual.set(100 + i as u64 * 10);
            repo.upsert(record(id, &format!("S{id}")), None).unwrap();
        }

        let set = repo.changed_since(&[EntityType::Post], 100, 1).unwrap();
        let posts = &set.changes[&EntityType::Post];
        assert_eq!(posts.entities.len(), 1);
        assert_eq!(posts.entities[0].local_id, "B");
        assert!(posts.truncated);
        assert!(set.cursor > 120);

        let set = repo
            .changed_since(&[EntityType::Post, EntityType::User], 110, 10)
            .unwrap();
        assert_eq!(set.changes[&EntityType::Post].entities.len(), 1);
        assert!(!set.changes[&EntityType::Post].truncated);
        assert!(set.changes[&EntityType::User].entities.is_empty());
    }
}
