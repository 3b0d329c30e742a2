//! Local Mutation Queue.
//!
//! A durable FIFO of operations awaiting transmission. Entries leave the
//! queue only through `remove` (a settled push) or `discard` (an explicit
//! operator action); failures bump `retries` and eventually flag the entry
//! `stuck`, never dropping it.
//!
//! Ordering: entries for the same entity are always handed out in enqueue
//! order, at most one per batch, and never past an earlier stuck or in-flight
//! entry for that entity. Cross-entity order is FIFO but not load-bearing.

use crate::error::{SyncError, SyncResult};
use crate::journal::{Journal, JournalRecord, SharedJournal};
use crate::storage::InMemoryBackend;
use offsync_protocol::{now_millis, EntityType, Mutation, Operation, Timestamp};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A queued mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    /// Monotonically increasing queue position.
    pub queue_id: u64,
    /// Entity kind.
    pub entity_type: EntityType,
    /// Create or update.
    pub operation: Operation,
    /// Target entity.
    pub local_id: String,
    /// Full payload as written locally.
    pub payload: Value,
    /// Entity version known when the write happened.
    pub client_version: u64,
    /// Idempotency key of this mutation.
    pub mutation_id: String,
    /// Failed attempts so far.
    pub retries: u32,
    /// Flagged for manual intervention.
    pub stuck: bool,
    /// Handed to the transport at least once. The server may hold it even
    /// if no response came back.
    #[serde(default)]
    pub sent: bool,
    /// Last failure, if any.
    #[serde(default)]
    pub last_error: Option<String>,
    /// Enqueue time.
    pub enqueued_at: Timestamp,
}

impl QueueEntry {
    /// Builds the wire mutation, sent against `send_version`.
    pub fn to_mutation(&self, send_version: u64) -> Mutation {
        Mutation {
            local_id: self.local_id.clone(),
            operation: self.operation,
            client_version: send_version,
            mutation_id: Some(self.mutation_id.clone()),
            payload: self.payload.clone(),
        }
    }

    fn same_entity(&self, entity_type: EntityType, local_id: &str) -> bool {
        self.entity_type == entity_type && self.local_id == local_id
    }
}

#[derive(Default)]
struct QueueState {
    entries: BTreeMap<u64, QueueEntry>,
    claimed: HashSet<u64>,
    next_id: u64,
}

impl QueueState {
    fn watermark(&mut self, queue_id: u64) {
        self.next_id = self.next_id.max(queue_id + 1);
    }

    fn entry(&self, queue_id: u64) -> SyncResult<QueueEntry> {
        self.entries
            .get(&queue_id)
            .cloned()
            .ok_or(SyncError::QueueEntryNotFound(queue_id))
    }
}

/// Durable FIFO of pending mutations.
pub struct MutationQueue {
    journal: SharedJournal,
    state: RwLock<QueueState>,
}

impl MutationQueue {
    /// Creates an empty, non-persistent queue.
    pub fn in_memory() -> SyncResult<Self> {
        let (journal, records) = Journal::open(Box::new(InMemoryBackend::new()))?;
        Ok(Self::restore(Arc::new(Mutex::new(journal)), &records))
    }

    /// Rebuilds the queue from replayed journal records.
    pub(crate) fn restore(journal: SharedJournal, records: &[JournalRecord]) -> Self {
        let mut state = QueueState {
            next_id: 1,
            ..Default::default()
        };
        for record in records {
            match record {
                JournalRecord::QueuePut(entry) => {
                    state.watermark(entry.queue_id);
                    state.entries.insert(entry.queue_id, entry.clone());
                }
                JournalRecord::QueueRemove(queue_id) => {
                    state.watermark(*queue_id);
                    state.entries.remove(queue_id);
                }
                JournalRecord::Entity(_) | JournalRecord::Meta(_) => {}
            }
        }
        Self {
            journal,
            state: RwLock::new(state),
        }
    }

    /// Enqueues a mutation and returns its queue id.
    ///
    /// A write for an entity whose latest entry is still untouched is folded
    /// into that entry: the payload is replaced, the operation kept, and the
    /// position preserved. An entry that was ever sent is never touched, so
    /// its `mutationId` always names the payload the server may have seen.
    pub fn enqueue(
        &self,
        entity_type: EntityType,
        operation: Operation,
        local_id: &str,
        payload: Value,
        client_version: u64,
    ) -> SyncResult<u64> {
        let mut journal = self.journal.lock();
        let mut state = self.state.write();

        let latest = state
            .entries
            .values()
            .rev()
            .find(|e| e.same_entity(entity_type, local_id))
            .cloned();

        if let Some(mut entry) = latest {
            let untouched = !entry.stuck
                && !entry.sent
                && entry.retries == 0
                && !state.claimed.contains(&entry.queue_id);
            if untouched {
                entry.payload = payload;
                entry.mutation_id = Uuid::new_v4().to_string();
                journal.append(&JournalRecord::QueuePut(entry.clone()))?;
                debug!(queue_id = entry.queue_id, local_id = %local_id, "coalesced into queued entry");
                let queue_id = entry.queue_id;
                state.entries.insert(queue_id, entry);
                return Ok(queue_id);
            }
        }

        let queue_id = state.next_id;
        let entry = QueueEntry {
            queue_id,
            entity_type,
            operation,
            local_id: local_id.to_string(),
            payload,
            client_version,
            mutation_id: Uuid::new_v4().to_string(),
            retries: 0,
            stuck: false,
            sent: false,
            last_error: None,
            enqueued_at: now_millis(),
        };
        journal.append(&JournalRecord::QueuePut(entry.clone()))?;
        state.next_id += 1;
        state.entries.insert(queue_id, entry);
        debug!(queue_id, entity_type = %entity_type, local_id = %local_id, op = %operation, "enqueued");
        Ok(queue_id)
    }

    /// Returns up to `max_size` sendable entries, oldest first.
    pub fn peek_batch(&self, max_size: usize) -> Vec<QueueEntry> {
        let state = self.state.read();
        Self::select(&state, max_size)
    }

    /// Like `peek_batch`, but marks the entries in flight until released,
    /// removed, or the cycle ends.
    pub fn claim_batch(&self, max_size: usize) -> Vec<QueueEntry> {
        let mut state = self.state.write();
        let batch = Self::select(&state, max_size);
        state.claimed.extend(batch.iter().map(|e| e.queue_id));
        batch
    }

    fn select(state: &QueueState, max_size: usize) -> Vec<QueueEntry> {
        let mut blocked: HashSet<(EntityType, &str)> = HashSet::new();
        let mut batch = Vec::new();
        for entry in state.entries.values() {
            if batch.len() >= max_size {
                break;
            }
            let key = (entry.entity_type, entry.local_id.as_str());
            let eligible = !entry.stuck && !state.claimed.contains(&entry.queue_id);
            if blocked.insert(key) && eligible {
                batch.push(entry.clone());
            }
        }
        batch
    }

    /// Releases one in-flight entry.
    pub fn release(&self, queue_id: u64) {
        self.state.write().claimed.remove(&queue_id);
    }

    /// Releases every in-flight entry.
    pub fn release_all(&self) {
        self.state.write().claimed.clear();
    }

    /// Removes a settled entry.
    pub fn remove(&self, queue_id: u64) -> SyncResult<QueueEntry> {
        let mut journal = self.journal.lock();
        let mut state = self.state.write();
        let entry = state.entry(queue_id)?;
        journal.append(&JournalRecord::QueueRemove(queue_id))?;
        state.entries.remove(&queue_id);
        state.claimed.remove(&queue_id);
        Ok(entry)
    }

    /// Durably flags entries as sent. Called before the batch leaves, so a
    /// response lost to a crash still leaves the flag behind.
    pub fn mark_sent(&self, queue_ids: &[u64]) -> SyncResult<()> {
        let mut journal = self.journal.lock();
        let mut state = self.state.write();
        let mut updated = Vec::with_capacity(queue_ids.len());
        for queue_id in queue_ids {
            let mut entry = state.entry(*queue_id)?;
            if !entry.sent {
                entry.sent = true;
                updated.push(entry);
            }
        }
        if updated.is_empty() {
            return Ok(());
        }
        let records: Vec<JournalRecord> = updated
            .iter()
            .map(|e| JournalRecord::QueuePut(e.clone()))
            .collect();
        journal.append_all(&records)?;
        for entry in updated {
            state.entries.insert(entry.queue_id, entry);
        }
        Ok(())
    }

    /// Increments the retry counter and records the failure.
    ///
    /// Returns the new retry count. The entry stays queued.
    pub fn bump_retry(&self, queue_id: u64, error: &str) -> SyncResult<u32> {
        let entry = self.modify(queue_id, |entry| {
            entry.retries += 1;
            entry.last_error = Some(error.to_string());
        })?;
        Ok(entry.retries)
    }

    /// Flags an entry for manual intervention.
    pub fn mark_stuck(&self, queue_id: u64, reason: &str) -> SyncResult<()> {
        let entry = self.modify(queue_id, |entry| {
            entry.stuck = true;
            entry.last_error = Some(reason.to_string());
        })?;
        warn!(
            queue_id,
            local_id = %entry.local_id,
            retries = entry.retries,
            reason = %reason,
            "queue entry stuck"
        );
        Ok(())
    }

    /// Clears the stuck flag and retry count so the entry is sent again.
    pub fn requeue(&self, queue_id: u64) -> SyncResult<QueueEntry> {
        let entry = self.modify(queue_id, |entry| {
            entry.stuck = false;
            entry.retries = 0;
            entry.last_error = None;
        })?;
        info!(queue_id, local_id = %entry.local_id, "queue entry requeued");
        Ok(entry)
    }

    /// Removes an entry on operator request.
    pub fn discard(&self, queue_id: u64) -> SyncResult<QueueEntry> {
        let entry = self.remove(queue_id)?;
        info!(queue_id, local_id = %entry.local_id, "queue entry discarded");
        Ok(entry)
    }

    /// Removes every entry. Returns how many were removed.
    pub fn clear(&self) -> SyncResult<usize> {
        let mut journal = self.journal.lock();
        let mut state = self.state.write();
        let records: Vec<JournalRecord> = state
            .entries
            .keys()
            .map(|id| JournalRecord::QueueRemove(*id))
            .collect();
        journal.append_all(&records)?;
        state.entries.clear();
        state.claimed.clear();
        info!(removed = records.len(), "queue cleared");
        Ok(records.len())
    }

    /// Gets an entry.
    pub fn get(&self, queue_id: u64) -> Option<QueueEntry> {
        self.state.read().entries.get(&queue_id).cloned()
    }

    /// All entries, oldest first.
    pub fn entries(&self) -> Vec<QueueEntry> {
        self.state.read().entries.values().cloned().collect()
    }

    /// Entries flagged stuck, oldest first.
    pub fn stuck_entries(&self) -> Vec<QueueEntry> {
        self.state
            .read()
            .entries
            .values()
            .filter(|e| e.stuck)
            .cloned()
            .collect()
    }

    /// Number of entries, stuck ones included.
    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    /// Returns true if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of entries that will be sent (not stuck).
    pub fn pending_len(&self) -> usize {
        self.state
            .read()
            .entries
            .values()
            .filter(|e| !e.stuck)
            .count()
    }

    /// Returns true if an entry other than `except` targets the entity.
    pub fn has_entries_for(
        &self,
        entity_type: EntityType,
        local_id: &str,
        except: Option<u64>,
    ) -> bool {
        self.state
            .read()
            .entries
            .values()
            .any(|e| e.same_entity(entity_type, local_id) && Some(e.queue_id) != except)
    }

    /// Records describing the current state, for journal compaction.
    pub(crate) fn snapshot_records(&self) -> Vec<JournalRecord> {
        let state = self.state.read();
        let mut records: Vec<JournalRecord> = state
            .entries
            .values()
            .map(|e| JournalRecord::QueuePut(e.clone()))
            .collect();
        // keeps the id watermark when the newest entry is gone
        let highest = state.next_id.saturating_sub(1);
        if highest > 0 && !state.entries.contains_key(&highest) {
            records.push(JournalRecord::QueueRemove(highest));
        }
        records
    }

    fn modify<F>(&self, queue_id: u64, f: F) -> SyncResult<QueueEntry>
    where
        F: FnOnce(&mut QueueEntry),
    {
        let mut journal = self.journal.lock();
        let mut state = self.state.write();
        let mut entry = state.entry(queue_id)?;
        f(&mut entry);
        journal.append(&JournalRecord::QueuePut(entry.clone()))?;
        state.entries.insert(queue_id, entry.clone());
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn queue() -> MutationQueue {
        MutationQueue::in_memory().unwrap()
    }

    fn push(q: &MutationQueue, local_id: &str, op: Operation, content: &str) -> u64 {
        q.enqueue(
            EntityType::Post,
            op,
            local_id,
            json!({ "content": content }),
            0,
        )
        .unwrap()
    }

    #[test]
    fn enqueue_assigns_increasing_ids() {
        let q = queue();
        let a = push(&q, "A", Operation::Create, "a");
        let b = push(&q, "B", Operation::Create, "b");
        assert!(b > a);
        assert_eq!(q.len(), 2);
        let entry = q.get(a).unwrap();
        assert_eq!(entry.retries, 0);
        assert!(!entry.stuck);
        assert!(!entry.mutation_id.is_empty());
    }

    #[test]
    fn peek_is_fifo_and_bounded() {
        let q = queue();
        for id in ["A", "B", "C"] {
            push(&q, id, Operation::Create, id);
        }
        let batch = q.peek_batch(2);
        let ids: Vec<&str> = batch.iter().map(|e| e.local_id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B"]);
        // peeking does not claim
        assert_eq!(q.peek_batch(10).len(), 3);
    }

    #[test]
    fn untouched_entry_absorbs_later_write() {
        let q = queue();
        let first = push(&q, "A", Operation::Create, "v1");
        let original_mutation = q.get(first).unwrap().mutation_id;
        let second = push(&q, "A", Operation::Update, "v2");

        assert_eq!(first, second);
        assert_eq!(q.len(), 1);
        let entry = q.get(first).unwrap();
        assert_eq!(entry.operation, Operation::Create);
        assert_eq!(entry.payload["content"], "v2");
        assert_ne!(entry.mutation_id, original_mutation);
    }

    #[test]
    fn attempted_entry_is_not_coalesced() {
        let q = queue();
        let first = push(&q, "A", Operation::Create, "v1");
        q.bump_retry(first, "timeout").unwrap();
        let second = push(&q, "A", Operation::Update, "v2");
        assert_ne!(first, second);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn sent_entry_is_not_coalesced() {
        let q = queue();
        let first = push(&q, "A", Operation::Create, "v1");
        let sent_mutation = q.get(first).unwrap().mutation_id;
        q.claim_batch(10);
        q.mark_sent(&[first]).unwrap();
        // response never arrived; the claim is gone but the flag stays
        q.release_all();

        let second = push(&q, "A", Operation::Update, "v2");
        assert_ne!(first, second);
        let entry = q.get(first).unwrap();
        assert!(entry.sent);
        assert_eq!(entry.retries, 0);
        assert_eq!(entry.payload["content"], "v1");
        assert_eq!(entry.mutation_id, sent_mutation);
        assert_eq!(q.get(second).unwrap().operation, Operation::Update);
    }

    #[test]
    fn one_entry_per_entity_per_batch() {
        let q = queue();
        let create = push(&q, "A", Operation::Create, "v1");
        let claimed = q.claim_batch(10);
        assert_eq!(claimed.len(), 1);
        push(&q, "A", Operation::Update, "v2");
        push(&q, "B", Operation::Create, "b");

        // A's update waits behind the in-flight create
        let next = q.claim_batch(10);
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].local_id, "B");

        q.remove(create).unwrap();
        let next = q.claim_batch(10);
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].local_id, "A");
        assert_eq!(next[0].operation, Operation::Update);
    }

    #[test]
    fn stuck_entry_blocks_later_entries_for_same_entity() {
        let q = queue();
        let create = push(&q, "A", Operation::Create, "v1");
        q.mark_stuck(create, "validation failed").unwrap();
        push(&q, "A", Operation::Update, "v2");
        push(&q, "B", Operation::Create, "b");

        let batch = q.peek_batch(10);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].local_id, "B");
        assert_eq!(q.pending_len(), 2);
        assert_eq!(q.stuck_entries().len(), 1);

        q.requeue(create).unwrap();
        let batch = q.peek_batch(10);
        assert_eq!(batch[0].queue_id, create);
    }

    #[test]
    fn bump_retry_counts_and_records_error() {
        let q = queue();
        let id = push(&q, "A", Operation::Create, "v1");
        assert_eq!(q.bump_retry(id, "503").unwrap(), 1);
        assert_eq!(q.bump_retry(id, "504").unwrap(), 2);
        let entry = q.get(id).unwrap();
        assert_eq!(entry.last_error.as_deref(), Some("504"));
    }

    #[test]
    fn remove_and_discard() {
        let q = queue();
        let a = push(&q, "A", Operation::Create, "a");
        let b = push(&q, "B", Operation::Create, "b");
        q.remove(a).unwrap();
        q.discard(b).unwrap();
        assert!(q.is_empty());
        assert!(matches!(q.remove(a), Err(SyncError::QueueEntryNotFound(_))));
    }

    #[test]
    fn has_entries_for_excludes_given_entry() {
        let q = queue();
        let a = push(&q, "A", Operation::Create, "a");
        assert!(q.has_entries_for(EntityType::Post, "A", None));
        assert!(!q.has_entries_for(EntityType::Post, "A", Some(a)));
        assert!(!q.has_entries_for(EntityType::Group, "A", None));
    }

    #[test]
    fn restore_rebuilds_state_and_watermark() {
        let q = queue();
        let a = push(&q, "A", Operation::Create, "a");
        let b = push(&q, "B", Operation::Create, "b");
        q.bump_retry(a, "x").unwrap();
        q.remove(b).unwrap();

        let (journal, _) = Journal::open(Box::new(InMemoryBackend::new())).unwrap();
        let records = q.snapshot_records();
        let restored = MutationQueue::restore(Arc::new(Mutex::new(journal)), &records);
        assert_eq!(restored.len(), 1);
        assert_eq!(restored.get(a).unwrap().retries, 1);

        let c = push(&restored, "C", Operation::Create, "c");
        assert!(c > b);
    }

    #[test]
    fn clear_removes_everything() {
        let q = queue();
        push(&q, "A", Operation::Create, "a");
        push(&q, "B", Operation::Create, "b");
        assert_eq!(q.clear().unwrap(), 2);
        assert!(q.is_empty());
    }

    #[test]
    fn to_mutation_uses_send_version() {
        let q = queue();
        let id = push(&q, "A", Operation::Update, "a");
        let entry = q.get(id).unwrap();
        let m = entry.to_mutation(4);
        assert_eq!(m.client_version, 4);
        assert_eq!(m.mutation_id.as_deref(), Some(entry.mutation_id.as_str()));
    }
}
