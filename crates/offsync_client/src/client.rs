//! Sync client state machine.
//!
//! `SyncClient` drains the Mutation Queue in batches, pushes them to the
//! reconciler, applies the per-item results to the Entity Store and pulls the
//! change feed. At most one cycle runs at a time; a `sync_now` issued while
//! another cycle is running returns immediately with a skipped report.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::local::LocalStore;
use crate::queue::QueueEntry;
use crate::store::ApplyOutcome;
use crate::transport::SyncTransport;
use offsync_protocol::{
    now_millis, BatchRequest, BatchResponse, ChangesRequest, ConflictRecord, Entity, EntityType,
    ItemOutcome, Resolution, ResolveRequest, SettledItem, SyncStatus, Timestamp,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// The current state of the sync client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// No cycle has run yet.
    Idle,
    /// Pushing queued mutations.
    Pushing,
    /// Pulling the change feed.
    Pulling,
    /// The last cycle completed.
    Synced,
    /// The last cycle failed.
    Error,
    /// Waiting before retrying a failed cycle.
    RetryWait,
}

impl SyncState {
    /// Returns true while a cycle is running.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SyncState::Pushing | SyncState::Pulling | SyncState::RetryWait
        )
    }
}

/// Statistics about sync operations.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Cycles completed.
    pub cycles_completed: u64,
    /// Items settled as created or updated.
    pub items_synced: u64,
    /// Conflicts reported by the reconciler.
    pub conflicts_encountered: u64,
    /// Item-level errors.
    pub item_errors: u64,
    /// Entities received from the change feed.
    pub entities_pulled: u64,
    /// Cycle retries.
    pub retries: u64,
    /// Completion of the last successful cycle.
    pub last_sync_time: Option<Instant>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// Why `sync_now` did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The transport reports no connectivity.
    Offline,
    /// Another cycle is running.
    AlreadyRunning,
}

/// Outcome of one sync cycle.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    /// Items settled as created or updated.
    pub synced: usize,
    /// Conflicts raised in this cycle.
    pub conflicts: Vec<ConflictRecord>,
    /// Item-level errors.
    pub errors: usize,
    /// Queue entries flagged stuck in this cycle.
    pub newly_stuck: Vec<u64>,
    /// Entities received from the change feed.
    pub pulled: usize,
    /// Set when the cycle did not run.
    pub skipped: Option<SkipReason>,
    /// Wall time of the cycle.
    pub duration: Duration,
}

impl SyncReport {
    fn skipped(reason: SkipReason) -> Self {
        Self {
            skipped: Some(reason),
            ..Default::default()
        }
    }

    /// Returns true if the cycle did not run.
    pub fn is_skipped(&self) -> bool {
        self.skipped.is_some()
    }
}

/// Progress of the running cycle's push phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncProgress {
    /// Sendable entries when the cycle started.
    pub total: usize,
    /// Entries handled so far.
    pub completed: usize,
}

impl SyncProgress {
    /// Completed share in `0.0..=1.0`.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            (self.completed.min(self.total) as f64) / (self.total as f64)
        }
    }
}

/// Snapshot for a sync indicator.
#[derive(Debug, Clone)]
pub struct ClientStatus {
    /// Client state.
    pub state: SyncState,
    /// Whether the transport is connected.
    pub connected: bool,
    /// Queue entries that will be sent.
    pub pending: usize,
    /// Queue entries awaiting manual intervention.
    pub stuck: usize,
    /// Entities awaiting conflict resolution.
    pub conflicts: usize,
    /// Completion time of the last successful cycle.
    pub last_sync: Option<Timestamp>,
    /// Last error message.
    pub last_error: Option<String>,
    /// Change feed cursor.
    pub cursor: Timestamp,
}

/// The sync client.
pub struct SyncClient<T: SyncTransport> {
    config: SyncConfig,
    transport: Arc<T>,
    store: Arc<LocalStore>,
    state: RwLock<SyncState>,
    stats: RwLock<SyncStats>,
    progress: RwLock<SyncProgress>,
    conflicts: RwLock<Vec<ConflictRecord>>,
    cycle: Mutex<()>,
    running: Mutex<bool>,
    cancelled: AtomicBool,
}

impl<T: SyncTransport> SyncClient<T> {
    /// Creates a new sync client over an opened store.
    pub fn new(config: SyncConfig, transport: T, store: Arc<LocalStore>) -> Self {
        Self {
            config,
            transport: Arc::new(transport),
            store,
            state: RwLock::new(SyncState::Idle),
            stats: RwLock::new(SyncStats::default()),
            progress: RwLock::new(SyncProgress::default()),
            conflicts: RwLock::new(Vec::new()),
            cycle: Mutex::new(()),
            running: Mutex::new(false),
            cancelled: AtomicBool::new(false),
        }
    }

    /// The configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// The transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// The local store.
    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    /// Gets the current state.
    pub fn state(&self) -> SyncState {
        *self.state.read()
    }

    /// Gets the current stats.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Progress of the running (or last) cycle.
    pub fn progress(&self) -> SyncProgress {
        *self.progress.read()
    }

    /// Returns true if the transport is connected.
    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Returns true if sendable entries are queued.
    pub fn has_pending_work(&self) -> bool {
        self.store.queue().pending_len() > 0
    }

    /// Conflicts raised since startup and not yet resolved.
    pub fn unresolved_conflicts(&self) -> Vec<ConflictRecord> {
        self.conflicts.read().clone()
    }

    /// Status snapshot.
    pub fn status(&self) -> ClientStatus {
        let queue = self.store.queue();
        let entities = self.store.entities();
        ClientStatus {
            state: self.state(),
            connected: self.is_connected(),
            pending: queue.pending_len(),
            stuck: queue.stuck_entries().len(),
            conflicts: entities.count_by_status().conflict,
            last_sync: entities.last_sync(),
            last_error: self.stats.read().last_error.clone(),
            cursor: entities.cursor(),
        }
    }

    /// Cancels any ongoing sync operation at the next batch boundary.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Resets the cancelled flag.
    pub fn reset_cancel(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }

    /// Cancels the cycle in flight, if any. Returns false, leaving no flag
    /// behind, when nothing was running.
    pub fn cancel_running(&self) -> bool {
        let running = self.running.lock();
        if *running {
            self.cancel();
        }
        *running
    }

    fn begin_cycle(&self) {
        let mut running = self.running.lock();
        *running = true;
        self.reset_cancel();
    }

    // a cancel aimed at this cycle must not leak into the next one
    fn end_cycle(&self) {
        let mut running = self.running.lock();
        *running = false;
        self.reset_cancel();
    }

    fn check_cancelled(&self) -> SyncResult<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn set_state(&self, state: SyncState) {
        *self.state.write() = state;
    }

    /// Runs one sync cycle: push every sendable queue entry, then pull.
    ///
    /// Returns a skipped report when offline or when another cycle is
    /// running. A batch-level failure stops the cycle and is returned; the
    /// batches settled before it stay settled.
    pub fn sync_now(&self) -> SyncResult<SyncReport> {
        if !self.transport.is_connected() {
            debug!("offline, sync skipped");
            return Ok(SyncReport::skipped(SkipReason::Offline));
        }
        let Some(_cycle) = self.cycle.try_lock() else {
            debug!("sync already in flight, skipped");
            return Ok(SyncReport::skipped(SkipReason::AlreadyRunning));
        };

        let start = Instant::now();
        self.begin_cycle();
        let mut report = SyncReport::default();
        let result = self.run_cycle(&mut report);
        self.store.queue().release_all();
        self.end_cycle();
        report.duration = start.elapsed();

        {
            let mut stats = self.stats.write();
            stats.items_synced += report.synced as u64;
            stats.conflicts_encountered += report.conflicts.len() as u64;
            stats.item_errors += report.errors as u64;
            stats.entities_pulled += report.pulled as u64;
        }

        match result {
            Ok(()) => {
                self.set_state(SyncState::Synced);
                let mut stats = self.stats.write();
                stats.cycles_completed += 1;
                stats.last_sync_time = Some(Instant::now());
                stats.last_error = None;
                info!(
                    synced = report.synced,
                    conflicts = report.conflicts.len(),
                    errors = report.errors,
                    stuck = report.newly_stuck.len(),
                    pulled = report.pulled,
                    elapsed_ms = report.duration.as_millis() as u64,
                    "sync cycle complete"
                );
                Ok(report)
            }
            Err(e) => {
                self.handle_error(&e);
                Err(e)
            }
        }
    }

    /// Performs a sync with retry on transient errors.
    pub fn sync_with_retry(&self) -> SyncResult<SyncReport> {
        let retry_config = &self.config.retry;
        let mut last_error = None;

        for attempt in 0..retry_config.max_attempts {
            if attempt > 0 {
                self.set_state(SyncState::RetryWait);
                let delay = retry_config.delay_for_attempt(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying sync");
                std::thread::sleep(delay);

                self.stats.write().retries += 1;
            }

            self.check_cancelled()?;

            match self.sync_now() {
                Ok(report) => return Ok(report),
                Err(e) => {
                    if e.is_retryable() && attempt + 1 < retry_config.max_attempts {
                        last_error = Some(e);
                        continue;
                    }
                    return Err(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| SyncError::Protocol("no sync attempts made".into())))
    }

    /// Pulls the change feed until no type is truncated.
    ///
    /// Returns the number of entities received, or zero when a cycle is
    /// already running.
    pub fn pull(&self) -> SyncResult<usize> {
        let Some(_cycle) = self.cycle.try_lock() else {
            return Ok(0);
        };
        self.begin_cycle();
        let result = self.pull_pages();
        self.end_cycle();
        match result {
            Ok(pulled) => {
                self.set_state(SyncState::Synced);
                self.stats.write().entities_pulled += pulled as u64;
                Ok(pulled)
            }
            Err(e) => {
                self.handle_error(&e);
                Err(e)
            }
        }
    }

    /// Resolves a conflict and writes the settled entity locally.
    pub fn resolve_conflict(
        &self,
        record: &ConflictRecord,
        resolution: Resolution,
    ) -> SyncResult<Entity> {
        let request = ResolveRequest::for_conflict(record, resolution)?;
        self.send_resolution(request)
    }

    /// Resolves the conflict on a locally flagged entity.
    ///
    /// Works without the original `ConflictRecord`, e.g. after a restart.
    pub fn resolve_entity(
        &self,
        entity_type: EntityType,
        local_id: &str,
        resolution: Resolution,
    ) -> SyncResult<Entity> {
        let entity = self
            .store
            .entities()
            .get(entity_type, local_id)
            .ok_or_else(|| SyncError::EntityNotFound {
                entity_type,
                local_id: local_id.to_string(),
            })?;
        let data = match resolution {
            Resolution::Server => None,
            Resolution::Client | Resolution::Merge => Some(entity.payload.to_value()?),
        };
        self.send_resolution(ResolveRequest {
            entity_type,
            local_id: local_id.to_string(),
            server_id: entity.server_id,
            resolution,
            data,
        })
    }

    fn send_resolution(&self, request: ResolveRequest) -> SyncResult<Entity> {
        let _cycle = self.cycle.lock();
        let response = self.transport.resolve_conflict(&request)?;
        if response.entity.local_id != request.local_id
            || response.entity.entity_type != request.entity_type
        {
            return Err(SyncError::Protocol(format!(
                "resolution for {} {} returned {} {}",
                request.entity_type,
                request.local_id,
                response.entity.entity_type,
                response.entity.local_id
            )));
        }

        let more_pending =
            self.store
                .queue()
                .has_entries_for(request.entity_type, &request.local_id, None);
        let settled = self
            .store
            .entities()
            .apply_settled(response.entity, more_pending)?;
        self.conflicts.write().retain(|c| {
            !(c.entity_type == request.entity_type && c.local_id == request.local_id)
        });
        info!(
            entity_type = %request.entity_type,
            local_id = %request.local_id,
            resolution = %response.resolution,
            version = settled.version,
            "conflict resolved"
        );
        Ok(settled)
    }

    fn run_cycle(&self, report: &mut SyncReport) -> SyncResult<()> {
        self.set_state(SyncState::Pushing);
        let queue = self.store.queue();
        *self.progress.write() = SyncProgress {
            total: queue.pending_len(),
            completed: 0,
        };

        loop {
            self.check_cancelled()?;
            let claimed = queue.claim_batch(self.config.batch_size);
            if claimed.is_empty() {
                break;
            }

            let mut by_type: BTreeMap<EntityType, Vec<QueueEntry>> = BTreeMap::new();
            for entry in claimed {
                by_type.entry(entry.entity_type).or_default().push(entry);
            }
            for (entity_type, entries) in by_type {
                let handled = entries.len();
                self.push_entries(entity_type, entries, report)?;
                self.progress.write().completed += handled;
            }
        }

        self.store.entities().set_last_sync(now_millis())?;

        if self.config.pull_after_push {
            self.check_cancelled()?;
            report.pulled = self.pull_pages()?;
        }
        Ok(())
    }

    /// Pushes one type's share of a claimed batch and applies the results.
    fn push_entries(
        &self,
        entity_type: EntityType,
        entries: Vec<QueueEntry>,
        report: &mut SyncReport,
    ) -> SyncResult<()> {
        let queue = self.store.queue();
        let entities = self.store.entities();

        let mut sendable = Vec::with_capacity(entries.len());
        for entry in entries {
            let local = entities.get(entity_type, &entry.local_id);
            match local.as_ref().map(|e| e.sync_status) {
                // held until the conflict is resolved
                Some(SyncStatus::Conflict) => {
                    debug!(queue_id = entry.queue_id, local_id = %entry.local_id, "entity in conflict, entry held");
                }
                Some(SyncStatus::Deleted) => {
                    queue.mark_stuck(entry.queue_id, "entity deleted locally")?;
                    report.newly_stuck.push(entry.queue_id);
                }
                _ => {
                    let known = local.map_or(0, |e| e.version);
                    sendable.push((entry, known));
                }
            }
        }
        if sendable.is_empty() {
            return Ok(());
        }

        let mutations = sendable
            .iter()
            .map(|(entry, known)| entry.to_mutation(entry.client_version.max(*known)))
            .collect();
        let request = BatchRequest::new(entity_type, mutations);
        let queue_ids: Vec<u64> = sendable.iter().map(|(entry, _)| entry.queue_id).collect();
        queue.mark_sent(&queue_ids)?;
        debug!(entity_type = %entity_type, items = sendable.len(), "pushing batch");

        let response = match self.transport.push_batch(&request) {
            Ok(response) => response,
            Err(e) => {
                if e.is_batch_failure() {
                    let reason = e.to_string();
                    for (entry, _) in &sendable {
                        self.record_failure(entry, &reason, report)?;
                    }
                    warn!(entity_type = %entity_type, items = sendable.len(), error = %e, "batch push failed");
                }
                return Err(e);
            }
        };

        self.apply_response(entity_type, &sendable, response, report)
    }

    fn apply_response(
        &self,
        entity_type: EntityType,
        sendable: &[(QueueEntry, u64)],
        response: BatchResponse,
        report: &mut SyncReport,
    ) -> SyncResult<()> {
        let queue = self.store.queue();
        let entities = self.store.entities();
        let mut answered = HashSet::new();

        for outcome in response.into_outcomes() {
            let Some((entry, _)) = sendable.get(outcome.index()) else {
                warn!(index = outcome.index(), "response item out of range");
                continue;
            };
            if outcome.local_id() != entry.local_id || !answered.insert(outcome.index()) {
                warn!(index = outcome.index(), local_id = %outcome.local_id(), "response item does not match request");
                continue;
            }

            match outcome {
                ItemOutcome::Created(item) | ItemOutcome::Updated(item) => {
                    self.settle(entity_type, entry, &item)?;
                    report.synced += 1;
                }
                ItemOutcome::Conflict(item) => {
                    let record = item.conflict;
                    entities.mark_conflict(entity_type, &entry.local_id)?;
                    queue.remove(entry.queue_id)?;
                    warn!(
                        entity_type = %entity_type,
                        local_id = %entry.local_id,
                        client_version = record.client_version,
                        server_version = record.server_version,
                        "version conflict"
                    );
                    {
                        let mut open = self.conflicts.write();
                        open.retain(|c| {
                            !(c.entity_type == record.entity_type && c.local_id == record.local_id)
                        });
                        open.push(record.clone());
                    }
                    report.conflicts.push(record);
                }
                ItemOutcome::Error(item) => {
                    report.errors += 1;
                    if item.kind.retryable() {
                        self.record_failure(entry, &item.error, report)?;
                    } else {
                        queue.mark_stuck(entry.queue_id, &format!("{:?}: {}", item.kind, item.error))?;
                        report.newly_stuck.push(entry.queue_id);
                    }
                }
            }
        }

        for (index, (entry, _)) in sendable.iter().enumerate() {
            if !answered.contains(&index) {
                self.record_failure(entry, "no result in batch response", report)?;
            }
        }
        Ok(())
    }

    /// Writes a created/updated result, then dequeues the entry.
    fn settle(&self, entity_type: EntityType, entry: &QueueEntry, item: &SettledItem) -> SyncResult<()> {
        let queue = self.store.queue();
        let more_pending = queue.has_entries_for(entity_type, &entry.local_id, Some(entry.queue_id));
        match self.store.entities().apply_push_result(
            entity_type,
            &entry.local_id,
            &item.server_id,
            item.version,
            more_pending,
        ) {
            Ok(_) | Err(SyncError::EntityNotFound { .. }) => {}
            Err(e) => return Err(e),
        }
        queue.remove(entry.queue_id)?;
        debug!(
            local_id = %entry.local_id,
            server_id = %item.server_id,
            version = item.version,
            applied = item.applied,
            "item settled"
        );
        Ok(())
    }

    fn record_failure(
        &self,
        entry: &QueueEntry,
        reason: &str,
        report: &mut SyncReport,
    ) -> SyncResult<()> {
        let queue = self.store.queue();
        let retries = queue.bump_retry(entry.queue_id, reason)?;
        if retries >= self.config.max_retries {
            queue.mark_stuck(
                entry.queue_id,
                &format!("gave up after {retries} attempts: {reason}"),
            )?;
            report.newly_stuck.push(entry.queue_id);
        }
        Ok(())
    }

    fn pull_pages(&self) -> SyncResult<usize> {
        self.set_state(SyncState::Pulling);
        let entities = self.store.entities();
        let mut pulled = 0;
        let mut applied = 0;

        loop {
            self.check_cancelled()?;
            let since = entities.cursor();
            let request = ChangesRequest::since(since)
                .with_types(self.config.pull_types.clone())
                .with_limit(self.config.pull_limit);
            let page = self.transport.pull_changes(&request)?;

            for entity in page.changes.into_values().flatten() {
                pulled += 1;
                if matches!(
                    entities.apply_remote(entity)?,
                    ApplyOutcome::Inserted | ApplyOutcome::Updated
                ) {
                    applied += 1;
                }
            }

            if page.cursor > since {
                entities.set_cursor(page.cursor)?;
            }
            if !page.has_more {
                break;
            }
            if page.cursor <= since {
                warn!(cursor = page.cursor, "change feed cursor did not advance");
                break;
            }
        }

        debug!(pulled, applied, cursor = entities.cursor(), "pull complete");
        Ok(pulled)
    }

    fn handle_error(&self, error: &SyncError) {
        if matches!(error, SyncError::Cancelled) {
            info!("sync cycle cancelled");
            self.set_state(SyncState::Idle);
            return;
        }
        warn!(error = %error, "sync cycle failed");
        self.set_state(SyncState::Error);
        self.stats.write().last_error = Some(error.to_string());
    }
}
