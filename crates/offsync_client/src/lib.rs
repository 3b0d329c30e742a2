//! # offsync Client
//!
//! Client side of the offsync offline-first subsystem.
//!
//! This crate provides:
//! - `LocalStore`: an explicitly opened store owning the Entity Store, the
//!   Mutation Queue and sync metadata, persisted in a checksummed journal
//! - `SyncClient`: drains the queue in batches, applies per-item results,
//!   pulls the change feed and resolves conflicts
//! - Transport abstraction with mock, HTTP and in-process loopback variants
//! - Retry with exponential backoff and a stuck flag for entries that keep
//!   failing
//! - tokio helpers for periodic sync and timed cycles
//!
//! ## Key Invariants
//!
//! - Every store and queue change is journaled before it becomes visible
//! - Queue entries leave only by a settled push or an operator discard
//! - An update is never sent before the create of the same entity
//! - At most one sync cycle runs per client

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod auto_sync;
mod client;
mod config;
mod error;
mod http;
mod journal;
mod local;
mod queue;
pub mod storage;
mod store;
mod transport;

pub use client::{
    ClientStatus, SkipReason, SyncClient, SyncProgress, SyncReport, SyncState, SyncStats,
};
pub use config::{RetryConfig, SyncConfig};
pub use error::{StorageError, StorageResult, SyncError, SyncResult};
pub use http::{HttpClient, HttpTransport, LoopbackClient, LoopbackServer};
pub use journal::{JOURNAL_MAGIC, JOURNAL_VERSION};
pub use local::{CompactStats, LocalStore, JOURNAL_FILE};
pub use queue::{MutationQueue, QueueEntry};
pub use store::{new_local_id, ApplyOutcome, EntityStore, StatusCounts, SyncMeta};
pub use transport::{MockTransport, SyncTransport};
