//! Status command implementation.

use super::{open_store, print_json, Format};
use offsync_client::{LocalStore, StatusCounts};
use offsync_protocol::Timestamp;
use serde::Serialize;
use std::path::Path;
use tracing::info;

/// Store status.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    /// Store path.
    pub path: String,
    /// Journal size in bytes.
    pub journal_size: u64,
    /// Entity counts per sync status.
    pub entities: StatusCounts,
    /// Queued mutations.
    pub queued: usize,
    /// Queued mutations that will be sent.
    pub pending: usize,
    /// Queued mutations flagged stuck.
    pub stuck: usize,
    /// Change feed cursor.
    pub cursor: Timestamp,
    /// Last successful sync.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<Timestamp>,
}

/// Collects the status of an open store.
pub fn collect(path: &Path, store: &LocalStore) -> Result<StatusReport, Box<dyn std::error::Error>> {
    let queue = store.queue();
    let meta = store.entities().meta();
    Ok(StatusReport {
        path: path.display().to_string(),
        journal_size: store.journal_size()?,
        entities: store.entities().count_by_status(),
        queued: queue.len(),
        pending: queue.pending_len(),
        stuck: queue.stuck_entries().len(),
        cursor: meta.cursor,
        last_sync: meta.last_sync,
    })
}

/// Runs the status command.
pub fn run(path: &Path, format: Format) -> Result<(), Box<dyn std::error::Error>> {
    info!("Reading status of {:?}", path);
    let store = open_store(path)?;
    let report = collect(path, &store)?;

    match format {
        Format::Json => print_json(&report)?,
        Format::Text => {
            println!("offsync store at {}", report.path);
            println!();
            println!("Journal:  {} bytes", report.journal_size);
            println!("Cursor:   {}", report.cursor);
            match report.last_sync {
                Some(at) => println!("Last sync: {at}"),
                None => println!("Last sync: never"),
            }
            println!();
            println!("Entities:");
            println!("  synced:   {}", report.entities.synced);
            println!("  pending:  {}", report.entities.pending);
            println!("  conflict: {}", report.entities.conflict);
            println!("  deleted:  {}", report.entities.deleted);
            println!();
            println!("Queue:");
            println!("  queued:   {}", report.queued);
            println!("  pending:  {}", report.pending);
            println!("  stuck:    {}", report.stuck);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use offsync_protocol::{EntityType, Payload};
    use serde_json::json;

    #[test]
    fn status_of_a_fresh_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();
        let payload = Payload::from_value(EntityType::Post, json!({"content": "hi"})).unwrap();
        store.write(EntityType::Post, None, payload).unwrap();

        let report = collect(dir.path(), &store).unwrap();
        assert_eq!(report.entities.pending, 1);
        assert_eq!(report.queued, 1);
        assert_eq!(report.pending, 1);
        assert_eq!(report.stuck, 0);
        assert_eq!(report.cursor, 0);
        assert!(report.last_sync.is_none());
        assert!(report.journal_size > 0);
    }
}
