//! Queue commands: list, requeue and discard.

use super::{open_store, print_json, short, Format};
use offsync_client::{LocalStore, QueueEntry};
use std::path::Path;
use tracing::info;

/// Queue entries, optionally only the stuck ones, in queue order.
pub fn entries(store: &LocalStore, stuck_only: bool) -> Vec<QueueEntry> {
    if stuck_only {
        store.queue().stuck_entries()
    } else {
        store.queue().entries()
    }
}

/// Runs the queue listing.
pub fn list(path: &Path, stuck_only: bool, format: Format) -> Result<(), Box<dyn std::error::Error>> {
    info!("Listing queue of {:?}", path);
    let store = open_store(path)?;
    let entries = entries(&store, stuck_only);

    match format {
        Format::Json => print_json(&entries)?,
        Format::Text => {
            if entries.is_empty() {
                println!("Queue is empty");
                return Ok(());
            }
            println!(
                "{:>6}  {:<6}  {:<6}  {:<12}  {:>7}  {:>7}  {}",
                "ID", "TYPE", "OP", "LOCAL ID", "VERSION", "RETRIES", "STATE"
            );
            for entry in &entries {
                println!(
                    "{:>6}  {:<6}  {:<6}  {:<12}  {:>7}  {:>7}  {}",
                    entry.queue_id,
                    entry.entity_type,
                    entry.operation,
                    short(&entry.local_id),
                    entry.client_version,
                    entry.retries,
                    state_label(entry)
                );
                if let Some(error) = &entry.last_error {
                    println!("        last error: {error}");
                }
            }
        }
    }
    Ok(())
}

/// Listing label: stuck entries wait for an operator, sent ones may already
/// be on the server.
fn state_label(entry: &QueueEntry) -> &'static str {
    match (entry.stuck, entry.sent) {
        (true, _) => "stuck",
        (false, true) => "sent",
        (false, false) => "queued",
    }
}

/// Clears the stuck flag of an entry.
pub fn requeue(path: &Path, queue_id: u64, format: Format) -> Result<(), Box<dyn std::error::Error>> {
    info!("Requeuing entry {} in {:?}", queue_id, path);
    let store = open_store(path)?;
    let entry = store.queue().requeue(queue_id)?;
    store.close()?;
    report(&entry, "requeued", format)
}

/// Removes an entry without sending it.
pub fn discard(path: &Path, queue_id: u64, format: Format) -> Result<(), Box<dyn std::error::Error>> {
    info!("Discarding entry {} in {:?}", queue_id, path);
    let store = open_store(path)?;
    let entry = store.queue().discard(queue_id)?;
    store.close()?;
    report(&entry, "discarded", format)
}

fn report(entry: &QueueEntry, action: &str, format: Format) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        Format::Json => print_json(entry),
        Format::Text => {
            println!(
                "✓ Entry {} ({} {} {}) {action}",
                entry.queue_id, entry.operation, entry.entity_type, entry.local_id
            );
            Ok(())
        }
    }
}
