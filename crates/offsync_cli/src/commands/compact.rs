//! Compact command implementation.

use super::{open_store, print_json, Format};
use offsync_client::CompactStats;
use serde::Serialize;
use std::path::Path;
use tracing::info;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DryRun {
    journal_size: u64,
    entities: usize,
    queued: usize,
}

/// Runs the compact command.
pub fn run(path: &Path, dry_run: bool, format: Format) -> Result<(), Box<dyn std::error::Error>> {
    info!("Compacting journal at {:?}", path);
    let store = open_store(path)?;

    if dry_run {
        let plan = DryRun {
            journal_size: store.journal_size()?,
            entities: store.entities().len(),
            queued: store.queue().len(),
        };
        return match format {
            Format::Json => print_json(&plan),
            Format::Text => {
                println!("Compacting journal at {:?}", path);
                println!("(dry run - no changes will be made)");
                println!();
                println!("  Journal size: {} bytes", plan.journal_size);
                println!("  Entities:     {}", plan.entities);
                println!("  Queued:       {}", plan.queued);
                Ok(())
            }
        };
    }

    let stats = store.compact()?;
    store.close()?;
    info!(
        "Compacted {:?}: {} records, {} -> {} bytes",
        path, stats.records, stats.before, stats.after
    );

    match format {
        Format::Json => print_json(&stats)?,
        Format::Text => print_stats(path, &stats),
    }
    Ok(())
}

fn print_stats(path: &Path, stats: &CompactStats) {
    println!("Compacted journal at {:?}", path);
    println!();
    println!("  Records written: {}", stats.records);
    println!("  Size before: {} bytes", stats.before);
    println!("  Size after:  {} bytes", stats.after);
    let saved = stats.before.saturating_sub(stats.after);
    println!(
        "  Space saved: {} bytes ({:.1}%)",
        saved,
        if stats.before > 0 {
            saved as f64 / stats.before as f64 * 100.0
        } else {
            0.0
        }
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use offsync_client::LocalStore;
    use offsync_protocol::{EntityType, Payload};
    use serde_json::json;

    #[test]
    fn compaction_keeps_state() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = LocalStore::open(dir.path()).unwrap();
            for i in 0..20 {
                let payload =
                    Payload::from_value(EntityType::Post, json!({"content": format!("v{i}")}))
                        .unwrap();
                store.write(EntityType::Post, Some("P1"), payload).unwrap();
            }
            store.close().unwrap();
        }
        let before = open_store(dir.path()).unwrap().journal_size().unwrap();

        run(dir.path(), true, Format::Text).unwrap();
        assert_eq!(open_store(dir.path()).unwrap().journal_size().unwrap(), before);

        run(dir.path(), false, Format::Json).unwrap();
        let store = open_store(dir.path()).unwrap();
        assert!(store.journal_size().unwrap() < before);
        assert_eq!(store.entities().len(), 1);
        assert_eq!(store.queue().len(), 1);
    }
}
