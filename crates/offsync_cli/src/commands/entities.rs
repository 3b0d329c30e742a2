//! Entities command implementation.

use super::{open_store, print_json, short, Format};
use offsync_client::LocalStore;
use offsync_protocol::{Entity, EntityType, SyncStatus};
use std::path::Path;
use tracing::info;

/// Stored entities matching the filters, by type, oldest update first.
pub fn select(
    store: &LocalStore,
    entity_type: Option<EntityType>,
    status: Option<SyncStatus>,
) -> Vec<Entity> {
    let types: Vec<EntityType> = match entity_type {
        Some(t) => vec![t],
        None => EntityType::ALL.to_vec(),
    };
    types
        .into_iter()
        .flat_map(|t| store.entities().list(t))
        .filter(|e| status.map_or(true, |s| e.sync_status == s))
        .collect()
}

/// Runs the entities command.
pub fn run(
    path: &Path,
    entity_type: Option<EntityType>,
    status: Option<SyncStatus>,
    format: Format,
) -> Result<(), Box<dyn std::error::Error>> {
    info!("Listing entities in {:?}", path);
    let store = open_store(path)?;
    let entities = select(&store, entity_type, status);

    match format {
        Format::Json => print_json(&entities)?,
        Format::Text => {
            println!(
                "{:<6}  {:<12}  {:<12}  {:>7}  {:<8}  {}",
                "TYPE", "LOCAL ID", "SERVER ID", "VERSION", "STATUS", "UPDATED"
            );
            for e in &entities {
                println!(
                    "{:<6}  {:<12}  {:<12}  {:>7}  {:<8}  {}",
                    e.entity_type,
                    short(&e.local_id),
                    e.server_id.as_deref().map(short).unwrap_or("-"),
                    e.version,
                    e.sync_status,
                    e.updated_at
                );
            }
            println!();
            println!("{} entities", entities.len());
        }
    }
    Ok(())
}
