//! offsync CLI
//!
//! Operator tools for a client store directory.
//!
//! # Commands
//!
//! - `status` - Entity counts, queue depth and sync metadata
//! - `queue` - List queued mutations
//! - `requeue` - Clear the stuck flag of a queue entry
//! - `discard` - Drop a queue entry
//! - `entities` - List stored entities
//! - `compact` - Rewrite the journal as a snapshot

mod commands;

use clap::{Parser, Subcommand};
use commands::Format;
use offsync_protocol::{EntityType, SyncStatus};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// offsync client store tools.
#[derive(Parser)]
#[command(name = "offsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the store directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    /// Output format
    #[arg(global = true, short, long, value_enum, default_value_t = Format::Text)]
    format: Format,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show entity counts, queue depth and sync metadata
    Status,

    /// List queued mutations
    Queue {
        /// Only entries flagged for manual intervention
        #[arg(short, long)]
        stuck: bool,
    },

    /// Clear the stuck flag of a queue entry so the next sync retries it
    Requeue {
        /// Queue id
        queue_id: u64,
    },

    /// Drop a queue entry without sending it
    Discard {
        /// Queue id
        queue_id: u64,
    },

    /// List stored entities
    Entities {
        /// Entity type (post, group, user)
        #[arg(short = 't', long = "type")]
        entity_type: Option<EntityType>,

        /// Sync status (synced, pending, conflict, deleted)
        #[arg(short, long)]
        status: Option<SyncStatus>,
    },

    /// Rewrite the journal as a snapshot of the current state
    Compact {
        /// Dry run - show what would be done
        #[arg(short, long)]
        dry_run: bool,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let format = cli.format;
    match cli.command {
        Commands::Status => {
            let path = cli.path.ok_or("Store path required for status")?;
            commands::status::run(&path, format)?;
        }
        Commands::Queue { stuck } => {
            let path = cli.path.ok_or("Store path required for queue")?;
            commands::queue::list(&path, stuck, format)?;
        }
        Commands::Requeue { queue_id } => {
            let path = cli.path.ok_or("Store path required for requeue")?;
            commands::queue::requeue(&path, queue_id, format)?;
        }
        Commands::Discard { queue_id } => {
            let path = cli.path.ok_or("Store path required for discard")?;
            commands::queue::discard(&path, queue_id, format)?;
        }
        Commands::Entities {
            entity_type,
            status,
        } => {
            let path = cli.path.ok_or("Store path required for entities")?;
            commands::entities::run(&path, entity_type, status, format)?;
        }
        Commands::Compact { dry_run } => {
            let path = cli.path.ok_or("Store path required for compact")?;
            commands::compact::run(&path, dry_run, format)?;
        }
        Commands::Version => {
            println!("offsync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("offsync protocol v{}", offsync_protocol::PROTOCOL_VERSION);
        }
    }

    Ok(())
}
