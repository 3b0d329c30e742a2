//! CLI command implementations.

pub mod compact;
pub mod entities;
pub mod queue;
pub mod status;

use clap::ValueEnum;
use offsync_client::{LocalStore, JOURNAL_FILE};
use serde::Serialize;
use std::path::Path;

/// Output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    /// Human-readable text.
    Text,
    /// Pretty-printed JSON.
    Json,
}

/// Opens an existing store; never creates one.
pub fn open_store(path: &Path) -> Result<LocalStore, Box<dyn std::error::Error>> {
    if !path.join(JOURNAL_FILE).exists() {
        return Err(format!("No offsync store found at {:?}", path).into());
    }
    Ok(LocalStore::open(path)?)
}

/// Prints `value` as JSON.
pub fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Shortens an id for table output.
pub fn short(id: &str) -> &str {
    match id.char_indices().nth(12) {
        Some((i, _)) => &id[..i],
        None => id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_ids() {
        assert_eq!(short("abc"), "abc");
        assert_eq!(short("0123456789abcdef"), "0123456789ab");
    }

    #[test]
    fn missing_store_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = open_store(dir.path()).err().unwrap();
        assert!(err.to_string().contains("No offsync store"));
        assert!(!dir.path().join(JOURNAL_FILE).exists());
    }
}
