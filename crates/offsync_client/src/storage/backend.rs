//! Storage backend trait definition.

use crate::error::StorageResult;

/// A low-level append-only byte store.
///
/// # Invariants
///
/// - `append` returns the offset where data was written
/// - `read_all` returns every byte appended since the last `replace`
/// - `flush` pushes appended data to the OS; `sync` makes it durable
/// - `replace` swaps the whole content atomically: a crash leaves either the
///   old or the new bytes, never a mix
pub trait StorageBackend: Send + Sync {
    /// Reads the full content.
    fn read_all(&self) -> StorageResult<Vec<u8>>;

    /// Appends data to the end of the storage.
    ///
    /// Returns the offset where the data was written.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Flushes pending writes to the OS.
    fn flush(&mut self) -> StorageResult<()>;

    /// Syncs data and metadata to durable storage.
    fn sync(&mut self) -> StorageResult<()>;

    /// Returns the current size in bytes.
    fn size(&self) -> StorageResult<u64>;

    /// Atomically replaces the whole content with `data`.
    fn replace(&mut self, data: &[u8]) -> StorageResult<()>;
}
