//! Byte-level storage backends for the client journal.
//!
//! Backends are opaque byte stores. They know nothing about records; the
//! journal owns framing and interpretation.

mod backend;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use file::FileBackend;
pub use memory::InMemoryBackend;
