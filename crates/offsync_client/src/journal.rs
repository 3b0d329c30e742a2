//! Append-only record journal backing the local store.
//!
//! Every record is framed as:
//!
//! ```text
//! | magic "OSJL" (4) | version (2, LE) | kind (1) | length (4, LE) | CBOR payload | CRC32 (4, LE) |
//! ```
//!
//! The CRC covers the header and the payload. Replay stops cleanly at a torn
//! tail (incomplete header or payload) and drops it; a CRC mismatch on a
//! complete record is reported as corruption.

use crate::error::{StorageError, StorageResult};
use crate::queue::QueueEntry;
use crate::storage::StorageBackend;
use crate::store::SyncMeta;
use offsync_protocol::Entity;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// Magic bytes identifying a journal record.
pub const JOURNAL_MAGIC: [u8; 4] = *b"OSJL";

/// Current journal format version.
pub const JOURNAL_VERSION: u16 = 1;

/// magic (4) + version (2) + kind (1) + length (4)
const HEADER_SIZE: usize = 11;
const CRC_SIZE: usize = 4;

pub(crate) type SharedJournal = Arc<Mutex<Journal>>;

/// Kind byte of a journal record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    /// Full entity image.
    Entity = 1,
    /// Sync metadata (cursor, last sync).
    Meta = 2,
    /// Queue entry insert or replace.
    QueuePut = 3,
    /// Queue entry removal.
    QueueRemove = 4,
}

impl RecordKind {
    /// Converts a byte to a record kind.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Entity),
            2 => Some(Self::Meta),
            3 => Some(Self::QueuePut),
            4 => Some(Self::QueueRemove),
            _ => None,
        }
    }

    /// Converts the kind to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// A journal record.
#[derive(Debug, Clone, PartialEq)]
pub enum JournalRecord {
    /// Latest image of an entity.
    Entity(Entity),
    /// Latest sync metadata.
    Meta(SyncMeta),
    /// Latest image of a queue entry.
    QueuePut(QueueEntry),
    /// A queue entry left the queue.
    QueueRemove(u64),
}

impl JournalRecord {
    /// Returns the record kind.
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::Entity(_) => RecordKind::Entity,
            Self::Meta(_) => RecordKind::Meta,
            Self::QueuePut(_) => RecordKind::QueuePut,
            Self::QueueRemove(_) => RecordKind::QueueRemove,
        }
    }

    /// Encodes the record into a complete frame.
    pub fn encode(&self) -> StorageResult<Vec<u8>> {
        let payload = match self {
            Self::Entity(entity) => to_cbor(entity)?,
            Self::Meta(meta) => to_cbor(meta)?,
            Self::QueuePut(entry) => to_cbor(entry)?,
            Self::QueueRemove(queue_id) => to_cbor(queue_id)?,
        };
        let len = u32::try_from(payload.len())
            .map_err(|_| StorageError::Codec(format!("record too large: {}", payload.len())))?;

        let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
        frame.extend_from_slice(&JOURNAL_MAGIC);
        frame.extend_from_slice(&JOURNAL_VERSION.to_le_bytes());
        frame.push(self.kind().as_byte());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&payload);
        let crc = compute_crc32(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        Ok(frame)
    }

    fn decode_payload(kind: RecordKind, payload: &[u8]) -> StorageResult<Self> {
        Ok(match kind {
            RecordKind::Entity => Self::Entity(from_cbor(payload)?),
            RecordKind::Meta => Self::Meta(from_cbor(payload)?),
            RecordKind::QueuePut => Self::QueuePut(from_cbor(payload)?),
            RecordKind::QueueRemove => Self::QueueRemove(from_cbor(payload)?),
        })
    }
}

fn to_cbor<T: Serialize>(value: &T) -> StorageResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| StorageError::Codec(e.to_string()))?;
    Ok(buf)
}

fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> StorageResult<T> {
    ciborium::from_reader(bytes).map_err(|e| StorageError::Codec(e.to_string()))
}

/// Decodes every complete record in `data`.
///
/// Returns the records and the length of the valid prefix. Anything after the
/// valid prefix is a torn tail.
pub fn decode_all(data: &[u8]) -> StorageResult<(Vec<JournalRecord>, usize)> {
    let mut records = Vec::new();
    let mut offset = 0usize;

    while offset < data.len() {
        let rest = &data[offset..];
        if rest.len() < HEADER_SIZE {
            break;
        }
        if rest[0..4] != JOURNAL_MAGIC {
            return Err(StorageError::Corrupted(format!(
                "bad magic at offset {offset}"
            )));
        }
        let version = u16::from_le_bytes([rest[4], rest[5]]);
        if version != JOURNAL_VERSION {
            return Err(StorageError::Corrupted(format!(
                "unsupported journal version {version} at offset {offset}"
            )));
        }
        let kind = RecordKind::from_byte(rest[6]).ok_or_else(|| {
            StorageError::Corrupted(format!("unknown record kind {} at offset {offset}", rest[6]))
        })?;
        let len = u32::from_le_bytes([rest[7], rest[8], rest[9], rest[10]]) as usize;
        let frame_len = HEADER_SIZE + len + CRC_SIZE;
        if rest.len() < frame_len {
            break;
        }

        let body = &rest[..HEADER_SIZE + len];
        let stored = u32::from_le_bytes([
            rest[HEADER_SIZE + len],
            rest[HEADER_SIZE + len + 1],
            rest[HEADER_SIZE + len + 2],
            rest[HEADER_SIZE + len + 3],
        ]);
        let computed = compute_crc32(body);
        if stored != computed {
            return Err(StorageError::ChecksumMismatch {
                offset: offset as u64,
                expected: stored,
                actual: computed,
            });
        }

        records.push(JournalRecord::decode_payload(kind, &body[HEADER_SIZE..])?);
        offset += frame_len;
    }

    Ok((records, offset))
}

/// A framed record journal over a storage backend.
pub struct Journal {
    backend: Box<dyn StorageBackend>,
    closed: bool,
}

impl Journal {
    /// Opens a journal, replaying its records.
    ///
    /// A torn tail left by a crash mid-append is cut off so later appends
    /// start on a record boundary.
    pub fn open(mut backend: Box<dyn StorageBackend>) -> StorageResult<(Self, Vec<JournalRecord>)> {
        let data = backend.read_all()?;
        let (records, valid) = decode_all(&data)?;
        if valid < data.len() {
            warn!(
                valid_bytes = valid,
                torn_bytes = data.len() - valid,
                "dropping torn journal tail"
            );
            backend.replace(&data[..valid])?;
        }
        debug!(records = records.len(), "journal replayed");
        Ok((
            Self {
                backend,
                closed: false,
            },
            records,
        ))
    }

    /// Appends and flushes one record.
    pub fn append(&mut self, record: &JournalRecord) -> StorageResult<()> {
        self.append_all(std::slice::from_ref(record))
    }

    /// Appends several records with a single flush.
    pub fn append_all(&mut self, records: &[JournalRecord]) -> StorageResult<()> {
        if self.closed {
            return Err(StorageError::Closed);
        }
        let mut buf = Vec::new();
        for record in records {
            buf.extend_from_slice(&record.encode()?);
        }
        self.backend.append(&buf)?;
        self.backend.flush()
    }

    /// Atomically rewrites the journal as a snapshot of `records`.
    pub fn compact(&mut self, records: &[JournalRecord]) -> StorageResult<()> {
        if self.closed {
            return Err(StorageError::Closed);
        }
        let before = self.backend.size()?;
        let mut buf = Vec::new();
        for record in records {
            buf.extend_from_slice(&record.encode()?);
        }
        self.backend.replace(&buf)?;
        debug!(before, after = buf.len(), "journal compacted");
        Ok(())
    }

    /// Re-reads every record currently in the backend.
    pub fn replay(&self) -> StorageResult<Vec<JournalRecord>> {
        let data = self.backend.read_all()?;
        Ok(decode_all(&data)?.0)
    }

    /// Current size in bytes.
    pub fn size(&self) -> StorageResult<u64> {
        self.backend.size()
    }

    /// Returns true once closed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Syncs and closes the journal. Later writes fail with `Closed`.
    pub fn close(&mut self) -> StorageResult<()> {
        if !self.closed {
            self.backend.sync()?;
            self.closed = true;
        }
        Ok(())
    }
}

/// Computes CRC32 checksum for data (IEEE polynomial).
pub fn compute_crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}
