//! Commit Log
//!
//! The append-only, offset-indexed record store every node writes into.
//! Locally produced records and records replicated from peers land in the
//! same log; each record remembers which node first accepted it.
//!
//! A record is identified by the log instance that first accepted it and
//! its offset there. The instance id is generated once when a log is
//! created, so a node that comes back under the same name with an empty
//! data directory starts a fresh identity space instead of colliding with
//! the records of its previous life.

mod sqlite;

pub use sqlite::{LogConfig, SqliteLog};

use serde::{Deserialize, Serialize};

/// A single record in the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Opaque payload
    pub value: Vec<u8>,
    /// Position in the log that holds this copy
    pub offset: u64,
    /// Node that first accepted the record (empty before the first append)
    pub origin: String,
    /// Instance id of the log that first accepted the record
    pub origin_instance: String,
    /// Offset of the record in the origin node's log
    pub origin_offset: u64,
}

impl Record {
    /// Create a record that has not been appended anywhere yet.
    pub fn new(value: impl Into<Vec<u8>>) -> Self {
        Self {
            value: value.into(),
            offset: 0,
            origin: String::new(),
            origin_instance: String::new(),
            origin_offset: 0,
        }
    }

    /// Whether the record was produced locally rather than replicated.
    pub fn is_unstamped(&self) -> bool {
        self.origin.is_empty()
    }

    /// CRC32 over the fields that identify the record's content.
    pub fn checksum(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(self.origin.as_bytes());
        hasher.update(self.origin_instance.as_bytes());
        hasher.update(&self.origin_offset.to_be_bytes());
        hasher.update(&self.value);
        hasher.finalize()
    }
}

/// Errors returned by a commit log.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("offset out of range: {0}")]
    OffsetOutOfRange(u64),
    #[error("record {origin_instance}@{origin_offset} already present")]
    Duplicate {
        origin_instance: String,
        origin_offset: u64,
    },
    #[error("checksum mismatch at offset {0}")]
    Corrupt(u64),
    #[error("log is closed")]
    Closed,
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Highest record held from one instance of an origin's log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Watermark {
    pub instance: String,
    pub offset: u64,
}

/// Append-only, offset-indexed store.
///
/// Implementations must be safe to share between the network service and
/// every replication task.
pub trait CommitLog: Send + Sync {
    /// Append a record and return the offset it was stored at.
    ///
    /// Unstamped records are stamped with the log's own origin, its
    /// instance id and `origin_offset = offset`. Stamped records keep their
    /// origin and are rejected with [`LogError::Duplicate`] if a record with
    /// the same `(origin_instance, origin_offset)` is already present.
    fn append(&self, record: Record) -> Result<u64, LogError>;

    /// Read the record stored at `offset`.
    fn read(&self, offset: u64) -> Result<Record, LogError>;

    /// Offset the next append will be stored at.
    fn next_offset(&self) -> Result<u64, LogError>;

    /// Id of this log instance, stamped on every locally produced record.
    fn instance(&self) -> &str;

    /// Highest `origin_offset` held from the most recently replicated
    /// instance of `origin`.
    fn origin_watermark(&self, origin: &str) -> Result<Option<Watermark>, LogError>;

    /// Release the underlying storage. Further calls fail with [`LogError::Closed`].
    fn close(&self) -> Result<(), LogError>;
}
