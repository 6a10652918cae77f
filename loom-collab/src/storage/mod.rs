//! Durable append-only update logs.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐  append(bucket, update) → new length  ┌──────────────┐
//! │   Binding   │ ─────────────────────────────────────► │  UpdateLog   │
//! │ (per doc)   │ ◄───────────────────────────────────── │              │
//! └─────────────┘  read_from(bucket, clock) → entries    └──────┬───────┘
//!                                                               │
//!                                         ┌─────────────────────┴──────┐
//!                                         ▼                            ▼
//!                                   MemoryLog                    RocksLog
//!                                   (tests, single node)         (RocksDB, LZ4)
//! ```
//!
//! A bucket is addressed as `"{document}:updates"`. Entries are discrete
//! records numbered from 0 in arrival order and never rewritten, so an entry's
//! sequence number is also the clock value reached before it is applied.

pub mod memory;
pub mod rocks;

pub use memory::MemoryLog;
pub use rocks::{LogHead, RocksLog, StoreConfig};

/// Fixed suffix appended to a document identity to name its log bucket.
pub const UPDATES_SUFFIX: &str = ":updates";

/// Bucket name holding the update log of `document`.
pub fn bucket_name(document: &str) -> String {
    format!("{document}{UPDATES_SUFFIX}")
}

/// Append-only, per-bucket sequence of binary updates.
///
/// Implementations must make `append` atomic with respect to the returned
/// length: two concurrent appends never report the same length.
pub trait UpdateLog: Send + Sync {
    /// Append one entry and return the bucket's new length.
    fn append(&self, bucket: &str, update: &[u8]) -> Result<u64, StoreError>;

    /// All entries with sequence number `>= from`, in log order.
    fn read_from(&self, bucket: &str, from: u64) -> Result<Vec<Vec<u8>>, StoreError>;

    /// Number of entries in the bucket.
    fn len(&self, bucket: &str) -> Result<u64, StoreError>;

    fn is_empty(&self, bucket: &str) -> Result<bool, StoreError> {
        Ok(self.len(bucket)? == 0)
    }

    /// Delete every entry. Returns how many were removed.
    fn clear(&self, bucket: &str) -> Result<u64, StoreError>;
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed
    DeserializationError(String),
    /// Compression error
    CompressionError(String),
    /// A column family is missing from the opened database
    MissingColumnFamily(&'static str),
    /// The blocking I/O task could not complete
    TaskFailed(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
            StoreError::MissingColumnFamily(name) => write!(f, "Column family not found: {name}"),
            StoreError::TaskFailed(e) => write!(f, "Storage task failed: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_name_suffix() {
        assert_eq!(bucket_name("doc-a"), "doc-a:updates");
        assert_eq!(bucket_name(""), ":updates");
    }
}
