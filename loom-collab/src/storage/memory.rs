//! In-memory update log.
//!
//! Shared between relays in one process it behaves like a single blob store
//! seen by several server processes, which is what the relay tests rely on.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;

use super::{StoreError, UpdateLog};

/// Process-local [`UpdateLog`].
#[derive(Debug, Default)]
pub struct MemoryLog {
    buckets: RwLock<HashMap<String, Vec<Vec<u8>>>>,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent appends fail, to exercise error paths.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent reads fail.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn buckets(&self) -> Vec<String> {
        self.buckets.read().keys().cloned().collect()
    }
}

impl UpdateLog for MemoryLog {
    fn append(&self, bucket: &str, update: &[u8]) -> Result<u64, StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::DatabaseError("writes disabled".into()));
        }
        let mut buckets = self.buckets.write();
        let entries = buckets.entry(bucket.to_string()).or_default();
        entries.push(update.to_vec());
        Ok(entries.len() as u64)
    }

    fn read_from(&self, bucket: &str, from: u64) -> Result<Vec<Vec<u8>>, StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::DatabaseError("reads disabled".into()));
        }
        let buckets = self.buckets.read();
        let entries = match buckets.get(bucket) {
            Some(entries) => entries,
            None => return Ok(Vec::new()),
        };
        let start = usize::try_from(from).unwrap_or(usize::MAX).min(entries.len());
        Ok(entries[start..].to_vec())
    }

    fn len(&self, bucket: &str) -> Result<u64, StoreError> {
        Ok(self.buckets.read().get(bucket).map_or(0, |e| e.len() as u64))
    }

    fn clear(&self, bucket: &str) -> Result<u64, StoreError> {
        Ok(self
            .buckets
            .write()
            .remove(bucket)
            .map_or(0, |e| e.len() as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_returns_running_length() {
        let log = MemoryLog::new();
        assert_eq!(log.append("a:updates", b"one").unwrap(), 1);
        assert_eq!(log.append("a:updates", b"two").unwrap(), 2);
        assert_eq!(log.append("b:updates", b"x").unwrap(), 1);
        assert_eq!(log.len("a:updates").unwrap(), 2);
    }

    #[test]
    fn test_read_from_offsets() {
        let log = MemoryLog::new();
        for i in 0..5u8 {
            log.append("a:updates", &[i]).unwrap();
        }
        assert_eq!(log.read_from("a:updates", 3).unwrap(), vec![vec![3], vec![4]]);
        assert!(log.read_from("a:updates", 5).unwrap().is_empty());
        assert!(log.read_from("a:updates", 99).unwrap().is_empty());
        assert!(log.read_from("missing", 0).unwrap().is_empty());
    }

    #[test]
    fn test_clear_bucket() {
        let log = MemoryLog::new();
        log.append("a:updates", b"1").unwrap();
        log.append("a:updates", b"2").unwrap();
        assert_eq!(log.clear("a:updates").unwrap(), 2);
        assert!(log.is_empty("a:updates").unwrap());
    }

    #[test]
    fn test_failing_writes() {
        let log = MemoryLog::new();
        log.set_fail_writes(true);
        assert!(log.append("a:updates", b"1").is_err());
        log.set_fail_writes(false);
        assert_eq!(log.append("a:updates", b"1").unwrap(), 1);
    }

    #[test]
    fn test_failing_reads() {
        let log = MemoryLog::new();
        log.append("a:updates", b"1").unwrap();
        log.set_fail_reads(true);
        assert!(log.read_from("a:updates", 0).is_err());
        log.set_fail_reads(false);
        assert_eq!(log.read_from("a:updates", 0).unwrap().len(), 1);
    }
}
