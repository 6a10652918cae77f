//! RocksDB-backed update log.
//!
//! Column families:
//! - `entries` — update payloads (LZ4 compressed), keyed by bucket + sequence
//! - `heads`   — per-bucket [`LogHead`] records (bincode)
//!
//! Entry key layout:
//! ```text
//! ┌──────────────┬─────────────────┬───────────────────┐
//! │ bucket len   │ bucket (UTF-8)  │ sequence          │
//! │ 4 bytes BE   │ variable        │ 8 bytes BE        │
//! └──────────────┴─────────────────┴───────────────────┘
//! ```
//! The length prefix keeps buckets whose names share a prefix from
//! interleaving; the big-endian sequence keeps a bucket's entries in order.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use parking_lot::Mutex;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};

use super::{StoreError, UpdateLog};

const CF_ENTRIES: &str = "entries";
const CF_HEADS: &str = "heads";

const COLUMN_FAMILIES: &[&str] = &[CF_ENTRIES, CF_HEADS];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every append
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("loom_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, no fsync).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Bookkeeping stored next to a bucket's entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogHead {
    /// Number of entries (next sequence number)
    pub length: u64,
    /// Sum of uncompressed entry sizes
    pub total_bytes: u64,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last append timestamp (seconds since epoch)
    pub updated_at: u64,
}

impl LogHead {
    fn new() -> Self {
        let now = unix_now();
        Self {
            length: 0,
            total_bytes: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (head, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(head)
    }
}

/// RocksDB-backed [`UpdateLog`].
pub struct RocksLog {
    /// RocksDB instance (single-threaded mode, appends serialized below)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes read-modify-write of bucket heads
    append_lock: Mutex<()>,
}

impl RocksLog {
    /// Open the log at the configured path, creating it if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened update log at {}", config.path.display());
        Ok(Self {
            db,
            config,
            append_lock: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_ENTRIES => {
                // Payloads are LZ4 compressed before they reach RocksDB
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(4);
            }
            CF_HEADS => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    /// Head record of a bucket, if it has ever been written.
    pub fn head(&self, bucket: &str) -> Result<Option<LogHead>, StoreError> {
        let cf = self.cf(CF_HEADS)?;
        match self.db.get_cf(&cf, bucket.as_bytes())? {
            Some(bytes) => Ok(Some(LogHead::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Every bucket that currently has a head record.
    pub fn list_buckets(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_HEADS)?;
        let mut buckets = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            let name = String::from_utf8(key.to_vec())
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
            buckets.push(name);
        }
        Ok(buckets)
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &'static str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or(StoreError::MissingColumnFamily(name))
    }

    fn bucket_prefix(bucket: &str) -> Vec<u8> {
        let mut prefix = Vec::with_capacity(4 + bucket.len());
        prefix.extend_from_slice(&(bucket.len() as u32).to_be_bytes());
        prefix.extend_from_slice(bucket.as_bytes());
        prefix
    }

    fn entry_key(bucket: &str, sequence: u64) -> Vec<u8> {
        let mut key = Self::bucket_prefix(bucket);
        key.extend_from_slice(&sequence.to_be_bytes());
        key
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }
}

impl UpdateLog for RocksLog {
    fn append(&self, bucket: &str, update: &[u8]) -> Result<u64, StoreError> {
        let cf_entries = self.cf(CF_ENTRIES)?;
        let cf_heads = self.cf(CF_HEADS)?;
        let compressed = lz4_flex::compress_prepend_size(update);

        let _guard = self.append_lock.lock();
        let mut head = self.head(bucket)?.unwrap_or_else(LogHead::new);
        let key = Self::entry_key(bucket, head.length);
        head.length += 1;
        head.total_bytes += update.len() as u64;
        head.updated_at = unix_now();

        // Entry and head land together or not at all
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_entries, &key, &compressed);
        batch.put_cf(&cf_heads, bucket.as_bytes(), &head.encode()?);
        self.db.write_opt(batch, &self.write_options())?;

        Ok(head.length)
    }

    fn read_from(&self, bucket: &str, from: u64) -> Result<Vec<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_ENTRIES)?;
        let prefix = Self::bucket_prefix(bucket);
        let start = Self::entry_key(bucket, from);

        let mut entries = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&start, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if key.len() != prefix.len() + 8 || !key.starts_with(&prefix) {
                break;
            }
            let payload = lz4_flex::decompress_size_prepended(&value)
                .map_err(|e| StoreError::CompressionError(e.to_string()))?;
            entries.push(payload);
        }
        Ok(entries)
    }

    fn len(&self, bucket: &str) -> Result<u64, StoreError> {
        Ok(self.head(bucket)?.map_or(0, |h| h.length))
    }

    fn clear(&self, bucket: &str) -> Result<u64, StoreError> {
        let cf_entries = self.cf(CF_ENTRIES)?;
        let cf_heads = self.cf(CF_HEADS)?;
        let prefix = Self::bucket_prefix(bucket);
        let start = Self::entry_key(bucket, 0);

        let _guard = self.append_lock.lock();
        let mut batch = WriteBatch::default();
        let mut count = 0u64;
        let iter = self
            .db
            .iterator_cf(&cf_entries, IteratorMode::From(&start, Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            if key.len() != prefix.len() + 8 || !key.starts_with(&prefix) {
                break;
            }
            batch.delete_cf(&cf_entries, &key);
            count += 1;
        }
        batch.delete_cf(&cf_heads, bucket.as_bytes());
        self.db.write_opt(batch, &self.write_options())?;

        log::info!("Cleared {count} entries from {bucket}");
        Ok(count)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
