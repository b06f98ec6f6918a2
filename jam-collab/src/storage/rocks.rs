//! RocksDB-backed [`RoomStore`].
//!
//! Column families:
//! - `rooms`   — Room metadata (bincode), keyed by room name
//! - `buckets` — Operation buckets (JSON, LZ4 compressed), keyed by
//!   `<name_len:4 BE><name><bucket_index:8 BE>`
//!
//! The length-prefixed key keeps one room's buckets contiguous and sorted by
//! index, so listing a room is a single forward scan.
//!
//! RocksDB has no conditional update, so read-modify-write calls are
//! serialized by an in-process mutex. That makes this store correct for a
//! single server process only.
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (LSM Trees, SSTables)

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};

use super::{AppendOutcome, OperationBucket, RoomMetadata, RoomStore, StoreError, FIRST_BUCKET};
use crate::protocol::Operation;

/// Column family names.
const CF_ROOMS: &str = "rooms";
const CF_BUCKETS: &str = "buckets";

const COLUMN_FAMILIES: &[&str] = &[CF_ROOMS, CF_BUCKETS];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("jam_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches for tests.
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

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

fn encode_metadata(meta: &RoomMetadata) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(meta, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode_metadata(bytes: &[u8]) -> Result<RoomMetadata, StoreError> {
    let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(meta)
}

// Operations are arbitrary JSON, which bincode cannot round-trip, so bucket
// documents are stored as LZ4-compressed JSON.
fn encode_bucket(bucket: &OperationBucket) -> Result<Vec<u8>, StoreError> {
    let json = serde_json::to_vec(bucket).map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&json))
}

fn decode_bucket(bytes: &[u8]) -> Result<OperationBucket, StoreError> {
    let json = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| StoreError::Compression(e.to_string()))?;
    serde_json::from_slice(&json).map_err(|e| StoreError::Deserialization(e.to_string()))
}

/// RocksDB room store.
pub struct RocksRoomStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes read-modify-write sequences
    write_lock: Mutex<()>,
}

impl RocksRoomStore {
    /// Open the store, creating the database and column families if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened room store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            write_lock: Mutex::new(()),
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
            CF_ROOMS => {
                // Small values, point lookups
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_BUCKETS => {
                // Values are already LZ4 compressed
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(4);
            }
            _ => {}
        }

        opts
    }

    /// Database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    fn bucket_prefix(room: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(4 + room.len() + 8);
        key.extend_from_slice(&(room.len() as u32).to_be_bytes());
        key.extend_from_slice(room.as_bytes());
        key
    }

    fn bucket_key(room: &str, bucket_index: u64) -> Vec<u8> {
        let mut key = Self::bucket_prefix(room);
        key.extend_from_slice(&bucket_index.to_be_bytes());
        key
    }

    fn load_room(&self, name: &str) -> Result<Option<RoomMetadata>, StoreError> {
        let cf = self.cf(CF_ROOMS)?;
        match self.db.get_cf(cf, name.as_bytes())? {
            Some(bytes) => Ok(Some(decode_metadata(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put_room(&self, meta: &RoomMetadata) -> Result<(), StoreError> {
        let cf = self.cf(CF_ROOMS)?;
        self.db.put_cf_opt(
            cf,
            meta.room_name.as_bytes(),
            encode_metadata(meta)?,
            &self.write_options(),
        )?;
        Ok(())
    }

    fn require_room(&self, name: &str) -> Result<RoomMetadata, StoreError> {
        self.load_room(name)?
            .ok_or_else(|| StoreError::RoomNotFound(name.to_string()))
    }

    /// Keys of every bucket stored for `room`, in index order.
    fn bucket_keys(&self, room: &str) -> Result<Vec<Box<[u8]>>, StoreError> {
        let cf = self.cf(CF_BUCKETS)?;
        let prefix = Self::bucket_prefix(room);
        let mut keys = Vec::new();
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward))
        {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            keys.push(key);
        }
        Ok(keys)
    }
}

#[async_trait]
impl RoomStore for RocksRoomStore {
    async fn find_room(&self, name: &str) -> Result<Option<RoomMetadata>, StoreError> {
        self.load_room(name)
    }

    async fn create_room(
        &self,
        name: &str,
        initial_bucket_index: u64,
        initial_member_count: i64,
    ) -> Result<RoomMetadata, StoreError> {
        let _guard = self.lock();
        if let Some(existing) = self.load_room(name)? {
            return Ok(existing);
        }
        let meta = RoomMetadata::new(name, initial_bucket_index, initial_member_count);
        self.put_room(&meta)?;
        Ok(meta)
    }

    async fn increment_member_count(
        &self,
        name: &str,
        delta: i64,
    ) -> Result<RoomMetadata, StoreError> {
        let _guard = self.lock();
        let mut meta = self.require_room(name)?;
        meta.num_members += delta;
        self.put_room(&meta)?;
        Ok(meta)
    }

    async fn append_operation(
        &self,
        room: &str,
        bucket_index: u64,
        op: Operation,
    ) -> Result<AppendOutcome, StoreError> {
        let _guard = self.lock();
        let cf = self.cf(CF_BUCKETS)?;
        let key = Self::bucket_key(room, bucket_index);

        let (mut bucket, upserted) = match self.db.get_cf(cf, &key)? {
            Some(bytes) => (decode_bucket(&bytes)?, false),
            None => (OperationBucket::new(room, bucket_index), true),
        };
        bucket.push(op);

        self.db
            .put_cf_opt(cf, &key, encode_bucket(&bucket)?, &self.write_options())?;

        Ok(AppendOutcome {
            count: bucket.count,
            upserted,
        })
    }

    async fn advance_bucket_index(&self, room: &str, expected: u64) -> Result<bool, StoreError> {
        let _guard = self.lock();
        let mut meta = self.require_room(room)?;
        if meta.bucket_index != expected {
            return Ok(false);
        }
        meta.bucket_index += 1;
        self.put_room(&meta)?;
        Ok(true)
    }

    async fn list_buckets(&self, room: &str) -> Result<Vec<OperationBucket>, StoreError> {
        let cf = self.cf(CF_BUCKETS)?;
        let prefix = Self::bucket_prefix(room);
        let mut buckets = Vec::new();
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward))
        {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            buckets.push(decode_bucket(&value)?);
        }
        Ok(buckets)
    }

    async fn delete_all_operations(&self, room: &str) -> Result<u64, StoreError> {
        let _guard = self.lock();
        let cf = self.cf(CF_BUCKETS)?;
        let keys = self.bucket_keys(room)?;

        let mut batch = WriteBatch::default();
        for key in &keys {
            batch.delete_cf(cf, key);
        }
        if !keys.is_empty() {
            self.db.write_opt(batch, &self.write_options())?;
        }
        Ok(keys.len() as u64)
    }

    async fn reset_bucket_index(&self, room: &str) -> Result<RoomMetadata, StoreError> {
        let _guard = self.lock();
        let mut meta = self.require_room(room)?;
        meta.bucket_index = FIRST_BUCKET;
        self.put_room(&meta)?;
        Ok(meta)
    }

    async fn reset_member_counts(&self) -> Result<u64, StoreError> {
        let _guard = self.lock();
        let cf = self.cf(CF_ROOMS)?;

        let mut batch = WriteBatch::default();
        let mut touched = 0u64;
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = item?;
            let mut meta = decode_metadata(&value)?;
            meta.num_members = 0;
            batch.put_cf(cf, &key, encode_metadata(&meta)?);
            touched += 1;
        }
        if touched > 0 {
            self.db.write_opt(batch, &self.write_options())?;
        }
        Ok(touched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn open_temp() -> (tempfile::TempDir, RocksRoomStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksRoomStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_store_open() {
        let (_dir, store) = open_temp();
        assert!(store.path().exists());
        assert!(store.find_room("jam1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_room_metadata_roundtrip() {
        let (_dir, store) = open_temp();
        store.create_room("jam1", FIRST_BUCKET, 0).await.unwrap();
        let meta = store.increment_member_count("jam1", 3).await.unwrap();
        assert_eq!(meta.num_members, 3);
        let meta = store.increment_member_count("jam1", -1).await.unwrap();
        assert_eq!(meta.num_members, 2);

        assert_eq!(
            store.find_room("jam1").await.unwrap(),
            Some(RoomMetadata::new("jam1", 1, 2))
        );
    }

    #[tokio::test]
    async fn test_append_and_list_in_order() {
        let (_dir, store) = open_temp();
        for i in 0..5 {
            let bucket = if i < 3 { 1 } else { 2 };
            store.append_operation("jam1", bucket, json!({"i": i})).await.unwrap();
        }
        store.append_operation("jam", 1, json!("prefix neighbour")).await.unwrap();

        let buckets = store.list_buckets("jam1").await.unwrap();
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].count, 3);
        assert_eq!(buckets[1].count, 2);
        let ops: Vec<_> = buckets.into_iter().flat_map(|b| b.operations).collect();
        assert_eq!(ops, (0..5).map(|i| json!({"i": i})).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_bucket_index_ordering_is_numeric() {
        let (_dir, store) = open_temp();
        // 256 sorts before 2 lexicographically as text, not as big-endian u64
        store.append_operation("jam1", 256, json!("late")).await.unwrap();
        store.append_operation("jam1", 2, json!("early")).await.unwrap();

        let indices: Vec<u64> = store
            .list_buckets("jam1")
            .await
            .unwrap()
            .iter()
            .map(|b| b.bucket_index)
            .collect();
        assert_eq!(indices, vec![2, 256]);
    }

    #[tokio::test]
    async fn test_upsert_flag() {
        let (_dir, store) = open_temp();
        let first = store.append_operation("jam1", 1, json!(1)).await.unwrap();
        let second = store.append_operation("jam1", 1, json!(2)).await.unwrap();
        assert!(first.upserted);
        assert!(!second.upserted);
        assert_eq!(second.count, 2);
    }

    #[tokio::test]
    async fn test_advance_conditional() {
        let (_dir, store) = open_temp();
        store.create_room("jam1", FIRST_BUCKET, 0).await.unwrap();
        assert!(store.advance_bucket_index("jam1", 1).await.unwrap());
        assert!(!store.advance_bucket_index("jam1", 1).await.unwrap());
        assert!(store.advance_bucket_index("jam1", 2).await.unwrap());
        assert_eq!(store.find_room("jam1").await.unwrap().unwrap().bucket_index, 3);

        assert!(matches!(
            store.advance_bucket_index("ghost", 1).await,
            Err(StoreError::RoomNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_all_operations_and_reset() {
        let (_dir, store) = open_temp();
        store.create_room("jam1", FIRST_BUCKET, 0).await.unwrap();
        store.advance_bucket_index("jam1", 1).await.unwrap();
        store.append_operation("jam1", 1, json!(1)).await.unwrap();
        store.append_operation("jam1", 2, json!(2)).await.unwrap();
        store.append_operation("jam2", 1, json!(3)).await.unwrap();

        assert_eq!(store.delete_all_operations("jam1").await.unwrap(), 2);
        assert!(store.list_buckets("jam1").await.unwrap().is_empty());
        assert_eq!(store.list_buckets("jam2").await.unwrap().len(), 1);
        assert_eq!(store.reset_bucket_index("jam1").await.unwrap().bucket_index, 1);
    }

    #[tokio::test]
    async fn test_reset_member_counts() {
        let (_dir, store) = open_temp();
        store.create_room("a", FIRST_BUCKET, 4).await.unwrap();
        store.create_room("b", FIRST_BUCKET, 0).await.unwrap();
        assert_eq!(store.reset_member_counts().await.unwrap(), 2);
        assert_eq!(store.find_room("a").await.unwrap().unwrap().num_members, 0);
    }

    #[tokio::test]
    async fn test_reopen_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::for_testing(dir.path().join("db"));

        {
            let store = RocksRoomStore::open(config.clone()).unwrap();
            store.create_room("jam1", FIRST_BUCKET, 0).await.unwrap();
            store.append_operation("jam1", 1, json!({"pitch": 60})).await.unwrap();
            store.advance_bucket_index("jam1", 1).await.unwrap();
        }

        let store = RocksRoomStore::open(config).unwrap();
        assert_eq!(store.find_room("jam1").await.unwrap().unwrap().bucket_index, 2);
        let buckets = store.list_buckets("jam1").await.unwrap();
        assert_eq!(buckets[0].operations, vec![json!({"pitch": 60})]);
    }

    #[test]
    fn test_bucket_compression_roundtrip() {
        let mut bucket = OperationBucket::new("jam1", 1);
        for _ in 0..100 {
            bucket.push(json!({"type": "note", "pitch": 60, "velocity": 100}));
        }
        let encoded = encode_bucket(&bucket).unwrap();
        let raw = serde_json::to_vec(&bucket).unwrap();
        // Repetitive operation streams compress well
        assert!(encoded.len() * 2 < raw.len());
        assert_eq!(decode_bucket(&encoded).unwrap(), bucket);
    }

    #[test]
    fn test_store_config_default() {
        let config = StoreConfig::default();
        assert_eq!(config.bloom_filter_bits, 10);
        assert!(!config.sync_writes);
        assert_eq!(config.path, PathBuf::from("jam_data"));
    }
}
