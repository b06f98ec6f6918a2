//! Bucketed, append-only operation log.
//!
//! Each room's log is split into fixed-capacity buckets:
//! ```text
//! room "jam1"  (bucket_index = 3)
//!   ├─ bucket 1: [op₀ … op₉₉]    count = 100  (full)
//!   ├─ bucket 2: [op₁₀₀ … op₁₉₉] count = 100  (full)
//!   └─ bucket 3: [op₂₀₀ … ]      count < 100  ← next append
//! ```
//! The current bucket index lives on the persistent room record, never in
//! memory. An append that fills a bucket advances the index with a
//! conditional update keyed on the index it wrote to, so rollover happens
//! exactly once no matter how many writers race.
//!
//! All commits (and log wipes) are serialized by one process-wide lock, which
//! keeps a batch contiguous and in submission order.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::directory::{DirectoryError, RoomDirectory};
use crate::protocol::Operation;
use crate::storage::{RoomMetadata, RoomStore, StoreError, FIRST_BUCKET};

/// Operation log configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Bucket capacity (default: 100)
    pub max_ops_per_bucket: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            max_ops_per_bucket: 100,
        }
    }
}

impl LogConfig {
    /// Tiny buckets so tests cross boundaries quickly.
    pub fn for_testing() -> Self {
        Self {
            max_ops_per_bucket: 4,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("room \"{0}\" does not exist")]
    RoomUnknown(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    /// A batch stopped part-way. The first `committed` operations stay written.
    #[error("commit aborted after {committed} operation(s): {source}")]
    CommitAborted {
        committed: usize,
        #[source]
        source: StoreError,
    },
    #[error("bucket index of room \"{room}\" is {actual} after reset")]
    ResetMismatch { room: String, actual: u64 },
}

pub struct OperationLog {
    store: Arc<dyn RoomStore>,
    directory: Arc<dyn RoomDirectory>,
    config: LogConfig,
    write_lock: Mutex<()>,
}

impl OperationLog {
    pub fn new(
        store: Arc<dyn RoomStore>,
        directory: Arc<dyn RoomDirectory>,
        config: LogConfig,
    ) -> Self {
        Self {
            store,
            directory,
            config,
            write_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn RoomStore> {
        &self.store
    }

    /// Room metadata, created on first reference if the directory knows the
    /// name.
    pub async fn room(&self, name: &str) -> Result<RoomMetadata, LogError> {
        if let Some(meta) = self.store.find_room(name).await? {
            return Ok(meta);
        }

        if self.directory.lookup_room(name).await?.is_none() {
            return Err(LogError::RoomUnknown(name.to_string()));
        }

        log::info!("Creating room record for {name}");
        Ok(self.store.create_room(name, FIRST_BUCKET, 0).await?)
    }

    /// Adjust the persisted live member count.
    pub async fn update_member_count(
        &self,
        name: &str,
        delta: i64,
    ) -> Result<RoomMetadata, LogError> {
        Ok(self.store.increment_member_count(name, delta).await?)
    }

    /// Append `ops` to the room's log in order.
    pub async fn commit_operations(&self, room: &str, ops: &[Operation]) -> Result<(), LogError> {
        self.room(room).await?;

        let _guard = self.write_lock.lock().await;

        // Re-read under the lock; the index may have moved while we waited
        let mut current = self.room(room).await?.bucket_index;

        for (committed, op) in ops.iter().enumerate() {
            let outcome = self
                .store
                .append_operation(room, current, op.clone())
                .await
                .map_err(|source| LogError::CommitAborted { committed, source })?;

            if outcome.upserted {
                log::debug!("Opened bucket {current} for room {room}");
            }

            if outcome.count >= self.config.max_ops_per_bucket {
                let advanced = self
                    .store
                    .advance_bucket_index(room, current)
                    .await
                    .map_err(|source| LogError::CommitAborted {
                        committed: committed + 1,
                        source,
                    })?;

                if advanced {
                    log::debug!("Room {room} rolled over to bucket {}", current + 1);
                    current += 1;
                } else {
                    current = self
                        .store
                        .find_room(room)
                        .await
                        .map_err(|source| LogError::CommitAborted {
                            committed: committed + 1,
                            source,
                        })?
                        .map(|meta| meta.bucket_index)
                        .unwrap_or(current + 1);
                }
            }
        }

        log::trace!("Committed {} operation(s) to room {room}", ops.len());
        Ok(())
    }

    /// Every operation of the room in commit order.
    pub async fn get_all_operations(&self, room: &str) -> Result<Vec<Operation>, LogError> {
        let mut buckets = self.store.list_buckets(room).await?;
        buckets.sort_by_key(|bucket| bucket.bucket_index);
        Ok(buckets
            .into_iter()
            .flat_map(|bucket| bucket.operations)
            .collect())
    }

    /// Wipe the room's log and point it back at the first bucket.
    pub async fn delete_all_operations(&self, room: &str) -> Result<RoomMetadata, LogError> {
        self.room(room).await?;

        let _guard = self.write_lock.lock().await;

        let removed = self.store.delete_all_operations(room).await?;
        let meta = self.store.reset_bucket_index(room).await?;
        if meta.bucket_index != FIRST_BUCKET {
            return Err(LogError::ResetMismatch {
                room: room.to_string(),
                actual: meta.bucket_index,
            });
        }

        log::info!("Deleted {removed} bucket(s) from room {room}");
        Ok(meta)
    }

    /// Zero every persisted member count. Run once at startup.
    pub async fn reset_member_counts(&self) -> Result<u64, LogError> {
        let touched = self.store.reset_member_counts().await?;
        log::info!("Reset member counts of {touched} room(s)");
        Ok(touched)
    }
}
