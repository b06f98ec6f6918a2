//! Persistence for room metadata and bucketed operation logs.
//!
//! Architecture:
//! ```text
//! ┌──────────────┐   find / create / $inc    ┌──────────────────────────────┐
//! │ OperationLog │ ────────────────────────► │ RoomStore                    │
//! │ (write lock) │   append / advance / list │                              │
//! └──────────────┘                           │  rooms   — RoomMetadata      │
//!                                            │  buckets — (room, index) →   │
//!                                            │            OperationBucket   │
//!                                            └──────────────┬───────────────┘
//!                                                           │
//!                                        ┌──────────────────┴──────────┐
//!                                        ▼                             ▼
//!                                 MemoryRoomStore               RocksRoomStore
//!                                 (tests, ephemeral)            (RocksDB, LZ4)
//! ```
//!
//! Every mutating call is a single atomic read-modify-write on the store side.
//! Ordering across calls is the caller's business (see [`crate::oplog`]).

pub mod memory;
pub mod rocks;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::protocol::Operation;

pub use memory::MemoryRoomStore;
pub use rocks::{RocksRoomStore, StoreConfig};

/// Index of the first bucket of every room.
pub const FIRST_BUCKET: u64 = 1;

/// Persistent per-room record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomMetadata {
    pub room_name: String,
    /// Bucket that accepts the next append
    pub bucket_index: u64,
    /// Live member count across the whole deployment
    pub num_members: i64,
}

impl RoomMetadata {
    pub fn new(room_name: impl Into<String>, bucket_index: u64, num_members: i64) -> Self {
        Self {
            room_name: room_name.into(),
            bucket_index,
            num_members,
        }
    }
}

/// A fixed-capacity chunk of a room's operation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationBucket {
    pub room_name: String,
    pub bucket_index: u64,
    pub count: u64,
    pub operations: Vec<Operation>,
}

impl OperationBucket {
    pub fn new(room_name: impl Into<String>, bucket_index: u64) -> Self {
        Self {
            room_name: room_name.into(),
            bucket_index,
            count: 0,
            operations: Vec::new(),
        }
    }

    fn push(&mut self, op: Operation) {
        self.operations.push(op);
        self.count += 1;
    }
}

/// Result of an atomic increment-and-push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    /// Bucket count after the append
    pub count: u64,
    /// Whether the bucket document was created by this append
    pub upserted: bool,
}

/// Storage errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Room not found: {0}")]
    RoomNotFound(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
}

/// Durable document store contract used by the operation log.
#[async_trait]
pub trait RoomStore: Send + Sync {
    /// Look up a room's metadata.
    async fn find_room(&self, name: &str) -> Result<Option<RoomMetadata>, StoreError>;

    /// Insert a room record if none exists and return the stored record.
    ///
    /// Two racing creators both get the record that won.
    async fn create_room(
        &self,
        name: &str,
        initial_bucket_index: u64,
        initial_member_count: i64,
    ) -> Result<RoomMetadata, StoreError>;

    /// Atomically add `delta` to the member count, returning the updated record.
    async fn increment_member_count(&self, name: &str, delta: i64)
        -> Result<RoomMetadata, StoreError>;

    /// Atomically push `op` onto bucket `(room, bucket_index)` and bump its
    /// count, creating the bucket if absent.
    async fn append_operation(
        &self,
        room: &str,
        bucket_index: u64,
        op: Operation,
    ) -> Result<AppendOutcome, StoreError>;

    /// Increment the room's bucket index only if it still equals `expected`.
    async fn advance_bucket_index(&self, room: &str, expected: u64) -> Result<bool, StoreError>;

    /// All buckets of a room ordered by bucket index.
    async fn list_buckets(&self, room: &str) -> Result<Vec<OperationBucket>, StoreError>;

    /// Remove every bucket of a room. Returns the number removed.
    async fn delete_all_operations(&self, room: &str) -> Result<u64, StoreError>;

    /// Set the room's bucket index back to [`FIRST_BUCKET`].
    async fn reset_bucket_index(&self, room: &str) -> Result<RoomMetadata, StoreError>;

    /// Zero the member count of every room. Returns the number of rooms touched.
    async fn reset_member_counts(&self) -> Result<u64, StoreError>;
}
