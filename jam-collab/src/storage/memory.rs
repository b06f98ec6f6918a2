//! In-process [`RoomStore`] backed by ordered maps.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{AppendOutcome, OperationBucket, RoomMetadata, RoomStore, StoreError, FIRST_BUCKET};
use crate::protocol::Operation;

#[derive(Default)]
struct MemoryState {
    rooms: HashMap<String, RoomMetadata>,
    /// Keyed by (room, bucket index) so a range scan yields index order
    buckets: BTreeMap<(String, u64), OperationBucket>,
}

/// Ephemeral store. Each call takes the single state lock, which gives the
/// same per-call atomicity as a document store's conditional updates.
#[derive(Default)]
pub struct MemoryRoomStore {
    state: Mutex<MemoryState>,
}

impl MemoryRoomStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bucket_range(room: &str) -> std::ops::RangeInclusive<(String, u64)> {
        (room.to_string(), 0)..=(room.to_string(), u64::MAX)
    }
}

#[async_trait]
impl RoomStore for MemoryRoomStore {
    async fn find_room(&self, name: &str) -> Result<Option<RoomMetadata>, StoreError> {
        Ok(self.state().rooms.get(name).cloned())
    }

    async fn create_room(
        &self,
        name: &str,
        initial_bucket_index: u64,
        initial_member_count: i64,
    ) -> Result<RoomMetadata, StoreError> {
        let mut state = self.state();
        let room = state
            .rooms
            .entry(name.to_string())
            .or_insert_with(|| RoomMetadata::new(name, initial_bucket_index, initial_member_count));
        Ok(room.clone())
    }

    async fn increment_member_count(
        &self,
        name: &str,
        delta: i64,
    ) -> Result<RoomMetadata, StoreError> {
        let mut state = self.state();
        let room = state
            .rooms
            .get_mut(name)
            .ok_or_else(|| StoreError::RoomNotFound(name.to_string()))?;
        room.num_members += delta;
        Ok(room.clone())
    }

    async fn append_operation(
        &self,
        room: &str,
        bucket_index: u64,
        op: Operation,
    ) -> Result<AppendOutcome, StoreError> {
        let mut state = self.state();
        let key = (room.to_string(), bucket_index);
        let upserted = !state.buckets.contains_key(&key);
        let bucket = state
            .buckets
            .entry(key)
            .or_insert_with(|| OperationBucket::new(room, bucket_index));
        bucket.push(op);
        Ok(AppendOutcome {
            count: bucket.count,
            upserted,
        })
    }

    async fn advance_bucket_index(&self, room: &str, expected: u64) -> Result<bool, StoreError> {
        let mut state = self.state();
        match state.rooms.get_mut(room) {
            Some(meta) if meta.bucket_index == expected => {
                meta.bucket_index += 1;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StoreError::RoomNotFound(room.to_string())),
        }
    }

    async fn list_buckets(&self, room: &str) -> Result<Vec<OperationBucket>, StoreError> {
        let state = self.state();
        Ok(state
            .buckets
            .range(Self::bucket_range(room))
            .map(|(_, bucket)| bucket.clone())
            .collect())
    }

    async fn delete_all_operations(&self, room: &str) -> Result<u64, StoreError> {
        let mut state = self.state();
        let keys: Vec<(String, u64)> = state
            .buckets
            .range(Self::bucket_range(room))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &keys {
            state.buckets.remove(key);
        }
        Ok(keys.len() as u64)
    }

    async fn reset_bucket_index(&self, room: &str) -> Result<RoomMetadata, StoreError> {
        let mut state = self.state();
        let meta = state
            .rooms
            .get_mut(room)
            .ok_or_else(|| StoreError::RoomNotFound(room.to_string()))?;
        meta.bucket_index = FIRST_BUCKET;
        Ok(meta.clone())
    }

    async fn reset_member_counts(&self) -> Result<u64, StoreError> {
        let mut state = self.state();
        let mut touched = 0;
        for meta in state.rooms.values_mut() {
            meta.num_members = 0;
            touched += 1;
        }
        Ok(touched)
    }
}
