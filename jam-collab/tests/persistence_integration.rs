//! Persistence integration tests.
//!
//! Verifies:
//! - The operation log survives a store reopen, bucket boundaries included
//! - Member counts from a dead process are reset on startup
//! - A log wipe persists across reopen
//! - Rooms are isolated from each other on disk

use jam_collab::directory::OpenDirectory;
use jam_collab::oplog::{LogConfig, OperationLog};
use jam_collab::server::SyncServer;
use jam_collab::storage::{RocksRoomStore, RoomStore, StoreConfig};
use jam_collab::Hub;
use jam_collab::HubConfig;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn open_log(path: &Path, max_ops_per_bucket: u64) -> OperationLog {
    let store = RocksRoomStore::open(StoreConfig::for_testing(path)).unwrap();
    OperationLog::new(
        Arc::new(store),
        Arc::new(OpenDirectory),
        LogConfig { max_ops_per_bucket },
    )
}

fn notes(range: std::ops::Range<u32>) -> Vec<Value> {
    range.map(|i| json!({"type": "note", "seq": i})).collect()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_log_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");

    {
        let log = open_log(&path, 100);
        log.commit_operations("jam1", &notes(0..150)).await.unwrap();
    }

    let log = open_log(&path, 100);
    assert_eq!(log.room("jam1").await.unwrap().bucket_index, 2);

    let buckets = log.store().list_buckets("jam1").await.unwrap();
    let counts: Vec<u64> = buckets.iter().map(|b| b.count).collect();
    assert_eq!(counts, vec![100, 50]);
    assert_eq!(log.get_all_operations("jam1").await.unwrap(), notes(0..150));

    // Appends continue in the open bucket
    log.commit_operations("jam1", &notes(150..160)).await.unwrap();
    assert_eq!(log.get_all_operations("jam1").await.unwrap(), notes(0..160));
}

#[tokio::test]
async fn test_many_rollovers_keep_order() {
    let dir = tempdir().unwrap();
    let log = open_log(&dir.path().join("db"), 7);

    for chunk in [0..5, 5..20, 20..21, 21..50] {
        log.commit_operations("jam1", &notes(chunk)).await.unwrap();
    }

    assert_eq!(log.get_all_operations("jam1").await.unwrap(), notes(0..50));
    // 50 ops in buckets of 7: seven full buckets, index on the eighth
    assert_eq!(log.room("jam1").await.unwrap().bucket_index, 8);
}

#[tokio::test]
async fn test_rooms_isolated_on_disk() {
    let dir = tempdir().unwrap();
    let log = open_log(&dir.path().join("db"), 10);

    log.commit_operations("jam", &notes(0..3)).await.unwrap();
    log.commit_operations("jam1", &notes(3..25)).await.unwrap();
    log.commit_operations("jam10", &notes(25..26)).await.unwrap();

    assert_eq!(log.get_all_operations("jam").await.unwrap(), notes(0..3));
    assert_eq!(log.get_all_operations("jam1").await.unwrap(), notes(3..25));
    assert_eq!(log.get_all_operations("jam10").await.unwrap(), notes(25..26));
}

#[tokio::test]
async fn test_clear_persists_across_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");

    {
        let log = open_log(&path, 4);
        log.commit_operations("jam1", &notes(0..9)).await.unwrap();
        let hub = Hub::new(HubConfig::for_testing(), Arc::new(log));
        let meta = hub.clear_room("jam1").await.unwrap();
        assert_eq!(meta.bucket_index, 1);
    }

    let log = open_log(&path, 4);
    assert!(log.get_all_operations("jam1").await.unwrap().is_empty());
    assert_eq!(log.room("jam1").await.unwrap().bucket_index, 1);
}

#[tokio::test]
async fn test_member_counts_reset_on_startup() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");

    {
        let log = open_log(&path, 100);
        log.room("jam1").await.unwrap();
        log.update_member_count("jam1", 3).await.unwrap();
    }

    let server = SyncServer::with_storage("127.0.0.1:0", &path).unwrap();
    let oplog = server.hub().oplog();
    assert_eq!(oplog.room("jam1").await.unwrap().num_members, 3);

    // What run() does before binding
    assert_eq!(oplog.reset_member_counts().await.unwrap(), 1);
    assert_eq!(oplog.room("jam1").await.unwrap().num_members, 0);
}
