// ABOUTME: Integration tests for the SQLite watermark store
// ABOUTME: Persistence across reopen, background flushing and error annotations

use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

use cdc_replicator::cdc::{SqliteWatermarkStore, TableKey, Timestamp, WatermarkStore};

#[test]
fn test_watermarks_survive_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("nested").join("watermarks.db");
    let orders = TableKey::new("shop", "orders");
    let users = TableKey::new("shop", "users");

    {
        let store = SqliteWatermarkStore::open(&path).unwrap();
        store.update_memory(&orders, Timestamp::new(1_700_000_000_000, 3));
        store.update_memory(&users, Timestamp::from_physical(42));
        assert_eq!(store.flush().unwrap(), 2);
        // Not flushed: lost on reopen.
        store.update_memory(&users, Timestamp::from_physical(43));
    }

    let store = SqliteWatermarkStore::open(&path).unwrap();
    assert_eq!(
        store.get_from_memory(&orders),
        Some(Timestamp::new(1_700_000_000_000, 3))
    );
    assert_eq!(store.get_from_memory(&users), Some(Timestamp::from_physical(42)));

    let listed: Vec<String> = store
        .list()
        .unwrap()
        .iter()
        .map(|r| r.key.qualified_name())
        .collect();
    assert_eq!(listed, vec!["shop.orders", "shop.users"]);
}

#[test]
fn test_error_message_is_written_through() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("watermarks.db");
    let key = TableKey::new("shop", "orders");

    {
        let store = SqliteWatermarkStore::open(&path).unwrap();
        store.update_memory(&key, Timestamp::from_physical(9));
        store.flush().unwrap();
        store
            .save_error_message(&key, "Failed to sink changes of shop.orders")
            .unwrap();
    }

    let store = SqliteWatermarkStore::open(&path).unwrap();
    let record = store.get_persisted(&key).unwrap().unwrap();
    assert_eq!(record.watermark, Timestamp::from_physical(9));
    assert_eq!(
        record.err_msg.as_deref(),
        Some("Failed to sink changes of shop.orders")
    );
}

#[tokio::test]
async fn test_flusher_writes_on_shutdown() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("watermarks.db");
    let key = TableKey::new("shop", "orders");
    let store = Arc::new(SqliteWatermarkStore::open(&path).unwrap());
    let token = CancellationToken::new();

    // Long interval: only the first immediate tick and the final flush run.
    let flusher = Arc::clone(&store).spawn_flusher(Duration::from_secs(3600), token.clone());
    tokio::time::sleep(Duration::from_millis(20)).await;

    store.update_memory(&key, Timestamp::from_physical(100));
    assert!(store.get_persisted(&key).unwrap().is_none());

    token.cancel();
    flusher.await.unwrap();

    let record = store.get_persisted(&key).unwrap().unwrap();
    assert_eq!(record.watermark, Timestamp::from_physical(100));
}

#[tokio::test]
async fn test_flusher_flushes_periodically() {
    let dir = tempdir().unwrap();
    let store = Arc::new(SqliteWatermarkStore::open(dir.path().join("wm.db")).unwrap());
    let key = TableKey::new("db", "t");
    let token = CancellationToken::new();
    let flusher = Arc::clone(&store).spawn_flusher(Duration::from_millis(5), token.clone());

    store.update_memory(&key, Timestamp::from_physical(1));
    let mut persisted = None;
    for _ in 0..200 {
        persisted = store.get_persisted(&key).unwrap();
        if persisted.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(persisted.unwrap().watermark, Timestamp::from_physical(1));

    token.cancel();
    flusher.await.unwrap();
}
