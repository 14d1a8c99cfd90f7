// ABOUTME: Watermark stores - per-table high-water marks of what has been replayed
// ABOUTME: In-memory store plus a SQLite-backed store with periodic flush and error annotations

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::table::TableKey;
use super::timestamp::Timestamp;

/// Per-table watermark bookkeeping consumed by the table reader.
pub trait WatermarkStore: Send + Sync {
    /// Current in-memory watermark, `None` if the table was never recorded.
    fn get_from_memory(&self, key: &TableKey) -> Option<Timestamp>;

    fn update_memory(&self, key: &TableKey, ts: Timestamp);

    /// Record why replication of `key` stopped.
    fn save_error_message(&self, key: &TableKey, msg: &str) -> Result<()>;
}

/// Process-local watermark store.
#[derive(Debug, Default)]
pub struct MemoryWatermarkStore {
    watermarks: RwLock<HashMap<TableKey, Timestamp>>,
    errors: RwLock<HashMap<TableKey, String>>,
}

impl MemoryWatermarkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn error_message(&self, key: &TableKey) -> Option<String> {
        read(&self.errors).get(key).cloned()
    }
}

impl WatermarkStore for MemoryWatermarkStore {
    fn get_from_memory(&self, key: &TableKey) -> Option<Timestamp> {
        read(&self.watermarks).get(key).copied()
    }

    fn update_memory(&self, key: &TableKey, ts: Timestamp) {
        write(&self.watermarks).insert(key.clone(), ts);
    }

    fn save_error_message(&self, key: &TableKey, msg: &str) -> Result<()> {
        write(&self.errors).insert(key.clone(), msg.to_string());
        Ok(())
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS watermarks (
    db_name       TEXT NOT NULL,
    table_name    TEXT NOT NULL,
    physical      INTEGER NOT NULL DEFAULT 0,
    logical       INTEGER NOT NULL DEFAULT 0,
    err_msg       TEXT,
    updated_at    TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY (db_name, table_name)
);
"#;

/// Persisted state of one table, as listed by [`SqliteWatermarkStore::list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatermarkRecord {
    pub key: TableKey,
    pub watermark: Timestamp,
    pub err_msg: Option<String>,
    pub updated_at: String,
}

/// Watermark store backed by a SQLite database.
///
/// Reads and updates hit an in-memory cache; updated keys are marked dirty
/// and written by [`SqliteWatermarkStore::flush`]. Error messages are written
/// through immediately.
pub struct SqliteWatermarkStore {
    path: PathBuf,
    conn: Mutex<Connection>,
    cache: RwLock<HashMap<TableKey, Timestamp>>,
    dirty: Mutex<HashSet<TableKey>>,
}

impl SqliteWatermarkStore {
    /// Open (or create) the store and load every persisted watermark into memory.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create watermark directory {}", parent.display())
                })?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open watermark database {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "wal")
            .context("Failed to enable WAL for watermark database")?;
        conn.pragma_update(None, "synchronous", "normal").ok();
        conn.execute_batch(SCHEMA)
            .context("Failed to initialize watermark schema")?;

        let store = Self {
            path: path.to_path_buf(),
            conn: Mutex::new(conn),
            cache: RwLock::new(HashMap::new()),
            dirty: Mutex::new(HashSet::new()),
        };
        let loaded = store.load()?;
        tracing::debug!(
            "Loaded {} watermarks from {}",
            loaded,
            store.path.display()
        );
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<usize> {
        let records = self.list()?;
        let mut cache = write(&self.cache);
        for record in &records {
            cache.insert(record.key.clone(), record.watermark);
        }
        Ok(records.len())
    }

    /// Write every dirty watermark in one transaction. Returns how many were written.
    pub fn flush(&self) -> Result<usize> {
        let pending: Vec<(TableKey, Timestamp)> = {
            let mut dirty = lock(&self.dirty);
            let cache = read(&self.cache);
            dirty
                .drain()
                .filter_map(|key| cache.get(&key).map(|ts| (key, *ts)))
                .collect()
        };
        if pending.is_empty() {
            return Ok(0);
        }

        let result = self.write_watermarks(&pending);
        if result.is_err() {
            // Keep the keys dirty so the next flush retries them.
            let mut dirty = lock(&self.dirty);
            dirty.extend(pending.iter().map(|(key, _)| key.clone()));
        }
        result.map(|_| pending.len())
    }

    fn write_watermarks(&self, pending: &[(TableKey, Timestamp)]) -> Result<()> {
        let mut conn = lock(&self.conn);
        let tx = conn
            .transaction()
            .context("Failed to start watermark flush")?;
        for (key, ts) in pending {
            upsert_watermark(&tx, key, *ts)?;
        }
        tx.commit().context("Failed to commit watermark flush")?;
        Ok(())
    }

    /// Persisted watermark of `key`, bypassing the cache.
    pub fn get_persisted(&self, key: &TableKey) -> Result<Option<WatermarkRecord>> {
        let conn = lock(&self.conn);
        let record = conn
            .query_row(
                "SELECT db_name, table_name, physical, logical, err_msg, updated_at
                 FROM watermarks WHERE db_name = ?1 AND table_name = ?2",
                params![key.db, key.table],
                record_from_row,
            )
            .optional()
            .with_context(|| format!("Failed to read watermark of {}", key))?;
        Ok(record)
    }

    /// All persisted watermarks ordered by table.
    pub fn list(&self) -> Result<Vec<WatermarkRecord>> {
        let conn = lock(&self.conn);
        let mut stmt = conn.prepare(
            "SELECT db_name, table_name, physical, logical, err_msg, updated_at
             FROM watermarks ORDER BY db_name, table_name",
        )?;
        let records = stmt
            .query_map([], record_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list watermarks")?;
        Ok(records)
    }

    /// Set a watermark and write it through, clearing any recorded error.
    pub fn set(&self, key: &TableKey, ts: Timestamp) -> Result<()> {
        {
            let conn = lock(&self.conn);
            upsert_watermark(&conn, key, ts)?;
            conn.execute(
                "UPDATE watermarks SET err_msg = NULL WHERE db_name = ?1 AND table_name = ?2",
                params![key.db, key.table],
            )
            .with_context(|| format!("Failed to clear error of {}", key))?;
        }
        write(&self.cache).insert(key.clone(), ts);
        lock(&self.dirty).remove(key);
        Ok(())
    }

    /// Forget a table entirely. Returns whether it was persisted.
    pub fn remove(&self, key: &TableKey) -> Result<bool> {
        let deleted = lock(&self.conn)
            .execute(
                "DELETE FROM watermarks WHERE db_name = ?1 AND table_name = ?2",
                params![key.db, key.table],
            )
            .with_context(|| format!("Failed to remove watermark of {}", key))?;
        write(&self.cache).remove(key);
        lock(&self.dirty).remove(key);
        Ok(deleted > 0)
    }

    /// Flush every `interval` until `token` is cancelled, then flush once more.
    pub fn spawn_flusher(self: Arc<Self>, interval: Duration, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.flush() {
                            tracing::warn!("Failed to flush watermarks to {}: {:#}", self.path.display(), e);
                        }
                    }
                }
            }
            match self.flush() {
                Ok(n) => tracing::debug!("Final watermark flush wrote {} entries", n),
                Err(e) => tracing::error!("Final watermark flush failed: {:#}", e),
            }
        })
    }
}

impl WatermarkStore for SqliteWatermarkStore {
    fn get_from_memory(&self, key: &TableKey) -> Option<Timestamp> {
        read(&self.cache).get(key).copied()
    }

    fn update_memory(&self, key: &TableKey, ts: Timestamp) {
        write(&self.cache).insert(key.clone(), ts);
        lock(&self.dirty).insert(key.clone());
    }

    fn save_error_message(&self, key: &TableKey, msg: &str) -> Result<()> {
        let conn = lock(&self.conn);
        conn.execute(
            "INSERT INTO watermarks(db_name, table_name, err_msg, updated_at)
             VALUES (?1, ?2, ?3, CURRENT_TIMESTAMP)
             ON CONFLICT(db_name, table_name) DO UPDATE SET
                err_msg = excluded.err_msg,
                updated_at = CURRENT_TIMESTAMP",
            params![key.db, key.table, msg],
        )
        .with_context(|| format!("Failed to save error message of {}", key))?;
        Ok(())
    }
}

fn upsert_watermark(conn: &Connection, key: &TableKey, ts: Timestamp) -> Result<()> {
    conn.execute(
        "INSERT INTO watermarks(db_name, table_name, physical, logical, updated_at)
         VALUES (?1, ?2, ?3, ?4, CURRENT_TIMESTAMP)
         ON CONFLICT(db_name, table_name) DO UPDATE SET
            physical = excluded.physical,
            logical = excluded.logical,
            updated_at = CURRENT_TIMESTAMP",
        params![key.db, key.table, ts.physical(), ts.logical()],
    )
    .with_context(|| format!("Failed to write watermark of {}", key))?;
    Ok(())
}

fn record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<WatermarkRecord> {
    Ok(WatermarkRecord {
        key: TableKey::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?),
        watermark: Timestamp::new(row.get(2)?, row.get(3)?),
        err_msg: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

// Poisoned locks still guard consistent maps: every critical section is a
// single insert/remove/drain.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read<T>(l: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(l: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_round_trip() {
        let store = MemoryWatermarkStore::new();
        let key = TableKey::new("shop", "orders");
        assert_eq!(store.get_from_memory(&key), None);

        store.update_memory(&key, Timestamp::from_physical(10));
        assert_eq!(store.get_from_memory(&key), Some(Timestamp::from_physical(10)));

        store.save_error_message(&key, "boom").unwrap();
        assert_eq!(store.error_message(&key).as_deref(), Some("boom"));
    }

    #[test]
    fn test_sqlite_store_flushes_only_dirty_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteWatermarkStore::open(dir.path().join("wm.db")).unwrap();
        let key = TableKey::new("shop", "orders");

        store.update_memory(&key, Timestamp::new(5, 1));
        assert!(store.get_persisted(&key).unwrap().is_none());
        assert_eq!(store.flush().unwrap(), 1);
        assert_eq!(store.flush().unwrap(), 0);

        let record = store.get_persisted(&key).unwrap().unwrap();
        assert_eq!(record.watermark, Timestamp::new(5, 1));
        assert!(record.err_msg.is_none());
    }

    #[test]
    fn test_sqlite_store_set_clears_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteWatermarkStore::open(dir.path().join("wm.db")).unwrap();
        let key = TableKey::new("shop", "orders");

        store.save_error_message(&key, "sink error: down").unwrap();
        let record = store.get_persisted(&key).unwrap().unwrap();
        assert_eq!(record.watermark, Timestamp::ZERO);
        assert_eq!(record.err_msg.as_deref(), Some("sink error: down"));

        store.set(&key, Timestamp::from_physical(77)).unwrap();
        let record = store.get_persisted(&key).unwrap().unwrap();
        assert_eq!(record.watermark, Timestamp::from_physical(77));
        assert!(record.err_msg.is_none());
        assert_eq!(store.get_from_memory(&key), Some(Timestamp::from_physical(77)));

        assert!(store.remove(&key).unwrap());
        assert!(!store.remove(&key).unwrap());
        assert_eq!(store.get_from_memory(&key), None);
    }
}
