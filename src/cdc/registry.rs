// ABOUTME: Registry of running table readers, one entry per source table
// ABOUTME: Injected rather than global so independent replicators in one process never collide

use chrono::{DateTime, Utc};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::table::TableKey;

/// What the registry knows about a running reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderInfo {
    pub table: TableKey,
    pub started_at: DateTime<Utc>,
}

impl ReaderInfo {
    pub fn new(table: TableKey) -> Self {
        Self {
            table,
            started_at: Utc::now(),
        }
    }
}

/// Concurrency-safe map from `db.table` to the reader replicating it.
///
/// Cloning shares the underlying map.
#[derive(Debug, Clone, Default)]
pub struct ReaderRegistry {
    readers: Arc<Mutex<HashMap<String, Arc<ReaderInfo>>>>,
}

impl ReaderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `info` under `key` unless an entry exists.
    ///
    /// Returns the entry now stored and whether it was already there.
    pub fn load_or_store(&self, key: &str, info: Arc<ReaderInfo>) -> (Arc<ReaderInfo>, bool) {
        match self.lock().entry(key.to_string()) {
            Entry::Occupied(existing) => (Arc::clone(existing.get()), true),
            Entry::Vacant(slot) => (Arc::clone(slot.insert(info)), false),
        }
    }

    pub fn delete(&self, key: &str) {
        self.lock().remove(key);
    }

    pub fn get(&self, key: &str) -> Option<Arc<ReaderInfo>> {
        self.lock().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Tables with a running reader, sorted.
    pub fn running(&self) -> Vec<TableKey> {
        let mut tables: Vec<TableKey> = self.lock().values().map(|i| i.table.clone()).collect();
        tables.sort();
        tables
    }

    /// Register `table`, or return `None` when another reader already owns it.
    ///
    /// The entry is removed when the returned guard drops.
    pub fn register(&self, table: &TableKey) -> Option<Registration> {
        let key = table.qualified_name();
        let info = Arc::new(ReaderInfo::new(table.clone()));
        let (stored, loaded) = self.load_or_store(&key, Arc::clone(&info));
        if loaded {
            tracing::debug!(
                "Reader for {} already registered since {}",
                key,
                stored.started_at
            );
            return None;
        }
        Some(Registration {
            registry: self.clone(),
            key,
            info,
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<ReaderInfo>>> {
        self.readers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Registry entry owned by a running reader.
#[derive(Debug)]
pub struct Registration {
    registry: ReaderRegistry,
    key: String,
    info: Arc<ReaderInfo>,
}

impl Registration {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut readers = self.registry.lock();
        // Only remove our own entry, never one a later reader stored.
        if readers
            .get(&self.key)
            .is_some_and(|current| Arc::ptr_eq(current, &self.info))
        {
            readers.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_or_store_keeps_first_entry() {
        let registry = ReaderRegistry::new();
        let first = Arc::new(ReaderInfo::new(TableKey::new("db", "t")));
        let second = Arc::new(ReaderInfo::new(TableKey::new("db", "t")));

        let (stored, loaded) = registry.load_or_store("db.t", Arc::clone(&first));
        assert!(!loaded);
        assert!(Arc::ptr_eq(&stored, &first));

        let (stored, loaded) = registry.load_or_store("db.t", second);
        assert!(loaded);
        assert!(Arc::ptr_eq(&stored, &first));

        registry.delete("db.t");
        assert!(registry.is_empty());
    }

    #[test]
    fn test_registration_guard_deregisters() {
        let registry = ReaderRegistry::new();
        let table = TableKey::new("shop", "orders");
        {
            let guard = registry.register(&table).expect("first registration");
            assert_eq!(guard.key(), "shop.orders");
            assert!(registry.register(&table).is_none());
            assert_eq!(registry.running(), vec![table.clone()]);
        }
        assert!(!registry.contains("shop.orders"));
        assert!(registry.register(&table).is_some());
    }

    #[test]
    fn test_clones_share_state_but_registries_do_not() {
        let a = ReaderRegistry::new();
        let b = a.clone();
        let other = ReaderRegistry::new();
        let table = TableKey::new("db", "t");

        let _guard = a.register(&table).unwrap();
        assert!(b.contains("db.t"));
        assert!(other.register(&table).is_some());
    }
}
