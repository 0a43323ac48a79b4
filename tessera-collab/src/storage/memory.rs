//! In-memory gateway, used when no storage path is configured and in tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use tessera_core::Row;

use super::{PersistenceGateway, StoreError};

/// Grid blobs kept in a process-local map.
#[derive(Default)]
pub struct MemoryStore {
    blobs: Mutex<HashMap<String, Vec<Row>>>,
    /// Number of upcoming saves that will fail
    failing_saves: AtomicU32,
    saves: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate `key` with `rows`.
    pub fn with_grid(key: &str, rows: Vec<Row>) -> Self {
        let store = Self::new();
        if let Ok(mut blobs) = store.blobs.lock() {
            blobs.insert(key.to_string(), rows);
        }
        store
    }

    /// Make the next `count` saves fail with `StoreError::Unavailable`.
    pub fn fail_next_saves(&self, count: u32) {
        self.failing_saves.store(count, Ordering::SeqCst);
    }

    /// Number of successful saves so far.
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::SeqCst)
    }

    /// Copy of the rows currently stored under `key`.
    pub fn stored(&self, key: &str) -> Option<Vec<Row>> {
        self.blobs.lock().ok()?.get(key).cloned()
    }
}

impl PersistenceGateway for MemoryStore {
    fn load(&self, key: &str) -> Result<Option<Vec<Row>>, StoreError> {
        let blobs = self
            .blobs
            .lock()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(blobs.get(key).cloned())
    }

    fn save(&self, key: &str, rows: &[Row]) -> Result<(), StoreError> {
        let pending = self
            .failing_saves
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if pending.is_ok() {
            return Err(StoreError::Unavailable("injected failure".into()));
        }

        let mut blobs = self
            .blobs
            .lock()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        blobs.insert(key.to_string(), rows.to_vec());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::TileGrid;

    #[test]
    fn test_load_absent() {
        let store = MemoryStore::new();
        assert!(store.load("grid").unwrap().is_none());
    }

    #[test]
    fn test_save_load() {
        let store = MemoryStore::new();
        let rows = TileGrid::seeded().into_rows();
        store.save("grid", &rows).unwrap();
        assert_eq!(store.load("grid").unwrap(), Some(rows));
        assert_eq!(store.save_count(), 1);
    }

    #[test]
    fn test_injected_failures() {
        let store = MemoryStore::new();
        store.fail_next_saves(2);
        assert!(store.save("grid", &[]).is_err());
        assert!(store.save("grid", &[]).is_err());
        assert!(store.save("grid", &[]).is_ok());
        assert_eq!(store.save_count(), 1);
    }
}
