//! In-memory store, the default when no directory is configured

use super::{Persistence, PersistenceError};
use std::collections::BTreeMap;
use std::sync::Mutex;

#[derive(Debug, Default)]
struct MemoryState {
    open: bool,
    records: BTreeMap<String, Vec<u8>>,
}

/// Volatile store. Records survive `close`/`open` cycles of the same
/// instance, which mirrors a reconnect within one process.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    state: Mutex<MemoryState>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_open<T>(
        &self,
        f: impl FnOnce(&mut BTreeMap<String, Vec<u8>>) -> Result<T, PersistenceError>,
    ) -> Result<T, PersistenceError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !state.open {
            return Err(PersistenceError::NotOpen);
        }
        f(&mut state.records)
    }
}

impl Persistence for MemoryPersistence {
    fn open(&self, _client_id: &str, _server_uri: &str) -> Result<(), PersistenceError> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).open = true;
        Ok(())
    }

    fn close(&self) -> Result<(), PersistenceError> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).open = false;
        Ok(())
    }

    fn clear(&self) -> Result<(), PersistenceError> {
        self.with_open(|records| {
            records.clear();
            Ok(())
        })
    }

    fn put(&self, key: &str, record: &[u8]) -> Result<(), PersistenceError> {
        self.with_open(|records| {
            records.insert(key.to_string(), record.to_vec());
            Ok(())
        })
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, PersistenceError> {
        self.with_open(|records| {
            records
                .get(key)
                .cloned()
                .ok_or_else(|| PersistenceError::NotFound {
                    key: key.to_string(),
                })
        })
    }

    fn contains_key(&self, key: &str) -> Result<bool, PersistenceError> {
        self.with_open(|records| Ok(records.contains_key(key)))
    }

    fn remove(&self, key: &str) -> Result<(), PersistenceError> {
        self.with_open(|records| {
            records.remove(key);
            Ok(())
        })
    }

    fn keys(&self) -> Result<Vec<String>, PersistenceError> {
        self.with_open(|records| Ok(records.keys().cloned().collect()))
    }
}
