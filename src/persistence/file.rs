//! File-backed store: one file per record under a per-client directory

use super::{Persistence, PersistenceError};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

const RECORD_EXTENSION: &str = "msg";

/// Durable store rooted at `base_dir`
///
/// `open(client_id, server_uri)` selects the sub-directory
/// `<client_id>-<server_uri>` with every character outside `[A-Za-z0-9._-]`
/// dropped, so two clients sharing a base directory never see each other's
/// records.
#[derive(Debug)]
pub struct FilePersistence {
    base_dir: PathBuf,
    client_dir: Mutex<Option<PathBuf>>,
}

impl FilePersistence {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            client_dir: Mutex::new(None),
        }
    }

    /// Directory used for a given client, whether or not it exists yet
    pub fn client_dir_for(base_dir: &Path, client_id: &str, server_uri: &str) -> PathBuf {
        let name: String = format!("{client_id}-{server_uri}")
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
            .collect();
        base_dir.join(name)
    }

    fn dir(&self) -> Result<PathBuf, PersistenceError> {
        self.client_dir
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(PersistenceError::NotOpen)
    }

    fn record_path(dir: &Path, key: &str) -> PathBuf {
        dir.join(format!("{key}.{RECORD_EXTENSION}"))
    }
}

/// Read every record in a client directory without opening a store.
/// Used by the `inspect` command.
pub fn read_records(dir: &Path) -> Result<Vec<(String, Vec<u8>)>, PersistenceError> {
    let mut records = Vec::new();
    for key in list_keys(dir)? {
        let path = FilePersistence::record_path(dir, &key);
        let bytes =
            fs::read(&path).map_err(|e| PersistenceError::io(path.display().to_string(), e))?;
        records.push((key, bytes));
    }
    Ok(records)
}

fn list_keys(dir: &Path) -> Result<Vec<String>, PersistenceError> {
    let entries =
        fs::read_dir(dir).map_err(|e| PersistenceError::io(dir.display().to_string(), e))?;

    let mut keys = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| PersistenceError::io(dir.display().to_string(), e))?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            keys.push(stem.to_string());
        }
    }
    keys.sort();
    Ok(keys)
}

impl Persistence for FilePersistence {
    fn open(&self, client_id: &str, server_uri: &str) -> Result<(), PersistenceError> {
        let dir = Self::client_dir_for(&self.base_dir, client_id, server_uri);
        fs::create_dir_all(&dir).map_err(|e| PersistenceError::io(dir.display().to_string(), e))?;
        debug!(path = %dir.display(), "Opened file persistence");
        *self.client_dir.lock().unwrap_or_else(|e| e.into_inner()) = Some(dir);
        Ok(())
    }

    fn close(&self) -> Result<(), PersistenceError> {
        let dir = self.client_dir.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(dir) = dir {
            // an empty client directory is left behind by every clean session
            if list_keys(&dir).map(|k| k.is_empty()).unwrap_or(false) {
                if let Err(e) = fs::remove_dir(&dir) {
                    warn!(
                        path = %dir.display(),
                        error = %e,
                        "Failed to remove empty persistence directory"
                    );
                }
            }
        }
        Ok(())
    }

    fn clear(&self) -> Result<(), PersistenceError> {
        let dir = self.dir()?;
        for key in list_keys(&dir)? {
            self.remove(&key)?;
        }
        Ok(())
    }

    fn put(&self, key: &str, record: &[u8]) -> Result<(), PersistenceError> {
        let dir = self.dir()?;
        let path = Self::record_path(&dir, key);
        let tmp = dir.join(format!("{key}.{RECORD_EXTENSION}.tmp"));
        fs::write(&tmp, record).map_err(|e| PersistenceError::io(tmp.display().to_string(), e))?;
        fs::rename(&tmp, &path).map_err(|e| PersistenceError::io(path.display().to_string(), e))
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, PersistenceError> {
        let dir = self.dir()?;
        let path = Self::record_path(&dir, key);
        fs::read(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => PersistenceError::NotFound {
                key: key.to_string(),
            },
            _ => PersistenceError::io(path.display().to_string(), e),
        })
    }

    fn contains_key(&self, key: &str) -> Result<bool, PersistenceError> {
        let dir = self.dir()?;
        Ok(Self::record_path(&dir, key).exists())
    }

    fn remove(&self, key: &str) -> Result<(), PersistenceError> {
        let dir = self.dir()?;
        let path = Self::record_path(&dir, key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PersistenceError::io(path.display().to_string(), e)),
        }
    }

    fn keys(&self) -> Result<Vec<String>, PersistenceError> {
        list_keys(&self.dir()?)
    }
}
