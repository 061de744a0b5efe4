//! Key/value backends for persisted checkpoints.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse store file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Failed to serialize store file: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Value {value} stored under {key} is out of range")]
    Corrupt { key: String, value: u32 },
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Persistence backend: unsigned 32-bit values under string keys.
pub trait CheckpointStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<u32>, StoreError>;

    fn set(&self, key: &str, value: u32) -> Result<(), StoreError>;

    /// Write several values as one update. Backends that can should make
    /// this all-or-nothing.
    fn set_many(&self, entries: &[(String, u32)]) -> Result<(), StoreError> {
        for (key, value) in entries {
            self.set(key, *value)?;
        }
        Ok(())
    }
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<BTreeMap<String, u32>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following write fail, for exercising error paths.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> BTreeMap<String, u32> {
        self.values.lock().clone()
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("writes disabled".into()));
        }
        Ok(())
    }
}

impl CheckpointStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<u32>, StoreError> {
        Ok(self.values.lock().get(key).copied())
    }

    fn set(&self, key: &str, value: u32) -> Result<(), StoreError> {
        self.check_writable()?;
        self.values.lock().insert(key.to_string(), value);
        Ok(())
    }

    fn set_many(&self, entries: &[(String, u32)]) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut values = self.values.lock();
        for (key, value) in entries {
            values.insert(key.clone(), *value);
        }
        Ok(())
    }
}

impl<S: CheckpointStore + ?Sized> CheckpointStore for std::sync::Arc<S> {
    fn get(&self, key: &str) -> Result<Option<u32>, StoreError> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: u32) -> Result<(), StoreError> {
        (**self).set(key, value)
    }

    fn set_many(&self, entries: &[(String, u32)]) -> Result<(), StoreError> {
        (**self).set_many(entries)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    values: BTreeMap<String, u32>,
}

/// Store backed by a TOML file. Every update rewrites the file through a
/// temporary sibling and a rename.
#[derive(Debug)]
pub struct TomlFileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl TomlFileStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<StoreFile, StoreError> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => Ok(toml::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StoreFile::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, file: &StoreFile) -> Result<(), StoreError> {
        let content = toml::to_string_pretty(file)?;
        let tmp = self.path.with_extension("toml.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl CheckpointStore for TomlFileStore {
    fn get(&self, key: &str) -> Result<Option<u32>, StoreError> {
        let _guard = self.lock.lock();
        Ok(self.load()?.values.get(key).copied())
    }

    fn set(&self, key: &str, value: u32) -> Result<(), StoreError> {
        self.set_many(&[(key.to_string(), value)])
    }

    fn set_many(&self, entries: &[(String, u32)]) -> Result<(), StoreError> {
        let _guard = self.lock.lock();
        let mut file = self.load()?;
        for (key, value) in entries {
            file.values.insert(key.clone(), *value);
        }
        self.save(&file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        assert_eq!(store.get("a").unwrap(), None);
        store.set("a", 7).unwrap();
        assert_eq!(store.get("a").unwrap(), Some(7));

        store.set_fail_writes(true);
        assert!(store.set("a", 8).is_err());
        assert_eq!(store.get("a").unwrap(), Some(7));
    }

    #[test]
    fn test_toml_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoints.toml");

        let store = TomlFileStore::new(&path);
        store
            .set_many(&[
                ("InstanceID:dock:Component21ResumeOnConnect".to_string(), 1),
                ("Component21ResumeSequenceNumber".to_string(), 42),
            ])
            .unwrap();

        let reopened = TomlFileStore::new(&path);
        assert_eq!(
            reopened
                .get("InstanceID:dock:Component21ResumeOnConnect")
                .unwrap(),
            Some(1)
        );
        assert_eq!(
            reopened.get("Component21ResumeSequenceNumber").unwrap(),
            Some(42)
        );
        assert_eq!(reopened.get("missing").unwrap(), None);
    }

    #[test]
    fn test_toml_store_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "values = 3").unwrap();
        let store = TomlFileStore::new(&path);
        assert!(matches!(store.get("x"), Err(StoreError::Parse(_))));
    }
}
