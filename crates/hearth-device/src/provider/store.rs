use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{Error, ErrorKind, Result};

/// The persistent key-value store holding device settings and the
/// revocation blacklist.
///
/// Reads happen at initialization and are synchronous; writes may coalesce
/// and complete asynchronously. Values are opaque strings; the core stores
/// JSON documents in them.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Returns the stored value under `key`, when present.
    fn load(&self, key: &str) -> Option<String>;

    /// Persists `value` under `key`.
    ///
    /// # Errors
    ///
    /// Fails with `invalidState` when the value could not be persisted.
    async fn save(&self, key: &str, value: String) -> Result<()>;
}

/// A [`ConfigStore`] keeping everything in memory.
///
/// Useful for tests and for integrations that persist elsewhere.
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryConfigStore {
    /// Creates an empty [`MemoryConfigStore`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a [`MemoryConfigStore`] preloaded with one entry.
    #[must_use]
    pub fn with_entry(key: impl Into<String>, value: impl Into<String>) -> Self {
        let store = Self::new();
        store
            .entries
            .lock()
            .unwrap()
            .insert(key.into(), value.into());
        store
    }

    /// Returns a copy of the stored value under `key`, when present.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().unwrap().get(key).cloned()
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    fn load(&self, key: &str) -> Option<String> {
        self.get(key)
    }

    async fn save(&self, key: &str, value: String) -> Result<()> {
        self.entries.lock().unwrap().insert(key.to_owned(), value);
        Ok(())
    }
}

/// A [`ConfigStore`] persisting each key as a JSON file in a directory.
#[derive(Debug, Clone)]
pub struct FileConfigStore {
    directory: PathBuf,
}

impl FileConfigStore {
    /// Creates a [`FileConfigStore`] rooted at the given directory.
    ///
    /// The directory must already exist.
    #[must_use]
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    fn path(&self, key: &str) -> PathBuf {
        self.directory.join(format!("{key}.json"))
    }
}

#[async_trait]
impl ConfigStore for FileConfigStore {
    fn load(&self, key: &str) -> Option<String> {
        std::fs::read_to_string(self.path(key)).ok()
    }

    async fn save(&self, key: &str, value: String) -> Result<()> {
        let path = self.path(key);
        tokio::task::spawn_blocking(move || std::fs::write(&path, value))
            .await
            .map_err(|e| Error::with_source(ErrorKind::InvalidState, "Store task failed", e))?
            .map_err(|e| {
                Error::with_source(ErrorKind::InvalidState, "Failed to write the store file", e)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::{ConfigStore, MemoryConfigStore};

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = MemoryConfigStore::new();
        assert_eq!(store.load("settings"), None);

        store
            .save("settings", r#"{"version":1}"#.to_owned())
            .await
            .unwrap();
        assert_eq!(store.load("settings").as_deref(), Some(r#"{"version":1}"#));
    }
}
