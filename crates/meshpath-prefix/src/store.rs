//! Keyed blob persistence for the prefix manager.
//!
//! The on-disk layout is one file per key under a base directory, written
//! atomically (write to `.tmp`, then rename) to prevent corruption.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::fs;

/// Errors from persistent store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to determine store directory: {0}")]
    Directory(String),
}

/// A keyed blob store.
///
/// Values are opaque bytes; serialization stays with the caller. `load`
/// returns `Ok(None)` for absent keys so a fresh start is not an error.
pub trait ConfigStore: Send {
    fn load(&self, key: &str) -> impl Future<Output = Result<Option<Vec<u8>>, StoreError>> + Send;
    fn store(&self, key: &str, value: &[u8])
    -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// File-backed store, one file per key.
pub struct FileConfigStore {
    base_dir: PathBuf,
}

impl FileConfigStore {
    /// Create a store rooted at `base_dir`, creating the directory if needed.
    pub fn new(base_dir: PathBuf) -> Result<Self, StoreError> {
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir })
    }

    /// Create a store at the default path (`~/.meshpath/store`).
    pub fn default_path() -> Result<Self, StoreError> {
        let home = dirs::home_dir()
            .ok_or_else(|| StoreError::Directory("could not determine home directory".into()))?;
        Self::new(home.join(".meshpath").join("store"))
    }

    /// Write data atomically: write to a `.tmp` file then rename.
    async fn atomic_write(&self, path: &Path, data: &[u8]) -> Result<(), StoreError> {
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, data).await?;
        fs::rename(&tmp_path, path).await?;
        Ok(())
    }
}

impl ConfigStore for FileConfigStore {
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.base_dir.join(key);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn store(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.atomic_write(&self.base_dir.join(key), value).await
    }
}

/// In-memory store for tests and embedders without durable storage.
/// Cloning shares the underlying table.
#[derive(Debug, Clone, Default)]
pub struct MemoryConfigStore {
    inner: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryConfigStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct read access for test assertions.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.inner
            .lock()
            .expect("store lock poisoned")
            .get(key)
            .cloned()
    }

    /// Number of stored keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("store lock poisoned").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Seed a value, bypassing the trait.
    pub fn put(&self, key: &str, value: Vec<u8>) {
        self.inner
            .lock()
            .expect("store lock poisoned")
            .insert(key.to_string(), value);
    }
}

impl ConfigStore for MemoryConfigStore {
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.get(key))
    }

    async fn store(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.put(key, value.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileConfigStore::new(dir.path().to_path_buf()).unwrap();

        store.store("some-key", b"payload").await.unwrap();
        let loaded = store.load("some-key").await.unwrap();
        assert_eq!(loaded.as_deref(), Some(&b"payload"[..]));
    }

    #[tokio::test]
    async fn file_store_missing_key_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileConfigStore::new(dir.path().to_path_buf()).unwrap();

        assert!(store.load("absent").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_store_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileConfigStore::new(dir.path().to_path_buf()).unwrap();

        store.store("k", b"one").await.unwrap();
        store.store("k", b"two").await.unwrap();
        assert_eq!(store.load("k").await.unwrap().as_deref(), Some(&b"two"[..]));
    }

    #[tokio::test]
    async fn file_store_leaves_no_tmp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileConfigStore::new(dir.path().to_path_buf()).unwrap();

        store.store("k", b"data").await.unwrap();
        assert!(dir.path().join("k").exists());
        assert!(!dir.path().join("k.tmp").exists());
    }

    #[test]
    fn file_store_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");

        assert!(!nested.exists());
        let _store = FileConfigStore::new(nested.clone()).unwrap();
        assert!(nested.exists());
    }

    #[tokio::test]
    async fn memory_store_roundtrip() {
        let store = MemoryConfigStore::new();
        assert!(store.load("k").await.unwrap().is_none());

        store.store("k", b"v").await.unwrap();
        assert_eq!(store.load("k").await.unwrap().as_deref(), Some(&b"v"[..]));
        assert_eq!(store.len(), 1);
    }
}
