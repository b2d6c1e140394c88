//! Key-value store client seam.
//!
//! The mesh-wide KV store is an external collaborator; the prefix manager
//! only needs to publish its own key with a TTL and refresh it. The
//! in-memory implementation backs tests and single-process embedders.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Errors from KV publication.
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("kv publish failed: {0}")]
    Publish(String),
}

/// Client for the shared key-value store.
pub trait KvClient: Send {
    /// Publish (or refresh) `key` with the given value and TTL.
    fn persist_key(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl_ms: u64,
    ) -> impl Future<Output = Result<(), KvError>> + Send;
}

/// One published KV record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvRecord {
    pub value: Vec<u8>,
    pub ttl_ms: u64,
    /// Bumped on every write, so tests can count refreshes.
    pub version: u64,
}

/// In-process KV store. Cloning shares the underlying table.
#[derive(Debug, Clone, Default)]
pub struct MemoryKvStore {
    inner: Arc<Mutex<HashMap<String, KvRecord>>>,
}

impl MemoryKvStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<KvRecord> {
        self.inner
            .lock()
            .expect("kv lock poisoned")
            .get(key)
            .cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("kv lock poisoned").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KvClient for MemoryKvStore {
    async fn persist_key(&self, key: &str, value: Vec<u8>, ttl_ms: u64) -> Result<(), KvError> {
        let mut inner = self.inner.lock().expect("kv lock poisoned");
        let version = inner.get(key).map(|r| r.version + 1).unwrap_or(1);
        inner.insert(
            key.to_string(),
            KvRecord {
                value,
                ttl_ms,
                version,
            },
        );
        Ok(())
    }
}
