//! Content-addressed node store
//!
//! The light client keeps fetched trie nodes and code blobs in a local
//! key-value store keyed by content hash. The on-disk engine is external; this
//! module defines the narrow interface the sync layer consumes and an
//! in-memory implementation.

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::RwLock;

use crate::{Hash, Result};

/// Content-addressed key-value store.
///
/// Values are immutable once written: the key is the hash of the value, so a
/// second `put` under the same key always carries identical bytes.
pub trait NodeStore: Send + Sync + 'static {
    /// Read the value stored under `hash`
    fn get(&self, hash: &Hash) -> Result<Option<Bytes>>;

    /// Store `value` under `hash`
    fn put(&self, hash: Hash, value: Bytes) -> Result<()>;

    /// Check whether a value is stored under `hash`
    fn has(&self, hash: &Hash) -> Result<bool> {
        Ok(self.get(hash)?.is_some())
    }
}

/// In-memory node store
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<Hash, Bytes>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Check if the store is empty
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Remove an entry, returning whether it existed
    pub fn remove(&self, hash: &Hash) -> bool {
        self.entries.write().remove(hash).is_some()
    }

    /// All stored keys
    pub fn keys(&self) -> Vec<Hash> {
        self.entries.read().keys().copied().collect()
    }
}

impl NodeStore for MemoryStore {
    fn get(&self, hash: &Hash) -> Result<Option<Bytes>> {
        Ok(self.entries.read().get(hash).cloned())
    }

    fn put(&self, hash: Hash, value: Bytes) -> Result<()> {
        self.entries.write().insert(hash, value);
        Ok(())
    }

    fn has(&self, hash: &Hash) -> Result<bool> {
        Ok(self.entries.read().contains_key(hash))
    }
}
