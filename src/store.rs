use std::collections::HashMap;

use ahash::RandomState;
use parking_lot::RwLock;

use crate::error::StoreError;
use crate::key::SafeKey;
use crate::traits::{BlobStore, BlobWriter};

/// A [BlobStore] which keeps everything in memory.  Mostly useful for tests and as a stand-in for a disk cache.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    entries: RwLock<HashMap<SafeKey, Vec<u8>, RandomState>>,
}

impl MemoryBlobStore {
    pub fn new() -> MemoryBlobStore {
        Default::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Total bytes stored.
    pub fn total_bytes(&self) -> u64 {
        self.entries.read().values().map(|v| v.len() as u64).sum()
    }
}

impl BlobStore for MemoryBlobStore {
    fn get(&self, key: &SafeKey) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put(&self, key: &SafeKey, writer: &mut dyn BlobWriter) -> Result<bool, StoreError> {
        // Stage into a scratch buffer so a failed write never replaces what is there.
        let mut staged: Vec<u8> = vec![];
        if !writer.write(&mut staged)? {
            return Ok(false);
        }
        self.entries.write().insert(key.clone(), staged);
        Ok(true)
    }

    fn delete(&self, key: &SafeKey) -> Result<bool, StoreError> {
        Ok(self.entries.write().remove(key).is_some())
    }
}
