use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{DashMap, mapref::entry::Entry};

use crate::application::ports::{DurableStore, StoreError};

/// Process-local blob store. Contents are lost on exit.
#[derive(Debug, Default)]
pub struct MemoryStore {
    blobs: DashMap<String, Bytes>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.blobs.contains_key(key))
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        Ok(self.blobs.get(key).map(|entry| entry.value().clone()))
    }

    async fn put(&self, key: &str, blob: Bytes, overwrite: bool) -> Result<(), StoreError> {
        match self.blobs.entry(key.to_string()) {
            Entry::Occupied(_) if !overwrite => Err(StoreError::AlreadyExists(key.to_string())),
            Entry::Occupied(mut entry) => {
                entry.insert(blob);
                Ok(())
            }
            Entry::Vacant(entry) => {
                entry.insert(blob);
                Ok(())
            }
        }
    }
}
