//! In-memory storage backend

use crate::{Storage, StorageError, StorageStats};
use async_trait::async_trait;
use coedit_core::DocumentId;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// In-memory storage backend
///
/// Fast, volatile storage suitable for development and tests.
/// Data is lost when the process exits.
pub struct MemoryStorage {
    /// Document state: id -> bytes
    data: DashMap<DocumentId, Vec<u8>>,
    /// Total size tracking
    total_size: AtomicUsize,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
            total_size: AtomicUsize::new(0),
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn load(&self, id: &DocumentId) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.data.get(id).map(|entry| entry.value().clone()))
    }

    async fn save(&self, id: &DocumentId, state: &[u8]) -> Result<(), StorageError> {
        let previous = self.data.insert(id.clone(), state.to_vec());

        if let Some(old) = previous {
            self.total_size.fetch_sub(old.len(), Ordering::Relaxed);
        }
        self.total_size.fetch_add(state.len(), Ordering::Relaxed);
        Ok(())
    }

    async fn stats(&self) -> Result<StorageStats, StorageError> {
        Ok(StorageStats {
            document_count: self.data.len(),
            total_size_bytes: self.total_size.load(Ordering::Relaxed),
        })
    }
}
