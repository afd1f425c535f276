//! coedit Storage Backends
//!
//! Durable home of merged document state, keyed by document ID:
//! - Memory (default): Fast, volatile storage
//! - SQLite: Embedded persistence
//!
//! The service treats stored bytes as opaque; they are whatever the CRDT
//! engine produced as its full state encoding.

#[cfg(feature = "memory")]
pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use async_trait::async_trait;
use coedit_core::DocumentId;

/// Storage backend trait
#[async_trait]
pub trait Storage: Send + Sync {
    /// Load the persisted state of a document, `None` if it was never saved
    async fn load(&self, id: &DocumentId) -> Result<Option<Vec<u8>>, StorageError>;

    /// Replace the persisted state of a document
    async fn save(&self, id: &DocumentId, state: &[u8]) -> Result<(), StorageError>;

    /// Get storage statistics
    async fn stats(&self) -> Result<StorageStats, StorageError>;
}

/// Storage error types
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Storage statistics
#[derive(Debug, Clone, Default)]
pub struct StorageStats {
    pub document_count: usize,
    pub total_size_bytes: usize,
}

#[cfg(feature = "memory")]
pub use memory::MemoryStorage;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;
