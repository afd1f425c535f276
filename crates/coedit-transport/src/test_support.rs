//! Shared fixtures for transport tests

use crate::metrics::Metrics;
use async_trait::async_trait;
use coedit_core::{ConnectionId, DocumentId};
use coedit_storage::{MemoryStorage, Storage, StorageError, StorageStats};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use yrs::updates::decoder::Decode;
use yrs::{Doc, GetString, ReadTxn, Text, Transact, Update};

pub(crate) fn doc(id: &str) -> DocumentId {
    DocumentId::new(id).unwrap()
}

pub(crate) fn conn(id: &str) -> ConnectionId {
    ConnectionId::new(id).unwrap()
}

pub(crate) fn metrics() -> Arc<Metrics> {
    Arc::new(Metrics::new().unwrap())
}

/// Inserts `chunk` into the client's text and returns the update it produced
pub(crate) fn edit_update(client: &Doc, index: u32, chunk: &str) -> Vec<u8> {
    let text = client.get_or_insert_text("content");
    let before = client.transact().state_vector();
    {
        let mut txn = client.transact_mut();
        text.insert(&mut txn, index, chunk);
    }
    client.transact().encode_state_as_update_v1(&before)
}

/// Applies an update received from the server to a client document
pub(crate) fn apply_to(client: &Doc, update: &[u8]) {
    let mut txn = client.transact_mut();
    txn.apply_update(Update::decode_v1(update).unwrap());
}

pub(crate) fn text_of(client: &Doc) -> String {
    let text = client.get_or_insert_text("content");
    let txn = client.transact();
    text.get_string(&txn)
}

/// Text held by a full-state encoding
pub(crate) fn content_of(update: &[u8]) -> String {
    let client = Doc::new();
    apply_to(&client, update);
    text_of(&client)
}

/// Memory storage that counts saves and can be told to fail
pub(crate) struct CountingStorage {
    inner: MemoryStorage,
    attempts: AtomicUsize,
    saves: AtomicUsize,
    loads: AtomicUsize,
    fail_remaining: AtomicUsize,
}

impl CountingStorage {
    pub(crate) fn new() -> Self {
        Self {
            inner: MemoryStorage::new(),
            attempts: AtomicUsize::new(0),
            saves: AtomicUsize::new(0),
            loads: AtomicUsize::new(0),
            fail_remaining: AtomicUsize::new(0),
        }
    }

    /// Fail the next `n` saves
    pub(crate) fn fail_next(&self, n: usize) {
        self.fail_remaining.store(n, Ordering::SeqCst);
    }

    pub(crate) fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub(crate) fn save_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub(crate) async fn stored(&self, id: &DocumentId) -> Option<Vec<u8>> {
        self.inner.load(id).await.unwrap()
    }
}

#[async_trait]
impl Storage for CountingStorage {
    async fn load(&self, id: &DocumentId) -> Result<Option<Vec<u8>>, StorageError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.inner.load(id).await
    }

    async fn save(&self, id: &DocumentId, state: &[u8]) -> Result<(), StorageError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StorageError::Unavailable("injected failure".into()));
        }
        self.inner.save(id, state).await?;
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stats(&self) -> Result<StorageStats, StorageError> {
        self.inner.stats().await
    }
}
