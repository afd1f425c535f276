//! Replica Registry - owns one in-memory replica per active document

use crate::document::{DocumentId, Replica, ReplicaInfo};
use crate::engine::{EngineFactory, YrsEngine};
use crate::error::{Error, Result};
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// Sole owner of document replicas.
///
/// Lookups go through a sharded map; mutations go through each replica's own
/// lock, so unrelated documents proceed in parallel.
pub struct ReplicaRegistry {
    replicas: DashMap<DocumentId, Arc<Replica>>,
    new_engine: EngineFactory,
}

impl ReplicaRegistry {
    /// Create a registry backed by `yrs` replicas
    pub fn new() -> Self {
        Self::with_engine(YrsEngine::boxed)
    }

    /// Create a registry with a custom engine factory
    pub fn with_engine(new_engine: EngineFactory) -> Self {
        Self {
            replicas: DashMap::new(),
            new_engine,
        }
    }

    /// Get the replica for `id`, creating it if absent.
    ///
    /// A new replica is seeded from whatever `load` returns. A missing
    /// document, a failed load or undecodable bytes all degrade to an empty
    /// document; the join is never blocked on storage.
    pub async fn get_or_create<F, Fut, E>(&self, id: &DocumentId, load: F) -> Arc<Replica>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<Option<Vec<u8>>, E>>,
        E: std::fmt::Display,
    {
        if let Some(existing) = self.get(id) {
            return existing;
        }

        let replica = Replica::new(id.clone(), (self.new_engine)());
        match load().await {
            Ok(Some(bytes)) => match replica.restore(&bytes) {
                Ok(()) => debug!(doc_id = %id, bytes = bytes.len(), "Replica loaded from storage"),
                Err(e) => warn!(doc_id = %id, error = %e, "Persisted state undecodable, starting empty"),
            },
            Ok(None) => debug!(doc_id = %id, "No persisted state, starting empty"),
            Err(e) => warn!(doc_id = %id, error = %e, "Failed to load document, starting empty"),
        }

        self.replicas
            .entry(id.clone())
            .or_insert_with(|| Arc::new(replica))
            .value()
            .clone()
    }

    /// Get a loaded replica
    pub fn get(&self, id: &DocumentId) -> Option<Arc<Replica>> {
        self.replicas.get(id).map(|r| r.value().clone())
    }

    fn require(&self, id: &DocumentId) -> Result<Arc<Replica>> {
        self.get(id)
            .ok_or_else(|| Error::DocumentNotLoaded(id.to_string()))
    }

    /// Apply an update to a loaded replica. See [`Replica::apply_update`].
    pub fn apply_update<F>(&self, id: &DocumentId, update: &[u8], on_change: F) -> Result<bool>
    where
        F: FnOnce(&[u8]),
    {
        self.require(id)?.apply_update(update, on_change)
    }

    /// Full state encoding and the version it reflects
    pub fn encode_full(&self, id: &DocumentId) -> Result<(Vec<u8>, u64)> {
        Ok(self.require(id)?.encode_full())
    }

    /// Everything a peer holding `state_vector` is missing
    pub fn encode_diff(&self, id: &DocumentId, state_vector: &[u8]) -> Result<Vec<u8>> {
        self.require(id)?.encode_diff(state_vector)
    }

    pub fn state_vector(&self, id: &DocumentId) -> Result<Vec<u8>> {
        Ok(self.require(id)?.state_vector())
    }

    pub fn mark_persisted(&self, id: &DocumentId, version: u64) {
        if let Some(replica) = self.get(id) {
            replica.mark_persisted(version);
        }
    }

    pub fn is_dirty(&self, id: &DocumentId) -> bool {
        self.get(id).map_or(false, |r| r.is_dirty())
    }

    /// Drop a replica from memory
    pub fn evict(&self, id: &DocumentId) -> Option<Arc<Replica>> {
        let evicted = self.replicas.remove(id).map(|(_, r)| r);
        if evicted.is_some() {
            debug!(doc_id = %id, "Replica evicted");
        }
        evicted
    }

    /// Number of loaded replicas
    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    /// IDs of every loaded replica
    pub fn ids(&self) -> Vec<DocumentId> {
        self.replicas.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Diagnostics for every loaded replica
    pub fn list(&self) -> Vec<ReplicaInfo> {
        self.replicas.iter().map(|entry| entry.value().info()).collect()
    }

    /// Get statistics
    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats::default();
        for entry in self.replicas.iter() {
            stats.replica_count += 1;
            if entry.value().is_dirty() {
                stats.dirty_count += 1;
            }
        }
        stats
    }
}

impl Default for ReplicaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry statistics
#[derive(Debug, Clone, Default)]
pub struct RegistryStats {
    pub replica_count: usize,
    pub dirty_count: usize,
}
