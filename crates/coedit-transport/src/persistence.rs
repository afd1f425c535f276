//! Debounced persistence of replicas

use crate::config::ServiceConfig;
use crate::metrics::Metrics;
use coedit_core::{DocumentId, ReplicaRegistry};
use coedit_storage::{Storage, StorageError};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SaveKind {
    Debounced,
    Final,
}

impl SaveKind {
    fn as_str(self) -> &'static str {
        match self {
            SaveKind::Debounced => "debounced",
            SaveKind::Final => "final",
        }
    }
}

struct PendingSave {
    due_at: tokio::time::Instant,
    generation: u64,
    task: JoinHandle<()>,
}

struct SchedulerInner {
    registry: Arc<ReplicaRegistry>,
    storage: Arc<dyn Storage>,
    metrics: Arc<Metrics>,
    config: ServiceConfig,
    pending: Mutex<HashMap<DocumentId, PendingSave>>,
    /// Serializes encode + save per document so an older snapshot never
    /// lands after a newer one
    gates: DashMap<DocumentId, Arc<tokio::sync::Mutex<()>>>,
    next_generation: AtomicU64,
}

/// Turns a stream of changes into few, ordered saves.
///
/// Every change rearms a per-document timer; the save happens once the
/// document has been quiet for `save_debounce`.
#[derive(Clone)]
pub struct PersistenceScheduler {
    inner: Arc<SchedulerInner>,
}

impl PersistenceScheduler {
    pub fn new(
        registry: Arc<ReplicaRegistry>,
        storage: Arc<dyn Storage>,
        metrics: Arc<Metrics>,
        config: ServiceConfig,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                registry,
                storage,
                metrics,
                config,
                pending: Mutex::new(HashMap::new()),
                gates: DashMap::new(),
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    /// (Re)arm the save timer for `doc`. Must be called from within a tokio
    /// runtime.
    pub fn schedule_save(&self, doc: &DocumentId) {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let due_at = tokio::time::Instant::now() + self.inner.config.save_debounce;

        // The task claims its entry under this lock, so it cannot observe the
        // map before the insert below.
        let mut pending = self.inner.pending.lock();

        let inner = Arc::clone(&self.inner);
        let id = doc.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep_until(due_at).await;
            {
                let mut pending = inner.pending.lock();
                match pending.get(&id) {
                    Some(entry) if entry.generation == generation => {
                        pending.remove(&id);
                    }
                    _ => return,
                }
            }
            // Failure is already logged and counted; the replica stays dirty
            // until the next change or the final flush.
            let _ = inner.save(&id, SaveKind::Debounced).await;
        });

        if let Some(previous) = pending.insert(
            doc.clone(),
            PendingSave {
                due_at,
                generation,
                task,
            },
        ) {
            previous.task.abort();
        }
        debug!(doc_id = %doc, "Save scheduled");
    }

    /// Save `doc` right away if it has unsaved changes, cancelling any pending
    /// timer. Retries with backoff; the last error is returned.
    pub async fn final_flush(&self, doc: &DocumentId) -> Result<(), StorageError> {
        if let Some(previous) = self.inner.pending.lock().remove(doc) {
            previous.task.abort();
        }

        let attempts = self.inner.config.final_flush_attempts.max(1);
        let mut attempt = 1;
        let result = loop {
            match self.inner.save(doc, SaveKind::Final).await {
                Ok(()) => break Ok(()),
                Err(e) if attempt < attempts => {
                    warn!(doc_id = %doc, attempt, error = %e, "Final flush failed, retrying");
                    tokio::time::sleep(self.inner.config.final_flush_backoff).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(doc_id = %doc, attempts, error = %e, "Final flush failed, unsaved changes lost");
                    break Err(e);
                }
            }
        };

        self.inner
            .gates
            .remove_if(doc, |_, gate| Arc::strong_count(gate) == 1);
        result
    }

    /// Number of armed save timers
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    pub fn is_pending(&self, doc: &DocumentId) -> bool {
        self.inner.pending.lock().contains_key(doc)
    }

    /// When the armed save for `doc` will fire
    pub fn due_at(&self, doc: &DocumentId) -> Option<tokio::time::Instant> {
        self.inner.pending.lock().get(doc).map(|p| p.due_at)
    }
}

impl SchedulerInner {
    async fn save(&self, doc: &DocumentId, kind: SaveKind) -> Result<(), StorageError> {
        let gate = self.gates.entry(doc.clone()).or_default().clone();
        let _guard = gate.lock().await;

        let Some(replica) = self.registry.get(doc) else {
            return Ok(());
        };
        if !replica.is_dirty() {
            return Ok(());
        }

        let (state, version) = replica.encode_full();
        let started = Instant::now();
        let result = self.storage.save(doc, &state).await;
        let elapsed = started.elapsed().as_secs_f64();
        self.metrics.record_save(kind.as_str(), result.is_ok(), elapsed);

        match result {
            Ok(()) => {
                replica.mark_persisted(version);
                debug!(doc_id = %doc, version, bytes = state.len(), kind = kind.as_str(), "Document saved");
                Ok(())
            }
            Err(e) => {
                warn!(doc_id = %doc, kind = kind.as_str(), error = %e, "Failed to save document");
                Err(e)
            }
        }
    }
}

impl Drop for SchedulerInner {
    fn drop(&mut self) {
        for (_, pending) in self.pending.get_mut().drain() {
            pending.task.abort();
        }
    }
}
