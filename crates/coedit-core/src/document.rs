//! Document identifiers and in-memory replicas

use crate::engine::CrdtEngine;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// Maximum size of a single incoming update (16MB)
pub const MAX_UPDATE_SIZE: usize = 16 * 1024 * 1024;

/// Document identifier - UTF-8 string, max 512 bytes
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DocumentId(String);

impl DocumentId {
    /// Create a new document ID, validating the format
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();

        if id.is_empty() {
            return Err(Error::InvalidDocumentId("Document ID cannot be empty".into()));
        }

        if id.len() > 512 {
            return Err(Error::InvalidDocumentId("Document ID exceeds 512 bytes".into()));
        }

        // Validate pattern: [a-zA-Z0-9:_.-]+
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, ':' | '_' | '-' | '.'))
        {
            return Err(Error::InvalidDocumentId(
                "Document ID must match pattern [a-zA-Z0-9:_.-]+".into(),
            ));
        }

        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for DocumentId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<DocumentId> for String {
    fn from(id: DocumentId) -> Self {
        id.0
    }
}

/// Point-in-time view of a replica, for diagnostics
#[derive(Debug, Clone)]
pub struct ReplicaInfo {
    pub id: DocumentId,
    pub version: u64,
    pub dirty: bool,
    pub last_persisted_at: Option<SystemTime>,
}

struct ReplicaState {
    engine: Box<dyn CrdtEngine>,
    /// Bumped on every update that changed the document
    version: u64,
    /// Version of the last state that reached storage
    persisted_version: u64,
    last_persisted_at: Option<SystemTime>,
}

/// One in-memory CRDT replica.
///
/// All access to the engine goes through a lock owned by this replica alone,
/// so edits to the same document are applied one at a time while different
/// documents never contend with each other.
pub struct Replica {
    id: DocumentId,
    state: Mutex<ReplicaState>,
}

impl Replica {
    pub(crate) fn new(id: DocumentId, engine: Box<dyn CrdtEngine>) -> Self {
        Self {
            id,
            state: Mutex::new(ReplicaState {
                engine,
                version: 0,
                persisted_version: 0,
                last_persisted_at: None,
            }),
        }
    }

    /// Seed a fresh replica from persisted bytes. The loaded state counts as
    /// already persisted.
    pub(crate) fn restore(&self, persisted: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        state.engine.apply_update(persisted)?;
        state.last_persisted_at = Some(SystemTime::now());
        Ok(())
    }

    pub fn id(&self) -> &DocumentId {
        &self.id
    }

    /// Apply an update. When it changed the document, `on_change` receives the
    /// resulting diff before the lock is released.
    pub fn apply_update<F>(&self, update: &[u8], on_change: F) -> Result<bool>
    where
        F: FnOnce(&[u8]),
    {
        if update.len() > MAX_UPDATE_SIZE {
            return Err(Error::UpdateTooLarge {
                size: update.len(),
                limit: MAX_UPDATE_SIZE,
            });
        }

        let mut state = self.state.lock();
        match state.engine.apply_update(update)? {
            Some(diff) => {
                state.version += 1;
                on_change(&diff);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Full state encoding together with the version it reflects
    pub fn encode_full(&self) -> (Vec<u8>, u64) {
        let state = self.state.lock();
        (state.engine.encode_state_as_update(), state.version)
    }

    /// Run `f` over the full state while no update can slip in
    pub fn encode_full_with<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let state = self.state.lock();
        let full = state.engine.encode_state_as_update();
        f(&full)
    }

    pub fn encode_diff(&self, state_vector: &[u8]) -> Result<Vec<u8>> {
        self.state.lock().engine.encode_diff(state_vector)
    }

    pub fn state_vector(&self) -> Vec<u8> {
        self.state.lock().engine.state_vector()
    }

    /// Record a successful save of `version`. Ignored if a newer save already
    /// landed.
    pub fn mark_persisted(&self, version: u64) {
        let mut state = self.state.lock();
        if version >= state.persisted_version {
            state.persisted_version = version;
            state.last_persisted_at = Some(SystemTime::now());
        }
    }

    pub fn is_dirty(&self) -> bool {
        let state = self.state.lock();
        state.version != state.persisted_version
    }

    pub fn info(&self) -> ReplicaInfo {
        let state = self.state.lock();
        ReplicaInfo {
            id: self.id.clone(),
            version: state.version,
            dirty: state.version != state.persisted_version,
            last_persisted_at: state.last_persisted_at,
        }
    }
}

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replica").field("id", &self.id).finish()
    }
}
