//! CRDT engine seam
//!
//! The service never looks inside document state. Everything it needs from the
//! CRDT library goes through [`CrdtEngine`]; [`YrsEngine`] is the Yjs-compatible
//! implementation used in production.

use std::sync::Arc;

use parking_lot::Mutex;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use crate::error::{Error, Result};

/// Operations the service needs from a CRDT library.
///
/// Implementations must merge commutatively and idempotently: applying the same
/// set of updates in any order yields the same state.
pub trait CrdtEngine: Send {
    /// Apply a binary update.
    ///
    /// Returns the update describing what actually changed, or `None` when the
    /// update was already known (or is still waiting on missing dependencies).
    fn apply_update(&mut self, update: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Encode the entire document state as a single update
    fn encode_state_as_update(&self) -> Vec<u8>;

    /// Encode everything the holder of `state_vector` is missing
    fn encode_diff(&self, state_vector: &[u8]) -> Result<Vec<u8>>;

    /// Encode this replica's state vector
    fn state_vector(&self) -> Vec<u8>;
}

/// Constructor used by the registry for fresh replicas
pub type EngineFactory = fn() -> Box<dyn CrdtEngine>;

/// [`CrdtEngine`] backed by a `yrs` document
pub struct YrsEngine {
    doc: Doc,
}

impl YrsEngine {
    pub fn new() -> Self {
        Self { doc: Doc::new() }
    }

    /// Factory suitable for [`crate::ReplicaRegistry::with_engine`]
    pub fn boxed() -> Box<dyn CrdtEngine> {
        Box::new(Self::new())
    }
}

impl Default for YrsEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl CrdtEngine for YrsEngine {
    fn apply_update(&mut self, update: &[u8]) -> Result<Option<Vec<u8>>> {
        let decoded = Update::decode_v1(update)
            .map_err(|e: yrs::encoding::read::Error| Error::Crdt(e.to_string()))?;

        // yrs only emits an update event when the transaction changed the
        // block store or the delete set, which is exactly our "changed" signal.
        let captured: Arc<Mutex<Option<Vec<u8>>>> = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&captured);
        let subscription = self
            .doc
            .observe_update_v1(move |_, event| {
                *sink.lock() = Some(event.update.clone());
            })
            .map_err(|e| Error::Crdt(format!("{:?}", e)))?;

        {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(decoded);
        }
        drop(subscription);

        let diff = captured.lock().take();
        Ok(diff)
    }

    fn encode_state_as_update(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    fn encode_diff(&self, state_vector: &[u8]) -> Result<Vec<u8>> {
        let sv = StateVector::decode_v1(state_vector)
            .map_err(|e: yrs::encoding::read::Error| Error::Crdt(e.to_string()))?;
        let txn = self.doc.transact();
        Ok(txn.encode_state_as_update_v1(&sv))
    }

    fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }
}
