//! coedit Core - replicas, CRDT engine seam and presence
//!
//! This crate provides the transport-agnostic state of the service:
//! - Document and connection identifiers
//! - The [`CrdtEngine`] seam and its `yrs` implementation
//! - The replica registry with per-document locking
//! - Ephemeral awareness (presence) tracking

pub mod awareness;
pub mod connection;
pub mod document;
pub mod engine;
pub mod error;
pub mod registry;

pub use awareness::{AwarenessEntry, AwarenessTracker, AwarenessUpdate};
pub use connection::ConnectionId;
pub use document::{DocumentId, Replica, ReplicaInfo};
pub use engine::{CrdtEngine, EngineFactory, YrsEngine};
pub use error::{Error, Result};
pub use registry::{RegistryStats, ReplicaRegistry};
