//! Sync relay: applies inbound sync and awareness messages and fans them out

use crate::connection::Outbound;
use crate::metrics::Metrics;
use crate::persistence::PersistenceScheduler;
use crate::room::RoomManager;
use coedit_core::{AwarenessTracker, ConnectionId, DocumentId, ReplicaRegistry};
use coedit_protocol::{decode_sync, sync_kind, Channel, SyncMessage};
use std::sync::Arc;
use tracing::{debug, trace, warn};
use yrs::updates::encoder::Encode;

/// What happened to one inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Answered a sync step 1 with the missing state
    Replied,
    /// Applied an update; `changed` is false when it was already known
    Applied { changed: bool },
    /// Processed an awareness update; `accepted` is false when every entry
    /// was stale
    Awareness { accepted: bool },
    /// Malformed or unroutable; nothing happened
    Dropped,
}

pub struct SyncRelay {
    registry: Arc<ReplicaRegistry>,
    rooms: Arc<RoomManager>,
    awareness: Arc<AwarenessTracker>,
    scheduler: PersistenceScheduler,
    metrics: Arc<Metrics>,
}

impl SyncRelay {
    pub fn new(
        registry: Arc<ReplicaRegistry>,
        rooms: Arc<RoomManager>,
        awareness: Arc<AwarenessTracker>,
        scheduler: PersistenceScheduler,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            registry,
            rooms,
            awareness,
            scheduler,
            metrics,
        }
    }

    /// Handle a sync channel payload from `conn`, a member of `doc`
    pub fn handle_sync(&self, doc: &DocumentId, conn: &ConnectionId, payload: &[u8]) -> RelayOutcome {
        let message = match decode_sync(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(doc_id = %doc, conn = %conn, error = %e, "Dropping malformed sync message");
                return self.dropped(Channel::Sync, "decode");
            }
        };
        let Some(replica) = self.registry.get(doc) else {
            debug!(doc_id = %doc, conn = %conn, "Sync message for unloaded document");
            return self.dropped(Channel::Sync, "not_loaded");
        };
        trace!(doc_id = %doc, conn = %conn, kind = sync_kind(&message), "Sync message");

        match message {
            SyncMessage::SyncStep1(state_vector) => {
                let missing = replica.encode_diff(&state_vector.encode_v1()).unwrap_or_else(|e| {
                    debug!(doc_id = %doc, conn = %conn, error = %e, "Bad state vector, replying with full state");
                    replica.encode_full().0
                });
                self.rooms
                    .send_to(doc, conn, Outbound::sync(&SyncMessage::SyncStep2(missing)));
                RelayOutcome::Replied
            }
            SyncMessage::SyncStep2(update) | SyncMessage::Update(update) => {
                let applied = replica.apply_update(&update, |diff| {
                    let outbound = Outbound::sync(&SyncMessage::Update(diff.to_vec()));
                    self.rooms.broadcast(doc, Some(conn), outbound);
                });
                match applied {
                    Ok(true) => {
                        self.metrics.updates_applied.inc();
                        self.scheduler.schedule_save(doc);
                        RelayOutcome::Applied { changed: true }
                    }
                    Ok(false) => {
                        self.metrics.updates_redundant.inc();
                        RelayOutcome::Applied { changed: false }
                    }
                    Err(e) => {
                        warn!(doc_id = %doc, conn = %conn, error = %e, "Dropping undecodable update");
                        self.dropped(Channel::Sync, "invalid_update")
                    }
                }
            }
        }
    }

    /// Handle an awareness channel payload from `conn`, a member of `doc`
    pub fn handle_awareness(
        &self,
        doc: &DocumentId,
        conn: &ConnectionId,
        payload: &[u8],
    ) -> RelayOutcome {
        match self.awareness.apply_update(doc, conn, payload) {
            Ok(Some(accepted)) => {
                self.metrics.awareness_updates.inc();
                self.rooms
                    .broadcast(doc, Some(conn), Outbound::awareness(accepted));
                RelayOutcome::Awareness { accepted: true }
            }
            Ok(None) => RelayOutcome::Awareness { accepted: false },
            Err(e) => {
                warn!(doc_id = %doc, conn = %conn, error = %e, "Dropping malformed awareness update");
                self.dropped(Channel::Awareness, "decode")
            }
        }
    }

    fn dropped(&self, channel: Channel, reason: &str) -> RelayOutcome {
        self.metrics.record_drop(channel.as_str(), reason);
        RelayOutcome::Dropped
    }
}
