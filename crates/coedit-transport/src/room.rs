//! Rooms: the live connections editing one document

use crate::connection::{ConnectionHandle, Delivery, Outbound};
use crate::metrics::Metrics;
use crate::persistence::PersistenceScheduler;
use coedit_core::{AwarenessTracker, ConnectionId, DocumentId, ReplicaRegistry};
use coedit_protocol::{ServerControl, SyncMessage, UserInfo};
use coedit_storage::Storage;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What a joining connection receives
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    /// Full document state, also queued to the joiner as sync step 2
    pub initial_state: Vec<u8>,
    /// Members including the joiner
    pub member_count: usize,
}

struct Member {
    handle: ConnectionHandle,
    user: UserInfo,
}

struct Room {
    members: RwLock<HashMap<ConnectionId, Member>>,
    /// Serializes joins against teardown. `true` once the room has been
    /// flushed and removed; joiners must then start over with a fresh room.
    closed: tokio::sync::Mutex<bool>,
}

impl Room {
    fn new() -> Self {
        Self {
            members: RwLock::new(HashMap::new()),
            closed: tokio::sync::Mutex::new(false),
        }
    }
}

/// Tracks which connections are in which document and fans messages out.
pub struct RoomManager {
    rooms: DashMap<DocumentId, Arc<Room>>,
    registry: Arc<ReplicaRegistry>,
    storage: Arc<dyn Storage>,
    awareness: Arc<AwarenessTracker>,
    scheduler: PersistenceScheduler,
    metrics: Arc<Metrics>,
}

impl RoomManager {
    pub fn new(
        registry: Arc<ReplicaRegistry>,
        storage: Arc<dyn Storage>,
        awareness: Arc<AwarenessTracker>,
        scheduler: PersistenceScheduler,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            rooms: DashMap::new(),
            registry,
            storage,
            awareness,
            scheduler,
            metrics,
        }
    }

    fn room(&self, doc: &DocumentId) -> Option<Arc<Room>> {
        self.rooms.get(doc).map(|r| r.value().clone())
    }

    /// Add `handle` to the room for `doc`, loading the replica if needed.
    ///
    /// The joiner's sync step 2 is queued while the replica is locked, so
    /// every later update reaches it through the room broadcast.
    pub async fn join(
        &self,
        doc: &DocumentId,
        handle: ConnectionHandle,
        user: UserInfo,
    ) -> JoinOutcome {
        loop {
            let room = self
                .rooms
                .entry(doc.clone())
                .or_insert_with(|| {
                    self.metrics.rooms_active.inc();
                    debug!(doc_id = %doc, "Room created");
                    Arc::new(Room::new())
                })
                .value()
                .clone();

            let closed = room.closed.lock().await;
            if *closed {
                continue;
            }

            let storage = Arc::clone(&self.storage);
            let replica = self
                .registry
                .get_or_create(doc, || async move { storage.load(doc).await })
                .await;
            self.metrics.replicas_loaded.set(self.registry.len() as i64);

            let conn = handle.id().clone();
            let (initial_state, member_count) = replica.encode_full_with(|full| {
                let mut members = room.members.write();
                handle.try_send(Outbound::sync(&SyncMessage::SyncStep2(full.to_vec())));
                members.insert(
                    conn.clone(),
                    Member {
                        handle: handle.clone(),
                        user: user.clone(),
                    },
                );
                (full.to_vec(), members.len())
            });
            drop(closed);

            info!(doc_id = %doc, conn = %conn, members = member_count, "Connection joined document");
            self.broadcast(
                doc,
                Some(&conn),
                Outbound::Control(ServerControl::PeerJoined {
                    document_id: doc.clone(),
                    connection_id: conn.clone(),
                    user,
                    member_count,
                }),
            );

            return JoinOutcome {
                initial_state,
                member_count,
            };
        }
    }

    /// Remove `conn` from the room for `doc`.
    ///
    /// The last member out flushes the replica, evicts it and deletes the
    /// room. Returns whether `conn` was a member.
    pub async fn leave(&self, doc: &DocumentId, conn: &ConnectionId) -> bool {
        let Some(room) = self.room(doc) else {
            return false;
        };
        let mut closed = room.closed.lock().await;
        if *closed {
            return false;
        }

        let (was_member, remaining) = {
            let mut members = room.members.write();
            let removed = members.remove(conn).is_some();
            (removed, members.len())
        };
        if !was_member {
            return false;
        }

        if let Some(removal) = self.awareness.remove_connection(doc, conn) {
            self.broadcast(doc, None, Outbound::awareness(removal));
        }
        info!(doc_id = %doc, conn = %conn, members = remaining, "Connection left document");

        if remaining > 0 {
            self.broadcast(
                doc,
                None,
                Outbound::Control(ServerControl::PeerLeft {
                    document_id: doc.clone(),
                    connection_id: conn.clone(),
                    member_count: remaining,
                }),
            );
            return true;
        }

        if let Err(e) = self.scheduler.final_flush(doc).await {
            warn!(doc_id = %doc, error = %e, "Evicting replica with unsaved changes");
        }
        self.registry.evict(doc);
        self.awareness.clear_document(doc);
        *closed = true;
        if self.rooms.remove_if(doc, |_, r| Arc::ptr_eq(r, &room)).is_some() {
            self.metrics.rooms_active.dec();
        }
        self.metrics.replicas_loaded.set(self.registry.len() as i64);
        debug!(doc_id = %doc, "Room closed");
        true
    }

    /// Queue `outbound` for every member except `except`. Never blocks;
    /// members whose queue is full get kicked. Returns the number of members
    /// that accepted the message.
    pub fn broadcast(
        &self,
        doc: &DocumentId,
        except: Option<&ConnectionId>,
        outbound: Outbound,
    ) -> usize {
        let Some(room) = self.room(doc) else {
            return 0;
        };
        let members = room.members.read();

        let mut delivered = 0;
        for (id, member) in members.iter() {
            if Some(id) == except {
                continue;
            }
            match member.handle.try_send(outbound.clone()) {
                Delivery::Sent => delivered += 1,
                Delivery::Kicked => {
                    self.metrics.slow_consumer_kicks.inc();
                    warn!(doc_id = %doc, conn = %id, "Outbound queue full, disconnecting slow consumer");
                }
                Delivery::Closed => {}
            }
        }
        self.metrics.broadcasts.inc_by(delivered as u64);
        delivered
    }

    /// Queue `outbound` for one member
    pub fn send_to(&self, doc: &DocumentId, conn: &ConnectionId, outbound: Outbound) -> Delivery {
        let Some(room) = self.room(doc) else {
            return Delivery::Closed;
        };
        let members = room.members.read();
        match members.get(conn) {
            Some(member) => {
                let delivery = member.handle.try_send(outbound);
                if delivery == Delivery::Kicked {
                    self.metrics.slow_consumer_kicks.inc();
                    warn!(doc_id = %doc, conn = %conn, "Outbound queue full, disconnecting slow consumer");
                }
                delivery
            }
            None => Delivery::Closed,
        }
    }

    pub fn is_member(&self, doc: &DocumentId, conn: &ConnectionId) -> bool {
        self.room(doc)
            .map_or(false, |room| room.members.read().contains_key(conn))
    }

    pub fn member_count(&self, doc: &DocumentId) -> usize {
        self.room(doc).map_or(0, |room| room.members.read().len())
    }

    /// Users currently in the room
    pub fn members(&self, doc: &DocumentId) -> Vec<(ConnectionId, UserInfo)> {
        self.room(doc).map_or_else(Vec::new, |room| {
            let members = room.members.read();
            let mut list: Vec<_> = members
                .iter()
                .map(|(id, member)| (id.clone(), member.user.clone()))
                .collect();
            list.sort_by(|a, b| a.0.cmp(&b.0));
            list
        })
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}
