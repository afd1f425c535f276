//! Transport-facing entry point
//!
//! Transports (the WebSocket server, tests, embedders) drive the service
//! through connection lifecycle calls. Everything else (rooms, replicas,
//! presence, persistence) is wired together here.

use crate::config::ServiceConfig;
use crate::connection::{self, ConnectionHandle, ConnectionReceiver, Outbound};
use crate::metrics::Metrics;
use crate::persistence::PersistenceScheduler;
use crate::relay::{RelayOutcome, SyncRelay};
use crate::room::{JoinOutcome, RoomManager};
use coedit_core::{AwarenessTracker, ConnectionId, DocumentId, ReplicaRegistry};
use coedit_protocol::{Channel, ServerControl, SyncMessage, UserInfo};
use coedit_storage::Storage;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};
use yrs::updates::decoder::Decode;
use yrs::StateVector;

/// Errors surfaced to transports
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Connection already registered: {0}")]
    DuplicateConnection(ConnectionId),

    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    #[error("Already joined document: {0}")]
    AlreadyJoined(DocumentId),

    #[error("Not joined to any document")]
    NotJoined,
}

impl ServiceError {
    /// Stable code for `error` control messages
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::DuplicateConnection(_) => "duplicate_connection",
            ServiceError::UnknownConnection(_) => "unknown_connection",
            ServiceError::AlreadyJoined(_) => "already_joined",
            ServiceError::NotJoined => "not_joined",
        }
    }
}

struct ConnectionState {
    handle: ConnectionHandle,
    document: Option<DocumentId>,
}

/// Service statistics
#[derive(Debug, Clone, Default)]
pub struct ServiceStats {
    pub connections: usize,
    pub rooms: usize,
    pub replicas: usize,
    pub dirty_replicas: usize,
    pub pending_saves: usize,
}

/// The collaborative document service
pub struct CollabService {
    config: ServiceConfig,
    registry: Arc<ReplicaRegistry>,
    awareness: Arc<AwarenessTracker>,
    scheduler: PersistenceScheduler,
    rooms: Arc<RoomManager>,
    relay: SyncRelay,
    metrics: Arc<Metrics>,
    connections: DashMap<ConnectionId, ConnectionState>,
}

impl CollabService {
    pub fn new(storage: Arc<dyn Storage>, config: ServiceConfig, metrics: Arc<Metrics>) -> Self {
        Self::with_registry(Arc::new(ReplicaRegistry::new()), storage, config, metrics)
    }

    /// Create a service around an existing registry (e.g. one with a custom
    /// engine factory)
    pub fn with_registry(
        registry: Arc<ReplicaRegistry>,
        storage: Arc<dyn Storage>,
        config: ServiceConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        let awareness = Arc::new(AwarenessTracker::new());
        let scheduler = PersistenceScheduler::new(
            Arc::clone(&registry),
            Arc::clone(&storage),
            Arc::clone(&metrics),
            config.clone(),
        );
        let rooms = Arc::new(RoomManager::new(
            Arc::clone(&registry),
            storage,
            Arc::clone(&awareness),
            scheduler.clone(),
            Arc::clone(&metrics),
        ));
        let relay = SyncRelay::new(
            Arc::clone(&registry),
            Arc::clone(&rooms),
            Arc::clone(&awareness),
            scheduler.clone(),
            Arc::clone(&metrics),
        );

        Self {
            config,
            registry,
            awareness,
            scheduler,
            rooms,
            relay,
            metrics,
            connections: DashMap::new(),
        }
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn registry(&self) -> &Arc<ReplicaRegistry> {
        &self.registry
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }

    /// Register a new connection and hand back its outbound queue
    pub fn on_connect(&self, conn: ConnectionId) -> Result<ConnectionReceiver, ServiceError> {
        if self.connections.contains_key(&conn) {
            return Err(ServiceError::DuplicateConnection(conn));
        }
        let (handle, receiver) = connection::channel(conn.clone(), self.config.outbound_buffer);
        self.connections.insert(
            conn.clone(),
            ConnectionState {
                handle,
                document: None,
            },
        );
        self.metrics.record_connection();
        debug!(conn = %conn, "Connection registered");
        Ok(receiver)
    }

    fn lookup(&self, conn: &ConnectionId) -> Result<(ConnectionHandle, Option<DocumentId>), ServiceError> {
        let state = self
            .connections
            .get(conn)
            .ok_or_else(|| ServiceError::UnknownConnection(conn.clone()))?;
        Ok((state.handle.clone(), state.document.clone()))
    }

    /// Join `doc`, leaving the current document first if there is one.
    ///
    /// The joiner is queued, in order: the full state (sync step 2), the
    /// server's state vector (sync step 1), the presence of everyone already
    /// in the room, and a `joined` control message.
    pub async fn join_document(
        &self,
        conn: &ConnectionId,
        doc: &DocumentId,
        user: UserInfo,
    ) -> Result<JoinOutcome, ServiceError> {
        let (handle, current) = self.lookup(conn)?;
        match current {
            Some(current) if current == *doc => return Err(ServiceError::AlreadyJoined(current)),
            Some(current) => {
                self.leave_room(conn, &current).await;
            }
            None => {}
        }

        let outcome = self.rooms.join(doc, handle.clone(), user).await;
        if let Some(mut state) = self.connections.get_mut(conn) {
            state.document = Some(doc.clone());
        }

        let state_vector = self
            .registry
            .state_vector(doc)
            .ok()
            .and_then(|sv| StateVector::decode_v1(&sv).ok());
        if let Some(state_vector) = state_vector {
            handle.try_send(Outbound::sync(&SyncMessage::SyncStep1(state_vector)));
        }
        if let Some(snapshot) = self.awareness.snapshot_for(doc) {
            handle.try_send(Outbound::awareness(snapshot));
        }
        handle.try_send(Outbound::Control(ServerControl::Joined {
            document_id: doc.clone(),
            connection_id: conn.clone(),
            member_count: outcome.member_count,
        }));

        Ok(outcome)
    }

    /// Leave the current document
    pub async fn leave_document(&self, conn: &ConnectionId) -> Result<DocumentId, ServiceError> {
        let (handle, current) = self.lookup(conn)?;
        let doc = current.ok_or(ServiceError::NotJoined)?;
        self.leave_room(conn, &doc).await;
        handle.try_send(Outbound::Control(ServerControl::Left {
            document_id: doc.clone(),
        }));
        Ok(doc)
    }

    async fn leave_room(&self, conn: &ConnectionId, doc: &DocumentId) {
        if let Some(mut state) = self.connections.get_mut(conn) {
            state.document = None;
        }
        self.rooms.leave(doc, conn).await;
    }

    /// Route one binary message from `conn`
    pub fn on_message(&self, conn: &ConnectionId, channel: Channel, payload: &[u8]) -> RelayOutcome {
        self.metrics.bytes_received.inc_by(payload.len() as u64);

        let document = self
            .connections
            .get(conn)
            .and_then(|state| state.document.clone());
        let Some(doc) = document else {
            debug!(conn = %conn, channel = %channel, "Message from connection outside any document");
            self.metrics.record_drop(channel.as_str(), "not_joined");
            return RelayOutcome::Dropped;
        };

        match channel {
            Channel::Sync => self.relay.handle_sync(&doc, conn, payload),
            Channel::Awareness => self.relay.handle_awareness(&doc, conn, payload),
        }
    }

    /// Clean up after a connection went away
    pub async fn on_disconnect(&self, conn: &ConnectionId) {
        let document = self
            .connections
            .get(conn)
            .and_then(|state| state.document.clone());
        if let Some(doc) = document {
            self.leave_room(conn, &doc).await;
        }
        if self.connections.remove(conn).is_some() {
            self.metrics.record_disconnection();
            debug!(conn = %conn, "Connection removed");
        }
    }

    /// Flush every loaded replica that has unsaved changes
    pub async fn shutdown(&self) {
        let ids = self.registry.ids();
        info!(replicas = ids.len(), "Flushing replicas before shutdown");
        for id in ids {
            // Failures are logged by the scheduler
            let _ = self.scheduler.final_flush(&id).await;
        }
    }

    pub fn stats(&self) -> ServiceStats {
        let registry = self.registry.stats();
        ServiceStats {
            connections: self.connections.len(),
            rooms: self.rooms.room_count(),
            replicas: registry.replica_count,
            dirty_replicas: registry.dirty_count,
            pending_saves: self.scheduler.pending_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        apply_to, conn, content_of, doc, edit_update, metrics, text_of, CountingStorage,
    };
    use coedit_core::{AwarenessEntry, AwarenessUpdate};
    use coedit_protocol::{decode_frame, encode_sync};
    use serde_json::json;
    use std::collections::HashMap;
    use std::time::Duration;
    use yrs::sync::awareness::{AwarenessUpdate as WireUpdate, AwarenessUpdateEntry};
    use yrs::sync::Message;
    use yrs::updates::encoder::Encode;
    use yrs::Doc;

    fn service() -> (Arc<CollabService>, Arc<CountingStorage>) {
        let storage = Arc::new(CountingStorage::new());
        let service = CollabService::new(storage.clone(), ServiceConfig::default(), metrics());
        (Arc::new(service), storage)
    }

    /// Applies every sync payload in `queued` to `client`
    fn absorb(client: &Doc, queued: &[Outbound]) {
        for message in queued {
            match message.as_sync() {
                Some(SyncMessage::SyncStep2(update)) | Some(SyncMessage::Update(update)) => {
                    apply_to(client, &update)
                }
                _ => {}
            }
        }
    }

    /// Feeds a frame the way a stock y-websocket client sends it
    fn send_frame(service: &CollabService, conn: &ConnectionId, message: Message) -> RelayOutcome {
        let frame = message.encode_v1();
        let (channel, payload) = decode_frame(&frame).unwrap();
        service.on_message(conn, channel, payload)
    }

    fn presence(client_id: u64, clock: u32, json: &str) -> Message {
        let mut clients = HashMap::new();
        clients.insert(
            client_id,
            AwarenessUpdateEntry {
                clock,
                json: json.to_string(),
            },
        );
        Message::Awareness(WireUpdate { clients })
    }

    /// Binary frames in `queued`, decoded the way a stock client reads them
    fn frames(queued: &[Outbound]) -> Vec<Message> {
        queued
            .iter()
            .filter_map(Outbound::to_frame)
            .map(|frame| Message::decode_v1(&frame).unwrap())
            .collect()
    }

    fn awareness_of(messages: &[Message]) -> &WireUpdate {
        messages
            .iter()
            .find_map(|m| match m {
                Message::Awareness(update) => Some(update),
                _ => None,
            })
            .expect("no awareness frame")
    }

    #[tokio::test]
    async fn test_join_queue_order() {
        let (service, _) = service();
        let c1 = conn("c1");
        let mut rx = service.on_connect(c1.clone()).unwrap();

        service
            .join_document(&c1, &doc("doc-order"), UserInfo::named("Ada"))
            .await
            .unwrap();

        let queued = rx.drain();
        assert_eq!(queued.len(), 3);
        assert!(matches!(queued[0].as_sync(), Some(SyncMessage::SyncStep2(_))));
        assert!(matches!(queued[1].as_sync(), Some(SyncMessage::SyncStep1(_))));
        assert!(matches!(
            queued[2],
            Outbound::Control(ServerControl::Joined { member_count: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_duplicate_connection_rejected() {
        let (service, _) = service();
        let _rx = service.on_connect(conn("c1")).unwrap();
        assert!(matches!(
            service.on_connect(conn("c1")),
            Err(ServiceError::DuplicateConnection(_))
        ));
    }

    #[tokio::test]
    async fn test_message_before_join_is_dropped() {
        let (service, _) = service();
        let c1 = conn("c1");
        let _rx = service.on_connect(c1.clone()).unwrap();

        let payload = encode_sync(&SyncMessage::Update(edit_update(&Doc::new(), 0, "x")));
        assert_eq!(
            service.on_message(&c1, Channel::Sync, &payload),
            RelayOutcome::Dropped
        );
        assert_eq!(service.stats().replicas, 0);
    }

    #[tokio::test]
    async fn test_rejoin_same_document_rejected() {
        let (service, _) = service();
        let c1 = conn("c1");
        let _rx = service.on_connect(c1.clone()).unwrap();
        let id = doc("doc-again");

        service.join_document(&c1, &id, UserInfo::default()).await.unwrap();
        let err = service
            .join_document(&c1, &id, UserInfo::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "already_joined");
        assert_eq!(service.rooms().member_count(&id), 1);
    }

    #[tokio::test]
    async fn test_switch_documents() {
        let (service, storage) = service();
        let c1 = conn("c1");
        let mut rx = service.on_connect(c1.clone()).unwrap();
        let first = doc("doc-first");
        let second = doc("doc-second");

        service.join_document(&c1, &first, UserInfo::default()).await.unwrap();
        let payload = encode_sync(&SyncMessage::Update(edit_update(&Doc::new(), 0, "first")));
        service.on_message(&c1, Channel::Sync, &payload);

        service.join_document(&c1, &second, UserInfo::default()).await.unwrap();
        rx.drain();

        // Leaving the first room as its last member flushed and evicted it
        assert_eq!(service.rooms().member_count(&first), 0);
        assert!(service.registry().get(&first).is_none());
        assert_eq!(content_of(&storage.stored(&first).await.unwrap()), "first");

        let payload = encode_sync(&SyncMessage::Update(edit_update(&Doc::new(), 0, "second")));
        assert_eq!(
            service.on_message(&c1, Channel::Sync, &payload),
            RelayOutcome::Applied { changed: true }
        );
        let stats = service.stats();
        assert_eq!(stats.rooms, 1);
        assert_eq!(stats.replicas, 1);
        assert_eq!(stats.dirty_replicas, 1);
    }

    #[tokio::test]
    async fn test_presence_snapshot_and_cleanup() {
        let (service, _) = service();
        let id = doc("doc-presence");
        let c1 = conn("c1");
        let c2 = conn("c2");
        let mut rx1 = service.on_connect(c1.clone()).unwrap();
        let mut rx2 = service.on_connect(c2.clone()).unwrap();

        service.join_document(&c1, &id, UserInfo::default()).await.unwrap();
        let presence = AwarenessUpdate {
            entries: vec![AwarenessEntry::new(1, 1, json!({"cursor": 0}))],
        }
        .encode();
        assert_eq!(
            service.on_message(&c1, Channel::Awareness, &presence),
            RelayOutcome::Awareness { accepted: true }
        );

        service.join_document(&c2, &id, UserInfo::default()).await.unwrap();
        let queued = rx2.drain();
        assert!(queued.iter().any(|m| *m == Outbound::awareness(presence.clone())));

        rx1.drain();
        service.on_disconnect(&c1).await;

        let queued = rx2.drain();
        match &queued[0] {
            Outbound::Awareness(bytes) => {
                let update = AwarenessUpdate::decode(bytes).unwrap();
                assert_eq!(update.entries, vec![AwarenessEntry::removal(1, 2)]);
            }
            other => panic!("expected presence removal, got {:?}", other),
        }
        assert_eq!(service.stats().connections, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_clients_edit_doc_7() {
        let (service, storage) = service();
        let id = doc("doc-7");
        let c1 = conn("c1");
        let c2 = conn("c2");
        let mut rx1 = service.on_connect(c1.clone()).unwrap();
        let mut rx2 = service.on_connect(c2.clone()).unwrap();
        let editor1 = Doc::new();
        let editor2 = Doc::new();

        service.join_document(&c1, &id, UserInfo::named("C1")).await.unwrap();
        service.join_document(&c2, &id, UserInfo::named("C2")).await.unwrap();
        absorb(&editor1, &rx1.drain());
        absorb(&editor2, &rx2.drain());

        // C1 types "Hello"
        let u1 = edit_update(&editor1, 0, "Hello");
        send_frame(&service, &c1, Message::Sync(SyncMessage::Update(u1)));
        absorb(&editor2, &rx2.drain());
        assert_eq!(text_of(&editor2), "Hello");

        tokio::time::sleep(Duration::from_secs(1)).await;

        // C2 appends " world" a second later
        let u2 = edit_update(&editor2, 5, " world");
        service.on_message(&c2, Channel::Sync, &encode_sync(&SyncMessage::Update(u2)));
        absorb(&editor1, &rx1.drain());
        assert_eq!(text_of(&editor1), "Hello world");
        assert!(rx2.drain().is_empty());

        // Exactly one save, about three seconds after the second update
        tokio::time::sleep(Duration::from_millis(2900)).await;
        assert_eq!(storage.save_count(), 0);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(storage.save_count(), 1);
        assert_eq!(content_of(&storage.stored(&id).await.unwrap()), "Hello world");

        // Both leave; nothing new to flush
        service.on_disconnect(&c1).await;
        service.on_disconnect(&c2).await;
        assert_eq!(storage.save_count(), 1);
        assert_eq!(service.stats().rooms, 0);
        assert_eq!(service.stats().replicas, 0);

        // A later joiner sees the persisted text
        let c3 = conn("c3");
        let mut rx3 = service.on_connect(c3.clone()).unwrap();
        service.join_document(&c3, &id, UserInfo::default()).await.unwrap();
        let editor3 = Doc::new();
        absorb(&editor3, &rx3.drain());
        assert_eq!(text_of(&editor3), "Hello world");
    }

    #[tokio::test]
    async fn test_concurrent_edits_converge() {
        let (service, _) = service();
        let id = doc("doc-converge");
        let names = ["a", "b", "c", "d"];
        let mut clients = Vec::new();
        for name in names {
            let c = conn(name);
            let rx = service.on_connect(c.clone()).unwrap();
            service.join_document(&c, &id, UserInfo::default()).await.unwrap();
            clients.push((c, rx, Doc::new()));
        }
        for (_, rx, editor) in clients.iter_mut() {
            absorb(editor, &rx.drain());
        }

        let mut tasks = Vec::new();
        for (i, (c, _, editor)) in clients.iter().enumerate() {
            let update = edit_update(editor, 0, &format!("[{}]", i));
            let service = Arc::clone(&service);
            let c = c.clone();
            tasks.push(tokio::spawn(async move {
                service.on_message(&c, Channel::Sync, &encode_sync(&SyncMessage::Update(update)))
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap(), RelayOutcome::Applied { changed: true });
        }

        let (server_state, _) = service.registry().encode_full(&id).unwrap();
        let expected = content_of(&server_state);
        assert_eq!(expected.len(), 12);
        for (_, rx, editor) in clients.iter_mut() {
            absorb(editor, &rx.drain());
            assert_eq!(text_of(editor), expected);
        }
    }

    #[tokio::test]
    async fn test_shutdown_flushes_dirty_replicas() {
        let (service, storage) = service();
        let c1 = conn("c1");
        let _rx = service.on_connect(c1.clone()).unwrap();
        let id = doc("doc-shutdown");
        service.join_document(&c1, &id, UserInfo::default()).await.unwrap();
        service.on_message(
            &c1,
            Channel::Sync,
            &encode_sync(&SyncMessage::Update(edit_update(&Doc::new(), 0, "unsaved"))),
        );

        service.shutdown().await;
        assert_eq!(storage.save_count(), 1);
        assert_eq!(service.stats().pending_saves, 0);
        assert_eq!(service.stats().dirty_replicas, 0);
    }

    #[tokio::test]
    async fn test_yjs_client_frames() {
        let (service, _) = service();
        let id = doc("doc-yjs");
        let c1 = conn("c1");
        let c2 = conn("c2");
        let mut rx1 = service.on_connect(c1.clone()).unwrap();
        let mut rx2 = service.on_connect(c2.clone()).unwrap();
        service.join_document(&c1, &id, UserInfo::default()).await.unwrap();
        service.join_document(&c2, &id, UserInfo::default()).await.unwrap();
        rx1.drain();
        rx2.drain();

        let editor = Doc::new();
        let update = edit_update(&editor, 0, "hi");
        assert_eq!(
            send_frame(&service, &c1, Message::Sync(SyncMessage::Update(update))),
            RelayOutcome::Applied { changed: true }
        );
        assert_eq!(
            send_frame(&service, &c1, presence(11, 1, r#"{"user":{"name":"Ada"}}"#)),
            RelayOutcome::Awareness { accepted: true }
        );
        assert_eq!(
            send_frame(&service, &c2, presence(22, 1, r#"{"user":{"name":"Bob"}}"#)),
            RelayOutcome::Awareness { accepted: true }
        );

        let received = frames(&rx2.drain());
        assert!(matches!(&received[0], Message::Sync(SyncMessage::Update(_))));
        let ada = awareness_of(&received);
        assert_eq!(ada.clients.len(), 1);
        assert_eq!(ada.clients[&11].clock, 1);

        // Ada's editor re-sends Bob's presence it just received
        let echoed = awareness_of(&frames(&rx1.drain())).clone();
        assert!(echoed.clients.contains_key(&22));
        assert_eq!(
            send_frame(&service, &c1, Message::Awareness(echoed)),
            RelayOutcome::Awareness { accepted: false }
        );
        assert!(rx2.drain().is_empty());

        service.on_disconnect(&c1).await;
        let received = frames(&rx2.drain());
        let removal = awareness_of(&received);
        assert_eq!(removal.clients.len(), 1);
        assert_eq!(removal.clients[&11].clock, 2);
        assert_eq!(removal.clients[&11].json, "null");

        // Bob is still present for the next joiner
        let c3 = conn("c3");
        let mut rx3 = service.on_connect(c3.clone()).unwrap();
        service.join_document(&c3, &id, UserInfo::default()).await.unwrap();
        let queued = frames(&rx3.drain());
        let snapshot = awareness_of(&queued);
        assert_eq!(snapshot.clients.keys().copied().collect::<Vec<_>>(), vec![22]);
    }
}
