//! Awareness Tracker - ephemeral presence per document
//!
//! Presence (user name, color, cursor) lives next to document content but is
//! never persisted. Entries travel in the y-protocols awareness encoding
//! (`yrs::sync::awareness::AwarenessUpdate`):
//!
//! ```text
//! varUint(n) { varUint(client_id) varUint(clock) varString(json) } * n
//! ```
//!
//! A JSON payload of `null` means the client's presence was removed.
//!
//! Clocks are tracked per editor client id, the way y-protocols does. The
//! connection that first announces a client id owns it; leaving clears every
//! client id the connection owns. Editors re-send presence they received from
//! peers, so an entry is only accepted when its clock moves forward.

use crate::connection::ConnectionId;
use crate::document::DocumentId;
use crate::error::{Error, Result};
use dashmap::DashMap;
use serde_json::Value;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::time::Instant;
use tracing::trace;
use yrs::sync::awareness::{AwarenessUpdate as WireUpdate, AwarenessUpdateEntry};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;

/// Largest JSON state accepted for a single client
pub const MAX_STATE_SIZE: usize = 64 * 1024;

/// One client's presence as carried on the wire
#[derive(Debug, Clone, PartialEq)]
pub struct AwarenessEntry {
    pub client_id: u64,
    pub clock: u32,
    /// `None` clears the client's presence
    pub state: Option<Value>,
}

impl AwarenessEntry {
    pub fn new(client_id: u64, clock: u32, state: Value) -> Self {
        Self {
            client_id,
            clock,
            state: Some(state),
        }
    }

    pub fn removal(client_id: u64, clock: u32) -> Self {
        Self {
            client_id,
            clock,
            state: None,
        }
    }
}

/// A batch of awareness entries, ordered by client id
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AwarenessUpdate {
    pub entries: Vec<AwarenessEntry>,
}

impl AwarenessUpdate {
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let wire = WireUpdate::decode_v1(bytes).map_err(|e| Error::Awareness(e.to_string()))?;

        let mut entries = Vec::with_capacity(wire.clients.len());
        for (client_id, entry) in wire.clients {
            if entry.json.len() > MAX_STATE_SIZE {
                return Err(Error::Awareness(format!(
                    "state for client {} is {} bytes",
                    client_id,
                    entry.json.len()
                )));
            }
            let state: Value = serde_json::from_str(&entry.json)
                .map_err(|e| Error::Awareness(e.to_string()))?;
            entries.push(AwarenessEntry {
                client_id,
                clock: entry.clock,
                state: if state.is_null() { None } else { Some(state) },
            });
        }
        entries.sort_by_key(|e| e.client_id);

        Ok(Self { entries })
    }

    pub fn encode(&self) -> Vec<u8> {
        let clients = self
            .entries
            .iter()
            .map(|entry| {
                let json = match &entry.state {
                    Some(state) => state.to_string(),
                    None => "null".to_string(),
                };
                (
                    entry.client_id,
                    AwarenessUpdateEntry {
                        clock: entry.clock,
                        json,
                    },
                )
            })
            .collect();
        WireUpdate { clients }.encode_v1()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Stored presence of one editor client
#[derive(Debug, Clone)]
pub struct AwarenessState {
    pub client_id: u64,
    pub clock: u32,
    /// Connection that announced this client id
    pub owner: ConnectionId,
    /// `None` once the client cleared its presence; the clock is kept so
    /// replays of older states stay rejected
    pub fields: Option<Value>,
    pub updated_at: Instant,
}

/// Presence per `(document, client id)`, each owned by one connection
pub struct AwarenessTracker {
    documents: DashMap<DocumentId, HashMap<u64, AwarenessState>>,
}

impl AwarenessTracker {
    pub fn new() -> Self {
        Self {
            documents: DashMap::new(),
        }
    }

    /// Apply a single entry received from `conn`. Returns whether it was
    /// accepted.
    pub fn apply(&self, doc: &DocumentId, conn: &ConnectionId, entry: &AwarenessEntry) -> bool {
        let mut clients = self.documents.entry(doc.clone()).or_default();

        match clients.entry(entry.client_id) {
            Entry::Occupied(mut occupied) => {
                let existing = occupied.get_mut();
                // Same clock is only news when it removes live presence
                let removes_live = entry.clock == existing.clock
                    && entry.state.is_none()
                    && existing.fields.is_some();
                if entry.clock <= existing.clock && !removes_live {
                    trace!(
                        doc_id = %doc,
                        conn = %conn,
                        client_id = entry.client_id,
                        clock = entry.clock,
                        "Stale awareness entry ignored"
                    );
                    return false;
                }
                existing.clock = entry.clock;
                existing.fields = entry.state.clone();
                existing.updated_at = Instant::now();
            }
            // Removal of a client nobody is showing
            Entry::Vacant(_) if entry.state.is_none() => return false,
            Entry::Vacant(vacant) => {
                vacant.insert(AwarenessState {
                    client_id: entry.client_id,
                    clock: entry.clock,
                    owner: conn.clone(),
                    fields: entry.state.clone(),
                    updated_at: Instant::now(),
                });
            }
        }
        true
    }

    /// Decode and apply an awareness message from `conn`.
    ///
    /// Returns the encoding of the accepted entries, ready to broadcast, or
    /// `None` if every entry was stale.
    pub fn apply_update(
        &self,
        doc: &DocumentId,
        conn: &ConnectionId,
        bytes: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        let update = AwarenessUpdate::decode(bytes)?;
        let accepted: Vec<AwarenessEntry> = update
            .entries
            .into_iter()
            .filter(|entry| self.apply(doc, conn, entry))
            .collect();

        if accepted.is_empty() {
            return Ok(None);
        }
        Ok(Some(AwarenessUpdate { entries: accepted }.encode()))
    }

    /// Forget every client id `conn` owns. Returns the removals to broadcast,
    /// if peers were still showing any of them.
    pub fn remove_connection(&self, doc: &DocumentId, conn: &ConnectionId) -> Option<Vec<u8>> {
        let (mut removed, now_empty) = {
            let mut clients = self.documents.get_mut(doc)?;
            let owned: Vec<u64> = clients
                .values()
                .filter(|s| &s.owner == conn)
                .map(|s| s.client_id)
                .collect();
            let removed: Vec<AwarenessState> =
                owned.iter().filter_map(|id| clients.remove(id)).collect();
            (removed, clients.is_empty())
        };
        if now_empty {
            self.documents.remove_if(doc, |_, clients| clients.is_empty());
        }

        removed.retain(|s| s.fields.is_some());
        if removed.is_empty() {
            return None;
        }
        let mut entries: Vec<AwarenessEntry> = removed
            .into_iter()
            .map(|s| AwarenessEntry::removal(s.client_id, s.clock.saturating_add(1)))
            .collect();
        entries.sort_by_key(|e| e.client_id);
        Some(AwarenessUpdate { entries }.encode())
    }

    /// Encoding of every live presence in `doc`, for a newly joined peer
    pub fn snapshot_for(&self, doc: &DocumentId) -> Option<Vec<u8>> {
        let clients = self.documents.get(doc)?;
        let entries: Vec<AwarenessEntry> = clients
            .values()
            .filter_map(|s| {
                s.fields
                    .as_ref()
                    .map(|fields| AwarenessEntry::new(s.client_id, s.clock, fields.clone()))
            })
            .collect();
        if entries.is_empty() {
            return None;
        }
        Some(AwarenessUpdate { entries }.encode())
    }

    /// Stored presence of one editor client
    pub fn state(&self, doc: &DocumentId, client_id: u64) -> Option<AwarenessState> {
        self.documents.get(doc)?.get(&client_id).cloned()
    }

    /// Client ids owned by `conn`, sorted
    pub fn clients_of(&self, doc: &DocumentId, conn: &ConnectionId) -> Vec<u64> {
        let mut ids: Vec<u64> = self.documents.get(doc).map_or_else(Vec::new, |clients| {
            clients
                .values()
                .filter(|s| &s.owner == conn)
                .map(|s| s.client_id)
                .collect()
        });
        ids.sort_unstable();
        ids
    }

    /// Number of connections currently showing presence in `doc`
    pub fn connection_count(&self, doc: &DocumentId) -> usize {
        self.documents.get(doc).map_or(0, |clients| {
            let mut owners: Vec<&ConnectionId> = clients
                .values()
                .filter(|s| s.fields.is_some())
                .map(|s| &s.owner)
                .collect();
            owners.sort();
            owners.dedup();
            owners.len()
        })
    }

    /// Drop all presence for a document
    pub fn clear_document(&self, doc: &DocumentId) {
        self.documents.remove(doc);
    }
}

impl Default for AwarenessTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ids() -> (DocumentId, ConnectionId, ConnectionId) {
        (
            DocumentId::new("doc-7").unwrap(),
            ConnectionId::new("c1").unwrap(),
            ConnectionId::new("c2").unwrap(),
        )
    }

    fn message(entries: Vec<AwarenessEntry>) -> Vec<u8> {
        AwarenessUpdate { entries }.encode()
    }

    fn client_ids(bytes: &[u8]) -> Vec<u64> {
        AwarenessUpdate::decode(bytes)
            .unwrap()
            .entries
            .iter()
            .map(|e| e.client_id)
            .collect()
    }

    #[test]
    fn test_codec_roundtrip_with_removal() {
        let update = AwarenessUpdate {
            entries: vec![
                AwarenessEntry::removal(7, 9),
                AwarenessEntry::new(42, 3, json!({"user": {"name": "Ada", "color": "#f0a"}})),
            ],
        };
        assert_eq!(AwarenessUpdate::decode(&update.encode()).unwrap(), update);
    }

    #[test]
    fn test_decodes_yrs_encoding() {
        let mut clients = HashMap::new();
        clients.insert(
            11,
            AwarenessUpdateEntry {
                clock: 4,
                json: r#"{"cursor":3}"#.to_string(),
            },
        );
        let bytes = WireUpdate { clients }.encode_v1();

        let update = AwarenessUpdate::decode(&bytes).unwrap();
        assert_eq!(update.entries, vec![AwarenessEntry::new(11, 4, json!({"cursor": 3}))]);
    }

    #[test]
    fn test_decode_truncated() {
        let mut bytes = message(vec![AwarenessEntry::new(1, 1, json!({"a": 1}))]);
        bytes.truncate(bytes.len() - 2);
        assert!(AwarenessUpdate::decode(&bytes).is_err());
        assert!(AwarenessUpdate::decode(&[]).is_err());
    }

    #[test]
    fn test_decode_invalid_json() {
        let mut clients = HashMap::new();
        clients.insert(
            1,
            AwarenessUpdateEntry {
                clock: 1,
                json: "{not json".to_string(),
            },
        );
        assert!(AwarenessUpdate::decode(&WireUpdate { clients }.encode_v1()).is_err());
    }

    #[test]
    fn test_stale_clock_ignored() {
        let tracker = AwarenessTracker::new();
        let (doc, c1, _) = ids();

        assert!(tracker.apply(&doc, &c1, &AwarenessEntry::new(1, 5, json!({"cursor": 10}))));
        assert!(!tracker.apply(&doc, &c1, &AwarenessEntry::new(1, 5, json!({"cursor": 11}))));
        assert!(!tracker.apply(&doc, &c1, &AwarenessEntry::new(1, 4, json!({"cursor": 12}))));
        assert!(tracker.apply(&doc, &c1, &AwarenessEntry::new(1, 6, json!({"cursor": 13}))));

        let state = tracker.state(&doc, 1).unwrap();
        assert_eq!(state.clock, 6);
        assert_eq!(state.owner, c1);
        assert_eq!(state.fields, Some(json!({"cursor": 13})));
    }

    #[test]
    fn test_apply_update_returns_only_accepted() {
        let tracker = AwarenessTracker::new();
        let (doc, c1, _) = ids();
        tracker.apply(&doc, &c1, &AwarenessEntry::new(1, 5, json!({"n": 1})));

        let stale = message(vec![AwarenessEntry::new(1, 2, json!({"n": 0}))]);
        assert_eq!(tracker.apply_update(&doc, &c1, &stale).unwrap(), None);

        let batch = message(vec![
            AwarenessEntry::new(1, 4, json!({"n": 0})),
            AwarenessEntry::new(2, 1, json!({"n": 2})),
        ]);
        let out = tracker.apply_update(&doc, &c1, &batch).unwrap().unwrap();
        assert_eq!(client_ids(&out), vec![2]);
    }

    #[test]
    fn test_echoed_peer_presence_keeps_its_owner() {
        let tracker = AwarenessTracker::new();
        let (doc, c1, c2) = ids();
        tracker.apply(&doc, &c1, &AwarenessEntry::new(11, 1, json!({"name": "Ada"})));
        tracker.apply(&doc, &c2, &AwarenessEntry::new(22, 1, json!({"name": "Bob"})));

        // c1's editor re-sends what it received about client 22
        let echo = message(vec![AwarenessEntry::new(22, 1, json!({"name": "Bob"}))]);
        assert_eq!(tracker.apply_update(&doc, &c1, &echo).unwrap(), None);

        assert_eq!(client_ids(&tracker.snapshot_for(&doc).unwrap()), vec![11, 22]);
        assert_eq!(tracker.clients_of(&doc, &c1), vec![11]);
        assert_eq!(tracker.clients_of(&doc, &c2), vec![22]);

        let removal = tracker.remove_connection(&doc, &c1).unwrap();
        assert_eq!(
            AwarenessUpdate::decode(&removal).unwrap().entries,
            vec![AwarenessEntry::removal(11, 2)]
        );
        assert_eq!(client_ids(&tracker.snapshot_for(&doc).unwrap()), vec![22]);
        assert_eq!(tracker.connection_count(&doc), 1);
    }

    #[test]
    fn test_remove_connection_clears_all_owned_clients() {
        let tracker = AwarenessTracker::new();
        let (doc, c1, c2) = ids();
        let batch = message(vec![
            AwarenessEntry::new(11, 3, json!({"name": "Ada"})),
            AwarenessEntry::new(12, 1, json!({"name": "Ada, second tab"})),
        ]);
        tracker.apply_update(&doc, &c1, &batch).unwrap();
        tracker.apply(&doc, &c2, &AwarenessEntry::new(22, 1, json!({"name": "Bob"})));
        assert_eq!(tracker.connection_count(&doc), 2);

        let removal = tracker.remove_connection(&doc, &c1).unwrap();
        assert_eq!(
            AwarenessUpdate::decode(&removal).unwrap().entries,
            vec![AwarenessEntry::removal(11, 4), AwarenessEntry::removal(12, 2)]
        );
        assert_eq!(client_ids(&tracker.snapshot_for(&doc).unwrap()), vec![22]);

        // Removing twice yields nothing
        assert!(tracker.remove_connection(&doc, &c1).is_none());
    }

    #[test]
    fn test_echoed_removal_of_unknown_client_ignored() {
        let tracker = AwarenessTracker::new();
        let (doc, c1, _) = ids();
        assert!(!tracker.apply(&doc, &c1, &AwarenessEntry::removal(22, 2)));
        assert!(tracker.clients_of(&doc, &c1).is_empty());
    }

    #[test]
    fn test_client_cleared_presence_not_in_snapshot() {
        let tracker = AwarenessTracker::new();
        let (doc, c1, _) = ids();
        tracker.apply(&doc, &c1, &AwarenessEntry::new(1, 1, json!({"name": "Ada"})));
        assert!(tracker.apply(&doc, &c1, &AwarenessEntry::removal(1, 2)));

        assert!(tracker.snapshot_for(&doc).is_none());
        // Replay of the older state stays rejected
        assert!(!tracker.apply(&doc, &c1, &AwarenessEntry::new(1, 1, json!({"name": "Ada"}))));
        // Nothing left to clear on disconnect
        assert!(tracker.remove_connection(&doc, &c1).is_none());
    }

    #[test]
    fn test_removal_at_same_clock_accepted() {
        let tracker = AwarenessTracker::new();
        let (doc, c1, _) = ids();
        tracker.apply(&doc, &c1, &AwarenessEntry::new(1, 3, json!({"name": "Ada"})));
        assert!(tracker.apply(&doc, &c1, &AwarenessEntry::removal(1, 3)));
        assert!(!tracker.apply(&doc, &c1, &AwarenessEntry::removal(1, 3)));
    }

    #[test]
    fn test_documents_are_isolated() {
        let tracker = AwarenessTracker::new();
        let (doc, c1, _) = ids();
        let other = DocumentId::new("doc-8").unwrap();
        tracker.apply(&doc, &c1, &AwarenessEntry::new(1, 1, json!({"here": true})));

        assert!(tracker.snapshot_for(&other).is_none());
        tracker.clear_document(&doc);
        assert!(tracker.snapshot_for(&doc).is_none());
    }
}
