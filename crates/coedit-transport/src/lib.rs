//! coedit Transport Layer
//!
//! Connects clients to replicas:
//! - Rooms: membership and fan-out per document
//! - Relay: sync and awareness message handling
//! - Persistence: debounced saves and final flushes
//! - WebSocket: browser-compatible transport
//! - Metrics: Prometheus metrics

pub mod config;
pub mod connection;
pub mod metrics;
pub mod persistence;
pub mod relay;
pub mod room;
pub mod service;
pub mod websocket;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::ServiceConfig;
pub use connection::{ConnectionHandle, ConnectionReceiver, Delivery, Outbound};
pub use metrics::{Metrics, MetricsServer};
pub use persistence::PersistenceScheduler;
pub use relay::{RelayOutcome, SyncRelay};
pub use room::{JoinOutcome, RoomManager};
pub use service::{CollabService, ServiceError, ServiceStats};
pub use websocket::WebSocketServer;
