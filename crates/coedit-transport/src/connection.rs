//! Per-connection outbound queues
//!
//! Every connection gets a bounded queue. Producers never wait on it: a send
//! that finds the queue full kicks the connection instead, and its transport
//! task tears it down.

use bytes::Bytes;
use coedit_core::ConnectionId;
use coedit_protocol::{decode_sync, encode_frame, encode_sync, Channel, ServerControl, SyncMessage};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify};

/// A message queued for delivery to one connection
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Encoded sync channel message
    Sync(Bytes),
    /// Encoded awareness update, without the frame's length prefix
    Awareness(Bytes),
    /// JSON control message
    Control(ServerControl),
}

impl Outbound {
    pub fn sync(message: &SyncMessage) -> Self {
        Outbound::Sync(Bytes::from(encode_sync(message)))
    }

    pub fn awareness(update: Vec<u8>) -> Self {
        Outbound::Awareness(Bytes::from(update))
    }

    /// Channel-framed bytes for binary messages, `None` for control messages
    pub fn to_frame(&self) -> Option<Bytes> {
        match self {
            Outbound::Sync(payload) => Some(encode_frame(Channel::Sync, payload)),
            Outbound::Awareness(payload) => Some(encode_frame(Channel::Awareness, payload)),
            Outbound::Control(_) => None,
        }
    }

    /// Decode the sync payload, if this is a sync message
    pub fn as_sync(&self) -> Option<SyncMessage> {
        match self {
            Outbound::Sync(payload) => decode_sync(payload).ok(),
            _ => None,
        }
    }
}

/// Result of a non-blocking enqueue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// Queue was full; the connection has been told to close
    Kicked,
    /// Receiver is gone
    Closed,
}

/// Sending half of a connection, cloned into every room it joins
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::Sender<Outbound>,
    kick: Arc<Notify>,
}

impl ConnectionHandle {
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Enqueue without waiting
    pub fn try_send(&self, message: Outbound) -> Delivery {
        match self.tx.try_send(message) {
            Ok(()) => Delivery::Sent,
            Err(TrySendError::Full(_)) => {
                self.kick();
                Delivery::Kicked
            }
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    /// Ask the transport task to close this connection
    pub fn kick(&self) {
        self.kick.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving half of a connection, owned by its transport task
#[derive(Debug)]
pub struct ConnectionReceiver {
    id: ConnectionId,
    rx: mpsc::Receiver<Outbound>,
    kick: Arc<Notify>,
}

impl ConnectionReceiver {
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub async fn recv(&mut self) -> Option<Outbound> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Outbound> {
        self.rx.try_recv().ok()
    }

    /// Everything queued right now
    pub fn drain(&mut self) -> Vec<Outbound> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    /// Signal fired when the connection must be closed
    pub fn kick_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.kick)
    }
}

/// Create the two halves of a connection's outbound queue
pub fn channel(id: ConnectionId, capacity: usize) -> (ConnectionHandle, ConnectionReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let kick = Arc::new(Notify::new());
    (
        ConnectionHandle {
            id: id.clone(),
            tx,
            kick: Arc::clone(&kick),
        },
        ConnectionReceiver { id, rx, kick },
    )
}
