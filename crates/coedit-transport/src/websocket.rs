//! WebSocket transport for coedit

use std::net::SocketAddr;
use std::sync::Arc;

use coedit_core::ConnectionId;
use coedit_protocol::{decode_frame, ClientControl, ServerControl};
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::connection::Outbound;
use crate::service::CollabService;

type WsError = tokio_tungstenite::tungstenite::Error;

/// WebSocket Server for coedit
pub struct WebSocketServer {
    service: Arc<CollabService>,
    addr: SocketAddr,
}

impl WebSocketServer {
    pub fn new(service: Arc<CollabService>, addr: SocketAddr) -> Self {
        Self { service, addr }
    }

    /// Start the WebSocket server
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "coedit WebSocket server listening");

        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let conn = ConnectionId::generate("ws");
                    let service = self.service.clone();

                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_connection(stream, peer_addr, conn.clone(), service).await {
                            error!(conn = %conn, error = %e, "WebSocket connection error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        peer_addr: SocketAddr,
        conn: ConnectionId,
        service: Arc<CollabService>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = accept_async(stream).await?;
        let (mut write, mut read) = ws_stream.split();

        let mut outbound = service.on_connect(conn.clone())?;
        let kick = outbound.kick_signal();
        info!(conn = %conn, peer = %peer_addr, "WebSocket client connected");

        let result: Result<(), WsError> = async {
            loop {
                tokio::select! {
                    // Handle incoming WebSocket messages
                    msg = read.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                match decode_frame(&data) {
                                    Ok((channel, payload)) => {
                                        service.on_message(&conn, channel, payload);
                                    }
                                    Err(e) => {
                                        warn!(conn = %conn, error = %e, "Dropping malformed frame");
                                        service.metrics().record_drop("frame", "decode");
                                    }
                                }
                            }
                            Some(Ok(Message::Text(text))) => {
                                if let Some(reply) = Self::handle_control(&service, &conn, &text).await {
                                    Self::send(&mut write, &service, Outbound::Control(reply)).await?;
                                }
                            }
                            Some(Ok(Message::Ping(data))) => {
                                write.send(Message::Pong(data)).await?;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                info!(conn = %conn, "WebSocket client disconnected");
                                break;
                            }
                            Some(Ok(_)) => {
                                // Ignore other message types
                            }
                            Some(Err(e)) => {
                                error!(conn = %conn, error = %e, "WebSocket read error");
                                break;
                            }
                        }
                    }

                    // Deliver queued messages
                    queued = outbound.recv() => {
                        match queued {
                            Some(message) => Self::send(&mut write, &service, message).await?,
                            None => break,
                        }
                    }

                    _ = kick.notified() => {
                        warn!(conn = %conn, "Closing slow WebSocket client");
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            Ok(())
        }
        .await;

        service.on_disconnect(&conn).await;
        result.map_err(Into::into)
    }

    /// Apply a text control message; returns an error reply if it failed
    async fn handle_control(
        service: &CollabService,
        conn: &ConnectionId,
        text: &str,
    ) -> Option<ServerControl> {
        let control = match ClientControl::parse(text) {
            Ok(control) => control,
            Err(e) => {
                debug!(conn = %conn, error = %e, "Invalid control message");
                service.metrics().record_drop("control", "decode");
                return Some(ServerControl::error("bad_request", e.to_string()));
            }
        };

        let result = match control {
            ClientControl::Join { document_id, user } => service
                .join_document(conn, &document_id, user)
                .await
                .map(|_| ()),
            ClientControl::Leave => service.leave_document(conn).await.map(|_| ()),
        };
        result
            .err()
            .map(|e| ServerControl::error(e.code(), e.to_string()))
    }

    async fn send<S>(write: &mut S, service: &CollabService, message: Outbound) -> Result<(), WsError>
    where
        S: Sink<Message, Error = WsError> + Unpin,
    {
        let frame = match message.to_frame() {
            Some(bytes) => Message::Binary(bytes.to_vec()),
            None => match message {
                Outbound::Control(control) => Message::Text(control.to_json()),
                _ => return Ok(()),
            },
        };
        service.metrics().bytes_sent.inc_by(frame.len() as u64);
        write.send(frame).await
    }
}
