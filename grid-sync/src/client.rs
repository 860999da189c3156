//! WebSocket client for the grid server.
//!
//! Provides:
//! - Connection lifecycle (connect, hello, disconnect detection)
//! - Cell edits, snapshot requests and bulk saves
//! - Decoded server frames delivered as [`ClientEvent`]s
//!
//! Requests carry a client-chosen `request_id`; the matching `Snapshot`,
//! `BulkResult` or `Error` event carries it back.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{BulkSaveResponse, CellUpdate, ErrorReply, GridMessage, MessageType, ProtocolError};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the grid client.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Connection established
    Connected,
    /// Server accepted our hello and assigned a connection id
    Welcome(Uuid),
    /// Full grid, in reply to hello or a snapshot request
    Snapshot {
        request_id: u64,
        rows: Vec<Vec<String>>,
    },
    /// An edit accepted by the server (ours included when echo is on)
    CellUpdated {
        origin: Uuid,
        update: CellUpdate,
    },
    BulkResult {
        request_id: u64,
        response: BulkSaveResponse,
    },
    /// A request of ours was rejected
    Error {
        request_id: u64,
        reply: ErrorReply,
    },
    PeerJoined {
        connection_id: Uuid,
        identity: String,
    },
    PeerLeft(Uuid),
    Pong,
    /// Connection lost
    Disconnected,
}

/// The grid client.
pub struct GridClient {
    /// Display identity sent in the hello
    identity: String,

    /// Connection id assigned by the server
    connection_id: Arc<RwLock<Option<Uuid>>>,

    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Next request id
    next_request: AtomicU64,

    /// Channel to send messages to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<ClientEvent>>,

    /// Event sender (held by connection task)
    event_tx: mpsc::Sender<ClientEvent>,

    /// Server URL
    server_url: String,
}

impl GridClient {
    pub fn new(identity: impl Into<String>, server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            identity: identity.into(),
            connection_id: Arc::new(RwLock::new(None)),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            next_request: AtomicU64::new(1),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            server_url: server_url.into(),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server and send our hello.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(&self.server_url).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                log::warn!("Failed to connect to {}: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        out_tx
            .send(GridMessage::hello(&self.identity).encode()?)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        self.outgoing_tx = Some(out_tx);

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(ClientEvent::Connected).await;

        // Reader task: process incoming WebSocket messages
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let connection_id = self.connection_id.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        let grid_msg = match GridMessage::decode(&bytes) {
                            Ok(m) => m,
                            Err(e) => {
                                log::warn!("Dropping undecodable frame: {e}");
                                continue;
                            }
                        };
                        if grid_msg.msg_type == MessageType::Welcome {
                            *connection_id.write().await = Some(grid_msg.connection_id);
                        }
                        if let Some(event) = to_event(grid_msg) {
                            let _ = event_tx.send(event).await;
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(ClientEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Edit one cell. Returns the request id.
    pub async fn send_edit(
        &self,
        cell_id: impl Into<String>,
        text: impl Into<String>,
        label: Option<String>,
    ) -> Result<u64, ProtocolError> {
        let request_id = self.next_request_id();
        let mut update = CellUpdate::new(cell_id, text);
        update.label = label;
        let msg = GridMessage::cell_update(self.connection_id().await, request_id, &update);
        self.send(msg).await?;
        Ok(request_id)
    }

    /// Ask for the full grid. Returns the request id.
    pub async fn request_snapshot(&self) -> Result<u64, ProtocolError> {
        let request_id = self.next_request_id();
        let msg = GridMessage::snapshot_request(self.connection_id().await, request_id);
        self.send(msg).await?;
        Ok(request_id)
    }

    /// Save a whole grid. Returns the request id.
    pub async fn bulk_save(&self, rows: &[Vec<String>]) -> Result<u64, ProtocolError> {
        let request_id = self.next_request_id();
        let msg = GridMessage::bulk_save(self.connection_id().await, request_id, rows);
        self.send(msg).await?;
        Ok(request_id)
    }

    /// Send a ping to the server.
    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        let msg = GridMessage::ping(self.connection_id().await);
        self.send(msg).await
    }

    async fn send(&self, msg: GridMessage) -> Result<(), ProtocolError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Err(ProtocolError::ConnectionClosed);
        }
        let encoded = msg.encode()?;
        match self.outgoing_tx {
            Some(ref tx) => tx
                .send(encoded)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    fn next_request_id(&self) -> u64 {
        self.next_request.fetch_add(1, Ordering::Relaxed)
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Connection id assigned by the server, nil until welcomed.
    pub async fn connection_id(&self) -> Uuid {
        self.connection_id.read().await.unwrap_or_else(Uuid::nil)
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Get the server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

fn to_event(msg: GridMessage) -> Option<ClientEvent> {
    match msg.msg_type {
        MessageType::Welcome => Some(ClientEvent::Welcome(msg.connection_id)),
        MessageType::Snapshot => msg.rows().ok().map(|rows| ClientEvent::Snapshot {
            request_id: msg.request_id,
            rows,
        }),
        MessageType::CellUpdated => msg.update().ok().map(|update| ClientEvent::CellUpdated {
            origin: msg.connection_id,
            update,
        }),
        MessageType::BulkResult => msg.bulk_response().ok().map(|response| ClientEvent::BulkResult {
            request_id: msg.request_id,
            response,
        }),
        MessageType::Error => msg.error_reply().ok().map(|reply| ClientEvent::Error {
            request_id: msg.request_id,
            reply,
        }),
        MessageType::PeerJoined => msg.identity().ok().map(|identity| ClientEvent::PeerJoined {
            connection_id: msg.connection_id,
            identity,
        }),
        MessageType::PeerLeft => Some(ClientEvent::PeerLeft(msg.connection_id)),
        MessageType::Pong => Some(ClientEvent::Pong),
        _ => None,
    }
}
