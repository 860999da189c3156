//! WebSocket sync server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                              ┌── GridState (authority)
//!             ├── connection task ── SyncEngine ┼── GridStore (RocksDB)
//! Client B ──┘        │                     └── SessionRegistry
//!                     │                               │
//!                     │             ┌─────────────────┼───────────┐
//!                     │             ▼                 ▼           ▼
//!                     └──────── Client A          Client B    Client C
//! ```
//!
//! Each connection gets a fresh connection id and runs its own task. The
//! task answers requests (snapshot, bulk save, ping, rejected edits)
//! directly and forwards broadcast frames from the registry. A background
//! ticker retries writes the store rejected.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use grid_core::{CellRef, GridExtent};

use crate::engine::{EditEvent, EngineConfig, SyncEngine};
use crate::error::SyncError;
use crate::protocol::{BulkSaveResponse, GridMessage, MessageType};
use crate::registry::SessionReceiver;
use crate::storage::{GridStore, MemoryGridStore, RocksGridStore, StoreConfig, StoreError};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Grid rows
    pub rows: u32,
    /// Grid columns
    pub cols: u32,
    /// Broadcast channel capacity
    pub broadcast_capacity: usize,
    /// Send each edit back to the session that made it
    pub echo_to_sender: bool,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Seconds between retries of failed writes (0 = never)
    pub reconcile_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            rows: 10,
            cols: 10,
            broadcast_capacity: 256,
            echo_to_sender: true,
            storage_path: None,
            reconcile_interval_secs: 30,
        }
    }
}

impl ServerConfig {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            extent: GridExtent::new(self.rows, self.cols),
            echo_to_sender: self.echo_to_sender,
            broadcast_capacity: self.broadcast_capacity,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub rejected_requests: u64,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    engine: Arc<SyncEngine>,
    /// Server-wide statistics
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Create a server, opening RocksDB storage if a path is configured.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let store: Arc<dyn GridStore> = match &config.storage_path {
            Some(path) => {
                let store_config = StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                };
                Arc::new(RocksGridStore::open(store_config)?)
            }
            None => Arc::new(MemoryGridStore::new()),
        };
        Ok(Self::with_store(config, store))
    }

    /// Create a server over an already opened store.
    pub fn with_store(config: ServerConfig, store: Arc<dyn GridStore>) -> Self {
        let engine = Arc::new(SyncEngine::new(config.engine_config(), store));
        Self {
            config,
            engine,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Create with default configuration (in-memory, no persistence).
    pub fn with_defaults() -> Self {
        Self::with_store(ServerConfig::default(), Arc::new(MemoryGridStore::new()))
    }

    /// Create with persistence enabled at the given path.
    pub fn with_storage(
        bind_addr: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> Result<Self, StoreError> {
        Self::new(ServerConfig {
            bind_addr: bind_addr.into(),
            storage_path: Some(path.into()),
            ..ServerConfig::default()
        })
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    ///
    /// The grid is loaded before the first connection is accepted, so a
    /// broken store stops the server here instead of failing every session.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        self.engine.initialize().await?;
        let reconciler = self.spawn_reconciler();

        let result = self.accept_loop(listener).await;

        if let Some(handle) = reconciler {
            handle.abort();
        }
        result
    }

    async fn accept_loop(&self, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let engine = self.engine.clone();
            let stats = self.stats.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, engine, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    fn spawn_reconciler(&self) -> Option<JoinHandle<()>> {
        if self.config.reconcile_interval_secs == 0 {
            return None;
        }
        let engine = self.engine.clone();
        let period = Duration::from_secs(self.config.reconcile_interval_secs);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick fires immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if engine.pending_count().await == 0 {
                    continue;
                }
                if let Err(e) = engine.reconcile().await {
                    log::warn!("Reconcile pass failed: {e}");
                }
            }
        }))
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        engine: Arc<SyncEngine>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let connection_id = Uuid::new_v4();

        log::info!("WebSocket connection {connection_id} established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let result = Self::session_loop(ws_stream, connection_id, &engine, &stats).await;

        // Cleanup: drop the session and tell the others
        if let Some(session) = engine.registry().unregister(&connection_id).await {
            let leave_msg = GridMessage::peer_left(connection_id);
            if let Err(e) = engine.registry().broadcast(connection_id, &leave_msg).await {
                log::warn!("Failed to announce departure of {connection_id}: {e}");
            }
            log::info!("{} ({connection_id}) left", session.identity);
        }
        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        log::info!("Connection closed from {addr}");

        result
    }

    async fn session_loop(
        ws_stream: WebSocketStream<TcpStream>,
        connection_id: Uuid,
        engine: &SyncEngine,
        stats: &RwLock<ServerStats>,
    ) -> Result<(), BoxError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let mut session_rx: Option<SessionReceiver> = None;

        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += bytes.len() as u64;
                            }

                            let replies = match GridMessage::decode(&bytes) {
                                Ok(request) => {
                                    Self::dispatch(request, connection_id, engine, &mut session_rx).await
                                }
                                Err(e) => {
                                    log::warn!("Failed to decode message from {connection_id}: {e}");
                                    vec![reject(0, &SyncError::from(e))]
                                }
                            };

                            for reply in replies {
                                if reply.msg_type == MessageType::Error {
                                    stats.write().await.rejected_requests += 1;
                                }
                                ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => break,

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error on {connection_id}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                // Outgoing broadcast frame
                frame = async {
                    if let Some(ref mut rx) = session_rx {
                        rx.recv().await
                    } else {
                        // Not registered yet, wait forever
                        std::future::pending().await
                    }
                } => {
                    match frame {
                        Some(bytes) => {
                            ws_sender.send(Message::Binary(bytes.to_vec().into())).await?;
                        }
                        None => break,
                    }
                }
            }
        }

        Ok(())
    }

    /// Process one request and return the replies for the requester.
    ///
    /// Accepted edits produce no direct reply; they come back (if at all)
    /// through the broadcast like everyone else's.
    async fn dispatch(
        request: GridMessage,
        connection_id: Uuid,
        engine: &SyncEngine,
        session_rx: &mut Option<SessionReceiver>,
    ) -> Vec<GridMessage> {
        let request_id = request.request_id;
        let result = match request.msg_type {
            MessageType::Hello => Self::on_hello(&request, connection_id, engine, session_rx).await,

            MessageType::CellUpdate => Self::on_cell_update(&request, connection_id, engine)
                .await
                .map(|_| Vec::new()),

            MessageType::SnapshotRequest => Self::snapshot_reply(request_id, engine)
                .await
                .map(|reply| vec![reply]),

            MessageType::BulkSave => Self::on_bulk_save(&request, connection_id, engine)
                .await
                .map(|reply| vec![reply]),

            MessageType::Ping => Ok(vec![GridMessage::pong(connection_id)]),

            other => {
                log::debug!("Unhandled message type from {connection_id}: {other:?}");
                Ok(Vec::new())
            }
        };

        result.unwrap_or_else(|e| {
            log::debug!("Rejected {:?} from {connection_id}: {e}", request.msg_type);
            vec![reject(request_id, &e)]
        })
    }

    async fn on_hello(
        request: &GridMessage,
        connection_id: Uuid,
        engine: &SyncEngine,
        session_rx: &mut Option<SessionReceiver>,
    ) -> Result<Vec<GridMessage>, SyncError> {
        if session_rx.is_some() {
            return Err(SyncError::DuplicateConnection(connection_id));
        }
        let identity = request.identity().unwrap_or_else(|_| "Anonymous".to_string());

        // Subscribe before reading the snapshot; an edit that lands between
        // the two is then seen twice rather than never.
        let rx = engine.registry().register(connection_id, identity.clone()).await?;
        let snapshot = match Self::snapshot_reply(request.request_id, engine).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                engine.registry().unregister(&connection_id).await;
                return Err(e);
            }
        };
        *session_rx = Some(rx);

        let join_msg = GridMessage::peer_joined(connection_id, &identity);
        engine.registry().broadcast(connection_id, &join_msg).await?;
        log::info!("{identity} ({connection_id}) joined");

        Ok(vec![GridMessage::welcome(connection_id), snapshot])
    }

    async fn on_cell_update(
        request: &GridMessage,
        connection_id: Uuid,
        engine: &SyncEngine,
    ) -> Result<(), SyncError> {
        let identity = engine.registry().identity_of(&connection_id).await?;
        let update = request.update()?;
        let cell: CellRef = update.cell_id.parse()?;

        let event = EditEvent {
            cell,
            value: update.text,
            identity,
            label: update.label,
        };
        engine.submit_edit(connection_id, event).await?;
        Ok(())
    }

    async fn on_bulk_save(
        request: &GridMessage,
        connection_id: Uuid,
        engine: &SyncEngine,
    ) -> Result<GridMessage, SyncError> {
        let identity = engine.registry().identity_of(&connection_id).await?;
        let rows = request.rows()?;
        let report = engine.import_bulk(connection_id, &identity, rows).await?;
        Ok(GridMessage::bulk_result(
            request.request_id,
            &BulkSaveResponse::from(&report),
        ))
    }

    async fn snapshot_reply(request_id: u64, engine: &SyncEngine) -> Result<GridMessage, SyncError> {
        let rows = engine.export_snapshot().await?;
        Ok(GridMessage::snapshot(request_id, &rows)?)
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Get the engine shared by every connection.
    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }
}

fn reject(request_id: u64, e: &SyncError) -> GridMessage {
    GridMessage::error(request_id, e.kind(), e.to_string())
}
