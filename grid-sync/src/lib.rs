//! # grid-sync — Realtime multi-user grid synchronization
//!
//! One shared `rows × cols` grid of text cells, edited concurrently by many
//! WebSocket sessions. Every edit is applied to one authoritative in-memory
//! grid, persisted cell by cell, and broadcast to live sessions.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────┐
//! │ GridClient  │ ◄─────────────────► │ SyncServer   │
//! │ (per user)  │     Binary Proto    │ (central)    │
//! └─────────────┘                     └──────┬───────┘
//!                                            │
//!                                     ┌──────┴───────┐
//!                                     │ SyncEngine   │
//!                                     └──┬────┬───┬──┘
//!                          ┌─────────────┘    │   └──────────────┐
//!                          ▼                  ▼                  ▼
//!                   ┌─────────────┐   ┌───────────────┐  ┌─────────────┐
//!                   │ GridState   │   │SessionRegistry│  │ GridStore   │
//!                   │ (authority) │   │ (fan-out)     │  │ (RocksDB)   │
//!                   └─────────────┘   └───────────────┘  └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire protocol (bincode-encoded GridMessage)
//! - [`storage`] — Durable cell storage (RocksDB, in-memory)
//! - [`state`] — Authoritative in-memory grid
//! - [`registry`] — Live sessions and broadcast fan-out
//! - [`engine`] — Edit pipeline: validate, apply, persist, broadcast
//! - [`bulk`] — Whole-grid export and import
//! - [`server`] — WebSocket sync server
//! - [`client`] — WebSocket grid client

pub mod bulk;
pub mod client;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod state;
pub mod storage;

// Re-exports for convenience
pub use bulk::{BulkReport, CellFailure};
pub use client::{ClientEvent, ConnectionState, GridClient};
pub use engine::{EditEvent, EditOutcome, EngineConfig, EngineStats, ReconcileReport, SyncEngine};
pub use error::SyncError;
pub use protocol::{
    BulkSaveResponse, CellUpdate, ErrorKind, ErrorReply, FailedCell, GridMessage, MessageType,
    ProtocolError,
};
pub use registry::{BroadcastStats, Session, SessionReceiver, SessionRegistry};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use state::{AppliedEdit, GridState};
pub use storage::{GridStore, MemoryGridStore, RocksGridStore, StoreConfig, StoreError, StoredCell};
