//! Binary wire protocol for grid synchronization.
//!
//! Every WebSocket frame is one bincode-encoded [`GridMessage`]:
//! ```text
//! ┌──────────┬───────────────┬────────────┬──────────┐
//! │ msg_type │ connection_id │ request_id │ payload  │
//! │ 1 byte   │ 16 bytes      │ varint     │ variable │
//! └──────────┴───────────────┴────────────┴──────────┘
//! ```
//!
//! `connection_id` names the session a message originates from (the
//! editor, for `CellUpdated`) and `request_id` ties a response to the
//! request that caused it. Snapshot payloads are LZ4 compressed.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Client introduces itself with a display identity
    Hello = 1,
    /// Server acknowledges Hello; header carries the assigned connection id
    Welcome = 2,
    /// Client edits one cell
    CellUpdate = 3,
    /// Server fans out an accepted edit
    CellUpdated = 4,
    /// Client asks for the full grid
    SnapshotRequest = 5,
    /// Full grid, rows of values
    Snapshot = 6,
    /// Client submits a full grid save
    BulkSave = 7,
    /// Outcome of a bulk save
    BulkResult = 8,
    /// Request rejected (sent to the requester only)
    Error = 9,
    /// Session joined
    PeerJoined = 10,
    /// Session left
    PeerLeft = 11,
    /// Heartbeat ping
    Ping = 12,
    /// Heartbeat pong
    Pong = 13,
}

/// A single-cell edit as it travels on the wire.
///
/// `cell_id` is the spreadsheet label (`"B3"`). `label` is opaque client
/// data (the editor's caret position, say) that is echoed untouched.
/// `user` is ignored on input; the server fills it from the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellUpdate {
    pub cell_id: String,
    pub text: String,
    pub label: Option<String>,
    pub user: Option<String>,
}

impl CellUpdate {
    pub fn new(cell_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            cell_id: cell_id.into(),
            text: text.into(),
            label: None,
            user: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// One cell a bulk save could not apply or persist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedCell {
    pub row: u32,
    pub col: u32,
    pub reason: String,
}

/// Bulk save response.
///
/// `message` is set on full success, `error` + `details` when any cell
/// failed; `applied_count` and `failed_cells` are always filled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkSaveResponse {
    pub message: Option<String>,
    pub error: Option<String>,
    pub details: Option<String>,
    pub applied_count: u64,
    pub failed_cells: Vec<FailedCell>,
}

/// Why a request was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidCoordinate,
    InvalidCell,
    StorageFailure,
    DuplicateConnection,
    UnknownConnection,
    BulkImportPartialFailure,
    Protocol,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub kind: ErrorKind,
    pub message: String,
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridMessage {
    pub msg_type: MessageType,
    pub connection_id: Uuid,
    pub request_id: u64,
    pub payload: Vec<u8>,
}

impl GridMessage {
    fn try_with_payload<T: Serialize>(
        msg_type: MessageType,
        connection_id: Uuid,
        request_id: u64,
        value: &T,
    ) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(value, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self {
            msg_type,
            connection_id,
            request_id,
            payload,
        })
    }

    /// Infallible form for the payload types defined here, which always
    /// serialize. A failure is logged and leaves the payload empty, so the
    /// receiver rejects the frame instead of misreading it.
    fn with_payload<T: Serialize>(
        msg_type: MessageType,
        connection_id: Uuid,
        request_id: u64,
        value: &T,
    ) -> Self {
        Self::try_with_payload(msg_type, connection_id, request_id, value).unwrap_or_else(|e| {
            log::error!("Failed to encode {msg_type:?} payload: {e}");
            Self::empty(msg_type, connection_id, request_id)
        })
    }

    fn empty(msg_type: MessageType, connection_id: Uuid, request_id: u64) -> Self {
        Self {
            msg_type,
            connection_id,
            request_id,
            payload: Vec::new(),
        }
    }

    /// Create a hello carrying the client's display identity.
    pub fn hello(identity: &str) -> Self {
        Self::with_payload(MessageType::Hello, Uuid::nil(), 0, &identity)
    }

    /// Create a welcome for a freshly registered connection.
    pub fn welcome(connection_id: Uuid) -> Self {
        Self::empty(MessageType::Welcome, connection_id, 0)
    }

    /// Create a client cell edit.
    pub fn cell_update(connection_id: Uuid, request_id: u64, update: &CellUpdate) -> Self {
        Self::with_payload(MessageType::CellUpdate, connection_id, request_id, update)
    }

    /// Create the broadcast form of an accepted edit.
    pub fn cell_updated(origin: Uuid, update: &CellUpdate) -> Self {
        Self::with_payload(MessageType::CellUpdated, origin, 0, update)
    }

    pub fn snapshot_request(connection_id: Uuid, request_id: u64) -> Self {
        Self::empty(MessageType::SnapshotRequest, connection_id, request_id)
    }

    /// Create a snapshot response (bincode, then LZ4).
    pub fn snapshot(request_id: u64, rows: &[Vec<String>]) -> Result<Self, ProtocolError> {
        let raw = bincode::serde::encode_to_vec(rows, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self {
            msg_type: MessageType::Snapshot,
            connection_id: Uuid::nil(),
            request_id,
            payload: lz4_flex::compress_prepend_size(&raw),
        })
    }

    pub fn bulk_save(connection_id: Uuid, request_id: u64, rows: &[Vec<String>]) -> Self {
        Self::with_payload(MessageType::BulkSave, connection_id, request_id, &rows)
    }

    pub fn bulk_result(request_id: u64, response: &BulkSaveResponse) -> Self {
        Self::with_payload(MessageType::BulkResult, Uuid::nil(), request_id, response)
    }

    pub fn error(request_id: u64, kind: ErrorKind, message: impl Into<String>) -> Self {
        let reply = ErrorReply {
            kind,
            message: message.into(),
        };
        Self::with_payload(MessageType::Error, Uuid::nil(), request_id, &reply)
    }

    /// Create a peer joined notification.
    pub fn peer_joined(connection_id: Uuid, identity: &str) -> Self {
        Self::with_payload(MessageType::PeerJoined, connection_id, 0, &identity)
    }

    /// Create a peer left notification.
    pub fn peer_left(connection_id: Uuid) -> Self {
        Self::empty(MessageType::PeerLeft, connection_id, 0)
    }

    pub fn ping(connection_id: Uuid) -> Self {
        Self::empty(MessageType::Ping, connection_id, 0)
    }

    pub fn pong(connection_id: Uuid) -> Self {
        Self::empty(MessageType::Pong, connection_id, 0)
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    fn payload_as<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, ProtocolError> {
        let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(value)
    }

    fn expect_type(&self, expected: &[MessageType]) -> Result<(), ProtocolError> {
        if expected.contains(&self.msg_type) {
            Ok(())
        } else {
            Err(ProtocolError::InvalidMessageType)
        }
    }

    /// Identity carried by `Hello` or `PeerJoined`.
    pub fn identity(&self) -> Result<String, ProtocolError> {
        self.expect_type(&[MessageType::Hello, MessageType::PeerJoined])?;
        self.payload_as(&self.payload)
    }

    /// Edit carried by `CellUpdate` or `CellUpdated`.
    pub fn update(&self) -> Result<CellUpdate, ProtocolError> {
        self.expect_type(&[MessageType::CellUpdate, MessageType::CellUpdated])?;
        self.payload_as(&self.payload)
    }

    /// Rows carried by `Snapshot` (decompressed) or `BulkSave`.
    pub fn rows(&self) -> Result<Vec<Vec<String>>, ProtocolError> {
        match self.msg_type {
            MessageType::Snapshot => {
                let raw = lz4_flex::decompress_size_prepended(&self.payload)
                    .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
                self.payload_as(&raw)
            }
            MessageType::BulkSave => self.payload_as(&self.payload),
            _ => Err(ProtocolError::InvalidMessageType),
        }
    }

    pub fn bulk_response(&self) -> Result<BulkSaveResponse, ProtocolError> {
        self.expect_type(&[MessageType::BulkResult])?;
        self.payload_as(&self.payload)
    }

    pub fn error_reply(&self) -> Result<ErrorReply, ProtocolError> {
        self.expect_type(&[MessageType::Error])?;
        self.payload_as(&self.payload)
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidMessageType,
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessageType => write!(f, "Invalid message type"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}
