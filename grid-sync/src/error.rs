use grid_core::GridError;
use thiserror::Error;
use uuid::Uuid;

use crate::bulk::BulkReport;
use crate::protocol::{ErrorKind, ProtocolError};
use crate::storage::StoreError;

#[derive(Error, Debug, Clone)]
pub enum SyncError {
    #[error("cell ({row}, {col}) is outside the {rows}x{cols} grid")]
    InvalidCoordinate {
        row: u32,
        col: u32,
        rows: u32,
        cols: u32,
    },
    #[error("invalid cell id '{0}'")]
    InvalidCell(String),
    #[error("storage failure: {0}")]
    StorageFailure(#[from] StoreError),
    #[error("connection {0} is already registered")]
    DuplicateConnection(Uuid),
    #[error("connection {0} is not registered")]
    UnknownConnection(Uuid),
    #[error("bulk import failed for {} of {} cells", .0.failed_cells.len(), .0.attempted())]
    BulkImportPartialFailure(BulkReport),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl SyncError {
    /// Wire-level classification sent back to the requesting client.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::InvalidCoordinate { .. } => ErrorKind::InvalidCoordinate,
            SyncError::InvalidCell(_) => ErrorKind::InvalidCell,
            SyncError::StorageFailure(_) => ErrorKind::StorageFailure,
            SyncError::DuplicateConnection(_) => ErrorKind::DuplicateConnection,
            SyncError::UnknownConnection(_) => ErrorKind::UnknownConnection,
            SyncError::BulkImportPartialFailure(_) => ErrorKind::BulkImportPartialFailure,
            SyncError::Protocol(_) => ErrorKind::Protocol,
        }
    }
}

impl From<GridError> for SyncError {
    fn from(e: GridError) -> Self {
        match e {
            GridError::InvalidCoordinate { row, col, rows, cols } => {
                SyncError::InvalidCoordinate { row, col, rows, cols }
            }
            GridError::ParseCell(label) => SyncError::InvalidCell(label),
        }
    }
}
