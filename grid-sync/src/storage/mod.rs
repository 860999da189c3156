//! Durable persistence of grid cells.
//!
//! ```text
//! ┌─────────────┐   write_cell   ┌─────────────────┐
//! │ SyncEngine  │ ─────────────► │ dyn GridStore   │
//! │ (in-memory) │                ├─────────────────┤
//! └──────┬──────┘                │ RocksGridStore  │  CF "cells": row‖col → value
//!        │ load_all (startup)    │ MemoryGridStore │  BTreeMap, fault injection
//!        ▼                       └─────────────────┘
//! ┌─────────────┐
//! │ GridState   │
//! └─────────────┘
//! ```
//!
//! The store is write-only from the engine's point of view except for the
//! one `load_all` (and extent check) performed when the grid state is first
//! built.

pub mod memory;
pub mod rocks;

use grid_core::{CellRef, GridExtent};

pub use memory::MemoryGridStore;
pub use rocks::{RocksGridStore, StoreConfig};

/// One persisted `(row_index, col_index, value)` triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCell {
    pub row: u32,
    pub col: u32,
    pub value: String,
}

impl StoredCell {
    pub fn new(row: u32, col: u32, value: impl Into<String>) -> Self {
        Self {
            row,
            col,
            value: value.into(),
        }
    }

    pub fn cell(&self) -> CellRef {
        CellRef::new(self.row, self.col)
    }
}

/// Durable cell storage keyed by coordinate.
///
/// Implementations must accept concurrent `write_cell` calls for different
/// coordinates. A failed write affects only the cell being written.
pub trait GridStore: Send + Sync {
    /// Every persisted cell. Empty means the grid was never initialized.
    fn load_all(&self) -> Result<Vec<StoredCell>, StoreError>;

    /// Write the default-labelled `rows × cols` grid if the store is empty.
    ///
    /// Returns the number of cells written; 0 when data already exists.
    fn seed(&self, rows: u32, cols: u32) -> Result<usize, StoreError>;

    /// Upsert one cell.
    fn write_cell(&self, row: u32, col: u32, value: &str) -> Result<(), StoreError>;

    /// Extent recorded by `seed` or `record_extent`; `None` if never recorded.
    fn seeded_extent(&self) -> Result<Option<GridExtent>, StoreError>;

    /// Record the extent the stored cells now cover.
    fn record_extent(&self, extent: GridExtent) -> Result<(), StoreError>;
}

/// Default-labelled cells for a fresh grid, row-major.
pub fn default_cells(rows: u32, cols: u32) -> Vec<StoredCell> {
    GridExtent::new(rows, cols)
        .cells()
        .map(|cell| StoredCell::new(cell.row, cell.col, cell.label()))
        .collect()
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    /// Stored bytes could not be decoded as a cell
    DecodeError(String),
    /// Write rejected by an injected fault (in-memory store)
    InjectedFault(CellRef),
    /// I/O error
    IoError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::DecodeError(e) => write!(f, "Decode error: {e}"),
            StoreError::InjectedFault(cell) => write!(f, "Write to {cell} rejected"),
            StoreError::IoError(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::IoError(e.to_string())
    }
}
