//! # grid-core — data model for the shared grid
//!
//! Plain types with no I/O: cell coordinates and their spreadsheet labels,
//! the fixed grid extent, and the dense grid of cell values. The sync layer
//! (`grid-sync`) owns the one live instance of [`Grid`] and is the only
//! place it is mutated.

pub mod cell;
pub mod error;
pub mod grid;

pub use cell::{column_label, CellRef};
pub use error::GridError;
pub use grid::{Grid, GridExtent, LoadReport};
