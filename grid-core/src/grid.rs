//! Dense rectangular grid of cell values.
//!
//! Values are held row-major in one `Vec<String>` sized to the extent, so
//! every in-extent coordinate has exactly one value and nothing can exist
//! outside the extent.

use serde::{Deserialize, Serialize};

use crate::cell::CellRef;
use crate::error::GridError;

/// Fixed rows × columns bound of addressable cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridExtent {
    pub rows: u32,
    pub cols: u32,
}

impl Default for GridExtent {
    fn default() -> Self {
        Self { rows: 10, cols: 10 }
    }
}

impl GridExtent {
    pub const fn new(rows: u32, cols: u32) -> Self {
        Self { rows, cols }
    }

    pub fn contains(&self, cell: CellRef) -> bool {
        cell.row < self.rows && cell.col < self.cols
    }

    /// `Ok` when `cell` is addressable, `InvalidCoordinate` otherwise.
    pub fn check(&self, cell: CellRef) -> Result<(), GridError> {
        if self.contains(cell) {
            Ok(())
        } else {
            Err(GridError::InvalidCoordinate {
                row: cell.row,
                col: cell.col,
                rows: self.rows,
                cols: self.cols,
            })
        }
    }

    pub fn cell_count(&self) -> usize {
        self.rows as usize * self.cols as usize
    }

    /// All coordinates in row-major order.
    pub fn cells(&self) -> impl Iterator<Item = CellRef> + '_ {
        let cols = self.cols;
        (0..self.rows).flat_map(move |row| (0..cols).map(move |col| CellRef::new(row, col)))
    }

    fn offset(&self, cell: CellRef) -> usize {
        cell.row as usize * self.cols as usize + cell.col as usize
    }
}

/// What happened while building a grid from stored cells.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// In-extent cells storage had no value for; they hold their default label.
    pub missing: Vec<CellRef>,
    /// Stored cells outside the extent, dropped.
    pub ignored: usize,
}

/// The full grid of cell values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grid {
    extent: GridExtent,
    values: Vec<String>,
}

impl Grid {
    /// A grid where every cell holds its own label (`A1`, `B1`, ...).
    pub fn with_defaults(extent: GridExtent) -> Self {
        let values = extent.cells().map(|cell| cell.label()).collect();
        Self { extent, values }
    }

    /// Build a grid from stored `(cell, value)` pairs.
    ///
    /// Cells absent from `stored` fall back to their default label and are
    /// listed in the report so the caller can write them back.
    pub fn from_cells<I>(extent: GridExtent, stored: I) -> (Self, LoadReport)
    where
        I: IntoIterator<Item = (CellRef, String)>,
    {
        let mut slots: Vec<Option<String>> = vec![None; extent.cell_count()];
        let mut report = LoadReport::default();

        for (cell, value) in stored {
            if extent.contains(cell) {
                slots[extent.offset(cell)] = Some(value);
            } else {
                report.ignored += 1;
            }
        }

        let values = extent
            .cells()
            .zip(slots)
            .map(|(cell, slot)| {
                slot.unwrap_or_else(|| {
                    report.missing.push(cell);
                    cell.label()
                })
            })
            .collect();

        (Self { extent, values }, report)
    }

    pub fn extent(&self) -> GridExtent {
        self.extent
    }

    pub fn get(&self, cell: CellRef) -> Option<&str> {
        if self.extent.contains(cell) {
            Some(self.values[self.extent.offset(cell)].as_str())
        } else {
            None
        }
    }

    /// Replace a cell's value, returning what it held before.
    pub fn replace(&mut self, cell: CellRef, value: String) -> Result<String, GridError> {
        self.extent.check(cell)?;
        let offset = self.extent.offset(cell);
        Ok(std::mem::replace(&mut self.values[offset], value))
    }

    /// Values as rows of columns, ordered by row then column.
    pub fn to_rows(&self) -> Vec<Vec<String>> {
        if self.extent.cols == 0 {
            return vec![Vec::new(); self.extent.rows as usize];
        }
        self.values
            .chunks(self.extent.cols as usize)
            .map(|row| row.to_vec())
            .collect()
    }

    /// `(cell, value)` pairs in row-major order.
    pub fn iter(&self) -> impl Iterator<Item = (CellRef, &str)> + '_ {
        self.extent.cells().zip(self.values.iter().map(String::as_str))
    }
}
