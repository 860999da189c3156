//! In-process grid store.
//!
//! Backs servers started without a storage path, and tests that need to
//! simulate a failing store: writes can be made to fail for single cells or
//! for every cell until [`MemoryGridStore::heal`] is called.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use super::{default_cells, GridStore, StoreError, StoredCell};
use grid_core::{CellRef, GridExtent};

#[derive(Default)]
pub struct MemoryGridStore {
    cells: Mutex<BTreeMap<CellRef, String>>,
    extent: Mutex<Option<GridExtent>>,
    failing: Mutex<HashSet<CellRef>>,
    fail_all: AtomicBool,
    writes: AtomicU64,
}

impl MemoryGridStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write to `cell` fail.
    pub fn fail_cell(&self, cell: CellRef) {
        self.lock_failing().insert(cell);
    }

    /// Make every subsequent write fail, regardless of cell.
    pub fn fail_all_writes(&self) {
        self.fail_all.store(true, Ordering::SeqCst);
    }

    /// Clear all injected faults.
    pub fn heal(&self) {
        self.lock_failing().clear();
        self.fail_all.store(false, Ordering::SeqCst);
    }

    /// Number of successful `write_cell` calls (seeding not included).
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn read_cell(&self, row: u32, col: u32) -> Option<String> {
        self.lock_cells().get(&CellRef::new(row, col)).cloned()
    }

    pub fn cell_count(&self) -> usize {
        self.lock_cells().len()
    }

    // A poisoned lock only means another writer panicked mid-insert; the
    // map itself is still a valid map.
    fn lock_cells(&self) -> std::sync::MutexGuard<'_, BTreeMap<CellRef, String>> {
        self.cells.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_extent(&self) -> std::sync::MutexGuard<'_, Option<GridExtent>> {
        self.extent.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_failing(&self) -> std::sync::MutexGuard<'_, HashSet<CellRef>> {
        self.failing.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl GridStore for MemoryGridStore {
    fn load_all(&self) -> Result<Vec<StoredCell>, StoreError> {
        Ok(self
            .lock_cells()
            .iter()
            .map(|(cell, value)| StoredCell::new(cell.row, cell.col, value.clone()))
            .collect())
    }

    fn seed(&self, rows: u32, cols: u32) -> Result<usize, StoreError> {
        let mut cells = self.lock_cells();
        if !cells.is_empty() {
            return Ok(0);
        }
        let defaults = default_cells(rows, cols);
        let count = defaults.len();
        cells.extend(defaults.into_iter().map(|c| (c.cell(), c.value)));
        *self.lock_extent() = Some(GridExtent::new(rows, cols));
        Ok(count)
    }

    fn write_cell(&self, row: u32, col: u32, value: &str) -> Result<(), StoreError> {
        let cell = CellRef::new(row, col);
        if self.fail_all.load(Ordering::SeqCst) || self.lock_failing().contains(&cell) {
            return Err(StoreError::InjectedFault(cell));
        }
        self.lock_cells().insert(cell, value.to_string());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn seeded_extent(&self) -> Result<Option<GridExtent>, StoreError> {
        Ok(*self.lock_extent())
    }

    fn record_extent(&self, extent: GridExtent) -> Result<(), StoreError> {
        *self.lock_extent() = Some(extent);
        Ok(())
    }
}
