//! Authoritative in-memory grid.
//!
//! Built once from the store, then mutated only through [`GridState::apply_edit`]
//! and [`GridState::apply_batch`]. Both take the write lock for the in-memory
//! replacement alone, which makes that lock the single total order over all
//! edits. Every mutation bumps `version`, so the position of an edit in that
//! order travels with it to the persistence step.

use grid_core::{CellRef, Grid, GridError, GridExtent};
use tokio::sync::RwLock;

use crate::storage::{GridStore, StoreError};

/// Result of one in-memory replacement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedEdit {
    pub cell: CellRef,
    pub previous: String,
    /// Position of this edit in the total order (1-based).
    pub version: u64,
}

struct Inner {
    grid: Grid,
    version: u64,
}

pub struct GridState {
    extent: GridExtent,
    inner: RwLock<Inner>,
}

impl GridState {
    /// Load the grid from `store`, seeding it first if the store is empty.
    ///
    /// Cells the store is missing get their default label and are written
    /// back; stored cells outside `extent` are ignored. If the store was
    /// last recorded at another extent, `extent` wins and is recorded.
    pub fn initialize(store: &dyn GridStore, extent: GridExtent) -> Result<Self, StoreError> {
        let mut stored = store.load_all()?;
        if stored.is_empty() {
            let seeded = store.seed(extent.rows, extent.cols)?;
            log::info!("Grid storage was empty, seeded {seeded} default cells");
            stored = store.load_all()?;
        }

        let recorded = store.seeded_extent()?;
        if let Some(recorded) = recorded.filter(|r| *r != extent) {
            log::warn!(
                "Stored grid is {}x{} but {}x{} was requested, resizing",
                recorded.rows,
                recorded.cols,
                extent.rows,
                extent.cols
            );
        }

        let (grid, report) = Grid::from_cells(
            extent,
            stored.into_iter().map(|c| (c.cell(), c.value)),
        );

        if report.ignored > 0 {
            log::warn!(
                "Ignored {} stored cells outside the {}x{} grid",
                report.ignored,
                extent.rows,
                extent.cols
            );
        }
        if !report.missing.is_empty() {
            log::warn!(
                "Storage was missing {} cells, restoring defaults",
                report.missing.len()
            );
            for cell in &report.missing {
                store.write_cell(cell.row, cell.col, &cell.label())?;
            }
        }
        if recorded != Some(extent) {
            store.record_extent(extent)?;
        }

        log::info!("Grid state ready: {}x{}", extent.rows, extent.cols);
        Ok(Self {
            extent,
            inner: RwLock::new(Inner { grid, version: 0 }),
        })
    }

    pub fn extent(&self) -> GridExtent {
        self.extent
    }

    /// Point-in-time copy of the whole grid.
    pub async fn snapshot(&self) -> Grid {
        self.inner.read().await.grid.clone()
    }

    /// Replace one cell's value, returning what it held before.
    pub async fn apply_edit(&self, cell: CellRef, value: String) -> Result<AppliedEdit, GridError> {
        let mut inner = self.inner.write().await;
        let previous = inner.grid.replace(cell, value)?;
        inner.version += 1;
        Ok(AppliedEdit {
            cell,
            previous,
            version: inner.version,
        })
    }

    /// Apply several edits under one lock acquisition, in order.
    ///
    /// The batch occupies one contiguous span of the total order; an
    /// out-of-extent entry fails on its own without affecting the others.
    pub async fn apply_batch(
        &self,
        edits: Vec<(CellRef, String)>,
    ) -> Vec<Result<AppliedEdit, GridError>> {
        let mut inner = self.inner.write().await;
        edits
            .into_iter()
            .map(|(cell, value)| {
                let previous = inner.grid.replace(cell, value)?;
                inner.version += 1;
                Ok(AppliedEdit {
                    cell,
                    previous,
                    version: inner.version,
                })
            })
            .collect()
    }

    /// Current value of `cell` and the version it was read at.
    pub async fn read_cell(&self, cell: CellRef) -> Option<(String, u64)> {
        let inner = self.inner.read().await;
        inner
            .grid
            .get(cell)
            .map(|value| (value.to_string(), inner.version))
    }

    /// Number of edits applied so far.
    pub async fn version(&self) -> u64 {
        self.inner.read().await.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryGridStore, StoredCell};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_initialize_seeds_empty_store() {
        let store = MemoryGridStore::new();
        let state = GridState::initialize(&store, GridExtent::new(2, 2)).unwrap();

        let snapshot = state.snapshot().await;
        assert_eq!(snapshot.to_rows(), vec![vec!["A1", "B1"], vec!["A2", "B2"]]);
        assert_eq!(store.cell_count(), 4);
        assert_eq!(store.read_cell(1, 0).as_deref(), Some("A2"));
        assert_eq!(state.version().await, 0);
    }

    #[tokio::test]
    async fn test_initialize_loads_existing() {
        let store = MemoryGridStore::new();
        store.seed(2, 2).unwrap();
        store.write_cell(0, 1, "kept").unwrap();

        let state = GridState::initialize(&store, GridExtent::new(2, 2)).unwrap();
        assert_eq!(state.snapshot().await.get(CellRef::new(0, 1)), Some("kept"));
    }

    #[tokio::test]
    async fn test_initialize_repairs_missing_cells() {
        let store = MemoryGridStore::new();
        store.write_cell(0, 0, "only").unwrap();
        store.write_cell(9, 9, "stray").unwrap();

        let state = GridState::initialize(&store, GridExtent::new(2, 2)).unwrap();
        assert_eq!(
            state.snapshot().await.to_rows(),
            vec![vec!["only", "B1"], vec!["A2", "B2"]]
        );
        assert_eq!(store.read_cell(1, 1).as_deref(), Some("B2"));
        let loaded: Vec<StoredCell> = store.load_all().unwrap();
        assert_eq!(loaded.len(), 5);
    }

    #[tokio::test]
    async fn test_initialize_records_extent_of_unrecorded_store() {
        let store = MemoryGridStore::new();
        store.write_cell(0, 0, "legacy").unwrap();
        assert_eq!(store.seeded_extent().unwrap(), None);

        GridState::initialize(&store, GridExtent::new(2, 2)).unwrap();
        assert_eq!(store.seeded_extent().unwrap(), Some(GridExtent::new(2, 2)));
    }

    #[tokio::test]
    async fn test_initialize_with_changed_extent() {
        let store = MemoryGridStore::new();
        GridState::initialize(&store, GridExtent::new(2, 2)).unwrap();
        store.write_cell(1, 1, "edited").unwrap();

        // Grown: old cells kept, new ones defaulted, extent re-recorded.
        let grown = GridState::initialize(&store, GridExtent::new(3, 3)).unwrap();
        assert_eq!(
            grown.snapshot().await.to_rows(),
            vec![
                vec!["A1", "B1", "C1"],
                vec!["A2", "edited", "C2"],
                vec!["A3", "B3", "C3"],
            ]
        );
        assert_eq!(store.seeded_extent().unwrap(), Some(GridExtent::new(3, 3)));

        // Shrunk: cells outside the new extent stay in storage but not in memory.
        let shrunk = GridState::initialize(&store, GridExtent::new(1, 1)).unwrap();
        assert_eq!(shrunk.snapshot().await.to_rows(), vec![vec!["A1"]]);
        assert_eq!(store.seeded_extent().unwrap(), Some(GridExtent::new(1, 1)));
        assert_eq!(store.read_cell(1, 1).as_deref(), Some("edited"));
    }

    #[tokio::test]
    async fn test_initialize_fails_when_store_fails() {
        let store = MemoryGridStore::new();
        store.write_cell(0, 0, "partial").unwrap();
        store.fail_all_writes();
        assert!(GridState::initialize(&store, GridExtent::new(2, 2)).is_err());
    }

    #[tokio::test]
    async fn test_apply_edit_versions() {
        let store = MemoryGridStore::new();
        let state = GridState::initialize(&store, GridExtent::new(2, 2)).unwrap();

        let first = state.apply_edit(CellRef::new(1, 1), "x".into()).await.unwrap();
        assert_eq!(first.previous, "B2");
        assert_eq!(first.version, 1);

        let second = state.apply_edit(CellRef::new(1, 1), "y".into()).await.unwrap();
        assert_eq!(second.previous, "x");
        assert_eq!(second.version, 2);

        assert_eq!(
            state.read_cell(CellRef::new(1, 1)).await,
            Some(("y".to_string(), 2))
        );
        assert!(state.apply_edit(CellRef::new(5, 5), "z".into()).await.is_err());
        assert_eq!(state.version().await, 2);
    }

    #[tokio::test]
    async fn test_apply_batch_isolates_bad_cells() {
        let store = MemoryGridStore::new();
        let state = GridState::initialize(&store, GridExtent::new(2, 2)).unwrap();

        let results = state
            .apply_batch(vec![
                (CellRef::new(0, 0), "a".into()),
                (CellRef::new(3, 3), "bad".into()),
                (CellRef::new(1, 1), "d".into()),
            ])
            .await;

        assert!(results[0].is_ok());
        assert!(results[1].is_err());
        assert_eq!(results[2].as_ref().unwrap().version, 2);
        assert_eq!(
            state.snapshot().await.to_rows(),
            vec![vec!["a", "B1"], vec!["A2", "d"]]
        );
    }

    #[tokio::test]
    async fn test_concurrent_edits_total_order() {
        let store = MemoryGridStore::new();
        let state = Arc::new(GridState::initialize(&store, GridExtent::new(1, 1)).unwrap());

        let handles: Vec<_> = (0..50)
            .map(|i| {
                let state = state.clone();
                tokio::spawn(async move {
                    state.apply_edit(CellRef::new(0, 0), format!("v{i}")).await.unwrap()
                })
            })
            .collect();

        let mut applied = Vec::new();
        for h in handles {
            applied.push(h.await.unwrap());
        }
        applied.sort_by_key(|a| a.version);

        // Versions are a gapless sequence and the final value is the last one.
        let versions: Vec<u64> = applied.iter().map(|a| a.version).collect();
        assert_eq!(versions, (1..=50).collect::<Vec<_>>());
        let (value, version) = state.read_cell(CellRef::new(0, 0)).await.unwrap();
        assert_eq!(version, 50);
        // Each edit saw the previous edit's value.
        for pair in applied.windows(2) {
            assert_ne!(pair[0].previous, pair[1].previous);
        }
        assert!(value.starts_with('v'));
    }
}
