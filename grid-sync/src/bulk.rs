//! Whole-grid transfer outside the live edit channel.
//!
//! `export_snapshot` serves fresh clients; `import_bulk` handles explicit
//! full-grid saves. An import is one batch in memory (one grid-lock
//! acquisition) but each cell is persisted on its own, so a storage fault
//! on one cell is reported without holding back the rest.

use futures_util::future::join_all;
use std::sync::atomic::Ordering;
use uuid::Uuid;

use grid_core::CellRef;

use crate::engine::SyncEngine;
use crate::error::SyncError;
use crate::protocol::{BulkSaveResponse, CellUpdate, FailedCell, GridMessage};

/// One cell of a bulk import that did not make it to storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellFailure {
    pub cell: CellRef,
    pub reason: String,
}

/// Aggregate outcome of a bulk import.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkReport {
    /// Cells applied in memory and persisted
    pub applied_count: usize,
    pub failed_cells: Vec<CellFailure>,
}

impl BulkReport {
    pub fn attempted(&self) -> usize {
        self.applied_count + self.failed_cells.len()
    }

    pub fn is_complete(&self) -> bool {
        self.failed_cells.is_empty()
    }

    /// `BulkImportPartialFailure` when any cell failed.
    pub fn into_result(self) -> Result<BulkReport, SyncError> {
        if self.is_complete() {
            Ok(self)
        } else {
            Err(SyncError::BulkImportPartialFailure(self))
        }
    }
}

impl From<&BulkReport> for BulkSaveResponse {
    fn from(report: &BulkReport) -> Self {
        let failed_cells: Vec<FailedCell> = report
            .failed_cells
            .iter()
            .map(|f| FailedCell {
                row: f.cell.row,
                col: f.cell.col,
                reason: f.reason.clone(),
            })
            .collect();

        if report.is_complete() {
            BulkSaveResponse {
                message: Some(format!("Saved {} cells", report.applied_count)),
                applied_count: report.applied_count as u64,
                ..BulkSaveResponse::default()
            }
        } else {
            let details = report
                .failed_cells
                .iter()
                .map(|f| format!("{}: {}", f.cell, f.reason))
                .collect::<Vec<_>>()
                .join("; ");
            BulkSaveResponse {
                message: None,
                error: Some(format!(
                    "{} of {} cells could not be saved",
                    report.failed_cells.len(),
                    report.attempted()
                )),
                details: Some(details),
                applied_count: report.applied_count as u64,
                failed_cells,
            }
        }
    }
}

impl SyncEngine {
    /// Full grid as rows of values, ordered by row then column.
    pub async fn export_snapshot(&self) -> Result<Vec<Vec<String>>, SyncError> {
        Ok(self.snapshot().await?.to_rows())
    }

    /// Apply every `(row, col)` present in `rows`.
    ///
    /// Rows may be ragged. Out-of-extent cells and cells the store rejects
    /// are listed in the report; everything else is applied and persisted.
    /// A storage failure still leaves the new value in memory (and pending
    /// reconciliation), exactly as for a single edit. Cells whose value
    /// changed are broadcast to live sessions, attributed to `identity`.
    pub async fn import_bulk(
        &self,
        origin: Uuid,
        identity: &str,
        rows: Vec<Vec<String>>,
    ) -> Result<BulkReport, SyncError> {
        let state = self.initialize().await?;
        let extent = state.extent();
        let mut report = BulkReport::default();

        // A frame cannot carry u32::MAX rows or columns, so the zips never truncate.
        let mut edits = Vec::new();
        for (r, row) in (0u32..).zip(rows) {
            for (c, value) in (0u32..).zip(row) {
                let cell = CellRef::new(r, c);
                match extent.check(cell) {
                    Ok(()) => edits.push((cell, value)),
                    Err(e) => report.failed_cells.push(CellFailure {
                        cell,
                        reason: e.to_string(),
                    }),
                }
            }
        }

        let values: Vec<String> = edits.iter().map(|(_, v)| v.clone()).collect();
        let mut applied = Vec::with_capacity(values.len());
        for (result, value) in state.apply_batch(edits).await.into_iter().zip(values) {
            match result {
                Ok(edit) => applied.push((edit, value)),
                Err(e) => log::warn!("Bulk import cell rejected after validation: {e}"),
            }
        }
        self.stats
            .edits_applied
            .fetch_add(applied.len() as u64, Ordering::Relaxed);

        // Every applied cell is persisted (or marked pending) before any
        // broadcast goes out. Different cells write in parallel.
        let persisted = join_all(
            applied
                .iter()
                .map(|(edit, value)| self.persist(edit.cell, edit.version, value)),
        )
        .await;
        for ((edit, _), result) in applied.iter().zip(persisted) {
            match result {
                Ok(_) => report.applied_count += 1,
                Err(e) => {
                    log::error!("Bulk import failed to persist {}: {e}", edit.cell);
                    report.failed_cells.push(CellFailure {
                        cell: edit.cell,
                        reason: e.to_string(),
                    });
                }
            }
        }

        for (edit, value) in applied {
            if edit.previous == value {
                continue;
            }
            let update = CellUpdate {
                cell_id: edit.cell.label(),
                text: value,
                label: None,
                user: Some(identity.to_string()),
            };
            match self
                .registry()
                .broadcast(origin, &GridMessage::cell_updated(origin, &update))
                .await
            {
                Ok(_) => {
                    self.stats.broadcasts.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => log::warn!("Bulk import could not broadcast {}: {e}", edit.cell),
            }
        }

        self.stats.bulk_imports.fetch_add(1, Ordering::Relaxed);
        log::info!(
            "Bulk import by {identity}: {} applied, {} failed",
            report.applied_count,
            report.failed_cells.len()
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;
    use crate::protocol::MessageType;
    use crate::storage::MemoryGridStore;
    use grid_core::GridExtent;
    use std::sync::Arc;

    fn engine(rows: u32, cols: u32) -> (Arc<MemoryGridStore>, SyncEngine) {
        let store = Arc::new(MemoryGridStore::new());
        let config = EngineConfig {
            extent: GridExtent::new(rows, cols),
            ..EngineConfig::default()
        };
        (store.clone(), SyncEngine::new(config, store))
    }

    fn rows(data: &[&[&str]]) -> Vec<Vec<String>> {
        data.iter()
            .map(|row| row.iter().map(|v| v.to_string()).collect())
            .collect()
    }

    #[tokio::test]
    async fn test_export_default_snapshot() {
        let (_store, engine) = engine(3, 2);
        assert_eq!(
            engine.export_snapshot().await.unwrap(),
            rows(&[&["A1", "B1"], &["A2", "B2"], &["A3", "B3"]])
        );
    }

    #[tokio::test]
    async fn test_import_full_grid() {
        let (store, engine) = engine(2, 2);
        let report = engine
            .import_bulk(Uuid::new_v4(), "alice", rows(&[&["a", "b"], &["c", "d"]]))
            .await
            .unwrap();

        assert_eq!(report.applied_count, 4);
        assert!(report.is_complete());
        assert_eq!(store.write_count(), 4);
        assert_eq!(
            engine.export_snapshot().await.unwrap(),
            rows(&[&["a", "b"], &["c", "d"]])
        );
        assert_eq!(engine.stats().bulk_imports, 1);
    }

    #[tokio::test]
    async fn test_import_with_storage_faults() {
        let (store, engine) = engine(3, 3);
        engine.initialize().await.unwrap();
        let bad = [CellRef::new(0, 2), CellRef::new(2, 1)];
        for cell in bad {
            store.fail_cell(cell);
        }

        let input = rows(&[&["1", "2", "3"], &["4", "5", "6"], &["7", "8", "9"]]);
        let report = engine.import_bulk(Uuid::new_v4(), "bob", input).await.unwrap();

        // N = 9, K = 2
        assert_eq!(report.applied_count, 7);
        assert_eq!(store.write_count(), 7);
        let failed: Vec<CellRef> = report.failed_cells.iter().map(|f| f.cell).collect();
        assert_eq!(failed, bad.to_vec());

        // Failed cells keep their new value in memory and wait for reconcile.
        let snapshot = engine.export_snapshot().await.unwrap();
        assert_eq!(snapshot, rows(&[&["1", "2", "3"], &["4", "5", "6"], &["7", "8", "9"]]));
        assert_eq!(store.read_cell(0, 2).as_deref(), Some("C1"));
        assert_eq!(engine.pending_cells().await, bad.to_vec());

        let err = report.into_result().unwrap_err();
        assert!(matches!(err, SyncError::BulkImportPartialFailure(ref r) if r.failed_cells.len() == 2));
        assert_eq!(err.to_string(), "bulk import failed for 2 of 9 cells");
    }

    #[tokio::test]
    async fn test_import_ragged_and_oversized() {
        let (store, engine) = engine(2, 2);
        let input = rows(&[&["x"], &["y", "z", "overflow"], &["beyond"]]);
        let report = engine.import_bulk(Uuid::new_v4(), "carol", input).await.unwrap();

        assert_eq!(report.applied_count, 3);
        let failed: Vec<CellRef> = report.failed_cells.iter().map(|f| f.cell).collect();
        assert_eq!(failed, vec![CellRef::new(1, 2), CellRef::new(2, 0)]);
        assert_eq!(store.read_cell(1, 2), None);
        assert_eq!(
            engine.export_snapshot().await.unwrap(),
            rows(&[&["x", "B1"], &["y", "z"]])
        );
    }

    #[tokio::test]
    async fn test_import_broadcasts_changed_cells_only() {
        let (_store, engine) = engine(1, 2);
        let viewer = Uuid::new_v4();
        let mut rx = engine.registry().register(viewer, "viewer").await.unwrap();

        engine
            .import_bulk(Uuid::new_v4(), "dave", rows(&[&["A1", "changed"]]))
            .await
            .unwrap();

        let msg = GridMessage::decode(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(msg.msg_type, MessageType::CellUpdated);
        let update = msg.update().unwrap();
        assert_eq!(update.cell_id, "B1");
        assert_eq!(update.text, "changed");
        assert_eq!(update.user.as_deref(), Some("dave"));
        assert_eq!(engine.registry().stats().await.messages_sent, 1);
    }

    #[tokio::test]
    async fn test_storage_fault_does_not_stop_later_cells() {
        let (store, engine) = engine(1, 4);
        engine.initialize().await.unwrap();
        store.fail_cell(CellRef::new(0, 1));
        let viewer = Uuid::new_v4();
        let mut rx = engine.registry().register(viewer, "viewer").await.unwrap();

        let report = engine
            .import_bulk(Uuid::new_v4(), "erin", rows(&[&["w", "x", "y", "z"]]))
            .await
            .unwrap();

        assert_eq!(report.applied_count, 3);
        assert_eq!(store.read_cell(0, 2).as_deref(), Some("y"));
        assert_eq!(store.read_cell(0, 3).as_deref(), Some("z"));
        assert_eq!(engine.pending_cells().await, vec![CellRef::new(0, 1)]);

        // All four changed cells are broadcast, including the unpersisted one.
        let mut labels = Vec::new();
        for _ in 0..4 {
            let msg = GridMessage::decode(&rx.recv().await.unwrap()).unwrap();
            labels.push(msg.update().unwrap().cell_id);
        }
        assert_eq!(labels, vec!["A1", "B1", "C1", "D1"]);
        assert_eq!(engine.stats().broadcasts, 4);
        assert_eq!(engine.stats().edits_applied, 4);
    }

    #[test]
    fn test_response_success_shape() {
        let report = BulkReport {
            applied_count: 4,
            failed_cells: Vec::new(),
        };
        let response = BulkSaveResponse::from(&report);
        assert_eq!(response.message.as_deref(), Some("Saved 4 cells"));
        assert!(response.error.is_none());
        assert!(response.details.is_none());
        assert_eq!(response.applied_count, 4);
    }

    #[test]
    fn test_response_failure_shape() {
        let report = BulkReport {
            applied_count: 1,
            failed_cells: vec![CellFailure {
                cell: CellRef::new(0, 1),
                reason: "disk full".into(),
            }],
        };
        let response = BulkSaveResponse::from(&report);
        assert!(response.message.is_none());
        assert_eq!(response.error.as_deref(), Some("1 of 2 cells could not be saved"));
        assert_eq!(response.details.as_deref(), Some("B1: disk full"));
        assert_eq!(
            response.failed_cells,
            vec![FailedCell { row: 0, col: 1, reason: "disk full".into() }]
        );
    }
}
