//! The single choke point for grid mutation.
//!
//! ```text
//! submit_edit
//!   RECEIVED ──► VALIDATED ──► APPLIED_IN_MEMORY ──► PERSISTED ──► BROADCAST ──► DONE
//!                   │               (grid lock)        (no lock)     (no lock)
//!                   └─► InvalidCoordinate (sender only)
//! ```
//!
//! Only the in-memory replacement happens under the grid lock; storage and
//! fan-out run after it is released, so a slow store delays the editor's
//! own round trip but never other sessions' edits. A failed write leaves
//! the in-memory value in place and marks the cell pending; `reconcile`
//! writes pending cells again later.
//!
//! Persistence is gated per cell on the edit's version: once version `v` of
//! a cell is stored, a late write carrying an older version is skipped.
//! Writes to one cell are serialized by that cell's slot; writes to
//! different cells run in parallel on the blocking pool. Storage therefore
//! converges on the in-memory order even when writes complete out of order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use uuid::Uuid;

use grid_core::{CellRef, Grid, GridExtent};

use crate::error::SyncError;
use crate::protocol::{CellUpdate, GridMessage};
use crate::registry::SessionRegistry;
use crate::state::{AppliedEdit, GridState};
use crate::storage::{GridStore, StoreError};

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Grid size, fixed at creation
    pub extent: GridExtent,
    /// Whether an editor receives the broadcast of its own edit
    pub echo_to_sender: bool,
    /// Frames a session may fall behind before dropping
    pub broadcast_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            extent: GridExtent::default(),
            echo_to_sender: true,
            broadcast_capacity: 256,
        }
    }
}

/// A single-cell edit, attributed to the identity that made it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditEvent {
    pub cell: CellRef,
    pub value: String,
    pub identity: String,
    /// Opaque client data echoed with the broadcast
    pub label: Option<String>,
}

impl EditEvent {
    pub fn new(cell: CellRef, value: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            cell,
            value: value.into(),
            identity: identity.into(),
            label: None,
        }
    }
}

/// What happened to an accepted edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditOutcome {
    pub cell: CellRef,
    pub previous: String,
    pub version: u64,
    /// `false` if the store rejected the write (the cell is now pending)
    pub persisted: bool,
    /// Sessions the broadcast was addressed to
    pub delivered: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub attempted: usize,
    pub persisted: usize,
    pub still_pending: usize,
}

#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    pub edits_applied: u64,
    pub edits_rejected: u64,
    pub persist_failures: u64,
    pub broadcasts: u64,
    pub reconciled: u64,
    pub bulk_imports: u64,
}

#[derive(Default)]
pub(crate) struct AtomicEngineStats {
    pub(crate) edits_applied: AtomicU64,
    pub(crate) edits_rejected: AtomicU64,
    pub(crate) persist_failures: AtomicU64,
    pub(crate) broadcasts: AtomicU64,
    pub(crate) reconciled: AtomicU64,
    pub(crate) bulk_imports: AtomicU64,
}

/// Per-cell persistence bookkeeping.
///
/// Each slot holds the highest version written successfully for its cell
/// (0 = none) and is locked across that cell's store write. The map locks
/// themselves are only held for lookups.
#[derive(Default)]
struct PersistLedger {
    slots: Mutex<HashMap<CellRef, Arc<Mutex<u64>>>>,
    /// Cells whose latest write failed, with the failed version
    pending: Mutex<HashMap<CellRef, u64>>,
}

impl PersistLedger {
    async fn slot(&self, cell: CellRef) -> Arc<Mutex<u64>> {
        self.slots.lock().await.entry(cell).or_default().clone()
    }
}

pub struct SyncEngine {
    config: EngineConfig,
    store: Arc<dyn GridStore>,
    state: OnceCell<GridState>,
    registry: Arc<SessionRegistry>,
    ledger: PersistLedger,
    pub(crate) stats: AtomicEngineStats,
}

impl SyncEngine {
    pub fn new(config: EngineConfig, store: Arc<dyn GridStore>) -> Self {
        let registry = Arc::new(SessionRegistry::new(
            config.broadcast_capacity,
            config.echo_to_sender,
        ));
        Self {
            config,
            store,
            state: OnceCell::new(),
            registry,
            ledger: PersistLedger::default(),
            stats: AtomicEngineStats::default(),
        }
    }

    /// Build the grid state if that has not happened yet.
    ///
    /// Concurrent callers share one load; the others wait for it. A failed
    /// load leaves the engine uninitialized so the next call retries.
    pub async fn initialize(&self) -> Result<&GridState, SyncError> {
        self.state
            .get_or_try_init(|| async {
                GridState::initialize(self.store.as_ref(), self.config.extent)
                    .map_err(SyncError::from)
            })
            .await
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn extent(&self) -> GridExtent {
        self.config.extent
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Consistent copy of the grid.
    pub async fn snapshot(&self) -> Result<Grid, SyncError> {
        Ok(self.initialize().await?.snapshot().await)
    }

    /// Run one edit through validate → apply → persist → broadcast.
    ///
    /// `origin` is the submitting connection; it is used only to decide
    /// broadcast recipients. Identity comes from the event itself.
    pub async fn submit_edit(&self, origin: Uuid, event: EditEvent) -> Result<EditOutcome, SyncError> {
        let state = self.initialize().await?;

        if let Err(e) = self.config.extent.check(event.cell) {
            self.stats.edits_rejected.fetch_add(1, Ordering::Relaxed);
            log::debug!("Rejected edit from {} at {:?}: {e}", event.identity, event.cell);
            return Err(e.into());
        }

        let applied = state.apply_edit(event.cell, event.value.clone()).await?;
        self.stats.edits_applied.fetch_add(1, Ordering::Relaxed);
        log::trace!(
            "{} set {} = {:?} (v{})",
            event.identity,
            event.cell,
            event.value,
            applied.version
        );

        let persisted = self.persist_logged(&applied, &event.value).await;

        let update = CellUpdate {
            cell_id: event.cell.label(),
            text: event.value,
            label: event.label,
            user: Some(event.identity),
        };
        let delivered = self
            .registry
            .broadcast(origin, &GridMessage::cell_updated(origin, &update))
            .await?;
        self.stats.broadcasts.fetch_add(1, Ordering::Relaxed);

        Ok(EditOutcome {
            cell: applied.cell,
            previous: applied.previous,
            version: applied.version,
            persisted,
            delivered,
        })
    }

    /// Write pending cells again, using their current in-memory values.
    pub async fn reconcile(&self) -> Result<ReconcileReport, SyncError> {
        let state = self.initialize().await?;
        let pending: Vec<CellRef> = self.ledger.pending.lock().await.keys().copied().collect();

        let mut report = ReconcileReport {
            attempted: pending.len(),
            ..ReconcileReport::default()
        };
        for cell in pending {
            let Some((value, version)) = state.read_cell(cell).await else {
                continue;
            };
            match self.persist(cell, version, &value).await {
                Ok(_) => report.persisted += 1,
                Err(e) => log::warn!("Reconcile of {cell} failed again: {e}"),
            }
        }
        report.still_pending = self.pending_count().await;

        if report.attempted > 0 {
            self.stats
                .reconciled
                .fetch_add(report.persisted as u64, Ordering::Relaxed);
            log::info!(
                "Reconciled {}/{} pending cells ({} still pending)",
                report.persisted,
                report.attempted,
                report.still_pending
            );
        }
        Ok(report)
    }

    /// Cells whose in-memory value is not known to be in storage.
    pub async fn pending_cells(&self) -> Vec<CellRef> {
        let mut cells: Vec<CellRef> = self.ledger.pending.lock().await.keys().copied().collect();
        cells.sort();
        cells
    }

    pub async fn pending_count(&self) -> usize {
        self.ledger.pending.lock().await.len()
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            edits_applied: self.stats.edits_applied.load(Ordering::Relaxed),
            edits_rejected: self.stats.edits_rejected.load(Ordering::Relaxed),
            persist_failures: self.stats.persist_failures.load(Ordering::Relaxed),
            broadcasts: self.stats.broadcasts.load(Ordering::Relaxed),
            reconciled: self.stats.reconciled.load(Ordering::Relaxed),
            bulk_imports: self.stats.bulk_imports.load(Ordering::Relaxed),
        }
    }

    /// Persist an applied edit, logging instead of failing.
    pub(crate) async fn persist_logged(&self, applied: &AppliedEdit, value: &str) -> bool {
        match self.persist(applied.cell, applied.version, value).await {
            Ok(_) => true,
            Err(e) => {
                log::error!(
                    "Failed to persist {} (v{}), keeping in-memory value: {e}",
                    applied.cell,
                    applied.version
                );
                false
            }
        }
    }

    /// Version-gated write. `Ok(false)` means a newer version was already
    /// stored and this write was skipped.
    pub(crate) async fn persist(&self, cell: CellRef, version: u64, value: &str) -> Result<bool, StoreError> {
        let slot = self.ledger.slot(cell).await;
        let mut stored = slot.lock().await;
        if *stored >= version {
            log::trace!("Skipping stale write of {cell} (v{version})");
            return Ok(false);
        }

        let store = self.store.clone();
        let owned = value.to_owned();
        let result = tokio::task::spawn_blocking(move || store.write_cell(cell.row, cell.col, &owned))
            .await
            .unwrap_or_else(|e| Err(StoreError::IoError(format!("Write task for {cell} failed: {e}"))));

        let mut pending = self.ledger.pending.lock().await;
        match result {
            Ok(()) => {
                *stored = version;
                if pending.get(&cell).is_some_and(|failed| *failed <= version) {
                    pending.remove(&cell);
                }
                Ok(true)
            }
            Err(e) => {
                let failed = pending.entry(cell).or_insert(version);
                *failed = (*failed).max(version);
                self.stats.persist_failures.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }
}
