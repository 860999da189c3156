//! RocksDB-backed grid store.
//!
//! Column families:
//! - `cells` — one entry per cell; key is `row (u32 BE) ‖ col (u32 BE)`,
//!   value is the cell text as UTF-8. Big-endian keys make a full scan come
//!   back in row-major order.
//! - `meta`  — grid metadata (the extent the grid was seeded with).
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (LSM Trees, SSTables)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use std::path::{Path, PathBuf};

use super::{default_cells, GridStore, StoreError, StoredCell};
use grid_core::GridExtent;

const CF_CELLS: &str = "cells";
const CF_META: &str = "meta";

const COLUMN_FAMILIES: &[&str] = &[CF_CELLS, CF_META];

const META_EXTENT: &[u8] = b"extent";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 32MB)
    pub block_cache_size: usize,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("grid_data"),
            block_cache_size: 32 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 256,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small cache, given directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 64,
        }
    }
}

/// RocksDB grid store.
pub struct RocksGridStore {
    /// RocksDB instance (single-threaded CF mode — concurrency via callers)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksGridStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(&config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::debug!("Opened grid store at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts
    }

    /// Read a single cell, `None` if it was never written.
    pub fn read_cell(&self, row: u32, col: u32) -> Result<Option<String>, StoreError> {
        let cf = self.cf(CF_CELLS)?;
        match self.db.get_cf(cf, Self::cell_key(row, col))? {
            Some(bytes) => Ok(Some(Self::decode_value(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Number of persisted cells.
    pub fn cell_count(&self) -> Result<usize, StoreError> {
        let cf = self.cf(CF_CELLS)?;
        let mut count = 0;
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            item?;
            count += 1;
        }
        Ok(count)
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    fn write_options(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }

    /// Build a cell key: row (4 bytes BE) + col (4 bytes BE).
    fn cell_key(row: u32, col: u32) -> [u8; 8] {
        let mut key = [0u8; 8];
        key[..4].copy_from_slice(&row.to_be_bytes());
        key[4..].copy_from_slice(&col.to_be_bytes());
        key
    }

    fn decode_key(key: &[u8]) -> Result<(u32, u32), StoreError> {
        let key: [u8; 8] = key
            .try_into()
            .map_err(|_| StoreError::DecodeError(format!("Invalid cell key length {}", key.len())))?;
        let mut row = [0u8; 4];
        let mut col = [0u8; 4];
        row.copy_from_slice(&key[..4]);
        col.copy_from_slice(&key[4..]);
        Ok((u32::from_be_bytes(row), u32::from_be_bytes(col)))
    }

    fn decode_value(bytes: &[u8]) -> Result<String, StoreError> {
        String::from_utf8(bytes.to_vec()).map_err(|e| StoreError::DecodeError(e.to_string()))
    }
}

impl GridStore for RocksGridStore {
    fn load_all(&self) -> Result<Vec<StoredCell>, StoreError> {
        let cf = self.cf(CF_CELLS)?;
        let mut cells = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = item?;
            let (row, col) = Self::decode_key(&key)?;
            cells.push(StoredCell::new(row, col, Self::decode_value(&value)?));
        }
        Ok(cells)
    }

    fn seed(&self, rows: u32, cols: u32) -> Result<usize, StoreError> {
        let cf_cells = self.cf(CF_CELLS)?;
        let cf_meta = self.cf(CF_META)?;

        if let Some(item) = self.db.iterator_cf(cf_cells, IteratorMode::Start).next() {
            item?;
            log::debug!("Grid store already holds data, skipping seed");
            return Ok(0);
        }

        // One atomic batch: a crash mid-seed leaves the store empty, not partial.
        let mut batch = WriteBatch::default();
        let defaults = default_cells(rows, cols);
        for cell in &defaults {
            batch.put_cf(cf_cells, Self::cell_key(cell.row, cell.col), cell.value.as_bytes());
        }
        batch.put_cf(cf_meta, META_EXTENT, Self::cell_key(rows, cols));
        self.db.write_opt(batch, &self.write_options())?;

        log::info!("Seeded grid store with {rows}x{cols} default cells");
        Ok(defaults.len())
    }

    fn write_cell(&self, row: u32, col: u32, value: &str) -> Result<(), StoreError> {
        let cf = self.cf(CF_CELLS)?;
        self.db
            .put_cf_opt(cf, Self::cell_key(row, col), value.as_bytes(), &self.write_options())?;
        Ok(())
    }

    fn seeded_extent(&self) -> Result<Option<GridExtent>, StoreError> {
        let cf = self.cf(CF_META)?;
        match self.db.get_cf(cf, META_EXTENT)? {
            Some(bytes) if bytes.len() == 8 => {
                let (rows, cols) = Self::decode_key(&bytes)?;
                Ok(Some(GridExtent::new(rows, cols)))
            }
            Some(_) => Err(StoreError::DecodeError("Malformed extent record".into())),
            None => Ok(None),
        }
    }

    fn record_extent(&self, extent: GridExtent) -> Result<(), StoreError> {
        let cf = self.cf(CF_META)?;
        self.db.put_cf_opt(
            cf,
            META_EXTENT,
            Self::cell_key(extent.rows, extent.cols),
            &self.write_options(),
        )?;
        Ok(())
    }
}
