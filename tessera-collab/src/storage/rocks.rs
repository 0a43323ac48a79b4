//! RocksDB-backed grid store.
//!
//! Column families:
//! - `grids`   : bincode-encoded rows, LZ4 compressed, keyed by grid key
//! - `metadata`: bincode `GridMetadata` (revision, sizes, timestamps)
//!
//! Both are written in one `WriteBatch`, so a grid and its metadata never
//! disagree after a crash.
//!
//! Reference: Kleppmann, DDIA, Chapter 3 (LSM Trees, SSTables)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tessera_core::Row;

use super::{PersistenceGateway, StoreError};

const CF_GRIDS: &str = "grids";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_GRIDS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 32MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: true, saves are rare)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 128)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 8MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tessera_data"),
            block_cache_size: 32 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 128,
            write_buffer_size: 8 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Config with the given path and default tuning.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Create config for testing (small caches, no fsync).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 1024 * 1024,
        }
    }
}

/// Metadata stored alongside each grid blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridMetadata {
    pub key: String,
    /// Incremented on every save
    pub revision: u64,
    pub row_count: u64,
    pub filled_count: u64,
    /// Uncompressed blob size in bytes
    pub raw_size: u64,
    /// Compressed blob size in bytes
    pub compressed_size: u64,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last save timestamp (seconds since epoch)
    pub updated_at: u64,
}

impl GridMetadata {
    fn new(key: &str) -> Self {
        let now = now_secs();
        Self {
            key: key.to_string(),
            revision: 0,
            row_count: 0,
            filled_count: 0,
            raw_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

/// RocksDB-backed grid store.
pub struct GridStore {
    /// Single-threaded mode; concurrent access is serialized by the persister
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl GridStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened grid store at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            // Values are LZ4 compressed before they reach RocksDB
            CF_GRIDS => opts.set_compression_type(DBCompressionType::None),
            CF_METADATA => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    /// Save `rows` under `key` (LZ4 compressed) and bump its metadata.
    pub fn save_grid(&self, key: &str, rows: &[Row]) -> Result<GridMetadata, StoreError> {
        let cf_grids = self.cf(CF_GRIDS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let raw = bincode::serde::encode_to_vec(rows, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&raw);

        let mut meta = match self.load_metadata(key)? {
            Some(meta) => meta,
            None => GridMetadata::new(key),
        };
        meta.revision += 1;
        meta.row_count = rows.len() as u64;
        meta.filled_count = rows.iter().flatten().filter(|c| c.is_filled()).count() as u64;
        meta.raw_size = raw.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = now_secs();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_grids, key.as_bytes(), &compressed);
        batch.put_cf(&cf_meta, key.as_bytes(), meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        Ok(meta)
    }

    /// Load the rows stored under `key`.
    pub fn load_grid(&self, key: &str) -> Result<Option<Vec<Row>>, StoreError> {
        let cf = self.cf(CF_GRIDS)?;
        let Some(compressed) = self.db.get_cf(&cf, key.as_bytes())? else {
            return Ok(None);
        };

        let raw = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::CompressionError(e.to_string()))?;
        let (rows, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(Some(rows))
    }

    pub fn load_metadata(&self, key: &str) -> Result<Option<GridMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, key.as_bytes())? {
            Some(bytes) => GridMetadata::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }
}

impl PersistenceGateway for GridStore {
    fn load(&self, key: &str) -> Result<Option<Vec<Row>>, StoreError> {
        self.load_grid(key)
    }

    fn save(&self, key: &str, rows: &[Row]) -> Result<(), StoreError> {
        let meta = self.save_grid(key, rows)?;
        log::debug!(
            "Saved grid '{key}' rev {} ({} rows, {} → {} bytes)",
            meta.revision,
            meta.row_count,
            meta.raw_size,
            meta.compressed_size
        );
        Ok(())
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::TileGrid;

    fn open_temp() -> (tempfile::TempDir, GridStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = GridStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        (dir, store)
    }

    fn sample_grid() -> TileGrid {
        let mut grid = TileGrid::seeded();
        for x in 1..6 {
            grid.add_tile(x, 0, 2, 0.25 * x as f32);
        }
        grid.add_tile(2, 1, 3, 1.0);
        grid
    }

    #[test]
    fn test_store_open() {
        let (_dir, store) = open_temp();
        assert!(store.path().exists());
    }

    #[test]
    fn test_load_absent() {
        let (_dir, store) = open_temp();
        assert!(store.load_grid("grid").unwrap().is_none());
        assert!(store.load_metadata("grid").unwrap().is_none());
    }

    #[test]
    fn test_save_load() {
        let (_dir, store) = open_temp();
        let grid = sample_grid();

        let meta = store.save_grid("grid", grid.rows()).unwrap();
        assert_eq!(meta.revision, 1);
        assert_eq!(meta.row_count, grid.row_count() as u64);
        assert_eq!(meta.filled_count, 7);

        let loaded = store.load_grid("grid").unwrap().unwrap();
        assert_eq!(TileGrid::from_rows(loaded).unwrap(), grid);
    }

    #[test]
    fn test_revision_increments() {
        let (_dir, store) = open_temp();
        let rows = TileGrid::seeded().into_rows();
        store.save_grid("grid", &rows).unwrap();
        store.save_grid("grid", &rows).unwrap();
        let meta = store.save_grid("grid", &rows).unwrap();
        assert_eq!(meta.revision, 3);
        assert!(meta.updated_at >= meta.created_at);
    }

    #[test]
    fn test_reopen_keeps_grid() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::for_testing(dir.path().join("db"));
        let grid = sample_grid();

        {
            let store = GridStore::open(config.clone()).unwrap();
            store.save_grid("grid", grid.rows()).unwrap();
        }

        let store = GridStore::open(config).unwrap();
        let loaded = store.load("grid").unwrap().unwrap();
        assert_eq!(TileGrid::from_rows(loaded).unwrap(), grid);
    }

    #[test]
    fn test_corrupt_blob_is_error() {
        let (_dir, store) = open_temp();
        let cf = store.cf(CF_GRIDS).unwrap();
        store.db.put_cf(&cf, b"grid", b"not lz4").unwrap();
        assert!(store.load_grid("grid").is_err());
    }

    #[test]
    fn test_large_grid_compresses() {
        let (_dir, store) = open_temp();
        let mut grid = TileGrid::seeded();
        for y in 0..64 {
            for x in 0..64 {
                grid.add_tile(x, y, 1, 0.5);
            }
        }
        let meta = store.save_grid("grid", grid.rows()).unwrap();
        assert!(meta.compressed_size < meta.raw_size);
    }

    #[test]
    fn test_store_error_display() {
        let err = StoreError::DatabaseError("test".into());
        assert!(err.to_string().contains("Database error"));
        let err = StoreError::Unavailable("down".into());
        assert!(err.to_string().contains("unavailable"));
    }
}
