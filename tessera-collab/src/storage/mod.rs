//! Persistence gateway for the authoritative grid.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐  take_dirty()  ┌─────────────┐   save(key, rows)   ┌──────────────┐
//! │ Coordinator │ ─────────────► │  Persister  │ ──────────────────► │   Gateway    │
//! │ (in-memory) │                │ (worker +   │                     │ GridStore /  │
//! └──────▲──────┘                │  retries)   │                     │ MemoryStore  │
//!        │ load(key) on startup  └─────────────┘                     └──────┬───────┘
//!        └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The whole grid is one blob under a fixed key. It is read once at
//! startup and written when a participant disconnects with unsaved edits,
//! and once more on shutdown.

pub mod memory;
pub mod persister;
pub mod rocks;

pub use memory::MemoryStore;
pub use persister::{PersistConfig, PersistReport, Persister};
pub use rocks::{GridMetadata, GridStore, StoreConfig};

use tessera_core::Row;

/// Key under which the shared grid is stored.
pub const GRID_KEY: &str = "grid";

/// Durable get/set-by-key blob store for whole grids.
pub trait PersistenceGateway: Send + Sync {
    /// Load the rows stored under `key`, `None` if absent.
    fn load(&self, key: &str) -> Result<Option<Vec<Row>>, StoreError>;

    /// Replace the rows stored under `key`.
    fn save(&self, key: &str, rows: &[Row]) -> Result<(), StoreError>;
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed
    DeserializationError(String),
    /// Compression error
    CompressionError(String),
    /// Backend refused or could not be reached
    Unavailable(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
            StoreError::Unavailable(e) => write!(f, "Store unavailable: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}
