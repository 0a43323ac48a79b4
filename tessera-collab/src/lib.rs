//! # tessera-collab: Shared-map replication for Tessera
//!
//! One server owns the authoritative tile grid; every participant keeps a
//! replica and exchanges intents over WebSocket.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ TileClient  │ ◄─────────────────► │ TileServer  │
//! │ (per user)  │     Binary Proto    │ (central)   │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌─────────────┐
//! │ TileGrid    │                     │ Coordinator │──► Persister ──► GridStore
//! │ (replica)   │                     │ (authority) │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                                    ┌───────┴───────┐
//!                                    │ BroadcastGroup│
//!                                    │ (fan-out)     │
//!                                    └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Binary wire protocol (bincode-encoded `Envelope`)
//! - [`coordinator`]: Relay-then-apply handling and reseeding
//! - [`broadcast`]: Fan-out with origin filtering
//! - [`server`]: WebSocket server
//! - [`client`]: WebSocket client with local replica and offline queue
//! - [`storage`]: Persistence gateway, RocksDB store, background saver

pub mod broadcast;
pub mod client;
pub mod coordinator;
pub mod protocol;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, Frame};
pub use client::{ClientEvent, ConnectionState, IntentQueue, TileClient};
pub use coordinator::{Coordinator, Dispatch, Outbox};
pub use protocol::{Envelope, Intent, ProtocolError};
pub use server::{ServerConfig, ServerStats, TileServer};
pub use storage::{
    GridMetadata, GridStore, MemoryStore, PersistConfig, PersistReport, PersistenceGateway,
    Persister, StoreConfig, StoreError, GRID_KEY,
};
