//! Binary protocol for tile-map replication.
//!
//! Wire format (bincode-encoded `Envelope`):
//! ```text
//! ┌───────────┬──────────┬───────────────────────────────┐
//! │ origin    │ seq      │ intent                        │
//! │ 16 bytes  │ varint   │ tag + fields (or full grid)   │
//! └───────────┴──────────┴───────────────────────────────┘
//! ```
//!
//! `origin` is the peer that issued the intent. Messages produced by the
//! server itself (snapshots) carry the nil id so no connection filters them.

use serde::{Deserialize, Serialize};
use tessera_core::Row;
use uuid::Uuid;

/// Everything that travels over a replication channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Intent {
    /// Full grid, sent on join and after a reseed
    Snapshot { grid: Vec<Row> },
    /// Place a tile (or repaint an existing one)
    AddTile { x: i32, y: i32, kind: u32, elevation: f32 },
    /// Remove a tile
    RemoveTile { x: i32, y: i32 },
    /// Overwrite kind and elevation of an existing tile
    UpdateTile { x: i32, y: i32, kind: u32, elevation: f32 },
    /// Heartbeat ping
    Ping,
    /// Heartbeat pong
    Pong,
}

impl Intent {
    /// Whether this intent edits the grid.
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Intent::AddTile { .. } | Intent::RemoveTile { .. } | Intent::UpdateTile { .. }
        )
    }

    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Intent::Snapshot { .. } => "snapshot",
            Intent::AddTile { .. } => "add_tile",
            Intent::RemoveTile { .. } => "remove_tile",
            Intent::UpdateTile { .. } => "update_tile",
            Intent::Ping => "ping",
            Intent::Pong => "pong",
        }
    }
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Issuing peer (nil for server-originated messages)
    pub origin: Uuid,
    /// Per-sender sequence number, informational only
    pub seq: u64,
    pub intent: Intent,
}

impl Envelope {
    pub fn new(origin: Uuid, seq: u64, intent: Intent) -> Self {
        Self { origin, seq, intent }
    }

    /// A server-originated snapshot of `grid`.
    pub fn snapshot(grid: Vec<Row>) -> Self {
        Self::new(Uuid::nil(), 0, Intent::Snapshot { grid })
    }

    pub fn ping(origin: Uuid) -> Self {
        Self::new(origin, 0, Intent::Ping)
    }

    pub fn pong(origin: Uuid) -> Self {
        Self::new(origin, 0, Intent::Pong)
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::TileGrid;

    #[test]
    fn test_add_tile_roundtrip() {
        let peer = Uuid::new_v4();
        let msg = Envelope::new(
            peer,
            7,
            Intent::AddTile { x: 3, y: 1, kind: 2, elevation: 0.75 },
        );
        let decoded = Envelope::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let mut grid = TileGrid::seeded();
        grid.add_tile(1, 0, 4, 1.5);
        grid.add_tile(0, 1, 2, 0.0);

        let msg = Envelope::snapshot(grid.clone().into_rows());
        assert!(msg.origin.is_nil());

        let decoded = Envelope::decode(&msg.encode().unwrap()).unwrap();
        match decoded.intent {
            Intent::Snapshot { grid: rows } => {
                assert_eq!(TileGrid::from_rows(rows).unwrap(), grid);
            }
            other => panic!("Expected snapshot, got {other:?}"),
        }
    }

    #[test]
    fn test_mutation_size_small() {
        let msg = Envelope::new(Uuid::new_v4(), 1, Intent::RemoveTile { x: 100, y: 200 });
        let encoded = msg.encode().unwrap();
        // 16-byte uuid + varints
        assert!(encoded.len() < 32, "Encoded size {} too large", encoded.len());
    }

    #[test]
    fn test_is_mutation() {
        assert!(Intent::RemoveTile { x: 0, y: 0 }.is_mutation());
        assert!(Intent::UpdateTile { x: 0, y: 0, kind: 1, elevation: 0.2 }.is_mutation());
        assert!(!Intent::Ping.is_mutation());
        assert!(!Intent::Snapshot { grid: Vec::new() }.is_mutation());
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(Envelope::decode(&garbage).is_err());
    }
}
