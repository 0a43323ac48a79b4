//! Authoritative owner of the shared grid.
//!
//! ```text
//!  participant P ── Envelope ──► handle() ──┬── relay (everyone but P)
//!                                           ├── apply to TileGrid
//!                                           └── reseed? ── Snapshot (everyone)
//! ```
//!
//! The coordinator itself is synchronous. The server serializes access to
//! it behind a single lock and hands it an [`Outbox`] for the fan-out, so
//! relays leave in exactly the order intents are applied.

use tessera_core::{Outcome, Row, TileGrid};
use uuid::Uuid;

use crate::protocol::{Envelope, Intent};
use crate::storage::{PersistenceGateway, GRID_KEY};

/// Where the coordinator sends what it produces.
pub trait Outbox {
    /// Deliver to every participant except `envelope.origin`.
    fn relay(&self, envelope: &Envelope);

    /// Deliver to every participant.
    fn broadcast_all(&self, envelope: &Envelope);
}

/// What handling one inbound envelope did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Dispatch {
    /// Result of applying the intent, `None` for non-mutations
    pub outcome: Option<Outcome>,
    pub relayed: bool,
    /// The grid ran out of filled cells and was replaced by a fresh seed
    pub reseeded: bool,
}

pub struct Coordinator {
    grid: TileGrid,
    /// Edits since the last handoff to the persister
    changed: bool,
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::restore(None)
    }
}

impl Coordinator {
    /// Enter the ready state from whatever the store returned.
    ///
    /// Absent, malformed or filled-less grids are replaced by a fresh seed.
    pub fn restore(stored: Option<Vec<Row>>) -> Self {
        let grid = match stored {
            Some(rows) => match TileGrid::from_rows(rows) {
                Ok(grid) => {
                    log::info!(
                        "Restored grid: {} rows, {} filled tiles",
                        grid.row_count(),
                        grid.filled_count()
                    );
                    grid
                }
                Err(e) => {
                    log::warn!("Stored grid unusable ({e}), seeding a new one");
                    TileGrid::seeded()
                }
            },
            None => {
                log::info!("No stored grid, seeding a new one");
                TileGrid::seeded()
            }
        };

        Self {
            grid,
            changed: false,
        }
    }

    /// Load from `gateway`, falling back to a seed when the read fails.
    pub fn load(gateway: &dyn PersistenceGateway) -> Self {
        match gateway.load(GRID_KEY) {
            Ok(stored) => Self::restore(stored),
            Err(e) => {
                log::warn!("Failed to load grid: {e}");
                Self::restore(None)
            }
        }
    }

    pub fn grid(&self) -> &TileGrid {
        &self.grid
    }

    /// A snapshot for a joining participant.
    pub fn snapshot(&self) -> Envelope {
        Envelope::snapshot(self.grid.rows().to_vec())
    }

    /// Handle one envelope from participant `origin`.
    ///
    /// Mutations are relayed verbatim before they are applied. The
    /// envelope's origin is overwritten with `origin` so a client cannot
    /// impersonate another peer.
    pub fn handle(&mut self, origin: Uuid, mut envelope: Envelope, outbox: &dyn Outbox) -> Dispatch {
        if !envelope.intent.is_mutation() {
            if let Intent::Snapshot { .. } = envelope.intent {
                log::warn!("Ignoring snapshot sent by participant {origin}");
            }
            return Dispatch::default();
        }

        envelope.origin = origin;
        outbox.relay(&envelope);

        let outcome = match envelope.intent {
            Intent::AddTile { x, y, kind, elevation } => self.grid.add_tile(x, y, kind, elevation),
            Intent::RemoveTile { x, y } => self.grid.remove_tile(x, y),
            Intent::UpdateTile { x, y, kind, elevation } => {
                self.grid.update_tile(x, y, kind, elevation)
            }
            Intent::Snapshot { .. } | Intent::Ping | Intent::Pong => return Dispatch::default(),
        };
        self.changed = true;

        log::debug!("{} from {origin}: {outcome:?}", describe(&envelope.intent));

        let mut reseeded = false;
        if !self.grid.has_filled() {
            log::info!("Last tile removed, reseeding grid");
            self.grid = TileGrid::seeded();
            outbox.broadcast_all(&self.snapshot());
            reseeded = true;
        }

        Dispatch {
            outcome: Some(outcome),
            relayed: true,
            reseeded,
        }
    }

    /// Hand the grid to persistence if it changed, clearing the flag.
    pub fn take_dirty(&mut self) -> Option<Vec<Row>> {
        if !self.changed {
            return None;
        }
        self.changed = false;
        Some(self.grid.rows().to_vec())
    }

    /// Flag the grid as unsaved again, after a failed save.
    pub fn mark_dirty(&mut self) {
        self.changed = true;
    }

    pub fn is_changed(&self) -> bool {
        self.changed
    }
}

fn describe(intent: &Intent) -> String {
    match intent {
        Intent::AddTile { x, y, kind, .. } => format!("add_tile({x},{y}) kind {kind}"),
        Intent::RemoveTile { x, y } => format!("remove_tile({x},{y})"),
        Intent::UpdateTile { x, y, kind, .. } => format!("update_tile({x},{y}) kind {kind}"),
        other => other.name().to_string(),
    }
}
