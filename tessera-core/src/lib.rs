//! # tessera-core: Tile grid model for Tessera
//!
//! A shared isometric map is stored as a jagged grid of [`Cell`]s. The grid
//! only grows by appending, which keeps every `(x, y)` that has been handed
//! to a remote participant valid for as long as the grid lives.
//!
//! ```text
//!          add_tile                      remove_tile
//!   [[F, B],          ──(1,0)──►  [[F, F, B],     ──(1,0)──►  [[F, B],
//!    [B]]                          [B, B]]                     [B]]
//! ```
//!
//! ## Modules
//!
//! - [`cell`]: `Void` / `Border` / `Filled` cell states
//! - [`grid`]: the grid container and its add/remove/neighbor rules

pub mod cell;
pub mod grid;

pub use cell::Cell;
pub use grid::{Coord, GridError, Outcome, Row, TileGrid, DEFAULT_ELEVATION, SEED_KIND};
