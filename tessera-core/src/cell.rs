//! The atomic unit of grid state.
//!
//! ```text
//!   Void ──add neighbor──► Border ──add_tile──► Filled(kind, elevation)
//!    ▲                       │  ▲                   │
//!    └──no filled neighbor───┘  └────remove_tile────┘
//! ```

use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;

/// A single slot of the tile grid.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub enum Cell {
    /// Placeholder: not part of the addressable grid, never targetable.
    #[default]
    Void,
    /// Addressable and empty. Only kept while an axis neighbor is `Filled`.
    Border,
    /// An actual tile.
    Filled {
        /// Texture selector
        kind: NonZeroU32,
        /// Continuous height, always `>= 0`
        elevation: f32,
    },
}

impl Cell {
    /// Build a filled cell, clamping the elevation to `>= 0`.
    ///
    /// NaN collapses to `0.0` as well.
    pub fn filled(kind: NonZeroU32, elevation: f32) -> Self {
        Cell::Filled {
            kind,
            elevation: elevation.max(0.0),
        }
    }

    pub fn is_void(&self) -> bool {
        matches!(self, Cell::Void)
    }

    pub fn is_border(&self) -> bool {
        matches!(self, Cell::Border)
    }

    pub fn is_filled(&self) -> bool {
        matches!(self, Cell::Filled { .. })
    }

    /// Contribution of this cell to a neighbor sum: the tile kind when
    /// filled, zero otherwise.
    pub fn weight(&self) -> u64 {
        match self {
            Cell::Filled { kind, .. } => u64::from(kind.get()),
            Cell::Void | Cell::Border => 0,
        }
    }

    /// Tile kind, if filled.
    pub fn kind(&self) -> Option<NonZeroU32> {
        match self {
            Cell::Filled { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Elevation, if filled.
    pub fn elevation(&self) -> Option<f32> {
        match self {
            Cell::Filled { elevation, .. } => Some(*elevation),
            _ => None,
        }
    }

    /// Re-apply the elevation clamp. Used when restoring stored grids.
    pub(crate) fn normalized(self) -> Self {
        match self {
            Cell::Filled { kind, elevation } => Cell::filled(kind, elevation),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kind(k: u32) -> NonZeroU32 {
        NonZeroU32::new(k).unwrap()
    }

    #[test]
    fn test_default_is_void() {
        assert_eq!(Cell::default(), Cell::Void);
    }

    #[test]
    fn test_weight() {
        assert_eq!(Cell::Void.weight(), 0);
        assert_eq!(Cell::Border.weight(), 0);
        assert_eq!(Cell::filled(kind(3), 0.5).weight(), 3);
    }

    #[test]
    fn test_elevation_clamped() {
        assert_eq!(Cell::filled(kind(1), -2.0).elevation(), Some(0.0));
        assert_eq!(Cell::filled(kind(1), f32::NAN).elevation(), Some(0.0));
        assert_eq!(Cell::filled(kind(1), 1.25).elevation(), Some(1.25));
    }

    #[test]
    fn test_accessors() {
        let cell = Cell::filled(kind(7), 0.75);
        assert!(cell.is_filled());
        assert_eq!(cell.kind(), Some(kind(7)));
        assert!(Cell::Border.kind().is_none());
        assert!(Cell::Border.is_border());
        assert!(Cell::Void.is_void());
    }
}
