//! Sparse, jagged tile grid with append-only growth.
//!
//! ```text
//!   y=0  [ F  F  B ]
//!   y=1  [ B  B ]          rows may differ in length
//!   y=2  [ ]               interior rows may be empty
//!   y=3  [ V  B  F  B ]
//!   y=4  [ V  V  B ]       trailing cells are never Void
//! ```
//!
//! Growth only ever appends: new rows at the end of the row list, new cells
//! at the end of a row, or padding an existing row above up to a column.
//! Nothing is ever inserted at the front, so a published `(x, y)` keeps its
//! meaning for the lifetime of the grid.

use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;

use crate::cell::Cell;

/// One row of cells.
pub type Row = Vec<Cell>;

/// Tile kind used for the seed cell.
pub const SEED_KIND: u32 = 1;

/// Elevation used for the seed cell.
pub const DEFAULT_ELEVATION: f32 = 0.5;

/// Logical grid coordinate. Signed so that neighbors past the top or left
/// edge can be represented; those are never addressable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coord {
    pub x: i32,
    pub y: i32,
}

impl Coord {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Axis neighbors in fixed order: up, right, down, left.
    pub const fn neighbors(self) -> [Coord; 4] {
        [
            Coord::new(self.x, self.y - 1),
            Coord::new(self.x + 1, self.y),
            Coord::new(self.x, self.y + 1),
            Coord::new(self.x - 1, self.y),
        ]
    }
}

/// Result of a grid mutation.
///
/// Out-of-bounds targets and repeated edits are routine in a replicated
/// editor, so they are reported here instead of through `Err`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The grid changed.
    Applied,
    /// The target already held exactly this value.
    IgnoredDuplicate,
    /// The target is not addressable or not in a valid state for the edit.
    IgnoredInvalid,
}

impl Outcome {
    pub fn is_applied(self) -> bool {
        self == Outcome::Applied
    }
}

/// Grid validation errors.
#[derive(Debug, Clone, PartialEq)]
pub enum GridError {
    /// The grid holds no filled cell at all
    NoFilledCells,
    /// A structural invariant does not hold
    InvariantViolated { row: usize, reason: String },
}

impl std::fmt::Display for GridError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GridError::NoFilledCells => write!(f, "Grid has no filled cells"),
            GridError::InvariantViolated { row, reason } => {
                write!(f, "Invariant violated in row {row}: {reason}")
            }
        }
    }
}

impl std::error::Error for GridError {}

/// The tile grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TileGrid {
    rows: Vec<Row>,
}

impl Default for TileGrid {
    fn default() -> Self {
        Self::seeded()
    }
}

impl TileGrid {
    /// A fresh grid holding a single seed tile at `(0, 0)`.
    ///
    /// The seed is placed with the regular `add_tile` path, so its right and
    /// down neighbors come out as addressable `Border` cells:
    /// `[[Filled, Border], [Border]]`.
    pub fn seeded() -> Self {
        let mut grid = Self {
            rows: vec![vec![Cell::Void]],
        };
        grid.add_tile(0, 0, SEED_KIND, DEFAULT_ELEVATION);
        grid
    }

    /// Rebuild a grid from stored rows.
    ///
    /// Elevations are clamped and every filled cell gets the same addressable
    /// `Border` neighbors `add_tile` would have given it, so `[[Filled]]`
    /// restores as `[[Filled, Border], [Border]]`. Orphaned `Border` cells
    /// are demoted, trailing `Void` cells and trailing all-`Void` rows are
    /// trimmed. A grid without
    /// any filled cell is rejected so the caller can reseed.
    pub fn from_rows(rows: Vec<Row>) -> Result<Self, GridError> {
        let mut grid = Self {
            rows: rows
                .into_iter()
                .map(|row| row.into_iter().map(Cell::normalized).collect())
                .collect(),
        };

        if !grid.has_filled() {
            return Err(GridError::NoFilledCells);
        }

        let tiles: Vec<(usize, usize)> = grid
            .rows
            .iter()
            .enumerate()
            .flat_map(|(y, row)| {
                row.iter()
                    .enumerate()
                    .filter(|(_, cell)| cell.is_filled())
                    .map(move |(x, _)| (x, y))
            })
            .collect();
        for (x, y) in tiles {
            grid.grow_around(x, y);
            grid.border_void_neighbors(Coord::new(x as i32, y as i32));
        }

        let mut orphans = Vec::new();
        for (y, row) in grid.rows.iter().enumerate() {
            for (x, cell) in row.iter().enumerate() {
                let at = Coord::new(x as i32, y as i32);
                if cell.is_border() && grid.neighbor_weight(at) == 0 {
                    orphans.push((x, y));
                }
            }
        }
        if !orphans.is_empty() {
            log::debug!("Demoting {} orphaned border cells", orphans.len());
        }
        for (x, y) in orphans {
            grid.rows[y][x] = Cell::Void;
        }
        for y in 0..grid.rows.len() {
            grid.trim_row(y);
        }
        grid.trim_rows();

        grid.check_invariants()?;
        Ok(grid)
    }

    /// Consume the grid, yielding its rows.
    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Length of row `y`, if the row exists.
    pub fn row_len(&self, y: i32) -> Option<usize> {
        usize::try_from(y)
            .ok()
            .and_then(|y| self.rows.get(y))
            .map(Vec::len)
    }

    /// Whether `(x, y)` currently names a cell.
    pub fn is_addressable(&self, x: i32, y: i32) -> bool {
        self.index(x, y).is_some()
    }

    pub fn get(&self, x: i32, y: i32) -> Option<&Cell> {
        let (col, row) = self.index(x, y)?;
        self.rows.get(row)?.get(col)
    }

    fn get_mut(&mut self, x: i32, y: i32) -> Option<&mut Cell> {
        let (col, row) = self.index(x, y)?;
        self.rows.get_mut(row)?.get_mut(col)
    }

    /// Number of filled cells.
    pub fn filled_count(&self) -> usize {
        self.rows
            .iter()
            .flat_map(|row| row.iter())
            .filter(|cell| cell.is_filled())
            .count()
    }

    pub fn has_filled(&self) -> bool {
        self.rows.iter().flatten().any(Cell::is_filled)
    }

    /// True once every row has been trimmed away.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Resolve a signed coordinate to `(column, row)` indices.
    fn index(&self, x: i32, y: i32) -> Option<(usize, usize)> {
        let col = usize::try_from(x).ok()?;
        let row = usize::try_from(y).ok()?;
        if col < self.rows.get(row)?.len() {
            Some((col, row))
        } else {
            None
        }
    }

    // ─── Neighbors ────────────────────────────────────────────────────

    /// The four axis neighbors of `(x, y)`: up, right, down, left.
    ///
    /// With `grow`, first makes the up, right and down neighbors addressable
    /// by padding with `Void`. The row above is only padded if it already
    /// exists, and nothing is ever created to the left. Growth is skipped
    /// when `(x, y)` itself is not addressable.
    pub fn neighbors(&mut self, x: i32, y: i32, grow: bool) -> [Coord; 4] {
        if grow {
            if let Some((col, row)) = self.index(x, y) {
                self.grow_around(col, row);
            }
        }
        Coord::new(x, y).neighbors()
    }

    fn grow_around(&mut self, col: usize, row: usize) {
        // Up: pad the existing row above, never insert one
        if let Some(above) = row.checked_sub(1).and_then(|r| self.rows.get_mut(r)) {
            if above.len() <= col {
                above.resize(col + 1, Cell::Void);
            }
        }

        // Right
        if let Some(current) = self.rows.get_mut(row) {
            if current.len() == col + 1 {
                current.push(Cell::Void);
            }
        }

        // Down: append a row at the end if needed, then pad it
        if row + 1 == self.rows.len() {
            self.rows.push(vec![Cell::Void]);
        }
        if let Some(below) = self.rows.get_mut(row + 1) {
            if below.len() <= col {
                below.resize(col + 1, Cell::Void);
            }
        }
    }

    fn border_void_neighbors(&mut self, at: Coord) {
        for n in at.neighbors() {
            if let Some(cell) = self.get_mut(n.x, n.y) {
                if cell.is_void() {
                    *cell = Cell::Border;
                }
            }
        }
    }

    /// Sum of neighbor weights; out-of-bounds neighbors contribute 0.
    fn neighbor_weight(&self, at: Coord) -> u64 {
        at.neighbors()
            .iter()
            .filter_map(|n| self.get(n.x, n.y))
            .map(Cell::weight)
            .sum()
    }

    // ─── Mutations ────────────────────────────────────────────────────

    /// Place a tile of `kind` at `(x, y)`.
    ///
    /// Placing on a `Void` or `Border` cell materializes the neighbors and
    /// turns the `Void` ones into `Border`. Placing on a filled cell of
    /// another kind only repaints the texture; the elevation is kept.
    pub fn add_tile(&mut self, x: i32, y: i32, kind: u32, elevation: f32) -> Outcome {
        let Some(kind) = NonZeroU32::new(kind) else {
            return Outcome::IgnoredInvalid;
        };
        let Some(current) = self.get(x, y).copied() else {
            return Outcome::IgnoredInvalid;
        };

        match current {
            Cell::Filled { kind: existing, .. } if existing == kind => Outcome::IgnoredDuplicate,
            Cell::Filled { elevation: kept, .. } => {
                if let Some(cell) = self.get_mut(x, y) {
                    *cell = Cell::Filled {
                        kind,
                        elevation: kept,
                    };
                }
                Outcome::Applied
            }
            Cell::Void | Cell::Border => {
                if let Some(cell) = self.get_mut(x, y) {
                    *cell = Cell::filled(kind, elevation);
                }
                self.neighbors(x, y, true);
                self.border_void_neighbors(Coord::new(x, y));
                Outcome::Applied
            }
        }
    }

    /// Remove the tile at `(x, y)`.
    ///
    /// The cell and any of its `Border` neighbors that are no longer next to
    /// a filled cell revert to `Void`; trailing `Void` cells and trailing
    /// all-`Void` rows are trimmed. Leading rows are never dropped.
    pub fn remove_tile(&mut self, x: i32, y: i32) -> Outcome {
        let Some((_, row)) = self.index(x, y) else {
            return Outcome::IgnoredInvalid;
        };
        match self.get_mut(x, y) {
            Some(cell) if cell.is_filled() => *cell = Cell::Border,
            _ => return Outcome::IgnoredInvalid,
        }

        let at = Coord::new(x, y);
        for n in at.neighbors() {
            if !self.get(n.x, n.y).is_some_and(Cell::is_border) {
                continue;
            }
            if self.neighbor_weight(n) == 0 {
                if let Some(cell) = self.get_mut(n.x, n.y) {
                    *cell = Cell::Void;
                }
                // n is addressable, so n.y is a valid row index
                self.trim_row(n.y as usize);
            }
        }

        if self.neighbor_weight(at) == 0 {
            if let Some(cell) = self.get_mut(x, y) {
                *cell = Cell::Void;
            }
        }
        self.trim_row(row);
        self.trim_rows();

        Outcome::Applied
    }

    /// Overwrite kind and elevation of an existing filled cell.
    ///
    /// Used for in-place edits such as height changes. Targets that are not
    /// filled, and `kind == 0`, are ignored (`IgnoredInvalid`), since turning
    /// them into tiles here would skip the neighbor growth of `add_tile`.
    ///
    /// The coordinator relays the intent before applying it, whatever this
    /// returns. A replica whose copy of the cell differs from the server's
    /// may therefore apply an update the server ignored, until the next
    /// snapshot reconciles them.
    pub fn update_tile(&mut self, x: i32, y: i32, kind: u32, elevation: f32) -> Outcome {
        let Some(kind) = NonZeroU32::new(kind) else {
            return Outcome::IgnoredInvalid;
        };
        match self.get_mut(x, y) {
            Some(cell) if cell.is_filled() => {
                let next = Cell::filled(kind, elevation);
                if *cell == next {
                    Outcome::IgnoredDuplicate
                } else {
                    *cell = next;
                    Outcome::Applied
                }
            }
            _ => Outcome::IgnoredInvalid,
        }
    }

    fn trim_row(&mut self, row: usize) {
        if let Some(cells) = self.rows.get_mut(row) {
            while cells.last().is_some_and(Cell::is_void) {
                cells.pop();
            }
        }
    }

    fn trim_rows(&mut self) {
        while self
            .rows
            .last()
            .is_some_and(|row| row.iter().all(Cell::is_void))
        {
            self.rows.pop();
        }
    }

    // ─── Validation ───────────────────────────────────────────────────

    /// Check the structural invariants:
    /// - no row ends in `Void`
    /// - the last row is not entirely `Void` (or empty)
    /// - every `Border` cell has a filled axis neighbor
    pub fn check_invariants(&self) -> Result<(), GridError> {
        for (y, row) in self.rows.iter().enumerate() {
            if row.last().is_some_and(Cell::is_void) {
                return Err(GridError::InvariantViolated {
                    row: y,
                    reason: "trailing void cell".into(),
                });
            }
            for (x, cell) in row.iter().enumerate() {
                if cell.is_border() && self.neighbor_weight(Coord::new(x as i32, y as i32)) == 0 {
                    return Err(GridError::InvariantViolated {
                        row: y,
                        reason: format!("border at column {x} has no filled neighbor"),
                    });
                }
            }
        }

        if let Some(last) = self.rows.last() {
            if last.iter().all(Cell::is_void) {
                return Err(GridError::InvariantViolated {
                    row: self.rows.len() - 1,
                    reason: "last row holds no addressable cell".into(),
                });
            }
        }

        Ok(())
    }
}
