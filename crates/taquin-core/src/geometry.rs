//! Cell indexing and Manhattan-metric ranking helpers.
//!
//! Cells are linear row-major indices; every helper that needs 2-D reasoning
//! decodes on the fly. Nothing here touches occupancy: callers supply a
//! neighbor function, so the same ranking code serves "only through empty
//! cells" and "through anything" queries alike.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// One grid position, stored as a linear row-major index in `[0, side²)`.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
)]
pub struct Cell(pub u32);

/// Up to four orthogonal neighbors, kept inline.
pub type NeighborList = SmallVec<[Cell; 4]>;

impl Cell {
    /// Index into per-cell arrays.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Decode into `(x, y)` coordinates on a `side`-wide grid.
    #[must_use]
    pub const fn coords(self, side: u32) -> (u32, u32) {
        (self.0 % side, self.0 / side)
    }

    /// Encode `(x, y)` coordinates back into a linear index.
    #[must_use]
    pub const fn from_coords(x: u32, y: u32, side: u32) -> Self {
        Self(y * side + x)
    }
}

/// Manhattan distance between two cells.
#[must_use]
pub fn distance(a: Cell, b: Cell, side: u32) -> u32 {
    let (ax, ay) = a.coords(side);
    let (bx, by) = b.coords(side);
    ax.abs_diff(bx) + ay.abs_diff(by)
}

/// Neighbors of `source` strictly closer to `target` than `source` is.
pub fn closer_neighbors<F>(source: Cell, target: Cell, side: u32, neighbors: F) -> NeighborList
where
    F: FnOnce(Cell) -> NeighborList,
{
    let baseline = distance(source, target, side);
    neighbors(source)
        .into_iter()
        .filter(|&cell| distance(cell, target, side) < baseline)
        .collect()
}

/// Neighbors of `source` strictly farther from `target` than `source` is.
pub fn farther_neighbors<F>(source: Cell, target: Cell, side: u32, neighbors: F) -> NeighborList
where
    F: FnOnce(Cell) -> NeighborList,
{
    let baseline = distance(source, target, side);
    neighbors(source)
        .into_iter()
        .filter(|&cell| distance(cell, target, side) > baseline)
        .collect()
}

/// Candidates at minimum distance from `target`; ties are all included.
pub fn closest_among<I>(target: Cell, side: u32, candidates: I) -> Vec<Cell>
where
    I: IntoIterator<Item = Cell>,
{
    let mut best: Vec<Cell> = Vec::new();
    let mut best_distance = u32::MAX;
    for cell in candidates {
        let d = distance(cell, target, side);
        if d < best_distance {
            best_distance = d;
            best.clear();
        }
        if d == best_distance {
            best.push(cell);
        }
    }
    best
}
