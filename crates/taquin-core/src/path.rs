//! Single-source shortest paths over a caller-supplied adjacency.
//!
//! The passable set changes whenever any agent moves, so the graph is
//! re-evaluated on every query instead of cached. Unreachable targets are the
//! normal way an agent discovers it is blocked, hence [`NoPathFound`] rather
//! than a panic or an `Option` that loses the endpoints.

use crate::geometry::Cell;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

/// No route exists between two cells under the supplied adjacency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoPathFound {
    pub source: Cell,
    pub target: Cell,
}

impl std::fmt::Display for NoPathFound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "no path from cell {} to cell {}", self.source.0, self.target.0)
    }
}

impl std::error::Error for NoPathFound {}

/// Dijkstra with unit edge weights.
///
/// Returns the full path, `source` and `target` inclusive. Tie-breaking among
/// equal-cost frontiers follows cell order, so the result is deterministic
/// for a fixed adjacency; callers that want randomized choices shuffle
/// downstream.
pub fn shortest_path<F, I>(source: Cell, target: Cell, adjacency: F) -> Result<Vec<Cell>, NoPathFound>
where
    F: Fn(Cell) -> I,
    I: IntoIterator<Item = Cell>,
{
    if source == target {
        return Ok(vec![source]);
    }

    let mut tentative: HashMap<Cell, u32> = HashMap::from([(source, 0)]);
    let mut predecessor: HashMap<Cell, Cell> = HashMap::new();
    let mut settled: HashSet<Cell> = HashSet::new();
    let mut frontier = BinaryHeap::from([Reverse((0_u32, source))]);

    while let Some(Reverse((cost, node))) = frontier.pop() {
        if !settled.insert(node) {
            continue;
        }
        if node == target {
            break;
        }
        for neighbor in adjacency(node) {
            if settled.contains(&neighbor) {
                continue;
            }
            let relaxed = cost + 1;
            if tentative.get(&neighbor).is_none_or(|&known| known > relaxed) {
                tentative.insert(neighbor, relaxed);
                predecessor.insert(neighbor, node);
                frontier.push(Reverse((relaxed, neighbor)));
            }
        }
    }

    let mut path = vec![target];
    let mut node = target;
    while node != source {
        node = *predecessor
            .get(&node)
            .ok_or(NoPathFound { source, target })?;
        path.push(node);
    }
    path.reverse();
    Ok(path)
}
