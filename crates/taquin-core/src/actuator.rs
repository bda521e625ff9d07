//! Per-agent routing strategies.
//!
//! Agents whose target sits in the last two rows or columns of the grid
//! cannot approach head-on without permanently walling in their neighbors,
//! so they stage through an intermediate cell (`target_bis`) in the lane and
//! hand passage to each other in a fixed order carried by the board's turn
//! token. The strategy is chosen once at construction from the decoded
//! target and never changes.

use crate::AgentId;
use crate::geometry::Cell;
use serde::{Deserialize, Serialize};

/// Routing strategy bound to one agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Actuator {
    /// Target reachable in a single leg; terminal on arrival.
    Direct,
    /// Lane target one cell short of the edge: park on the lane's edge cell
    /// and yield to the successor from there.
    StagedSecondary { target_bis: Cell, next: AgentId },
    /// Lane-edge target: park one step further along the lane, then request
    /// a turn from the occupant of the true target.
    StagedPrimary {
        target_bis: Cell,
        master: Option<AgentId>,
        next: AgentId,
    },
}

impl Actuator {
    /// Build one actuator per agent from the target permutation.
    ///
    /// Decoding the target `(x, y)` against side `n`: interior targets
    /// (both coordinates short of the last two) and the safe corner
    /// `(n-2, n-2)` go Direct; the last column/row goes Staged-primary; the
    /// remaining second-to-last column/row goes Staged-secondary. `next`
    /// links follow [`lane_order`].
    #[must_use]
    pub fn assign(side: u32, targets: &[Cell]) -> Vec<Self> {
        let owner = |cell: Cell| -> Option<AgentId> {
            targets
                .iter()
                .position(|&t| t == cell)
                .map(|index| AgentId(index as u32))
        };

        let order = lane_order(side, targets);
        let successor = |id: AgentId| -> AgentId {
            order
                .iter()
                .position(|&staged| staged == id)
                .map_or(id, |index| order[(index + 1) % order.len()])
        };

        targets
            .iter()
            .enumerate()
            .map(|(index, &target)| {
                let id = AgentId(index as u32);
                let (x, y) = target.coords(side);
                let last = side - 1;
                let penultimate = side - 2;
                if (x, y) == (penultimate, penultimate) || (x < penultimate && y < penultimate) {
                    Self::Direct
                } else if x == last || y == last {
                    let (target_bis, vacates_first) = if (x, y) == (last, last) {
                        (target, Cell::from_coords(last, penultimate, side))
                    } else if x == last {
                        (
                            Cell::from_coords(last, y + 1, side),
                            Cell::from_coords(penultimate, y, side),
                        )
                    } else {
                        (
                            Cell::from_coords(x + 1, last, side),
                            Cell::from_coords(x, penultimate, side),
                        )
                    };
                    Self::StagedPrimary {
                        target_bis,
                        master: owner(vacates_first),
                        next: successor(id),
                    }
                } else {
                    let target_bis = if x == penultimate {
                        Cell::from_coords(last, y, side)
                    } else {
                        Cell::from_coords(x, last, side)
                    };
                    Self::StagedSecondary {
                        target_bis,
                        next: successor(id),
                    }
                }
            })
            .collect()
    }

    /// Whether the strategy is gated by the turn token.
    #[must_use]
    pub const fn is_staged(&self) -> bool {
        !matches!(self, Self::Direct)
    }

    /// Intermediate waypoint, when one exists.
    #[must_use]
    pub const fn target_bis(&self) -> Option<Cell> {
        match self {
            Self::Direct => None,
            Self::StagedSecondary { target_bis, .. } | Self::StagedPrimary { target_bis, .. } => {
                Some(*target_bis)
            }
        }
    }

    /// Successor in the lane hand-off order.
    #[must_use]
    pub const fn next(&self) -> Option<AgentId> {
        match self {
            Self::Direct => None,
            Self::StagedSecondary { next, .. } | Self::StagedPrimary { next, .. } => Some(*next),
        }
    }

    /// Whether an agent at `position` aiming for `target` has nothing left
    /// to route. A parked secondary reports completion from `target_bis` so
    /// the token can move on before its final hand-off step.
    #[must_use]
    pub fn can_end(&self, position: Cell, target: Cell) -> bool {
        match self {
            Self::Direct | Self::StagedPrimary { .. } => position == target,
            Self::StagedSecondary { target_bis, .. } => {
                position == *target_bis || position == target
            }
        }
    }
}

/// The fixed hand-off order among lane-staged agents: column-lane pairs top
/// to bottom, row-lane pairs left to right, then the far-corner cells, with
/// the secondary ahead of the primary inside each pair. Targets absent from
/// the permutation (the cell left free) are skipped.
#[must_use]
pub fn lane_order(side: u32, targets: &[Cell]) -> Vec<AgentId> {
    let owner = |cell: Cell| -> Option<AgentId> {
        targets
            .iter()
            .position(|&t| t == cell)
            .map(|index| AgentId(index as u32))
    };

    let last = side - 1;
    let penultimate = side - 2;
    let mut lane_cells = Vec::new();
    for y in 0..penultimate {
        lane_cells.push(Cell::from_coords(penultimate, y, side));
        lane_cells.push(Cell::from_coords(last, y, side));
    }
    for x in 0..penultimate {
        lane_cells.push(Cell::from_coords(x, penultimate, side));
        lane_cells.push(Cell::from_coords(x, last, side));
    }
    lane_cells.push(Cell::from_coords(last, penultimate, side));
    lane_cells.push(Cell::from_coords(penultimate, last, side));
    lane_cells.push(Cell::from_coords(last, last, side));

    lane_cells.into_iter().filter_map(owner).collect()
}
