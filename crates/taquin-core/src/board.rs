//! Shared board state: occupancy, per-cell move locks, per-agent lifecycle
//! flags, the lane turn token, and the wake signal.
//!
//! The board is the only mutation funnel for positions. A move is an atomic
//! compare-and-set serialized by the destination cell's lock, so at most one
//! agent ever lands on a contested cell and a failed attempt leaves nothing
//! half-written. Every successful move clears all `stuck` flags: freeing a
//! cell may open options for anyone.

use crate::AgentId;
use crate::geometry::{self, Cell, NeighborList};
use smallvec::SmallVec;
use std::fmt;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

const VACANT: u32 = u32::MAX;

/// Wake signal pulsed by every successful move and delivered message.
///
/// Agents sleep on it between ticks instead of busy-polling; the bounded
/// timeout keeps the original poll cadence as a fallback.
#[derive(Debug, Default)]
pub struct Activity {
    pulses: Mutex<u64>,
    condvar: Condvar,
}

impl Activity {
    /// Record one event and wake every sleeper.
    pub fn pulse(&self) {
        let mut pulses = self.pulses.lock().unwrap_or_else(PoisonError::into_inner);
        *pulses += 1;
        drop(pulses);
        self.condvar.notify_all();
    }

    /// Current pulse count.
    #[must_use]
    pub fn count(&self) -> u64 {
        *self.pulses.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until the pulse count passes `seen` or `timeout` elapses,
    /// returning the latest count.
    pub fn wait(&self, seen: u64, timeout: Duration) -> u64 {
        let guard = self.pulses.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _outcome) = self
            .condvar
            .wait_timeout_while(guard, timeout, |pulses| *pulses == seen)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

/// Lifecycle block shared between an agent's thread and observers.
#[derive(Debug)]
struct AgentSlot {
    position: AtomicU32,
    stuck: AtomicBool,
    waiting: AtomicBool,
    ended: AtomicBool,
}

impl AgentSlot {
    fn unplaced() -> Self {
        Self {
            position: AtomicU32::new(VACANT),
            stuck: AtomicBool::new(false),
            waiting: AtomicBool::new(false),
            ended: AtomicBool::new(false),
        }
    }
}

/// Arena-style shared grid owning the occupancy array, one lock handle per
/// cell, the per-agent flags, and the lane turn token.
pub struct Board {
    side: u32,
    cells: Vec<AtomicU32>,
    locks: Vec<Mutex<()>>,
    slots: Vec<AgentSlot>,
    changed: AtomicBool,
    token: AtomicU32,
    moves: AtomicU64,
    activity: Arc<Activity>,
}

impl fmt::Debug for Board {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Board")
            .field("side", &self.side)
            .field("agent_count", &self.slots.len())
            .field("moves", &self.moves.load(Ordering::SeqCst))
            .finish()
    }
}

impl Board {
    /// Create an empty board for `agent_count` agents on a `side`-wide grid.
    #[must_use]
    pub fn new(side: u32, agent_count: usize, activity: Arc<Activity>) -> Self {
        let cell_count = (side * side) as usize;
        Self {
            side,
            cells: (0..cell_count).map(|_| AtomicU32::new(VACANT)).collect(),
            locks: (0..cell_count).map(|_| Mutex::new(())).collect(),
            slots: (0..agent_count).map(|_| AgentSlot::unplaced()).collect(),
            changed: AtomicBool::new(false),
            token: AtomicU32::new(0),
            moves: AtomicU64::new(0),
            activity,
        }
    }

    /// Grid side length.
    #[must_use]
    pub const fn side(&self) -> u32 {
        self.side
    }

    /// Number of agents the board was sized for.
    #[must_use]
    pub fn agent_count(&self) -> usize {
        self.slots.len()
    }

    /// Shared wake signal.
    #[must_use]
    pub fn activity(&self) -> &Arc<Activity> {
        &self.activity
    }

    /// Install an agent during setup. Not a move: no flags are touched and
    /// nothing is signalled. Fails if the cell is already taken.
    pub fn place(&self, agent: AgentId, cell: Cell) -> bool {
        let slot = &self.cells[cell.index()];
        if slot
            .compare_exchange(VACANT, agent.0, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        self.slots[agent.index()].position.store(cell.0, Ordering::SeqCst);
        true
    }

    /// Whether no agent occupies `cell`.
    #[must_use]
    pub fn is_empty(&self, cell: Cell) -> bool {
        self.cells[cell.index()].load(Ordering::SeqCst) == VACANT
    }

    /// The agent occupying `cell`, if any.
    #[must_use]
    pub fn occupant(&self, cell: Cell) -> Option<AgentId> {
        match self.cells[cell.index()].load(Ordering::SeqCst) {
            VACANT => None,
            id => Some(AgentId(id)),
        }
    }

    /// Current position of `agent`.
    #[must_use]
    pub fn position_of(&self, agent: AgentId) -> Cell {
        Cell(self.slots[agent.index()].position.load(Ordering::SeqCst))
    }

    /// Orthogonal neighbors of `cell` satisfying `keep`, probed in
    /// north/east/south/west order.
    pub fn neighbors_with<F>(&self, cell: Cell, keep: F) -> NeighborList
    where
        F: Fn(Cell) -> bool,
    {
        let side = self.side;
        let (x, y) = cell.coords(side);
        let mut out: NeighborList = SmallVec::new();
        if y > 0 && keep(Cell(cell.0 - side)) {
            out.push(Cell(cell.0 - side));
        }
        if x + 1 < side && keep(Cell(cell.0 + 1)) {
            out.push(Cell(cell.0 + 1));
        }
        if y + 1 < side && keep(Cell(cell.0 + side)) {
            out.push(Cell(cell.0 + side));
        }
        if x > 0 && keep(Cell(cell.0 - 1)) {
            out.push(Cell(cell.0 - 1));
        }
        out
    }

    /// Currently empty orthogonal neighbors.
    #[must_use]
    pub fn neighbors(&self, cell: Cell) -> NeighborList {
        self.neighbors_with(cell, |c| self.is_empty(c))
    }

    /// Full topology around `cell`, occupied or not.
    #[must_use]
    pub fn all_neighbors(&self, cell: Cell) -> NeighborList {
        self.neighbors_with(cell, |_| true)
    }

    /// Attempt to move `agent` onto `dest`.
    ///
    /// Acquires the destination lock, re-checks vacancy, and commits both
    /// occupancy writes before releasing. On success every agent's `stuck`
    /// flag is cleared, the observer flag is raised, and the wake signal is
    /// pulsed. Failure mutates nothing.
    pub fn try_move(&self, agent: AgentId, dest: Cell) -> bool {
        let from = self.position_of(agent);
        let moved = {
            let _guard = self.locks[dest.index()]
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if self.cells[dest.index()].load(Ordering::SeqCst) != VACANT {
                false
            } else {
                self.cells[dest.index()].store(agent.0, Ordering::SeqCst);
                self.cells[from.index()].store(VACANT, Ordering::SeqCst);
                self.slots[agent.index()].position.store(dest.0, Ordering::SeqCst);
                true
            }
        };
        if moved {
            info!(agent = agent.0, from = from.0, to = dest.0, "move");
            self.moves.fetch_add(1, Ordering::SeqCst);
            self.changed.store(true, Ordering::SeqCst);
            self.clear_all_stuck();
            self.activity.pulse();
        } else {
            debug!(agent = agent.0, from = from.0, to = dest.0, "move refused");
        }
        moved
    }

    /// Empty cells at minimum distance from `source`; ties all included.
    /// Scans the whole grid, since the free cell can be anywhere.
    #[must_use]
    pub fn nearest_empty(&self, source: Cell) -> Vec<Cell> {
        let empties = (0..self.side * self.side)
            .map(Cell)
            .filter(|&cell| self.is_empty(cell));
        geometry::closest_among(source, self.side, empties)
    }

    /// Total successful moves so far.
    #[must_use]
    pub fn move_count(&self) -> u64 {
        self.moves.load(Ordering::SeqCst)
    }

    /// Observer poll-and-clear: whether anything moved since the last call.
    pub fn take_changed(&self) -> bool {
        self.changed.swap(false, Ordering::SeqCst)
    }

    pub fn set_stuck(&self, agent: AgentId, stuck: bool) {
        self.slots[agent.index()].stuck.store(stuck, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_stuck(&self, agent: AgentId) -> bool {
        self.slots[agent.index()].stuck.load(Ordering::SeqCst)
    }

    pub fn set_waiting(&self, agent: AgentId, waiting: bool) {
        self.slots[agent.index()].waiting.store(waiting, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_waiting(&self, agent: AgentId) -> bool {
        self.slots[agent.index()].waiting.load(Ordering::SeqCst)
    }

    pub fn set_ended(&self, agent: AgentId, ended: bool) {
        self.slots[agent.index()].ended.store(ended, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_ended(&self, agent: AgentId) -> bool {
        self.slots[agent.index()].ended.load(Ordering::SeqCst)
    }

    /// Clear every agent's `stuck` flag.
    pub fn clear_all_stuck(&self) {
        for slot in &self.slots {
            slot.stuck.store(false, Ordering::SeqCst);
        }
    }

    /// Whether any agent is currently waiting on an acknowledgement.
    #[must_use]
    pub fn any_waiting(&self) -> bool {
        self.slots
            .iter()
            .any(|slot| slot.waiting.load(Ordering::SeqCst))
    }

    /// Whether every agent has ended.
    #[must_use]
    pub fn all_ended(&self) -> bool {
        self.slots
            .iter()
            .all(|slot| slot.ended.load(Ordering::SeqCst))
    }

    /// Quiescence predicate: every agent is ended or stuck, meaning the
    /// simulation cannot progress without outside intervention. For external
    /// observers; agents never consult it.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.slots.iter().all(|slot| {
            slot.ended.load(Ordering::SeqCst) || slot.stuck.load(Ordering::SeqCst)
        })
    }

    /// Current holder of the lane turn token.
    #[must_use]
    pub fn token(&self) -> AgentId {
        AgentId(self.token.load(Ordering::SeqCst))
    }

    /// Hand the token to `next`. Only the current holder may call this.
    pub fn advance_token(&self, next: AgentId) {
        self.token.store(next.0, Ordering::SeqCst);
        self.activity.pulse();
    }

    /// Occupancy snapshot indexed by cell.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Option<AgentId>> {
        self.cells
            .iter()
            .map(|cell| match cell.load(Ordering::SeqCst) {
                VACANT => None,
                id => Some(AgentId(id)),
            })
            .collect()
    }

    /// Row-major textual dump: `#` borders, `_` for the free cell, the
    /// occupying agent id elsewhere.
    #[must_use]
    pub fn render_ascii(&self) -> String {
        let side = self.side as usize;
        let width = (self.slots.len().max(1) - 1).to_string().len();
        let mut out = String::new();
        let border = "# ".repeat(side);
        out.push_str(border.trim_end());
        for (index, occupant) in self.snapshot().iter().enumerate() {
            if index % side == 0 {
                out.push('\n');
            }
            match occupant {
                Some(id) => {
                    let _ = write!(out, "{:>width$} ", id.0);
                }
                None => {
                    let _ = write!(out, "{:>width$} ", "_");
                }
            }
        }
        out.push('\n');
        out.push_str(border.trim_end());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn board(side: u32, agents: usize) -> Board {
        Board::new(side, agents, Arc::new(Activity::default()))
    }

    #[test]
    fn place_rejects_occupied_cells() {
        let board = board(3, 2);
        assert!(board.place(AgentId(0), Cell(4)));
        assert!(!board.place(AgentId(1), Cell(4)));
        assert_eq!(board.occupant(Cell(4)), Some(AgentId(0)));
    }

    #[test]
    fn neighbor_probe_respects_edges_and_order() {
        let board = board(3, 0);
        let center = board.all_neighbors(Cell(4));
        assert_eq!(center.as_slice(), &[Cell(1), Cell(5), Cell(7), Cell(3)]);
        let corner = board.all_neighbors(Cell(0));
        assert_eq!(corner.as_slice(), &[Cell(1), Cell(3)]);
    }

    #[test]
    fn moves_update_occupancy_and_clear_stuck() {
        let board = board(3, 2);
        board.place(AgentId(0), Cell(0));
        board.place(AgentId(1), Cell(4));
        board.set_stuck(AgentId(1), true);

        assert!(board.try_move(AgentId(0), Cell(1)));
        assert_eq!(board.position_of(AgentId(0)), Cell(1));
        assert!(board.is_empty(Cell(0)));
        assert!(!board.is_stuck(AgentId(1)), "a move frees everyone");
        assert!(board.take_changed());
        assert!(!board.take_changed(), "changed flag is poll-and-clear");
    }

    #[test]
    fn move_onto_occupied_cell_fails_without_side_effects() {
        let board = board(3, 2);
        board.place(AgentId(0), Cell(0));
        board.place(AgentId(1), Cell(1));
        let moves_before = board.move_count();
        assert!(!board.try_move(AgentId(0), Cell(1)));
        assert_eq!(board.position_of(AgentId(0)), Cell(0));
        assert_eq!(board.occupant(Cell(1)), Some(AgentId(1)));
        assert_eq!(board.move_count(), moves_before);
    }

    #[test]
    fn contested_cell_admits_exactly_one_winner() {
        let board = Arc::new(board(3, 2));
        board.place(AgentId(0), Cell(3));
        board.place(AgentId(1), Cell(1));
        let wins = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for agent in [AgentId(0), AgentId(1)] {
            let board = Arc::clone(&board);
            let wins = Arc::clone(&wins);
            handles.push(std::thread::spawn(move || {
                if board.try_move(agent, Cell(4)) {
                    wins.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for handle in handles {
            handle.join().expect("mover thread");
        }

        assert_eq!(wins.load(Ordering::SeqCst), 1);
        let occupancy = board.snapshot();
        assert_eq!(occupancy.iter().flatten().count(), 2);
        assert!(occupancy[4].is_some());
    }

    #[test]
    fn nearest_empty_returns_all_ties() {
        let board = board(3, 7);
        // Fill everything except cells 1 and 3, both adjacent to corner 0.
        let mut id = 0;
        for cell in [0_u32, 2, 4, 5, 6, 7, 8] {
            assert!(board.place(AgentId(id), Cell(cell)));
            id += 1;
        }
        let ties = board.nearest_empty(Cell(0));
        assert_eq!(ties, vec![Cell(1), Cell(3)]);
    }

    #[test]
    fn ascii_dump_shows_free_cell() {
        let board = board(2, 3);
        board.place(AgentId(0), Cell(0));
        board.place(AgentId(1), Cell(1));
        board.place(AgentId(2), Cell(3));
        let dump = board.render_ascii();
        assert_eq!(dump, "# #\n0 1 \n_ 2 \n# #");
    }

    #[test]
    fn quiescence_requires_every_agent_settled() {
        let board = board(2, 2);
        assert!(!board.is_finished());
        board.set_ended(AgentId(0), true);
        board.set_stuck(AgentId(1), true);
        assert!(board.is_finished());
        board.set_stuck(AgentId(1), false);
        assert!(!board.is_finished());
    }
}
