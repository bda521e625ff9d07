//! Simulation driver: wiring, the thread-per-agent runtime, and reporting.
//!
//! There is no central scheduler. Every agent runs on its own thread, woken
//! by the shared activity signal with a bounded tick as fallback; the driver
//! thread only watches for quiescence and raises the stop flag. A run ends in
//! one of three distinct outcomes so a deadlocked board is never mistaken
//! for a solved one.

use crate::actuator::{self, Actuator};
use crate::agent::{Agent, Policy};
use crate::board::{Activity, Board};
use crate::geometry::Cell;
use crate::mailbox::MailRegistry;
use crate::{AgentId, SetupError, TaquinConfig};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// How a run ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Outcome {
    /// Every agent settled on its target.
    Solved,
    /// The board went quiescent with agents still off-target.
    Stalled,
    /// The scheduling-tick ceiling was hit first.
    TimedOut,
}

/// Summary of a finished run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimReport {
    pub outcome: Outcome,
    /// Driver scheduling ticks consumed.
    pub ticks: u64,
    /// Successful moves across all agents.
    pub moves: u64,
    /// Seed the run was derived from.
    pub seed: u64,
    /// Agents not on their target at shutdown.
    pub unsettled: usize,
}

/// Failure to stand up the worker threads.
#[derive(Debug, Error)]
#[error("failed to spawn agent thread: {0}")]
pub struct WorkerError(#[from] std::io::Error);

/// A fully wired board, mail fabric, and agent roster.
pub struct Simulation {
    config: TaquinConfig,
    seed: u64,
    board: Arc<Board>,
    mail: Arc<MailRegistry>,
    activity: Arc<Activity>,
    agents: Vec<Agent>,
    targets: Vec<Cell>,
}

impl Simulation {
    /// Conventional setup: N²−1 agents, targets the identity permutation
    /// over cell indices, initial positions drawn uniformly from the empty
    /// cells through the seeded RNG.
    pub fn new(config: TaquinConfig) -> Result<Self, SetupError> {
        config.validate()?;
        let seed = config.seed();
        let mut rng = config.seeded_rng(seed);
        let targets: Vec<Cell> = (0..config.agent_count() as u32).map(Cell).collect();
        let mut cells: Vec<Cell> = (0..config.cell_count()).map(Cell).collect();
        cells.shuffle(&mut rng);
        cells.truncate(config.agent_count());
        Self::assemble(config, seed, targets, cells)
    }

    /// Explicit setup for harnesses and scenarios: parallel target and
    /// position vectors indexed by agent id.
    pub fn with_layout(
        config: TaquinConfig,
        targets: Vec<Cell>,
        positions: Vec<Cell>,
    ) -> Result<Self, SetupError> {
        config.validate()?;
        if targets.len() != positions.len() {
            return Err(SetupError::WrongAgentCount {
                expected: targets.len(),
                actual: positions.len(),
            });
        }
        if targets.is_empty() || targets.len() > config.agent_count() {
            return Err(SetupError::InvalidConfig(
                "agent count must leave at least one cell free",
            ));
        }
        for group in [&targets, &positions] {
            let mut seen = HashSet::new();
            for &cell in group.iter() {
                if cell.0 >= config.cell_count() {
                    return Err(SetupError::OutOfBounds {
                        cell: cell.0,
                        side: config.side,
                    });
                }
                if !seen.insert(cell) {
                    return Err(SetupError::DuplicateCell(cell.0));
                }
            }
        }
        let seed = config.seed();
        Self::assemble(config, seed, targets, positions)
    }

    fn assemble(
        config: TaquinConfig,
        seed: u64,
        targets: Vec<Cell>,
        positions: Vec<Cell>,
    ) -> Result<Self, SetupError> {
        let activity = Arc::new(Activity::default());
        let board = Arc::new(Board::new(
            config.side,
            targets.len(),
            Arc::clone(&activity),
        ));
        let mail = Arc::new(MailRegistry::new(targets.len(), Arc::clone(&activity)));

        for (index, &cell) in positions.iter().enumerate() {
            if !board.place(AgentId(index as u32), cell) {
                return Err(SetupError::DuplicateCell(cell.0));
            }
        }

        let actuators = if config.policy == Policy::Interactive {
            Actuator::assign(config.side, &targets)
        } else {
            vec![Actuator::Direct; targets.len()]
        };
        if config.policy == Policy::Interactive
            && let Some(&first) = actuator::lane_order(config.side, &targets).first()
        {
            board.advance_token(first);
        }

        let agents = targets
            .iter()
            .zip(actuators)
            .enumerate()
            .map(|(index, (&target, actuator))| {
                let id = AgentId(index as u32);
                Agent::new(
                    id,
                    target,
                    config.policy,
                    actuator,
                    Arc::clone(&board),
                    Arc::clone(&mail),
                    config.agent_rng(seed, id),
                )
            })
            .collect();

        info!(
            side = config.side,
            agents = targets.len(),
            seed,
            policy = ?config.policy,
            "simulation assembled"
        );
        Ok(Self {
            config,
            seed,
            board,
            mail,
            activity,
            agents,
            targets,
        })
    }

    /// Shared board, for observers.
    #[must_use]
    pub fn board(&self) -> &Arc<Board> {
        &self.board
    }

    /// Shared mail fabric.
    #[must_use]
    pub fn mail(&self) -> &Arc<MailRegistry> {
        &self.mail
    }

    /// Target permutation indexed by agent id.
    #[must_use]
    pub fn targets(&self) -> &[Cell] {
        &self.targets
    }

    /// Whether every agent sits on its target.
    #[must_use]
    pub fn solved(&self) -> bool {
        self.targets
            .iter()
            .enumerate()
            .all(|(index, &target)| self.board.position_of(AgentId(index as u32)) == target)
    }

    /// True quiescence: every agent settled or stuck, no mail in flight,
    /// nobody waiting on an acknowledgement.
    fn quiescent(&self) -> bool {
        self.board.is_finished() && self.mail.all_empty() && !self.board.any_waiting()
    }

    /// One synchronous round: step every agent once, in id order.
    pub fn step_round(&mut self) {
        for agent in &mut self.agents {
            agent.step();
        }
    }

    /// Mutable access to one agent, for fine-grained harness control.
    #[must_use]
    pub fn agent_mut(&mut self, id: AgentId) -> &mut Agent {
        &mut self.agents[id.index()]
    }

    /// Drive the roster deterministically on the calling thread until
    /// quiescence or `max_rounds`.
    pub fn run_synchronous(&mut self, max_rounds: u64) -> SimReport {
        let mut rounds = 0_u64;
        let outcome = loop {
            if self.quiescent() {
                break if self.board.all_ended() {
                    Outcome::Solved
                } else {
                    Outcome::Stalled
                };
            }
            if rounds >= max_rounds {
                break Outcome::TimedOut;
            }
            rounds += 1;
            self.step_round();
        };
        self.report(outcome, rounds)
    }

    /// Run threaded: one worker per agent plus this driver thread, which
    /// wakes on activity, watches for quiescence, and joins the roster.
    pub fn run(self) -> Result<SimReport, WorkerError> {
        let Self {
            config,
            seed,
            board,
            mail,
            activity,
            agents,
            targets,
        } = self;

        let stop = Arc::new(AtomicBool::new(false));
        let tick = Duration::from_millis(config.tick_interval_ms);
        let mut workers = Vec::with_capacity(agents.len());
        for mut agent in agents {
            let stop = Arc::clone(&stop);
            let activity = Arc::clone(&activity);
            let worker = thread::Builder::new()
                .name(format!("agent-{}", agent.id()))
                .spawn(move || {
                    let mut seen = activity.count();
                    while !stop.load(Ordering::SeqCst) {
                        agent.step();
                        seen = activity.wait(seen, tick);
                    }
                })?;
            workers.push(worker);
        }

        let mut ticks = 0_u64;
        let mut seen = activity.count();
        let mut last_moves = board.move_count();
        let mut stagnant = 0_u64;
        let outcome = loop {
            let quiet = board.is_finished() && mail.all_empty() && !board.any_waiting();
            if quiet {
                break if board.all_ended() {
                    Outcome::Solved
                } else {
                    Outcome::Stalled
                };
            }
            if config.max_ticks > 0 && ticks >= config.max_ticks {
                break Outcome::TimedOut;
            }
            if config.stall_patience > 0 && stagnant >= config.stall_patience {
                break Outcome::Stalled;
            }
            seen = activity.wait(seen, tick);
            ticks += 1;
            let moves = board.move_count();
            if moves == last_moves {
                stagnant += 1;
            } else {
                stagnant = 0;
                last_moves = moves;
            }
        };

        stop.store(true, Ordering::SeqCst);
        activity.pulse();
        for worker in workers {
            let _ = worker.join();
        }

        let unsettled = targets
            .iter()
            .enumerate()
            .filter(|&(index, &target)| board.position_of(AgentId(index as u32)) != target)
            .count();
        let report = SimReport {
            outcome,
            ticks,
            moves: board.move_count(),
            seed,
            unsettled,
        };
        match report.outcome {
            Outcome::Solved => info!(ticks = report.ticks, moves = report.moves, "run solved"),
            Outcome::Stalled | Outcome::TimedOut => warn!(
                outcome = ?report.outcome,
                unsettled = report.unsettled,
                moves = report.moves,
                "run did not complete"
            ),
        }
        Ok(report)
    }

    fn report(&self, outcome: Outcome, ticks: u64) -> SimReport {
        let unsettled = self
            .targets
            .iter()
            .enumerate()
            .filter(|&(index, &target)| self.board.position_of(AgentId(index as u32)) != target)
            .count();
        SimReport {
            outcome,
            ticks,
            moves: self.board.move_count(),
            seed: self.seed,
            unsettled,
        }
    }
}
