//! Core of the taquin simulation: N²−1 autonomous agents on an N×N grid with
//! a single free cell, each sliding toward a fixed target cell without any
//! central scheduler. Agents move through a shared [`board::Board`], rank
//! candidate cells with the [`geometry`] helpers, search routes with the
//! [`path`] module, and resolve mutual blockage through the give-way /
//! let's-turn protocol carried by [`mailbox`] messages.

use rand::{SeedableRng, rngs::SmallRng};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub mod actuator;
pub mod agent;
pub mod board;
pub mod geometry;
pub mod mailbox;
pub mod path;
pub mod sim;

pub use actuator::Actuator;
pub use agent::{Agent, Policy};
pub use board::{Activity, Board};
pub use geometry::Cell;
pub use mailbox::{MailRegistry, Mailbox, Message};
pub use path::NoPathFound;
pub use sim::{Outcome, SimReport, Simulation};

/// Agent identity. Also serves as the negotiation priority: a numerically
/// lower id outranks a higher one, and give-way requests only ever flow
/// toward strictly greater ids.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
)]
pub struct AgentId(pub u32);

impl AgentId {
    /// Index into per-agent arrays.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors raised while validating configuration or placing agents.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SetupError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// A cell was assigned to more than one agent.
    #[error("cell {0} assigned twice")]
    DuplicateCell(u32),
    /// A cell index falls outside the grid.
    #[error("cell {cell} outside the {side}x{side} grid")]
    OutOfBounds { cell: u32, side: u32 },
    /// Layout vectors do not agree on the number of agents.
    #[error("expected {expected} agents, got {actual}")]
    WrongAgentCount { expected: usize, actual: usize },
}

/// Static configuration for a taquin run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaquinConfig {
    /// Grid side length N; the board holds N² cells and N²−1 agents.
    pub side: u32,
    /// Optional RNG seed for reproducible placements and tie-breaking.
    pub rng_seed: Option<u64>,
    /// Movement policy applied to every agent.
    pub policy: Policy,
    /// Agent poll cadence in milliseconds when running threaded.
    pub tick_interval_ms: u64,
    /// Driver scheduling-tick ceiling; 0 runs unbounded.
    pub max_ticks: u64,
    /// Driver ticks without a successful move before the run is declared
    /// stalled; 0 disables the stagnation cutoff.
    pub stall_patience: u64,
}

impl Default for TaquinConfig {
    fn default() -> Self {
        Self {
            side: 4,
            rng_seed: None,
            policy: Policy::Interactive,
            tick_interval_ms: 20,
            max_ticks: 20_000,
            stall_patience: 400,
        }
    }
}

impl TaquinConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), SetupError> {
        if self.side < 2 {
            return Err(SetupError::InvalidConfig("side must be at least 2"));
        }
        if self.side > 256 {
            return Err(SetupError::InvalidConfig("side must be at most 256"));
        }
        if self.tick_interval_ms == 0 {
            return Err(SetupError::InvalidConfig(
                "tick_interval_ms must be non-zero",
            ));
        }
        Ok(())
    }

    /// Number of cells on the board.
    #[must_use]
    pub const fn cell_count(&self) -> u32 {
        self.side * self.side
    }

    /// Conventional agent population: one per cell bar the free one.
    #[must_use]
    pub const fn agent_count(&self) -> usize {
        (self.side * self.side - 1) as usize
    }

    /// Returns the configured seed, generating one from entropy if absent.
    #[must_use]
    pub fn seed(&self) -> u64 {
        self.rng_seed.unwrap_or_else(rand::random)
    }

    /// RNG stream for setup decisions (placement, target shuffling).
    #[must_use]
    pub fn seeded_rng(&self, seed: u64) -> SmallRng {
        SmallRng::seed_from_u64(seed)
    }

    /// Per-agent RNG stream, decorrelated from the setup stream.
    #[must_use]
    pub fn agent_rng(&self, seed: u64, id: AgentId) -> SmallRng {
        SmallRng::seed_from_u64(seed ^ (0x9E37_79B9_7F4A_7C15_u64.wrapping_mul(u64::from(id.0) + 1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        TaquinConfig::default().validate().expect("default config");
    }

    #[test]
    fn degenerate_sides_rejected() {
        let config = TaquinConfig {
            side: 1,
            ..TaquinConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(SetupError::InvalidConfig("side must be at least 2"))
        );
    }

    #[test]
    fn seeded_streams_are_reproducible() {
        use rand::RngCore;

        let config = TaquinConfig {
            rng_seed: Some(7),
            ..TaquinConfig::default()
        };
        let seed = config.seed();
        assert_eq!(seed, 7);
        let mut a = config.agent_rng(seed, AgentId(3));
        let mut b = config.agent_rng(seed, AgentId(3));
        assert_eq!(a.next_u64(), b.next_u64());

        let mut c = config.agent_rng(seed, AgentId(4));
        assert_ne!(a.next_u64(), c.next_u64());
    }
}
