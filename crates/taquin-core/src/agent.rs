//! The per-agent decision loop and the give-way negotiation protocol.
//!
//! Each scheduling tick an agent first drains its mailbox (negotiation takes
//! strict priority over self-directed movement), then tries to make progress
//! toward its current leg, then checks whether it can settle. `Stuck` and
//! `Waiting` are recoverable: any successful move anywhere clears `stuck`,
//! and an acknowledgement clears `waiting`. Only `Ended` idles a thread, and
//! even that is revoked when new negotiation mail arrives, so a finished
//! agent can still be asked to step aside.

use crate::AgentId;
use crate::actuator::Actuator;
use crate::board::Board;
use crate::geometry::{self, Cell, NeighborList};
use crate::mailbox::{MailRegistry, Message};
use crate::path;
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Movement policy applied by an agent when it is free to act.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Policy {
    /// Step into a random strictly-closer empty neighbor, or go stuck.
    Greedy,
    /// Walk a shortest path through empty cells, or go stuck.
    Dijkstra,
    /// Full negotiation: greedy descent, give-way requests, lane actuators.
    #[default]
    Interactive,
}

/// One autonomous agent bound to a shared board and mail fabric.
pub struct Agent {
    id: AgentId,
    target: Cell,
    policy: Policy,
    actuator: Actuator,
    board: Arc<Board>,
    mail: Arc<MailRegistry>,
    sent: HashSet<AgentId>,
    parked: bool,
    rng: SmallRng,
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("policy", &self.policy)
            .field("actuator", &self.actuator)
            .finish()
    }
}

impl Agent {
    /// Wire up an agent. Placement on the board happens separately, through
    /// the simulation builder.
    #[must_use]
    pub fn new(
        id: AgentId,
        target: Cell,
        policy: Policy,
        actuator: Actuator,
        board: Arc<Board>,
        mail: Arc<MailRegistry>,
        rng: SmallRng,
    ) -> Self {
        Self {
            id,
            target,
            policy,
            actuator,
            board,
            mail,
            sent: HashSet::new(),
            parked: false,
            rng,
        }
    }

    #[must_use]
    pub const fn id(&self) -> AgentId {
        self.id
    }

    #[must_use]
    pub const fn target(&self) -> Cell {
        self.target
    }

    #[must_use]
    pub fn position(&self) -> Cell {
        self.board.position_of(self.id)
    }

    /// One scheduling tick. Returns true while the agent is settled on its
    /// target with nothing pending.
    pub fn step(&mut self) -> bool {
        if self.board.is_ended(self.id) {
            if self.mail.mailbox(self.id).is_empty() {
                // A settled lane agent may still be handed the token; pass
                // it straight along so the ring keeps turning.
                self.pass_token_if_due();
                return true;
            }
            // Fresh negotiation mail re-opens a finished agent.
            self.board.set_ended(self.id, false);
        }

        let negotiated = self.handle_messages();

        let held_up = self.board.is_stuck(self.id)
            || self.board.is_waiting(self.id)
            || self.board.is_ended(self.id);
        if !negotiated && !held_up && self.holds_turn() {
            self.act();
        }

        self.completion_check()
    }

    /// Staged actuators only act while they hold the lane turn token.
    fn holds_turn(&self) -> bool {
        !self.actuator.is_staged() || self.board.token() == self.id
    }

    fn act(&mut self) {
        match self.policy {
            Policy::Greedy => self.act_greedy(),
            Policy::Dijkstra => self.act_dijkstra(),
            Policy::Interactive => self.act_interactive(),
        }
    }

    fn act_greedy(&mut self) {
        let position = self.position();
        if position == self.target {
            return;
        }
        let mut closers = geometry::closer_neighbors(position, self.target, self.board.side(), |c| {
            self.board.neighbors(c)
        });
        if closers.is_empty() {
            self.board.set_stuck(self.id, true);
            return;
        }
        closers.as_mut_slice().shuffle(&mut self.rng);
        self.board.try_move(self.id, closers[0]);
    }

    fn act_dijkstra(&mut self) {
        let position = self.position();
        if position == self.target {
            return;
        }
        match path::shortest_path(position, self.target, |c| self.board.neighbors(c)) {
            Ok(route) if route.len() >= 2 => {
                self.board.try_move(self.id, route[1]);
            }
            Ok(_) => {}
            Err(_) => self.board.set_stuck(self.id, true),
        }
    }

    fn act_interactive(&mut self) {
        let position = self.position();
        match &self.actuator {
            Actuator::Direct => {
                if position != self.target {
                    self.move_or_negotiate(self.target, self.id);
                }
            }
            Actuator::StagedSecondary { target_bis, .. } => {
                let target_bis = *target_bis;
                if position == self.target || position == target_bis {
                    // Parked; the hand-off arrives by mail.
                } else if self.parked {
                    self.move_or_negotiate(self.target, self.id);
                } else {
                    self.move_or_negotiate(target_bis, self.id);
                }
            }
            Actuator::StagedPrimary { target_bis, .. } => {
                let target_bis = *target_bis;
                if position == self.target {
                } else if position == target_bis {
                    self.request_turn();
                } else if self.parked {
                    self.move_or_negotiate(self.target, self.id);
                } else {
                    self.move_or_negotiate(target_bis, self.id);
                }
            }
        }
    }

    /// Greedy descent toward `goal` through any occupancy: real move attempts
    /// on the empty candidates first, then at most one give-way request to an
    /// eligible occupant. Returns whether the agent moved.
    fn move_or_negotiate(&mut self, goal: Cell, priority: AgentId) -> bool {
        let position = self.position();
        let closers = geometry::closer_neighbors(position, goal, self.board.side(), |c| {
            self.board.all_neighbors(c)
        });
        if closers.is_empty() {
            // Nothing improves under the current adjacency.
            self.board.set_stuck(self.id, true);
            return false;
        }

        let mut empty: NeighborList = NeighborList::new();
        let mut occupied: NeighborList = NeighborList::new();
        for &cell in &closers {
            if self.board.is_empty(cell) {
                empty.push(cell);
            } else {
                occupied.push(cell);
            }
        }

        empty.as_mut_slice().shuffle(&mut self.rng);
        for &cell in &empty {
            if self.board.try_move(self.id, cell) {
                return true;
            }
        }

        self.board.set_stuck(self.id, true);
        occupied.as_mut_slice().shuffle(&mut self.rng);
        for &cell in &occupied {
            // The occupant may have left since partitioning; then this cell
            // is simply no longer a negotiation target.
            let Some(occupant) = self.board.occupant(cell) else {
                continue;
            };
            if self.mail.mailbox(self.id).contains(occupant) || self.sent.contains(&occupant) {
                continue;
            }
            if occupant <= priority {
                // Requests only ever flow toward strictly higher ids; this
                // keeps the wait-for graph acyclic.
                continue;
            }
            self.send_give_way(occupant, priority);
            return false;
        }
        false
    }

    /// Plan a yield path for `receiver` and send it as a give-way request:
    /// route from the receiver's cell to the nearest empty cell, passing only
    /// through cells that are empty or held by agents outranked by
    /// `priority`, never through the requester.
    fn send_give_way(&mut self, receiver: AgentId, priority: AgentId) {
        let receiver_position = self.board.position_of(receiver);
        let mut refuges = self.board.nearest_empty(receiver_position);
        if refuges.is_empty() {
            return;
        }
        refuges.shuffle(&mut self.rng);
        let refuge = refuges[0];

        let requester = self.id;
        let board = Arc::clone(&self.board);
        let passable = move |cell: Cell| -> NeighborList {
            board.neighbors_with(cell, |c| match board.occupant(c) {
                None => true,
                Some(other) => other != requester && other > priority,
            })
        };
        match path::shortest_path(receiver_position, refuge, passable) {
            Ok(chain) if chain.len() >= 2 => {
                self.sent.insert(receiver);
                self.board.set_waiting(self.id, true);
                self.mail
                    .send(self.id, receiver, Message::GiveWay { chain, priority });
            }
            Ok(_) | Err(_) => {
                debug!(agent = self.id.0, receiver = receiver.0, "no yield path");
            }
        }
    }

    /// A staged primary parked on `target_bis` asks the occupant of its true
    /// target for a turn; with the target already free it just walks in.
    fn request_turn(&mut self) {
        match self.board.occupant(self.target) {
            Some(occupant) => {
                if self.sent.contains(&occupant) {
                    return;
                }
                self.sent.insert(occupant);
                self.board.set_waiting(self.id, true);
                self.mail
                    .send(self.id, occupant, Message::LetsTurn { priority: self.id });
            }
            None => {
                self.move_or_negotiate(self.target, self.id);
            }
        }
    }

    /// Drain every pending mailbox entry. Handlers decide whether an entry is
    /// consumed; unresolved requests stay for the next tick. Returns whether
    /// any mail was pending: a negotiation tick suppresses self-directed
    /// movement, leaving a vacated cell up for grabs for at least one tick.
    fn handle_messages(&mut self) -> bool {
        let pending = self.mail.mailbox(self.id).pending();
        let negotiated = !pending.is_empty();
        for (sender, message) in pending {
            match message {
                Message::Ack => self.on_ack(sender),
                Message::GiveWay { chain, priority } => self.on_give_way(sender, chain, priority),
                Message::LetsTurn { priority } => self.on_lets_turn(sender, priority),
            }
        }
        negotiated
    }

    fn on_ack(&mut self, sender: AgentId) {
        self.mail.mailbox(self.id).remove(sender);
        self.sent.remove(&sender);
        if self.sent.is_empty() {
            self.board.set_waiting(self.id, false);
        }
        self.board.set_stuck(self.id, false);
    }

    fn on_give_way(&mut self, sender: AgentId, chain: Vec<Cell>, priority: AgentId) {
        if self.board.is_waiting(self.id) {
            return;
        }
        let position = self.position();
        if chain.len() < 2 || chain[0] != position {
            // Stale or irrelevant request.
            self.ack(sender);
            return;
        }
        let next_cell = chain[1];
        match self.board.occupant(next_cell) {
            None => {
                if self.board.try_move(self.id, next_cell) {
                    self.ack(sender);
                }
                // Lost the cell to a race: the request stays pending and is
                // retried next tick.
            }
            Some(occupant) => {
                if occupant == sender || self.sent.contains(&occupant) {
                    return;
                }
                // Relay the remainder one hop down the precomputed path; the
                // originator is acked once our own move eventually lands.
                self.sent.insert(occupant);
                self.board.set_waiting(self.id, true);
                self.mail.send(
                    self.id,
                    occupant,
                    Message::GiveWay {
                        chain: chain[1..].to_vec(),
                        priority,
                    },
                );
            }
        }
    }

    fn on_lets_turn(&mut self, sender: AgentId, priority: AgentId) {
        if self.board.is_waiting(self.id) {
            return;
        }
        // Step toward our own target through any occupancy, requesting on the
        // sender's priority where blocked; the sender is acked only once our
        // position actually changed.
        if self.move_or_negotiate(self.target, priority) {
            self.ack(sender);
        }
    }

    /// Consume `receiver`'s pending request and acknowledge it.
    fn ack(&mut self, receiver: AgentId) {
        self.mail.mailbox(self.id).remove(receiver);
        self.mail.send(self.id, receiver, Message::Ack);
    }

    /// Settle when the actuator reports completion: on the true target with
    /// nothing pending the agent ends; a staged holder of the turn token
    /// passes it along.
    fn completion_check(&mut self) -> bool {
        let position = self.position();
        if !self.actuator.can_end(position, self.target) {
            return false;
        }
        self.parked = true;
        let waiting = self.board.is_waiting(self.id);
        if position == self.target
            && !waiting
            && self.sent.is_empty()
            && self.mail.mailbox(self.id).is_empty()
        {
            self.board.set_stuck(self.id, false);
            self.board.set_ended(self.id, true);
        }
        if !waiting {
            self.pass_token_if_due();
        }
        self.board.is_ended(self.id)
    }

    fn pass_token_if_due(&self) {
        if !self.board.is_waiting(self.id)
            && self.actuator.is_staged()
            && self.board.token() == self.id
            && let Some(next) = self.actuator.next()
        {
            self.board.advance_token(next);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::Activity;
    use rand::SeedableRng;

    struct Rig {
        board: Arc<Board>,
        mail: Arc<MailRegistry>,
    }

    fn rig(side: u32, agents: usize) -> Rig {
        let activity = Arc::new(Activity::default());
        Rig {
            board: Arc::new(Board::new(side, agents, Arc::clone(&activity))),
            mail: Arc::new(MailRegistry::new(agents, activity)),
        }
    }

    fn agent(rig: &Rig, id: u32, target: Cell, actuator: Actuator) -> Agent {
        Agent::new(
            AgentId(id),
            target,
            Policy::Interactive,
            actuator,
            Arc::clone(&rig.board),
            Arc::clone(&rig.mail),
            SmallRng::seed_from_u64(u64::from(id)),
        )
    }

    #[test]
    fn agent_walks_into_a_closer_free_cell() {
        let rig = rig(3, 1);
        rig.board.place(AgentId(0), Cell(0));
        let mut mover = agent(&rig, 0, Cell(8), Actuator::Direct);
        assert!(!mover.step());
        let position = mover.position();
        assert!(position == Cell(1) || position == Cell(3));
    }

    #[test]
    fn agent_settles_on_its_target() {
        let rig = rig(3, 1);
        rig.board.place(AgentId(0), Cell(4));
        let mut mover = agent(&rig, 0, Cell(4), Actuator::Direct);
        assert!(mover.step());
        assert!(rig.board.is_ended(AgentId(0)));
    }

    #[test]
    fn blocked_agent_goes_stuck_and_requests_a_give_way() {
        let rig = rig(2, 3);
        // 0 in the corner wants the opposite corner; both improving cells
        // are taken by higher ids, the free cell is the goal itself.
        rig.board.place(AgentId(0), Cell(0));
        rig.board.place(AgentId(1), Cell(1));
        rig.board.place(AgentId(2), Cell(2));
        let mut mover = agent(&rig, 0, Cell(3), Actuator::Direct);
        assert!(!mover.step());
        assert!(rig.board.is_stuck(AgentId(0)));
        assert!(rig.board.is_waiting(AgentId(0)));
        let asked_one = rig.mail.mailbox(AgentId(1)).contains(AgentId(0));
        let asked_two = rig.mail.mailbox(AgentId(2)).contains(AgentId(0));
        assert!(
            asked_one ^ asked_two,
            "exactly one occupant receives the request"
        );
    }

    #[test]
    fn requests_never_flow_toward_lower_ids() {
        let rig = rig(2, 3);
        // Same shape as above but the blocked agent outnumbers everyone.
        rig.board.place(AgentId(2), Cell(0));
        rig.board.place(AgentId(0), Cell(1));
        rig.board.place(AgentId(1), Cell(2));
        let mut mover = agent(&rig, 2, Cell(3), Actuator::Direct);
        assert!(!mover.step());
        assert!(rig.board.is_stuck(AgentId(2)));
        assert!(!rig.board.is_waiting(AgentId(2)), "nobody eligible to ask");
        assert!(rig.mail.mailbox(AgentId(0)).is_empty());
        assert!(rig.mail.mailbox(AgentId(1)).is_empty());
    }

    #[test]
    fn stale_give_way_is_acked_immediately() {
        let rig = rig(3, 2);
        rig.board.place(AgentId(0), Cell(0));
        rig.board.place(AgentId(1), Cell(4));
        let mut receiver = agent(&rig, 1, Cell(8), Actuator::Direct);
        // Chain head does not match the receiver's position.
        rig.mail.send(
            AgentId(0),
            AgentId(1),
            Message::GiveWay {
                chain: vec![Cell(5), Cell(2)],
                priority: AgentId(0),
            },
        );
        receiver.step();
        assert!(rig.mail.mailbox(AgentId(1)).is_empty());
        assert_eq!(
            rig.mail.mailbox(AgentId(0)).pending(),
            vec![(AgentId(1), Message::Ack)]
        );
        assert_eq!(receiver.position(), Cell(4), "no movement on a stale chain");
    }

    #[test]
    fn give_way_moves_and_acks_when_the_next_cell_is_free() {
        let rig = rig(3, 2);
        rig.board.place(AgentId(0), Cell(0));
        rig.board.place(AgentId(1), Cell(1));
        let mut receiver = agent(&rig, 1, Cell(4), Actuator::Direct);
        rig.mail.send(
            AgentId(0),
            AgentId(1),
            Message::GiveWay {
                chain: vec![Cell(1), Cell(2)],
                priority: AgentId(0),
            },
        );
        receiver.step();
        assert_eq!(receiver.position(), Cell(2));
        assert_eq!(
            rig.mail.mailbox(AgentId(0)).pending(),
            vec![(AgentId(1), Message::Ack)]
        );
        assert!(
            rig.mail.mailbox(AgentId(1)).is_empty(),
            "request consumed by the ack"
        );
    }

    #[test]
    fn give_way_is_relayed_one_hop_when_the_next_cell_is_taken() {
        let rig = rig(3, 3);
        rig.board.place(AgentId(0), Cell(0));
        rig.board.place(AgentId(1), Cell(1));
        rig.board.place(AgentId(2), Cell(2));
        let mut middle = agent(&rig, 1, Cell(4), Actuator::Direct);
        rig.mail.send(
            AgentId(0),
            AgentId(1),
            Message::GiveWay {
                chain: vec![Cell(1), Cell(2), Cell(5)],
                priority: AgentId(0),
            },
        );
        middle.step();
        assert_eq!(middle.position(), Cell(1), "relay does not move the middle");
        assert!(rig.board.is_waiting(AgentId(1)));
        assert_eq!(
            rig.mail.mailbox(AgentId(2)).pending(),
            vec![(
                AgentId(1),
                Message::GiveWay {
                    chain: vec![Cell(2), Cell(5)],
                    priority: AgentId(0),
                }
            )]
        );
        // The original request is still pending on the middle agent.
        assert!(rig.mail.mailbox(AgentId(1)).contains(AgentId(0)));
    }

    #[test]
    fn ack_clears_waiting_and_stuck() {
        let rig = rig(2, 3);
        rig.board.place(AgentId(0), Cell(0));
        rig.board.place(AgentId(1), Cell(1));
        rig.board.place(AgentId(2), Cell(2));
        let mut mover = agent(&rig, 0, Cell(3), Actuator::Direct);
        mover.step();
        assert!(rig.board.is_stuck(AgentId(0)));
        assert!(rig.board.is_waiting(AgentId(0)));

        // The patron vacates its cell and acknowledges.
        let patron = if rig.mail.mailbox(AgentId(1)).contains(AgentId(0)) {
            AgentId(1)
        } else {
            AgentId(2)
        };
        assert!(rig.board.try_move(patron, Cell(3)));
        rig.mail.send(patron, AgentId(0), Message::Ack);

        mover.step();
        assert!(!rig.board.is_waiting(AgentId(0)));
        assert!(!rig.board.is_stuck(AgentId(0)));

        // Unblocked, the next tick makes real progress.
        mover.step();
        assert_ne!(mover.position(), Cell(0));
    }

    #[test]
    fn lets_turn_receiver_acks_only_after_moving() {
        let rig = rig(3, 3);
        // Secondary parked on the lane edge (2, 1); its target (1, 1) is
        // free, the primary waits below.
        rig.board.place(AgentId(1), Cell(5));
        rig.board.place(AgentId(2), Cell(8));
        let mut master = agent(
            &rig,
            1,
            Cell(4),
            Actuator::StagedSecondary {
                target_bis: Cell(5),
                next: AgentId(2),
            },
        );
        rig.mail.send(
            AgentId(2),
            AgentId(1),
            Message::LetsTurn {
                priority: AgentId(2),
            },
        );
        master.step();
        assert_eq!(master.position(), Cell(4));
        assert_eq!(
            rig.mail.mailbox(AgentId(2)).pending(),
            vec![(AgentId(1), Message::Ack)]
        );
        assert!(rig.board.is_ended(AgentId(1)), "reached its true target");
    }

    #[test]
    fn finished_agent_is_reopened_by_mail() {
        let rig = rig(3, 2);
        rig.board.place(AgentId(0), Cell(0));
        rig.board.place(AgentId(1), Cell(1));
        let mut settled = agent(&rig, 1, Cell(1), Actuator::Direct);
        assert!(settled.step());
        assert!(rig.board.is_ended(AgentId(1)));

        rig.mail.send(
            AgentId(0),
            AgentId(1),
            Message::GiveWay {
                chain: vec![Cell(1), Cell(2)],
                priority: AgentId(0),
            },
        );
        assert!(!settled.step(), "agent re-opens, moves, and is off-target");
        assert_eq!(settled.position(), Cell(2));
        assert!(!rig.board.is_ended(AgentId(1)));
    }
}
