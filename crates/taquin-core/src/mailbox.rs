//! Asynchronous negotiation messages and per-agent delivery slots.
//!
//! Delivery is fire-and-forget: a send never waits for the receiver. Each
//! mailbox keeps at most one pending message per sender; a collision keeps
//! whichever message carries the numerically lower (= higher) priority, and
//! entries persist until the owner explicitly removes them, so unresolved
//! requests are re-examined every tick.

use crate::AgentId;
use crate::board::Activity;
use crate::geometry::Cell;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// A negotiation message. Immutable once sent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Message {
    /// Ask the receiver to vacate along `chain` (receiver's own cell first),
    /// relaying the remainder hop-by-hop if the next cell is taken.
    GiveWay { chain: Vec<Cell>, priority: AgentId },
    /// Ask a lane dependency to step aside so the sender can take its target.
    LetsTurn { priority: AgentId },
    /// Close out a previously received request; doubles as the unblock signal.
    Ack,
}

impl Message {
    /// Slot-contention rank: numerically lower wins. Acks rank above every
    /// request so the unblock signal can never be displaced by one.
    fn rank(&self) -> u64 {
        match self {
            Self::Ack => 0,
            Self::GiveWay { priority, .. } | Self::LetsTurn { priority } => {
                u64::from(priority.0) + 1
            }
        }
    }
}

/// Pending messages of one agent, keyed by sender.
///
/// Written by other agents' sends, read and cleared only by the owner; each
/// slot therefore needs nothing heavier than the single map lock.
#[derive(Debug, Default)]
pub struct Mailbox {
    slots: Mutex<HashMap<AgentId, Message>>,
}

impl Mailbox {
    fn slots(&self) -> MutexGuard<'_, HashMap<AgentId, Message>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deliver `message` from `sender`, resolving slot contention by rank.
    /// Equal ranks keep the existing entry.
    pub fn deliver(&self, sender: AgentId, message: Message) {
        let mut slots = self.slots();
        match slots.get(&sender) {
            Some(existing) if existing.rank() <= message.rank() => {
                debug!(sender = sender.0, "delivery shadowed by pending message");
            }
            _ => {
                slots.insert(sender, message);
            }
        }
    }

    /// Snapshot of pending entries, ordered by sender id.
    #[must_use]
    pub fn pending(&self) -> Vec<(AgentId, Message)> {
        let slots = self.slots();
        let mut entries: Vec<_> = slots
            .iter()
            .map(|(sender, message)| (*sender, message.clone()))
            .collect();
        drop(slots);
        entries.sort_by_key(|(sender, _)| *sender);
        entries
    }

    /// Remove the pending entry from `sender`. Removing an absent entry is a
    /// tolerated no-op.
    pub fn remove(&self, sender: AgentId) -> Option<Message> {
        self.slots().remove(&sender)
    }

    /// Whether a message from `sender` is pending.
    #[must_use]
    pub fn contains(&self, sender: AgentId) -> bool {
        self.slots().contains_key(&sender)
    }

    /// Whether nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots().is_empty()
    }
}

/// Delivery fabric: one mailbox per agent.
#[derive(Debug)]
pub struct MailRegistry {
    boxes: Vec<Mailbox>,
    activity: Arc<Activity>,
}

impl MailRegistry {
    /// Allocate mailboxes for `agent_count` agents.
    #[must_use]
    pub fn new(agent_count: usize, activity: Arc<Activity>) -> Self {
        Self {
            boxes: (0..agent_count).map(|_| Mailbox::default()).collect(),
            activity,
        }
    }

    /// Deliver `message` from `from` into `to`'s mailbox and pulse the wake
    /// signal. Never blocks on the receiver.
    pub fn send(&self, from: AgentId, to: AgentId, message: Message) {
        debug!(from = from.0, to = to.0, payload = ?message, "send");
        self.boxes[to.index()].deliver(from, message);
        self.activity.pulse();
    }

    /// The mailbox owned by `id`.
    #[must_use]
    pub fn mailbox(&self, id: AgentId) -> &Mailbox {
        &self.boxes[id.index()]
    }

    /// Whether every mailbox is drained.
    #[must_use]
    pub fn all_empty(&self) -> bool {
        self.boxes.iter().all(Mailbox::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn give_way(priority: u32) -> Message {
        Message::GiveWay {
            chain: vec![Cell(0), Cell(1)],
            priority: AgentId(priority),
        }
    }

    #[test]
    fn merge_keeps_higher_priority_request() {
        let mailbox = Mailbox::default();
        mailbox.deliver(AgentId(9), give_way(5));
        mailbox.deliver(AgentId(9), give_way(2));
        assert_eq!(mailbox.pending(), vec![(AgentId(9), give_way(2))]);

        // A lower-priority (higher-numbered) arrival is shadowed.
        mailbox.deliver(AgentId(9), give_way(7));
        assert_eq!(mailbox.pending(), vec![(AgentId(9), give_way(2))]);
    }

    #[test]
    fn equal_priorities_keep_the_existing_entry() {
        let mailbox = Mailbox::default();
        let first = Message::LetsTurn {
            priority: AgentId(3),
        };
        mailbox.deliver(AgentId(1), first.clone());
        mailbox.deliver(AgentId(1), give_way(3));
        assert_eq!(mailbox.pending(), vec![(AgentId(1), first)]);
    }

    #[test]
    fn ack_displaces_any_pending_request() {
        let mailbox = Mailbox::default();
        mailbox.deliver(AgentId(4), give_way(0));
        mailbox.deliver(AgentId(4), Message::Ack);
        assert_eq!(mailbox.pending(), vec![(AgentId(4), Message::Ack)]);
        // ...and nothing displaces an Ack.
        mailbox.deliver(AgentId(4), give_way(0));
        assert_eq!(mailbox.pending(), vec![(AgentId(4), Message::Ack)]);
    }

    #[test]
    fn senders_use_independent_slots() {
        let mailbox = Mailbox::default();
        mailbox.deliver(AgentId(1), give_way(6));
        mailbox.deliver(AgentId(2), give_way(4));
        assert_eq!(mailbox.pending().len(), 2);
        assert!(mailbox.contains(AgentId(1)));
        assert!(mailbox.contains(AgentId(2)));
    }

    #[test]
    fn removing_an_absent_entry_is_a_no_op() {
        let mailbox = Mailbox::default();
        assert!(mailbox.remove(AgentId(0)).is_none());
        assert!(mailbox.remove(AgentId(0)).is_none());
        assert!(mailbox.is_empty());
    }

    #[test]
    fn registry_routes_by_receiver() {
        let registry = MailRegistry::new(3, Arc::new(Activity::default()));
        registry.send(AgentId(0), AgentId(2), give_way(0));
        assert!(registry.mailbox(AgentId(1)).is_empty());
        assert!(registry.mailbox(AgentId(2)).contains(AgentId(0)));
        assert!(!registry.all_empty());
    }
}
