//! Protocol engines
//!
//! Pure state machines for the coordination protocols:
//! - Ricart-Agrawala mutual exclusion
//! - Bully leader election with heartbeat failure detection
//!
//! Engines never touch sockets or sinks. Each transition writes the messages
//! it wants sent and the events it wants reported into an [`Effects`]
//! buffer, which the node flushes once its state lock is released.

pub mod election;
pub mod mutex;

use std::time::{Duration, Instant};
use tracing::debug;

use crate::clock::LamportClock;
use crate::events::{EventType, NodeEvent};
use crate::peers::PeerTable;
use crate::protocol::{ClockValue, Message, MessageKind, NodeId};

pub use election::{ElectionEngine, ElectionState, ElectionTimings};
pub use mutex::{MutexEngine, MutexState, QuorumOutcome, RequestOutcome};

/// A message addressed to one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub to: NodeId,
    pub message: Message,
}

/// Output of one atomic state transition.
#[derive(Debug, Default)]
pub struct Effects {
    pub outbound: Vec<Envelope>,
    pub events: Vec<NodeEvent>,
    /// Set when the transition moved the mutex into HELD; carries how long
    /// the request waited.
    pub entered_cs: Option<Duration>,
}

impl Effects {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self, kind: MessageKind) -> impl Iterator<Item = &Envelope> + '_ {
        self.outbound.iter().filter(move |e| e.message.kind == kind)
    }

    pub fn has_event(&self, event_type: EventType) -> bool {
        self.events.iter().any(|e| e.event_type == event_type)
    }

    pub fn append(&mut self, mut other: Effects) {
        self.outbound.append(&mut other.outbound);
        self.events.append(&mut other.events);
        if other.entered_cs.is_some() {
            self.entered_cs = other.entered_cs;
        }
    }
}

/// Everything an engine may read or write during one transition.
pub struct Ctx<'a> {
    pub id: NodeId,
    pub clock: &'a mut LamportClock,
    pub peers: &'a PeerTable,
    pub now: Instant,
    pub fx: &'a mut Effects,
}

impl<'a> Ctx<'a> {
    /// Tick the clock and queue a message. A peer marked down gets nothing
    /// and the clock does not move.
    pub fn send(&mut self, to: NodeId, kind: MessageKind, request_clock: Option<ClockValue>) -> bool {
        if !self.peers.is_alive(to) {
            debug!(node = self.id, peer = to, "Skipping {} to peer marked down", kind);
            return false;
        }
        let timestamp = self.clock.tick();
        self.push(to, kind, timestamp, request_clock);
        true
    }

    /// Queue a message carrying an already-ticked timestamp, for a broadcast
    /// that counts as one local event.
    pub fn send_stamped(
        &mut self,
        to: NodeId,
        kind: MessageKind,
        timestamp: ClockValue,
        request_clock: Option<ClockValue>,
    ) -> bool {
        if !self.peers.is_alive(to) {
            debug!(node = self.id, peer = to, "Skipping {} to peer marked down", kind);
            return false;
        }
        self.push(to, kind, timestamp, request_clock);
        true
    }

    fn push(&mut self, to: NodeId, kind: MessageKind, timestamp: ClockValue, request_clock: Option<ClockValue>) {
        let mut message = Message::new(self.id, kind, timestamp);
        message.request_clock = request_clock;
        self.event(
            EventType::SendMessage,
            serde_json::json!({"to": to, "type": kind, "timestamp": timestamp}),
        );
        self.fx.outbound.push(Envelope { to, message });
    }

    pub fn event(&mut self, event_type: EventType, details: serde_json::Value) {
        self.fx
            .events
            .push(NodeEvent::new(event_type, self.id, self.clock.current(), details));
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::config::{PeerAddress, PeerMap};

    pub fn members(n: NodeId) -> PeerMap {
        (1..=n)
            .map(|id| (id, PeerAddress::new("127.0.0.1", 7000 + id as u16)))
            .collect()
    }

    pub fn table(self_id: NodeId, n: NodeId) -> PeerTable {
        PeerTable::new(self_id, &members(n)).expect("self is a member")
    }

    pub fn targets(fx: &Effects, kind: MessageKind) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = fx.sent(kind).map(|e| e.to).collect();
        ids.sort_unstable();
        ids
    }
}
