use serde_json::json;
use std::time::Instant;
use tracing::trace;

use crate::clock::LamportClock;
use crate::config::{NodeConfig, QuorumPolicy};
use crate::engine::{
    Ctx, Effects, ElectionEngine, ElectionTimings, MutexEngine, QuorumOutcome, RequestOutcome,
};
use crate::error::MutexError;
use crate::events::{EventType, NodeEvent};
use crate::metrics::MutexStats;
use crate::peers::PeerTable;
use crate::protocol::{Message, MessageKind, NodeId};

use super::status::NodeStatus;

/// Everything a node mutates, behind one lock.
///
/// Each method is one atomic transition and returns what it wants sent and
/// reported; nothing here performs I/O.
#[derive(Debug)]
pub struct NodeState {
    id: NodeId,
    clock: LamportClock,
    mutex: MutexEngine,
    election: ElectionEngine,
    stats: MutexStats,
    quorum_policy: QuorumPolicy,
    max_quorum_retries: u32,
}

impl NodeState {
    pub fn new(id: NodeId, config: &NodeConfig) -> Self {
        Self {
            id,
            clock: LamportClock::new(),
            mutex: MutexEngine::new(),
            election: ElectionEngine::new(ElectionTimings::from_config(config)),
            stats: MutexStats::new(),
            quorum_policy: config.quorum_policy,
            max_quorum_retries: config.max_quorum_retries,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn clock(&self) -> &LamportClock {
        &self.clock
    }

    pub fn mutex(&self) -> &MutexEngine {
        &self.mutex
    }

    pub fn election(&self) -> &ElectionEngine {
        &self.election
    }

    pub fn stats(&self) -> &MutexStats {
        &self.stats
    }

    /// A queued message the transport refused to take.
    pub fn record_dropped(&mut self, kind: MessageKind) {
        self.stats.record_dropped(kind);
    }

    fn transition<R>(
        &mut self,
        peers: &PeerTable,
        now: Instant,
        f: impl FnOnce(&mut MutexEngine, &mut ElectionEngine, &mut Ctx<'_>) -> R,
    ) -> (R, Effects) {
        let mut fx = Effects::new();
        let result = {
            let mut ctx = Ctx {
                id: self.id,
                clock: &mut self.clock,
                peers,
                now,
                fx: &mut fx,
            };
            f(&mut self.mutex, &mut self.election, &mut ctx)
        };
        for envelope in &fx.outbound {
            self.stats.record_sent(envelope.message.kind);
        }
        if let Some(waited) = fx.entered_cs {
            self.stats.record_entry(waited);
        }
        (result, fx)
    }

    fn stats_event(&self, outcome: &str) -> NodeEvent {
        let mut details = self.stats.to_json();
        details["outcome"] = json!(outcome);
        NodeEvent::new(EventType::MutexStats, self.id, self.clock.current(), details)
    }

    /// Merge the sender's clock and route the message to its engine.
    pub fn handle_message(&mut self, message: &Message, peers: &PeerTable, now: Instant) -> Effects {
        let sender = message.sender;
        let kind = message.kind;
        trace!(node = self.id, peer = sender, "Received {} @{}", kind, message.timestamp);

        let ((), fx) = self.transition(peers, now, |mutex, election, ctx| {
            let previous = ctx.clock.current();
            ctx.clock.observe(message.timestamp);
            ctx.event(
                EventType::ClockUpdate,
                json!({
                    "from": sender,
                    "type": kind,
                    "received": message.timestamp,
                    "previous": previous,
                }),
            );
            match kind {
                MessageKind::Request => mutex.on_request(ctx, sender, message.effective_request_clock()),
                MessageKind::Reply => {
                    mutex.on_reply(ctx, sender, message.request_clock);
                }
                MessageKind::Election => election.on_election(ctx, sender),
                MessageKind::Answer => election.on_answer(ctx, sender),
                MessageKind::Coordinator => election.on_coordinator(ctx, sender, message.timestamp),
                MessageKind::Heartbeat => election.on_heartbeat(ctx, sender, message.timestamp),
            }
        });
        self.stats.record_received(kind);
        fx
    }

    pub fn request_cs(
        &mut self,
        peers: &PeerTable,
        now: Instant,
    ) -> (Result<RequestOutcome, MutexError>, Effects) {
        let (outcome, fx) = self.transition(peers, now, |mutex, _, ctx| mutex.request(ctx));
        if outcome.is_ok() {
            self.stats.record_request();
        }
        (outcome, fx)
    }

    pub fn exit_cs(&mut self, peers: &PeerTable, now: Instant) -> (Result<usize, MutexError>, Effects) {
        let (sent, mut fx) = self.transition(peers, now, |mutex, _, ctx| mutex.exit(ctx));
        if let Ok(count) = sent {
            self.stats.record_exit(count);
            fx.events.push(self.stats_event("exit"));
        }
        (sent, fx)
    }

    /// The reply wait for the outstanding request expired.
    pub fn reply_timeout(&mut self, peers: &PeerTable, now: Instant) -> (QuorumOutcome, Effects) {
        let policy = self.quorum_policy;
        let max_retries = self.max_quorum_retries;
        let (outcome, mut fx) = self.transition(peers, now, |mutex, _, ctx| {
            mutex.on_reply_timeout(ctx, policy, max_retries)
        });
        match outcome {
            QuorumOutcome::Retried { .. } => self.stats.record_retry(),
            QuorumOutcome::Abandoned => {
                self.stats.record_timeout();
                fx.events.push(self.stats_event("quorum_timeout"));
            }
            QuorumOutcome::Settled => {}
        }
        (outcome, fx)
    }

    pub fn start_election(&mut self, peers: &PeerTable, now: Instant) -> (bool, Effects) {
        self.transition(peers, now, |_, election, ctx| election.start_election(ctx))
    }

    /// Start an election only if no coordinator is known yet.
    pub fn bootstrap(&mut self, peers: &PeerTable, now: Instant) -> (bool, Effects) {
        self.transition(peers, now, |_, election, ctx| {
            election.coordinator().is_none() && election.start_election(ctx)
        })
    }

    pub fn tick(&mut self, peers: &PeerTable, now: Instant) -> Effects {
        self.transition(peers, now, |_, election, ctx| election.on_tick(ctx)).1
    }

    pub fn heartbeat(&mut self, peers: &PeerTable, now: Instant) -> (usize, Effects) {
        self.transition(peers, now, |_, election, ctx| election.heartbeat(ctx))
    }

    pub fn peer_down(&mut self, peer: NodeId, reason: &str, peers: &PeerTable, now: Instant) -> Effects {
        self.transition(peers, now, |mutex, _, ctx| {
            ctx.event(EventType::NodeDown, json!({ "peer": peer, "reason": reason }));
            mutex.on_peer_down(ctx, peer);
        })
        .1
    }

    pub fn peer_up(&mut self, peer: NodeId, peers: &PeerTable, now: Instant) -> Effects {
        self.transition(peers, now, |mutex, _, ctx| mutex.on_peer_up(ctx, peer)).1
    }

    pub fn status(&self, peers: &PeerTable) -> NodeStatus {
        NodeStatus {
            node_id: self.id,
            clock: self.clock.current(),
            mutex_state: self.mutex.state(),
            request_clock: self.mutex.request_clock(),
            awaiting: self.mutex.awaiting(),
            replies: self.mutex.replies(),
            deferred: self.mutex.deferred().into_iter().map(|(id, _)| id).collect(),
            election_state: self.election.state(),
            coordinator: self.election.coordinator(),
            peers: peers.snapshot(),
            stats: self.stats.clone(),
        }
    }
}
