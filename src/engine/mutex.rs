//! Ricart-Agrawala mutual exclusion.
//!
//! A node enters the critical section only after every peer that could
//! contend has replied to its REQUEST. Contention is resolved by the total
//! order on `(request_clock, node_id)`: the node holding the smaller pair
//! defers its reply until it leaves the section.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::Ctx;
use crate::config::QuorumPolicy;
use crate::error::MutexError;
use crate::events::EventType;
use crate::protocol::{ClockValue, MessageKind, NodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MutexState {
    Released,
    Wanted,
    Held,
}

impl fmt::Display for MutexState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MutexState::Released => "RELEASED",
            MutexState::Wanted => "WANTED",
            MutexState::Held => "HELD",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    /// No peer could contend; the section is already held.
    Acquired,
    /// REQUEST went out; waiting on these peers.
    Pending { awaiting: Vec<NodeId> },
}

/// Result of a reply-wait expiring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuorumOutcome {
    /// Nothing to do: the request was already granted (or is gone).
    Settled,
    /// REQUEST was re-sent to the recomputed awaited set.
    Retried { awaiting: Vec<NodeId> },
    /// The request was dropped and the node is RELEASED again.
    Abandoned,
}

#[derive(Debug)]
pub struct MutexEngine {
    state: MutexState,
    request_clock: ClockValue,
    /// Peers whose REPLY is still needed for the current request
    awaiting: BTreeSet<NodeId>,
    /// RepliesReceived for the current request
    replies: BTreeSet<NodeId>,
    /// Deferred requests: requester -> the request clock to echo back
    deferred: BTreeMap<NodeId, ClockValue>,
    retries: u32,
    requested_at: Option<Instant>,
}

impl Default for MutexEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MutexEngine {
    pub fn new() -> Self {
        Self {
            state: MutexState::Released,
            request_clock: 0,
            awaiting: BTreeSet::new(),
            replies: BTreeSet::new(),
            deferred: BTreeMap::new(),
            retries: 0,
            requested_at: None,
        }
    }

    pub fn state(&self) -> MutexState {
        self.state
    }

    /// Clock of the outstanding request, if any.
    pub fn request_clock(&self) -> Option<ClockValue> {
        match self.state {
            MutexState::Released => None,
            _ => Some(self.request_clock),
        }
    }

    pub fn awaiting(&self) -> Vec<NodeId> {
        self.awaiting.iter().copied().collect()
    }

    pub fn replies(&self) -> Vec<NodeId> {
        self.replies.iter().copied().collect()
    }

    pub fn deferred(&self) -> Vec<(NodeId, ClockValue)> {
        self.deferred.iter().map(|(&id, &clock)| (id, clock)).collect()
    }

    /// Start a request: tick once for the request event and broadcast
    /// REQUEST stamped with that clock to every peer marked alive.
    pub fn request(&mut self, ctx: &mut Ctx<'_>) -> Result<RequestOutcome, MutexError> {
        match self.state {
            MutexState::Wanted => return Err(MutexError::AlreadyWanted),
            MutexState::Held => return Err(MutexError::AlreadyHeld),
            MutexState::Released => {}
        }

        self.request_clock = ctx.clock.tick();
        self.state = MutexState::Wanted;
        self.replies.clear();
        self.retries = 0;
        self.requested_at = Some(ctx.now);
        self.awaiting = ctx.peers.alive_peers().into_iter().collect();

        info!(
            node = ctx.id,
            request_clock = self.request_clock,
            "Requesting critical section from {:?}",
            self.awaiting
        );

        let clock = self.request_clock;
        for &peer in &self.awaiting {
            ctx.send_stamped(peer, MessageKind::Request, clock, Some(clock));
        }

        if self.try_enter(ctx) {
            Ok(RequestOutcome::Acquired)
        } else {
            Ok(RequestOutcome::Pending {
                awaiting: self.awaiting(),
            })
        }
    }

    /// Our request outranks `(sender_clock, sender)` in the total order.
    fn has_priority_over(&self, my_id: NodeId, sender: NodeId, sender_clock: ClockValue) -> bool {
        match self.state {
            MutexState::Held => true,
            MutexState::Wanted => (self.request_clock, my_id) < (sender_clock, sender),
            MutexState::Released => false,
        }
    }

    pub fn on_request(&mut self, ctx: &mut Ctx<'_>, sender: NodeId, sender_clock: ClockValue) {
        if self.has_priority_over(ctx.id, sender, sender_clock) {
            debug!(
                node = ctx.id,
                peer = sender,
                sender_clock,
                "Deferring reply ({} with request clock {})",
                self.state,
                self.request_clock
            );
            self.deferred.insert(sender, sender_clock);
        } else {
            ctx.send(sender, MessageKind::Reply, Some(sender_clock));
        }
    }

    /// Returns true when this reply completed the quorum.
    pub fn on_reply(&mut self, ctx: &mut Ctx<'_>, sender: NodeId, request_clock: Option<ClockValue>) -> bool {
        if self.state != MutexState::Wanted {
            debug!(node = ctx.id, peer = sender, "Ignoring REPLY while {}", self.state);
            return false;
        }
        if let Some(clock) = request_clock {
            if clock != self.request_clock {
                debug!(
                    node = ctx.id,
                    peer = sender,
                    "Ignoring stale REPLY for request clock {} (current {})",
                    clock,
                    self.request_clock
                );
                return false;
            }
        }
        self.replies.insert(sender);
        self.awaiting.remove(&sender);
        self.try_enter(ctx)
    }

    /// A dead peer cannot contend; stop waiting for it.
    pub fn on_peer_down(&mut self, ctx: &mut Ctx<'_>, peer: NodeId) -> bool {
        if self.state == MutexState::Wanted && self.awaiting.remove(&peer) {
            info!(node = ctx.id, peer, "Dropping dead peer from quorum");
            return self.try_enter(ctx);
        }
        false
    }

    /// A peer that comes back while we wait could contend with an older
    /// clock, so it has to see our request too.
    pub fn on_peer_up(&mut self, ctx: &mut Ctx<'_>, peer: NodeId) {
        if self.state == MutexState::Wanted
            && !self.replies.contains(&peer)
            && self.awaiting.insert(peer)
        {
            info!(node = ctx.id, peer, "Peer rejoined while waiting; sending REQUEST");
            let clock = self.request_clock;
            ctx.send(peer, MessageKind::Request, Some(clock));
        }
    }

    /// The reply wait for the current round expired.
    pub fn on_reply_timeout(&mut self, ctx: &mut Ctx<'_>, policy: QuorumPolicy, max_retries: u32) -> QuorumOutcome {
        if self.state != MutexState::Wanted {
            return QuorumOutcome::Settled;
        }

        if policy == QuorumPolicy::Retry && self.retries < max_retries {
            self.retries += 1;
            let replies = &self.replies;
            self.awaiting = ctx
                .peers
                .alive_peers()
                .into_iter()
                .filter(|id| !replies.contains(id))
                .collect();
            if self.try_enter(ctx) {
                return QuorumOutcome::Settled;
            }

            warn!(
                node = ctx.id,
                round = self.retries,
                "Reply timeout; re-sending REQUEST to {:?}",
                self.awaiting
            );
            let clock = self.request_clock;
            let awaiting = self.awaiting();
            for &peer in &awaiting {
                ctx.send(peer, MessageKind::Request, Some(clock));
            }
            return QuorumOutcome::Retried { awaiting };
        }

        warn!(
            node = ctx.id,
            missing = ?self.awaiting,
            "Reply timeout; abandoning critical section request"
        );
        self.state = MutexState::Released;
        self.awaiting.clear();
        self.requested_at = None;
        self.release_deferred(ctx);
        QuorumOutcome::Abandoned
    }

    /// Leave the section and answer every deferred request. Returns how many
    /// replies were sent.
    pub fn exit(&mut self, ctx: &mut Ctx<'_>) -> Result<usize, MutexError> {
        if self.state != MutexState::Held {
            return Err(MutexError::NotHeld);
        }
        self.state = MutexState::Released;
        self.replies.clear();
        let to: Vec<NodeId> = self.deferred.keys().copied().collect();
        let sent = self.release_deferred(ctx);
        info!(node = ctx.id, "Exited critical section, {} deferred replies sent", sent);
        ctx.event(
            EventType::ExitCs,
            serde_json::json!({
                "request_clock": self.request_clock,
                "deferred_replies": sent,
                "to": to,
            }),
        );
        Ok(sent)
    }

    fn release_deferred(&mut self, ctx: &mut Ctx<'_>) -> usize {
        let deferred = std::mem::take(&mut self.deferred);
        deferred
            .into_iter()
            .filter(|&(peer, clock)| ctx.send(peer, MessageKind::Reply, Some(clock)))
            .count()
    }

    fn try_enter(&mut self, ctx: &mut Ctx<'_>) -> bool {
        if self.state != MutexState::Wanted || !self.awaiting.is_empty() {
            return false;
        }
        self.state = MutexState::Held;
        let waited = self
            .requested_at
            .take()
            .map(|at| ctx.now.saturating_duration_since(at))
            .unwrap_or_default();
        info!(
            node = ctx.id,
            request_clock = self.request_clock,
            ">>> Entering critical section <<<"
        );
        ctx.event(
            EventType::EnterCs,
            serde_json::json!({
                "request_clock": self.request_clock,
                "replies": self.replies(),
                "waited_ms": waited.as_millis() as u64,
            }),
        );
        ctx.fx.entered_cs = Some(waited);
        true
    }
}
