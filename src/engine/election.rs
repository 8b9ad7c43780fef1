//! Bully leader election with heartbeat failure detection.

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::Ctx;
use crate::config::NodeConfig;
use crate::events::EventType;
use crate::protocol::{ClockValue, MessageKind, NodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ElectionState {
    Idle,
    ElectionInProgress,
    Coordinator,
}

impl fmt::Display for ElectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ElectionState::Idle => "IDLE",
            ElectionState::ElectionInProgress => "ELECTION_IN_PROGRESS",
            ElectionState::Coordinator => "COORDINATOR",
        })
    }
}

/// Bounded waits of the election protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElectionTimings {
    /// How long to wait for ANSWER before self-promotion
    pub answer: Duration,
    /// How long to wait for COORDINATOR after an ANSWER
    pub coordinator: Duration,
    /// Silence from the coordinator beyond this is a failure
    pub heartbeat_timeout: Duration,
}

impl ElectionTimings {
    pub fn from_config(config: &NodeConfig) -> Self {
        Self {
            answer: config.answer_timeout(),
            coordinator: config.coordinator_timeout(),
            heartbeat_timeout: config.heartbeat_timeout(),
        }
    }
}

impl Default for ElectionTimings {
    fn default() -> Self {
        Self::from_config(&NodeConfig::default())
    }
}

#[derive(Debug, Clone, Copy)]
struct HeartbeatSeen {
    at: Instant,
    clock: ClockValue,
}

#[derive(Debug)]
pub struct ElectionEngine {
    state: ElectionState,
    coordinator: Option<NodeId>,
    timings: ElectionTimings,
    answer_deadline: Option<Instant>,
    coordinator_deadline: Option<Instant>,
    last_heartbeat: HashMap<NodeId, HeartbeatSeen>,
}

impl ElectionEngine {
    pub fn new(timings: ElectionTimings) -> Self {
        Self {
            state: ElectionState::Idle,
            coordinator: None,
            timings,
            answer_deadline: None,
            coordinator_deadline: None,
            last_heartbeat: HashMap::new(),
        }
    }

    pub fn state(&self) -> ElectionState {
        self.state
    }

    pub fn coordinator(&self) -> Option<NodeId> {
        self.coordinator
    }

    pub fn is_coordinator(&self) -> bool {
        self.state == ElectionState::Coordinator
    }

    /// Highest HEARTBEAT timestamp seen from `peer`.
    pub fn last_heartbeat_clock(&self, peer: NodeId) -> Option<ClockValue> {
        self.last_heartbeat.get(&peer).map(|seen| seen.clock)
    }

    /// Returns false when an election is already running.
    pub fn start_election(&mut self, ctx: &mut Ctx<'_>) -> bool {
        if self.state == ElectionState::ElectionInProgress {
            debug!(node = ctx.id, "Election already in progress");
            return false;
        }

        self.state = ElectionState::ElectionInProgress;
        self.coordinator_deadline = None;
        let higher: Vec<NodeId> = ctx
            .peers
            .alive_peers()
            .into_iter()
            .filter(|&id| id > ctx.id)
            .collect();

        info!(node = ctx.id, "Starting election, higher peers {:?}", higher);
        ctx.event(EventType::ElectionStart, serde_json::json!({ "higher_peers": higher }));

        if higher.is_empty() {
            self.become_coordinator(ctx);
            return true;
        }
        for peer in higher {
            ctx.send(peer, MessageKind::Election, None);
        }
        self.answer_deadline = Some(ctx.now + self.timings.answer);
        true
    }

    fn become_coordinator(&mut self, ctx: &mut Ctx<'_>) {
        let previous = self.coordinator;
        self.state = ElectionState::Coordinator;
        self.coordinator = Some(ctx.id);
        self.answer_deadline = None;
        self.coordinator_deadline = None;

        info!(node = ctx.id, "*** Node {} is now the coordinator ***", ctx.id);
        ctx.event(
            EventType::LeaderUpdate,
            serde_json::json!({ "coordinator": ctx.id, "previous": previous }),
        );
        for peer in ctx.peers.alive_peers() {
            ctx.send(peer, MessageKind::Coordinator, None);
        }
    }

    pub fn on_election(&mut self, ctx: &mut Ctx<'_>, sender: NodeId) {
        if ctx.id < sender {
            debug!(node = ctx.id, peer = sender, "Ignoring ELECTION from higher node");
            return;
        }
        ctx.send(sender, MessageKind::Answer, None);
        if self.state == ElectionState::Coordinator {
            ctx.send(sender, MessageKind::Coordinator, None);
        } else {
            self.start_election(ctx);
        }
    }

    pub fn on_answer(&mut self, ctx: &mut Ctx<'_>, sender: NodeId) {
        if self.state != ElectionState::ElectionInProgress {
            return;
        }
        debug!(node = ctx.id, peer = sender, "ANSWER received, awaiting COORDINATOR");
        self.state = ElectionState::Idle;
        self.answer_deadline = None;
        self.coordinator_deadline = Some(ctx.now + self.timings.coordinator);
    }

    pub fn on_coordinator(&mut self, ctx: &mut Ctx<'_>, sender: NodeId, timestamp: ClockValue) {
        let previous = self.coordinator;
        self.adopt(ctx, sender, timestamp);
        if previous != Some(sender) {
            info!(node = ctx.id, "New coordinator is node {}", sender);
            ctx.event(
                EventType::LeaderUpdate,
                serde_json::json!({ "coordinator": sender, "previous": previous }),
            );
        }
        if sender < ctx.id {
            info!(node = ctx.id, peer = sender, "Lower node claimed leadership; reclaiming");
            self.start_election(ctx);
        }
    }

    pub fn on_heartbeat(&mut self, ctx: &mut Ctx<'_>, sender: NodeId, timestamp: ClockValue) {
        let seen = self.last_heartbeat.entry(sender).or_insert(HeartbeatSeen {
            at: ctx.now,
            clock: timestamp,
        });
        if timestamp >= seen.clock {
            seen.clock = timestamp;
            seen.at = seen.at.max(ctx.now);
        }

        if sender > ctx.id {
            let outranks_current = match self.coordinator {
                None => true,
                Some(current) => sender > current,
            };
            if outranks_current {
                let previous = self.coordinator;
                self.adopt(ctx, sender, timestamp);
                info!(node = ctx.id, "Adopted node {} as coordinator from heartbeat", sender);
                ctx.event(
                    EventType::LeaderUpdate,
                    serde_json::json!({ "coordinator": sender, "previous": previous }),
                );
            }
        } else if self.state == ElectionState::Coordinator {
            ctx.send(sender, MessageKind::Coordinator, None);
        } else if self.coordinator.is_none() {
            self.start_election(ctx);
        }
    }

    /// Record `leader` as coordinator and restart its heartbeat window.
    fn adopt(&mut self, ctx: &mut Ctx<'_>, leader: NodeId, timestamp: ClockValue) {
        self.coordinator = Some(leader);
        self.state = ElectionState::Idle;
        self.answer_deadline = None;
        self.coordinator_deadline = None;
        let clock = self
            .last_heartbeat
            .get(&leader)
            .map_or(timestamp, |seen| seen.clock.max(timestamp));
        self.last_heartbeat.insert(leader, HeartbeatSeen { at: ctx.now, clock });
    }

    /// Expire whichever bounded wait is due.
    pub fn on_tick(&mut self, ctx: &mut Ctx<'_>) {
        let now = ctx.now;
        if self.state == ElectionState::ElectionInProgress {
            if self.answer_deadline.is_some_and(|d| now >= d) {
                info!(node = ctx.id, "No ANSWER within {:?}", self.timings.answer);
                self.become_coordinator(ctx);
            }
            return;
        }

        if self.coordinator_deadline.is_some_and(|d| now >= d) {
            warn!(node = ctx.id, "No COORDINATOR after ANSWER; restarting election");
            self.coordinator_deadline = None;
            self.start_election(ctx);
            return;
        }

        let Some(leader) = self.coordinator.filter(|&c| c != ctx.id) else {
            return;
        };
        let silent = self
            .last_heartbeat
            .get(&leader)
            .map(|seen| now.saturating_duration_since(seen.at));
        if let Some(silent) = silent.filter(|s| *s > self.timings.heartbeat_timeout) {
            warn!(
                node = ctx.id,
                peer = leader,
                "Coordinator silent for {:?}; starting election",
                silent
            );
            ctx.event(
                EventType::NodeDown,
                serde_json::json!({ "peer": leader, "reason": "heartbeat_timeout" }),
            );
            self.coordinator = None;
            self.start_election(ctx);
        }
    }

    /// Send one round of HEARTBEAT if this node leads. Returns the number sent.
    pub fn heartbeat(&mut self, ctx: &mut Ctx<'_>) -> usize {
        if self.state != ElectionState::Coordinator {
            return 0;
        }
        ctx.peers
            .alive_peers()
            .into_iter()
            .filter(|&peer| ctx.send(peer, MessageKind::Heartbeat, None))
            .count()
    }
}
