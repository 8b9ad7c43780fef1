//! In-memory cluster simulation over `NodeState`.
//!
//! Messages travel through per-link FIFO queues; the order in which links
//! are drained is chosen by proptest, covering arbitrary cross-link
//! interleavings without sockets or timers.

use proptest::prelude::*;
use std::collections::{BTreeMap, VecDeque};
use std::time::Instant;

use super::{mark_dropped, NodeState};
use crate::config::NodeConfig;
use crate::engine::testing::{members, table};
use crate::engine::{Effects, ElectionState, MutexState};
use crate::error::MutexError;
use crate::events::EventType;
use crate::peers::PeerTable;
use crate::protocol::{Message, MessageKind, NodeId};

struct Cluster {
    nodes: BTreeMap<NodeId, (NodeState, PeerTable)>,
    links: BTreeMap<(NodeId, NodeId), VecDeque<Message>>,
    now: Instant,
}

enum Action {
    Deliver(NodeId, NodeId),
    Exit(NodeId),
}

impl Cluster {
    fn new(size: NodeId) -> Self {
        let config = NodeConfig::default();
        let nodes = (1..=size)
            .map(|id| (id, (NodeState::new(id, &config), table(id, size))))
            .collect();
        Self {
            nodes,
            links: BTreeMap::new(),
            now: Instant::now(),
        }
    }

    fn enqueue(&mut self, from: NodeId, fx: Effects) {
        for envelope in fx.outbound {
            self.links
                .entry((from, envelope.to))
                .or_default()
                .push_back(envelope.message);
        }
    }

    fn with_node<R>(&mut self, id: NodeId, f: impl FnOnce(&mut NodeState, &PeerTable, Instant) -> (R, Effects)) -> R {
        let now = self.now;
        let (state, peers) = self.nodes.get_mut(&id).expect("node exists");
        let (result, fx) = f(state, peers, now);
        self.enqueue(id, fx);
        result
    }

    fn actions(&self) -> Vec<Action> {
        let mut actions: Vec<Action> = self
            .links
            .iter()
            .filter(|(_, queue)| !queue.is_empty())
            .map(|(&(from, to), _)| Action::Deliver(from, to))
            .collect();
        actions.extend(
            self.nodes
                .iter()
                .filter(|(_, (state, _))| state.mutex().state() == MutexState::Held)
                .map(|(&id, _)| Action::Exit(id)),
        );
        actions
    }

    fn step(&mut self, action: Action) {
        match action {
            Action::Deliver(from, to) => {
                let message = self
                    .links
                    .get_mut(&(from, to))
                    .and_then(|queue| queue.pop_front())
                    .expect("queue not empty");
                self.with_node(to, |s, peers, now| ((), s.handle_message(&message, peers, now)));
            }
            Action::Exit(id) => {
                let sent = self.with_node(id, |s, peers, now| s.exit_cs(peers, now));
                assert!(sent.is_ok());
            }
        }
    }

    fn held(&self) -> usize {
        self.nodes
            .values()
            .filter(|(state, _)| state.mutex().state() == MutexState::Held)
            .count()
    }

    /// Drain every queue in the order picked by `choices`; returns the
    /// number of steps taken.
    fn run(&mut self, choices: &[usize]) -> usize {
        let mut steps = 0;
        loop {
            let mut actions = self.actions();
            if actions.is_empty() {
                return steps;
            }
            let pick = choices.get(steps).copied().unwrap_or(0) % actions.len();
            self.step(actions.swap_remove(pick));
            steps += 1;
            assert!(self.held() <= 1, "two nodes in the critical section");
            assert!(steps < 10_000, "simulation did not quiesce");
        }
    }
}

proptest! {
    #[test]
    fn prop_mutual_exclusion_under_any_interleaving(
        size in 2u64..=5,
        requesters in proptest::collection::btree_set(1u64..=5, 1..=5),
        choices in proptest::collection::vec(any::<usize>(), 0..400),
    ) {
        let mut cluster = Cluster::new(size);
        let requesters: Vec<NodeId> = requesters.into_iter().filter(|&id| id <= size).collect();
        prop_assume!(!requesters.is_empty());

        for &id in &requesters {
            let outcome = cluster.with_node(id, |s, peers, now| s.request_cs(peers, now));
            prop_assert!(outcome.is_ok());
        }
        cluster.run(&choices);

        let mut replies_sent = 0;
        for (id, (state, _)) in &cluster.nodes {
            prop_assert_eq!(state.mutex().state(), MutexState::Released);
            prop_assert!(state.mutex().deferred().is_empty());
            let entries = if requesters.contains(id) { 1 } else { 0 };
            prop_assert_eq!(state.stats().entries, entries);
            replies_sent += state.stats().messages_sent.get(&MessageKind::Reply).copied().unwrap_or(0);
        }
        // Every request is answered exactly once by every other node
        prop_assert_eq!(replies_sent, requesters.len() as u64 * (size - 1));
    }

    #[test]
    fn prop_election_converges_on_highest_id(
        size in 2u64..=6,
        starters in proptest::collection::btree_set(1u64..=6, 1..=6),
        choices in proptest::collection::vec(any::<usize>(), 0..600),
    ) {
        let mut cluster = Cluster::new(size);
        for id in starters.into_iter().filter(|&id| id <= size) {
            cluster.with_node(id, |s, peers, now| s.start_election(peers, now));
        }
        cluster.run(&choices);

        for (&id, (state, _)) in &cluster.nodes {
            let expected = if id == size { ElectionState::Coordinator } else { ElectionState::Idle };
            prop_assert_eq!(state.election().state(), expected);
            prop_assert_eq!(state.election().coordinator(), Some(size));
        }
    }
}

#[test]
fn test_dispatch_observes_clock_before_handling() {
    let config = NodeConfig::default();
    let peers = table(2, 3);
    let mut state = NodeState::new(2, &config);

    let request = Message::new(1, MessageKind::Request, 41).with_request_clock(41);
    let fx = state.handle_message(&request, &peers, Instant::now());

    assert_eq!(state.clock().current(), 43);
    let reply: Vec<_> = fx.sent(MessageKind::Reply).collect();
    assert_eq!(reply.len(), 1);
    assert_eq!(reply[0].to, 1);
    assert_eq!(reply[0].message.timestamp, 43);
    assert_eq!(reply[0].message.request_clock, Some(41));

    let update = fx
        .events
        .iter()
        .find(|e| e.event_type == EventType::ClockUpdate)
        .expect("clock update reported");
    assert_eq!(update.clock, 42);
    assert_eq!(update.details["received"], 41);
    assert!(fx.has_event(EventType::SendMessage));

    assert_eq!(state.stats().messages_received[&MessageKind::Request], 1);
    assert_eq!(state.stats().messages_sent[&MessageKind::Reply], 1);
}

#[test]
fn test_refused_sends_are_flagged() {
    let config = NodeConfig::default();
    let peers = table(1, 3);
    let mut state = NodeState::new(1, &config);

    let (outcome, mut fx) = state.request_cs(&peers, Instant::now());
    assert!(outcome.is_ok());
    let to_three = fx
        .sent(MessageKind::Request)
        .find(|e| e.to == 3)
        .map(|e| (e.to, e.message.kind, e.message.timestamp))
        .expect("request to 3 queued");

    mark_dropped(&mut fx.events, &[to_three]);
    let sends: Vec<_> = fx
        .events
        .iter()
        .filter(|e| e.event_type == EventType::SendMessage)
        .collect();
    assert_eq!(sends.len(), 2);
    for event in sends {
        let flagged = event.details["dropped"] == true;
        assert_eq!(flagged, event.details["to"] == 3, "{:?}", event.details);
    }

    state.record_dropped(MessageKind::Request);
    assert_eq!(state.stats().messages_dropped[&MessageKind::Request], 1);
}

#[test]
fn test_exit_reports_stats() {
    let config = NodeConfig::default();
    let peers = PeerTable::new(1, &members(1)).unwrap();
    let mut state = NodeState::new(1, &config);

    let (outcome, fx) = state.request_cs(&peers, Instant::now());
    assert!(outcome.is_ok());
    assert!(fx.has_event(EventType::EnterCs));
    assert_eq!(state.stats().entries, 1);

    let (sent, fx) = state.exit_cs(&peers, Instant::now());
    assert_eq!(sent, Ok(0));
    let stats = fx
        .events
        .iter()
        .find(|e| e.event_type == EventType::MutexStats)
        .expect("stats reported");
    assert_eq!(stats.details["exits"], 1);
    assert_eq!(stats.details["outcome"], "exit");

    let (again, _) = state.exit_cs(&peers, Instant::now());
    assert_eq!(again, Err(MutexError::NotHeld));
}

#[test]
fn test_abandoned_request_reports_timeout() {
    let mut config = NodeConfig::default();
    config.max_quorum_retries = 0;
    let peers = table(1, 2);
    let mut state = NodeState::new(1, &config);

    let (outcome, _) = state.request_cs(&peers, Instant::now());
    assert!(outcome.is_ok());
    let (_, fx) = state.reply_timeout(&peers, Instant::now());
    assert_eq!(state.mutex().state(), MutexState::Released);
    assert_eq!(state.stats().quorum_timeouts, 1);
    assert!(fx.has_event(EventType::MutexStats));
}

#[test]
fn test_peer_down_is_reported_and_unblocks_request() {
    let config = NodeConfig::default();
    let peers = table(1, 2);
    let mut state = NodeState::new(1, &config);
    state.request_cs(&peers, Instant::now());

    peers.set_alive(2, false);
    let fx = state.peer_down(2, "connection refused", &peers, Instant::now());
    let down = fx
        .events
        .iter()
        .find(|e| e.event_type == EventType::NodeDown)
        .expect("node down reported");
    assert_eq!(down.details["reason"], "connection refused");
    assert_eq!(state.mutex().state(), MutexState::Held);
    assert!(fx.entered_cs.is_some());
}

#[test]
fn test_bootstrap_only_without_coordinator() {
    let config = NodeConfig::default();
    let peers = table(2, 3);
    let mut state = NodeState::new(2, &config);

    let coordinator = Message::new(3, MessageKind::Coordinator, 5);
    state.handle_message(&coordinator, &peers, Instant::now());
    let (started, fx) = state.bootstrap(&peers, Instant::now());
    assert!(!started);
    assert!(fx.outbound.is_empty());

    let mut fresh = NodeState::new(2, &config);
    let (started, fx) = fresh.bootstrap(&peers, Instant::now());
    assert!(started);
    assert!(fx.sent(MessageKind::Election).any(|e| e.to == 3));
}
