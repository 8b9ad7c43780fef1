//! Node controller
//!
//! Owns the state lock, the transport and the event sink, runs the
//! dispatcher task and exposes the command surface:
//! - `request_critical_section` (or `begin_` then `await_`) / `exit_critical_section`
//! - `start_election`
//! - `status`
//! - `shutdown`

mod state;
mod status;
#[cfg(test)]
mod tests;

pub use state::NodeState;
pub use status::NodeStatus;

use parking_lot::Mutex;
use rand::Rng;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{require_member, NodeConfig, PeerMap};
use crate::engine::{Effects, ElectionState, MutexState, QuorumOutcome, RequestOutcome};
use crate::error::{CoordError, MutexError, Result};
use crate::events::{EventSink, EventType, NodeEvent};
use crate::peers::PeerTable;
use crate::protocol::{ClockValue, MessageKind, NodeId};
use crate::transport::{Transport, TransportEvent};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

struct NodeInner {
    id: NodeId,
    config: NodeConfig,
    peers: Arc<PeerTable>,
    state: Mutex<NodeState>,
    transport: Transport,
    sink: Arc<dyn EventSink>,
    /// Woken whenever a transition moves the mutex into HELD
    cs_granted: Notify,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl NodeInner {
    /// Run one transition under the lock, then flush its effects.
    fn apply<R>(&self, f: impl FnOnce(&mut NodeState, &PeerTable, Instant) -> (R, Effects)) -> R {
        let (result, fx) = {
            let mut state = self.state.lock();
            f(&mut state, &self.peers, Instant::now())
        };
        self.flush(fx);
        result
    }

    fn flush(&self, fx: Effects) {
        let Effects {
            outbound,
            mut events,
            entered_cs,
        } = fx;

        let mut dropped = Vec::new();
        for envelope in outbound {
            let key = (envelope.to, envelope.message.kind, envelope.message.timestamp);
            if !self.transport.send(envelope) {
                dropped.push(key);
            }
        }
        if !dropped.is_empty() {
            mark_dropped(&mut events, &dropped);
            let mut state = self.state.lock();
            for &(_, kind, _) in &dropped {
                state.record_dropped(kind);
            }
        }

        for event in &events {
            self.sink.emit(event);
        }
        if entered_cs.is_some() {
            self.cs_granted.notify_one();
        }
    }

    fn on_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Message(message) => {
                self.apply(|s, peers, now| ((), s.handle_message(&message, peers, now)));
            }
            TransportEvent::PeerDown { peer, reason } => {
                self.apply(|s, peers, now| ((), s.peer_down(peer, &reason, peers, now)));
            }
            TransportEvent::PeerUp(peer) => {
                self.apply(|s, peers, now| ((), s.peer_up(peer, peers, now)));
            }
        }
    }

    fn next_heartbeat(&self) -> Duration {
        let jitter = self.config.heartbeat_jitter_ms;
        let extra = if jitter == 0 {
            0
        } else {
            rand::rng().random_range(0..=jitter)
        };
        self.config.heartbeat_interval() + Duration::from_millis(extra)
    }

    fn mutex_state(&self) -> MutexState {
        self.state.lock().mutex().state()
    }
}

/// Handle to a running node. Cheap to clone.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    /// Bind the node's configured port on all interfaces and start it.
    pub async fn start(id: NodeId, members: &PeerMap, config: NodeConfig, sink: Arc<dyn EventSink>) -> Result<Self> {
        let address = require_member(members, id)?;
        let listener = TcpListener::bind(("0.0.0.0", address.port)).await.map_err(|e| {
            CoordError::config(format!("Node {} cannot listen on port {}: {}", id, address.port, e))
        })?;
        Self::start_with_listener(id, members, config, sink, listener)
    }

    /// Start on an already-bound listener.
    pub fn start_with_listener(
        id: NodeId,
        members: &PeerMap,
        config: NodeConfig,
        sink: Arc<dyn EventSink>,
        listener: TcpListener,
    ) -> Result<Self> {
        config.validate()?;
        let peers = Arc::new(PeerTable::new(id, members)?);
        let cancel = CancellationToken::new();
        let (transport, events) = Transport::start(listener, peers.clone(), &config, cancel.child_token())?;

        let inner = Arc::new(NodeInner {
            id,
            state: Mutex::new(NodeState::new(id, &config)),
            config,
            peers,
            transport,
            sink,
            cs_granted: Notify::new(),
            cancel,
            tasks: Mutex::new(Vec::new()),
        });

        let dispatcher = tokio::spawn(dispatch(inner.clone(), events));
        inner.tasks.lock().push(dispatcher);

        info!(node = id, "Node started on {}", inner.transport.local_addr());
        Ok(Self { inner })
    }

    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.inner.transport.local_addr()
    }

    pub fn status(&self) -> NodeStatus {
        self.inner.state.lock().status(&self.inner.peers)
    }

    pub fn coordinator(&self) -> Option<NodeId> {
        self.inner.state.lock().election().coordinator()
    }

    pub fn election_state(&self) -> ElectionState {
        self.inner.state.lock().election().state()
    }

    pub fn mutex_state(&self) -> MutexState {
        self.inner.mutex_state()
    }

    pub fn is_running(&self) -> bool {
        !self.inner.cancel.is_cancelled()
    }

    /// Broadcast REQUEST and wait until the section is held.
    pub async fn request_critical_section(&self) -> Result<()> {
        self.begin_critical_section()?;
        self.await_critical_section().await
    }

    /// Open a request and broadcast REQUEST without waiting. Fails at once
    /// if a request is already open or the section is held.
    pub fn begin_critical_section(&self) -> Result<RequestOutcome> {
        let inner = &self.inner;
        if inner.cancel.is_cancelled() {
            return Err(CoordError::Shutdown);
        }
        let outcome = inner.apply(|s, peers, now| s.request_cs(peers, now))?;
        if let RequestOutcome::Pending { awaiting } = &outcome {
            debug!(node = inner.id, "Waiting for replies from {:?}", awaiting);
        }
        Ok(outcome)
    }

    /// Wait for the open request to be granted.
    ///
    /// The wait is bounded per round by `mutex_reply_timeout_ms`; what
    /// happens when it expires is governed by the quorum policy. With no
    /// open request this returns `QuorumTimeout` straight away.
    pub async fn await_critical_section(&self) -> Result<()> {
        let inner = &self.inner;
        let timeout = inner.config.mutex_reply_timeout();
        let mut deadline = Instant::now() + timeout;
        loop {
            match inner.mutex_state() {
                MutexState::Held => return Ok(()),
                MutexState::Released => return Err(MutexError::QuorumTimeout.into()),
                MutexState::Wanted => {}
            }

            tokio::select! {
                _ = inner.cancel.cancelled() => return Err(CoordError::Shutdown),
                _ = inner.cs_granted.notified() => {}
                _ = tokio::time::sleep_until(deadline.into()) => {
                    match inner.apply(|s, peers, now| s.reply_timeout(peers, now)) {
                        QuorumOutcome::Retried { .. } => deadline = Instant::now() + timeout,
                        QuorumOutcome::Abandoned => return Err(MutexError::QuorumTimeout.into()),
                        QuorumOutcome::Settled => {}
                    }
                }
            }
        }
    }

    /// Leave the section; returns the number of deferred replies sent.
    pub fn exit_critical_section(&self) -> Result<usize> {
        Ok(self.inner.apply(|s, peers, now| s.exit_cs(peers, now))?)
    }

    /// Request, hold for `cs_hold_ms` while reporting progress, then exit.
    pub async fn run_critical_section(&self) -> Result<()> {
        self.request_critical_section().await?;
        self.hold_critical_section().await
    }

    /// Simulated work inside a held section, then exit.
    pub async fn hold_critical_section(&self) -> Result<()> {
        const STEPS: u32 = 3;
        let id = self.inner.id;
        let step = self.inner.config.cs_hold() / STEPS;
        let mut interrupted = false;
        for i in 1..=STEPS {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => {
                    interrupted = true;
                    break;
                }
                _ = tokio::time::sleep(step) => {
                    info!(node = id, "Working in critical section... {}/{}", i, STEPS);
                }
            }
        }

        let sent = self.exit_critical_section()?;
        debug!(node = id, "Released critical section, answered {} deferred requests", sent);
        if interrupted {
            return Err(CoordError::Shutdown);
        }
        Ok(())
    }

    /// Returns false if an election was already running.
    pub fn start_election(&self) -> bool {
        self.inner.apply(|s, peers, now| s.start_election(peers, now))
    }

    /// Stop timers, close connections and wait for background tasks.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.cancel.is_cancelled() {
            return;
        }
        info!(node = inner.id, "Shutting down");
        inner.cancel.cancel();
        inner.transport.shutdown(SHUTDOWN_GRACE).await;
        let tasks = std::mem::take(&mut *inner.tasks.lock());
        if tokio::time::timeout(SHUTDOWN_GRACE, futures::future::join_all(tasks))
            .await
            .is_err()
        {
            warn!(node = inner.id, "Dispatcher did not stop within {:?}", SHUTDOWN_GRACE);
        }
    }
}

/// Flag the SEND_MESSAGE events whose message the transport refused.
fn mark_dropped(events: &mut [NodeEvent], dropped: &[(NodeId, MessageKind, ClockValue)]) {
    for event in events.iter_mut().filter(|e| e.event_type == EventType::SendMessage) {
        let details = &event.details;
        let refused = dropped.iter().any(|&(to, kind, timestamp)| {
            details["to"] == json!(to) && details["type"] == json!(kind) && details["timestamp"] == json!(timestamp)
        });
        if refused {
            event.details["dropped"] = json!(true);
        }
    }
}

/// Single consumer of transport events and timers; every item is one
/// transition under the state lock.
async fn dispatch(inner: Arc<NodeInner>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
    let mut tick = tokio::time::interval(inner.config.tick_interval());
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let heartbeat = tokio::time::sleep(inner.next_heartbeat());
    tokio::pin!(heartbeat);
    let bootstrap = tokio::time::sleep(inner.config.bootstrap_delay());
    tokio::pin!(bootstrap);
    let mut bootstrapped = false;

    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => inner.on_transport_event(event),
                None => break,
            },
            _ = tick.tick() => {
                inner.apply(|s, peers, now| ((), s.tick(peers, now)));
            }
            _ = &mut heartbeat => {
                inner.apply(|s, peers, now| s.heartbeat(peers, now));
                heartbeat.as_mut().reset(tokio::time::Instant::now() + inner.next_heartbeat());
            }
            _ = &mut bootstrap, if !bootstrapped => {
                bootstrapped = true;
                if inner.apply(|s, peers, now| s.bootstrap(peers, now)) {
                    info!(node = inner.id, "No coordinator known after startup; started election");
                }
            }
        }
    }
    debug!(node = inner.id, "Dispatcher stopped");
}
