//! Peer-to-peer message transport.
//!
//! Every node listens on its configured port and keeps one outbound link to
//! each other member. Inbound connections are read-only and outbound links
//! are write-only, so per-link FIFO order holds in both directions. Inbound
//! messages and liveness changes leave the transport as [`TransportEvent`]s
//! on a single queue.

pub mod codec;
mod link;

use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

pub use codec::{Frame, MessageCodec};
pub use link::LinkSettings;

use crate::config::NodeConfig;
use crate::engine::Envelope;
use crate::peers::{FailureDetector, PeerTable};
use crate::protocol::{Message, NodeId};
use link::Link;

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A validated message from a configured peer.
    Message(Message),
    PeerDown { peer: NodeId, reason: String },
    PeerUp(NodeId),
}

impl LinkSettings {
    pub fn from_config(config: &NodeConfig) -> Self {
        let (backoff_min, backoff_max) = config.reconnect_backoff();
        Self {
            connect_timeout: config.connect_timeout(),
            write_timeout: config.write_timeout(),
            backoff_min,
            backoff_max,
            max_frame_length: config.max_frame_length,
        }
    }
}

pub struct Transport {
    self_id: NodeId,
    local_addr: SocketAddr,
    peers: Arc<PeerTable>,
    links: HashMap<NodeId, mpsc::Sender<Message>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Transport {
    /// Spawn the accept loop and one link per peer. Must be called inside a
    /// tokio runtime.
    pub fn start(
        listener: TcpListener,
        peers: Arc<PeerTable>,
        config: &NodeConfig,
        cancel: CancellationToken,
    ) -> std::io::Result<(Self, mpsc::UnboundedReceiver<TransportEvent>)> {
        let self_id = peers.self_id();
        let local_addr = listener.local_addr()?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let detector = FailureDetector::new(peers.clone(), events_tx.clone());
        let settings = LinkSettings::from_config(config);
        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(accept_loop(
            listener,
            peers.clone(),
            detector.clone(),
            events_tx,
            config.max_frame_length,
            cancel.clone(),
        )));

        let mut links = HashMap::new();
        for info in peers.snapshot() {
            let (tx, rx) = mpsc::channel(config.send_queue_depth);
            let link = Link::new(
                info.id,
                info.address.socket_addr(),
                rx,
                peers.clone(),
                detector.clone(),
                settings,
                cancel.clone(),
            );
            tasks.push(tokio::spawn(link.run()));
            links.insert(info.id, tx);
        }

        info!(node = self_id, "Listening on {}", local_addr);
        Ok((
            Self {
                self_id,
                local_addr,
                peers,
                links,
                cancel,
                tasks: Mutex::new(tasks),
            },
            events_rx,
        ))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Best-effort send. A peer marked down is skipped; a full queue drops
    /// the message. Never blocks.
    pub fn send(&self, envelope: Envelope) -> bool {
        let Envelope { to, message } = envelope;
        if !self.peers.is_alive(to) {
            trace!(node = self.self_id, peer = to, "Peer down, not sending {}", message.kind);
            return false;
        }
        let Some(link) = self.links.get(&to) else {
            warn!(node = self.self_id, peer = to, "No link for unknown peer");
            return false;
        };
        match link.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(message)) => {
                warn!(
                    node = self.self_id,
                    peer = to,
                    "Send queue full, dropping {}",
                    message.kind
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Cancel every transport task and wait briefly for them to finish.
    pub async fn shutdown(&self, grace: Duration) {
        self.cancel.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        if tokio::time::timeout(grace, futures::future::join_all(tasks))
            .await
            .is_err()
        {
            warn!(node = self.self_id, "Transport tasks did not stop within {:?}", grace);
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    peers: Arc<PeerTable>,
    detector: FailureDetector,
    events: mpsc::UnboundedSender<TransportEvent>,
    max_frame_length: usize,
    cancel: CancellationToken,
) {
    let self_id = peers.self_id();
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, remote)) => {
                debug!(node = self_id, "Accepted connection from {}", remote);
                tokio::spawn(read_connection(
                    stream,
                    remote,
                    peers.clone(),
                    detector.clone(),
                    events.clone(),
                    max_frame_length,
                    cancel.clone(),
                ));
            }
            Err(e) => {
                error!(node = self_id, "Accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
    trace!(node = self_id, "Accept loop stopped");
}

/// Read frames from one inbound connection until it closes. Bad payloads
/// are dropped; only a framing error ends the connection early.
async fn read_connection(
    stream: TcpStream,
    remote: SocketAddr,
    peers: Arc<PeerTable>,
    detector: FailureDetector,
    events: mpsc::UnboundedSender<TransportEvent>,
    max_frame_length: usize,
    cancel: CancellationToken,
) {
    let self_id = peers.self_id();
    let mut frames = FramedRead::new(stream, MessageCodec::new(max_frame_length));
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = frames.next() => frame,
        };
        match frame {
            Some(Ok(Frame::Message(message))) => {
                if !peers.contains(message.sender) {
                    warn!(
                        node = self_id,
                        "Discarding {} from non-member {} ({})",
                        message.kind,
                        message.sender,
                        remote
                    );
                    continue;
                }
                detector.peer_up(message.sender);
                if events.send(TransportEvent::Message(message)).is_err() {
                    break;
                }
            }
            Some(Ok(Frame::Invalid(e))) => {
                warn!(node = self_id, "Discarding invalid frame from {}: {}", remote, e);
            }
            Some(Err(e)) => {
                warn!(node = self_id, "Framing error from {}, closing: {}", remote, e);
                break;
            }
            None => {
                debug!(node = self_id, "Connection from {} closed", remote);
                break;
            }
        }
    }
}
