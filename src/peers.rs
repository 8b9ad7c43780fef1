//! Static cluster membership with per-peer liveness.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::{info, warn};

use crate::config::{PeerAddress, PeerMap};
use crate::error::{CoordError, Result};
use crate::protocol::NodeId;
use crate::transport::TransportEvent;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerInfo {
    pub id: NodeId,
    pub address: PeerAddress,
    pub alive: bool,
}

/// Membership as seen from one node. Built once from the peer file; `alive`
/// is the only field that ever changes, and only through [`FailureDetector`].
#[derive(Debug)]
pub struct PeerTable {
    self_id: NodeId,
    peers: DashMap<NodeId, PeerInfo>,
}

impl PeerTable {
    /// Every other member starts out alive.
    pub fn new(self_id: NodeId, members: &PeerMap) -> Result<Self> {
        if !members.contains_key(&self_id) {
            return Err(CoordError::config(format!(
                "Node ID {} not found in peer configuration",
                self_id
            )));
        }
        let peers = DashMap::new();
        for (&id, address) in members.iter().filter(|(id, _)| **id != self_id) {
            peers.insert(
                id,
                PeerInfo {
                    id,
                    address: address.clone(),
                    alive: true,
                },
            );
        }
        Ok(Self { self_id, peers })
    }

    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    /// True for configured members other than this node.
    pub fn contains(&self, id: NodeId) -> bool {
        self.peers.contains_key(&id)
    }

    pub fn is_alive(&self, id: NodeId) -> bool {
        self.peers.get(&id).map(|p| p.alive).unwrap_or(false)
    }

    pub fn address(&self, id: NodeId) -> Option<PeerAddress> {
        self.peers.get(&id).map(|p| p.address.clone())
    }

    /// Ids of every other member, ascending.
    pub fn peer_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.peers.iter().map(|p| p.id).collect();
        ids.sort_unstable();
        ids
    }

    /// Ids of the other members currently marked alive, ascending.
    pub fn alive_peers(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .peers
            .iter()
            .filter(|p| p.alive)
            .map(|p| p.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn snapshot(&self) -> Vec<PeerInfo> {
        let mut infos: Vec<PeerInfo> = self.peers.iter().map(|p| p.value().clone()).collect();
        infos.sort_by_key(|p| p.id);
        infos
    }

    /// Returns whether the flag actually changed. Only the failure detector
    /// (and in-crate tests) may call this.
    pub(crate) fn set_alive(&self, id: NodeId, alive: bool) -> bool {
        match self.peers.get_mut(&id) {
            Some(mut peer) if peer.alive != alive => {
                peer.alive = alive;
                true
            }
            _ => false,
        }
    }
}

/// The single writer of peer liveness. Transport tasks report connection
/// outcomes here; transitions are forwarded to the node dispatcher.
#[derive(Debug, Clone)]
pub struct FailureDetector {
    peers: Arc<PeerTable>,
    events: mpsc::UnboundedSender<TransportEvent>,
    revived: Arc<DashMap<NodeId, Arc<Notify>>>,
}

impl FailureDetector {
    pub fn new(peers: Arc<PeerTable>, events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            peers,
            events,
            revived: Arc::new(DashMap::new()),
        }
    }

    /// Signalled each time `id` goes from down to alive.
    pub fn revival(&self, id: NodeId) -> Arc<Notify> {
        self.revived.entry(id).or_default().clone()
    }

    pub fn peer_down(&self, id: NodeId, reason: &str) {
        if self.peers.set_alive(id, false) {
            warn!(node = self.peers.self_id(), peer = id, "Peer marked down: {}", reason);
            let _ = self.events.send(TransportEvent::PeerDown {
                peer: id,
                reason: reason.to_string(),
            });
        }
    }

    /// A connection to `id` succeeded or a valid frame arrived from it.
    pub fn peer_up(&self, id: NodeId) {
        if self.peers.set_alive(id, true) {
            info!(node = self.peers.self_id(), peer = id, "Peer is reachable again");
            if let Some(revived) = self.revived.get(&id) {
                revived.notify_one();
            }
            let _ = self.events.send(TransportEvent::PeerUp(id));
        }
    }
}
