use serde::Serialize;
use std::fmt;

use crate::engine::{ElectionState, MutexState};
use crate::metrics::MutexStats;
use crate::peers::PeerInfo;
use crate::protocol::{ClockValue, NodeId};

/// Point-in-time view of a node, as printed by `status`.
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub clock: ClockValue,
    pub mutex_state: MutexState,
    pub request_clock: Option<ClockValue>,
    pub awaiting: Vec<NodeId>,
    pub replies: Vec<NodeId>,
    pub deferred: Vec<NodeId>,
    pub election_state: ElectionState,
    pub coordinator: Option<NodeId>,
    pub peers: Vec<PeerInfo>,
    pub stats: MutexStats,
}

fn ids(list: &[NodeId]) -> String {
    if list.is_empty() {
        return "-".to_string();
    }
    list.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(", ")
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Node {} (clock {})", self.node_id, self.clock)?;
        match self.request_clock {
            Some(clock) => writeln!(f, "  Mutex:       {} (request clock {})", self.mutex_state, clock)?,
            None => writeln!(f, "  Mutex:       {}", self.mutex_state)?,
        }
        writeln!(f, "  Awaiting:    {}", ids(&self.awaiting))?;
        writeln!(f, "  Replies:     {}", ids(&self.replies))?;
        writeln!(f, "  Deferred:    {}", ids(&self.deferred))?;
        writeln!(f, "  Election:    {}", self.election_state)?;
        match self.coordinator {
            Some(id) => writeln!(f, "  Coordinator: {}", id)?,
            None => writeln!(f, "  Coordinator: unknown")?,
        }
        writeln!(f, "  Peers:")?;
        for peer in &self.peers {
            writeln!(
                f,
                "    {:>3}  {:<21}  {}",
                peer.id,
                peer.address.socket_addr(),
                if peer.alive { "alive" } else { "down" }
            )?;
        }
        let stats = &self.stats;
        writeln!(
            f,
            "  CS stats:    {} requests, {} entries, {} exits, {} timeouts, {} retries",
            stats.requests, stats.entries, stats.exits, stats.quorum_timeouts, stats.quorum_retries
        )?;
        if let (Some(min), Some(avg), Some(max)) = (stats.wait_min_ms, stats.wait_avg_ms, stats.wait_max_ms) {
            writeln!(f, "  Wait (ms):   min {} / avg {:.1} / max {}", min, avg, max)?;
        }
        write!(
            f,
            "  Messages:    {} sent, {} received, {} dropped",
            stats.total_sent(),
            stats.total_received(),
            stats.total_dropped()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PeerAddress;

    #[test]
    fn test_display_lists_peers_and_leader() {
        let status = NodeStatus {
            node_id: 2,
            clock: 14,
            mutex_state: MutexState::Wanted,
            request_clock: Some(12),
            awaiting: vec![3],
            replies: vec![1],
            deferred: vec![],
            election_state: ElectionState::Idle,
            coordinator: Some(3),
            peers: vec![
                PeerInfo {
                    id: 1,
                    address: PeerAddress::new("127.0.0.1", 5001),
                    alive: true,
                },
                PeerInfo {
                    id: 3,
                    address: PeerAddress::new("127.0.0.1", 5003),
                    alive: false,
                },
            ],
            stats: MutexStats::new(),
        };

        let text = status.to_string();
        assert!(text.contains("WANTED (request clock 12)"));
        assert!(text.contains("Coordinator: 3"));
        assert!(text.contains("Deferred:    -"));
        assert!(text.contains("127.0.0.1:5003"));
        assert!(text.contains("down"));

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["mutex_state"], "WANTED");
        assert_eq!(json["election_state"], "IDLE");
    }
}
