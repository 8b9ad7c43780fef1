#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use coord_node::config::{PeerAddress, PeerMap};
use coord_node::events::MemorySink;
use coord_node::{Node, NodeConfig, NodeId};

/// Timings scaled down so a cluster settles in well under a second.
pub fn fast_config() -> NodeConfig {
    NodeConfig {
        heartbeat_interval_ms: 100,
        heartbeat_jitter_ms: 20,
        heartbeat_timeout_ms: 400,
        answer_timeout_ms: 300,
        coordinator_timeout_ms: 600,
        mutex_reply_timeout_ms: 2000,
        cs_hold_ms: 60,
        bootstrap_delay_ms: 200,
        tick_interval_ms: 20,
        connect_timeout_ms: 200,
        write_timeout_ms: 200,
        reconnect_backoff_min_ms: 50,
        reconnect_backoff_max_ms: 200,
        ..NodeConfig::default()
    }
}

pub async fn bind_local() -> TcpListener {
    TcpListener::bind("127.0.0.1:0").await.expect("bind localhost")
}

/// A port nothing listens on.
pub async fn dead_port() -> u16 {
    let listener = bind_local().await;
    listener.local_addr().unwrap().port()
}

pub struct TestCluster {
    pub members: PeerMap,
    pub nodes: Vec<Node>,
    pub sinks: Vec<Arc<MemorySink>>,
}

impl TestCluster {
    /// Start nodes `1..=size` except those in `absent`, which stay in the
    /// membership but never run.
    pub async fn start(size: NodeId, absent: &[NodeId], config: NodeConfig) -> Self {
        let mut members = PeerMap::new();
        let mut listeners = Vec::new();
        for id in 1..=size {
            if absent.contains(&id) {
                members.insert(id, PeerAddress::new("127.0.0.1", dead_port().await));
            } else {
                let listener = bind_local().await;
                let port = listener.local_addr().unwrap().port();
                members.insert(id, PeerAddress::new("127.0.0.1", port));
                listeners.push((id, listener));
            }
        }

        let mut nodes = Vec::new();
        let mut sinks = Vec::new();
        for (id, listener) in listeners {
            let sink = Arc::new(MemorySink::new());
            let node = Node::start_with_listener(id, &members, config.clone(), sink.clone(), listener)
                .expect("node starts");
            nodes.push(node);
            sinks.push(sink);
        }
        Self { members, nodes, sinks }
    }

    pub fn node(&self, id: NodeId) -> &Node {
        self.nodes.iter().find(|n| n.id() == id).expect("node is running")
    }

    pub fn sink(&self, id: NodeId) -> &MemorySink {
        let index = self.nodes.iter().position(|n| n.id() == id).expect("node is running");
        &self.sinks[index]
    }

    pub async fn shutdown(&self) {
        for node in &self.nodes {
            node.shutdown().await;
        }
    }
}

/// Poll `check` every 20ms until it holds or `limit` passes.
pub async fn wait_until<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
