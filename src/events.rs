//! Structured observability events.
//!
//! Events are a write-only stream: one JSON object per state transition or
//! message, printed on stdout and optionally shipped to a remote collector.
//! Diagnostic logging goes through `tracing` instead.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::io::Write;
use std::sync::Arc;
use tracing::warn;

use crate::config::SinkConfig;
use crate::protocol::{ClockValue, NodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    ClockUpdate,
    SendMessage,
    EnterCs,
    ExitCs,
    LeaderUpdate,
    NodeDown,
    ElectionStart,
    MutexStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeEvent {
    pub event_type: EventType,
    pub node_id: NodeId,
    pub clock: ClockValue,
    pub timestamp: DateTime<Utc>,
    pub details: serde_json::Value,
}

impl NodeEvent {
    pub fn new(event_type: EventType, node_id: NodeId, clock: ClockValue, details: serde_json::Value) -> Self {
        Self {
            event_type,
            node_id,
            clock,
            timestamp: Utc::now(),
            details,
        }
    }

    pub fn to_json_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"event_type":"{:?}","node_id":{},"error":"{}"}}"#, self.event_type, self.node_id, e)
        })
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: &NodeEvent);
}

/// Prints each event as a JSON line on stdout.
#[derive(Debug, Default)]
pub struct StdoutSink;

impl EventSink for StdoutSink {
    fn emit(&self, event: &NodeEvent) {
        let line = event.to_json_line();
        let mut out = std::io::stdout().lock();
        let _ = writeln!(out, "{}", line);
    }
}

/// Keeps events in memory; used by tests and embedders.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<NodeEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<NodeEvent> {
        self.events.lock().clone()
    }

    pub fn of_type(&self, event_type: EventType) -> Vec<NodeEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: &NodeEvent) {
        self.events.lock().push(event.clone());
    }
}

#[cfg(feature = "remote-sink")]
pub use remote::RemoteSink;

#[cfg(feature = "remote-sink")]
mod remote {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    const QUEUE_DEPTH: usize = 1024;
    const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

    /// Prints locally and forwards events to an HTTP collector from a
    /// background task, so emitting never waits on the network. When the
    /// collector falls behind and the queue fills, events are dropped and
    /// counted instead of buffered.
    pub struct RemoteSink {
        local: StdoutSink,
        tx: mpsc::Sender<NodeEvent>,
        dropped: AtomicU64,
    }

    impl RemoteSink {
        /// Must be called inside a tokio runtime.
        pub fn spawn(node_id: NodeId, config: &SinkConfig, endpoint: String) -> reqwest::Result<Self> {
            let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
            let (tx, mut rx) = mpsc::channel::<NodeEvent>(QUEUE_DEPTH);
            let log_group = config.log_group.clone();
            let log_stream = format!("Node_{}", node_id);
            let region = config.region.clone();

            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    let body = serde_json::json!({
                        "log_group": log_group,
                        "log_stream": log_stream,
                        "region": region,
                        "timestamp": event.timestamp.timestamp_millis(),
                        "message": event.to_json_line(),
                    });
                    match client.post(&endpoint).json(&body).send().await {
                        Ok(resp) if !resp.status().is_success() => {
                            warn!("Event collector returned {}", resp.status());
                        }
                        Ok(_) => {}
                        Err(e) => warn!("Failed to ship event: {}", e),
                    }
                }
            });

            Ok(Self::with_queue(tx))
        }

        fn with_queue(tx: mpsc::Sender<NodeEvent>) -> Self {
            Self {
                local: StdoutSink,
                tx,
                dropped: AtomicU64::new(0),
            }
        }

        /// Events that never made it into the shipping queue.
        pub fn dropped(&self) -> u64 {
            self.dropped.load(Ordering::Relaxed)
        }
    }

    impl EventSink for RemoteSink {
        fn emit(&self, event: &NodeEvent) {
            self.local.emit(event);
            if let Err(mpsc::error::TrySendError::Full(_)) = self.tx.try_send(event.clone()) {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % 1000 == 0 {
                    warn!(node = event.node_id, dropped, "Event collector is behind; dropping events");
                }
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_full_queue_drops_and_counts() {
            let (tx, mut rx) = mpsc::channel(2);
            let sink = RemoteSink::with_queue(tx);
            for clock in 0..5 {
                sink.emit(&NodeEvent::new(EventType::SendMessage, 1, clock, serde_json::json!({})));
            }
            assert_eq!(sink.dropped(), 3);

            // The oldest events were kept
            assert_eq!(rx.try_recv().unwrap().clock, 0);
            assert_eq!(rx.try_recv().unwrap().clock, 1);
            assert!(rx.try_recv().is_err());
        }
    }
}

/// Pick the sink the environment asks for, falling back to stdout.
pub fn sink_from_config(node_id: NodeId, config: &SinkConfig) -> Arc<dyn EventSink> {
    if !config.remote {
        return Arc::new(StdoutSink);
    }
    match &config.endpoint {
        #[cfg(feature = "remote-sink")]
        Some(endpoint) => match RemoteSink::spawn(node_id, config, endpoint.clone()) {
            Ok(sink) => Arc::new(sink),
            Err(e) => {
                warn!(node = node_id, "Cannot build event collector client: {}; printing locally", e);
                Arc::new(StdoutSink)
            }
        },
        #[cfg(not(feature = "remote-sink"))]
        Some(_) => {
            warn!(node = node_id, "Built without remote-sink support; printing events locally");
            Arc::new(StdoutSink)
        }
        None => {
            warn!(
                node = node_id,
                region = %config.region,
                "Remote events requested but EVENT_SINK_ENDPOINT is unset; printing locally"
            );
            Arc::new(StdoutSink)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_schema() {
        let event = NodeEvent::new(
            EventType::EnterCs,
            3,
            42,
            serde_json::json!({"request_clock": 40}),
        );
        let value: serde_json::Value = serde_json::from_str(&event.to_json_line()).unwrap();
        assert_eq!(value["event_type"], "ENTER_CS");
        assert_eq!(value["node_id"], 3);
        assert_eq!(value["clock"], 42);
        assert_eq!(value["details"]["request_clock"], 40);
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn test_memory_sink_filters() {
        let sink = MemorySink::new();
        sink.emit(&NodeEvent::new(EventType::NodeDown, 1, 1, serde_json::Value::Null));
        sink.emit(&NodeEvent::new(EventType::LeaderUpdate, 1, 2, serde_json::Value::Null));
        sink.emit(&NodeEvent::new(EventType::NodeDown, 1, 3, serde_json::Value::Null));

        assert_eq!(sink.events().len(), 3);
        assert_eq!(sink.of_type(EventType::NodeDown).len(), 2);
        sink.clear();
        assert!(sink.events().is_empty());
    }

    #[test]
    fn test_local_sink_without_remote() {
        // Must not need a runtime when remote shipping is off
        let sink = sink_from_config(1, &SinkConfig::default());
        sink.emit(&NodeEvent::new(EventType::MutexStats, 1, 0, serde_json::json!({})));
    }
}
