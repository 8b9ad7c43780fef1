use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::protocol::MessageKind;

/// Critical-section and message counters for one node
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MutexStats {
    /// Critical-section requests started
    pub requests: u64,
    /// Times the critical section was entered
    pub entries: u64,
    pub exits: u64,
    /// Requests abandoned with `QuorumTimeout`
    pub quorum_timeouts: u64,
    /// Reply rounds re-sent under the retry policy
    pub quorum_retries: u64,
    pub deferred_replies_sent: u64,
    pub wait_min_ms: Option<u64>,
    pub wait_max_ms: Option<u64>,
    pub wait_avg_ms: Option<f64>,
    #[serde(skip)]
    wait_total: Duration,
    pub messages_sent: BTreeMap<MessageKind, u64>,
    pub messages_received: BTreeMap<MessageKind, u64>,
    /// Sends the transport refused after the transition queued them
    pub messages_dropped: BTreeMap<MessageKind, u64>,
}

impl MutexStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&mut self) {
        self.requests += 1;
    }

    /// Record an entry and how long the request waited for it
    pub fn record_entry(&mut self, waited: Duration) {
        self.entries += 1;
        self.wait_total += waited;

        let ms = waited.as_millis() as u64;
        self.wait_min_ms = Some(self.wait_min_ms.map_or(ms, |m| m.min(ms)));
        self.wait_max_ms = Some(self.wait_max_ms.map_or(ms, |m| m.max(ms)));
        self.wait_avg_ms = Some(self.wait_total.as_secs_f64() * 1000.0 / self.entries as f64);
    }

    pub fn record_exit(&mut self, deferred_replies: usize) {
        self.exits += 1;
        self.deferred_replies_sent += deferred_replies as u64;
    }

    pub fn record_retry(&mut self) {
        self.quorum_retries += 1;
    }

    pub fn record_timeout(&mut self) {
        self.quorum_timeouts += 1;
    }

    pub fn record_sent(&mut self, kind: MessageKind) {
        *self.messages_sent.entry(kind).or_insert(0) += 1;
    }

    pub fn record_received(&mut self, kind: MessageKind) {
        *self.messages_received.entry(kind).or_insert(0) += 1;
    }

    pub fn record_dropped(&mut self, kind: MessageKind) {
        *self.messages_dropped.entry(kind).or_insert(0) += 1;
    }

    pub fn total_sent(&self) -> u64 {
        self.messages_sent.values().sum()
    }

    pub fn total_received(&self) -> u64 {
        self.messages_received.values().sum()
    }

    pub fn total_dropped(&self) -> u64 {
        self.messages_dropped.values().sum()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_times() {
        let mut stats = MutexStats::new();
        assert_eq!(stats.wait_avg_ms, None);

        stats.record_entry(Duration::from_millis(100));
        stats.record_entry(Duration::from_millis(300));
        stats.record_entry(Duration::from_millis(200));

        assert_eq!(stats.entries, 3);
        assert_eq!(stats.wait_min_ms, Some(100));
        assert_eq!(stats.wait_max_ms, Some(300));
        assert!((stats.wait_avg_ms.unwrap() - 200.0).abs() < 0.001);
    }

    #[test]
    fn test_message_counts() {
        let mut stats = MutexStats::new();
        stats.record_sent(MessageKind::Request);
        stats.record_sent(MessageKind::Request);
        stats.record_sent(MessageKind::Heartbeat);
        stats.record_received(MessageKind::Reply);
        stats.record_dropped(MessageKind::Heartbeat);

        assert_eq!(stats.messages_sent[&MessageKind::Request], 2);
        assert_eq!(stats.total_sent(), 3);
        assert_eq!(stats.total_received(), 1);
        assert_eq!(stats.total_dropped(), 1);

        let json = stats.to_json();
        assert_eq!(json["messages_sent"]["REQUEST"], 2);
        assert!(json.get("wait_total").is_none());
    }

    #[test]
    fn test_exit_accounting() {
        let mut stats = MutexStats::new();
        stats.record_exit(3);
        stats.record_exit(0);
        stats.record_timeout();
        assert_eq!(stats.exits, 2);
        assert_eq!(stats.deferred_replies_sent, 3);
        assert_eq!(stats.quorum_timeouts, 1);
    }
}
