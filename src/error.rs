use thiserror::Error;

use crate::protocol::{ClockValue, NodeId};

#[derive(Debug, Error)]
pub enum CoordError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Mutex(#[from] MutexError),

    #[error("Node {0} is not running in this process")]
    UnknownNode(NodeId),

    #[error("Node is shutting down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, CoordError>;

impl CoordError {
    pub fn config(msg: impl Into<String>) -> Self {
        CoordError::Config(msg.into())
    }
}

/// Local invariant violations and quorum failures of the mutual-exclusion
/// engine. None of these leave shared state modified.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MutexError {
    #[error("critical section already requested")]
    AlreadyWanted,

    #[error("critical section already held")]
    AlreadyHeld,

    #[error("critical section is not held")]
    NotHeld,

    #[error("timed out waiting for replies")]
    QuorumTimeout,
}

/// Reasons an inbound frame is discarded without tearing down its connection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("invalid sender {0}")]
    InvalidSender(NodeId),

    #[error("timestamp {0} out of range")]
    TimestampOutOfRange(ClockValue),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::Malformed(e.to_string())
    }
}
