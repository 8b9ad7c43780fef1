use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ProtocolError;

pub type NodeId = u64;
pub type ClockValue = u64;

/// Largest timestamp accepted off the wire (the JSON safe-integer range).
pub const MAX_TIMESTAMP: ClockValue = 1 << 53;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    Request,
    Reply,
    Election,
    Answer,
    Coordinator,
    Heartbeat,
}

impl MessageKind {
    pub const ALL: [MessageKind; 6] = [
        MessageKind::Request,
        MessageKind::Reply,
        MessageKind::Election,
        MessageKind::Answer,
        MessageKind::Coordinator,
        MessageKind::Heartbeat,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Request => "REQUEST",
            MessageKind::Reply => "REPLY",
            MessageKind::Election => "ELECTION",
            MessageKind::Answer => "ANSWER",
            MessageKind::Coordinator => "COORDINATOR",
            MessageKind::Heartbeat => "HEARTBEAT",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One frame on the wire.
///
/// `request_clock` is carried by REQUEST (the clock of the request being
/// made, unchanged across retries) and REPLY (the clock of the request being
/// answered). Other kinds leave it out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub sender: NodeId,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub timestamp: ClockValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_clock: Option<ClockValue>,
}

impl Message {
    pub fn new(sender: NodeId, kind: MessageKind, timestamp: ClockValue) -> Self {
        Self {
            sender,
            kind,
            timestamp,
            request_clock: None,
        }
    }

    pub fn with_request_clock(mut self, request_clock: ClockValue) -> Self {
        self.request_clock = Some(request_clock);
        self
    }

    /// The clock a REQUEST competes with. Older peers send only `timestamp`.
    pub fn effective_request_clock(&self) -> ClockValue {
        self.request_clock.unwrap_or(self.timestamp)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(ProtocolError::from)
    }

    /// Parse and validate a frame payload.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let message: Message = serde_json::from_slice(bytes)?;
        message.validate()?;
        Ok(message)
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.sender == 0 {
            return Err(ProtocolError::InvalidSender(self.sender));
        }
        if self.timestamp > MAX_TIMESTAMP {
            return Err(ProtocolError::TimestampOutOfRange(self.timestamp));
        }
        if let Some(clock) = self.request_clock {
            if clock > MAX_TIMESTAMP {
                return Err(ProtocolError::TimestampOutOfRange(clock));
            }
        }
        Ok(())
    }
}
