pub mod cli;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod logging;
pub mod metrics;
pub mod node;
pub mod peers;
pub mod protocol;
pub mod transport;

// Re-export common types
pub use clock::LamportClock;
pub use config::{NodeConfig, PeerMap, QuorumPolicy, SinkConfig};
pub use error::{CoordError, MutexError, ProtocolError, Result};
pub use events::{EventSink, EventType, NodeEvent};
pub use node::{Node, NodeStatus};
pub use protocol::{ClockValue, Message, MessageKind, NodeId};
