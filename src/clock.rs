//! Lamport logical clock.

use crate::protocol::ClockValue;

/// Monotonic counter ordering events by happened-before.
///
/// Not internally synchronized: the clock lives inside the node state and is
/// only touched while the node lock is held.
#[derive(Debug, Default, Clone)]
pub struct LamportClock {
    value: ClockValue,
}

impl LamportClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance for a local event (a send) and return the new value.
    pub fn tick(&mut self) -> ClockValue {
        self.value += 1;
        self.value
    }

    /// Merge a received timestamp: `max(current, received) + 1`.
    pub fn observe(&mut self, received: ClockValue) -> ClockValue {
        self.value = self.value.max(received) + 1;
        self.value
    }

    pub fn current(&self) -> ClockValue {
        self.value
    }
}
