//! Node-wide constants and types for the mesh overlay.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

/// Default TCP listen port.
pub const DEFAULT_PORT: u16 = 3333;

/// Number of worker threads draining the send queue.
pub const NUM_SENDERS: usize = 3;

/// Default route timeout in milliseconds. A route that was requested but not
/// acknowledged within this window falls back to broadcast.
pub const DEFAULT_ROUTE_TIMEOUT_MS: u64 = 200;

/// Smallest accepted route timeout. Anything below this is rejected at
/// startup; an acknowledgement round trip alone can eat a few milliseconds.
pub const MIN_ROUTE_TIMEOUT_MS: u64 = 10;

/// Listen backlog for the accepting socket.
pub const LISTEN_BACKLOG: i32 = 10;

/// What this node terminates, if anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    /// Forwarding only.
    #[default]
    Normal,
    /// Terminates packets with destination bit 1 ('Z').
    Destination,
    /// Terminates packets with destination bit 0 ('Q').
    Source,
}

impl Role {
    /// Whether a packet with the given destination bit ends its journey here.
    pub fn is_terminus(self, dest: u8) -> bool {
        matches!(
            (self, dest & 0x01),
            (Role::Source, 0) | (Role::Destination, 1)
        )
    }

    /// Single-letter tag used in log output.
    pub fn letter(self) -> char {
        match self {
            Role::Normal => '-',
            Role::Destination => 'Z',
            Role::Source => 'Q',
        }
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Locks a mutex, recovering the guard if a holder panicked. Every guarded
/// section in this crate leaves its structure consistent at all exit points.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminus_matching() {
        assert!(Role::Source.is_terminus(0));
        assert!(Role::Destination.is_terminus(1));
        assert!(!Role::Source.is_terminus(1));
        assert!(!Role::Destination.is_terminus(0));
        assert!(!Role::Normal.is_terminus(0));
        assert!(!Role::Normal.is_terminus(1));
    }

    #[test]
    fn test_terminus_uses_low_bit_only() {
        assert!(Role::Destination.is_terminus(0xFF));
        assert!(Role::Source.is_terminus(0xFE));
    }
}
