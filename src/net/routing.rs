//! Adaptive routing: two slots, one per destination bit, learned from the
//! timing of acknowledgements.
//!
//! A slot is usable when its connection is active and either was validated
//! by an ack or was requested no longer than the route timeout ago. Lookups
//! open a fresh probing window whenever the previous one expired, so a node
//! without acknowledgements unicasts hopefully for one window, broadcasts
//! once, and repeats.

use std::sync::{Arc, Mutex};

use tracing::debug;

use super::connection::Connection;
use super::idcache::IdCache;
use super::packet::Packet;
use super::types::{lock, now_ms};

/// A validation older than this many milliseconds is wiped on the next
/// lookup, leaving the probing window as the only thing keeping unicast
/// alive. The decay test pins the unicast/broadcast cadence this produces.
const VALIDATION_WINDOW_MS: u64 = 5;

#[derive(Default)]
struct RouteSlot {
    /// When a lookup last opened a probing window.
    last_requested: u64,
    /// When an ack last validated this route; 0 when unvalidated.
    last_validated: u64,
    conn: Option<Arc<Connection>>,
}

impl RouteSlot {
    fn usable(&self, timeout_ms: u64, now: u64) -> bool {
        match &self.conn {
            Some(conn) if conn.ok() => {
                self.last_validated > 0 || self.last_requested + timeout_ms > now
            }
            _ => false,
        }
    }
}

/// The two-entry routing table.
pub struct RoutingTable {
    timeout_ms: u64,
    slots: Mutex<[RouteSlot; 2]>,
}

impl RoutingTable {
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            timeout_ms,
            slots: Mutex::new([RouteSlot::default(), RouteSlot::default()]),
        }
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    /// Returns the connection to unicast this packet on, or `None` for
    /// broadcast. Also stamps the packet's cache entry with the send time,
    /// which [`Self::mark_alive`] later measures the ack against, and
    /// updates the slot's probing/validation timestamps.
    pub fn get(&self, packet: &Packet, cache: &IdCache) -> Option<Arc<Connection>> {
        let dest = packet.dest();
        cache.stamp(dest, packet.id());

        let now = now_ms();
        let mut slots = lock(&self.slots);
        let slot = &mut slots[(dest & 0x01) as usize];

        let route = if slot.usable(self.timeout_ms, now) {
            slot.conn.clone()
        } else {
            None
        };

        if slot.last_validated + VALIDATION_WINDOW_MS < now {
            slot.last_validated = 0;
        }
        if slot.last_requested + self.timeout_ms < now {
            slot.last_requested = now;
        }

        route
    }

    /// Called when an ack arrives from `conn` for a packet stamped at
    /// `time_sent`. Installs `conn` as the route for `dest` only when the
    /// current slot is unusable; a usable slot holding a different
    /// connection is left alone, so a fresher path never preempts a route
    /// that still works. Acks slower than the timeout prove nothing and are
    /// ignored.
    pub fn mark_alive(&self, conn: &Arc<Connection>, dest: u8, time_sent: u64) {
        let now = now_ms();
        if now.saturating_sub(time_sent) > self.timeout_ms {
            debug!("route via {} alive but too slow", conn.addr());
            return;
        }

        let mut slots = lock(&self.slots);
        let slot = &mut slots[(dest & 0x01) as usize];

        if !slot.usable(self.timeout_ms, now) {
            slot.conn = Some(Arc::clone(conn));
            slot.last_validated = now;
            debug!("new route for dest {}: {}", dest, conn.addr());
        } else if slot.conn.as_ref().is_some_and(|c| Arc::ptr_eq(c, conn)) {
            slot.last_validated = now;
            debug!("re-validated route for dest {}: {}", dest, conn.addr());
        }
    }
}
