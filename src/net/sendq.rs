//! Bounded FIFO between receivers and the sender pool.
//!
//! A fixed ring of 100 `(packet, origin)` entries with two condition
//! variables. Producers block while the queue is full (backpressure, never
//! drops); consumers block while it is empty. Each resident entry owns a
//! handle on the packet's origin connection, released when the entry is
//! consumed.

use std::sync::{Arc, Condvar, Mutex};

use super::connection::Connection;
use super::packet::Packet;
use super::types::lock;

/// Queue capacity. Producers block above this.
pub const SEND_QUEUE_SIZE: usize = 100;

struct Inner {
    ring: Vec<Option<(Packet, Arc<Connection>)>>,
    read: usize,
    write: usize,
    len: usize,
    shutdown: bool,
}

/// The send queue. FIFO order is strict; consumers are interchangeable.
pub struct SendQueue {
    inner: Mutex<Inner>,
    not_full: Condvar,
    not_empty: Condvar,
}

impl Default for SendQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl SendQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                ring: (0..SEND_QUEUE_SIZE).map(|_| None).collect(),
                read: 0,
                write: 0,
                len: 0,
                shutdown: false,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
        }
    }

    /// Enqueues a copy of the packet together with a handle on its origin.
    /// Blocks while the queue is full. During shutdown the entry is
    /// silently dropped.
    pub fn add(&self, packet: &Packet, origin: &Arc<Connection>) {
        let entry = (packet.clone(), Arc::clone(origin));

        let mut inner = lock(&self.inner);
        while inner.len == SEND_QUEUE_SIZE && !inner.shutdown {
            inner = self
                .not_full
                .wait(inner)
                .unwrap_or_else(|e| e.into_inner());
        }
        if inner.shutdown {
            return;
        }

        let w = inner.write;
        inner.ring[w] = Some(entry);
        inner.write = (w + 1) % SEND_QUEUE_SIZE;
        inner.len += 1;
        drop(inner);

        self.not_empty.notify_all();
    }

    /// Dequeues the oldest entry, blocking while the queue is empty.
    /// Ownership of the packet and the origin handle moves to the caller.
    /// Returns `None` once the queue is shut down and drained.
    pub fn get(&self) -> Option<(Packet, Arc<Connection>)> {
        let mut inner = lock(&self.inner);
        while inner.len == 0 && !inner.shutdown {
            inner = self
                .not_empty
                .wait(inner)
                .unwrap_or_else(|e| e.into_inner());
        }
        if inner.len == 0 {
            return None;
        }

        let r = inner.read;
        let entry = inner.ring[r].take();
        inner.read = (r + 1) % SEND_QUEUE_SIZE;
        inner.len -= 1;
        drop(inner);

        self.not_full.notify_all();
        entry
    }

    /// Wakes every blocked producer and consumer; consumers drain what is
    /// left and then see `None`.
    pub fn shut_down(&self) {
        lock(&self.inner).shutdown = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
