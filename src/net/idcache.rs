//! Packet-id cache: remembers which packets passed through and who sent
//! them.
//!
//! Storage is a fixed ring of 1024 slots overwritten in write order, plus a
//! 64-bucket hash index over the packet id for O(1) lookup. A slot keeps its
//! `(id, dest)` key findable after its origin handle has been taken, so
//! duplicates of an already-acknowledged packet are still suppressed.

use std::sync::{Arc, Mutex};

use super::connection::Connection;
use super::types::{lock, now_ms};

/// Number of ring slots. After this many distinct packets the oldest entry
/// is overwritten.
pub const CACHE_SLOTS: usize = 1024;

const HASH_BITS: u32 = 6;
const HASH_BUCKETS: usize = 1 << HASH_BITS;

/// Hash over the packet id: `((id & 0xFF) * 33 + (id >> 8)) mod 64`.
fn bucket_of(id: u16) -> usize {
    ((id as usize & 0xFF) * 33 + (id as usize >> 8)) & (HASH_BUCKETS - 1)
}

#[derive(Default)]
struct Slot {
    origin: Option<Arc<Connection>>,
    /// Set by [`IdCache::stamp`] when the packet goes out; 0 until then.
    time_ms: u64,
    id: u16,
    dest: u8,
    /// Which hash bucket currently indexes this slot, if any.
    bucket: Option<usize>,
}

struct Inner {
    slots: Vec<Slot>,
    /// Per-bucket lists of slot indices.
    buckets: Vec<Vec<usize>>,
    write: usize,
}

impl Inner {
    fn find(&self, bucket: usize, dest: u8, id: u16) -> Option<usize> {
        self.buckets[bucket]
            .iter()
            .copied()
            .find(|&i| self.slots[i].id == id && self.slots[i].dest == dest)
    }
}

/// The dedup cache. One lock guards ring, index and entry fields.
pub struct IdCache {
    inner: Mutex<Inner>,
}

impl Default for IdCache {
    fn default() -> Self {
        Self::new()
    }
}

impl IdCache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                slots: (0..CACHE_SLOTS).map(|_| Slot::default()).collect(),
                buckets: vec![Vec::new(); HASH_BUCKETS],
                write: 0,
            }),
        }
    }

    /// Records that a packet `(id, dest)` arrived from `conn`. Returns true
    /// when the packet was seen before; the entry is left untouched then.
    /// Otherwise the slot at the write pointer is overwritten: its old
    /// origin handle is dropped, its old index entry unlinked, and the ring
    /// advances.
    pub fn put(&self, conn: &Arc<Connection>, dest: u8, id: u16) -> bool {
        let mut inner = lock(&self.inner);
        let bucket = bucket_of(id);
        if inner.find(bucket, dest, id).is_some() {
            return true;
        }

        let w = inner.write;
        if let Some(old_bucket) = inner.slots[w].bucket.take() {
            inner.buckets[old_bucket].retain(|&i| i != w);
        }
        inner.slots[w] = Slot {
            origin: Some(Arc::clone(conn)),
            time_ms: 0,
            id,
            dest,
            bucket: Some(bucket),
        };
        inner.buckets[bucket].push(w);
        inner.write = (w + 1) % CACHE_SLOTS;
        false
    }

    /// Moves the origin handle out of the entry for `(id, dest)`, along with
    /// the time the packet was stamped out. Returns `None` when there is no
    /// entry or its origin was already taken; each entry gives up its origin
    /// at most once, which keeps ack relaying at-most-once.
    pub fn take_origin(&self, dest: u8, id: u16) -> Option<(Arc<Connection>, u64)> {
        let mut inner = lock(&self.inner);
        let idx = inner.find(bucket_of(id), dest, id)?;
        let slot = &mut inner.slots[idx];
        let origin = slot.origin.take()?;
        Some((origin, slot.time_ms))
    }

    /// Sets the send timestamp on an existing entry. Never creates one.
    pub fn stamp(&self, dest: u8, id: u16) {
        let mut inner = lock(&self.inner);
        if let Some(idx) = inner.find(bucket_of(id), dest, id) {
            inner.slots[idx].time_ms = now_ms();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::connection::ConnectionTable;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn conn(table: &ConnectionTable, port: u16) -> Arc<Connection> {
        table
            .create_unless_exists(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
            .unwrap()
    }

    #[test]
    fn test_put_detects_duplicates() {
        let table = ConnectionTable::new();
        let cache = IdCache::new();
        let c = conn(&table, 4000);

        assert!(!cache.put(&c, 1, 42));
        assert!(cache.put(&c, 1, 42));
    }

    #[test]
    fn test_same_id_different_dest_is_distinct() {
        let table = ConnectionTable::new();
        let cache = IdCache::new();
        let c = conn(&table, 4000);

        assert!(!cache.put(&c, 0, 42));
        assert!(!cache.put(&c, 1, 42));
        assert!(cache.put(&c, 0, 42));
    }

    #[test]
    fn test_take_origin_moves_out_once() {
        let table = ConnectionTable::new();
        let cache = IdCache::new();
        let c = conn(&table, 4000);

        cache.put(&c, 1, 7);
        assert_eq!(Arc::strong_count(&c), 3);

        let (origin, time) = cache.take_origin(1, 7).unwrap();
        assert!(Arc::ptr_eq(&origin, &c));
        assert_eq!(time, 0);
        drop(origin);
        // the cache no longer holds a reference
        assert_eq!(Arc::strong_count(&c), 2);

        assert!(cache.take_origin(1, 7).is_none());
    }

    #[test]
    fn test_dedup_survives_taken_origin() {
        let table = ConnectionTable::new();
        let cache = IdCache::new();
        let c = conn(&table, 4000);

        cache.put(&c, 1, 7);
        cache.take_origin(1, 7);
        // still a known packet even though its origin is gone
        assert!(cache.put(&c, 1, 7));
    }

    #[test]
    fn test_stamp_sets_time_on_existing_entry() {
        let table = ConnectionTable::new();
        let cache = IdCache::new();
        let c = conn(&table, 4000);

        cache.stamp(1, 7); // no entry, no effect
        cache.put(&c, 1, 7);
        cache.stamp(1, 7);
        let (_, time) = cache.take_origin(1, 7).unwrap();
        assert!(time > 0);
    }

    #[test]
    fn test_ring_overwrites_oldest() {
        let table = ConnectionTable::new();
        let cache = IdCache::new();
        let c = conn(&table, 4000);

        for id in 0..=(CACHE_SLOTS as u16) {
            assert!(!cache.put(&c, 1, id));
        }
        // id 0 was evicted by entry number 1025, id 1 is still resident
        assert!(cache.take_origin(1, 0).is_none());
        assert!(cache.take_origin(1, 1).is_some());
        // the evicted id is insertable again
        assert!(!cache.put(&c, 1, 0));
    }

    #[test]
    fn test_colliding_ids_coexist_in_one_bucket() {
        // 1 and 16385 both hash to bucket 33
        assert_eq!(bucket_of(1), bucket_of(16385));

        let table = ConnectionTable::new();
        let cache = IdCache::new();
        let c = conn(&table, 4000);

        cache.put(&c, 1, 1);
        cache.put(&c, 1, 16385);
        assert!(cache.take_origin(1, 1).is_some());
        assert!(cache.take_origin(1, 16385).is_some());
    }

    #[test]
    fn test_eviction_drops_the_origin_reference() {
        let table = ConnectionTable::new();
        let cache = IdCache::new();
        let old = conn(&table, 4000);
        let new = conn(&table, 4001);

        cache.put(&old, 1, 0);
        assert_eq!(Arc::strong_count(&old), 3);
        for id in 1..=(CACHE_SLOTS as u16) {
            cache.put(&new, 1, id);
        }
        assert_eq!(Arc::strong_count(&old), 2);
    }
}
