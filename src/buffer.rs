//! Side buffers: a small cache of recently-decompressed byte ranges.
//!
//! When a reader has to advance through an entry's bytes to reach a
//! requested offset, the skipped bytes are valid decompressed output that
//! some caller may ask for shortly: kernel readahead is known to reorder
//! conceptually consecutive reads, and overlapping requests arrive out of
//! order. Instead of discarding those bytes, they land in a side buffer so
//! the late request is a memcpy rather than a second decompression pass
//! from the start of the entry.
//!
//! The pool is a fixed array of fixed-size slots with an LRU stamp each.
//! Eviction scans the array for the smallest stamp; the arrays are small
//! and the scan order on ties is part of the observable behavior, so this
//! stays a linear scan rather than a priority queue.

use std::{fmt, mem, sync::Mutex};

use crate::decoder::Result;

/// LRU stamp of a slot whose fill is decompressing outside the lock.
const BUSY: u64 = u64::MAX;

struct Slot {
    /// `None` marks an invalid (empty or reclaimed) slot.
    index_within_archive: Option<u64>,
    offset_within_entry: u64,
    length: usize,
    lru_priority: u64,
    data: Box<[u8]>,
}

impl Slot {
    /// Whether this slot holds all of `[offset, offset + len)` of entry
    /// `index`.
    fn contains(&self, index: u64, offset: u64, len: usize) -> bool {
        self.index_within_archive == Some(index)
            && self.offset_within_entry <= offset
            && (self.length as u64).saturating_sub(offset - self.offset_within_entry)
                >= len as u64
    }
}

/// A bounded pool of side buffers shared by all readers of a mount.
///
/// Lookups and slot metadata updates run under the pool's single mutex as
/// one scan-and-update. The decompression of a fill runs outside it, with
/// the victim slot marked busy, so readers looking up other slots never
/// wait on an in-flight decode.
pub struct SideBufferPool {
    inner: Mutex<PoolInner>,
    slot_capacity: usize,
}

struct PoolInner {
    slots: Box<[Slot]>,
    next_lru_priority: u64,
}

impl fmt::Debug for SideBufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("SideBufferPool")
            .field("slots", &inner.slots.len())
            .field("slot_capacity", &self.slot_capacity)
            .finish_non_exhaustive()
    }
}

impl SideBufferPool {
    /// `count` and `capacity` are validated by [`Config`][crate::Config]
    /// before the pool is built.
    pub(crate) fn new(count: usize, capacity: usize) -> Self {
        let slots = (0..count)
            .map(|_| Slot {
                index_within_archive: None,
                offset_within_entry: 0,
                length: 0,
                lru_priority: 0,
                data: vec![0u8; capacity].into_boxed_slice(),
            })
            .collect();
        Self {
            inner: Mutex::new(PoolInner {
                slots,
                next_lru_priority: 0,
            }),
            slot_capacity: capacity,
        }
    }

    /// The byte capacity of one slot.
    pub fn slot_capacity(&self) -> usize {
        self.slot_capacity
    }

    /// Serve `dst` from cache if some slot covers the whole requested
    /// range. Among covering slots the one with the greatest length (most
    /// surrounding context) wins and has its LRU stamp bumped. Never
    /// touches the decompression stream.
    pub fn read_into(&self, index: u64, offset: u64, dst: &mut [u8]) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let best = inner
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.contains(index, offset, dst.len()))
            .max_by_key(|(_, s)| s.length)
            .map(|(i, _)| i);
        let Some(best) = best else { return false };

        inner.next_lru_priority += 1;
        let stamp = inner.next_lru_priority;
        let slot = &mut inner.slots[best];
        slot.lru_priority = stamp;
        let skip = (offset - slot.offset_within_entry) as usize;
        dst.copy_from_slice(&slot.data[skip..skip + dst.len()]);
        trace!("side buffer hit: entry {index} offset {offset} len {}", dst.len());
        true
    }

    /// Reclaim the least-recently-used slot and fill its first `len` bytes
    /// via `f` (which decompresses into it). On success the slot is
    /// published for the range `[offset, offset + n)` of entry `index`,
    /// where `n` is the byte count `f` produced; on failure the slot is
    /// left invalid. `f` runs without the pool lock held; the victim is
    /// marked busy so a concurrent fill picks a different slot.
    pub(crate) fn fill<F>(&self, index: u64, offset: u64, len: usize, f: F) -> Result<usize>
    where
        F: FnOnce(&mut [u8]) -> Result<usize>,
    {
        debug_assert!(len <= self.slot_capacity);
        let (victim, mut data) = {
            let mut inner = self.inner.lock().unwrap();
            let victim = inner
                .slots
                .iter()
                .enumerate()
                .filter(|(_, s)| s.lru_priority != BUSY)
                .min_by_key(|(_, s)| s.lru_priority)
                .map(|(i, _)| i);
            let Some(victim) = victim else {
                // Every slot has a decode in flight. Decompress into
                // scratch and skip caching rather than wait.
                drop(inner);
                let mut scratch = vec![0u8; len];
                return f(&mut scratch);
            };
            let slot = &mut inner.slots[victim];
            slot.index_within_archive = None;
            slot.lru_priority = BUSY;
            (victim, mem::take(&mut slot.data))
        };

        let result = f(&mut data[..len]);

        let mut inner = self.inner.lock().unwrap();
        inner.next_lru_priority += 1;
        let stamp = inner.next_lru_priority;
        let slot = &mut inner.slots[victim];
        slot.data = data;
        match result {
            Ok(n) => {
                debug_assert!(n <= len);
                slot.index_within_archive = Some(index);
                slot.offset_within_entry = offset;
                slot.length = n;
                slot.lru_priority = stamp;
                Ok(n)
            }
            Err(err) => {
                slot.length = 0;
                slot.lru_priority = 0;
                Err(err)
            }
        }
    }
}

// Lets the initialization scan reuse the pool as scratch space for the
// raw-archive size probe; the probed bytes stay cached as a side effect.
impl SideBufferPool {
    pub(crate) fn probe_scratch<F>(&self, index: u64, offset: u64, f: F) -> Result<usize>
    where
        F: FnOnce(&mut [u8]) -> Result<usize>,
    {
        self.fill(index, offset, self.slot_capacity, f)
    }
}
