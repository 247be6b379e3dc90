//! Warm decompression cursors and their LRU pool.
//!
//! A [`Reader`] is one decode session positioned at a particular
//! decompressed offset of a particular archive entry. Decoders cannot seek
//! backwards, so a reader only ever moves forward; reaching an earlier
//! position means opening a brand-new session and walking forward from the
//! start of the archive.
//!
//! The [`ReaderCache`] keeps released readers warm. If `/foo`, `/bar`,
//! `/baz` map to entries 60, 40 and 50, a naive open-read-close cycle
//! costs 60 + 40 + 50 header skips; with the cache the reader left at 40
//! is reused for 50, costing 60 + 40 + 10. For a natural-order bulk copy
//! the total work becomes linear in the archive size instead of quadratic.
//! Eligibility is decided by entry index and offset, never by pathname.

use std::{fmt, sync::Mutex};

use crate::{
    buffer::SideBufferPool,
    decoder::{DecoderError, DecoderSession, Result},
};

/// A cursor into the archive's decompression stream.
///
/// Owned by exactly one open file handle between acquire and release; the
/// cache's mutex only covers the brief hand-over.
pub struct Reader {
    session: Box<dyn DecoderSession>,
    /// Index of the entry whose header was read most recently. `None`
    /// until the first header, i.e. positioned before entry 0.
    index_within_archive: Option<u64>,
    offset_within_entry: u64,
}

impl fmt::Debug for Reader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reader")
            .field("index_within_archive", &self.index_within_archive)
            .field("offset_within_entry", &self.offset_within_entry)
            .finish_non_exhaustive()
    }
}

impl Reader {
    pub(crate) fn new(session: Box<dyn DecoderSession>) -> Self {
        Self {
            session,
            index_within_archive: None,
            offset_within_entry: 0,
        }
    }

    pub fn index_within_archive(&self) -> Option<u64> {
        self.index_within_archive
    }

    pub fn offset_within_entry(&self) -> u64 {
        self.offset_within_entry
    }

    /// The reader's position for cache-eligibility comparisons. `None`
    /// orders before every real position.
    fn position(&self) -> Option<(u64, u64)> {
        self.index_within_archive
            .map(|i| (i, self.offset_within_entry))
    }

    /// Walk forward, header by header, until positioned at the start of
    /// the `want`th entry. Crossing a header boundary resets the offset to
    /// zero.
    pub(crate) fn advance_index(&mut self, want: u64) -> Result<()> {
        while self.index_within_archive.is_none_or(|i| i < want) {
            if self.session.next_entry()?.is_none() {
                bail!(DecoderError::new(
                    "inconsistent archive: end of archive while skipping entries"
                ));
            }
            self.index_within_archive = Some(self.index_within_archive.map_or(0, |i| i + 1));
            self.offset_within_entry = 0;
        }
        Ok(())
    }

    /// Decompress forward until positioned at `want` bytes into the
    /// current entry, parking the skipped bytes in side buffers.
    ///
    /// When the distance exceeds one side buffer, the remainder modulo the
    /// slot capacity is read *first*: advancing 260KiB with 128KiB slots
    /// reads 4 + 128 + 128, not 128 + 128 + 4, so the final fill before
    /// `want` is a full slot. Immediately-following sequential reads then
    /// have the best chance of hitting cache. This chunking order is a
    /// deliberate policy, not an accident.
    pub(crate) fn advance_offset(&mut self, want: u64, pool: &SideBufferPool) -> Result<()> {
        if want < self.offset_within_entry {
            bail!(DecoderError::new("cannot seek backwards in decode stream"));
        }
        let index = self
            .index_within_archive
            .ok_or_else(|| DecoderError::new("reader is not positioned at an entry"))?;

        let capacity = pool.slot_capacity() as u64;
        while self.offset_within_entry < want {
            let origin = self.offset_within_entry;
            let mut fill_len = want - origin;
            if fill_len > capacity {
                fill_len %= capacity;
                if fill_len == 0 {
                    fill_len = capacity;
                }
            }

            let session = &mut self.session;
            let n = pool.fill(index, origin, fill_len as usize, |buf| session.read(buf))?;
            if n == 0 {
                bail!(DecoderError::new(
                    "entry data ended before the requested offset"
                ));
            }
            self.offset_within_entry += n as u64;
        }
        Ok(())
    }

    /// Decompress up to `dst.len()` bytes of the current entry directly
    /// into `dst`, advancing the offset by the amount actually produced.
    pub(crate) fn read(&mut self, dst: &mut [u8]) -> Result<usize> {
        let n = self.session.read(dst)?;
        self.offset_within_entry += n as u64;
        Ok(n)
    }
}

/// A fixed-size pool of idle warm readers.
pub struct ReaderCache {
    inner: Mutex<CacheInner>,
}

struct CacheInner {
    slots: Box<[Option<Saved>]>,
    next_lru_priority: u64,
}

struct Saved {
    reader: Reader,
    lru_priority: u64,
}

impl fmt::Debug for ReaderCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("ReaderCache")
            .field("capacity", &inner.slots.len())
            .field(
                "occupied",
                &inner.slots.iter().filter(|s| s.is_some()).count(),
            )
            .finish_non_exhaustive()
    }
}

impl ReaderCache {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                slots: (0..capacity).map(|_| None).collect(),
                next_lru_priority: 0,
            }),
        }
    }

    /// Return a reader positioned at offset 0 of the `want`th entry,
    /// reusing the closest eligible cached reader or opening a fresh
    /// session via `open_fresh`. Session opening and header skipping both
    /// happen outside the pool lock.
    pub(crate) fn acquire<F>(&self, want: u64, open_fresh: F) -> Result<Reader>
    where
        F: FnOnce() -> Result<Reader>,
    {
        let mut reader = match self.take_closest(want) {
            Some(r) => r,
            None => {
                trace!("reader cache miss for entry {want}: opening a fresh session");
                open_fresh()?
            }
        };
        reader.advance_index(want)?;
        Ok(reader)
    }

    /// Among idle readers positioned at or before `(want, 0)`, take the
    /// one with the greatest position, minimizing forward-skip work.
    fn take_closest(&self, want: u64) -> Option<Reader> {
        let mut inner = self.inner.lock().unwrap();
        let best = inner
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| {
                let pos = s.as_ref()?.reader.position();
                (pos <= Some((want, 0))).then_some((pos, i))
            })
            .max()?
            .1;
        let taken = inner.slots[best].take().expect("slot was matched");
        trace!(
            "reader cache hit for entry {want}: reusing position {:?}",
            taken.reader.position()
        );
        Some(taken.reader)
    }

    /// Return a reader to the pool. A full pool evicts (and thereby
    /// closes) the idle reader with the lowest LRU priority; empty slots
    /// count as priority 0 and are filled first, in scan order.
    pub(crate) fn release(&self, reader: Reader) {
        let mut inner = self.inner.lock().unwrap();
        inner.next_lru_priority += 1;
        let stamp = inner.next_lru_priority;
        let victim = inner
            .slots
            .iter()
            .enumerate()
            .min_by_key(|(_, s)| s.as_ref().map_or(0, |s| s.lru_priority))
            .map(|(i, _)| i)
            .expect("pool is never empty");
        inner.slots[victim] = Some(Saved {
            reader,
            lru_priority: stamp,
        });
    }
}
