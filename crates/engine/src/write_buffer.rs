//! Shared write buffer: many producers, one drainer.
//!
//! A bounded byte ring. Producers reserve a contiguous region with a CAS on
//! the reserve cursor, copy their serialized entries in, then publish by
//! advancing the commit cursor in reservation order, so the drainer always
//! sees a contiguous, fully-written prefix. When the ring is full a
//! producer spins briefly, then parks; the drainer wakes it after freeing
//! space, or a shutdown wakes it with an error.
//!
//! Cursors are monotonically increasing logical offsets; `offset % capacity`
//! is the physical position. An entry may therefore straddle the physical
//! end of the allocation, which is exactly the wrap case the record codec's
//! `WrapBuf` handles.

use chunklog_core::{Error, RangeKey, Result};
use parking_lot::{Condvar, Mutex};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Spins before a producer parks on the space condvar.
const RESERVE_SPIN: usize = 256;

/// Spins before a publisher yields the CPU while waiting its turn.
const PUBLISH_SPIN: usize = 1024;

/// One posted region: a run of whole primary-format entries belonging to a
/// single backup range. The drainer partitions the committed prefix into
/// per-range sub-streams by these descriptors instead of re-deriving the
/// owner from entry headers (a migrated entry's header carries the chunk's
/// node, not the range owner).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub start: u64,
    pub len: u32,
    pub key: RangeKey,
}

/// Why the drainer woke up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainWake {
    /// Committed data is available (watermark reached, a producer is
    /// waiting for space, or the idle timeout found a trickle).
    Data,
    /// `signal_flush` was raised; drain whatever is committed.
    FlushNow,
    /// The store is closing; drain the remainder and exit.
    Shutdown,
}

struct Ring {
    bytes: Box<[UnsafeCell<u8>]>,
}

// Disjoint regions are handed to exactly one producer at a time; the
// drainer only reads regions whose publication it observed through the
// commit cursor (Release/Acquire).
unsafe impl Sync for Ring {}
unsafe impl Send for Ring {}

struct Inner {
    ring: Ring,
    capacity: usize,

    /// Next byte to hand out to a producer.
    reserve: AtomicU64,
    /// End of the contiguous published prefix.
    commit: AtomicU64,
    /// First byte not yet consumed by the drainer.
    read: AtomicU64,

    /// Region index: (owner, range) and extent of every posted batch, in
    /// no particular order until the drainer sorts its committed slice.
    regions: Mutex<Vec<Region>>,

    space_lock: Mutex<()>,
    space_cv: Condvar,
    waiting_producers: AtomicUsize,

    drain_lock: Mutex<()>,
    drain_cv: Condvar,
    flush_now: AtomicBool,

    shutdown: AtomicBool,
    low_watermark: usize,
}

/// Handle to the shared ring; clone freely.
#[derive(Clone)]
pub struct WriteBuffer {
    inner: Arc<Inner>,
}

impl WriteBuffer {
    pub fn new(capacity: usize) -> Self {
        let bytes = (0..capacity)
            .map(|_| UnsafeCell::new(0u8))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        WriteBuffer {
            inner: Arc::new(Inner {
                ring: Ring { bytes },
                capacity,
                reserve: AtomicU64::new(0),
                commit: AtomicU64::new(0),
                read: AtomicU64::new(0),
                regions: Mutex::new(Vec::new()),
                space_lock: Mutex::new(()),
                space_cv: Condvar::new(),
                waiting_producers: AtomicUsize::new(0),
                drain_lock: Mutex::new(()),
                drain_cv: Condvar::new(),
                flush_now: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                low_watermark: capacity / 2,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Committed bytes awaiting drain.
    pub fn occupancy(&self) -> usize {
        let inner = &self.inner;
        (inner.commit.load(Ordering::Acquire) - inner.read.load(Ordering::Acquire)) as usize
    }

    /// Copy a batch of serialized entries for one range into the ring;
    /// returns once the copy is complete and published.
    ///
    /// Blocks while the ring lacks space. Returns `Error::BufferFull` only
    /// when the batch exceeds the ring capacity outright, and
    /// `Error::Shutdown` if the store closes while waiting.
    pub fn post(&self, key: RangeKey, batch: &[u8]) -> Result<()> {
        let inner = &self.inner;
        let len = batch.len() as u64;
        if batch.is_empty() {
            return Ok(());
        }
        if batch.len() > inner.capacity {
            return Err(Error::BufferFull {
                requested: batch.len(),
                capacity: inner.capacity,
            });
        }

        // Reserve.
        let start = loop {
            if inner.shutdown.load(Ordering::Acquire) {
                return Err(Error::Shutdown);
            }
            let reserve = inner.reserve.load(Ordering::Acquire);
            let read = inner.read.load(Ordering::Acquire);
            if reserve + len - read > inner.capacity as u64 {
                self.wait_for_space()?;
                continue;
            }
            if inner
                .reserve
                .compare_exchange_weak(
                    reserve,
                    reserve + len,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                break reserve;
            }
        };

        self.inner.regions.lock().push(Region {
            start,
            len: batch.len() as u32,
            key,
        });

        // Copy into the reserved region, split at the physical end.
        let phys = (start % inner.capacity as u64) as usize;
        let first = (inner.capacity - phys).min(batch.len());
        // SAFETY: [start, start+len) was exclusively reserved above; the
        // drainer does not read past the commit cursor, which still sits at
        // or before `start`.
        unsafe {
            let base = inner.ring.bytes.as_ptr() as *mut u8;
            std::ptr::copy_nonoverlapping(batch.as_ptr(), base.add(phys), first);
            if first < batch.len() {
                std::ptr::copy_nonoverlapping(
                    batch.as_ptr().add(first),
                    base,
                    batch.len() - first,
                );
            }
        }

        // Publish in reservation order.
        let mut spins = 0usize;
        while inner.commit.load(Ordering::Acquire) != start {
            spins += 1;
            if spins % PUBLISH_SPIN == 0 {
                std::thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }
        inner.commit.store(start + len, Ordering::Release);

        if self.occupancy() >= inner.low_watermark {
            self.notify_drainer();
        }
        Ok(())
    }

    fn wait_for_space(&self) -> Result<()> {
        let inner = &self.inner;
        // Bounded spin first; drains are frequent under load.
        for _ in 0..RESERVE_SPIN {
            if inner.shutdown.load(Ordering::Acquire) {
                return Err(Error::Shutdown);
            }
            std::hint::spin_loop();
        }
        inner.waiting_producers.fetch_add(1, Ordering::AcqRel);
        // The drainer must run even below the watermark when producers
        // stall on a full ring.
        self.notify_drainer();
        {
            let mut guard = inner.space_lock.lock();
            if !inner.shutdown.load(Ordering::Acquire) {
                inner
                    .space_cv
                    .wait_for(&mut guard, Duration::from_millis(10));
            }
        }
        inner.waiting_producers.fetch_sub(1, Ordering::AcqRel);
        if inner.shutdown.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }
        Ok(())
    }

    /// Ask the drainer to flush whatever is committed.
    pub fn signal_flush(&self) {
        self.inner.flush_now.store(true, Ordering::Release);
        self.notify_drainer();
    }

    /// Stop accepting posts and wake everything.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        {
            let _guard = self.inner.space_lock.lock();
            self.inner.space_cv.notify_all();
        }
        self.notify_drainer();
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    fn notify_drainer(&self) {
        let _guard = self.inner.drain_lock.lock();
        self.inner.drain_cv.notify_one();
    }

    // ---- drainer side ----------------------------------------------------

    /// Block until there is work. The `idle_timeout` bounds latency for
    /// trickle traffic: on timeout, any committed bytes count as work.
    pub fn wait_for_work(&self, idle_timeout: Duration) -> DrainWake {
        let inner = &self.inner;
        let mut guard = inner.drain_lock.lock();
        loop {
            if inner.shutdown.load(Ordering::Acquire) {
                return DrainWake::Shutdown;
            }
            if inner.flush_now.swap(false, Ordering::AcqRel) {
                return DrainWake::FlushNow;
            }
            let occupancy = self.occupancy();
            if occupancy >= inner.low_watermark
                || (occupancy > 0 && inner.waiting_producers.load(Ordering::Acquire) > 0)
            {
                return DrainWake::Data;
            }
            let timed_out = inner
                .drain_cv
                .wait_for(&mut guard, idle_timeout)
                .timed_out();
            if timed_out && self.occupancy() > 0 {
                return DrainWake::Data;
            }
        }
    }

    /// Copy the committed region `[read, commit)` into `scratch`,
    /// preserving ring layout so wrapped entries stay wrapped.
    ///
    /// `scratch` must be `capacity` bytes. Returns
    /// `(bytes_until_end, length)` for building a `WrapBuf` over `scratch`,
    /// plus the commit cursor to pass to [`consume`](Self::consume).
    pub fn snapshot_into(&self, scratch: &mut [u8]) -> (usize, usize, u64) {
        let inner = &self.inner;
        debug_assert_eq!(scratch.len(), inner.capacity);
        let read = inner.read.load(Ordering::Acquire);
        let commit = inner.commit.load(Ordering::Acquire);
        let len = (commit - read) as usize;
        if len == 0 {
            return (inner.capacity, 0, commit);
        }

        let phys = (read % inner.capacity as u64) as usize;
        let first = (inner.capacity - phys).min(len);
        // SAFETY: [read, commit) is published (commit read with Acquire) and
        // not yet released back to producers, so no concurrent writes alias
        // these bytes.
        unsafe {
            let base = inner.ring.bytes.as_ptr() as *const u8;
            std::ptr::copy_nonoverlapping(base.add(phys), scratch.as_mut_ptr().add(phys), first);
            if first < len {
                std::ptr::copy_nonoverlapping(base, scratch.as_mut_ptr(), len - first);
            }
        }
        (inner.capacity - phys, len, commit)
    }

    /// Take the region descriptors fully contained in the committed prefix
    /// `[.., up_to)`, sorted by ring position. Later regions stay queued.
    pub fn take_regions(&self, up_to: u64) -> Vec<Region> {
        let mut regions = self.inner.regions.lock();
        let mut taken = Vec::new();
        regions.retain(|r| {
            if r.start + r.len as u64 <= up_to {
                taken.push(*r);
                false
            } else {
                true
            }
        });
        drop(regions);
        taken.sort_by_key(|r| r.start);
        taken
    }

    /// Release consumed bytes back to producers.
    pub fn consume(&self, up_to: u64) {
        self.inner.read.store(up_to, Ordering::Release);
        let _guard = self.inner.space_lock.lock();
        self.inner.space_cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunklog_format::WrapBuf;

    fn key() -> RangeKey {
        RangeKey::new(1, 0)
    }

    #[test]
    fn post_then_snapshot_round_trips() {
        let wb = WriteBuffer::new(1024);
        wb.post(key(), b"hello").unwrap();
        wb.post(key(), b" world").unwrap();
        assert_eq!(wb.occupancy(), 11);

        let mut scratch = vec![0u8; 1024];
        let (until_end, len, commit) = wb.snapshot_into(&mut scratch);
        assert_eq!(len, 11);
        let view = WrapBuf::new(&scratch, until_end);
        let mut out = vec![0u8; len];
        view.copy_to(0, &mut out);
        assert_eq!(&out, b"hello world");

        wb.consume(commit);
        assert_eq!(wb.occupancy(), 0);
    }

    #[test]
    fn oversized_batch_is_rejected() {
        let wb = WriteBuffer::new(64);
        let err = wb.post(key(), &[0u8; 65]).unwrap_err();
        assert!(matches!(err, Error::BufferFull { .. }));
    }

    #[test]
    fn data_wraps_across_the_physical_end() {
        let wb = WriteBuffer::new(32);
        wb.post(key(), &[1u8; 20]).unwrap();
        let mut scratch = vec![0u8; 32];
        let (_, _, commit) = wb.snapshot_into(&mut scratch);
        wb.consume(commit);

        // This 20-byte batch starts at offset 20 and wraps at 32.
        let batch: Vec<u8> = (0..20u8).collect();
        wb.post(key(), &batch).unwrap();
        let (until_end, len, _) = wb.snapshot_into(&mut scratch);
        assert_eq!(len, 20);
        assert_eq!(until_end, 12);
        let view = WrapBuf::new(&scratch, until_end);
        let mut out = vec![0u8; 20];
        view.copy_to(0, &mut out);
        assert_eq!(out, batch);
    }

    #[test]
    fn producer_blocks_until_drained() {
        let wb = WriteBuffer::new(64);
        wb.post(key(), &[7u8; 60]).unwrap();

        let wb2 = wb.clone();
        let producer = std::thread::spawn(move || wb2.post(key(), &[8u8; 30]));

        // Give the producer time to block on the full ring.
        std::thread::sleep(Duration::from_millis(50));
        assert!(!producer.is_finished());

        let mut scratch = vec![0u8; 64];
        let (_, len, commit) = wb.snapshot_into(&mut scratch);
        assert_eq!(len, 60);
        wb.consume(commit);

        producer.join().unwrap().unwrap();
        assert_eq!(wb.occupancy(), 30);
    }

    #[test]
    fn shutdown_unblocks_waiting_producer() {
        let wb = WriteBuffer::new(64);
        wb.post(key(), &[7u8; 60]).unwrap();

        let wb2 = wb.clone();
        let producer = std::thread::spawn(move || wb2.post(key(), &[8u8; 30]));
        std::thread::sleep(Duration::from_millis(50));

        wb.shutdown();
        let result = producer.join().unwrap();
        assert!(matches!(result, Err(Error::Shutdown)));
    }

    #[test]
    fn wait_for_work_sees_flush_and_shutdown() {
        let wb = WriteBuffer::new(64);
        wb.signal_flush();
        assert_eq!(wb.wait_for_work(Duration::from_millis(10)), DrainWake::FlushNow);

        wb.shutdown();
        assert_eq!(wb.wait_for_work(Duration::from_millis(10)), DrainWake::Shutdown);
    }

    #[test]
    fn idle_timeout_drains_trickles() {
        let wb = WriteBuffer::new(1024);
        wb.post(key(), b"tiny").unwrap(); // far below the watermark
        assert_eq!(wb.wait_for_work(Duration::from_millis(20)), DrainWake::Data);
    }

    #[test]
    fn concurrent_producers_preserve_per_producer_order() {
        let wb = WriteBuffer::new(1 << 16);
        let mut handles = Vec::new();
        for producer in 0..4u8 {
            let wb = wb.clone();
            handles.push(std::thread::spawn(move || {
                for seq in 0..100u8 {
                    wb.post(key(), &[producer, seq]).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let mut scratch = vec![0u8; 1 << 16];
        let (until_end, len, _) = wb.snapshot_into(&mut scratch);
        assert_eq!(len, 4 * 100 * 2);
        let view = WrapBuf::new(&scratch, until_end);

        let mut next_seq = [0u8; 4];
        let mut offset = 0;
        while offset < len {
            let producer = view.read_u8(offset) as usize;
            let seq = view.read_u8(offset + 1);
            assert_eq!(seq, next_seq[producer], "producer {producer} out of order");
            next_seq[producer] += 1;
            offset += 2;
        }
        assert_eq!(next_seq, [100; 4]);
    }
}
