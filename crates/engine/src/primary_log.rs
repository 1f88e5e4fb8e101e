//! Circular primary log.
//!
//! All small batches, across every backup range, are appended here in
//! primary format before being staged into their secondary buffers. The
//! log is a fixed-size byte ring on disk: the head advances with appends,
//! the tail advances as staged bytes reach their secondary logs and the
//! primary copy becomes redundant. Only the drainer appends.
//!
//! Appends are padded to the flash page, so the head is always
//! page-aligned and direct I/O needs no read-modify-write. The pad bytes
//! are zero; a scan would stop at them, which is fine since nothing reads
//! the primary log in normal operation. It exists to bound the loss window
//! for bytes still sitting in secondary buffers.

use chunklog_core::{Error, Result};
use chunklog_format::WrapBuf;
use chunklog_storage::{BufferPool, DiskBackend};
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

pub struct PrimaryLog {
    disk: Box<dyn DiskBackend>,
    size: u64,
    page: u32,
    pool: BufferPool,
    /// Logical append position (monotonic).
    head: AtomicU64,
    /// Logical reclaim position (monotonic, `head - tail <= size`).
    tail: AtomicU64,
    write_lock: Mutex<()>,
}

impl PrimaryLog {
    pub fn new(disk: Box<dyn DiskBackend>, page: u32, pool: BufferPool) -> Self {
        let size = disk.len();
        PrimaryLog {
            disk,
            size,
            page,
            pool,
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
            write_lock: Mutex::new(()),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.size
    }

    /// Bytes between tail and head.
    pub fn occupancy(&self) -> u64 {
        self.head.load(Ordering::Acquire) - self.tail.load(Ordering::Acquire)
    }

    pub fn free_space(&self) -> u64 {
        self.size - self.occupancy()
    }

    pub fn head(&self) -> u64 {
        self.head.load(Ordering::Acquire)
    }

    /// Append `len` logical bytes from `view` starting at `offset`,
    /// zero-padded to the flash page. Returns the logical offset the
    /// region was written at.
    ///
    /// The caller must ensure free space first (flushing secondary buffers
    /// releases the tail); an overrun here is a logic error reported as an
    /// I/O failure rather than silent corruption of unreclaimed records.
    pub fn append_region(&self, view: &WrapBuf<'_>, offset: usize, len: usize) -> Result<u64> {
        let _guard = self.write_lock.lock();
        let page = self.page as usize;
        let padded = round_up(len, page) as u64;
        if padded > self.free_space() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::Other,
                "primary log overrun: tail not released before append",
            )));
        }

        let start = self.head.load(Ordering::Acquire);
        let buf_len = self.pool.buffer_len();
        let mut buf = self.pool.acquire()?;

        let mut written = 0usize;
        while written < padded as usize {
            let chunk = buf_len.min(padded as usize - written);
            let src = len.saturating_sub(written).min(chunk);
            view.copy_to(offset + written, &mut buf[..src]);
            buf[src..chunk].fill(0);
            self.write_circular(start + written as u64, &buf[..chunk])?;
            written += chunk;
        }

        self.head.store(start + padded, Ordering::Release);
        Ok(start)
    }

    /// Advance the tail: everything below `new_tail` has reached a
    /// secondary log and may be overwritten.
    pub fn release(&self, new_tail: u64) {
        // Single writer updates head; tail only moves forward.
        let prev = self.tail.load(Ordering::Acquire);
        if new_tail > prev {
            self.tail.store(new_tail, Ordering::Release);
        }
    }

    pub fn sync(&self) -> Result<()> {
        self.disk.sync()
    }

    pub fn close(&self) -> Result<()> {
        self.disk.close()
    }

    fn write_circular(&self, logical: u64, bytes: &[u8]) -> Result<()> {
        let pos = logical % self.size;
        let first = ((self.size - pos) as usize).min(bytes.len());
        self.disk.write_at(pos, &bytes[..first])?;
        if first < bytes.len() {
            self.disk.write_at(0, &bytes[first..])?;
        }
        Ok(())
    }
}

fn round_up(value: usize, multiple: usize) -> usize {
    (value + multiple - 1) / multiple * multiple
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunklog_core::DiskAccess;
    use chunklog_storage::open_backend;
    use tempfile::tempdir;

    const PAGE: u32 = 512;
    const SIZE: u64 = 8 * 1024;

    fn make_log(dir: &std::path::Path) -> PrimaryLog {
        let disk = open_backend(DiskAccess::Raf, &dir.join("primary.log"), SIZE, PAGE).unwrap();
        PrimaryLog::new(disk, PAGE, BufferPool::new(2, 2048, PAGE as usize))
    }

    #[test]
    fn appends_advance_the_head_page_aligned() {
        let dir = tempdir().unwrap();
        let log = make_log(dir.path());
        let data = vec![0xCDu8; 700];
        let at = log.append_region(&WrapBuf::linear(&data), 0, data.len()).unwrap();
        assert_eq!(at, 0);
        assert_eq!(log.head(), 1024); // 700 padded to two 512-byte pages
        assert_eq!(log.occupancy(), 1024);
    }

    #[test]
    fn release_frees_space() {
        let dir = tempdir().unwrap();
        let log = make_log(dir.path());
        let data = vec![1u8; 4096];
        log.append_region(&WrapBuf::linear(&data), 0, data.len()).unwrap();
        assert_eq!(log.free_space(), SIZE - 4096);
        log.release(4096);
        assert_eq!(log.free_space(), SIZE);
        // Tail never moves backwards.
        log.release(100);
        assert_eq!(log.free_space(), SIZE);
    }

    #[test]
    fn append_wraps_around_the_file_end() {
        let dir = tempdir().unwrap();
        let log = make_log(dir.path());
        let fill = vec![2u8; 6 * 1024];
        log.append_region(&WrapBuf::linear(&fill), 0, fill.len()).unwrap();
        log.release(6 * 1024);

        // This append crosses the physical end of the 8 KiB file.
        let data: Vec<u8> = (0..4096u16).map(|i| i as u8).collect();
        let at = log.append_region(&WrapBuf::linear(&data), 0, data.len()).unwrap();
        assert_eq!(at, 6 * 1024);
        assert_eq!(log.head(), 10 * 1024);
    }

    #[test]
    fn overrun_without_release_is_rejected() {
        let dir = tempdir().unwrap();
        let log = make_log(dir.path());
        let data = vec![3u8; SIZE as usize];
        log.append_region(&WrapBuf::linear(&data), 0, data.len()).unwrap();
        let err = log
            .append_region(&WrapBuf::linear(&data), 0, 512)
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
