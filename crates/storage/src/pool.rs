//! Bounded pool of segment-sized aligned buffers.
//!
//! Segment reads (reorganization, recovery) and aligned staging writes all
//! need a segment-sized page-aligned buffer. Allocating those per operation
//! would thrash the allocator, so a fixed set is created up front and
//! borrowed with blocking semantics: `acquire` parks the caller until a
//! buffer is free or the pool shuts down.

use crate::align::AlignedBuf;
use chunklog_core::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

struct PoolInner {
    free: Mutex<Vec<AlignedBuf>>,
    available: Condvar,
    shutdown: AtomicBool,
    buf_len: usize,
    capacity: usize,
}

/// Fixed-capacity buffer pool. Cheap to clone via `Arc`.
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Create `capacity` buffers of `buf_len` bytes aligned to `align`.
    pub fn new(capacity: usize, buf_len: usize, align: usize) -> Self {
        let free = (0..capacity).map(|_| AlignedBuf::new(buf_len, align)).collect();
        BufferPool {
            inner: Arc::new(PoolInner {
                free: Mutex::new(free),
                available: Condvar::new(),
                shutdown: AtomicBool::new(false),
                buf_len,
                capacity,
            }),
        }
    }

    /// Borrow a buffer, blocking until one is free.
    ///
    /// Contents are whatever the previous borrower left; callers overwrite
    /// the region they use. Returns `Error::Shutdown` if the pool is shut
    /// down while waiting.
    pub fn acquire(&self) -> Result<PooledBuffer> {
        let mut free = self.inner.free.lock();
        loop {
            if self.inner.shutdown.load(Ordering::Acquire) {
                return Err(Error::Shutdown);
            }
            if let Some(buf) = free.pop() {
                return Ok(PooledBuffer {
                    buf: Some(buf),
                    pool: Arc::clone(&self.inner),
                });
            }
            self.inner.available.wait(&mut free);
        }
    }

    /// Buffers currently free.
    pub fn free_count(&self) -> usize {
        self.inner.free.lock().len()
    }

    pub fn buffer_len(&self) -> usize {
        self.inner.buf_len
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Wake all waiters with `Shutdown`. Outstanding buffers may still be
    /// returned afterwards; they are simply dropped.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        let _guard = self.inner.free.lock();
        self.inner.available.notify_all();
    }
}

impl Clone for BufferPool {
    fn clone(&self) -> Self {
        BufferPool {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// RAII borrow of a pool buffer; returns it on drop.
pub struct PooledBuffer {
    buf: Option<AlignedBuf>,
    pool: Arc<PoolInner>,
}

impl std::ops::Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_ref().expect("buffer present until drop")
    }
}

impl std::ops::DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_mut().expect("buffer present until drop")
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            if self.pool.shutdown.load(Ordering::Acquire) {
                return;
            }
            let mut free = self.pool.free.lock();
            free.push(buf);
            self.pool.available.notify_one();
        }
    }
}
