//! Uniform disk interface over three backends.
//!
//! The engine performs every log I/O through [`DiskBackend`]:
//!
//! - [`raf::RandomAccessFile`]: plain buffered file through the page cache
//! - [`direct::DirectFile`]: `O_DIRECT` file, page-aligned transfers only
//! - [`raw::RawDevice`]: raw block device, same alignment rules
//!
//! All offsets are explicit; there is no shared file position, so recovery
//! workers can read one handle in parallel. `append` tracks a tail cursor
//! internally and returns the new tail. `close` is idempotent and the only
//! place an fsync is implied; callers needing durability mid-stream call
//! `sync`.

pub mod direct;
pub mod raf;
pub mod raw;

use chunklog_core::{DiskAccess, Result};
use std::path::Path;

/// Byte-granularity disk handle. Direct and raw backends additionally
/// require offset, length and buffer address to be flash-page multiples.
pub trait DiskBackend: Send + Sync {
    /// Read `buf.len()` bytes starting at `offset`.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write `buf` at `offset`, without moving the append tail.
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Write `buf` at the current tail; returns the new tail.
    fn append(&self, buf: &[u8]) -> Result<u64>;

    /// Flush device caches for everything written so far.
    fn sync(&self) -> Result<()>;

    /// Fixed capacity the handle was opened with.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current append tail.
    fn tail(&self) -> u64;

    /// Flush and release the handle. Safe to call twice; the second call
    /// performs no I/O.
    fn close(&self) -> Result<()>;
}

/// Open a backend of the configured kind, preallocated to `size` bytes.
///
/// For `Raw`, `path` is the device node and `size` must not exceed the
/// device capacity; the device contents are used as-is.
pub fn open_backend(
    access: DiskAccess,
    path: &Path,
    size: u64,
    page_size: u32,
) -> Result<Box<dyn DiskBackend>> {
    match access {
        DiskAccess::Raf => Ok(Box::new(raf::RandomAccessFile::open(path, size)?)),
        DiskAccess::Dir => Ok(Box::new(direct::DirectFile::open(path, size, page_size)?)),
        DiskAccess::Raw => Ok(Box::new(raw::RawDevice::open(path, size, page_size)?)),
    }
}

/// Alignment check shared by the direct and raw backends.
pub(crate) fn check_aligned(offset: u64, len: usize, addr: usize, page: u32) -> Result<()> {
    let page = page as u64;
    if offset % page != 0 || len as u64 % page != 0 || addr as u64 % page != 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!(
                "unaligned direct I/O: offset {offset}, len {len}, addr {addr:#x} (page {page})"
            ),
        )
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_check_accepts_page_multiples() {
        assert!(check_aligned(8192, 4096, 0x7f00_0000_0000, 4096).is_ok());
    }

    #[test]
    fn alignment_check_rejects_each_violation() {
        assert!(check_aligned(100, 4096, 0, 4096).is_err());
        assert!(check_aligned(4096, 100, 0, 4096).is_err());
        assert!(check_aligned(4096, 4096, 7, 4096).is_err());
    }
}
