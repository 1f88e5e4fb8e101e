//! Direct-I/O file backend (`O_DIRECT`).
//!
//! Transfers bypass the page cache, so the kernel insists that offset,
//! length and user buffer address are all block-aligned; the engine uses
//! the flash page size as the alignment unit and allocates I/O buffers
//! through [`crate::AlignedBuf`].

use super::{check_aligned, DiskBackend};
use chunklog_core::Result;
use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// File opened with `O_DIRECT`. Also the workhorse behind the raw-device
/// backend, which differs only in open flags and preallocation.
pub struct DirectFile {
    fd: libc::c_int,
    path: PathBuf,
    size: u64,
    page: u32,
    tail: AtomicU64,
    closed: AtomicBool,
}

// The fd is used only through positional syscalls; no shared cursor.
unsafe impl Send for DirectFile {}
unsafe impl Sync for DirectFile {}

fn cpath(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))
}

impl DirectFile {
    /// Open (creating if needed) with `O_DIRECT` and preallocate to `size`.
    pub fn open(path: &Path, size: u64, page: u32) -> Result<Self> {
        let file = Self::open_with_flags(
            path,
            size,
            page,
            libc::O_RDWR | libc::O_CREAT | libc::O_DIRECT,
        )?;
        // SAFETY: fd is a valid descriptor owned by `file`.
        let rc = unsafe { libc::ftruncate(file.fd, size as libc::off_t) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            let _ = file.close();
            return Err(err.into());
        }
        Ok(file)
    }

    /// Open an existing node (device or file) without creating or resizing.
    pub(crate) fn open_existing(path: &Path, size: u64, page: u32) -> Result<Self> {
        Self::open_with_flags(path, size, page, libc::O_RDWR | libc::O_DIRECT)
    }

    fn open_with_flags(path: &Path, size: u64, page: u32, flags: libc::c_int) -> Result<Self> {
        let cpath = cpath(path)?;
        // SAFETY: cpath is a valid NUL-terminated string.
        let fd = unsafe { libc::open(cpath.as_ptr(), flags, 0o644 as libc::c_uint) };
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(DirectFile {
            fd,
            path: path.to_path_buf(),
            size,
            page,
            tail: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn set_tail(&self, tail: u64) {
        self.tail.store(tail, Ordering::Release);
    }

    fn pread_all(&self, mut offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut done = 0usize;
        while done < buf.len() {
            // SAFETY: the slice outlives the call and done stays in bounds.
            let rc = unsafe {
                libc::pread(
                    self.fd,
                    buf[done..].as_mut_ptr() as *mut libc::c_void,
                    buf.len() - done,
                    offset as libc::off_t,
                )
            };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err.into());
            }
            if rc == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "short direct read",
                )
                .into());
            }
            done += rc as usize;
            offset += rc as u64;
        }
        Ok(())
    }

    fn pwrite_all(&self, mut offset: u64, buf: &[u8]) -> Result<()> {
        let mut done = 0usize;
        while done < buf.len() {
            // SAFETY: the slice outlives the call and done stays in bounds.
            let rc = unsafe {
                libc::pwrite(
                    self.fd,
                    buf[done..].as_ptr() as *const libc::c_void,
                    buf.len() - done,
                    offset as libc::off_t,
                )
            };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err.into());
            }
            done += rc as usize;
            offset += rc as u64;
        }
        Ok(())
    }
}

impl DiskBackend for DirectFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_aligned(offset, buf.len(), buf.as_ptr() as usize, self.page)?;
        self.pread_all(offset, buf)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        check_aligned(offset, buf.len(), buf.as_ptr() as usize, self.page)?;
        self.pwrite_all(offset, buf)
    }

    fn append(&self, buf: &[u8]) -> Result<u64> {
        let offset = self.tail.load(Ordering::Acquire);
        check_aligned(offset, buf.len(), buf.as_ptr() as usize, self.page)?;
        self.pwrite_all(offset, buf)?;
        let new_tail = offset + buf.len() as u64;
        self.tail.store(new_tail, Ordering::Release);
        Ok(new_tail)
    }

    fn sync(&self) -> Result<()> {
        // SAFETY: fd is valid until close() flips the flag.
        let rc = unsafe { libc::fdatasync(self.fd) };
        if rc != 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }

    fn len(&self) -> u64 {
        self.size
    }

    fn tail(&self) -> u64 {
        self.tail.load(Ordering::Acquire)
    }

    fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            // SAFETY: first close; fd has not been released yet.
            let rc = unsafe { libc::close(self.fd) };
            if rc != 0 {
                return Err(io::Error::last_os_error().into());
            }
        }
        Ok(())
    }
}

impl Drop for DirectFile {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::align::AlignedBuf;
    use tempfile::tempdir;

    const PAGE: u32 = 4096;

    // O_DIRECT may be refused by some test filesystems (e.g. tmpfs); skip
    // rather than fail in that case.
    fn try_open(path: &Path, size: u64) -> Option<DirectFile> {
        DirectFile::open(path, size, PAGE).ok()
    }

    #[test]
    fn aligned_write_read_round_trip() {
        let dir = tempdir().unwrap();
        let Some(file) = try_open(&dir.path().join("log"), 64 * 1024) else {
            return;
        };
        let mut out = AlignedBuf::new(PAGE as usize, PAGE as usize);
        out[0] = 0xAA;
        out[PAGE as usize - 1] = 0xBB;
        file.write_at(PAGE as u64, &out).unwrap();

        let mut back = AlignedBuf::new(PAGE as usize, PAGE as usize);
        file.read_at(PAGE as u64, &mut back).unwrap();
        assert_eq!(back[0], 0xAA);
        assert_eq!(back[PAGE as usize - 1], 0xBB);
    }

    #[test]
    fn unaligned_requests_are_rejected() {
        let dir = tempdir().unwrap();
        let Some(file) = try_open(&dir.path().join("log"), 64 * 1024) else {
            return;
        };
        let buf = AlignedBuf::new(PAGE as usize, PAGE as usize);
        // Unaligned offset
        assert!(file.write_at(17, &buf).is_err());
        // Unaligned length
        assert!(file.write_at(0, &buf[..100]).is_err());
    }

    #[test]
    fn close_twice_is_ok() {
        let dir = tempdir().unwrap();
        let Some(file) = try_open(&dir.path().join("log"), 16 * 1024) else {
            return;
        };
        file.close().unwrap();
        file.close().unwrap();
    }
}
