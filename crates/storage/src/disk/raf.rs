//! Buffered random-access file backend.

use super::DiskBackend;
use chunklog_core::Result;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// File-backed store going through the OS page cache. No alignment
/// constraints; the kernel absorbs read-modify-write.
pub struct RandomAccessFile {
    file: File,
    path: PathBuf,
    size: u64,
    tail: AtomicU64,
    closed: AtomicBool,
}

impl RandomAccessFile {
    /// Open (creating if needed) and preallocate to `size` bytes.
    ///
    /// An existing file keeps its contents; the tail starts at zero and is
    /// repositioned by the owning log after it scans its records.
    pub fn open(path: &Path, size: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;
        file.set_len(size)?;
        Ok(RandomAccessFile {
            file,
            path: path.to_path_buf(),
            size,
            tail: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reposition the append tail, used after recovery scans.
    pub fn set_tail(&self, tail: u64) {
        self.tail.store(tail, Ordering::Release);
    }
}

impl DiskBackend for RandomAccessFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn append(&self, buf: &[u8]) -> Result<u64> {
        let offset = self.tail.fetch_add(buf.len() as u64, Ordering::AcqRel);
        self.file.write_all_at(buf, offset)?;
        Ok(offset + buf.len() as u64)
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
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
            self.file.sync_all()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn preallocates_to_requested_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log");
        let file = RandomAccessFile::open(&path, 64 * 1024).unwrap();
        assert_eq!(file.len(), 64 * 1024);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 64 * 1024);
    }

    #[test]
    fn write_then_read_round_trip() {
        let dir = tempdir().unwrap();
        let file = RandomAccessFile::open(&dir.path().join("log"), 8192).unwrap();
        file.write_at(100, b"hello disk").unwrap();
        let mut back = [0u8; 10];
        file.read_at(100, &mut back).unwrap();
        assert_eq!(&back, b"hello disk");
    }

    #[test]
    fn append_advances_tail() {
        let dir = tempdir().unwrap();
        let file = RandomAccessFile::open(&dir.path().join("log"), 8192).unwrap();
        assert_eq!(file.tail(), 0);
        let tail = file.append(b"abcd").unwrap();
        assert_eq!(tail, 4);
        let tail = file.append(b"efgh").unwrap();
        assert_eq!(tail, 8);
        let mut back = [0u8; 8];
        file.read_at(0, &mut back).unwrap();
        assert_eq!(&back, b"abcdefgh");
    }

    #[test]
    fn close_twice_is_ok() {
        let dir = tempdir().unwrap();
        let file = RandomAccessFile::open(&dir.path().join("log"), 4096).unwrap();
        file.close().unwrap();
        file.close().unwrap();
    }

    #[test]
    fn reopen_keeps_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log");
        {
            let file = RandomAccessFile::open(&path, 4096).unwrap();
            file.write_at(0, b"persist me").unwrap();
            file.close().unwrap();
        }
        let file = RandomAccessFile::open(&path, 4096).unwrap();
        let mut back = [0u8; 10];
        file.read_at(0, &mut back).unwrap();
        assert_eq!(&back, b"persist me");
    }
}
