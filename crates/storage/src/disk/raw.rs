//! Raw block-device backend.
//!
//! The operator points `raw_device_path` at a prepared partition or device
//! node; the engine then treats it as one fixed-size byte array. Open never
//! creates or resizes anything, and the configured size must not exceed the
//! device capacity; the device is used exactly as handed over.

use super::{direct::DirectFile, DiskBackend};
use chunklog_core::Result;
use std::path::Path;

/// A raw device handle. All I/O rules are the direct-I/O rules; only the
/// open path differs.
pub struct RawDevice {
    inner: DirectFile,
}

impl RawDevice {
    pub fn open(device: &Path, size: u64, page: u32) -> Result<Self> {
        Ok(RawDevice {
            inner: DirectFile::open_existing(device, size, page)?,
        })
    }

    pub fn path(&self) -> &Path {
        self.inner.path()
    }

    pub fn set_tail(&self, tail: u64) {
        self.inner.set_tail(tail)
    }
}

impl DiskBackend for RawDevice {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.inner.read_at(offset, buf)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        self.inner.write_at(offset, buf)
    }

    fn append(&self, buf: &[u8]) -> Result<u64> {
        self.inner.append(buf)
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }

    fn len(&self) -> u64 {
        self.inner.len()
    }

    fn tail(&self) -> u64 {
        self.inner.tail()
    }

    fn close(&self) -> Result<()> {
        self.inner.close()
    }
}
