//! Store configuration.
//!
//! [`StoreConfig`] carries every tunable knob. It is deserializable so an
//! external loader can populate it from JSON, validates itself before the
//! engine starts, and offers builder-style setters plus a `for_testing()`
//! preset with small sizes.
//!
//! [`CodecConfig`] is the small immutable subset the record codec needs. It
//! is derived once at init and threaded through the engine by value; nothing
//! mutates it afterwards.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How log files hit the disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskAccess {
    /// Buffered random-access file through the page cache.
    Raf,
    /// Direct I/O file (`O_DIRECT`); offsets, lengths and buffer addresses
    /// must be flash-page aligned.
    Dir,
    /// Raw block device; same alignment rules as `Dir`, device prepared by
    /// the operator.
    Raw,
}

impl Default for DiskAccess {
    fn default() -> Self {
        DiskAccess::Raf
    }
}

/// Immutable codec parameters, fixed at engine construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecConfig {
    /// Append a CRC-32 over the payload to every entry.
    pub use_checksums: bool,
    /// Stamp every entry with seconds-since-init.
    pub use_timestamps: bool,
    /// Secondary log segment size in bytes.
    pub segment_size: u32,
}

impl CodecConfig {
    /// Largest payload an unchained entry may carry: anything above half a
    /// segment is split into a chain.
    pub fn max_unchained_payload(&self) -> u32 {
        self.segment_size / 2
    }
}

/// Full store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding the primary log and all per-range files.
    pub backup_directory: PathBuf,

    /// Disk access mode for primary and secondary logs.
    pub harddrive_access: DiskAccess,

    /// Block device path, required when `harddrive_access` is `Raw`.
    pub raw_device_path: Option<PathBuf>,

    /// Protect payloads with CRC-32 checksums.
    pub use_checksums: bool,

    /// Stamp entries with seconds-since-init for age-aware reorganization.
    pub use_timestamps: bool,

    /// Flash page size in bytes; the alignment unit for direct I/O.
    pub flash_page_size: u32,

    /// Secondary log segment size in bytes.
    pub log_segment_size: u32,

    /// Capacity of the circular primary log in bytes.
    pub primary_log_size: u64,

    /// Capacity of each per-range secondary log file in bytes.
    pub secondary_log_size: u64,

    /// Capacity of the shared write buffer in bytes.
    pub write_buffer_size: usize,

    /// Capacity of each per-range secondary buffer in bytes.
    pub secondary_log_buffer_size: u32,

    /// Utilization percentage above which a secondary log is queued for
    /// low-priority reorganization.
    pub utilization_activate_reorganization: u8,

    /// Utilization percentage above which the reorganizer keeps going
    /// without yielding between segments.
    pub utilization_prompt_reorganization: u8,

    /// Age in seconds at which a segment's age score saturates during
    /// victim selection.
    pub cold_data_threshold_sec: u32,

    /// Number of segment-sized buffers in the shared pool.
    pub buffer_pool_buffers: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            backup_directory: PathBuf::from("backup"),
            harddrive_access: DiskAccess::Raf,
            raw_device_path: None,
            use_checksums: true,
            use_timestamps: true,
            flash_page_size: 4 * 1024,
            log_segment_size: 8 * 1024 * 1024,
            primary_log_size: 256 * 1024 * 1024,
            secondary_log_size: 256 * 1024 * 1024,
            write_buffer_size: 32 * 1024 * 1024,
            secondary_log_buffer_size: 128 * 1024,
            utilization_activate_reorganization: 60,
            utilization_prompt_reorganization: 75,
            cold_data_threshold_sec: 9000,
            buffer_pool_buffers: 8,
        }
    }
}

impl StoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Small sizes for fast tests: 4 KiB pages, 64 KiB segments, checksums
    /// on, timestamps off.
    pub fn for_testing(dir: impl Into<PathBuf>) -> Self {
        StoreConfig {
            backup_directory: dir.into(),
            use_timestamps: false,
            log_segment_size: 64 * 1024,
            primary_log_size: 1024 * 1024,
            secondary_log_size: 2 * 1024 * 1024,
            write_buffer_size: 512 * 1024,
            secondary_log_buffer_size: 8 * 1024,
            buffer_pool_buffers: 4,
            ..Self::default()
        }
    }

    pub fn with_backup_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.backup_directory = dir.into();
        self
    }

    pub fn with_disk_access(mut self, access: DiskAccess) -> Self {
        self.harddrive_access = access;
        self
    }

    pub fn with_raw_device_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.raw_device_path = Some(path.into());
        self
    }

    pub fn with_checksums(mut self, on: bool) -> Self {
        self.use_checksums = on;
        self
    }

    pub fn with_timestamps(mut self, on: bool) -> Self {
        self.use_timestamps = on;
        self
    }

    pub fn with_segment_size(mut self, bytes: u32) -> Self {
        self.log_segment_size = bytes;
        self
    }

    pub fn with_primary_log_size(mut self, bytes: u64) -> Self {
        self.primary_log_size = bytes;
        self
    }

    pub fn with_secondary_log_size(mut self, bytes: u64) -> Self {
        self.secondary_log_size = bytes;
        self
    }

    pub fn with_write_buffer_size(mut self, bytes: usize) -> Self {
        self.write_buffer_size = bytes;
        self
    }

    pub fn with_secondary_buffer_size(mut self, bytes: u32) -> Self {
        self.secondary_log_buffer_size = bytes;
        self
    }

    pub fn with_activate_threshold(mut self, percent: u8) -> Self {
        self.utilization_activate_reorganization = percent;
        self
    }

    pub fn with_prompt_threshold(mut self, percent: u8) -> Self {
        self.utilization_prompt_reorganization = percent;
        self
    }

    pub fn with_cold_data_threshold_sec(mut self, secs: u32) -> Self {
        self.cold_data_threshold_sec = secs;
        self
    }

    /// Derive the immutable codec parameters.
    pub fn codec(&self) -> CodecConfig {
        CodecConfig {
            use_checksums: self.use_checksums,
            use_timestamps: self.use_timestamps,
            segment_size: self.log_segment_size,
        }
    }

    /// Verify the size constraints the engine relies on. Called once at
    /// init; the engine refuses to start on any violation.
    pub fn validate(&self) -> Result<()> {
        let page = self.flash_page_size as u64;
        if !self.flash_page_size.is_power_of_two() || self.flash_page_size < 512 {
            return Err(Error::invalid_config(format!(
                "flash_page_size {} must be a power of two of at least 512",
                self.flash_page_size
            )));
        }

        let page_sized: [(&str, u64); 5] = [
            ("log_segment_size", self.log_segment_size as u64),
            ("primary_log_size", self.primary_log_size),
            ("secondary_log_size", self.secondary_log_size),
            ("write_buffer_size", self.write_buffer_size as u64),
            (
                "secondary_log_buffer_size",
                self.secondary_log_buffer_size as u64,
            ),
        ];
        for (name, value) in page_sized {
            if value <= page || value % page != 0 {
                return Err(Error::invalid_config(format!(
                    "{name} ({value}) must be a multiple of flash_page_size ({page}) and larger than it"
                )));
            }
        }

        let segment = self.log_segment_size as u64;
        if self.log_segment_size > 16 * 1024 * 1024 {
            // The entry length field is at most three bytes wide.
            return Err(Error::invalid_config(format!(
                "log_segment_size {} exceeds the 16 MiB addressable by entry headers",
                self.log_segment_size
            )));
        }
        let segment_multiples: [(&str, u64); 3] = [
            ("primary_log_size", self.primary_log_size),
            ("secondary_log_size", self.secondary_log_size),
            ("write_buffer_size", self.write_buffer_size as u64),
        ];
        for (name, value) in segment_multiples {
            if value % segment != 0 {
                return Err(Error::invalid_config(format!(
                    "{name} ({value}) must be a multiple of log_segment_size ({segment})"
                )));
            }
        }

        if self.secondary_log_buffer_size > self.log_segment_size {
            return Err(Error::invalid_config(format!(
                "secondary_log_buffer_size ({}) must not exceed log_segment_size ({})",
                self.secondary_log_buffer_size, self.log_segment_size
            )));
        }

        if self.utilization_prompt_reorganization > 100
            || self.utilization_activate_reorganization
                >= self.utilization_prompt_reorganization
        {
            return Err(Error::invalid_config(format!(
                "reorganization thresholds must satisfy activate ({}) < prompt ({}) <= 100",
                self.utilization_activate_reorganization, self.utilization_prompt_reorganization
            )));
        }

        if self.harddrive_access == DiskAccess::Raw && self.raw_device_path.is_none() {
            return Err(Error::invalid_config(
                "raw disk access requires raw_device_path",
            ));
        }

        if self.buffer_pool_buffers < 2 {
            // The reorganizer alone needs a source and a destination buffer.
            return Err(Error::invalid_config(format!(
                "buffer_pool_buffers ({}) must be at least 2",
                self.buffer_pool_buffers
            )));
        }

        Ok(())
    }
}
