//! One backup range: secondary log, staging buffer, version store.

use crate::scheduler::LogGate;
use crate::secondary::{SecondaryBuffer, SecondaryLog};
use crate::version::VersionStore;
use chunklog_core::{NodeId, RangeKey};
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::error;

/// Everything a backup range owns. Created before any of its chunks are
/// logged, destroyed by `remove_backup_range`.
pub struct BackupRange {
    pub key: RangeKey,
    pub log: SecondaryLog,
    pub buffer: Mutex<SecondaryBuffer>,
    pub versions: VersionStore,
    /// Exclusive token for flush-vs-reorganization on this log.
    pub gate: LogGate,
    /// Readers are in-flight writes; removal takes the write side to wait
    /// them out.
    pub write_guard: RwLock<()>,
    /// Set after an I/O failure on the write path; further posts are
    /// refused until the range is re-initialized.
    poisoned: AtomicBool,
}

impl BackupRange {
    /// NodeId implied by entries that carry none: the log's parse context.
    pub fn ctx_owner(&self) -> NodeId {
        self.log.ctx_owner()
    }
}

impl BackupRange {
    pub fn new(
        key: RangeKey,
        log: SecondaryLog,
        buffer: SecondaryBuffer,
        versions: VersionStore,
    ) -> Self {
        BackupRange {
            key,
            log,
            buffer: Mutex::new(buffer),
            versions,
            gate: LogGate::new(),
            write_guard: RwLock::new(()),
            poisoned: AtomicBool::new(false),
        }
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    /// Mark the range failed after a write-path I/O error.
    pub fn poison(&self, reason: &chunklog_core::Error) {
        if !self.poisoned.swap(true, Ordering::AcqRel) {
            error!(
                target: "chunklog::range",
                range = %self.key,
                %reason,
                "backup range poisoned; writes refused until re-init"
            );
        }
    }
}

/// `<backup_dir>/<owner:04x>_<range:04x>.sec`
pub fn secondary_path(dir: &Path, key: RangeKey) -> PathBuf {
    dir.join(format!("{}.sec", key.file_stem()))
}

/// `<backup_dir>/<owner:04x>_<range:04x>.ver`
pub fn version_path(dir: &Path, key: RangeKey) -> PathBuf {
    dir.join(format!("{}.ver", key.file_stem()))
}

/// `<backup_dir>/primary.log`
pub fn primary_path(dir: &Path) -> PathBuf {
    dir.join("primary.log")
}
