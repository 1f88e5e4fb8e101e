//! Per-range version store.
//!
//! Each backup range tracks the current `(epoch, counter)` of every chunk it
//! has ever logged: an in-memory hash table answering lookups, backed by an
//! append-only version log replayed at open. Removals install tombstone
//! versions; nothing is ever deleted from the table while the range lives.
//!
//! Version-log records are fixed width and CRC-framed:
//!
//! ```text
//! ┌─────────┬───────────┬───────────────┬─────────┐
//! │ CID (8) │ Epoch (2) │ RawCounter (4)│ CRC (4) │
//! └─────────┴───────────┴───────────────┴─────────┘
//! ```
//!
//! Replay applies records in order (last record wins) and stops at the
//! first framing failure, which tolerates a torn trailing append. When a
//! counter nears saturation the store bumps the range epoch and compacts
//! the log down to the live table so old-epoch records stop accumulating.

use byteorder::{ByteOrder, LittleEndian};
use chunklog_core::types::COUNTER_ROLLOVER_LIMIT;
use chunklog_core::{ChunkId, Result, Version};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

const RECORD_LEN: usize = 18;
const CRC_OFF: usize = 14;

/// Flush the append buffer to disk once it grows past this.
const APPEND_BUFFER_FLUSH: usize = 64 * 1024;

struct Inner {
    map: FxHashMap<u64, Version>,
    epoch: u16,
    file: File,
    /// Records appended since the last write-out.
    pending: Vec<u8>,
}

/// Version store of one backup range.
///
/// All operations serialize on one internal lock; bulk invalidation takes
/// it once for the whole batch.
pub struct VersionStore {
    path: PathBuf,
    inner: Mutex<Inner>,
    closed: AtomicBool,
}

fn encode_record(out: &mut Vec<u8>, cid: ChunkId, version: Version) {
    let mut rec = [0u8; RECORD_LEN];
    LittleEndian::write_u64(&mut rec[0..8], cid.raw());
    LittleEndian::write_u16(&mut rec[8..10], version.epoch);
    LittleEndian::write_u32(&mut rec[10..14], version.raw_counter());
    let crc = crc32fast::hash(&rec[..CRC_OFF]);
    LittleEndian::write_u32(&mut rec[CRC_OFF..], crc);
    out.extend_from_slice(&rec);
}

fn decode_record(rec: &[u8]) -> Option<(u64, Version)> {
    let crc = LittleEndian::read_u32(&rec[CRC_OFF..RECORD_LEN]);
    if crc != crc32fast::hash(&rec[..CRC_OFF]) {
        return None;
    }
    let cid = LittleEndian::read_u64(&rec[0..8]);
    let epoch = LittleEndian::read_u16(&rec[8..10]);
    let counter = LittleEndian::read_u32(&rec[10..14]);
    Some((cid, Version::new(epoch, counter)))
}

impl VersionStore {
    /// Open the version log at `path`, replaying any existing records.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;

        let mut raw = Vec::new();
        file.read_to_end(&mut raw)?;

        let mut map = FxHashMap::default();
        let mut epoch = 0u16;
        let mut offset = 0;
        while offset + RECORD_LEN <= raw.len() {
            match decode_record(&raw[offset..offset + RECORD_LEN]) {
                Some((cid, version)) => {
                    epoch = epoch.max(version.epoch);
                    map.insert(cid, version);
                    offset += RECORD_LEN;
                }
                None => break,
            }
        }
        if offset < raw.len() {
            warn!(
                target: "chunklog::version",
                path = %path.display(),
                valid_bytes = offset,
                total_bytes = raw.len(),
                "version log has a torn tail, ignoring trailing bytes"
            );
        }
        debug!(
            target: "chunklog::version",
            path = %path.display(),
            entries = map.len(),
            epoch,
            "version store loaded"
        );

        Ok(VersionStore {
            path: path.to_path_buf(),
            inner: Mutex::new(Inner {
                map,
                epoch,
                file,
                pending: Vec::new(),
            }),
            closed: AtomicBool::new(false),
        })
    }

    /// Current version of `cid`, or `Version::unassigned()` when the chunk
    /// was never logged.
    pub fn get_current(&self, cid: ChunkId) -> Version {
        self.inner
            .lock()
            .map
            .get(&cid.raw())
            .copied()
            .unwrap_or_else(Version::unassigned)
    }

    /// Assign and persist the next version of `cid`.
    ///
    /// Near counter saturation the range epoch is bumped, the counter
    /// restarts at one, and the log is compacted to the live table.
    pub fn get_next(&self, cid: ChunkId) -> Result<Version> {
        let mut inner = self.inner.lock();
        let next = match inner.map.get(&cid.raw()).copied() {
            None => Version::new(inner.epoch, 1),
            Some(current) if current.count() >= COUNTER_ROLLOVER_LIMIT => {
                let epoch = inner.epoch.wrapping_add(1);
                inner.epoch = epoch;
                let next = Version::new(epoch, 1);
                inner.map.insert(cid.raw(), next);
                Self::compact_locked(&mut inner, &self.path)?;
                return Ok(next);
            }
            Some(current) => Version::new(current.epoch, current.count() + 1),
        };
        inner.map.insert(cid.raw(), next);
        encode_record(&mut inner.pending, cid, next);
        Self::maybe_write_locked(&mut inner)?;
        Ok(next)
    }

    /// Install a tombstone for each chunk, taking the lock once.
    pub fn invalidate(&self, cids: &[ChunkId]) -> Result<()> {
        let mut inner = self.inner.lock();
        for &cid in cids {
            let current = inner
                .map
                .get(&cid.raw())
                .copied()
                .unwrap_or_else(Version::unassigned);
            let tomb = Version::tombstone(current.epoch, current.count() + 1);
            inner.map.insert(cid.raw(), tomb);
            encode_record(&mut inner.pending, cid, tomb);
        }
        Self::maybe_write_locked(&mut inner)?;
        Ok(())
    }

    /// Write out buffered records and fsync the log.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::write_pending_locked(&mut inner)?;
        inner.file.sync_data()?;
        Ok(())
    }

    /// Number of chunks tracked (tombstones included).
    pub fn tracked_chunks(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn epoch(&self) -> u16 {
        self.inner.lock().epoch
    }

    /// Snapshot of the table, used by recovery workers for lock-free
    /// version filtering.
    pub fn table_snapshot(&self) -> FxHashMap<u64, Version> {
        self.inner.lock().map.clone()
    }

    /// Flush and stop. Idempotent; the second call does no I/O.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.flush()
    }

    fn maybe_write_locked(inner: &mut Inner) -> Result<()> {
        if inner.pending.len() >= APPEND_BUFFER_FLUSH {
            Self::write_pending_locked(inner)?;
        }
        Ok(())
    }

    fn write_pending_locked(inner: &mut Inner) -> Result<()> {
        if !inner.pending.is_empty() {
            inner.file.write_all(&inner.pending)?;
            inner.pending.clear();
        }
        Ok(())
    }

    /// Rewrite the log as a snapshot of the live table. Goes through a
    /// temporary file and rename so a crash mid-compaction keeps the old
    /// log intact.
    fn compact_locked(inner: &mut Inner, path: &Path) -> Result<()> {
        let tmp_path = path.with_extension("ver.tmp");
        let mut snapshot = Vec::with_capacity(inner.map.len() * RECORD_LEN);
        for (&cid, &version) in &inner.map {
            encode_record(&mut snapshot, ChunkId::from_raw(cid), version);
        }
        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(&snapshot)?;
            tmp.sync_all()?;
        }
        std::fs::rename(&tmp_path, path)?;
        inner.file = OpenOptions::new().read(true).append(true).open(path)?;
        inner.pending.clear();
        debug!(
            target: "chunklog::version",
            path = %path.display(),
            entries = inner.map.len(),
            epoch = inner.epoch,
            "version log compacted after epoch rollover"
        );
        Ok(())
    }
}
