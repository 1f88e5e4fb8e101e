//! The public store: backup-range lifecycle, ingest, recovery.
//!
//! [`ChunkStore::open`] validates the configuration, opens the primary
//! log, and spawns the two long-running workers (drainer and reorganizer).
//! Caller threads ingest through [`log_chunks`](ChunkStore::log_chunks);
//! everything else is plumbing around the catalog of backup ranges.

use crate::catalog::Catalog;
use crate::ctx::EngineCtx;
use crate::dispatch::{Drainer, FlushSink, LogDispatcher};
use crate::metrics::Metrics;
use crate::primary_log::PrimaryLog;
use crate::range::{primary_path, secondary_path, version_path, BackupRange};
use crate::recovery::{self, RecoveryMetadata, RecoverySink};
use crate::reorg::Reorganizer;
use crate::secondary::{SecondaryBuffer, SecondaryLog};
use crate::version::VersionStore;
use crate::write_buffer::WriteBuffer;
use chunklog_core::{
    Chunk, ChunkId, DiskAccess, Error, NodeId, RangeId, RangeKey, Result, StoreConfig,
};
use chunklog_format::{encode_entry, ChainInfo, Dialect, EntryFields, MAX_HEADER_LEN};
use chunklog_storage::open_backend;
use parking_lot::Mutex;
use serde_json::json;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Producer-side batching granularity: entries are coalesced into ring
/// reservations of roughly this size.
const POST_SLAB: usize = 256 * 1024;

/// Log-structured store for small mutable chunks; the backup tier behind
/// an in-memory key-value store.
pub struct ChunkStore {
    ctx: Arc<EngineCtx>,
    wb: WriteBuffer,
    dispatcher: Arc<LogDispatcher>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ChunkStore {
    /// Validate the configuration, prepare the backup directory and start
    /// the engine workers.
    pub fn open(cfg: StoreConfig) -> Result<Self> {
        cfg.validate()?;
        std::fs::create_dir_all(&cfg.backup_directory)?;

        let ctx = Arc::new(EngineCtx::new(cfg));
        let cfg = &ctx.cfg;
        let page = cfg.flash_page_size;

        let primary_disk = match cfg.harddrive_access {
            DiskAccess::Raw => {
                let device = cfg
                    .raw_device_path
                    .as_ref()
                    .expect("validate() requires a device path for raw access");
                open_backend(DiskAccess::Raw, device, cfg.primary_log_size, page)?
            }
            access => open_backend(
                access,
                &primary_path(&cfg.backup_directory),
                cfg.primary_log_size,
                page,
            )?,
        };
        let primary = PrimaryLog::new(primary_disk, page, ctx.pool.clone());
        let dispatcher = Arc::new(LogDispatcher::new(Arc::clone(&ctx), primary));
        let wb = WriteBuffer::new(cfg.write_buffer_size);

        let mut workers = Vec::with_capacity(2);
        let drainer = Drainer::new(
            wb.clone(),
            Arc::clone(&dispatcher) as Arc<dyn FlushSink>,
            Arc::clone(&ctx),
        );
        workers.push(
            std::thread::Builder::new()
                .name("chunklog-drain".into())
                .spawn(move || drainer.run())?,
        );
        let reorganizer = Reorganizer::new(Arc::clone(&ctx));
        workers.push(
            std::thread::Builder::new()
                .name("chunklog-reorg".into())
                .spawn(move || reorganizer.run())?,
        );

        info!(
            target: "chunklog::store",
            dir = %ctx.cfg.backup_directory.display(),
            "chunk store opened"
        );
        Ok(ChunkStore {
            ctx,
            wb,
            dispatcher,
            workers: Mutex::new(workers),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }
        Ok(())
    }

    fn catalog(&self) -> &Catalog {
        &self.ctx.catalog
    }

    fn lookup(&self, owner: NodeId, range: RangeId) -> Result<Arc<BackupRange>> {
        let key = RangeKey::new(owner, range);
        match self.catalog().get(key) {
            Some(r) if !r.is_poisoned() => Ok(r),
            _ => {
                let err = Error::RangeNotFound { owner, range };
                self.ctx.metrics.record_error(&err);
                Err(err)
            }
        }
    }

    // ---- range lifecycle -------------------------------------------------

    /// Create (or re-attach) a backup range. Returns `true` when the range
    /// was created or re-initialized, `false` when it was already live.
    pub fn init_backup_range(&self, owner: NodeId, range: RangeId) -> Result<bool> {
        self.ensure_open()?;
        let key = RangeKey::new(owner, range);
        let _lifecycle = self.catalog().lifecycle_lock();

        if let Some(existing) = self.catalog().get(key) {
            if !existing.is_poisoned() {
                return Ok(false);
            }
            // Re-init clears a poisoned range: tear the object down and
            // reopen from its files.
            self.catalog().remove(key);
            let _writes = existing.write_guard.write();
            existing.versions.close()?;
            existing.log.close()?;
        }

        let backup_range = self.build_range(key, key.owner)?;
        self.catalog().insert(Arc::new(backup_range));
        info!(target: "chunklog::store", range = %key, "backup range initialized");
        Ok(true)
    }

    /// Register a range holding data recovered from `(orig_owner,
    /// orig_range)`. With `is_new` the files start empty and the original
    /// is untouched; otherwise the original's files are renamed to the new
    /// identity and re-attached.
    pub fn init_recovered_backup_range(
        &self,
        owner: NodeId,
        range: RangeId,
        orig_owner: NodeId,
        orig_range: RangeId,
        is_new: bool,
    ) -> Result<bool> {
        self.ensure_open()?;
        let key = RangeKey::new(owner, range);
        let orig = RangeKey::new(orig_owner, orig_range);

        if is_new {
            return self.init_backup_range(owner, range);
        }

        let _lifecycle = self.catalog().lifecycle_lock();
        if self.catalog().contains(key) {
            return Ok(false);
        }
        if self.catalog().contains(orig) {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("original range {orig} is still live; remove it first"),
            )));
        }
        let dir = &self.ctx.cfg.backup_directory;
        let orig_sec = secondary_path(dir, orig);
        if orig_sec.exists() {
            std::fs::rename(orig_sec, secondary_path(dir, key))?;
            let orig_ver = version_path(dir, orig);
            if orig_ver.exists() {
                std::fs::rename(orig_ver, version_path(dir, key))?;
            }
        } else if !secondary_path(dir, key).exists() {
            return Err(Error::RangeNotFound {
                owner: orig_owner,
                range: orig_range,
            });
        }
        // else: already renamed by an earlier attach; just re-register.

        // Entries in the original's log elide the original owner's node
        // id, so it stays the parse context under the new identity.
        let backup_range = self.build_range(key, orig_owner)?;
        self.catalog().insert(Arc::new(backup_range));
        info!(
            target: "chunklog::store",
            range = %key,
            original = %orig,
            "recovered backup range attached"
        );
        Ok(true)
    }

    /// Tear a range down: wait out in-flight writes, flush, close and
    /// delete its files. Subsequent posts are rejected.
    pub fn remove_backup_range(&self, owner: NodeId, range: RangeId) -> Result<()> {
        self.ensure_open()?;
        let key = RangeKey::new(owner, range);
        let removed = {
            let _lifecycle = self.catalog().lifecycle_lock();
            self.catalog()
                .remove(key)
                .ok_or(Error::RangeNotFound { owner, range })?
        };

        // Writers that already hold the range finish first; new posts no
        // longer find it. Entries still in the ring are dropped by the
        // drainer once it sees the range is gone.
        let _writes = removed.write_guard.write();
        self.wb.signal_flush();
        self.wait_drained(Duration::from_secs(5));

        let _ = self.dispatcher.flush_range(&removed);
        removed.versions.close()?;
        removed.log.close()?;
        let dir = &self.ctx.cfg.backup_directory;
        std::fs::remove_file(secondary_path(dir, key))?;
        std::fs::remove_file(version_path(dir, key))?;
        info!(target: "chunklog::store", range = %key, "backup range removed");
        Ok(())
    }

    // ---- ingest ----------------------------------------------------------

    /// Batched append: assign each chunk its next version, serialize, and
    /// post to the write buffer. Returns when the batch is copied in;
    /// durability follows asynchronously through the logging pipeline.
    ///
    /// Chunks larger than half a segment are split into chained entries.
    pub fn log_chunks(&self, owner: NodeId, range: RangeId, chunks: &[Chunk]) -> Result<()> {
        self.ensure_open()?;
        let key = RangeKey::new(owner, range);
        let backup_range = self.lookup(owner, range)?;
        let _inflight = backup_range.write_guard.read();
        // Re-check: removal may have won the race before we held the guard.
        if !self.catalog().contains(key) {
            return Err(Error::RangeNotFound { owner, range });
        }

        let codec = &self.ctx.codec;
        let timestamp = self.ctx.entry_timestamp();
        let max_unchained = codec.max_unchained_payload() as usize;
        let part_capacity = codec.segment_size as usize - MAX_HEADER_LEN;

        let mut slab: Vec<u8> = Vec::with_capacity(POST_SLAB);
        let mut posted_entries = 0u64;

        let ctx_owner = backup_range.ctx_owner();
        for chunk in chunks {
            let version = backup_range.versions.get_next(chunk.cid)?;
            let migrated = chunk.cid.node_id() != ctx_owner;
            let base_fields = EntryFields {
                cid: chunk.cid,
                range: Some(range),
                timestamp,
                version,
                chain: None,
                migrated,
            };

            if chunk.payload.len() > max_unchained {
                let parts = chunk.payload.chunks(part_capacity).collect::<Vec<_>>();
                if parts.len() > u8::MAX as usize {
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!(
                            "chunk {} of {} bytes exceeds the maximum chained size",
                            chunk.cid,
                            chunk.payload.len()
                        ),
                    )));
                }
                let chain_size = parts.len() as u8;
                for (index, part) in parts.into_iter().enumerate() {
                    let fields = EntryFields {
                        chain: Some(ChainInfo {
                            index: index as u8,
                            size: chain_size,
                        }),
                        ..base_fields
                    };
                    let bytes = encode_entry(&fields, part, Dialect::Primary, codec);
                    self.post_entry(key, &mut slab, &bytes)?;
                    posted_entries += 1;
                }
            } else {
                let bytes = encode_entry(&base_fields, &chunk.payload, Dialect::Primary, codec);
                self.post_entry(key, &mut slab, &bytes)?;
                posted_entries += 1;
            }
        }
        if !slab.is_empty() {
            self.wb.post(key, &slab)?;
        }
        Metrics::add(&self.ctx.metrics.posted_entries, posted_entries);
        Ok(())
    }

    fn post_entry(&self, key: RangeKey, slab: &mut Vec<u8>, entry: &[u8]) -> Result<()> {
        if slab.len() + entry.len() > POST_SLAB && !slab.is_empty() {
            self.wb.post(key, slab)?;
            slab.clear();
        }
        if entry.len() >= POST_SLAB {
            self.wb.post(key, entry)
        } else {
            slab.extend_from_slice(entry);
            Ok(())
        }
    }

    /// Logical delete: install tombstone versions; reorganization reclaims
    /// the dead entries asynchronously.
    pub fn remove_chunks(&self, owner: NodeId, range: RangeId, cids: &[ChunkId]) -> Result<()> {
        self.ensure_open()?;
        let backup_range = self.lookup(owner, range)?;
        backup_range.versions.invalidate(cids)
    }

    // ---- recovery --------------------------------------------------------

    /// Quiesce the range, then rebuild its live chunk set from the
    /// secondary log, streaming survivors into `sink`.
    pub fn recover_backup_range(
        &self,
        owner: NodeId,
        range: RangeId,
        sink: &dyn RecoverySink,
    ) -> Result<RecoveryMetadata> {
        self.ensure_open()?;
        let backup_range = self.lookup(owner, range)?;

        // Block new posts and push everything in flight down to the log.
        let _writes = backup_range.write_guard.write();
        self.wb.signal_flush();
        self.wait_drained(Duration::from_secs(5));
        self.dispatcher.flush_range(&backup_range)?;
        backup_range.versions.flush()?;
        backup_range.log.sync()?;

        recovery::recover_range(&self.ctx, &backup_range, sink)
    }

    /// Recover a standalone secondary-log file without its version log;
    /// the highest version per chunk wins.
    pub fn recover_backup_range_from_file(&self, path: &Path) -> Result<Vec<Chunk>> {
        self.ensure_open()?;
        recovery::recover_from_file(path, &self.ctx.codec)
    }

    // ---- maintenance -----------------------------------------------------

    /// Force one range's staged bytes and version log to disk.
    pub fn flush(&self, owner: NodeId, range: RangeId) -> Result<()> {
        self.ensure_open()?;
        let backup_range = self.lookup(owner, range)?;
        self.wb.signal_flush();
        self.wait_drained(Duration::from_secs(5));
        self.dispatcher.flush_range(&backup_range)?;
        backup_range.versions.flush()?;
        backup_range.log.sync()
    }

    /// JSON report of buffer, log and range utilization plus the engine
    /// counters.
    pub fn current_utilization(&self) -> String {
        let primary = self.dispatcher.primary();
        let ranges: Vec<_> = self
            .catalog()
            .all()
            .into_iter()
            .map(|r| {
                let (used, capacity, percent) = r.log.utilization();
                json!({
                    "owner": r.key.owner,
                    "range": r.key.range,
                    "utilization_percent": percent,
                    "used_bytes": used,
                    "capacity_bytes": capacity,
                    "free_segments": r.log.free_segments(),
                    "tracked_chunks": r.versions.tracked_chunks(),
                    "epoch": r.versions.epoch(),
                    "poisoned": r.is_poisoned(),
                })
            })
            .collect();
        json!({
            "write_buffer": {
                "occupancy_bytes": self.wb.occupancy(),
                "capacity_bytes": self.wb.capacity(),
            },
            "primary_log": {
                "occupancy_bytes": primary.occupancy(),
                "capacity_bytes": primary.capacity(),
            },
            "ranges": ranges,
            "metrics": self.ctx.metrics.snapshot(),
        })
        .to_string()
    }

    /// Operator command: delete every chunklog file in `dir`. Never called
    /// implicitly; `open` always keeps existing files.
    pub fn purge_backup_directory(dir: &Path) -> Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let is_log = name == "primary.log"
                || name.ends_with(".sec")
                || name.ends_with(".ver");
            if is_log {
                std::fs::remove_file(&path)?;
                warn!(
                    target: "chunklog::store",
                    path = %path.display(),
                    "purged log file"
                );
            }
        }
        Ok(())
    }

    /// Clean shutdown: stop accepting work, drain the pipeline within a
    /// bounded grace period, flush and close every file. Idempotent; the
    /// second call performs no I/O.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // Workers exit on their shutdown signals; the drainer flushes all
        // staging buffers on its way out.
        self.wb.shutdown();
        self.ctx.scheduler.shutdown();
        for worker in self.workers.lock().drain(..) {
            let _ = worker.join();
        }

        let mut first_error = None;
        for backup_range in self.catalog().all() {
            for result in [
                backup_range.versions.close(),
                backup_range.log.sync().and_then(|_| backup_range.log.close()),
            ] {
                if let Err(err) = result {
                    warn!(
                        target: "chunklog::store",
                        range = %backup_range.key,
                        %err,
                        "error while closing range"
                    );
                    first_error.get_or_insert(err);
                }
            }
        }
        let primary = self.dispatcher.primary();
        if let Err(err) = primary.sync().and_then(|_| primary.close()) {
            first_error.get_or_insert(err);
        }
        self.ctx.pool.shutdown();
        info!(target: "chunklog::store", "chunk store closed");
        match first_error {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    // ---- helpers ---------------------------------------------------------

    fn build_range(&self, key: RangeKey, ctx_owner: NodeId) -> Result<BackupRange> {
        let cfg = &self.ctx.cfg;
        let dir = &cfg.backup_directory;
        let sec_path = secondary_path(dir, key);
        let existed = sec_path.exists();

        // Raw mode dedicates the device to the primary log; per-range
        // files use direct I/O in the backup directory.
        let access = match cfg.harddrive_access {
            DiskAccess::Raw => DiskAccess::Dir,
            access => access,
        };
        let disk = open_backend(access, &sec_path, cfg.secondary_log_size, cfg.flash_page_size)?;
        let log = SecondaryLog::new(
            disk,
            key,
            ctx_owner,
            self.ctx.codec,
            cfg.flash_page_size,
            self.ctx.pool.clone(),
        );
        if existed {
            log.rebuild()?;
        }

        let versions = VersionStore::open(&version_path(dir, key))?;
        let buffer = SecondaryBuffer::new(cfg.secondary_log_buffer_size as usize);
        Ok(BackupRange::new(key, log, buffer, versions))
    }

    fn wait_drained(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while self.wb.occupancy() > 0 {
            if Instant::now() >= deadline {
                warn!(
                    target: "chunklog::store",
                    occupancy = self.wb.occupancy(),
                    "write buffer did not drain within the grace period"
                );
                return;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

impl Drop for ChunkStore {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
