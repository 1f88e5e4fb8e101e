//! Recovery: rebuild the live chunk set from a secondary log.
//!
//! Segments are partitioned across worker threads; each worker scans its
//! segments sequentially, drops corrupt and obsolete entries, reassembles
//! chained chunks in a shared staging table, and streams survivors to the
//! caller's [`RecoverySink`] in batches.
//!
//! Failure semantics: a checksum mismatch skips one entry; an unparseable
//! region ends that segment's scan only (this is also how a torn trailing
//! write is tolerated: the scan stops at the first parse failure past the
//! last verified entry); chains still incomplete at end of scan are
//! discarded with a warning. Reorganization can leave a stale duplicate of
//! a live entry in a freed segment, so emission deduplicates by chunk id.

use crate::ctx::EngineCtx;
use crate::metrics::Metrics;
use crate::range::BackupRange;
use chunklog_core::{Chunk, ChunkId, CodecConfig, NodeId, Result, Version};
use chunklog_format::{parse_entry, verify_checksum, Dialect, ParseError, ParsedEntry, WrapBuf};
use dashmap::DashMap;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Chunks per sink handoff; batching amortizes sink contention.
const SINK_BATCH: usize = 32;

/// Receiver of recovered chunks. Implementations must be thread-safe and
/// idempotent: recovery may hand the same chunk over more than once across
/// separate invocations.
pub trait RecoverySink: Send + Sync {
    fn create_and_put_recovered(&self, chunks: &[Chunk]) -> Result<()>;
}

/// Simple collecting sink, used by tests and the standalone-file path.
#[derive(Default)]
pub struct VecSink {
    chunks: Mutex<Vec<Chunk>>,
}

impl VecSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_chunks(self) -> Vec<Chunk> {
        self.chunks.into_inner()
    }
}

impl RecoverySink for VecSink {
    fn create_and_put_recovered(&self, chunks: &[Chunk]) -> Result<()> {
        self.chunks.lock().extend_from_slice(chunks);
        Ok(())
    }
}

/// Summary of one recovery run.
#[derive(Debug, Clone, Default)]
pub struct RecoveryMetadata {
    pub chunks: u64,
    pub bytes: u64,
    pub cid_min: Option<ChunkId>,
    pub cid_max: Option<ChunkId>,
    pub checksum_errors: u64,
    pub corrupt_segments: u64,
    pub incomplete_chains: u64,
}

type ChainKey = (u64, u16, u32);

struct ChainSlot {
    parts: Vec<Option<Vec<u8>>>,
    received: usize,
}

struct Shared<'a> {
    versions: FxHashMap<u64, Version>,
    chains: DashMap<ChainKey, ChainSlot>,
    emitted: DashMap<u64, ()>,
    sink: &'a dyn RecoverySink,
    chunks: AtomicU64,
    bytes: AtomicU64,
    cid_min: AtomicU64,
    cid_max: AtomicU64,
    checksum_errors: AtomicU64,
    corrupt_segments: AtomicU64,
}

impl Shared<'_> {
    /// Version filter: keep entries at or above the stored version (exact
    /// equality means this entry *is* the live copy; tombstones always
    /// outrank data entries).
    fn is_current(&self, cid: ChunkId, version: Version) -> bool {
        match self.versions.get(&cid.raw()) {
            Some(&current) => version >= current && !current.is_tombstone(),
            // Not tracked: a chunk whose version record never made it to
            // disk. Keep it; eventual consistency prefers data over none.
            None => true,
        }
    }

    fn emit(&self, batch: &mut Vec<Chunk>, chunk: Chunk) -> Result<()> {
        if self.emitted.insert(chunk.cid.raw(), ()).is_some() {
            // Stale duplicate left behind by reorganization.
            return Ok(());
        }
        self.chunks.fetch_add(1, Ordering::Relaxed);
        self.bytes
            .fetch_add(chunk.payload.len() as u64, Ordering::Relaxed);
        self.cid_min.fetch_min(chunk.cid.raw(), Ordering::Relaxed);
        self.cid_max.fetch_max(chunk.cid.raw(), Ordering::Relaxed);
        batch.push(chunk);
        if batch.len() >= SINK_BATCH {
            self.sink.create_and_put_recovered(batch)?;
            batch.clear();
        }
        Ok(())
    }

    /// Store one chain part; emit the whole chunk once every part arrived.
    fn stage_chain_part(
        &self,
        batch: &mut Vec<Chunk>,
        cid: ChunkId,
        version: Version,
        index: u8,
        size: u8,
        payload: Vec<u8>,
    ) -> Result<()> {
        let key: ChainKey = (cid.raw(), version.epoch, version.count());
        let complete = {
            let mut slot = self.chains.entry(key).or_insert_with(|| ChainSlot {
                parts: vec![None; size as usize],
                received: 0,
            });
            if slot.parts.len() != size as usize {
                warn!(
                    target: "chunklog::recovery",
                    cid = %cid,
                    "chain parts disagree on chain size; discarding part"
                );
                return Ok(());
            }
            if slot.parts[index as usize].is_none() {
                slot.parts[index as usize] = Some(payload);
                slot.received += 1;
            }
            slot.received == slot.parts.len()
        };
        if complete {
            if let Some((_, slot)) = self.chains.remove(&key) {
                let mut assembled = Vec::new();
                for part in slot.parts {
                    assembled.extend_from_slice(&part.expect("all parts received"));
                }
                self.emit(batch, Chunk::new(cid, assembled))?;
            }
        }
        Ok(())
    }
}

/// Scan `[0, limit)` of one segment image, feeding survivors to `shared`.
fn scan_segment(
    shared: &Shared<'_>,
    view: &WrapBuf<'_>,
    limit: usize,
    codec: &CodecConfig,
    ctx_owner: NodeId,
    segment: usize,
    batch: &mut Vec<Chunk>,
) -> Result<()> {
    let mut cursor = 0usize;
    while cursor < limit {
        let parsed = match parse_entry(view, cursor, limit, Dialect::Secondary, codec, ctx_owner) {
            Ok(parsed) => parsed,
            Err(ParseError::EndOfData) => break,
            Err(err) => {
                warn!(
                    target: "chunklog::recovery",
                    segment,
                    offset = cursor,
                    %err,
                    "segment scan aborted at unparseable entry"
                );
                shared.corrupt_segments.fetch_add(1, Ordering::Relaxed);
                break;
            }
        };
        let total = parsed.total_len();

        if verify_checksum(view, cursor, &parsed).is_err() {
            shared.checksum_errors.fetch_add(1, Ordering::Relaxed);
            cursor += total;
            continue;
        }

        let fields = &parsed.fields;
        if shared.is_current(fields.cid, fields.version) {
            let payload = parsed.copy_payload(view, cursor);
            match fields.chain {
                None => shared.emit(batch, Chunk::new(fields.cid, payload))?,
                Some(chain) => shared.stage_chain_part(
                    batch,
                    fields.cid,
                    fields.version,
                    chain.index,
                    chain.size,
                    payload,
                )?,
            }
        }
        cursor += total;
    }
    Ok(())
}

/// Parallel recovery of one backup range. The caller has quiesced and
/// flushed the range; the version table snapshot is the filter.
pub fn recover_range(
    ctx: &Arc<EngineCtx>,
    range: &BackupRange,
    sink: &dyn RecoverySink,
) -> Result<RecoveryMetadata> {
    let segments = range.log.segment_count();
    // Leave at least one pool buffer for the drainer and reorganizer.
    let worker_cap = ctx.pool.capacity().saturating_sub(1).max(1);
    let workers = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(segments)
        .min(worker_cap)
        .max(1);

    let shared = Shared {
        versions: range.versions.table_snapshot(),
        chains: DashMap::new(),
        emitted: DashMap::new(),
        sink,
        chunks: AtomicU64::new(0),
        bytes: AtomicU64::new(0),
        cid_min: AtomicU64::new(u64::MAX),
        cid_max: AtomicU64::new(0),
        checksum_errors: AtomicU64::new(0),
        corrupt_segments: AtomicU64::new(0),
    };

    let seg_size = range.log.segment_size() as usize;
    std::thread::scope(|scope| -> Result<()> {
        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let shared = &shared;
            let ctx = Arc::clone(ctx);
            handles.push(scope.spawn(move || -> Result<()> {
                let mut batch = Vec::with_capacity(SINK_BATCH);
                let mut buf = ctx.pool.acquire()?;
                for segment in (worker..segments).step_by(workers) {
                    range.log.read_segment(segment, &mut buf)?;
                    let view = WrapBuf::linear(&buf[..seg_size]);
                    scan_segment(
                        shared,
                        &view,
                        seg_size,
                        &ctx.codec,
                        range.ctx_owner(),
                        segment,
                        &mut batch,
                    )?;
                }
                if !batch.is_empty() {
                    shared.sink.create_and_put_recovered(&batch)?;
                }
                Ok(())
            }));
        }
        for handle in handles {
            handle.join().expect("recovery worker panicked")?;
        }
        Ok(())
    })?;

    let incomplete = shared.chains.len() as u64;
    if incomplete > 0 {
        warn!(
            target: "chunklog::recovery",
            range = %range.key,
            incomplete,
            "discarding incomplete chains at end of scan"
        );
        Metrics::add(&ctx.metrics.incomplete_chains, incomplete);
    }

    let metadata = RecoveryMetadata {
        chunks: shared.chunks.load(Ordering::Relaxed),
        bytes: shared.bytes.load(Ordering::Relaxed),
        cid_min: (shared.cid_min.load(Ordering::Relaxed) != u64::MAX)
            .then(|| ChunkId::from_raw(shared.cid_min.load(Ordering::Relaxed))),
        cid_max: (shared.chunks.load(Ordering::Relaxed) > 0)
            .then(|| ChunkId::from_raw(shared.cid_max.load(Ordering::Relaxed))),
        checksum_errors: shared.checksum_errors.load(Ordering::Relaxed),
        corrupt_segments: shared.corrupt_segments.load(Ordering::Relaxed),
        incomplete_chains: incomplete,
    };
    Metrics::add(&ctx.metrics.recovered_chunks, metadata.chunks);
    Metrics::add(&ctx.metrics.checksum_errors, metadata.checksum_errors);
    info!(
        target: "chunklog::recovery",
        range = %range.key,
        chunks = metadata.chunks,
        bytes = metadata.bytes,
        checksum_errors = metadata.checksum_errors,
        "backup range recovered"
    );
    Ok(metadata)
}

/// Recover a standalone secondary-log file without a version log: the
/// highest version seen per chunk wins.
///
/// The range owner is taken from the `<owner>_<range>.sec` file name when
/// it parses, so non-migrated entries resolve their node id.
pub fn recover_from_file(path: &Path, codec: &CodecConfig) -> Result<Vec<Chunk>> {
    let ctx_owner = owner_from_file_name(path).unwrap_or_else(|| {
        warn!(
            target: "chunklog::recovery",
            path = %path.display(),
            "file name does not carry an owner id; assuming 0"
        );
        0
    });

    let raw = std::fs::read(path)?;
    if raw.is_empty() {
        return Ok(Vec::new());
    }
    let seg_size = codec.segment_size as usize;

    // Best unchained candidate per chunk, and chain parts per version.
    let mut best: FxHashMap<u64, (Version, Vec<u8>)> = FxHashMap::default();
    let mut chains: FxHashMap<ChainKey, ChainSlot> = FxHashMap::default();
    let mut chain_meta: FxHashMap<ChainKey, ChunkId> = FxHashMap::default();

    let mut segment_start = 0usize;
    while segment_start < raw.len() {
        let limit = seg_size.min(raw.len() - segment_start);
        let view = WrapBuf::linear(&raw[segment_start..segment_start + limit]);
        let mut cursor = 0usize;
        while cursor < limit {
            let parsed: ParsedEntry =
                match parse_entry(&view, cursor, limit, Dialect::Secondary, codec, ctx_owner) {
                    Ok(parsed) => parsed,
                    Err(ParseError::EndOfData) => break,
                    Err(err) => {
                        warn!(
                            target: "chunklog::recovery",
                            path = %path.display(),
                            offset = segment_start + cursor,
                            %err,
                            "file scan aborted in this segment"
                        );
                        break;
                    }
                };
            let total = parsed.total_len();
            if verify_checksum(&view, cursor, &parsed).is_err() {
                cursor += total;
                continue;
            }

            let fields = parsed.fields;
            let payload = parsed.copy_payload(&view, cursor);
            match fields.chain {
                None => {
                    let slot = best
                        .entry(fields.cid.raw())
                        .or_insert_with(|| (fields.version, Vec::new()));
                    if fields.version >= slot.0 {
                        *slot = (fields.version, payload);
                    }
                }
                Some(chain) => {
                    let key: ChainKey =
                        (fields.cid.raw(), fields.version.epoch, fields.version.count());
                    let slot = chains.entry(key).or_insert_with(|| ChainSlot {
                        parts: vec![None; chain.size as usize],
                        received: 0,
                    });
                    if slot.parts.len() == chain.size as usize
                        && slot.parts[chain.index as usize].is_none()
                    {
                        slot.parts[chain.index as usize] = Some(payload);
                        slot.received += 1;
                        chain_meta.insert(key, fields.cid);
                    }
                }
            }
            cursor += total;
        }
        segment_start += seg_size;
    }

    // Fold complete chains into the candidate set.
    for (key, slot) in chains {
        if slot.received != slot.parts.len() {
            warn!(
                target: "chunklog::recovery",
                path = %path.display(),
                cid = key.0,
                "discarding incomplete chain"
            );
            continue;
        }
        let cid = chain_meta[&key];
        let version = Version::new(key.1, key.2);
        let mut assembled = Vec::new();
        for part in slot.parts {
            assembled.extend_from_slice(&part.expect("complete chain"));
        }
        let slot = best
            .entry(cid.raw())
            .or_insert_with(|| (version, Vec::new()));
        if version >= slot.0 {
            *slot = (version, assembled);
        }
    }

    let mut chunks: Vec<Chunk> = best
        .into_iter()
        .map(|(raw_cid, (_, payload))| Chunk::new(ChunkId::from_raw(raw_cid), payload))
        .collect();
    chunks.sort_by_key(|c| c.cid);
    debug!(
        target: "chunklog::recovery",
        path = %path.display(),
        chunks = chunks.len(),
        "standalone file recovered"
    );
    Ok(chunks)
}

fn owner_from_file_name(path: &Path) -> Option<NodeId> {
    let stem = path.file_stem()?.to_str()?;
    let (owner_hex, _) = stem.split_once('_')?;
    NodeId::from_str_radix(owner_hex, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_parses_from_layout_file_names() {
        assert_eq!(
            owner_from_file_name(Path::new("/b/0002_001a.sec")),
            Some(2)
        );
        assert_eq!(
            owner_from_file_name(Path::new("/b/beef_0000.sec")),
            Some(0xBEEF)
        );
        assert_eq!(owner_from_file_name(Path::new("/b/primary.log")), None);
    }
}
