//! Drainer and batch routing.
//!
//! The drainer is the write buffer's single consumer. Each cycle it
//! snapshots the committed prefix, partitions it into per-range
//! sub-streams using the region index, and hands every sub-stream to the
//! [`FlushSink`]. The concrete sink, [`LogDispatcher`], applies the
//! two-stage routing decision:
//!
//! - a sub-stream of at least half a segment, or one that would overflow
//!   the range's secondary buffer, goes **directly** to the secondary log
//!   (headers converted primary→secondary on the way); any staged bytes
//!   are flushed first so per-chunk order is preserved;
//! - anything smaller is appended to the circular primary log in primary
//!   format and fanned, converted, into the range's secondary buffer.
//!
//! The dispatcher also tracks, per range, the oldest primary-log offset
//! whose staged bytes have not reached the secondary log yet; flushing a
//! secondary buffer releases the primary tail up to the oldest survivor.

use crate::ctx::EngineCtx;
use crate::metrics::Metrics;
use crate::range::BackupRange;
use crate::primary_log::PrimaryLog;
use crate::scheduler::{GatePurpose, ReorgPriority};
use crate::secondary::{EntryBlock, SecondaryBuffer};
use crate::write_buffer::{DrainWake, Region, WriteBuffer};
use chunklog_core::{Error, RangeKey, Result};
use chunklog_format::{convert_to_secondary, parse_entry, Dialect, ParsedEntry, WrapBuf};
use parking_lot::{Mutex, MutexGuard};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Where drained sub-streams go. The write buffer side knows nothing about
/// logs; the log side knows nothing about the ring.
pub trait FlushSink: Send + Sync {
    /// Route every region of the committed prefix. `base` is the logical
    /// write-buffer offset of `view`'s logical zero.
    fn process(&self, view: &WrapBuf<'_>, base: u64, regions: &[Region]) -> Result<()>;

    /// Flush every range's secondary buffer to its secondary log.
    fn flush_all(&self) -> Result<()>;
}

/// How long the drainer sleeps before flushing a trickle of data that
/// never reaches the low watermark.
const DRAIN_IDLE: Duration = Duration::from_millis(100);

/// Rounds of post-shutdown draining before giving up on stragglers.
const SHUTDOWN_GRACE_ROUNDS: usize = 8;

/// The drainer worker: moves bytes from the ring into the sink until
/// shutdown, then drains what is left and flushes all staging buffers.
pub struct Drainer {
    wb: WriteBuffer,
    sink: Arc<dyn FlushSink>,
    ctx: Arc<EngineCtx>,
}

impl Drainer {
    pub fn new(wb: WriteBuffer, sink: Arc<dyn FlushSink>, ctx: Arc<EngineCtx>) -> Self {
        Drainer { wb, sink, ctx }
    }

    pub fn run(self) {
        // The scratch preserves ring layout, so entries that wrap stay
        // wrapped and the codec's wrap handling is exercised end to end.
        let mut scratch = vec![0u8; self.wb.capacity()];
        loop {
            let wake = self.wb.wait_for_work(DRAIN_IDLE);
            self.drain_once(&mut scratch);
            if wake == DrainWake::Shutdown {
                for _ in 0..SHUTDOWN_GRACE_ROUNDS {
                    if self.wb.occupancy() == 0 {
                        break;
                    }
                    self.drain_once(&mut scratch);
                }
                if let Err(err) = self.sink.flush_all() {
                    error!(target: "chunklog::drain", %err, "final flush failed");
                    self.ctx.metrics.record_error(&err);
                }
                debug!(target: "chunklog::drain", "drainer stopped");
                return;
            }
        }
    }

    fn drain_once(&self, scratch: &mut [u8]) {
        let (until_end, len, commit) = self.wb.snapshot_into(scratch);
        if len == 0 {
            return;
        }
        let base = commit - len as u64;
        let regions = self.wb.take_regions(commit);
        let view = WrapBuf::new(scratch, until_end);

        match self.sink.process(&view, base, &regions) {
            Ok(()) => {
                Metrics::bump(&self.ctx.metrics.drained_batches);
                Metrics::add(&self.ctx.metrics.drained_bytes, len as u64);
            }
            Err(err) => {
                // Affected ranges were poisoned by the dispatcher; the
                // batch itself is abandoned.
                error!(target: "chunklog::drain", %err, "drain batch failed");
                self.ctx.metrics.record_error(&err);
            }
        }
        self.wb.consume(commit);
    }
}

/// Concrete [`FlushSink`] over the primary log and the per-range
/// secondary logs.
pub struct LogDispatcher {
    ctx: Arc<EngineCtx>,
    primary: PrimaryLog,
    /// Per range: oldest primary-log offset with staged, unflushed bytes.
    pending: Mutex<FxHashMap<RangeKey, u64>>,
}

impl LogDispatcher {
    pub fn new(ctx: Arc<EngineCtx>, primary: PrimaryLog) -> Self {
        LogDispatcher {
            ctx,
            primary,
            pending: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn primary(&self) -> &PrimaryLog {
        &self.primary
    }

    /// Flush one range's secondary buffer (public for the store's `flush`
    /// operation and recovery quiescing).
    pub fn flush_range(&self, range: &BackupRange) -> Result<()> {
        let _token = range.gate.acquire(GatePurpose::Writing);
        let mut buffer = range.buffer.lock();
        self.flush_buffer_locked(range, &mut buffer)
    }

    fn flush_buffer_locked(
        &self,
        range: &BackupRange,
        buffer: &mut MutexGuard<'_, SecondaryBuffer>,
    ) -> Result<()> {
        if !buffer.is_empty() {
            let report = range.log.append_block(&buffer.as_block())?;
            Metrics::bump(&self.ctx.metrics.staged_flushes);
            buffer.clear();
            self.raise_pressure(range, report.free_segments);
        }
        self.release_pending(range.key);
        Ok(())
    }

    /// Drop the range's pending marker and advance the primary tail to the
    /// oldest still-pending offset.
    fn release_pending(&self, key: RangeKey) {
        let mut pending = self.pending.lock();
        pending.remove(&key);
        let tail = pending
            .values()
            .min()
            .copied()
            .unwrap_or_else(|| self.primary.head());
        self.primary.release(tail);
    }

    fn raise_pressure(&self, range: &BackupRange, free_segments: usize) {
        let total = range.log.segment_count();
        let threshold = (total / 10).max(1);
        if free_segments <= threshold {
            self.ctx
                .scheduler
                .request_reorganization(range.key, ReorgPriority::High);
        }
    }

    fn dispatch_region(&self, view: &WrapBuf<'_>, offset: usize, region: &Region) -> Result<()> {
        let end = offset + region.len as usize;
        let key = region.key;

        let Some(range) = self.ctx.catalog.get(key) else {
            // Removed while its entries were in flight; drop them.
            warn!(
                target: "chunklog::drain",
                range = %key,
                bytes = region.len,
                "dropping drained entries for a removed backup range"
            );
            return Ok(());
        };
        if range.is_poisoned() {
            warn!(
                target: "chunklog::drain",
                range = %key,
                "skipping drained entries for a poisoned backup range"
            );
            return Ok(());
        }

        // Parse the region and convert every header. A failure here means
        // the engine corrupted its own ring; treat as fatal for the batch.
        let mut parsed_entries: Vec<(usize, ParsedEntry)> = Vec::new();
        let mut cursor = offset;
        while cursor < end {
            let parsed = parse_entry(
                view,
                cursor,
                end,
                Dialect::Primary,
                &self.ctx.codec,
                key.owner,
            )
            .map_err(|err| Error::corrupt(format!("write buffer entry unreadable: {err}")))?;
            let total = parsed.total_len();
            parsed_entries.push((cursor, parsed));
            cursor += total;
        }

        let mut converted = Vec::with_capacity(region.len as usize);
        let mut ends: Vec<u32> = Vec::with_capacity(parsed_entries.len());
        let mut timestamps: Vec<u32> = Vec::new();
        for (entry_off, parsed) in &parsed_entries {
            convert_to_secondary(view, *entry_off, parsed, &mut converted);
            ends.push(converted.len() as u32);
            if self.ctx.codec.use_timestamps {
                timestamps.push(parsed.fields.timestamp.unwrap_or(0));
            }
        }

        let half_segment = (self.ctx.codec.segment_size / 2) as usize;
        let page = self.ctx.cfg.flash_page_size as u64;

        // Make room in the primary log before taking the range's gate:
        // flushing other ranges acquires their gates, and taking ours
        // first could deadlock against the reorganizer.
        if converted.len() < half_segment
            && self.primary.free_space() < region.len as u64 + page
        {
            self.flush_all()?;
        }

        let _token = range.gate.acquire(GatePurpose::Writing);
        let mut buffer = range.buffer.lock();

        let result = if converted.len() >= half_segment || buffer.would_overflow(converted.len())
        {
            self.flush_buffer_locked(&range, &mut buffer).and_then(|_| {
                let report = range.log.append_block(&EntryBlock {
                    bytes: &converted,
                    ends: &ends,
                    timestamps: &timestamps,
                })?;
                Metrics::bump(&self.ctx.metrics.direct_flushes);
                self.raise_pressure(&range, report.free_segments);
                Ok(())
            })
        } else {
            // Mark the primary region pending *before* writing it, so a
            // concurrent flush of another range can never conclude the
            // tail is free to advance past it.
            self.pending
                .lock()
                .entry(key)
                .or_insert_with(|| self.primary.head());
            self.primary
                .append_region(view, offset, region.len as usize)
                .map(|_| {
                    Metrics::bump(&self.ctx.metrics.primary_appends);
                    let mut cursor = 0usize;
                    for (i, end) in ends.iter().enumerate() {
                        buffer.push_entry(
                            &converted[cursor..*end as usize],
                            timestamps.get(i).copied(),
                        );
                        cursor = *end as usize;
                    }
                })
        };

        match result {
            Ok(()) => Ok(()),
            Err(err @ Error::Io(_)) => {
                // Fatal to this range only; the batch is lost, subsequent
                // writes are refused until re-init. Its pending marker must
                // not pin the primary tail forever.
                range.poison(&err);
                self.release_pending(key);
                self.ctx.metrics.record_error(&err);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

impl FlushSink for LogDispatcher {
    fn process(&self, view: &WrapBuf<'_>, base: u64, regions: &[Region]) -> Result<()> {
        for region in regions {
            let offset = (region.start - base) as usize;
            self.dispatch_region(view, offset, region)?;
        }
        Ok(())
    }

    fn flush_all(&self) -> Result<()> {
        for range in self.ctx.catalog.all() {
            if range.is_poisoned() {
                self.release_pending(range.key);
                continue;
            }
            if let Err(err) = self.flush_range(&range) {
                range.poison(&err);
                self.release_pending(range.key);
                self.ctx.metrics.record_error(&err);
            }
        }
        Ok(())
    }
}
