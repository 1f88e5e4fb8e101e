//! Reorganization worker.
//!
//! One long-running thread compacts secondary-log segments: it reads a
//! victim segment, keeps every entry whose version is still current, and
//! installs the survivors as a fresh segment, freeing the victim. Between
//! segments it yields to the scheduler; mid-segment it aborts cleanly (the
//! victim untouched, the partial destination discarded) when a
//! high-priority request for another range arrives.
//!
//! Victim selection sweeps inactive segments by reorganization
//! generation, oldest first, scoring by used bytes, weighted by segment
//! age when timestamps are enabled. The exact reclaimable byte count is
//! only known after scanning, so a fully-live victim costs one read: its
//! generation is bumped and the sweep moves on.

use crate::ctx::EngineCtx;
use crate::metrics::Metrics;
use crate::range::BackupRange;
use crate::scheduler::{GatePurpose, ReorgPriority, SchedulerTick};
use crate::secondary::log::{ReplacementSegment, SegState};
use chunklog_core::{RangeKey, Result};
use chunklog_format::{parse_entry, verify_checksum, Dialect, ParseError, WrapBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// How often the worker surveys all logs when no requests are queued.
const SURVEY_INTERVAL: Duration = Duration::from_millis(500);

/// Entries between preemption checks during a segment scan.
const PREEMPT_CHECK_STRIDE: usize = 64;

enum CompactOutcome {
    Compacted { reclaimed: usize },
    NothingReclaimed,
    Preempted,
}

pub struct Reorganizer {
    ctx: Arc<EngineCtx>,
}

impl Reorganizer {
    pub fn new(ctx: Arc<EngineCtx>) -> Self {
        Reorganizer { ctx }
    }

    pub fn run(self) {
        loop {
            match self.ctx.scheduler.wait_next(SURVEY_INTERVAL) {
                SchedulerTick::Shutdown => {
                    debug!(target: "chunklog::reorg", "reorganization worker stopped");
                    return;
                }
                SchedulerTick::Survey => self.survey(),
                SchedulerTick::Reorganize(key, priority) => self.process(key, priority),
            }
        }
    }

    /// Queue a low-priority pass for every log above the activation
    /// threshold.
    fn survey(&self) {
        let activate = self.ctx.cfg.utilization_activate_reorganization;
        for range in self.ctx.catalog.all() {
            let (_, _, percent) = range.log.utilization();
            if percent >= activate {
                self.ctx
                    .scheduler
                    .request_reorganization(range.key, ReorgPriority::Low);
            }
        }
    }

    /// Compact the targeted range until its pressure target is met, it
    /// runs out of candidates, or a preemption wins.
    fn process(&self, key: RangeKey, priority: ReorgPriority) {
        let Some(range) = self.ctx.catalog.get(key) else {
            return;
        };
        let activate = self.ctx.cfg.utilization_activate_reorganization;
        let prompt = self.ctx.cfg.utilization_prompt_reorganization;
        let total_segments = range.log.segment_count();

        let mut passes = 0usize;
        loop {
            // Bound one request to a single sweep over the log.
            if passes >= total_segments {
                break;
            }
            passes += 1;

            let (_, _, percent) = range.log.utilization();
            let satisfied = match priority {
                ReorgPriority::Low => percent < activate,
                // High: the writer needs free segments back.
                ReorgPriority::High => {
                    range.log.free_segments() > (total_segments / 10).max(1) && percent < prompt
                }
            };
            if satisfied || self.ctx.scheduler.is_shut_down() {
                break;
            }

            let Some(victim) = self.select_victim(&range) else {
                break;
            };
            // Above the prompt threshold the worker keeps the log to
            // itself; below it, a high-priority request for another range
            // may take over mid-segment.
            let allow_preempt = priority == ReorgPriority::Low && percent < prompt;

            let outcome = {
                let _token = range.gate.acquire(GatePurpose::Reorg);
                self.compact_segment(&range, victim, allow_preempt)
            };
            match outcome {
                Ok(CompactOutcome::Compacted { reclaimed }) => {
                    Metrics::bump(&self.ctx.metrics.reorg_passes);
                    Metrics::add(&self.ctx.metrics.reorg_reclaimed_bytes, reclaimed as u64);
                    debug!(
                        target: "chunklog::reorg",
                        range = %key,
                        segment = victim,
                        reclaimed,
                        "segment compacted"
                    );
                }
                Ok(CompactOutcome::NothingReclaimed) => {}
                Ok(CompactOutcome::Preempted) => {
                    Metrics::bump(&self.ctx.metrics.reorg_aborted);
                    // Come back to this range once the urgent work is done.
                    self.ctx
                        .scheduler
                        .request_reorganization(key, ReorgPriority::Low);
                    break;
                }
                Err(err) => {
                    warn!(
                        target: "chunklog::reorg",
                        range = %key,
                        segment = victim,
                        %err,
                        "compaction pass failed"
                    );
                    self.ctx.metrics.record_error(&err);
                    break;
                }
            }
        }
    }

    /// Pick the most promising victim: inactive, data-bearing, oldest
    /// generation; among those, the most bytes, age-weighted when
    /// timestamps are on.
    fn select_victim(&self, range: &BackupRange) -> Option<usize> {
        let meta = range.log.snapshot_meta();
        let min_gen = meta
            .iter()
            .filter(|m| m.state == SegState::Inactive && m.used > 0)
            .map(|m| m.reorg_gen)
            .min()?;

        let cold = self.ctx.cfg.cold_data_threshold_sec.max(1) as u64;
        let now = self.ctx.now_secs() as u64;
        meta.iter()
            .enumerate()
            .filter(|(_, m)| {
                m.state == SegState::Inactive && m.used > 0 && m.reorg_gen == min_gen
            })
            .max_by_key(|(_, m)| {
                let age_weight = match m.avg_timestamp() {
                    Some(avg) => now.saturating_sub(avg as u64).min(cold),
                    None => 0,
                };
                // used dominates; age breaks toward colder segments.
                (m.used as u64) * (cold + age_weight)
            })
            .map(|(idx, _)| idx)
    }

    /// Scan one victim and install the surviving entries. Caller holds the
    /// range's gate.
    fn compact_segment(
        &self,
        range: &BackupRange,
        victim: usize,
        allow_preempt: bool,
    ) -> Result<CompactOutcome> {
        let seg_size = range.log.segment_size() as usize;
        let used = range.log.snapshot_meta()[victim].used as usize;

        let mut src = self.ctx.pool.acquire()?;
        range.log.read_segment(victim, &mut src)?;
        let view = WrapBuf::linear(&src[..seg_size]);

        let mut survivors: Vec<u8> = Vec::with_capacity(used);
        let mut kept_entries = 0u32;
        let mut kept_ts_sum = 0u64;
        let mut cursor = 0usize;
        let mut scanned = 0usize;

        while cursor < used {
            if allow_preempt
                && scanned % PREEMPT_CHECK_STRIDE == 0
                && self.ctx.scheduler.should_preempt(range.key)
            {
                return Ok(CompactOutcome::Preempted);
            }
            scanned += 1;

            let parsed = match parse_entry(
                &view,
                cursor,
                used,
                Dialect::Secondary,
                &self.ctx.codec,
                range.ctx_owner(),
            ) {
                Ok(parsed) => parsed,
                Err(ParseError::EndOfData) => break,
                Err(err) => {
                    warn!(
                        target: "chunklog::reorg",
                        range = %range.key,
                        segment = victim,
                        offset = cursor,
                        %err,
                        "unparseable entry ends compaction scan"
                    );
                    Metrics::bump(&self.ctx.metrics.corrupt_entries);
                    break;
                }
            };
            let total = parsed.total_len();

            if let Err(err) = verify_checksum(&view, cursor, &parsed) {
                warn!(
                    target: "chunklog::reorg",
                    range = %range.key,
                    segment = victim,
                    cid = %parsed.fields.cid,
                    %err,
                    "dropping entry with bad checksum"
                );
                Metrics::bump(&self.ctx.metrics.checksum_errors);
                cursor += total;
                continue;
            }

            // Equal versions win for the entry read from the log: exact
            // equality means this is the live copy.
            let current = range.versions.get_current(parsed.fields.cid);
            if parsed.fields.version >= current {
                let (a, b) = view.slices(cursor, total);
                survivors.extend_from_slice(a);
                survivors.extend_from_slice(b);
                kept_entries += 1;
                kept_ts_sum += parsed.fields.timestamp.unwrap_or(0) as u64;
            }
            cursor += total;
        }

        if survivors.len() == used {
            // Fully live; remember that so the sweep moves on.
            range.log.bump_generation(victim);
            return Ok(CompactOutcome::NothingReclaimed);
        }

        let replacement = (!survivors.is_empty()).then_some(ReplacementSegment {
            image: &survivors,
            entries: kept_entries,
            ts_sum: kept_ts_sum,
        });
        range.log.reorg_swap(victim, replacement)?;
        Ok(CompactOutcome::Compacted {
            reclaimed: used - survivors.len(),
        })
    }
}
