//! Engine counters.
//!
//! Plain atomic counters, snapshotted for the utilization report. The
//! error-kind counters back the §7 requirement that user-visible failures
//! are countable per kind; everything else is pipeline bookkeeping.

use chunklog_core::Error;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
    // Errors by kind
    pub io_errors: AtomicU64,
    pub checksum_errors: AtomicU64,
    pub corrupt_entries: AtomicU64,
    pub range_not_found: AtomicU64,
    pub shutdown_refusals: AtomicU64,

    // Ingest pipeline
    pub posted_entries: AtomicU64,
    pub drained_batches: AtomicU64,
    pub drained_bytes: AtomicU64,
    pub direct_flushes: AtomicU64,
    pub staged_flushes: AtomicU64,
    pub primary_appends: AtomicU64,

    // Reorganization
    pub reorg_passes: AtomicU64,
    pub reorg_aborted: AtomicU64,
    pub reorg_reclaimed_bytes: AtomicU64,

    // Recovery
    pub recovered_chunks: AtomicU64,
    pub incomplete_chains: AtomicU64,
}

impl Metrics {
    pub fn record_error(&self, err: &Error) {
        let counter = match err {
            Error::Io(_) => &self.io_errors,
            Error::ChecksumMismatch { .. } => &self.checksum_errors,
            Error::Corrupt { .. } => &self.corrupt_entries,
            Error::RangeNotFound { .. } => &self.range_not_found,
            Error::Shutdown => &self.shutdown_refusals,
            // Config and capacity errors precede any running pipeline.
            Error::InvalidConfig { .. } | Error::BufferFull { .. } => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, delta: u64) {
        counter.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            io_errors: get(&self.io_errors),
            checksum_errors: get(&self.checksum_errors),
            corrupt_entries: get(&self.corrupt_entries),
            range_not_found: get(&self.range_not_found),
            shutdown_refusals: get(&self.shutdown_refusals),
            posted_entries: get(&self.posted_entries),
            drained_batches: get(&self.drained_batches),
            drained_bytes: get(&self.drained_bytes),
            direct_flushes: get(&self.direct_flushes),
            staged_flushes: get(&self.staged_flushes),
            primary_appends: get(&self.primary_appends),
            reorg_passes: get(&self.reorg_passes),
            reorg_aborted: get(&self.reorg_aborted),
            reorg_reclaimed_bytes: get(&self.reorg_reclaimed_bytes),
            recovered_chunks: get(&self.recovered_chunks),
            incomplete_chains: get(&self.incomplete_chains),
        }
    }
}

/// Point-in-time copy of the counters, serializable into the utilization
/// report.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub io_errors: u64,
    pub checksum_errors: u64,
    pub corrupt_entries: u64,
    pub range_not_found: u64,
    pub shutdown_refusals: u64,
    pub posted_entries: u64,
    pub drained_batches: u64,
    pub drained_bytes: u64,
    pub direct_flushes: u64,
    pub staged_flushes: u64,
    pub primary_appends: u64,
    pub reorg_passes: u64,
    pub reorg_aborted: u64,
    pub reorg_reclaimed_bytes: u64,
    pub recovered_chunks: u64,
    pub incomplete_chains: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_land_in_their_counter() {
        let metrics = Metrics::default();
        metrics.record_error(&Error::Shutdown);
        metrics.record_error(&Error::ChecksumMismatch {
            stored: 1,
            computed: 2,
        });
        metrics.record_error(&Error::RangeNotFound { owner: 1, range: 2 });

        let snap = metrics.snapshot();
        assert_eq!(snap.shutdown_refusals, 1);
        assert_eq!(snap.checksum_errors, 1);
        assert_eq!(snap.range_not_found, 1);
        assert_eq!(snap.io_errors, 0);
    }

    #[test]
    fn snapshot_serializes() {
        let metrics = Metrics::default();
        Metrics::add(&metrics.drained_bytes, 4096);
        let json = serde_json::to_string(&metrics.snapshot()).unwrap();
        assert!(json.contains("\"drained_bytes\":4096"));
    }
}
