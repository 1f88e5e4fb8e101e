//! The chunklog engine: two-stage logging with concurrent reorganization.
//!
//! Ingest path: callers post batches through [`ChunkStore::log_chunks`];
//! entries land in the shared [`write_buffer`], a single drainer partitions
//! them per backup range and either appends them straight to the range's
//! secondary log (large batches, headers converted in place) or routes them
//! through the circular primary log plus the range's secondary buffer.
//! A long-running reorganization worker compacts secondary-log segments
//! live, mediated by the [`scheduler`]. Recovery re-reads secondary logs in
//! parallel and streams surviving chunks into the caller's sink.
//!
//! The only public surface is [`ChunkStore`] and the recovery types; the
//! modules are exposed for the crate's integration tests.

mod catalog;
mod ctx;
mod dispatch;
mod metrics;
mod primary_log;
mod range;
mod recovery;
mod reorg;
mod scheduler;
mod secondary;
mod store;
mod version;
mod write_buffer;

pub use metrics::MetricsSnapshot;
pub use recovery::{RecoveryMetadata, RecoverySink, VecSink};
pub use store::ChunkStore;
pub use version::VersionStore;
