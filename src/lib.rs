//! # chunklog
//!
//! A log-structured persistent store for many small, mutable, identified
//! objects ("chunks"): the replication/backup tier behind an in-memory
//! key-value store. Updates stream through a shared write buffer into a
//! circular primary log and per-range segmented secondary logs; a
//! concurrent reorganization worker reclaims space from obsolete entries;
//! recovery re-reads the logs in parallel.
//!
//! # Quick start
//!
//! ```no_run
//! use chunklog::{Chunk, ChunkId, ChunkStore, StoreConfig, VecSink};
//!
//! fn main() -> chunklog::Result<()> {
//!     let store = ChunkStore::open(StoreConfig::new().with_backup_directory("./backup"))?;
//!     store.init_backup_range(2, 0)?;
//!
//!     let chunk = Chunk::new(ChunkId::from_parts(2, 1), b"payload".to_vec());
//!     store.log_chunks(2, 0, &[chunk])?;
//!
//!     let sink = VecSink::new();
//!     let metadata = store.recover_backup_range(2, 0, &sink)?;
//!     println!("{} chunks, {} bytes", metadata.chunks, metadata.bytes);
//!
//!     store.close()
//! }
//! ```
//!
//! # Architecture
//!
//! [`ChunkStore`] is the only entry point. Backup ranges partition the
//! chunk id space; each owns one secondary log, one secondary buffer and
//! one version log. The internal crates (core types, record format, disk
//! backends, engine) are not exposed; only this surface is stable.

pub use chunklog_core::{
    Chunk, ChunkId, CodecConfig, DiskAccess, Error, NodeId, RangeId, RangeKey, Result,
    StoreConfig, Version,
};
pub use chunklog_engine::{
    ChunkStore, MetricsSnapshot, RecoveryMetadata, RecoverySink, VecSink,
};
