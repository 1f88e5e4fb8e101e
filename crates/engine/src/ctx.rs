//! Shared engine context.
//!
//! One `Arc<EngineCtx>` threads the immutable configuration and the shared
//! services (catalog, scheduler, buffer pool, metrics) through the
//! dispatcher, the reorganization worker and recovery. The context holds
//! no references to worker threads or to the write buffer, keeping
//! ownership strictly one-directional.

use crate::catalog::Catalog;
use crate::metrics::Metrics;
use crate::scheduler::Scheduler;
use chunklog_core::{CodecConfig, StoreConfig};
use chunklog_storage::BufferPool;
use std::time::Instant;

pub struct EngineCtx {
    pub cfg: StoreConfig,
    pub codec: CodecConfig,
    pub catalog: Catalog,
    pub scheduler: Scheduler,
    pub pool: BufferPool,
    pub metrics: Metrics,
    init_at: Instant,
}

impl EngineCtx {
    pub fn new(cfg: StoreConfig) -> Self {
        let codec = cfg.codec();
        let pool = BufferPool::new(
            cfg.buffer_pool_buffers,
            cfg.log_segment_size as usize,
            cfg.flash_page_size as usize,
        );
        EngineCtx {
            codec,
            pool,
            catalog: Catalog::new(),
            scheduler: Scheduler::new(),
            metrics: Metrics::default(),
            init_at: Instant::now(),
            cfg,
        }
    }

    /// Seconds since store init; the timestamp written into entries.
    pub fn now_secs(&self) -> u32 {
        self.init_at.elapsed().as_secs() as u32
    }

    /// The entry timestamp for the current configuration.
    pub fn entry_timestamp(&self) -> Option<u32> {
        self.codec.use_timestamps.then(|| self.now_secs())
    }
}
