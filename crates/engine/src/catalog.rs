//! Backup-range catalog.
//!
//! Maps `(owner, range)` to the live range object. Lookups on the ingest
//! path are wait-free (`DashMap` shard reads); creation and removal are
//! serialized by a separate lifecycle lock so concurrent inits cannot
//! race file creation.

use crate::range::BackupRange;
use chunklog_core::RangeKey;
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;

pub struct Catalog {
    map: DashMap<RangeKey, Arc<BackupRange>>,
    lifecycle: Mutex<()>,
}

impl Catalog {
    pub fn new() -> Self {
        Catalog {
            map: DashMap::new(),
            lifecycle: Mutex::new(()),
        }
    }

    /// Wait-free lookup.
    pub fn get(&self, key: RangeKey) -> Option<Arc<BackupRange>> {
        self.map.get(&key).map(|r| Arc::clone(&r))
    }

    pub fn contains(&self, key: RangeKey) -> bool {
        self.map.contains_key(&key)
    }

    /// Serialize create/remove sequences; hold the guard across the whole
    /// file-system transition.
    pub fn lifecycle_lock(&self) -> MutexGuard<'_, ()> {
        self.lifecycle.lock()
    }

    /// Register a range. Caller holds the lifecycle lock.
    pub fn insert(&self, range: Arc<BackupRange>) {
        self.map.insert(range.key, range);
    }

    /// Deregister a range. Caller holds the lifecycle lock.
    pub fn remove(&self, key: RangeKey) -> Option<Arc<BackupRange>> {
        self.map.remove(&key).map(|(_, range)| range)
    }

    /// Snapshot of all live ranges (for surveys, flush-all, shutdown).
    pub fn all(&self) -> Vec<Arc<BackupRange>> {
        self.map.iter().map(|r| Arc::clone(r.value())).collect()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}
