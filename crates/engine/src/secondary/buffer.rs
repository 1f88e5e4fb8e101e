//! Secondary buffer: per-range staging in front of the secondary log.
//!
//! Small batches that went through the primary log accumulate here in
//! secondary format until the buffer approaches capacity (or a flush is
//! forced), so the secondary log sees few, large, page-alignable writes
//! instead of many tiny ones.

use super::EntryBlock;

pub struct SecondaryBuffer {
    data: Vec<u8>,
    ends: Vec<u32>,
    timestamps: Vec<u32>,
    capacity: usize,
}

impl SecondaryBuffer {
    pub fn new(capacity: usize) -> Self {
        SecondaryBuffer {
            data: Vec::with_capacity(capacity),
            ends: Vec::new(),
            timestamps: Vec::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn entry_count(&self) -> usize {
        self.ends.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Would appending `additional` bytes exceed capacity?
    pub fn would_overflow(&self, additional: usize) -> bool {
        self.data.len() + additional > self.capacity
    }

    /// Append one already-converted entry.
    pub fn push_entry(&mut self, entry: &[u8], timestamp: Option<u32>) {
        debug_assert!(!self.would_overflow(entry.len()), "caller checks capacity");
        self.data.extend_from_slice(entry);
        self.ends.push(self.data.len() as u32);
        if let Some(ts) = timestamp {
            self.timestamps.push(ts);
        }
    }

    /// View the staged run for flushing.
    pub fn as_block(&self) -> EntryBlock<'_> {
        EntryBlock {
            bytes: &self.data,
            ends: &self.ends,
            timestamps: &self.timestamps,
        }
    }

    /// Drop the staged contents after a successful flush.
    pub fn clear(&mut self) {
        self.data.clear();
        self.ends.clear();
        self.timestamps.clear();
    }
}
