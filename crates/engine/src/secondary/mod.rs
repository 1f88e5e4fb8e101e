//! Per-range secondary log: staging buffer and segmented on-disk log.

pub mod buffer;
pub mod log;

pub use buffer::SecondaryBuffer;
pub use log::{SecondaryLog, SegState, SegmentMeta};

/// A run of whole secondary-format entries headed for a secondary log.
///
/// `ends` holds the cumulative end offset of each entry within `bytes`, so
/// the log can cut the run at entry boundaries when a segment fills.
/// `timestamps` is either empty (timestamps disabled) or one entry
/// timestamp per element of `ends`.
pub struct EntryBlock<'a> {
    pub bytes: &'a [u8],
    pub ends: &'a [u32],
    pub timestamps: &'a [u32],
}

impl EntryBlock<'_> {
    pub fn entry_count(&self) -> usize {
        self.ends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ends.is_empty()
    }
}
