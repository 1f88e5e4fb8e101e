//! Disk access layer and buffer management for chunklog.
//!
//! - `disk`: the [`DiskBackend`] trait and its three implementations
//!   (buffered file, direct-I/O file, raw block device)
//! - `align`: page-aligned heap buffers safe to hand to direct I/O
//! - `pool`: a bounded pool of segment-sized aligned buffers
//!
//! Everything above this crate talks to the disk exclusively through
//! [`DiskBackend`], so the three access modes stay interchangeable.

pub mod align;
pub mod disk;
pub mod pool;

pub use align::AlignedBuf;
pub use disk::{open_backend, DiskBackend};
pub use pool::{BufferPool, PooledBuffer};
