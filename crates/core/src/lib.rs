//! Core types for the chunklog backup store.
//!
//! This crate holds the pieces every other chunklog crate depends on:
//!
//! - `types`: chunk and range identifiers, version numbers
//! - `error`: the unified error type and `Result` alias
//! - `config`: store configuration and the immutable codec configuration
//!
//! Nothing in here touches the disk or spawns threads.

pub mod config;
pub mod error;
pub mod types;

pub use config::{CodecConfig, DiskAccess, StoreConfig};
pub use error::{Error, Result};
pub use types::{Chunk, ChunkId, NodeId, RangeId, RangeKey, Version};
