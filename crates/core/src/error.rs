//! Error types for the chunklog store.
//!
//! One unified [`Error`] enum covers every failure the engine can surface.
//! The variants map one-to-one onto the store's propagation policy:
//!
//! - `Io` on an append is fatal to the affected batch and poisons the range
//!   until it is re-initialized
//! - `ChecksumMismatch` during recovery is counted and skipped, never fatal
//! - `BufferFull` is only returned when a single entry cannot ever fit;
//!   ordinary backpressure blocks instead
//! - `Shutdown` is what blocked producers see when the store closes under
//!   them

use crate::types::{NodeId, RangeId};
use std::io;
use thiserror::Error;

/// Result type alias used across all chunklog crates.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for all chunklog operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The configuration failed validation; the engine refuses to start.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// An underlying disk operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A payload checksum did not match its header.
    #[error("checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { stored: u32, computed: u32 },

    /// A single entry exceeds the write buffer capacity and can never be
    /// posted.
    #[error("entry of {requested} bytes cannot fit a {capacity} byte write buffer")]
    BufferFull { requested: usize, capacity: usize },

    /// The addressed backup range does not exist (or was removed, or is
    /// poisoned after an I/O failure).
    #[error("backup range {owner:04x}/{range:04x} not found")]
    RangeNotFound { owner: NodeId, range: RangeId },

    /// On-disk data could not be parsed.
    #[error("corrupt data: {detail}")]
    Corrupt { detail: String },

    /// The operation raced a shutdown and was abandoned.
    #[error("store is shutting down")]
    Shutdown,
}

impl Error {
    /// Constructor for corruption errors.
    pub fn corrupt(detail: impl Into<String>) -> Self {
        Error::Corrupt {
            detail: detail.into(),
        }
    }

    /// Constructor for configuration errors.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Error::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// True for errors that indicate damaged on-disk state.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corrupt { .. } | Error::ChecksumMismatch { .. })
    }

    /// True when the operation failed because the store is closing.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Error::Shutdown)
    }

    /// Label used by the metrics counters.
    pub fn kind_label(&self) -> &'static str {
        match self {
            Error::InvalidConfig { .. } => "invalid_config",
            Error::Io(_) => "io",
            Error::ChecksumMismatch { .. } => "checksum_mismatch",
            Error::BufferFull { .. } => "buffer_full",
            Error::RangeNotFound { .. } => "range_not_found",
            Error::Corrupt { .. } => "corrupt",
            Error::Shutdown => "shutdown",
        }
    }
}
