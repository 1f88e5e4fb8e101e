//! Log-entry record format.
//!
//! Every byte that hits a chunklog log file goes through this crate: the
//! Type byte describing field widths, the two header dialects (primary and
//! secondary), payload checksums, and the in-place conversion that turns a
//! primary entry into a secondary one while it moves between logs.
//!
//! # Entry layout
//!
//! ```text
//! Primary:
//! ┌──────┬─────────┬────────┬─────────┬────────┬────┬───────┬─────┬───────┬─────┬─────────┐
//! │ Type │ RangeId │ NodeId │ LocalId │ Length │ TS │ Epoch │ Ver │ Chain │ CRC │ Payload │
//! │  1   │    2    │   2    │  1..6   │  0..3  │0/4 │   2   │0..4 │  0/2  │ 0/4 │   ...   │
//! └──────┴─────────┴────────┴─────────┴────────┴────┴───────┴─────┴───────┴─────┴─────────┘
//! Secondary:
//! ┌──────┬────────────────┬─────────┬────────┬────┬───────┬─────┬───────┬─────┬─────────┐
//! │ Type │ NodeId(migr.)  │ LocalId │ Length │ TS │ Epoch │ Ver │ Chain │ CRC │ Payload │
//! └──────┴────────────────┴─────────┴────────┴────┴───────┴─────┴───────┴─────┴─────────┘
//! ```
//!
//! Field widths derive from the Type byte; timestamp and checksum presence
//! derive from the immutable [`CodecConfig`](chunklog_core::CodecConfig).
//! Header size is therefore a pure function of `(Type, CodecConfig)`: no
//! state, no virtual dispatch.
//!
//! # Position-less access
//!
//! All reads and writes take an explicit offset into a [`WrapBuf`], a view
//! that carries `bytes_until_end` and logically concatenates a buffer across
//! its wrap point. One buffer can be parsed from many threads at once, and
//! entries that straddle the wrap of a ring parse the same as linear ones.

pub mod checksum;
pub mod convert;
pub mod entry;
pub mod layout;
pub mod wrap;

pub use checksum::{add_checksum, payload_checksum, verify_checksum};
pub use convert::convert_to_secondary;
pub use entry::{
    encode_entry, encoded_len, parse_entry, ChainInfo, EntryFields, ParseError, ParsedEntry,
};
pub use layout::{Dialect, HeaderLayout, TypeByte, MAX_HEADER_LEN};
pub use wrap::WrapBuf;
