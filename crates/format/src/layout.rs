//! Type byte and header layout derivation.
//!
//! The Type byte packs the variable field widths and the two entry flags:
//!
//! ```text
//! bit 7    6    5..4       3..2        1..0
//!     migr chn  ver width  len width   lid width
//! ```
//!
//! - lid width selector: 0,1,2,3 → 1,2,4,6 bytes
//! - length width: stored directly, 0..3 bytes (0 = "same size as the
//!   previous version"; parsed but never produced by this engine)
//! - version width selector: 0,1,2,3 → 0,1,2,4 bytes (0 = counter is 1)
//! - chained: a 2-byte (index, size) pair follows the version
//! - migrated: the entry's chunk is owned by a node other than the range's
//!   owner; a secondary header then carries the NodeId explicitly
//!
//! A Type byte of `0x00` never occurs on disk (it would need an elided
//! length) and doubles as the end-of-data marker in zero-filled regions.

use chunklog_core::CodecConfig;

const LID_WIDTHS: [usize; 4] = [1, 2, 4, 6];
const VER_WIDTHS: [usize; 4] = [0, 1, 2, 4];

const LEN_SHIFT: u8 = 2;
const VER_SHIFT: u8 = 4;
const CHAIN_BIT: u8 = 1 << 6;
const MIGRATED_BIT: u8 = 1 << 7;

/// Largest header either dialect can produce: primary with 6-byte LID,
/// 3-byte length, 4-byte version, timestamp, chain and checksum.
pub const MAX_HEADER_LEN: usize = 1 + 2 + 2 + 6 + 3 + 4 + 2 + 4 + 2 + 4;

/// Which log dialect a header is encoded for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// Aggregated cross-range log: carries RangeId and NodeId.
    Primary,
    /// Per-range log: RangeId implied by the file, NodeId only if migrated.
    Secondary,
}

/// The decoded first byte of an entry header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeByte(u8);

impl TypeByte {
    pub fn from_raw(raw: u8) -> Self {
        TypeByte(raw)
    }

    pub fn raw(self) -> u8 {
        self.0
    }

    /// Choose minimal widths for the given field values.
    pub fn for_entry(local_id: u64, length: u32, count: u32, chained: bool, migrated: bool) -> Self {
        let lid_sel: u8 = match local_id {
            0..=0xFF => 0,
            0x100..=0xFFFF => 1,
            0x1_0000..=0xFFFF_FFFF => 2,
            _ => 3,
        };
        debug_assert!(length < 1 << 24, "entry length exceeds 3-byte field");
        let len_w: u8 = if length < 1 << 8 {
            1
        } else if length < 1 << 16 {
            2
        } else {
            3
        };
        let ver_sel: u8 = match count {
            1 => 0,
            0..=0xFF => 1,
            0x100..=0xFFFF => 2,
            _ => 3,
        };
        let mut raw = lid_sel | (len_w << LEN_SHIFT) | (ver_sel << VER_SHIFT);
        if chained {
            raw |= CHAIN_BIT;
        }
        if migrated {
            raw |= MIGRATED_BIT;
        }
        TypeByte(raw)
    }

    pub fn lid_width(self) -> usize {
        LID_WIDTHS[(self.0 & 0b11) as usize]
    }

    /// Length field width in bytes; zero means the length is elided.
    pub fn len_width(self) -> usize {
        ((self.0 >> LEN_SHIFT) & 0b11) as usize
    }

    pub fn ver_width(self) -> usize {
        VER_WIDTHS[((self.0 >> VER_SHIFT) & 0b11) as usize]
    }

    pub fn is_chained(self) -> bool {
        self.0 & CHAIN_BIT != 0
    }

    pub fn is_migrated(self) -> bool {
        self.0 & MIGRATED_BIT != 0
    }
}

/// Field offsets of one entry header, resolved from `(Type, dialect,
/// CodecConfig)`. Offsets are relative to the entry start.
#[derive(Debug, Clone, Copy)]
pub struct HeaderLayout {
    pub type_byte: TypeByte,
    pub dialect: Dialect,
    /// Primary only.
    pub range_off: Option<usize>,
    /// Primary always; secondary only when migrated.
    pub node_off: Option<usize>,
    pub lid_off: usize,
    pub lid_width: usize,
    pub len_off: usize,
    pub len_width: usize,
    pub ts_off: Option<usize>,
    pub epoch_off: usize,
    pub ver_off: usize,
    pub ver_width: usize,
    pub chain_off: Option<usize>,
    pub crc_off: Option<usize>,
    pub header_len: usize,
}

impl HeaderLayout {
    pub fn resolve(type_byte: TypeByte, dialect: Dialect, cfg: &CodecConfig) -> Self {
        let (range_off, node_off, lid_off) = match dialect {
            Dialect::Primary => (Some(1), Some(3), 5),
            Dialect::Secondary if type_byte.is_migrated() => (None, Some(1), 3),
            Dialect::Secondary => (None, None, 1),
        };

        let lid_width = type_byte.lid_width();
        let len_off = lid_off + lid_width;
        let len_width = type_byte.len_width();
        let mut cursor = len_off + len_width;

        let ts_off = if cfg.use_timestamps {
            let off = cursor;
            cursor += 4;
            Some(off)
        } else {
            None
        };

        let epoch_off = cursor;
        cursor += 2;

        let ver_off = cursor;
        let ver_width = type_byte.ver_width();
        cursor += ver_width;

        let chain_off = if type_byte.is_chained() {
            let off = cursor;
            cursor += 2;
            Some(off)
        } else {
            None
        };

        let crc_off = if cfg.use_checksums {
            let off = cursor;
            cursor += 4;
            Some(off)
        } else {
            None
        };

        HeaderLayout {
            type_byte,
            dialect,
            range_off,
            node_off,
            lid_off,
            lid_width,
            len_off,
            len_width,
            ts_off,
            epoch_off,
            ver_off,
            ver_width,
            chain_off,
            crc_off,
            header_len: cursor,
        }
    }

    /// Offset the primary→secondary conversion starts copying from: the
    /// NodeId field for migrated entries, the LocalId field otherwise.
    /// Only meaningful for primary layouts.
    pub fn conversion_offset(&self) -> usize {
        debug_assert_eq!(self.dialect, Dialect::Primary);
        if self.type_byte.is_migrated() {
            self.node_off.expect("primary header carries NodeId")
        } else {
            self.lid_off
        }
    }
}
