//! Entry serialization and parsing.
//!
//! [`encode_entry`] produces the full on-disk bytes (header + payload +
//! checksum) for either dialect; [`parse_entry`] is its position-less
//! inverse over a [`WrapBuf`]. Parsing never verifies payload checksums;
//! that is a separate, skippable step (`checksum::verify_checksum`) so
//! recovery can count mismatches without aborting.

use crate::layout::{Dialect, HeaderLayout, TypeByte};
use crate::wrap::WrapBuf;
use byteorder::{ByteOrder, LittleEndian};
use chunklog_core::{ChunkId, CodecConfig, NodeId, RangeId, Version};
use thiserror::Error;

/// Position of one part within a chained (oversized) chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainInfo {
    /// Zero-based part index.
    pub index: u8,
    /// Total number of parts.
    pub size: u8,
}

/// Logical header fields of an entry, independent of encoding widths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryFields {
    pub cid: ChunkId,
    /// Present in the primary dialect only.
    pub range: Option<RangeId>,
    /// Seconds since store init; required when timestamps are enabled.
    pub timestamp: Option<u32>,
    pub version: Version,
    pub chain: Option<ChainInfo>,
    /// Chunk owned by a node other than the range owner.
    pub migrated: bool,
}

/// Why parsing stopped at a given offset.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// A zero Type byte: zero-filled space past the last entry.
    #[error("end of data")]
    EndOfData,
    /// The entry extends past the valid region (torn trailing write).
    #[error("entry truncated at region end")]
    Truncated,
    /// Length field elided ("same as previous version"); this engine never
    /// writes such entries, so context to resolve them is unavailable.
    #[error("entry with elided length field")]
    ElidedLength,
    /// Structurally impossible field values.
    #[error("invalid header: {0}")]
    Invalid(&'static str),
}

/// One decoded entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedEntry {
    pub fields: EntryFields,
    pub type_byte: TypeByte,
    pub header_len: usize,
    pub payload_len: u32,
    /// Checksum stored in the header, when checksums are enabled.
    pub stored_crc: Option<u32>,
}

impl ParsedEntry {
    /// Total on-disk footprint: header plus payload.
    pub fn total_len(&self) -> usize {
        self.header_len + self.payload_len as usize
    }

    /// Copy the payload out of the source buffer. `offset` is the entry
    /// start the entry was parsed at.
    pub fn copy_payload(&self, buf: &WrapBuf<'_>, offset: usize) -> Vec<u8> {
        let mut payload = vec![0u8; self.payload_len as usize];
        buf.copy_to(offset + self.header_len, &mut payload);
        payload
    }
}

fn write_uint_le(out: &mut Vec<u8>, value: u64, width: usize) {
    let mut tmp = [0u8; 8];
    LittleEndian::write_uint(&mut tmp[..width.max(1)], value, width.max(1));
    out.extend_from_slice(&tmp[..width]);
}

/// Predict the encoded size of an entry without encoding it.
pub fn encoded_len(
    fields: &EntryFields,
    payload_len: usize,
    dialect: Dialect,
    cfg: &CodecConfig,
) -> usize {
    let tb = TypeByte::for_entry(
        fields.cid.local_id(),
        payload_len as u32,
        fields.version.count(),
        fields.chain.is_some(),
        fields.migrated,
    );
    HeaderLayout::resolve(tb, dialect, cfg).header_len + payload_len
}

/// Serialize one entry, checksum included when enabled.
///
/// Field widths are chosen minimally from the values; the timestamp must be
/// supplied iff timestamps are enabled.
pub fn encode_entry(
    fields: &EntryFields,
    payload: &[u8],
    dialect: Dialect,
    cfg: &CodecConfig,
) -> Vec<u8> {
    debug_assert!(
        !fields.version.is_tombstone(),
        "tombstones never enter data logs"
    );
    debug_assert!(payload.len() < 1 << 24, "payload exceeds length field");
    debug_assert_eq!(
        fields.timestamp.is_some(),
        cfg.use_timestamps,
        "timestamp presence must match configuration"
    );

    let tb = TypeByte::for_entry(
        fields.cid.local_id(),
        payload.len() as u32,
        fields.version.count(),
        fields.chain.is_some(),
        fields.migrated,
    );
    let layout = HeaderLayout::resolve(tb, dialect, cfg);

    let mut out = Vec::with_capacity(layout.header_len + payload.len());
    out.push(tb.raw());
    if layout.range_off.is_some() {
        let range = fields.range.expect("primary entry requires a range id");
        write_uint_le(&mut out, range as u64, 2);
    }
    if layout.node_off.is_some() {
        write_uint_le(&mut out, fields.cid.node_id() as u64, 2);
    }
    write_uint_le(&mut out, fields.cid.local_id(), layout.lid_width);
    write_uint_le(&mut out, payload.len() as u64, layout.len_width);
    if layout.ts_off.is_some() {
        write_uint_le(&mut out, fields.timestamp.unwrap_or(0) as u64, 4);
    }
    write_uint_le(&mut out, fields.version.epoch as u64, 2);
    if layout.ver_width > 0 {
        write_uint_le(&mut out, fields.version.count() as u64, layout.ver_width);
    }
    if layout.chain_off.is_some() {
        let chain = fields.chain.expect("chained flag without chain info");
        out.push(chain.index);
        out.push(chain.size);
    }
    if layout.crc_off.is_some() {
        let crc = crc32fast::hash(payload);
        write_uint_le(&mut out, crc as u64, 4);
    }
    debug_assert_eq!(out.len(), layout.header_len);
    out.extend_from_slice(payload);
    out
}

/// Parse the entry starting at `offset`.
///
/// `limit` is the logical end of valid data in `buf`; anything reaching past
/// it reports [`ParseError::Truncated`]. For the secondary dialect,
/// `ctx_owner` supplies the NodeId of non-migrated entries (the range's
/// owner, implied by the file the entry lives in).
pub fn parse_entry(
    buf: &WrapBuf<'_>,
    offset: usize,
    limit: usize,
    dialect: Dialect,
    cfg: &CodecConfig,
    ctx_owner: NodeId,
) -> Result<ParsedEntry, ParseError> {
    if offset >= limit {
        return Err(ParseError::EndOfData);
    }
    let raw = buf.read_u8(offset);
    if raw == 0 {
        return Err(ParseError::EndOfData);
    }
    let tb = TypeByte::from_raw(raw);
    let layout = HeaderLayout::resolve(tb, dialect, cfg);
    if offset + layout.header_len > limit {
        return Err(ParseError::Truncated);
    }
    if layout.len_width == 0 {
        return Err(ParseError::ElidedLength);
    }

    let payload_len = buf.read_uint_le(offset + layout.len_off, layout.len_width) as u32;
    let total = layout.header_len + payload_len as usize;
    if offset + total > limit {
        return Err(ParseError::Truncated);
    }

    let node = match layout.node_off {
        Some(off) => buf.read_u16_le(offset + off),
        None => ctx_owner,
    };
    let local = buf.read_uint_le(offset + layout.lid_off, layout.lid_width);
    let range = layout.range_off.map(|off| buf.read_u16_le(offset + off));
    let timestamp = layout.ts_off.map(|off| buf.read_u32_le(offset + off));
    let epoch = buf.read_u16_le(offset + layout.epoch_off);
    let count = if layout.ver_width == 0 {
        1
    } else {
        buf.read_uint_le(offset + layout.ver_off, layout.ver_width) as u32
    };

    let chain = match layout.chain_off {
        Some(off) => {
            let index = buf.read_u8(offset + off);
            let size = buf.read_u8(offset + off + 1);
            if size == 0 || index >= size {
                return Err(ParseError::Invalid("chain index outside chain size"));
            }
            Some(ChainInfo { index, size })
        }
        None => None,
    };

    let stored_crc = layout.crc_off.map(|off| buf.read_u32_le(offset + off));

    Ok(ParsedEntry {
        fields: EntryFields {
            cid: ChunkId::from_parts(node, local),
            range,
            timestamp,
            version: Version::new(epoch, count),
            chain,
            migrated: tb.is_migrated(),
        },
        type_byte: tb,
        header_len: layout.header_len,
        payload_len,
        stored_crc,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn cfg(checksums: bool, timestamps: bool) -> CodecConfig {
        CodecConfig {
            use_checksums: checksums,
            use_timestamps: timestamps,
            segment_size: 1024 * 1024,
        }
    }

    fn sample_fields(ts: bool) -> EntryFields {
        EntryFields {
            cid: ChunkId::from_parts(0x0002, 0x3E8),
            range: Some(7),
            timestamp: ts.then_some(1234),
            version: Version::new(1, 42),
            chain: None,
            migrated: false,
        }
    }

    #[test]
    fn primary_round_trip() {
        let cfg = cfg(true, true);
        let fields = sample_fields(true);
        let payload = vec![0x05u8; 64];
        let bytes = encode_entry(&fields, &payload, Dialect::Primary, &cfg);

        let view = WrapBuf::linear(&bytes);
        let parsed =
            parse_entry(&view, 0, bytes.len(), Dialect::Primary, &cfg, 0xFFFF).unwrap();
        assert_eq!(parsed.fields, fields);
        assert_eq!(parsed.payload_len, 64);
        assert_eq!(parsed.total_len(), bytes.len());
        assert_eq!(parsed.copy_payload(&view, 0), payload);
        assert_eq!(parsed.stored_crc.unwrap(), crc32fast::hash(&payload));
    }

    #[test]
    fn secondary_round_trip_uses_context_owner() {
        let cfg = cfg(false, false);
        let mut fields = sample_fields(false);
        fields.range = None;
        let bytes = encode_entry(&fields, b"abc", Dialect::Secondary, &cfg);

        let view = WrapBuf::linear(&bytes);
        let parsed = parse_entry(&view, 0, bytes.len(), Dialect::Secondary, &cfg, 0x0002).unwrap();
        assert_eq!(parsed.fields.cid, fields.cid);
        assert_eq!(parsed.fields.range, None);
        assert_eq!(parsed.stored_crc, None);
    }

    #[test]
    fn migrated_secondary_round_trip_ignores_context() {
        let cfg = cfg(true, false);
        let fields = EntryFields {
            cid: ChunkId::from_parts(0x0009, 0x123456),
            range: None,
            timestamp: None,
            version: Version::new(0, 3),
            chain: None,
            migrated: true,
        };
        let bytes = encode_entry(&fields, b"payload", Dialect::Secondary, &cfg);
        let view = WrapBuf::linear(&bytes);
        // Wrong context owner must not matter: the header carries the node.
        let parsed = parse_entry(&view, 0, bytes.len(), Dialect::Secondary, &cfg, 0xAAAA).unwrap();
        assert_eq!(parsed.fields.cid, fields.cid);
        assert!(parsed.fields.migrated);
    }

    #[test]
    fn chained_entry_round_trip() {
        let cfg = cfg(true, false);
        let fields = EntryFields {
            chain: Some(ChainInfo { index: 3, size: 13 }),
            ..sample_fields(false)
        };
        let bytes = encode_entry(&fields, b"part", Dialect::Primary, &cfg);
        let view = WrapBuf::linear(&bytes);
        let parsed = parse_entry(&view, 0, bytes.len(), Dialect::Primary, &cfg, 0).unwrap();
        assert_eq!(parsed.fields.chain, Some(ChainInfo { index: 3, size: 13 }));
    }

    #[test]
    fn zero_type_byte_reads_as_end_of_data() {
        let cfg = cfg(true, false);
        let bytes = [0u8; 32];
        let view = WrapBuf::linear(&bytes);
        assert_eq!(
            parse_entry(&view, 0, bytes.len(), Dialect::Secondary, &cfg, 0),
            Err(ParseError::EndOfData)
        );
    }

    #[test]
    fn truncated_header_and_payload_are_detected() {
        let cfg = cfg(true, false);
        let fields = sample_fields(false);
        let bytes = encode_entry(&fields, &[9u8; 100], Dialect::Primary, &cfg);
        let view = WrapBuf::linear(&bytes);

        // Limit cutting into the header.
        assert_eq!(
            parse_entry(&view, 0, 4, Dialect::Primary, &cfg, 0),
            Err(ParseError::Truncated)
        );
        // Limit cutting into the payload.
        assert_eq!(
            parse_entry(&view, 0, bytes.len() - 1, Dialect::Primary, &cfg, 0),
            Err(ParseError::Truncated)
        );
    }

    #[test]
    fn invalid_chain_is_rejected() {
        let cfg = cfg(false, false);
        let fields = EntryFields {
            chain: Some(ChainInfo { index: 0, size: 2 }),
            range: None,
            ..sample_fields(false)
        };
        let mut bytes = encode_entry(&fields, b"x", Dialect::Secondary, &cfg);
        let layout = HeaderLayout::resolve(
            TypeByte::from_raw(bytes[0]),
            Dialect::Secondary,
            &cfg,
        );
        // Corrupt the chain size to zero.
        bytes[layout.chain_off.unwrap() + 1] = 0;
        let view = WrapBuf::linear(&bytes);
        assert!(matches!(
            parse_entry(&view, 0, bytes.len(), Dialect::Secondary, &cfg, 0),
            Err(ParseError::Invalid(_))
        ));
    }

    #[test]
    fn entry_parses_across_a_wrap() {
        let cfg = cfg(true, true);
        let fields = sample_fields(true);
        let payload = vec![0xAB; 50];
        let bytes = encode_entry(&fields, &payload, Dialect::Primary, &cfg);

        // Lay the entry into a ring so it straddles the physical end.
        let ring_len = 128;
        let split = 10; // bytes of the entry before the wrap
        let mut ring = vec![0u8; ring_len];
        let origin = ring_len - split;
        ring[origin..].copy_from_slice(&bytes[..split]);
        ring[..bytes.len() - split].copy_from_slice(&bytes[split..]);

        let view = WrapBuf::new(&ring, split);
        let parsed = parse_entry(&view, 0, bytes.len(), Dialect::Primary, &cfg, 0).unwrap();
        assert_eq!(parsed.fields, fields);
        assert_eq!(parsed.copy_payload(&view, 0), payload);
    }

    proptest! {
        #[test]
        fn round_trip_any_fields(
            node in 0u16..=0xFFFF,
            local in 0u64..=0xFFFF_FFFF_FFFF,
            range in 0u16..=0xFFFF,
            count in 1u32..=0x7FFF_FF00,
            epoch in 0u16..=0xFFFF,
            payload_len in 0usize..200,
            checksums: bool,
            timestamps: bool,
            migrated: bool,
        ) {
            let cfg = cfg(checksums, timestamps);
            let fields = EntryFields {
                cid: ChunkId::from_parts(node, local),
                range: Some(range),
                timestamp: timestamps.then_some(7),
                version: Version::new(epoch, count),
                chain: None,
                migrated,
            };
            let payload = vec![0x5A; payload_len];
            let bytes = encode_entry(&fields, &payload, Dialect::Primary, &cfg);
            prop_assert_eq!(
                bytes.len(),
                encoded_len(&fields, payload.len(), Dialect::Primary, &cfg)
            );

            let view = WrapBuf::linear(&bytes);
            let parsed = parse_entry(&view, 0, bytes.len(), Dialect::Primary, &cfg, 0)
                .unwrap();
            prop_assert_eq!(parsed.fields, fields);
            prop_assert_eq!(parsed.total_len(), bytes.len());
        }
    }
}
