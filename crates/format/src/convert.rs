//! Primary→secondary header conversion.
//!
//! When an entry moves from the write buffer or primary log into a
//! secondary log, its header loses the RangeId (implied by the file) and,
//! unless the chunk is migrated, the NodeId (implied by the range owner).
//! Everything from the conversion offset onward (LocalId, length,
//! timestamp, epoch, version, chaining, checksum) is byte-identical in
//! both dialects, so the conversion writes the Type byte and copies the
//! header tail plus payload verbatim.
//!
//! The source lives in a ring, so the entry may sit entirely before the
//! wrap, be bisected by it, or start past it; `WrapBuf`'s logical
//! addressing covers all three placements.

use crate::entry::ParsedEntry;
use crate::wrap::WrapBuf;

/// Append the secondary-dialect encoding of a parsed primary entry to
/// `dst`. Returns the number of bytes written.
///
/// `offset` is the logical position `parsed` was parsed at. The payload
/// (and checksum, if present) are copied untouched, so the converted entry
/// verifies against the same CRC.
pub fn convert_to_secondary(
    src: &WrapBuf<'_>,
    offset: usize,
    parsed: &ParsedEntry,
    dst: &mut Vec<u8>,
) -> usize {
    let conv_off = if parsed.type_byte.is_migrated() {
        // Type (1) + RangeId (2): keep NodeId and everything after.
        3
    } else {
        // Type (1) + RangeId (2) + NodeId (2): keep LocalId and after.
        5
    };
    let tail_len = parsed.total_len() - conv_off;

    let start = dst.len();
    dst.push(parsed.type_byte.raw());
    dst.resize(start + 1 + tail_len, 0);
    src.copy_to(offset + conv_off, &mut dst[start + 1..]);
    1 + tail_len
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::verify_checksum;
    use crate::entry::{encode_entry, parse_entry, ChainInfo, EntryFields};
    use crate::layout::Dialect;
    use chunklog_core::{ChunkId, CodecConfig, Version};

    fn cfg(timestamps: bool) -> CodecConfig {
        CodecConfig {
            use_checksums: true,
            use_timestamps: timestamps,
            segment_size: 1024 * 1024,
        }
    }

    fn fields(migrated: bool) -> EntryFields {
        EntryFields {
            cid: ChunkId::from_parts(0x0002, 0xABCDEF),
            range: Some(0x0011),
            timestamp: Some(55),
            version: Version::new(2, 300),
            chain: Some(ChainInfo { index: 1, size: 4 }),
            migrated,
        }
    }

    /// Check that converting a primary entry equals encoding the same
    /// fields directly in the secondary dialect.
    fn assert_conversion_matches(primary_bytes: &[u8], split: Option<usize>, migrated: bool) {
        let cfg = cfg(true);
        let mut expected_fields = fields(migrated);
        expected_fields.range = None;
        let expected = encode_entry(
            &expected_fields,
            &primary_bytes_payload(primary_bytes, &cfg),
            Dialect::Secondary,
            &cfg,
        );

        // Lay the primary entry out per the requested wrap placement.
        let mut converted = Vec::new();
        match split {
            None => {
                let view = WrapBuf::linear(primary_bytes);
                let parsed =
                    parse_entry(&view, 0, primary_bytes.len(), Dialect::Primary, &cfg, 0).unwrap();
                convert_to_secondary(&view, 0, &parsed, &mut converted);
            }
            Some(split) => {
                let ring_len = primary_bytes.len() + 64;
                let mut ring = vec![0u8; ring_len];
                ring[ring_len - split..].copy_from_slice(&primary_bytes[..split]);
                ring[..primary_bytes.len() - split].copy_from_slice(&primary_bytes[split..]);
                let view = WrapBuf::new(&ring, split);
                let parsed =
                    parse_entry(&view, 0, primary_bytes.len(), Dialect::Primary, &cfg, 0).unwrap();
                convert_to_secondary(&view, 0, &parsed, &mut converted);
            }
        }
        assert_eq!(converted, expected);

        // The converted entry parses back to the same logical fields.
        let view = WrapBuf::linear(&converted);
        let parsed =
            parse_entry(&view, 0, converted.len(), Dialect::Secondary, &cfg, 0x0002).unwrap();
        assert_eq!(parsed.fields.cid, expected_fields.cid);
        assert_eq!(parsed.fields.version, expected_fields.version);
        assert_eq!(parsed.fields.chain, expected_fields.chain);
        assert!(verify_checksum(&view, 0, &parsed).is_ok());
    }

    fn primary_bytes_payload(bytes: &[u8], cfg: &CodecConfig) -> Vec<u8> {
        let view = WrapBuf::linear(bytes);
        let parsed = parse_entry(&view, 0, bytes.len(), Dialect::Primary, cfg, 0).unwrap();
        parsed.copy_payload(&view, 0)
    }

    #[test]
    fn conversion_entirely_within_buffer() {
        let bytes = encode_entry(&fields(false), &[0x77; 90], Dialect::Primary, &cfg(true));
        assert_conversion_matches(&bytes, None, false);
    }

    #[test]
    fn conversion_bisected_at_wrap() {
        let bytes = encode_entry(&fields(false), &[0x77; 90], Dialect::Primary, &cfg(true));
        // Wrap in the middle of the header.
        assert_conversion_matches(&bytes, Some(7), false);
        // Wrap in the payload.
        assert_conversion_matches(&bytes, Some(40), false);
    }

    #[test]
    fn conversion_start_past_wrap() {
        let bytes = encode_entry(&fields(false), &[0x77; 90], Dialect::Primary, &cfg(true));
        // The whole entry sits after the wrap: bytes_until_end smaller than
        // any part of the entry means logical 0 already wrapped.
        let ring_len = bytes.len() + 64;
        let mut ring = vec![0u8; ring_len];
        ring[..bytes.len()].copy_from_slice(&bytes);
        // bytes_until_end = 0: logical offset 0 maps to physical 0.
        let view = WrapBuf::new(&ring, 0);
        let cfg = cfg(true);
        let parsed = parse_entry(&view, 0, bytes.len(), Dialect::Primary, &cfg, 0).unwrap();
        let mut converted = Vec::new();
        convert_to_secondary(&view, 0, &parsed, &mut converted);

        let mut expected_fields = fields(false);
        expected_fields.range = None;
        let expected = encode_entry(&expected_fields, &[0x77; 90], Dialect::Secondary, &cfg);
        assert_eq!(converted, expected);
    }

    #[test]
    fn migrated_entries_keep_their_node_id() {
        let bytes = encode_entry(&fields(true), &[0x33; 20], Dialect::Primary, &cfg(true));
        assert_conversion_matches(&bytes, None, true);
        assert_conversion_matches(&bytes, Some(4), true);
    }

    #[test]
    fn converted_header_is_shorter_by_the_dropped_fields() {
        let cfg = cfg(false);
        let plain = encode_entry(&fields(false), b"xy", Dialect::Primary, &cfg);
        let view = WrapBuf::linear(&plain);
        let parsed = parse_entry(&view, 0, plain.len(), Dialect::Primary, &cfg, 0).unwrap();
        let mut converted = Vec::new();
        let written = convert_to_secondary(&view, 0, &parsed, &mut converted);
        // RangeId (2) and NodeId (2) dropped.
        assert_eq!(written, plain.len() - 4);

        let migrated = encode_entry(&fields(true), b"xy", Dialect::Primary, &cfg);
        let view = WrapBuf::linear(&migrated);
        let parsed = parse_entry(&view, 0, migrated.len(), Dialect::Primary, &cfg, 0).unwrap();
        let mut converted = Vec::new();
        let written = convert_to_secondary(&view, 0, &parsed, &mut converted);
        // Only RangeId (2) dropped.
        assert_eq!(written, migrated.len() - 2);
    }
}
