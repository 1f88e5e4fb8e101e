//! Wrap-aware buffer view.
//!
//! Ring buffers (the write buffer, the circular primary log) hand out
//! regions that may cross the physical end of the allocation. Rather than
//! teaching every field accessor about two slices, [`WrapBuf`] maps logical
//! offsets onto the physical buffer: logical `0` sits `bytes_until_end`
//! bytes before the physical end, and offsets past that continue at
//! physical `0`.
//!
//! `bytes_until_end` is an explicit, caller-supplied invariant of the API:
//! a linear buffer is just the special case `bytes_until_end == len`.

use byteorder::{ByteOrder, LittleEndian};

/// Read-only view of a possibly-wrapped byte buffer.
#[derive(Clone, Copy)]
pub struct WrapBuf<'a> {
    buf: &'a [u8],
    bytes_until_end: usize,
}

impl<'a> WrapBuf<'a> {
    /// View with an explicit wrap point: logical offset `0` is at physical
    /// `buf.len() - bytes_until_end`.
    pub fn new(buf: &'a [u8], bytes_until_end: usize) -> Self {
        assert!(
            bytes_until_end <= buf.len(),
            "bytes_until_end {} exceeds buffer length {}",
            bytes_until_end,
            buf.len()
        );
        WrapBuf {
            buf,
            bytes_until_end,
        }
    }

    /// View of an ordinary linear buffer (no wrap).
    pub fn linear(buf: &'a [u8]) -> Self {
        WrapBuf {
            bytes_until_end: buf.len(),
            buf,
        }
    }

    /// Logical capacity, equal to the physical buffer length.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn bytes_until_end(&self) -> usize {
        self.bytes_until_end
    }

    fn phys(&self, logical: usize) -> usize {
        debug_assert!(logical < self.buf.len(), "logical offset out of range");
        if logical < self.bytes_until_end {
            self.buf.len() - self.bytes_until_end + logical
        } else {
            logical - self.bytes_until_end
        }
    }

    pub fn read_u8(&self, offset: usize) -> u8 {
        self.buf[self.phys(offset)]
    }

    /// Copy `out.len()` logical bytes starting at `offset` into `out`,
    /// reassembling across the wrap when needed.
    pub fn copy_to(&self, offset: usize, out: &mut [u8]) {
        if out.is_empty() {
            return;
        }
        if offset < self.bytes_until_end {
            let first = (self.bytes_until_end - offset).min(out.len());
            let start = self.phys(offset);
            out[..first].copy_from_slice(&self.buf[start..start + first]);
            if first < out.len() {
                let rest = out.len() - first;
                out[first..].copy_from_slice(&self.buf[..rest]);
            }
        } else {
            let start = self.phys(offset);
            out.copy_from_slice(&self.buf[start..start + out.len()]);
        }
    }

    /// Read an unsigned little-endian integer of `width` bytes (1..=8).
    pub fn read_uint_le(&self, offset: usize, width: usize) -> u64 {
        debug_assert!((1..=8).contains(&width));
        let mut tmp = [0u8; 8];
        self.copy_to(offset, &mut tmp[..width]);
        LittleEndian::read_uint(&tmp[..width], width)
    }

    pub fn read_u16_le(&self, offset: usize) -> u16 {
        self.read_uint_le(offset, 2) as u16
    }

    pub fn read_u32_le(&self, offset: usize) -> u32 {
        self.read_uint_le(offset, 4) as u32
    }

    /// Borrow the logical region `[offset, offset + len)` as at most two
    /// physical slices, in logical order. The second slice is empty when
    /// the region does not cross the wrap.
    pub fn slices(&self, offset: usize, len: usize) -> (&'a [u8], &'a [u8]) {
        if len == 0 {
            return (&[], &[]);
        }
        if offset < self.bytes_until_end {
            let start = self.phys(offset);
            let first = (self.bytes_until_end - offset).min(len);
            (&self.buf[start..start + first], &self.buf[..len - first])
        } else {
            let start = self.phys(offset);
            (&self.buf[start..start + len], &[])
        }
    }
}

impl std::fmt::Debug for WrapBuf<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WrapBuf")
            .field("len", &self.buf.len())
            .field("bytes_until_end", &self.bytes_until_end)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_view_reads_straight_through() {
        let data = [1u8, 2, 3, 4, 5];
        let view = WrapBuf::linear(&data);
        assert_eq!(view.read_u8(0), 1);
        assert_eq!(view.read_u8(4), 5);
        let mut out = [0u8; 3];
        view.copy_to(1, &mut out);
        assert_eq!(out, [2, 3, 4]);
    }

    #[test]
    fn wrapped_view_reassembles_across_the_boundary() {
        // Physical: [C D E | A B] with bytes_until_end = 2 means the
        // logical stream is A B C D E.
        let data = [b'C', b'D', b'E', b'A', b'B'];
        let view = WrapBuf::new(&data, 2);
        assert_eq!(view.read_u8(0), b'A');
        assert_eq!(view.read_u8(1), b'B');
        assert_eq!(view.read_u8(2), b'C');

        let mut out = [0u8; 5];
        view.copy_to(0, &mut out);
        assert_eq!(&out, b"ABCDE");

        // Read fully past the wrap.
        let mut out = [0u8; 2];
        view.copy_to(3, &mut out);
        assert_eq!(&out, b"DE");
    }

    #[test]
    fn multibyte_reads_cross_the_wrap() {
        // Logical stream: 0x11 0x22 0x33 0x44 with the wrap after 0x22.
        let data = [0x33u8, 0x44, 0x11, 0x22];
        let view = WrapBuf::new(&data, 2);
        assert_eq!(view.read_u16_le(0), 0x2211);
        assert_eq!(view.read_u16_le(1), 0x3322); // straddles the wrap
        assert_eq!(view.read_u32_le(0), 0x4433_2211);
        assert_eq!(view.read_uint_le(1, 3), 0x44_3322);
    }

    #[test]
    #[should_panic]
    fn bytes_until_end_must_fit() {
        let data = [0u8; 4];
        let _ = WrapBuf::new(&data, 5);
    }
}
