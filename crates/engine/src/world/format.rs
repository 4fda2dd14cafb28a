//! Low-level pieces of the region binary format: bounds-checked reads, the
//! section presence mask, and the bit-packing used by section payloads.
//!
//! All integers are big-endian.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::FormatError;

pub(crate) fn ensure(buf: &impl Buf, needed: usize) -> Result<(), FormatError> {
    if buf.remaining() < needed {
        return Err(FormatError::UnexpectedEof {
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

pub(crate) fn read_u8(buf: &mut impl Buf) -> Result<u8, FormatError> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

pub(crate) fn read_u16(buf: &mut impl Buf) -> Result<u16, FormatError> {
    ensure(buf, 2)?;
    Ok(buf.get_u16())
}

pub(crate) fn read_i32(buf: &mut impl Buf) -> Result<i32, FormatError> {
    ensure(buf, 4)?;
    Ok(buf.get_i32())
}

pub(crate) fn read_u64(buf: &mut impl Buf) -> Result<u64, FormatError> {
    ensure(buf, 8)?;
    Ok(buf.get_u64())
}

/// Read a non-negative `i32` length.
pub(crate) fn read_len(buf: &mut impl Buf) -> Result<usize, FormatError> {
    let len = read_i32(buf)?;
    usize::try_from(len).map_err(|_| FormatError::NegativeLength(len))
}

pub(crate) fn read_bytes(buf: &mut impl Buf, len: usize) -> Result<Vec<u8>, FormatError> {
    ensure(buf, len)?;
    let mut out = vec![0u8; len];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

pub(crate) fn read_string(buf: &mut impl Buf) -> Result<String, FormatError> {
    let len = read_u16(buf)? as usize;
    Ok(String::from_utf8(read_bytes(buf, len)?)?)
}

/// Names longer than `u16::MAX` bytes are truncated at a char boundary.
pub(crate) fn write_string(out: &mut BytesMut, s: &str) {
    let mut end = s.len().min(u16::MAX as usize);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    out.put_u16(end as u16);
    out.put_slice(&s.as_bytes()[..end]);
}

// ── Presence mask ────────────────────────────────────────────────────────────

/// Fixed-length bitset serialized as `ceil(len / 8)` bytes, bit `i` stored
/// in byte `i / 8` at position `i % 8` (least significant first).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceMask {
    len: usize,
    bytes: Vec<u8>,
}

impl PresenceMask {
    pub fn new(len: usize) -> Self {
        Self {
            len,
            bytes: vec![0; len.div_ceil(8)],
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// # Panics
    /// If `index >= len`.
    pub fn set(&mut self, index: usize, present: bool) {
        assert!(index < self.len, "bit {index} out of range for mask of {}", self.len);
        let bit = 1u8 << (index % 8);
        if present {
            self.bytes[index / 8] |= bit;
        } else {
            self.bytes[index / 8] &= !bit;
        }
    }

    pub fn get(&self, index: usize) -> bool {
        index < self.len && self.bytes[index / 8] & (1 << (index % 8)) != 0
    }

    pub fn count(&self) -> usize {
        self.bytes.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn write(&self, out: &mut BytesMut) {
        out.put_slice(&self.bytes);
    }

    pub fn read(len: usize, buf: &mut impl Buf) -> Result<Self, FormatError> {
        let mut bytes = read_bytes(buf, len.div_ceil(8))?;
        // Ignore stray bits past `len` in the last byte.
        if len % 8 != 0 {
            if let Some(last) = bytes.last_mut() {
                *last &= (1u8 << (len % 8)) - 1;
            }
        }
        Ok(Self { len, bytes })
    }
}

// ── Bit-packing ─────────────────────────────────────────────────────────────

/// Bits needed to address `palette_len` entries (minimum 1).
pub(crate) fn bits_per_entry(palette_len: usize) -> usize {
    if palette_len <= 2 {
        1
    } else {
        (usize::BITS - (palette_len - 1).leading_zeros()) as usize
    }
}

/// Pack indices into `u64` words. Entries never span two words.
pub(crate) fn pack_indices(indices: &[u16], bits: usize) -> Vec<u64> {
    let entries_per_word = 64 / bits;
    let mask = (1u64 << bits) - 1;
    let mut words = vec![0u64; indices.len().div_ceil(entries_per_word)];
    for (i, &idx) in indices.iter().enumerate() {
        let bit_offset = (i % entries_per_word) * bits;
        words[i / entries_per_word] |= (idx as u64 & mask) << bit_offset;
    }
    words
}

/// Inverse of [`pack_indices`] for `out.len()` entries.
pub(crate) fn unpack_indices(words: &[u64], bits: usize, out: &mut [u16]) {
    let entries_per_word = 64 / bits;
    let mask = (1u64 << bits) - 1;
    for (i, idx) in out.iter_mut().enumerate() {
        let word = words.get(i / entries_per_word).copied().unwrap_or(0);
        *idx = ((word >> ((i % entries_per_word) * bits)) & mask) as u16;
    }
}

pub(crate) fn packed_len(entries: usize, bits: usize) -> usize {
    entries.div_ceil(64 / bits)
}
