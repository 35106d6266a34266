//! Scanner for bzip2 block boundaries.
//!
//! bzip2 marks every block with a 48-bit magic number and every end of stream
//! with another one. Neither is byte-aligned, so a match can begin at any of
//! the eight bit offsets inside a byte.
//!
//! # Algorithm
//!
//! Two magic numbers are defined by the bzip2 format:
//! - Block marker: 0x314159265359 (π in base 16)
//! - End-of-stream marker: 0x177245385090 (√π in base 16)
//!
//! For each of them the scanner derives 8 shifted 4-byte patterns, one per bit
//! alignment, and feeds all 16 into a single Aho-Corasick automaton. A pattern
//! hit only pins down 32 of the 48 bits, so every hit is verified by extracting
//! the full 48-bit value with [`verify_magic`].
//!
//! The magic can also occur by chance inside compressed data. Hits are
//! therefore *candidates*; the block decoder confirms them with the block CRC.

use aho_corasick::AhoCorasick;
use std::io;

use crate::error::Result;

/// Marker type found in bzip2 streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerType {
    /// Block start marker (π = 0x314159265359)
    Block,
    /// End-of-stream marker (√π = 0x177245385090)
    Eos,
}

/// Block start magic number: π in hexadecimal, 3.14159265359...
pub const MAGIC_BLOCK: u64 = 0x314159265359;

/// End-of-stream magic number: √π in hexadecimal, 1.77245385090...
pub const MAGIC_EOS: u64 = 0x177245385090;

pub const MAGIC_BITS: u64 = 48;

/// Multi-pattern matcher for both bzip2 magics at every bit alignment.
pub struct Scanner {
    ac: AhoCorasick,
    /// Per pattern id: (magic_number, marker_type, bit_shift)
    patterns_info: Vec<(u64, MarkerType, usize)>,
}

impl Scanner {
    /// Builds the automaton over the 16 shifted patterns.
    ///
    /// # Pattern Generation
    ///
    /// For each magic number:
    /// 1. Shift left by 16 bits so the magic fills the top 48 bits of a `u64`
    /// 2. Generate 8 variants by shifting right 0-7 bits
    /// 3. Use bytes 1..5 of each variant as the search key; byte 0 holds the
    ///    first `8 - shift` bits of the magic mixed with unrelated bits
    pub fn new() -> Result<Self> {
        let mut patterns = Vec::with_capacity(16);
        let mut patterns_info = Vec::with_capacity(16);

        for (magic, kind) in [(MAGIC_BLOCK, MarkerType::Block), (MAGIC_EOS, MarkerType::Eos)] {
            let magic_top = magic << 16;
            for shift in 0..8 {
                let pattern_bytes = (magic_top >> shift).to_be_bytes();
                patterns.push(pattern_bytes[1..5].to_vec());
                patterns_info.push((magic, kind, shift));
            }
        }

        let ac = AhoCorasick::new(patterns)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        Ok(Self { ac, patterns_info })
    }

    /// Finds every verified magic in `data`, which starts at absolute byte
    /// `base_byte` of the stream. Positions are absolute bit offsets, sorted.
    /// Magics that begin before `data` or run past its end are not reported.
    pub fn find_markers(&self, data: &[u8], base_byte: u64) -> Vec<(u64, MarkerType)> {
        let mut markers = Vec::new();

        // Shifted patterns of the same magic can overlap each other's key bytes.
        for mat in self.ac.find_overlapping_iter(data) {
            let match_start = mat.start();
            if match_start == 0 {
                continue;
            }
            let (magic, kind, shift) = self.patterns_info[mat.pattern().as_usize()];
            let rel_bit_offset = (match_start - 1) as u64 * 8 + shift as u64;
            if verify_magic(data, rel_bit_offset, magic) {
                markers.push((base_byte * 8 + rel_bit_offset, kind));
            }
        }

        markers.sort_by_key(|m| m.0);
        markers.dedup_by_key(|m| m.0);
        markers
    }
}

/// Extracts a range of bits from a byte slice and appends them to the output buffer.
///
/// bzip2 blocks start and end at arbitrary bit positions. Bit 0 is the MSB of
/// byte 0. The extracted bits are written byte-aligned: the first output byte
/// holds bits `[start_bit, start_bit + 8)` and a trailing partial byte is padded
/// with zeros.
///
/// # Examples
///
/// ```
/// # use parallel_seekable::scanner::extract_bits;
/// let data = vec![0xAA, 0xBB]; // 10101010 10111011
/// let mut out = Vec::new();
/// extract_bits(&data, 4, 12, &mut out);
/// // Extracts bits 4-11: 1010 1011 = 0xAB
/// assert_eq!(out, vec![0xAB]);
/// ```
pub fn extract_bits(data: &[u8], start_bit: u64, end_bit: u64, out: &mut Vec<u8>) {
    if start_bit >= end_bit {
        return;
    }

    let bit_len = end_bit - start_bit;
    let byte_len = bit_len.div_ceil(8) as usize;
    out.reserve(byte_len);

    let start_byte = (start_bit / 8) as usize;
    let shift = (start_bit % 8) as u32;

    if shift == 0 {
        out.extend_from_slice(&data[start_byte..start_byte + byte_len]);

        let last_bits = (bit_len % 8) as u32;
        if last_bits > 0 {
            if let Some(last) = out.last_mut() {
                *last &= 0xFFu8 << (8 - last_bits);
            }
        }
        return;
    }

    let mut idx = start_byte;
    let mut bits_left = bit_len;

    // Eight output bytes per step while a ninth input byte is available.
    while bits_left >= 64 && idx + 9 <= data.len() {
        let mut word = [0u8; 8];
        word.copy_from_slice(&data[idx..idx + 8]);
        let hi = u64::from_be_bytes(word);
        let lo = data[idx + 8] as u64;
        out.extend_from_slice(&((hi << shift) | (lo >> (8 - shift))).to_be_bytes());
        idx += 8;
        bits_left -= 64;
    }

    while bits_left > 0 {
        let b1 = data[idx];
        let b2 = data.get(idx + 1).copied().unwrap_or(0);
        let mut val = (b1 << shift) | (b2 >> (8 - shift));
        if bits_left < 8 {
            val &= 0xFFu8 << (8 - bits_left);
            bits_left = 0;
        } else {
            bits_left -= 8;
        }
        out.push(val);
        idx += 1;
    }
}

/// Checks that the 48-bit `expected_magic` sits at `bit_offset` in `data`.
pub fn verify_magic(data: &[u8], bit_offset: u64, expected_magic: u64) -> bool {
    read_magic(data, bit_offset) == Some(expected_magic)
}

/// Reads the 48 bits at `bit_offset`, or `None` past the end of `data`.
pub fn read_magic(data: &[u8], bit_offset: u64) -> Option<u64> {
    let byte_idx = (bit_offset / 8) as usize;
    let shift = (bit_offset % 8) as u32;
    let needed = if shift == 0 { 6 } else { 7 };
    if byte_idx + needed > data.len() {
        return None;
    }

    let mut buf = [0u8; 8];
    let len_to_read = (data.len() - byte_idx).min(8);
    buf[..len_to_read].copy_from_slice(&data[byte_idx..byte_idx + len_to_read]);
    let val = u64::from_be_bytes(buf);
    Some((val << shift) >> 16)
}
