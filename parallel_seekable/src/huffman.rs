//! Canonical Huffman tables for DEFLATE.
//!
//! Codes are stored bit-reversed in a single flat lookup table indexed by the
//! next `max_length` input bits, which is how they arrive from an LSB-first
//! [`LsbBitReader`].

use std::sync::OnceLock;

use crate::bit_reader::LsbBitReader;
use crate::error::{Error, Result};

pub const MAX_CODE_LENGTH: usize = 15;

/// Which alphabet a table encodes; decides whether incomplete codes are legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    Precode,
    Literal,
    Distance,
}

#[derive(Debug, Clone)]
pub struct HuffmanTable {
    /// `symbol << 4 | length`; length 0 marks an unused code.
    entries: Vec<u16>,
    max_length: u32,
}

impl HuffmanTable {
    /// Builds a table from per-symbol code lengths (0 = symbol unused).
    ///
    /// Over-subscribed codes are always rejected. Incomplete codes are rejected
    /// for the precode and accepted for literal/distance alphabets only when
    /// they consist of a single one-bit code.
    pub fn from_lengths(lengths: &[u8], kind: TableKind) -> Result<Self> {
        let mut counts = [0u16; MAX_CODE_LENGTH + 1];
        for &len in lengths {
            if len as usize > MAX_CODE_LENGTH {
                return Err(Error::InvalidHuffmanTable("code length above 15"));
            }
            counts[len as usize] += 1;
        }
        counts[0] = 0;

        let max_length = (1..=MAX_CODE_LENGTH).rev().find(|&l| counts[l] > 0).unwrap_or(0);
        if max_length == 0 {
            return match kind {
                // A block of only literals may carry no distance codes at all.
                TableKind::Distance => Ok(Self {
                    entries: vec![0; 1],
                    max_length: 0,
                }),
                _ => Err(Error::InvalidHuffmanTable("empty code")),
            };
        }

        let mut left: i32 = 1;
        for &count in &counts[1..] {
            left = (left << 1) - count as i32;
            if left < 0 {
                return Err(Error::InvalidHuffmanTable("over-subscribed code"));
            }
        }
        if left > 0 && (kind == TableKind::Precode || max_length != 1) {
            return Err(Error::InvalidHuffmanTable("incomplete code"));
        }

        Ok(Self::build(lengths, &counts, max_length as u32))
    }

    /// Fills the lookup table. `counts` must describe a code that is not
    /// over-subscribed.
    fn build(lengths: &[u8], counts: &[u16; MAX_CODE_LENGTH + 1], max_length: u32) -> Self {
        let mut next_code = [0u32; MAX_CODE_LENGTH + 1];
        let mut code = 0u32;
        for len in 1..=MAX_CODE_LENGTH {
            code = (code + counts[len - 1] as u32) << 1;
            next_code[len] = code;
        }

        let size = 1usize << max_length;
        let mut entries = vec![0u16; size];
        for (symbol, &len) in lengths.iter().enumerate() {
            if len == 0 {
                continue;
            }
            let len = len as u32;
            let code = next_code[len as usize];
            next_code[len as usize] += 1;
            let entry = ((symbol as u16) << 4) | len as u16;
            let mut index = reverse_bits(code, len) as usize;
            while index < size {
                entries[index] = entry;
                index += 1 << len;
            }
        }

        Self {
            entries,
            max_length,
        }
    }

    fn fixed(lengths: &[u8]) -> Self {
        let mut counts = [0u16; MAX_CODE_LENGTH + 1];
        for &len in lengths {
            counts[len as usize] += 1;
        }
        counts[0] = 0;
        let max_length = lengths.iter().copied().max().unwrap_or(0) as u32;
        Self::build(lengths, &counts, max_length)
    }

    pub fn max_length(&self) -> u32 {
        self.max_length
    }

    /// Decodes one symbol.
    #[inline]
    pub fn decode(&self, reader: &mut LsbBitReader) -> Result<u16> {
        let bits = reader.peek_padded(self.max_length)? as usize;
        let entry = self.entries[bits];
        let len = (entry & 0xF) as u32;
        if len == 0 {
            return Err(Error::InvalidHuffmanTable("bit pattern matches no code"));
        }
        reader.skip_peeked(len)?;
        Ok(entry >> 4)
    }
}

fn reverse_bits(code: u32, len: u32) -> u32 {
    code.reverse_bits() >> (32 - len)
}

/// Tables of fixed-Huffman (BTYPE=01) blocks.
pub fn fixed_tables() -> &'static (HuffmanTable, HuffmanTable) {
    static FIXED: OnceLock<(HuffmanTable, HuffmanTable)> = OnceLock::new();
    FIXED.get_or_init(|| {
        let mut lengths = [0u8; 288];
        lengths[..144].fill(8);
        lengths[144..256].fill(9);
        lengths[256..280].fill(7);
        lengths[280..].fill(8);
        // Distance codes 30 and 31 take part in the code but are rejected on decode.
        (HuffmanTable::fixed(&lengths), HuffmanTable::fixed(&[5u8; 32]))
    })
}
