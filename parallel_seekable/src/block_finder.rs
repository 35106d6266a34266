//! Candidate block starts inside an arbitrary byte range.
//!
//! Finders only generate candidates; decoding from a candidate is what accepts
//! or rejects it. For DEFLATE a candidate is a bit offset where a non-final
//! dynamic-Huffman block header parses into valid Huffman tables, or where a
//! non-final stored block header has a consistent LEN/NLEN pair. For bzip2 a
//! candidate is a block magic. BGZF files announce every member in its header,
//! so there the candidates are exactly the member starts.

use crate::bit_reader::LsbBitReader;
use crate::chunk::DecodeContext;
use crate::deflate::{read_dynamic_tables, BTYPE_DYNAMIC, BTYPE_STORED};
use crate::error::Result;
use crate::format::{read_gzip_header, Format, FEXTRA, GZIP_CM_DEFLATE, GZIP_MAGIC};
use crate::scanner::MarkerType;

/// Bytes read past the end of the range so that headers starting near its end
/// can still be checked in memory.
const RANGE_LOOKAHEAD: u64 = 8;

/// A BGZF member header is 18 bytes; leave room for optional name fields.
const BGZF_HEADER_SLACK: u64 = 64;

/// Lazy, finite, restartable sequence of candidate block offsets (in bits).
pub trait BlockFinder: Iterator<Item = Result<u64>> {
    /// Rewinds to the first candidate of the range.
    fn restart(&mut self);
}

/// Finder for the byte range `[lo, hi)` of the context's stream.
pub fn for_format<'a>(
    ctx: &'a DecodeContext,
    lo: u64,
    hi: u64,
) -> Result<Box<dyn BlockFinder + 'a>> {
    Ok(match ctx.format {
        Format::Gzip if ctx.bgzf => Box::new(BgzfBlockFinder::new(ctx, lo, hi)?),
        Format::Gzip => Box::new(DeflateBlockFinder::new(ctx, lo, hi)?),
        Format::Bzip2 => Box::new(Bzip2BlockFinder::new(ctx, lo, hi)?),
    })
}

pub struct DeflateBlockFinder {
    bytes: Vec<u8>,
    base_bit: u64,
    end_bit: u64,
    next_bit: u64,
    reader: LsbBitReader,
}

impl DeflateBlockFinder {
    pub fn new(ctx: &DecodeContext, lo: u64, hi: u64) -> Result<Self> {
        let len = hi.saturating_sub(lo) + RANGE_LOOKAHEAD;
        let bytes = ctx.source.read_vec(lo, len as usize)?;
        let end_bit = (hi * 8).min(lo * 8 + bytes.len() as u64 * 8);
        Ok(Self {
            bytes,
            base_bit: lo * 8,
            end_bit,
            next_bit: lo * 8,
            reader: LsbBitReader::new(ctx.source.clone()),
        })
    }

    /// Up to 32 bits starting at absolute bit `bit`, LSB-first, zero-padded.
    fn bits_at(&self, bit: u64) -> u32 {
        let rel = bit - self.base_bit;
        let byte = (rel / 8) as usize;
        if byte >= self.bytes.len() {
            return 0;
        }
        let mut word = [0u8; 5];
        let available = (self.bytes.len() - byte).min(5);
        word[..available].copy_from_slice(&self.bytes[byte..byte + available]);
        let value = u64::from_le_bytes([word[0], word[1], word[2], word[3], word[4], 0, 0, 0]);
        (value >> (rel % 8)) as u32
    }

    fn is_stored_candidate(&self, bit: u64) -> bool {
        let header_end = bit + 3;
        let aligned = header_end.div_ceil(8) * 8;
        let padding = (aligned - header_end) as u32;
        if padding > 0 && self.bits_at(header_end) & ((1 << padding) - 1) != 0 {
            return false;
        }
        let byte = ((aligned - self.base_bit) / 8) as usize;
        let Some(field) = self.bytes.get(byte..byte + 4) else {
            return false;
        };
        let len = u16::from_le_bytes([field[0], field[1]]);
        let nlen = u16::from_le_bytes([field[2], field[3]]);
        len == !nlen
    }

    fn is_candidate(&mut self, bit: u64) -> Result<bool> {
        let header = self.bits_at(bit);
        if header & 1 != 0 {
            return Ok(false);
        }
        match ((header >> 1) & 0b11) as u8 {
            BTYPE_STORED => Ok(self.is_stored_candidate(bit)),
            BTYPE_DYNAMIC => {
                let literal_codes = (header >> 3) & 0x1F;
                let distance_codes = (header >> 8) & 0x1F;
                if literal_codes > 29 || distance_codes > 29 {
                    return Ok(false);
                }
                self.reader.seek_to_bit(bit + 3)?;
                match read_dynamic_tables(&mut self.reader) {
                    Ok(_) => Ok(true),
                    Err(e) if e.is_candidate_local() => Ok(false),
                    Err(e) => Err(e),
                }
            }
            _ => Ok(false),
        }
    }
}

impl Iterator for DeflateBlockFinder {
    type Item = Result<u64>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.next_bit < self.end_bit {
            let bit = self.next_bit;
            self.next_bit += 1;
            match self.is_candidate(bit) {
                Ok(true) => return Some(Ok(bit)),
                Ok(false) => {}
                Err(e) => return Some(Err(e)),
            }
        }
        None
    }
}

impl BlockFinder for DeflateBlockFinder {
    fn restart(&mut self) {
        self.next_bit = self.base_bit;
    }
}

/// First-block offsets of the BGZF members whose DEFLATE data starts in the
/// range.
pub struct BgzfBlockFinder {
    candidates: Vec<u64>,
    next: usize,
}

impl BgzfBlockFinder {
    pub fn new(ctx: &DecodeContext, lo: u64, hi: u64) -> Result<Self> {
        let from = lo.saturating_sub(BGZF_HEADER_SLACK);
        let bytes = ctx.source.read_vec(from, (hi.saturating_sub(from) + 4) as usize)?;
        let mut reader = LsbBitReader::new(ctx.source.clone());
        let mut candidates = Vec::new();

        for (i, head) in bytes.windows(4).enumerate() {
            let offset = from + i as u64;
            if offset >= hi {
                break;
            }
            if head[..2] != GZIP_MAGIC || head[2] != GZIP_CM_DEFLATE || head[3] & FEXTRA == 0 {
                continue;
            }
            reader.seek_to_bit(offset * 8)?;
            match read_gzip_header(&mut reader) {
                Ok(header) if header.bgzf_member_size.is_some() => {
                    let bit = reader.tell();
                    if (lo * 8..hi * 8).contains(&bit) {
                        candidates.push(bit);
                    }
                }
                Ok(_) => {}
                Err(e) if e.is_candidate_local() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(Self {
            candidates,
            next: 0,
        })
    }
}

impl Iterator for BgzfBlockFinder {
    type Item = Result<u64>;

    fn next(&mut self) -> Option<Self::Item> {
        let bit = *self.candidates.get(self.next)?;
        self.next += 1;
        Some(Ok(bit))
    }
}

impl BlockFinder for BgzfBlockFinder {
    fn restart(&mut self) {
        self.next = 0;
    }
}

pub struct Bzip2BlockFinder {
    candidates: Vec<u64>,
    next: usize,
}

impl Bzip2BlockFinder {
    pub fn new(ctx: &DecodeContext, lo: u64, hi: u64) -> Result<Self> {
        // A magic starting just before `hi` extends up to 7 bytes past it.
        let len = hi.saturating_sub(lo) + 7;
        let bytes = ctx.source.read_vec(lo, len as usize)?;
        let candidates = ctx
            .scanner
            .find_markers(&bytes, lo)
            .into_iter()
            .filter(|&(bit, kind)| kind == MarkerType::Block && bit < hi * 8)
            .map(|(bit, _)| bit)
            .collect();
        Ok(Self {
            candidates,
            next: 0,
        })
    }
}

impl Iterator for Bzip2BlockFinder {
    type Item = Result<u64>;

    fn next(&mut self) -> Option<Self::Item> {
        let bit = *self.candidates.get(self.next)?;
        self.next += 1;
        Some(Ok(bit))
    }
}

impl BlockFinder for Bzip2BlockFinder {
    fn restart(&mut self) {
        self.next = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::tests::{bgzf, bgzf_member_starts, gzip, gzip_context, pseudo_text};
    use crate::config::Config;
    use crate::source::SharedSource;
    use std::sync::Arc;

    fn true_block_starts(ctx: &DecodeContext) -> Vec<u64> {
        let start = ctx.first_block_bit().unwrap();
        let chunk = ctx
            .decode(
                start,
                crate::chunk::StopCondition::Threshold {
                    bit: u64::MAX,
                    max_decoded: usize::MAX,
                },
            )
            .unwrap();
        chunk.blocks.iter().map(|b| b.bit).collect()
    }

    #[test]
    fn test_finds_every_dynamic_block() {
        let text = pseudo_text(400_000, 3);
        let compressed = gzip(&text, 6);
        let len = compressed.len() as u64;
        let ctx = gzip_context(compressed, 1 << 20);

        let starts = true_block_starts(&ctx);
        assert!(starts.len() > 2);

        let found: Vec<u64> = DeflateBlockFinder::new(&ctx, 0, len)
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        // The final block is never a candidate; every earlier one must be.
        for start in &starts[..starts.len() - 1] {
            assert!(found.contains(start), "missed block at bit {start}");
        }
    }

    #[test]
    fn test_finds_stored_blocks() {
        let data: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
        let compressed = gzip(&data, 0);
        let len = compressed.len() as u64;
        let ctx = gzip_context(compressed, 1 << 20);

        let starts = true_block_starts(&ctx);
        let found: Vec<u64> = DeflateBlockFinder::new(&ctx, 0, len)
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        // Zero padding makes several bit offsets equivalent; the true start is among them.
        for start in &starts[1..starts.len() - 1] {
            assert!(found.contains(start), "missed stored block at bit {start}");
        }
    }

    #[test]
    fn test_restart_replays_candidates() {
        let compressed = gzip(&pseudo_text(200_000, 5), 6);
        let len = compressed.len() as u64;
        let ctx = gzip_context(compressed, 1 << 20);
        let mut finder = DeflateBlockFinder::new(&ctx, len / 4, len).unwrap();
        let first: Vec<u64> = finder.by_ref().take(3).map(|r| r.unwrap()).collect();
        finder.restart();
        let again: Vec<u64> = finder.by_ref().take(3).map(|r| r.unwrap()).collect();
        assert_eq!(first, again);
        assert!(first.iter().all(|&b| b >= len / 4 * 8));
    }

    #[test]
    fn test_bgzf_candidates_are_member_starts() {
        let file = bgzf(&pseudo_text(300_000, 6), 20_000);
        let len = file.len() as u64;
        let starts = bgzf_member_starts(&file);
        let ctx = gzip_context(file, 1 << 20);
        assert!(ctx.bgzf);

        let (lo, hi) = (len / 3, 2 * len / 3);
        let expected: Vec<u64> = starts
            .iter()
            .copied()
            .filter(|&bit| bit >= lo * 8 && bit < hi * 8)
            .collect();
        assert!(expected.len() > 2);

        let mut finder = for_format(&ctx, lo, hi).unwrap();
        let found: Vec<u64> = finder.by_ref().map(|r| r.unwrap()).collect();
        assert_eq!(found, expected);
        finder.restart();
        assert_eq!(finder.next().unwrap().unwrap(), expected[0]);
    }

    #[test]
    fn test_bzip2_candidates_in_range() {
        let mut bytes = vec![0u8; 10];
        bytes.extend_from_slice(&[0x31, 0x41, 0x59, 0x26, 0x53, 0x59]);
        bytes.extend_from_slice(&[0u8; 20]);
        bytes.extend_from_slice(&[0x17, 0x72, 0x45, 0x38, 0x50, 0x90]);
        let ctx = DecodeContext::new(
            Arc::new(SharedSource::from_bytes(bytes)),
            Format::Bzip2,
            &Config::default(),
        )
        .unwrap();

        let found: Vec<u64> = Bzip2BlockFinder::new(&ctx, 0, 42)
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(found, vec![80]);

        let mut none = Bzip2BlockFinder::new(&ctx, 11, 42).unwrap();
        assert!(none.next().is_none());
    }
}
