//! bzip2 block decoder.
//!
//! Each block is cut out of the bitstream between its magic and the next
//! magic, prefixed with a minimal stream header and handed to libbzip2. The
//! next magic found by the scanner may be a chance occurrence inside the block
//! data; the block CRC decides, and on a mismatch the following magic is tried.

use std::io::{self, Read};

use bzip2::read::BzDecoder;
use tracing::trace;

use crate::bit_reader::MsbBitReader;
use crate::chunk::{BlockBoundary, ChecksumRecord, DecodeContext, DecodedChunk, StopCondition};
use crate::error::{Error, Result};
use crate::format::{read_bzip2_trailer, Continuation};
use crate::scanner::{extract_bits, read_magic, MarkerType, MAGIC_BITS, MAGIC_BLOCK, MAGIC_EOS};

/// Compressed bytes kept ahead of the current block; larger than any block.
const MIN_LOOKAHEAD: u64 = 2 * 1024 * 1024;
const WINDOW_SIZE: usize = 4 * 1024 * 1024;

/// How many following magics are tried as the end of one block.
const MAX_END_CANDIDATES: usize = 8;

const CRC_TABLE: [u32; 256] = build_crc_table();

const fn build_crc_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u32) << 24;
        let mut k = 0;
        while k < 8 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ 0x04C1_1DB7
            } else {
                crc << 1
            };
            k += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// CRC of a decoded bzip2 block (MSB-first CRC-32).
pub fn block_crc(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        crc = (crc << 8) ^ CRC_TABLE[((crc >> 24) ^ byte as u32) as usize];
    }
    !crc
}

/// Folds a block CRC into a running stream CRC.
pub fn combine_stream_crc(combined: u32, block_crc: u32) -> u32 {
    combined.rotate_left(1) ^ block_crc
}

/// A span of compressed bytes together with the magics found in it.
struct MagicWindow {
    base_byte: u64,
    bytes: Vec<u8>,
    markers: Vec<(u64, MarkerType)>,
    at_eof: bool,
}

impl MagicWindow {
    fn empty() -> Self {
        Self {
            base_byte: 0,
            bytes: Vec::new(),
            markers: Vec::new(),
            at_eof: false,
        }
    }

    fn end_byte(&self) -> u64 {
        self.base_byte + self.bytes.len() as u64
    }

    /// Reloads so that the window starts at or before the byte holding `bit`
    /// and reaches at least [`MIN_LOOKAHEAD`] past it.
    fn ensure(&mut self, ctx: &DecodeContext, bit: u64) -> Result<()> {
        let byte = bit / 8;
        let ahead = self.end_byte().saturating_sub(byte);
        if !self.bytes.is_empty()
            && byte >= self.base_byte
            && (self.at_eof || ahead >= MIN_LOOKAHEAD)
        {
            return Ok(());
        }
        self.bytes = ctx.source.read_vec(byte, WINDOW_SIZE)?;
        self.base_byte = byte;
        self.at_eof = self.bytes.len() < WINDOW_SIZE;
        self.markers = ctx.scanner.find_markers(&self.bytes, byte);
        Ok(())
    }

    fn magic_at(&self, bit: u64) -> Option<u64> {
        read_magic(&self.bytes, bit - self.base_byte * 8)
    }

    /// Candidate block ends after the block starting at `bit`.
    fn ends_after(&self, bit: u64) -> Vec<u64> {
        let mut ends: Vec<u64> = self
            .markers
            .iter()
            .filter(|(pos, _)| *pos >= bit + MAGIC_BITS)
            .take(MAX_END_CANDIDATES)
            .map(|(pos, _)| *pos)
            .collect();
        if ends.len() < MAX_END_CANDIDATES && self.at_eof {
            // No end-of-stream magic: let libbzip2 see everything up to EOF.
            ends.push(self.end_byte() * 8);
        }
        ends
    }
}

/// Decodes one block extracted from the bitstream behind a minimal stream
/// header. The missing end-of-stream record shows up as `UnexpectedEof`.
fn decompress_block_into(
    window: &MagicWindow,
    start_bit: u64,
    end_bit: u64,
    out: &mut Vec<u8>,
    scratch: &mut Vec<u8>,
) -> Result<()> {
    scratch.clear();
    scratch.extend_from_slice(b"BZh9");
    let base = window.base_byte * 8;
    extract_bits(&window.bytes, start_bit - base, end_bit - base, scratch);

    out.clear();
    let mut decoder = BzDecoder::new(&scratch[..]);
    match decoder.read_to_end(out) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(()),
        Err(e) => Err(Error::corrupt_stream(format!(
            "bzip2 block at bit {start_bit}: {e}"
        ))),
    }
}

/// Decodes the block at `start_bit` and returns its end and stored CRC.
fn decode_block(
    window: &MagicWindow,
    start_bit: u64,
    out: &mut Vec<u8>,
    scratch: &mut Vec<u8>,
) -> Result<(u64, u32)> {
    // The 32 bits after the magic, read through a 48-bit window.
    let after_magic = window
        .magic_at(start_bit + MAGIC_BITS)
        .ok_or(Error::EndOfStream)?;
    let stored_crc = (after_magic >> 16) as u32;

    let mut first_error = None;
    for end in window.ends_after(start_bit) {
        let attempt = decompress_block_into(window, start_bit, end, out, scratch).and_then(|_| {
            let actual = block_crc(out);
            if actual == stored_crc && !out.is_empty() {
                Ok(())
            } else {
                Err(Error::ChecksumMismatch {
                    expected: stored_crc,
                    actual,
                })
            }
        });
        match attempt {
            Ok(()) => return Ok((end, stored_crc)),
            Err(e) => {
                trace!(start_bit, end, error = %e, "bzip2 block end candidate rejected");
                first_error.get_or_insert(e);
            }
        }
    }
    Err(first_error.unwrap_or(Error::EndOfStream))
}

/// Decodes one bzip2 chunk starting at the magic at `start_bit`.
pub fn decode_chunk(
    ctx: &DecodeContext,
    start_bit: u64,
    stop: StopCondition,
) -> Result<DecodedChunk> {
    let mut window = MagicWindow::empty();
    let mut data = Vec::new();
    let mut block_out = Vec::new();
    let mut scratch = Vec::new();
    let mut blocks = Vec::new();
    let mut checksums = Vec::new();
    let mut is_last = false;
    let mut trailing_garbage = None;
    let mut pos = start_bit;

    let end_bit = loop {
        ctx.check_cancelled()?;
        window.ensure(ctx, pos)?;
        let magic = window.magic_at(pos).ok_or(Error::EndOfStream)?;

        if magic == MAGIC_BLOCK {
            if pos != start_bit && stop.reached(pos, data.len())? {
                break pos;
            }
            blocks.push(BlockBoundary {
                bit: pos,
                decoded_offset: data.len(),
            });
            let (end, crc) = decode_block(&window, pos, &mut block_out, &mut scratch)?;
            data.extend_from_slice(&block_out);
            checksums.push(ChecksumRecord::Bzip2Block { crc });
            pos = end;
        } else if magic == MAGIC_EOS {
            let mut reader = MsbBitReader::new(ctx.source.clone());
            reader.seek_to_bit(pos + MAGIC_BITS)?;
            let (stored_crc, continuation) = read_bzip2_trailer(&mut reader)?;
            checksums.push(ChecksumRecord::Bzip2StreamEnd { stored_crc });
            match continuation {
                Continuation::Next(bit) => pos = bit,
                Continuation::End => {
                    is_last = true;
                    break reader.tell();
                }
                Continuation::TrailingGarbage(offset) => {
                    is_last = true;
                    trailing_garbage = Some(offset);
                    break offset * 8;
                }
            }
        } else if pos == window.end_byte() * 8 && window.at_eof {
            // The last block ran to the end of the input without a stream trailer.
            return Err(Error::EndOfStream);
        } else {
            return Err(Error::FalseBlockCandidate(pos));
        }
    };

    Ok(DecodedChunk::new(
        start_bit,
        end_bit,
        data,
        Vec::new(),
        blocks,
        checksums,
        is_last,
        trailing_garbage,
    ))
}
