//! DEFLATE block decoder producing marker chunks.
//!
//! A chunk is decoded without knowing the output that precedes it. Output is
//! collected as `u16` symbols: values below 256 are bytes, values from
//! [`MARKER_BASE`] upward stand for "the byte `value - MARKER_BASE + 1`
//! positions before the chunk start". Copies out of a marker copy the marker
//! itself, so every marker refers directly to the preceding window and can be
//! resolved in a single pass once that window is known.

use crate::bit_reader::LsbBitReader;
use crate::chunk::{
    BlockBoundary, ChecksumRecord, DecodeContext, DecodedChunk, Marker, StopCondition,
};
use crate::error::{Error, Result};
use crate::format::{read_gzip_trailer, Continuation, DEFLATE_WINDOW_SIZE};
use crate::huffman::{fixed_tables, HuffmanTable, TableKind};

pub const MARKER_BASE: u16 = 256;

const END_OF_BLOCK: u16 = 256;

pub const BTYPE_STORED: u8 = 0;
pub const BTYPE_FIXED: u8 = 1;
pub const BTYPE_DYNAMIC: u8 = 2;

const PRECODE_ORDER: [usize; 19] = [
    16, 17, 18, 0, 8, 7, 9, 6, 10, 5, 11, 4, 12, 3, 13, 2, 14, 1, 15,
];

pub const MAX_LITERAL_CODES: usize = 286;
pub const MAX_DISTANCE_CODES: usize = 30;

const LENGTH_BASE: [u16; 29] = [
    3, 4, 5, 6, 7, 8, 9, 10, 11, 13, 15, 17, 19, 23, 27, 31, 35, 43, 51, 59, 67, 83, 99, 115,
    131, 163, 195, 227, 258,
];
const LENGTH_EXTRA: [u8; 29] = [
    0, 0, 0, 0, 0, 0, 0, 0, 1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3, 4, 4, 4, 4, 5, 5, 5, 5, 0,
];
const DISTANCE_BASE: [u16; 30] = [
    1, 2, 3, 4, 5, 7, 9, 13, 17, 25, 33, 49, 65, 97, 129, 193, 257, 385, 513, 769, 1025, 1537,
    2049, 3073, 4097, 6145, 8193, 12289, 16385, 24577,
];
const DISTANCE_EXTRA: [u8; 30] = [
    0, 0, 0, 0, 1, 1, 2, 2, 3, 3, 4, 4, 5, 5, 6, 6, 7, 7, 8, 8, 9, 9, 10, 10, 11, 11, 12, 12, 13,
    13,
];

/// Reads the code-length section of a dynamic block (everything after BTYPE)
/// and builds its literal/length and distance tables.
pub fn read_dynamic_tables(reader: &mut LsbBitReader) -> Result<(HuffmanTable, HuffmanTable)> {
    let literal_count = reader.read(5)? as usize + 257;
    let distance_count = reader.read(5)? as usize + 1;
    let precode_count = reader.read(4)? as usize + 4;
    if literal_count > MAX_LITERAL_CODES || distance_count > MAX_DISTANCE_CODES {
        return Err(Error::InvalidHuffmanTable("too many length or distance codes"));
    }

    let mut precode_lengths = [0u8; 19];
    for &symbol in &PRECODE_ORDER[..precode_count] {
        precode_lengths[symbol] = reader.read(3)? as u8;
    }
    let precode = HuffmanTable::from_lengths(&precode_lengths, TableKind::Precode)?;

    let total = literal_count + distance_count;
    let mut lengths = [0u8; MAX_LITERAL_CODES + MAX_DISTANCE_CODES];
    let mut i = 0;
    while i < total {
        let symbol = precode.decode(reader)?;
        let (value, repeat) = match symbol {
            0..=15 => (symbol as u8, 1),
            16 => {
                if i == 0 {
                    return Err(Error::InvalidHuffmanTable("repeat without previous length"));
                }
                (lengths[i - 1], 3 + reader.read(2)? as usize)
            }
            17 => (0, 3 + reader.read(3)? as usize),
            18 => (0, 11 + reader.read(7)? as usize),
            _ => return Err(Error::InvalidHuffmanTable("invalid precode symbol")),
        };
        if i + repeat > total {
            return Err(Error::InvalidHuffmanTable("code lengths overflow the alphabet"));
        }
        lengths[i..i + repeat].fill(value);
        i += repeat;
    }

    if lengths[END_OF_BLOCK as usize] == 0 {
        return Err(Error::InvalidHuffmanTable("missing end-of-block code"));
    }
    let literal = HuffmanTable::from_lengths(&lengths[..literal_count], TableKind::Literal)?;
    let distance = HuffmanTable::from_lengths(&lengths[literal_count..total], TableKind::Distance)?;
    Ok((literal, distance))
}

/// Reads LEN/NLEN of a stored block; the reader must sit right after BTYPE.
pub fn read_stored_length(reader: &mut LsbBitReader) -> Result<u16> {
    reader.align_to_byte();
    let len = reader.read(16)? as u16;
    let nlen = reader.read(16)? as u16;
    if len != !nlen {
        return Err(Error::corrupt_stream("stored block length check failed"));
    }
    Ok(len)
}

fn copy_stored(reader: &mut LsbBitReader, out: &mut Vec<u16>) -> Result<()> {
    let len = read_stored_length(reader)? as usize;
    let mut bytes = vec![0u8; len];
    reader.read_bytes(&mut bytes)?;
    out.extend(bytes.iter().map(|&b| b as u16));
    Ok(())
}

fn inflate_huffman(
    reader: &mut LsbBitReader,
    out: &mut Vec<u16>,
    literal: &HuffmanTable,
    distance: &HuffmanTable,
) -> Result<()> {
    loop {
        let symbol = literal.decode(reader)?;
        if symbol < END_OF_BLOCK {
            out.push(symbol);
            continue;
        }
        if symbol == END_OF_BLOCK {
            return Ok(());
        }

        let index = (symbol - 257) as usize;
        if index >= LENGTH_BASE.len() {
            return Err(Error::corrupt_stream("invalid length symbol"));
        }
        let length =
            LENGTH_BASE[index] as usize + reader.read(LENGTH_EXTRA[index] as u32)? as usize;

        let code = distance.decode(reader)? as usize;
        if code >= DISTANCE_BASE.len() {
            return Err(Error::corrupt_stream("invalid distance symbol"));
        }
        let dist =
            DISTANCE_BASE[code] as usize + reader.read(DISTANCE_EXTRA[code] as u32)? as usize;

        copy_match(out, dist, length);
    }
}

/// Appends a back-reference. Positions before the chunk start become markers.
fn copy_match(out: &mut Vec<u16>, dist: usize, length: usize) {
    let pos = out.len();
    if dist <= pos {
        let from = pos - dist;
        if dist >= length {
            out.extend_from_within(from..from + length);
        } else {
            for i in 0..length {
                let value = out[from + i];
                out.push(value);
            }
        }
        return;
    }
    for i in 0..length {
        let p = pos + i;
        let value = if dist > p {
            // dist <= 32768, so the prior distance always fits the marker range.
            MARKER_BASE + (dist - p - 1) as u16
        } else {
            out[p - dist]
        };
        out.push(value);
    }
}

/// Decodes one gzip/DEFLATE chunk starting at the block header at `start_bit`.
pub fn decode_chunk(
    ctx: &DecodeContext,
    start_bit: u64,
    stop: StopCondition,
) -> Result<DecodedChunk> {
    let mut reader = LsbBitReader::new(ctx.source.clone());
    reader.seek_to_bit(start_bit)?;

    let mut out: Vec<u16> = Vec::new();
    let mut blocks = Vec::new();
    let mut checksums = Vec::new();
    let mut is_last = false;
    let mut trailing_garbage = None;

    let end_bit = loop {
        ctx.check_cancelled()?;
        blocks.push(BlockBoundary {
            bit: reader.tell(),
            decoded_offset: out.len(),
        });

        let is_final = reader.read(1)? == 1;
        let block_type = reader.read(2)? as u8;
        match block_type {
            BTYPE_STORED => copy_stored(&mut reader, &mut out)?,
            BTYPE_FIXED => {
                let (literal, distance) = fixed_tables();
                inflate_huffman(&mut reader, &mut out, literal, distance)?;
            }
            BTYPE_DYNAMIC => {
                let (literal, distance) = read_dynamic_tables(&mut reader)?;
                inflate_huffman(&mut reader, &mut out, &literal, &distance)?;
            }
            other => return Err(Error::InvalidBlockType(other)),
        }

        let mut boundary = reader.tell();
        let mut member_start = false;
        if is_final {
            let (footer, continuation) = read_gzip_trailer(&mut reader)?;
            checksums.push(ChecksumRecord::GzipFooter {
                offset: out.len(),
                crc32: footer.crc32,
                size: footer.size,
            });
            match continuation {
                Continuation::Next(bit) => {
                    boundary = bit;
                    member_start = true;
                }
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
        }

        let eligible = member_start || !ctx.bgzf || matches!(stop, StopCondition::Exact(_));
        if eligible && stop.reached(boundary, out.len())? {
            break boundary;
        }
    };

    Ok(split_markers(
        start_bit,
        end_bit,
        &out,
        blocks,
        checksums,
        is_last,
        trailing_garbage,
    ))
}

fn split_markers(
    start_bit: u64,
    end_bit: u64,
    out: &[u16],
    blocks: Vec<BlockBoundary>,
    checksums: Vec<ChecksumRecord>,
    is_last: bool,
    trailing_garbage: Option<u64>,
) -> DecodedChunk {
    let mut markers = Vec::new();
    let data = out
        .iter()
        .enumerate()
        .map(|(position, &value)| {
            if value < MARKER_BASE {
                value as u8
            } else {
                markers.push(Marker {
                    position,
                    distance: value - MARKER_BASE + 1,
                });
                0
            }
        })
        .collect();
    debug_assert!(markers
        .iter()
        .all(|m| m.distance as usize <= DEFLATE_WINDOW_SIZE));

    DecodedChunk::new(
        start_bit,
        end_bit,
        data,
        markers,
        blocks,
        checksums,
        is_last,
        trailing_garbage,
    )
}
