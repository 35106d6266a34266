//! Container formats: sniffing, gzip member headers and trailers, bzip2 stream
//! headers and end-of-stream records.

use std::sync::Arc;

use crate::bit_reader::{LsbBitReader, MsbBitReader};
use crate::error::{Error, Result};
use crate::source::SharedSource;

/// Largest DEFLATE back-reference distance.
pub const DEFLATE_WINDOW_SIZE: usize = 32 * 1024;

pub(crate) const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
pub(crate) const GZIP_CM_DEFLATE: u8 = 8;

const FTEXT: u8 = 0x01;
const FHCRC: u8 = 0x02;
pub(crate) const FEXTRA: u8 = 0x04;
const FNAME: u8 = 0x08;
const FCOMMENT: u8 = 0x10;
const FRESERVED: u8 = !(FTEXT | FHCRC | FEXTRA | FNAME | FCOMMENT);

/// BGZF extra subfield: `SI1 = 'B'`, `SI2 = 'C'`, two bytes of BSIZE.
const BGZF_SUBFIELD: [u8; 2] = *b"BC";

/// Length of the "BZh1".."BZh9" stream header in bits.
pub const BZIP2_HEADER_BITS: u64 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    Gzip,
    Bzip2,
}

impl Format {
    /// Maximum distance a back-reference may reach into preceding output.
    /// bzip2 blocks are self-contained, so their window is empty.
    pub fn window_size(self) -> usize {
        match self {
            Format::Gzip => DEFLATE_WINDOW_SIZE,
            Format::Bzip2 => 0,
        }
    }

    /// Tag stored in exported indexes.
    pub fn tag(self) -> u8 {
        match self {
            Format::Gzip => 1,
            Format::Bzip2 => 2,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Format::Gzip),
            2 => Some(Format::Bzip2),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Format::Gzip => "gzip",
            Format::Bzip2 => "bzip2",
        }
    }

    /// Identifies the format from the leading magic bytes.
    pub fn detect(source: &SharedSource) -> Result<Self> {
        let head = source.read_vec(0, 4)?;
        if head.len() >= 3 && head[..2] == GZIP_MAGIC && head[2] == GZIP_CM_DEFLATE {
            return Ok(Format::Gzip);
        }
        if head.len() == 4 && is_bzip2_header(&head) {
            return Ok(Format::Bzip2);
        }
        Err(Error::UnknownFormat)
    }

    /// Bit offset of the first block, right after the container header.
    pub fn first_block_bit(self, source: &Arc<SharedSource>) -> Result<u64> {
        match self {
            Format::Gzip => {
                let mut reader = LsbBitReader::new(source.clone());
                read_gzip_header(&mut reader).map_err(|e| e.into_mandatory(0))?;
                Ok(reader.tell())
            }
            Format::Bzip2 => Ok(BZIP2_HEADER_BITS),
        }
    }

    /// Whether the stream is BGZF: gzip members that each announce their own
    /// size in a `BC` extra subfield. An unreadable header counts as "no";
    /// [`Format::first_block_bit`] reports it.
    pub fn is_bgzf(self, source: &Arc<SharedSource>) -> bool {
        match self {
            Format::Gzip => {
                let mut reader = LsbBitReader::new(source.clone());
                read_gzip_header(&mut reader).is_ok_and(|h| h.bgzf_member_size.is_some())
            }
            Format::Bzip2 => false,
        }
    }
}

impl std::fmt::Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

fn is_bzip2_header(bytes: &[u8]) -> bool {
    bytes.len() >= 4 && &bytes[..3] == b"BZh" && (b'1'..=b'9').contains(&bytes[3])
}

fn read_byte(reader: &mut LsbBitReader) -> Result<u8> {
    Ok(reader.read(8)? as u8)
}

fn read_u16_le(reader: &mut LsbBitReader) -> Result<u16> {
    Ok(reader.read(16)? as u16)
}

fn read_u32_le(reader: &mut LsbBitReader) -> Result<u32> {
    Ok(reader.read(32)? as u32)
}

fn skip_zero_terminated(reader: &mut LsbBitReader) -> Result<()> {
    while read_byte(reader)? != 0 {}
    Ok(())
}

/// What a gzip member header tells about the member.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GzipHeader {
    /// Total size of the member in bytes, from a BGZF `BC` subfield.
    pub bgzf_member_size: Option<u32>,
}

/// Walks the extra field's subfields. A field that does not split into
/// subfields is skipped whole, as gzip itself does.
fn read_extra_field(reader: &mut LsbBitReader) -> Result<Option<u32>> {
    let mut remaining = read_u16_le(reader)? as u64;
    let mut member_size = None;
    while remaining >= 4 {
        let id = [read_byte(reader)?, read_byte(reader)?];
        let len = read_u16_le(reader)? as u64;
        remaining -= 4;
        if len > remaining {
            break;
        }
        if id == BGZF_SUBFIELD && len == 2 {
            member_size = Some(read_u16_le(reader)? as u32 + 1);
        } else {
            reader.skip(len * 8)?;
        }
        remaining -= len;
    }
    reader.skip(remaining * 8)?;
    Ok(member_size)
}

/// Parses a gzip member header at the current (byte-aligned) position and
/// leaves the reader on the first DEFLATE block.
pub fn read_gzip_header(reader: &mut LsbBitReader) -> Result<GzipHeader> {
    let start = reader.tell();
    if read_byte(reader)? != GZIP_MAGIC[0] || read_byte(reader)? != GZIP_MAGIC[1] {
        return Err(Error::corrupt_stream(format!(
            "missing gzip magic at byte {}",
            start / 8
        )));
    }
    let method = read_byte(reader)?;
    if method != GZIP_CM_DEFLATE {
        return Err(Error::corrupt_stream(format!(
            "unsupported gzip compression method {method}"
        )));
    }
    let flags = read_byte(reader)?;
    if flags & FRESERVED != 0 {
        return Err(Error::corrupt_stream("reserved gzip header flags are set"));
    }
    // MTIME (4), XFL (1), OS (1)
    reader.skip(6 * 8)?;

    let mut header = GzipHeader::default();
    if flags & FEXTRA != 0 {
        header.bgzf_member_size = read_extra_field(reader)?;
    }
    if flags & FNAME != 0 {
        skip_zero_terminated(reader)?;
    }
    if flags & FCOMMENT != 0 {
        skip_zero_terminated(reader)?;
    }
    if flags & FHCRC != 0 {
        reader.skip(16)?;
    }
    Ok(header)
}

/// CRC32 and ISIZE stored after each gzip member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GzipFooter {
    pub crc32: u32,
    pub size: u32,
}

/// What follows the end of a gzip member or bzip2 stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuation {
    /// Another member/stream follows; its first block starts at this bit.
    Next(u64),
    /// Clean end of input.
    End,
    /// Bytes that do not form a new member start at this byte offset.
    TrailingGarbage(u64),
}

/// Reads the gzip footer after the final block of a member and checks for the
/// next member.
pub fn read_gzip_trailer(reader: &mut LsbBitReader) -> Result<(GzipFooter, Continuation)> {
    reader.align_to_byte();
    let crc32 = read_u32_le(reader)?;
    let size = read_u32_le(reader)?;
    let footer = GzipFooter { crc32, size };

    if reader.is_at_end()? {
        return Ok((footer, Continuation::End));
    }
    let offset = reader.tell();
    let magic = reader.peek_padded(16)? as u16;
    if magic != u16::from_le_bytes(GZIP_MAGIC) {
        return Ok((footer, Continuation::TrailingGarbage(offset / 8)));
    }
    read_gzip_header(reader)?;
    Ok((footer, Continuation::Next(reader.tell())))
}

/// Reads the stream CRC that follows a bzip2 end-of-stream magic and checks
/// for a concatenated stream. The reader must sit just after the magic.
pub fn read_bzip2_trailer(reader: &mut MsbBitReader) -> Result<(u32, Continuation)> {
    let stored_crc = reader.read(32)? as u32;
    reader.align_to_byte();

    if reader.is_at_end()? {
        return Ok((stored_crc, Continuation::End));
    }
    let offset = reader.tell();
    let head = (reader.peek_padded(32)? as u32).to_be_bytes();
    if !is_bzip2_header(&head) {
        return Ok((stored_crc, Continuation::TrailingGarbage(offset / 8)));
    }
    reader.skip(BZIP2_HEADER_BITS)?;
    Ok((stored_crc, Continuation::Next(reader.tell())))
}
