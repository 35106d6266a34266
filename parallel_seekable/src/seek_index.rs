//! Seek index: one checkpoint per chunk start.
//!
//! # Persisted format
//!
//! All integers little-endian.
//!
//! ```text
//! magic      "PSKI"
//! version    u8   (1)
//! format     u8   (1 = gzip, 2 = bzip2)
//! flags      u8   (bit 0: index covers the whole stream)
//! reserved   u8
//! window     u32  (W)
//! count      u64
//! [end bit   u64, total size u64]        only when complete
//! count x { bit offset u64, byte offset u64, window length u32,
//!           compressed length u32, raw DEFLATE window bytes }
//! ```

use std::io::{self, Read, Write};
use std::sync::Arc;

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

use crate::error::{Error, Result};
use crate::format::Format;

const MAGIC: &[u8; 4] = b"PSKI";
const VERSION: u8 = 1;
const FLAG_COMPLETE: u8 = 0x01;

/// Slack over `W` allowed for a compressed window; stored DEFLATE blocks add
/// 5 bytes per 64 KiB.
const WINDOW_OVERHEAD: usize = 1024;

/// Window snapshot held as raw DEFLATE. Checkpoints far behind the frontier
/// are only read again when their chunk is replayed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Window {
    len: usize,
    compressed: Arc<[u8]>,
}

impl Window {
    pub fn empty() -> Self {
        Self {
            len: 0,
            compressed: Arc::from(Vec::new()),
        }
    }

    pub fn compress(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Ok(Self::empty());
        }
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::fast());
        encoder.write_all(bytes)?;
        Ok(Self {
            len: bytes.len(),
            compressed: Arc::from(encoder.finish()?),
        })
    }

    /// Decompressed length.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn compressed_len(&self) -> usize {
        self.compressed.len()
    }

    pub fn decompress(&self) -> Result<Vec<u8>> {
        if self.len == 0 {
            return Ok(Vec::new());
        }
        let mut bytes = Vec::with_capacity(self.len);
        DeflateDecoder::new(&self.compressed[..])
            .take(self.len as u64 + 1)
            .read_to_end(&mut bytes)
            .map_err(|e| Error::corrupt_index(format!("unreadable window snapshot: {e}")))?;
        if bytes.len() != self.len {
            return Err(Error::corrupt_index(format!(
                "window snapshot holds {} bytes, expected {}",
                bytes.len(),
                self.len
            )));
        }
        Ok(bytes)
    }
}

/// A place decoding can restart from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeekPoint {
    pub compressed_bit_offset: u64,
    pub decompressed_byte_offset: u64,
    /// The `min(W, decompressed_byte_offset)` bytes preceding this point.
    pub window: Window,
}

/// End of the stream, known once the last chunk has been finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamEnd {
    pub compressed_bit_offset: u64,
    pub decompressed_size: u64,
}

#[derive(Debug, Clone)]
pub struct SeekIndex {
    format: Format,
    points: Vec<SeekPoint>,
    end: Option<StreamEnd>,
}

impl SeekIndex {
    pub fn new(format: Format) -> Self {
        Self {
            format,
            points: Vec::new(),
            end: None,
        }
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&SeekPoint> {
        self.points.get(index)
    }

    pub fn points(&self) -> &[SeekPoint] {
        &self.points
    }

    pub fn end(&self) -> Option<StreamEnd> {
        self.end
    }

    pub fn is_complete(&self) -> bool {
        self.end.is_some()
    }

    /// Appends the checkpoint of the next chunk. Both offsets must grow
    /// strictly and the window must have its expected length.
    pub fn append(&mut self, point: SeekPoint) -> Result<()> {
        if self.end.is_some() {
            return Err(Error::corrupt_index("append to a complete index"));
        }
        if let Some(last) = self.points.last() {
            if point.compressed_bit_offset <= last.compressed_bit_offset
                || point.decompressed_byte_offset <= last.decompressed_byte_offset
            {
                return Err(Error::corrupt_index(format!(
                    "checkpoint ({}, {}) does not follow ({}, {})",
                    point.compressed_bit_offset,
                    point.decompressed_byte_offset,
                    last.compressed_bit_offset,
                    last.decompressed_byte_offset
                )));
            }
        } else if point.decompressed_byte_offset != 0 {
            return Err(Error::corrupt_index("first checkpoint is not at offset 0"));
        }
        let expected = (self.format.window_size() as u64).min(point.decompressed_byte_offset);
        if point.window.len() as u64 != expected {
            return Err(Error::corrupt_index(format!(
                "checkpoint at byte {} carries a {}-byte window, expected {expected}",
                point.decompressed_byte_offset,
                point.window.len()
            )));
        }
        self.points.push(point);
        Ok(())
    }

    /// Records the end of the stream after the last checkpoint's chunk.
    pub fn mark_complete(&mut self, end_bit: u64, decompressed_size: u64) -> Result<()> {
        let Some(last) = self.points.last() else {
            return Err(Error::corrupt_index("end record without checkpoints"));
        };
        if end_bit <= last.compressed_bit_offset || decompressed_size < last.decompressed_byte_offset {
            return Err(Error::corrupt_index("end record precedes the last checkpoint"));
        }
        let end = StreamEnd {
            compressed_bit_offset: end_bit,
            decompressed_size,
        };
        match self.end {
            Some(existing) if existing != end => {
                Err(Error::corrupt_index("conflicting end records"))
            }
            _ => {
                self.end = Some(end);
                Ok(())
            }
        }
    }

    /// The last checkpoint at or before `offset`, with its chunk index.
    pub fn find_checkpoint_for(&self, offset: u64) -> Option<(usize, &SeekPoint)> {
        let after = self
            .points
            .partition_point(|p| p.decompressed_byte_offset <= offset);
        let index = after.checked_sub(1)?;
        Some((index, &self.points[index]))
    }

    pub fn export<W: Write>(&self, mut out: W) -> Result<()> {
        out.write_all(MAGIC)?;
        let flags = if self.end.is_some() { FLAG_COMPLETE } else { 0 };
        out.write_all(&[VERSION, self.format.tag(), flags, 0])?;
        out.write_all(&(self.format.window_size() as u32).to_le_bytes())?;
        out.write_all(&(self.points.len() as u64).to_le_bytes())?;
        if let Some(end) = self.end {
            out.write_all(&end.compressed_bit_offset.to_le_bytes())?;
            out.write_all(&end.decompressed_size.to_le_bytes())?;
        }
        for point in &self.points {
            out.write_all(&point.compressed_bit_offset.to_le_bytes())?;
            out.write_all(&point.decompressed_byte_offset.to_le_bytes())?;
            out.write_all(&(point.window.len as u32).to_le_bytes())?;
            out.write_all(&(point.window.compressed.len() as u32).to_le_bytes())?;
            out.write_all(&point.window.compressed)?;
        }
        out.flush()?;
        Ok(())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        // Writing into a Vec cannot fail.
        let _ = self.export(&mut out);
        out
    }

    /// Reads an exported index for a `format` stream whose first chunk starts
    /// at `first_bit`. Every inconsistency is reported as `CorruptIndex`.
    pub fn import<R: Read>(mut input: R, format: Format, first_bit: u64) -> Result<Self> {
        let mut magic = [0u8; 4];
        read_exact(&mut input, &mut magic)?;
        if &magic != MAGIC {
            return Err(Error::corrupt_index("bad magic"));
        }
        let mut header = [0u8; 4];
        read_exact(&mut input, &mut header)?;
        let [version, tag, flags, _reserved] = header;
        if version != VERSION {
            return Err(Error::corrupt_index(format!("unsupported version {version}")));
        }
        match Format::from_tag(tag) {
            Some(f) if f == format => {}
            Some(f) => {
                return Err(Error::corrupt_index(format!(
                    "index is for a {f} stream, not {format}"
                )))
            }
            None => return Err(Error::corrupt_index(format!("unknown format tag {tag}"))),
        }
        let window_size = read_u32(&mut input)?;
        if window_size as usize != format.window_size() {
            return Err(Error::corrupt_index(format!("window size {window_size}")));
        }
        let count = read_u64(&mut input)?;
        let end = if flags & FLAG_COMPLETE != 0 {
            Some((read_u64(&mut input)?, read_u64(&mut input)?))
        } else {
            None
        };

        let mut index = SeekIndex::new(format);
        for _ in 0..count {
            let compressed_bit_offset = read_u64(&mut input)?;
            let decompressed_byte_offset = read_u64(&mut input)?;
            let window_len = read_u32(&mut input)? as usize;
            let compressed_len = read_u32(&mut input)? as usize;
            if window_len > format.window_size()
                || compressed_len > format.window_size() + WINDOW_OVERHEAD
            {
                return Err(Error::corrupt_index("oversized window snapshot"));
            }
            let mut compressed = vec![0u8; compressed_len];
            read_exact(&mut input, &mut compressed)?;
            let window = Window {
                len: window_len,
                compressed: Arc::from(compressed),
            };
            window.decompress()?;
            index.append(SeekPoint {
                compressed_bit_offset,
                decompressed_byte_offset,
                window,
            })?;
        }

        match index.points.first() {
            Some(first) if first.compressed_bit_offset == first_bit => {}
            Some(first) => {
                return Err(Error::corrupt_index(format!(
                    "first checkpoint at bit {} but the stream starts at {first_bit}",
                    first.compressed_bit_offset
                )))
            }
            None => return Err(Error::corrupt_index("index has no checkpoints")),
        }
        if let Some((end_bit, size)) = end {
            index.mark_complete(end_bit, size)?;
        }
        Ok(index)
    }
}

fn read_exact<R: Read>(input: &mut R, buf: &mut [u8]) -> Result<()> {
    input.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => Error::corrupt_index("truncated index"),
        _ => Error::Io(e),
    })
}

fn read_u32<R: Read>(input: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    read_exact(input, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(input: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    read_exact(input, &mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(bit: u64, byte: u64, format: Format) -> SeekPoint {
        let len = (format.window_size() as u64).min(byte) as usize;
        SeekPoint {
            compressed_bit_offset: bit,
            decompressed_byte_offset: byte,
            window: Window::compress(&vec![(byte % 251) as u8; len]).unwrap(),
        }
    }

    fn sample() -> SeekIndex {
        let mut index = SeekIndex::new(Format::Gzip);
        index.append(point(80, 0, Format::Gzip)).unwrap();
        index.append(point(9_000, 10_000, Format::Gzip)).unwrap();
        index.append(point(20_000, 100_000, Format::Gzip)).unwrap();
        index
    }

    #[test]
    fn test_find_checkpoint() {
        let index = sample();
        assert_eq!(index.find_checkpoint_for(0).unwrap().0, 0);
        assert_eq!(index.find_checkpoint_for(9_999).unwrap().0, 0);
        assert_eq!(index.find_checkpoint_for(10_000).unwrap().0, 1);
        assert_eq!(index.find_checkpoint_for(u64::MAX).unwrap().0, 2);
        assert!(SeekIndex::new(Format::Gzip).find_checkpoint_for(0).is_none());
    }

    #[test]
    fn test_append_rejects_non_monotonic() {
        let mut index = sample();
        assert!(matches!(
            index.append(point(20_000, 200_000, Format::Gzip)),
            Err(Error::CorruptIndex(_))
        ));
        // An empty chunk would repeat the decompressed offset.
        assert!(matches!(
            index.append(point(30_000, 100_000, Format::Gzip)),
            Err(Error::CorruptIndex(_))
        ));
        let mut short = point(30_000, 200_000, Format::Gzip);
        short.window = Window::compress(&[0u8; 10]).unwrap();
        assert!(index.append(short).is_err());
        assert_eq!(index.len(), 3);
    }

    #[test]
    fn test_export_import() {
        let mut index = sample();
        index.mark_complete(25_000, 123_456).unwrap();
        let bytes = index.to_bytes();

        let imported = SeekIndex::import(&bytes[..], Format::Gzip, 80).unwrap();
        assert_eq!(imported.points(), index.points());
        assert_eq!(imported.end(), index.end());
    }

    #[test]
    fn test_import_validation() {
        let bytes = sample().to_bytes();

        let wrong_format = SeekIndex::import(&bytes[..], Format::Bzip2, 80);
        assert!(matches!(wrong_format, Err(Error::CorruptIndex(_))));

        let wrong_start = SeekIndex::import(&bytes[..], Format::Gzip, 88);
        assert!(matches!(wrong_start, Err(Error::CorruptIndex(_))));

        let truncated = SeekIndex::import(&bytes[..bytes.len() - 1], Format::Gzip, 80);
        assert!(matches!(truncated, Err(Error::CorruptIndex(_))));

        let mut bad_magic = bytes.clone();
        bad_magic[0] = b'X';
        assert!(SeekIndex::import(&bad_magic[..], Format::Gzip, 80).is_err());

        // bzip2 records carry no window, so each one is 24 bytes after the
        // 20-byte header. Swap the decompressed offsets of records 1 and 2.
        let mut bz = SeekIndex::new(Format::Bzip2);
        bz.append(point(32, 0, Format::Bzip2)).unwrap();
        bz.append(point(9_000, 10_000, Format::Bzip2)).unwrap();
        bz.append(point(20_000, 100_000, Format::Bzip2)).unwrap();
        let mut swapped = bz.to_bytes();
        let second = 20 + 24 + 8;
        let third = 20 + 2 * 24 + 8;
        let a: [u8; 8] = swapped[second..second + 8].try_into().unwrap();
        let b: [u8; 8] = swapped[third..third + 8].try_into().unwrap();
        swapped[second..second + 8].copy_from_slice(&b);
        swapped[third..third + 8].copy_from_slice(&a);
        assert!(SeekIndex::import(&bz.to_bytes()[..], Format::Bzip2, 32).is_ok());
        assert!(matches!(
            SeekIndex::import(&swapped[..], Format::Bzip2, 32),
            Err(Error::CorruptIndex(_))
        ));
    }

    #[test]
    fn test_windows_are_stored_compressed() {
        let text: Vec<u8> = b"the quick brown fox ".iter().copied().cycle().take(40_000).collect();
        let window = Window::compress(&text[text.len() - 32 * 1024..]).unwrap();
        assert_eq!(window.len(), 32 * 1024);
        assert!(window.compressed_len() < 4096);
        assert_eq!(window.decompress().unwrap(), &text[text.len() - 32 * 1024..]);

        let mut index = SeekIndex::new(Format::Gzip);
        index.append(point(80, 0, Format::Gzip)).unwrap();
        index
            .append(SeekPoint {
                compressed_bit_offset: 9_000,
                decompressed_byte_offset: 40_000,
                window,
            })
            .unwrap();
        assert!(index.to_bytes().len() < 4096 + 100);
    }

    #[test]
    fn test_import_rejects_garbled_window() {
        let mut index = SeekIndex::new(Format::Gzip);
        index.append(point(80, 0, Format::Gzip)).unwrap();
        index.append(point(9_000, 10_000, Format::Gzip)).unwrap();
        let mut bytes = index.to_bytes();
        // Record 0 is 24 bytes; record 1's compressed window starts 24 bytes in.
        let window_start = 20 + 24 + 24;
        assert!(bytes.len() > window_start);
        for byte in &mut bytes[window_start..] {
            *byte = 0xFF;
        }
        assert!(matches!(
            SeekIndex::import(&bytes[..], Format::Gzip, 80),
            Err(Error::CorruptIndex(_))
        ));
    }

    #[test]
    fn test_bzip2_windows_are_empty() {
        let mut index = SeekIndex::new(Format::Bzip2);
        index.append(point(32, 0, Format::Bzip2)).unwrap();
        index.append(point(800_000, 900_000, Format::Bzip2)).unwrap();
        assert!(index.get(1).unwrap().window.is_empty());
        let bytes = index.to_bytes();
        assert_eq!(SeekIndex::import(&bytes[..], Format::Bzip2, 32).unwrap().len(), 2);
    }
}
