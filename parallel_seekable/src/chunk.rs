//! Chunks and the context they are decoded in.
//!
//! The compressed stream is cut into chunks by a deterministic rule: a chunk
//! that starts at bit `T` ends at the first block boundary `E > T` that is at
//! or beyond the next multiple of the chunk size, once at least one byte has
//! been produced. The same rule is applied by speculative tasks, which start
//! from a block-finder candidate instead of the true `T`. A speculative result
//! whose start matches the true chain offset is therefore identical to what a
//! sequential decode of that chunk would produce.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::trace;

use crate::block_finder;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::format::Format;
use crate::scanner::Scanner;
use crate::source::SharedSource;
use crate::{bzip2_block, deflate};

/// Placeholder for a byte that lies `distance` bytes before the chunk start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Marker {
    pub position: usize,
    pub distance: u16,
}

/// Start of a compressed block inside a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockBoundary {
    pub bit: u64,
    /// Offset into the chunk's decoded data where the block's output begins.
    pub decoded_offset: usize,
}

/// Stored checksums met while decoding, in stream order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumRecord {
    /// End of a gzip member after `offset` bytes of this chunk's data.
    GzipFooter { offset: usize, crc32: u32, size: u32 },
    /// A bzip2 block whose CRC was verified at decode time.
    Bzip2Block { crc: u32 },
    /// End of a bzip2 stream with its combined CRC.
    Bzip2StreamEnd { stored_crc: u32 },
}

/// Output of one chunk decode. `markers` is emptied and `tail_window` filled
/// in by [`crate::resolver::resolve`].
#[derive(Debug, Clone)]
pub struct DecodedChunk {
    pub start_bit: u64,
    pub end_bit: u64,
    pub data: Vec<u8>,
    pub markers: Vec<Marker>,
    /// Last `W` bytes of the decoded stream up to the end of this chunk.
    pub tail_window: Arc<[u8]>,
    pub blocks: Vec<BlockBoundary>,
    pub checksums: Vec<ChecksumRecord>,
    /// The chunk reaches the end of the input.
    pub is_last: bool,
    /// Byte offset of unparseable bytes after the last member, if any.
    pub trailing_garbage: Option<u64>,
    resolved: bool,
}

impl DecodedChunk {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        start_bit: u64,
        end_bit: u64,
        data: Vec<u8>,
        markers: Vec<Marker>,
        blocks: Vec<BlockBoundary>,
        checksums: Vec<ChecksumRecord>,
        is_last: bool,
        trailing_garbage: Option<u64>,
    ) -> Self {
        Self {
            start_bit,
            end_bit,
            data,
            markers,
            tail_window: Arc::from(Vec::new()),
            blocks,
            checksums,
            is_last,
            trailing_garbage,
            resolved: false,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved
    }

    pub(crate) fn mark_resolved(&mut self, tail_window: Arc<[u8]>) {
        self.markers = Vec::new();
        self.tail_window = tail_window;
        self.resolved = true;
    }

    /// Bytes held in memory, as counted against the cache budget.
    pub fn memory_size(&self) -> usize {
        self.data.len() + self.tail_window.len()
    }
}

/// When a chunk decode stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCondition {
    /// First boundary at or after `bit`, or after `max_decoded` bytes.
    Threshold { bit: u64, max_decoded: usize },
    /// Exactly at the boundary `bit`, taken from the seek index.
    Exact(u64),
}

impl StopCondition {
    /// Whether the decode stops at block boundary `boundary` having produced
    /// `produced` bytes so far.
    pub fn reached(&self, boundary: u64, produced: usize) -> Result<bool> {
        match *self {
            StopCondition::Threshold { bit, max_decoded } => {
                Ok(produced > 0 && (boundary >= bit || produced >= max_decoded))
            }
            StopCondition::Exact(bit) if boundary > bit => Err(Error::corrupt_index(format!(
                "no block boundary at recorded offset {bit} (passed it at {boundary})"
            ))),
            StopCondition::Exact(bit) => Ok(boundary == bit),
        }
    }
}

/// Everything a worker needs to decode chunks of one stream.
pub struct DecodeContext {
    pub source: Arc<SharedSource>,
    pub format: Format,
    pub chunk_size_bits: u64,
    pub max_decoded: usize,
    /// BGZF input: chunks are cut at member starts only.
    pub bgzf: bool,
    pub cancel: Arc<AtomicBool>,
    pub(crate) scanner: Scanner,
}

impl DecodeContext {
    pub fn new(source: Arc<SharedSource>, format: Format, config: &Config) -> Result<Self> {
        let bgzf = format.is_bgzf(&source);
        Ok(Self {
            source,
            format,
            chunk_size_bits: config.chunk_size_bytes as u64 * 8,
            max_decoded: config.max_decompressed_chunk_bytes,
            bgzf,
            cancel: Arc::new(AtomicBool::new(false)),
            scanner: Scanner::new()?,
        })
    }

    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.load(Ordering::Relaxed) {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub fn first_block_bit(&self) -> Result<u64> {
        self.format.first_block_bit(&self.source)
    }

    /// Index of the search range containing `bit`.
    pub fn range_of(&self, bit: u64) -> u64 {
        bit / self.chunk_size_bits
    }

    /// Number of search ranges covering the input, when its length is known.
    pub fn range_count(&self) -> Option<u64> {
        self.source
            .len()
            .map(|len| (len * 8).div_ceil(self.chunk_size_bits))
    }

    /// Stop rule of a chunk starting at `start_bit`.
    pub fn threshold_for(&self, start_bit: u64) -> StopCondition {
        StopCondition::Threshold {
            bit: (self.range_of(start_bit) + 1) * self.chunk_size_bits,
            max_decoded: self.max_decoded,
        }
    }

    /// Decodes the chunk that starts at the block boundary `start_bit`.
    pub fn decode(&self, start_bit: u64, stop: StopCondition) -> Result<DecodedChunk> {
        let chunk = match self.format {
            Format::Gzip => deflate::decode_chunk(self, start_bit, stop)?,
            Format::Bzip2 => bzip2_block::decode_chunk(self, start_bit, stop)?,
        };
        if let StopCondition::Exact(bit) = stop {
            if chunk.end_bit != bit {
                return Err(Error::corrupt_index(format!(
                    "chunk at bit {start_bit} ended at {} instead of {bit}",
                    chunk.end_bit
                )));
            }
        }
        Ok(chunk)
    }

    /// Decodes search range `range` from its first candidate that decodes
    /// cleanly. Returns `None` when no candidate in the range works out.
    pub fn decode_speculative(&self, range: u64) -> Result<Option<DecodedChunk>> {
        let lo = range * self.chunk_size_bits / 8;
        let hi = (range + 1) * self.chunk_size_bits / 8;
        let finder = block_finder::for_format(self, lo, hi)?;

        for candidate in finder {
            let candidate = candidate?;
            self.check_cancelled()?;
            match self.decode(candidate, self.threshold_for(candidate)) {
                Ok(chunk) => return Ok(Some(chunk)),
                Err(e) if e.is_candidate_local() => {
                    trace!(range, candidate, error = %e, "rejected block candidate");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }
}
