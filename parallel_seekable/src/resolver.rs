//! Marker resolution and stream checksum verification.

use std::sync::Arc;

use tracing::warn;

use crate::bzip2_block::combine_stream_crc;
use crate::chunk::{ChecksumRecord, DecodedChunk};
use crate::config::ChecksumPolicy;
use crate::error::{Error, Result};
use crate::format::Format;

/// Replaces every marker of `chunk` with its byte from `prev_window`, the tail
/// of the stream decoded before the chunk, and records the chunk's own tail
/// window. Resolving a resolved chunk does nothing.
pub fn resolve(chunk: &mut DecodedChunk, prev_window: &[u8], window_size: usize) -> Result<()> {
    if chunk.is_resolved() {
        return Ok(());
    }

    for marker in &chunk.markers {
        let distance = marker.distance as usize;
        if distance > prev_window.len() {
            return Err(Error::corrupt_stream(format!(
                "back-reference {distance} bytes before chunk at bit {} but only {} bytes precede it",
                chunk.start_bit,
                prev_window.len()
            )));
        }
        chunk.data[marker.position] = prev_window[prev_window.len() - distance];
    }

    let tail = tail_window(prev_window, &chunk.data, window_size);
    chunk.mark_resolved(tail);
    Ok(())
}

/// Last `window_size` bytes of `prev ++ data`.
pub fn tail_window(prev: &[u8], data: &[u8], window_size: usize) -> Arc<[u8]> {
    if data.len() >= window_size {
        return Arc::from(&data[data.len() - window_size..]);
    }
    let keep = (window_size - data.len()).min(prev.len());
    let mut tail = Vec::with_capacity(keep + data.len());
    tail.extend_from_slice(&prev[prev.len() - keep..]);
    tail.extend_from_slice(data);
    Arc::from(tail)
}

enum ChecksumState {
    Gzip { hasher: crc32fast::Hasher, size: u64 },
    Bzip2 { combined: u32 },
    /// Position inside a member is unknown; wait for the next member start.
    Unknown,
}

/// Running checksum of the finalized stream prefix.
pub struct StreamChecksum {
    format: Format,
    policy: ChecksumPolicy,
    state: ChecksumState,
}

impl StreamChecksum {
    /// State at the very start of the stream.
    pub fn new(format: Format, policy: ChecksumPolicy) -> Self {
        Self {
            format,
            policy,
            state: fresh_state(format),
        }
    }

    /// State for a stream picked up in the middle, e.g. after an index import.
    pub fn unknown(format: Format, policy: ChecksumPolicy) -> Self {
        Self {
            format,
            policy,
            state: ChecksumState::Unknown,
        }
    }

    pub fn is_tracking(&self) -> bool {
        !matches!(self.state, ChecksumState::Unknown)
    }

    fn feed(&mut self, data: &[u8]) {
        if let ChecksumState::Gzip { hasher, size } = &mut self.state {
            hasher.update(data);
            *size += data.len() as u64;
        }
    }

    fn report(&self, expected: u32, actual: u32, what: &str) -> Result<()> {
        match self.policy {
            ChecksumPolicy::Verify => Err(Error::ChecksumMismatch { expected, actual }),
            ChecksumPolicy::Warn => {
                warn!(
                    format = %self.format,
                    expected = format_args!("{expected:#010x}"),
                    actual = format_args!("{actual:#010x}"),
                    "{what} mismatch"
                );
                Ok(())
            }
            ChecksumPolicy::Disabled => Ok(()),
        }
    }

    /// Folds a finalized chunk into the running checksum and checks every
    /// stored checksum the chunk ends.
    pub fn update(&mut self, chunk: &DecodedChunk) -> Result<()> {
        if self.policy == ChecksumPolicy::Disabled {
            return Ok(());
        }

        let mut fed = 0;
        for record in &chunk.checksums {
            match *record {
                ChecksumRecord::GzipFooter { offset, crc32, size } => {
                    self.feed(&chunk.data[fed..offset]);
                    fed = offset;
                    let state = std::mem::replace(&mut self.state, fresh_state(self.format));
                    if let ChecksumState::Gzip { hasher, size: actual } = state {
                        let actual_crc = hasher.finalize();
                        if actual_crc != crc32 {
                            self.report(crc32, actual_crc, "gzip member CRC32")?;
                        } else if actual as u32 != size {
                            self.report(size, actual as u32, "gzip member size")?;
                        }
                    }
                }
                ChecksumRecord::Bzip2Block { crc } => {
                    if let ChecksumState::Bzip2 { combined } = &mut self.state {
                        *combined = combine_stream_crc(*combined, crc);
                    }
                }
                ChecksumRecord::Bzip2StreamEnd { stored_crc } => {
                    let state = std::mem::replace(&mut self.state, fresh_state(self.format));
                    if let ChecksumState::Bzip2 { combined } = state {
                        if combined != stored_crc {
                            self.report(stored_crc, combined, "bzip2 stream CRC")?;
                        }
                    }
                }
            }
        }
        self.feed(&chunk.data[fed..]);
        Ok(())
    }
}

fn fresh_state(format: Format) -> ChecksumState {
    match format {
        Format::Gzip => ChecksumState::Gzip {
            hasher: crc32fast::Hasher::new(),
            size: 0,
        },
        Format::Bzip2 => ChecksumState::Bzip2 { combined: 0 },
    }
}
