//! Bit-granular cursor over a [`SharedSource`].
//!
//! Each reader owns its own byte buffer and a 64-bit cache of upcoming bits, so
//! any number of readers can walk the same input concurrently. DEFLATE packs
//! bits least-significant first, bzip2 most-significant first; the order is a
//! const parameter.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::source::SharedSource;

/// Largest `n` accepted by [`BitReader::peek`] and [`BitReader::read`].
pub const MAX_BIT_COUNT: u32 = 56;

const DEFAULT_BUFFER_SIZE: usize = 128 * 1024;

pub struct BitReader<const MSB_FIRST: bool> {
    source: Arc<SharedSource>,
    buffer: Vec<u8>,
    /// Absolute byte offset of `buffer[0]`.
    buffer_offset: u64,
    /// Next byte of `buffer` to move into the cache.
    byte_pos: usize,
    cache: u64,
    cache_bits: u32,
    buffer_size: usize,
}

pub type LsbBitReader = BitReader<false>;
pub type MsbBitReader = BitReader<true>;

impl<const MSB_FIRST: bool> BitReader<MSB_FIRST> {
    pub fn new(source: Arc<SharedSource>) -> Self {
        Self::with_buffer_size(source, DEFAULT_BUFFER_SIZE)
    }

    pub fn with_buffer_size(source: Arc<SharedSource>, buffer_size: usize) -> Self {
        Self {
            source,
            buffer: Vec::new(),
            buffer_offset: 0,
            byte_pos: 0,
            cache: 0,
            cache_bits: 0,
            buffer_size: buffer_size.max(16),
        }
    }

    pub fn source(&self) -> &Arc<SharedSource> {
        &self.source
    }

    /// Absolute bit offset of the next unread bit.
    pub fn tell(&self) -> u64 {
        (self.buffer_offset + self.byte_pos as u64) * 8 - self.cache_bits as u64
    }

    /// Repositions to `offset`. Cheap when the target byte is still buffered.
    pub fn seek_to_bit(&mut self, offset: u64) -> Result<()> {
        let byte = offset / 8;
        let buffered = self.buffer_offset..self.buffer_offset + self.buffer.len() as u64;
        if buffered.contains(&byte) {
            self.byte_pos = (byte - self.buffer_offset) as usize;
        } else {
            self.load_buffer_at(byte)?;
        }
        self.cache = 0;
        self.cache_bits = 0;

        let sub_bits = (offset % 8) as u32;
        if sub_bits > 0 {
            self.refill()?;
            if self.cache_bits < sub_bits {
                return Err(Error::EndOfStream);
            }
            self.consume(sub_bits);
        }
        Ok(())
    }

    fn load_buffer_at(&mut self, byte: u64) -> Result<bool> {
        self.buffer.resize(self.buffer_size, 0);
        let n = self.source.read_at(byte, &mut self.buffer)?;
        self.buffer.truncate(n);
        self.buffer_offset = byte;
        self.byte_pos = 0;
        Ok(n > 0)
    }

    fn refill(&mut self) -> Result<()> {
        while self.cache_bits <= MAX_BIT_COUNT {
            if self.byte_pos == self.buffer.len() {
                let next = self.buffer_offset + self.buffer.len() as u64;
                if !self.load_buffer_at(next)? {
                    break;
                }
            }
            let byte = self.buffer[self.byte_pos] as u64;
            self.byte_pos += 1;
            if MSB_FIRST {
                self.cache |= byte << (56 - self.cache_bits);
            } else {
                self.cache |= byte << self.cache_bits;
            }
            self.cache_bits += 8;
        }
        Ok(())
    }

    #[inline]
    fn extract(&self, n: u32) -> u64 {
        if n == 0 {
            0
        } else if MSB_FIRST {
            self.cache >> (64 - n)
        } else {
            self.cache & ((1u64 << n) - 1)
        }
    }

    #[inline]
    fn consume(&mut self, n: u32) {
        debug_assert!(n <= self.cache_bits);
        if n == 0 {
            return;
        }
        if MSB_FIRST {
            self.cache <<= n;
        } else {
            self.cache >>= n;
        }
        self.cache_bits -= n;
    }

    /// Returns the next `n` bits without advancing.
    pub fn peek(&mut self, n: u32) -> Result<u64> {
        debug_assert!(n <= MAX_BIT_COUNT);
        if self.cache_bits < n {
            self.refill()?;
            if self.cache_bits < n {
                return Err(Error::EndOfStream);
            }
        }
        Ok(self.extract(n))
    }

    /// Like [`peek`](Self::peek) but pads with zero bits past the end of input.
    pub fn peek_padded(&mut self, n: u32) -> Result<u64> {
        debug_assert!(n <= MAX_BIT_COUNT);
        if self.cache_bits < n {
            self.refill()?;
        }
        Ok(self.extract(n))
    }

    pub fn read(&mut self, n: u32) -> Result<u64> {
        let value = self.peek(n)?;
        self.consume(n);
        Ok(value)
    }

    /// Advances past `n` bits that were already peeked.
    pub fn skip_peeked(&mut self, n: u32) -> Result<()> {
        if self.cache_bits < n {
            return Err(Error::EndOfStream);
        }
        self.consume(n);
        Ok(())
    }

    pub fn skip(&mut self, mut n: u64) -> Result<()> {
        while n > 0 {
            let step = n.min(MAX_BIT_COUNT as u64) as u32;
            self.read(step)?;
            n -= step as u64;
        }
        Ok(())
    }

    pub fn align_to_byte(&mut self) {
        let rest = self.cache_bits % 8;
        self.consume(rest);
    }

    pub fn is_byte_aligned(&self) -> bool {
        self.cache_bits % 8 == 0
    }

    /// True when no bits remain in the input.
    pub fn is_at_end(&mut self) -> Result<bool> {
        if self.cache_bits > 0 {
            return Ok(false);
        }
        self.refill()?;
        Ok(self.cache_bits == 0)
    }

    /// Copies whole bytes from a byte-aligned position.
    pub fn read_bytes(&mut self, out: &mut [u8]) -> Result<()> {
        debug_assert!(self.is_byte_aligned());
        let mut filled = 0;
        while filled < out.len() && self.cache_bits >= 8 {
            out[filled] = self.read(8)? as u8;
            filled += 1;
        }
        while filled < out.len() {
            if self.byte_pos == self.buffer.len() {
                let next = self.buffer_offset + self.buffer.len() as u64;
                if !self.load_buffer_at(next)? {
                    return Err(Error::EndOfStream);
                }
            }
            let n = (out.len() - filled).min(self.buffer.len() - self.byte_pos);
            out[filled..filled + n].copy_from_slice(&self.buffer[self.byte_pos..self.byte_pos + n]);
            self.byte_pos += n;
            filled += n;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reader<const MSB: bool>(data: &[u8], buffer_size: usize) -> BitReader<MSB> {
        BitReader::with_buffer_size(Arc::new(SharedSource::from_bytes(data.to_vec())), buffer_size)
    }

    #[test]
    fn test_lsb_order() {
        // 0xB5 = 1011_0101: LSB-first reads 1, 0, 1, 0, 1, 1, 0, 1
        let mut r = reader::<false>(&[0xB5, 0x01], 64);
        assert_eq!(r.read(1).unwrap(), 1);
        assert_eq!(r.read(3).unwrap(), 0b010);
        assert_eq!(r.tell(), 4);
        assert_eq!(r.read(8).unwrap(), 0x1B);
        assert_eq!(r.read(4).unwrap(), 0);
        assert!(r.is_at_end().unwrap());
    }

    #[test]
    fn test_msb_order() {
        let mut r = reader::<true>(&[0x31, 0x41, 0x59, 0x26, 0x53, 0x59, 0xAA], 64);
        assert_eq!(r.read(48).unwrap(), 0x314159265359);
        assert_eq!(r.read(4).unwrap(), 0xA);
        assert_eq!(r.tell(), 52);
    }

    #[test]
    fn test_peek_does_not_advance() {
        let mut r = reader::<false>(&[0xFF, 0x00], 64);
        assert_eq!(r.peek(4).unwrap(), 0xF);
        assert_eq!(r.peek(12).unwrap(), 0xFF);
        assert_eq!(r.tell(), 0);
    }

    #[test]
    fn test_end_of_stream() {
        let mut r = reader::<false>(&[0xAB], 64);
        assert!(matches!(r.read(9), Err(Error::EndOfStream)));
        // A failed read consumes nothing.
        assert_eq!(r.read(8).unwrap(), 0xAB);
        assert_eq!(r.peek_padded(8).unwrap(), 0);
    }

    #[test]
    fn test_seek_across_small_buffers() {
        let data: Vec<u8> = (0u8..=255).collect();
        let mut r = reader::<true>(&data, 16);
        r.seek_to_bit(200 * 8 + 4).unwrap();
        assert_eq!(r.read(8).unwrap(), 0x8C); // low nibble of 200, high nibble of 201
        r.seek_to_bit(8).unwrap();
        assert_eq!(r.read(8).unwrap(), 1);
        r.seek_to_bit(255 * 8).unwrap();
        assert_eq!(r.read(8).unwrap(), 255);
        assert!(r.is_at_end().unwrap());
    }

    #[test]
    fn test_read_bytes_after_cache() {
        let data: Vec<u8> = (0u8..100).collect();
        let mut r = reader::<false>(&data, 16);
        r.read(8).unwrap();
        let mut out = [0u8; 60];
        r.read_bytes(&mut out).unwrap();
        assert_eq!(&out[..], &data[1..61]);
        assert_eq!(r.tell(), 61 * 8);
        assert_eq!(r.read(8).unwrap(), 61);
    }

    #[test]
    fn test_align_to_byte() {
        let mut r = reader::<false>(&[0xFF, 0x42], 64);
        r.read(3).unwrap();
        assert!(!r.is_byte_aligned());
        r.align_to_byte();
        assert_eq!(r.tell(), 8);
        assert_eq!(r.read(8).unwrap(), 0x42);
    }
}
