//! The seekable reader facade.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use crate::chunk::DecodedChunk;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::fetcher::{ChunkFetcher, FetcherStats};
use crate::format::Format;
use crate::seek_index::SeekIndex;
use crate::source::{CompressedSource, SequentialSource, SharedSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    Closed,
    Open,
    Reading,
    Seeking,
    /// A fatal error occurred; every further call fails.
    Error,
}

/// Chunk currently being consumed.
struct Cursor {
    start: u64,
    chunk: Arc<DecodedChunk>,
}

impl Cursor {
    fn covers(&self, position: u64) -> bool {
        position >= self.start && position < self.start + self.chunk.len() as u64
    }
}

/// Random-access reader over a gzip or bzip2 stream, decoding chunks in
/// parallel.
///
/// ```no_run
/// use std::io::SeekFrom;
/// use parallel_seekable::{Config, ParallelReader};
///
/// let mut reader = ParallelReader::open("logs.gz", Config::default())?;
/// reader.seek(SeekFrom::Start(1 << 30))?;
/// let mut buf = [0u8; 4096];
/// let n = reader.read(&mut buf)?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct ParallelReader {
    source: Arc<SharedSource>,
    format: Format,
    config: Config,
    fetcher: Option<ChunkFetcher>,
    state: ReaderState,
    position: u64,
    cursor: Option<Cursor>,
    failure: Option<String>,
}

impl ParallelReader {
    /// Opens the file at `path`, memory-mapped.
    pub fn open<P: AsRef<Path>>(path: P, config: Config) -> Result<Self> {
        Self::from_shared(Arc::new(SharedSource::open(path)?), config)
    }

    pub fn from_bytes(data: Vec<u8>, config: Config) -> Result<Self> {
        Self::from_shared(Arc::new(SharedSource::from_bytes(data)), config)
    }

    /// Reads from any seekable input.
    pub fn from_source<S: CompressedSource + 'static>(source: S, config: Config) -> Result<Self> {
        Self::from_shared(Arc::new(SharedSource::new(Box::new(source))?), config)
    }

    /// Reads from an input that cannot seek. Decoding runs without lookahead.
    pub fn from_sequential<R: Read + Send + 'static>(input: R, config: Config) -> Result<Self> {
        Self::from_source(SequentialSource::new(input), config)
    }

    fn from_shared(source: Arc<SharedSource>, config: Config) -> Result<Self> {
        config.validate()?;
        let format = Format::detect(&source)?;
        let fetcher = ChunkFetcher::new(source.clone(), format, &config, None)?;
        Ok(Self {
            source,
            format,
            config,
            fetcher: Some(fetcher),
            state: ReaderState::Open,
            position: 0,
            cursor: None,
            failure: None,
        })
    }

    pub fn state(&self) -> ReaderState {
        self.state
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn fetcher(&self) -> Result<&ChunkFetcher> {
        match self.state {
            ReaderState::Closed => Err(Error::Closed),
            ReaderState::Error => Err(Error::Failed(
                self.failure.clone().unwrap_or_default(),
            )),
            _ => self.fetcher.as_ref().ok_or(Error::Closed),
        }
    }

    /// Moves to the Error state on anything but a bad seek argument.
    fn track<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if !matches!(e, Error::InvalidSeek | Error::Closed) && self.state != ReaderState::Error {
                self.failure = Some(e.to_string());
                self.state = ReaderState::Error;
                self.cursor = None;
                if let Some(fetcher) = &self.fetcher {
                    let _ = fetcher.shutdown();
                }
            }
        }
        result
    }

    /// Fills `buf` from the current position. Returns fewer bytes than asked
    /// for only at the end of the stream.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.fetcher()?;
        if buf.is_empty() {
            return Ok(0);
        }
        self.state = ReaderState::Reading;
        let result = self.fill(buf);
        self.track(result)
    }

    fn fill(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            if !self.cursor.as_ref().is_some_and(|c| c.covers(self.position)) {
                match self.load_chunk_at(self.position)? {
                    Some(cursor) if cursor.covers(self.position) => self.cursor = Some(cursor),
                    Some(cursor) => {
                        return Err(Error::corrupt_index(format!(
                            "chunk at byte {} ({} bytes) does not reach byte {}",
                            cursor.start,
                            cursor.chunk.len(),
                            self.position
                        )))
                    }
                    None => break,
                }
            }
            let Some(cursor) = &self.cursor else {
                break;
            };
            let rel = (self.position - cursor.start) as usize;
            let available = &cursor.chunk.data[rel..];
            let n = available.len().min(buf.len() - filled);
            buf[filled..filled + n].copy_from_slice(&available[..n]);
            filled += n;
            self.position += n as u64;
        }
        Ok(filled)
    }

    fn load_chunk_at(&self, position: u64) -> Result<Option<Cursor>> {
        let fetcher = self.fetcher()?;
        let Some((index, start)) = fetcher.locate(position)? else {
            return Ok(None);
        };
        match fetcher.chunk(index)? {
            Some(chunk) => Ok(Some(Cursor { start, chunk })),
            None => Ok(None),
        }
    }

    /// Moves to `pos` in the decompressed stream. Seeking past the end is
    /// allowed; reads there return 0 bytes.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.fetcher()?;
        self.state = ReaderState::Seeking;
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
            SeekFrom::End(delta) => {
                let size = self.decompressed_size()?;
                size.checked_add_signed(delta)
            }
        };
        let Some(target) = target else {
            return Err(Error::InvalidSeek);
        };
        self.position = target;
        Ok(target)
    }

    pub fn tell(&self) -> Result<u64> {
        self.fetcher()?;
        Ok(self.position)
    }

    /// Decompressed size, if the end of the stream has been decoded already.
    pub fn size(&self) -> Result<Option<u64>> {
        self.fetcher()?.known_size()
    }

    /// Decompressed size, decoding up to the end of the stream if needed.
    pub fn decompressed_size(&mut self) -> Result<u64> {
        let result = self.fetcher().and_then(|f| f.finish());
        self.track(result)
    }

    /// Counters of how chunks were decoded so far.
    pub fn stats(&self) -> Result<FetcherStats> {
        Ok(self.fetcher()?.stats())
    }

    /// Compressed size of the input, when it is seekable.
    pub fn compressed_size(&self) -> Option<u64> {
        self.source.len()
    }

    /// Writes the checkpoints gathered so far. After a full decode the index
    /// also records the stream end.
    pub fn export_index<W: Write>(&self, out: W) -> Result<()> {
        self.fetcher()?.index_snapshot()?.export(out)
    }

    /// Replaces the checkpoints with an exported index of the same input, so
    /// that any covered offset is reachable without decoding from the start.
    pub fn import_index<R: Read>(&mut self, input: R) -> Result<()> {
        self.fetcher()?;
        let first_bit = self.format.first_block_bit(&self.source)?;
        let index = SeekIndex::import(input, self.format, first_bit)?;
        if let Some(len) = self.source.len() {
            let bits = len * 8;
            let past_input = index
                .points()
                .last()
                .is_some_and(|p| p.compressed_bit_offset >= bits)
                || index.end().is_some_and(|end| end.compressed_bit_offset > bits);
            if past_input {
                return Err(Error::corrupt_index("checkpoint beyond the end of the input"));
            }
        }

        let fetcher = ChunkFetcher::new(self.source.clone(), self.format, &self.config, Some(index))?;
        if let Some(old) = self.fetcher.replace(fetcher) {
            let _ = old.shutdown();
        }
        self.cursor = None;
        Ok(())
    }

    /// Cancels outstanding work and releases decoded data. Idempotent.
    pub fn close(&mut self) {
        if let Some(fetcher) = self.fetcher.take() {
            let _ = fetcher.shutdown();
        }
        self.cursor = None;
        self.state = ReaderState::Closed;
    }
}

impl Drop for ParallelReader {
    fn drop(&mut self) {
        self.close();
    }
}

impl Read for ParallelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        ParallelReader::read(self, buf).map_err(io::Error::from)
    }
}

impl Seek for ParallelReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        ParallelReader::seek(self, pos).map_err(io::Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::tests::{gzip, pseudo_text};

    #[test]
    fn test_hello_world() {
        let compressed = gzip(b"Hello\nWorld!\n", 6);
        let mut reader = ParallelReader::from_bytes(compressed, Config::default()).unwrap();
        assert_eq!(reader.state(), ReaderState::Open);

        let mut buf = [0u8; 2];
        assert_eq!(reader.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf, b"He");
        assert_eq!(reader.tell().unwrap(), 2);
        assert_eq!(reader.seek(SeekFrom::Start(0)).unwrap(), 0);
        assert_eq!(reader.state(), ReaderState::Seeking);

        let mut all = [0u8; 13];
        assert_eq!(reader.read(&mut all).unwrap(), 13);
        assert_eq!(&all, b"Hello\nWorld!\n");
        assert_eq!(reader.read(&mut all).unwrap(), 0);
    }

    #[test]
    fn test_seek_relative_and_from_end() {
        let text = pseudo_text(100_000, 31);
        let config = Config::default().with_chunk_size(4096).with_parallelism(2);
        let mut reader = ParallelReader::from_bytes(gzip(&text, 6), config).unwrap();

        assert_eq!(reader.seek(SeekFrom::End(-10)).unwrap(), 99_990);
        let mut tail = Vec::new();
        Read::read_to_end(&mut reader, &mut tail).unwrap();
        assert_eq!(tail, &text[99_990..]);

        assert_eq!(reader.seek(SeekFrom::Current(-100)).unwrap(), 99_900);
        assert!(matches!(
            reader.seek(SeekFrom::Current(-200_000)),
            Err(Error::InvalidSeek)
        ));
        assert_eq!(reader.tell().unwrap(), 99_900);
        assert_eq!(reader.size().unwrap(), Some(100_000));
    }

    #[test]
    fn test_close() {
        let mut reader = ParallelReader::from_bytes(gzip(b"abc", 6), Config::default()).unwrap();
        reader.close();
        reader.close();
        assert_eq!(reader.state(), ReaderState::Closed);
        assert!(matches!(reader.read(&mut [0u8; 4]), Err(Error::Closed)));
        assert!(matches!(reader.tell(), Err(Error::Closed)));
    }

    #[test]
    fn test_unknown_format() {
        assert!(matches!(
            ParallelReader::from_bytes(b"plain text".to_vec(), Config::default()),
            Err(Error::UnknownFormat)
        ));
        assert!(matches!(
            ParallelReader::from_bytes(Vec::new(), Config::default()),
            Err(Error::UnknownFormat)
        ));
    }

    #[test]
    fn test_invalid_config() {
        let config = Config::default().with_chunk_size(0);
        assert!(matches!(
            ParallelReader::from_bytes(gzip(b"abc", 6), config),
            Err(Error::InvalidConfig(_))
        ));
    }
}
