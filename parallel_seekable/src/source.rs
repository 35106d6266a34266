//! Access to the compressed input.
//!
//! The input is owned by a single [`SharedSource`] per reader. Every worker
//! reads through [`SharedSource::read_at`], which holds the inner mutex only
//! for the duration of one seek+read on the underlying object. Nothing else is
//! ever locked while that mutex is held, so an input implemented as a callback
//! into a host runtime (which may hold its own global lock) cannot deadlock
//! against the decoder.

use std::io::{self, Cursor, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// The input contract: a byte stream with optional seek support.
///
/// Every `Read + Seek + Send` type implements this. Wrap a read-only stream in
/// [`SequentialSource`] to declare seeking unsupported.
pub trait CompressedSource: Send {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64>;

    fn tell(&mut self) -> io::Result<u64> {
        self.seek(SeekFrom::Current(0))
    }

    fn is_seekable(&self) -> bool {
        true
    }
}

impl<T: Read + Seek + Send> CompressedSource for T {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(self, buf)
    }

    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        Seek::seek(self, pos)
    }
}

/// Adapter for inputs that can only be read front to back (pipes, sockets).
pub struct SequentialSource<R> {
    inner: R,
    position: u64,
}

impl<R: Read + Send> SequentialSource<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, position: 0 }
    }
}

impl<R: Read + Send> CompressedSource for SequentialSource<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.position += n as u64;
        Ok(n)
    }

    fn seek(&mut self, _pos: SeekFrom) -> io::Result<u64> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "sequential source cannot seek",
        ))
    }

    fn tell(&mut self) -> io::Result<u64> {
        Ok(self.position)
    }

    fn is_seekable(&self) -> bool {
        false
    }
}

enum SourceState {
    Seekable(Box<dyn CompressedSource>),
    /// Bytes read so far are retained so that workers can still address them by offset.
    Sequential {
        source: Box<dyn CompressedSource>,
        retained: Vec<u8>,
        exhausted: bool,
    },
}

/// Single owner of the compressed input, shared by the reader and its workers.
pub struct SharedSource {
    state: Mutex<SourceState>,
    len: Option<u64>,
}

const SEQUENTIAL_READ_SIZE: usize = 64 * 1024;

impl SharedSource {
    pub fn new(mut source: Box<dyn CompressedSource>) -> io::Result<Self> {
        if source.is_seekable() {
            let len = source.seek(SeekFrom::End(0))?;
            source.seek(SeekFrom::Start(0))?;
            Ok(Self {
                state: Mutex::new(SourceState::Seekable(source)),
                len: Some(len),
            })
        } else {
            Ok(Self {
                state: Mutex::new(SourceState::Sequential {
                    source,
                    retained: Vec::new(),
                    exhausted: false,
                }),
                len: None,
            })
        }
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        let len = data.len() as u64;
        Self {
            state: Mutex::new(SourceState::Seekable(Box::new(Cursor::new(data)))),
            len: Some(len),
        }
    }

    /// Memory-maps the file at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = std::fs::File::open(path)?;
        // Safety: the mapping is read-only; concurrent truncation of the file by
        // another process is outside what this reader can defend against.
        let mmap = unsafe { memmap2::MmapOptions::new().map(&file)? };
        let len = mmap.len() as u64;
        Ok(Self {
            state: Mutex::new(SourceState::Seekable(Box::new(Cursor::new(mmap)))),
            len: Some(len),
        })
    }

    /// Total compressed size, when the input is seekable.
    pub fn len(&self) -> Option<u64> {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == Some(0)
    }

    pub fn is_seekable(&self) -> bool {
        self.len.is_some()
    }

    fn lock(&self) -> io::Result<MutexGuard<'_, SourceState>> {
        self.state
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "compressed source lock poisoned"))
    }

    /// Reads up to `buf.len()` bytes starting at absolute byte `offset`.
    /// Returns fewer bytes only at the end of the input.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.lock()?;
        match &mut *state {
            SourceState::Seekable(source) => {
                source.seek(SeekFrom::Start(offset))?;
                let mut filled = 0;
                while filled < buf.len() {
                    match source.read(&mut buf[filled..]) {
                        Ok(0) => break,
                        Ok(n) => filled += n,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e),
                    }
                }
                Ok(filled)
            }
            SourceState::Sequential {
                source,
                retained,
                exhausted,
            } => {
                let wanted = offset.saturating_add(buf.len() as u64);
                let mut scratch = [0u8; SEQUENTIAL_READ_SIZE];
                while !*exhausted && (retained.len() as u64) < wanted {
                    match source.read(&mut scratch) {
                        Ok(0) => *exhausted = true,
                        Ok(n) => retained.extend_from_slice(&scratch[..n]),
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e),
                    }
                }
                let available = (retained.len() as u64).saturating_sub(offset);
                let n = available.min(buf.len() as u64) as usize;
                if n > 0 {
                    let start = offset as usize;
                    buf[..n].copy_from_slice(&retained[start..start + n]);
                }
                Ok(n)
            }
        }
    }

    /// Reads `len` bytes at `offset` into a fresh vector (shorter at end of input).
    pub fn read_vec(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let n = self.read_at(offset, &mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }
}
