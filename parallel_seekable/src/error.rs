//! Error taxonomy shared by every stage of the decoder.

use std::fmt;
use std::io;
use std::sync::{Condvar, Mutex, MutexGuard};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("unexpected end of compressed stream")]
    EndOfStream,

    #[error("invalid Huffman table: {0}")]
    InvalidHuffmanTable(&'static str),

    #[error("invalid block type {0}")]
    InvalidBlockType(u8),

    #[error("no valid block starts at bit {0}")]
    FalseBlockCandidate(u64),

    #[error("corrupt stream: {0}")]
    CorruptStream(String),

    #[error("checksum mismatch: stored {expected:#010x}, computed {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("corrupt index: {0}")]
    CorruptIndex(String),

    #[error("unrecognized compression format")]
    UnknownFormat,

    #[error("reader is closed")]
    Closed,

    #[error("decoding was cancelled")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid seek to a negative or overflowing position")]
    InvalidSeek,

    #[error("decode task terminated without delivering a result")]
    WorkerLost,

    #[error("reader failed earlier: {0}")]
    Failed(String),
}

impl Error {
    pub fn corrupt_stream<T: fmt::Display>(msg: T) -> Self {
        Error::CorruptStream(msg.to_string())
    }

    pub fn corrupt_index<T: fmt::Display>(msg: T) -> Self {
        Error::CorruptIndex(msg.to_string())
    }

    /// Errors that say something about one speculative candidate rather than
    /// about the stream itself. The block finder moves on to the next candidate.
    pub fn is_candidate_local(&self) -> bool {
        matches!(
            self,
            Error::EndOfStream
                | Error::InvalidHuffmanTable(_)
                | Error::InvalidBlockType(_)
                | Error::FalseBlockCandidate(_)
                | Error::CorruptStream(_)
                | Error::ChecksumMismatch { .. }
        )
    }

    /// Re-labels a structural failure on a chunk whose start offset is known to be
    /// correct. There is no other candidate to fall back on, so the stream is corrupt.
    pub fn into_mandatory(self, start_bit: u64) -> Self {
        match self {
            Error::EndOfStream => {
                Error::CorruptStream(format!("stream truncated inside chunk at bit {start_bit}"))
            }
            Error::InvalidHuffmanTable(msg) => {
                Error::CorruptStream(format!("{msg} in chunk at bit {start_bit}"))
            }
            Error::InvalidBlockType(t) => {
                Error::CorruptStream(format!("invalid block type {t} in chunk at bit {start_bit}"))
            }
            Error::FalseBlockCandidate(bit) => {
                Error::CorruptStream(format!("no block header at bit {bit}"))
            }
            other => other,
        }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(e) => e,
            Error::EndOfStream => io::Error::new(io::ErrorKind::UnexpectedEof, err),
            Error::InvalidSeek | Error::InvalidConfig(_) => {
                io::Error::new(io::ErrorKind::InvalidInput, err)
            }
            Error::Closed | Error::Cancelled | Error::WorkerLost | Error::Failed(_) => {
                io::Error::new(io::ErrorKind::Other, err)
            }
            _ => io::Error::new(io::ErrorKind::InvalidData, err),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

fn poisoned() -> Error {
    Error::Io(io::Error::new(io::ErrorKind::Other, "lock poisoned"))
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex.lock().map_err(|_| poisoned())
}

pub(crate) fn wait<'a, T>(cond: &Condvar, guard: MutexGuard<'a, T>) -> Result<MutexGuard<'a, T>> {
    cond.wait(guard).map_err(|_| poisoned())
}
