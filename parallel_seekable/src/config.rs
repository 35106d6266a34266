//! Reader configuration.

use crate::error::{Error, Result};

/// What to do when a stored checksum does not match the decoded data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChecksumPolicy {
    /// Fail the read with [`Error::ChecksumMismatch`].
    #[default]
    Verify,
    /// Log a warning and keep going.
    Warn,
    /// Skip stream checksums entirely.
    Disabled,
}

/// Tuning knobs of a [`crate::ParallelReader`].
///
/// ```
/// use parallel_seekable::{ChecksumPolicy, Config};
///
/// let config = Config::default()
///     .with_parallelism(4)
///     .with_chunk_size(1 << 20)
///     .with_checksum(ChecksumPolicy::Warn);
/// assert_eq!(config.effective_parallelism(), 4);
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of decode workers. 0 uses every detected core.
    pub parallelism: usize,
    /// Compressed distance between the starts of two speculative search ranges.
    pub chunk_size_bytes: usize,
    /// Upper bound on decoded bytes held by the chunk cache.
    pub cache_budget_bytes: usize,
    /// How many chunks to decode ahead of the consumer. `None` follows `parallelism`.
    pub lookahead_chunks: Option<usize>,
    /// A chunk also ends at the first block boundary after this many decoded bytes.
    pub max_decompressed_chunk_bytes: usize,
    pub checksum: ChecksumPolicy,
}

pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;
pub const DEFAULT_CACHE_BUDGET: usize = 256 * 1024 * 1024;
pub const DEFAULT_MAX_DECOMPRESSED_CHUNK: usize = 64 * 1024 * 1024;

impl Default for Config {
    fn default() -> Self {
        Self {
            parallelism: 0,
            chunk_size_bytes: DEFAULT_CHUNK_SIZE,
            cache_budget_bytes: DEFAULT_CACHE_BUDGET,
            lookahead_chunks: None,
            max_decompressed_chunk_bytes: DEFAULT_MAX_DECOMPRESSED_CHUNK,
            checksum: ChecksumPolicy::Verify,
        }
    }
}

impl Config {
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn with_chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size_bytes = bytes;
        self
    }

    pub fn with_cache_budget(mut self, bytes: usize) -> Self {
        self.cache_budget_bytes = bytes;
        self
    }

    pub fn with_lookahead(mut self, chunks: usize) -> Self {
        self.lookahead_chunks = Some(chunks);
        self
    }

    pub fn with_max_decompressed_chunk(mut self, bytes: usize) -> Self {
        self.max_decompressed_chunk_bytes = bytes;
        self
    }

    pub fn with_checksum(mut self, policy: ChecksumPolicy) -> Self {
        self.checksum = policy;
        self
    }

    /// Worker count after resolving 0 to the detected core count.
    pub fn effective_parallelism(&self) -> usize {
        if self.parallelism == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            self.parallelism
        }
    }

    pub fn effective_lookahead(&self) -> usize {
        self.lookahead_chunks
            .unwrap_or_else(|| self.effective_parallelism())
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size_bytes == 0 {
            return Err(Error::InvalidConfig("chunk size must be positive".into()));
        }
        if self.max_decompressed_chunk_bytes == 0 {
            return Err(Error::InvalidConfig(
                "maximum decompressed chunk size must be positive".into(),
            ));
        }
        Ok(())
    }
}
