//! Prefetching and in-order finalization of chunks.
//!
//! The seek index doubles as the record of finalized chunks: while the stream
//! end is unknown, its last checkpoint is the start of the *frontier*, the
//! first chunk that has not been finalized yet. Every earlier chunk has a known
//! extent and can be replayed from its checkpoint at any time.
//!
//! Only one thread finalizes at a time (the `claimed` flag). The claimer
//! decodes the frontier chunk, or takes the speculative result of its search
//! range when that result starts exactly at the frontier, resolves its markers
//! against the checkpoint window and appends the next checkpoint. Locks are
//! never nested and never held while waiting on a worker.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use tracing::{debug, warn};

use crate::cache::ChunkCache;
use crate::chunk::{DecodeContext, DecodedChunk, StopCondition};
use crate::config::Config;
use crate::error::{lock, wait, Error, Result};
use crate::format::Format;
use crate::resolver::{resolve, StreamChecksum};
use crate::scheduler::{Scheduler, TaskKey};
use crate::seek_index::{SeekIndex, SeekPoint, Window};
use crate::source::SharedSource;

struct Frontier {
    claimed: bool,
    checksum: StreamChecksum,
    /// Chunk pinned in the cache as the predecessor of the frontier.
    pinned: Option<usize>,
    failure: Option<String>,
}

/// Extent of a chunk whose end is known.
struct KnownChunk {
    start_bit: u64,
    end_bit: u64,
    /// Decompressed length implied by the surrounding checkpoints.
    len: u64,
    window: Window,
}

/// How frontier chunks were obtained.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FetcherStats {
    /// Speculative results that started exactly at the frontier.
    pub speculative_reused: u64,
    /// Speculative results that started at a false or later candidate.
    pub speculative_discarded: u64,
    /// Speculative tasks that failed; the chunk was decoded inline instead.
    pub speculative_failed: u64,
    /// Frontier chunks decoded on the calling thread.
    pub inline_decodes: u64,
    /// Chunks decoded again from a checkpoint.
    pub replays: u64,
}

#[derive(Default)]
struct Counters {
    speculative_reused: AtomicU64,
    speculative_discarded: AtomicU64,
    speculative_failed: AtomicU64,
    inline_decodes: AtomicU64,
    replays: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

enum Lookup {
    Known(KnownChunk),
    /// The chunk is at or beyond the frontier.
    Pending,
    /// The chunk lies past the end of the stream.
    PastEnd,
}

pub struct ChunkFetcher {
    ctx: Arc<DecodeContext>,
    scheduler: Scheduler,
    cache: ChunkCache,
    index: Mutex<SeekIndex>,
    frontier: Mutex<Frontier>,
    frontier_released: Condvar,
    lookahead: usize,
    /// First search range not yet handed to the scheduler.
    next_range: AtomicU64,
    counters: Counters,
}

impl ChunkFetcher {
    /// Sets up decoding of `source`. An imported `index` lets every chunk it
    /// covers be replayed directly.
    pub fn new(
        source: Arc<SharedSource>,
        format: Format,
        config: &Config,
        index: Option<SeekIndex>,
    ) -> Result<Self> {
        let ctx = Arc::new(DecodeContext::new(source, format, config)?);
        let first_bit = ctx.first_block_bit()?;
        let (index, checksum) = match index {
            Some(index) if index.len() > 1 || index.is_complete() => {
                (index, StreamChecksum::unknown(format, config.checksum))
            }
            Some(index) => (index, StreamChecksum::new(format, config.checksum)),
            None => {
                let mut index = SeekIndex::new(format);
                index.append(SeekPoint {
                    compressed_bit_offset: first_bit,
                    decompressed_byte_offset: 0,
                    window: Window::empty(),
                })?;
                (index, StreamChecksum::new(format, config.checksum))
            }
        };

        let lookahead = if ctx.source.is_seekable() {
            config.effective_lookahead()
        } else {
            0
        };
        let scheduler = Scheduler::new(ctx.clone(), config.effective_parallelism())?;

        Ok(Self {
            ctx,
            scheduler,
            cache: ChunkCache::new(config.cache_budget_bytes),
            index: Mutex::new(index),
            frontier: Mutex::new(Frontier {
                claimed: false,
                checksum,
                pinned: None,
                failure: None,
            }),
            frontier_released: Condvar::new(),
            lookahead,
            next_range: AtomicU64::new(0),
            counters: Counters::default(),
        })
    }

    pub fn format(&self) -> Format {
        self.ctx.format
    }

    pub fn cache(&self) -> &ChunkCache {
        &self.cache
    }

    pub fn index_snapshot(&self) -> Result<SeekIndex> {
        Ok(lock(&self.index)?.clone())
    }

    pub fn stats(&self) -> FetcherStats {
        let c = &self.counters;
        FetcherStats {
            speculative_reused: c.speculative_reused.load(Ordering::Relaxed),
            speculative_discarded: c.speculative_discarded.load(Ordering::Relaxed),
            speculative_failed: c.speculative_failed.load(Ordering::Relaxed),
            inline_decodes: c.inline_decodes.load(Ordering::Relaxed),
            replays: c.replays.load(Ordering::Relaxed),
        }
    }

    /// Total decompressed size, if the end of the stream has been reached.
    pub fn known_size(&self) -> Result<Option<u64>> {
        Ok(lock(&self.index)?.end().map(|end| end.decompressed_size))
    }

    fn check_failed(&self) -> Result<()> {
        if let Some(msg) = &lock(&self.frontier)?.failure {
            return Err(Error::Failed(msg.clone()));
        }
        self.ctx.check_cancelled()
    }

    fn lookup(&self, i: usize) -> Result<Lookup> {
        let index = lock(&self.index)?;
        let Some(point) = index.get(i) else {
            return Ok(if index.is_complete() {
                Lookup::PastEnd
            } else {
                Lookup::Pending
            });
        };
        let (end_bit, end_offset) = match (index.get(i + 1), index.end()) {
            (Some(next), _) => (next.compressed_bit_offset, next.decompressed_byte_offset),
            (None, Some(end)) => (end.compressed_bit_offset, end.decompressed_size),
            (None, None) => return Ok(Lookup::Pending),
        };
        Ok(Lookup::Known(KnownChunk {
            start_bit: point.compressed_bit_offset,
            end_bit,
            len: end_offset - point.decompressed_byte_offset,
            window: point.window.clone(),
        }))
    }

    /// Chunk index and starting decompressed offset of the chunk holding
    /// `offset`, or `None` past the end of the stream.
    pub fn locate(&self, offset: u64) -> Result<Option<(usize, u64)>> {
        loop {
            self.check_failed()?;
            let frontier = {
                let index = lock(&self.index)?;
                let Some((i, point)) = index.find_checkpoint_for(offset) else {
                    return Err(Error::corrupt_index("index has no checkpoints"));
                };
                if i + 1 < index.len() {
                    return Ok(Some((i, point.decompressed_byte_offset)));
                }
                if let Some(end) = index.end() {
                    return Ok((offset < end.decompressed_size)
                        .then_some((i, point.decompressed_byte_offset)));
                }
                i
            };
            self.advance_frontier(frontier)?;
        }
    }

    /// The finalized chunk `i`, or `None` past the end of the stream.
    pub fn chunk(&self, i: usize) -> Result<Option<Arc<DecodedChunk>>> {
        loop {
            self.check_failed()?;
            if let Some(chunk) = self.cache.get(i)? {
                self.prefetch(i)?;
                return Ok(Some(chunk));
            }
            match self.lookup(i)? {
                Lookup::PastEnd => return Ok(None),
                Lookup::Pending => {
                    if let Some((finalized, chunk)) = self.advance_frontier(i)? {
                        if finalized == i {
                            return Ok(Some(chunk));
                        }
                    }
                }
                Lookup::Known(known) => {
                    self.prefetch(i)?;
                    let chunk = self.replay(i, known).map_err(|e| self.fail(e))?;
                    return Ok(Some(chunk));
                }
            }
        }
    }

    /// Decodes every remaining chunk, completing the index.
    pub fn finish(&self) -> Result<u64> {
        loop {
            let frontier = {
                let index = lock(&self.index)?;
                if let Some(end) = index.end() {
                    return Ok(end.decompressed_size);
                }
                index.len() - 1
            };
            self.check_failed()?;
            self.advance_frontier(frontier)?;
        }
    }

    fn replay(&self, i: usize, known: KnownChunk) -> Result<Arc<DecodedChunk>> {
        let decoded = match self.scheduler.take(TaskKey::Known(i))? {
            Some(future) => future.wait()?,
            None => None,
        };
        let mut chunk = match decoded {
            Some(chunk) => chunk,
            None => self
                .ctx
                .decode(known.start_bit, StopCondition::Exact(known.end_bit))
                .map_err(|e| e.into_mandatory(known.start_bit))?,
        };
        bump(&self.counters.replays);
        if chunk.len() as u64 != known.len {
            return Err(Error::corrupt_index(format!(
                "chunk {i} decodes to {} bytes but the index spans {}",
                chunk.len(),
                known.len
            )));
        }
        resolve(&mut chunk, &known.window.decompress()?, self.ctx.format.window_size())?;
        let chunk = Arc::new(chunk);
        self.cache.insert(i, chunk.clone())?;
        Ok(chunk)
    }

    /// Records a fatal error so that later calls fail fast.
    fn fail(&self, err: Error) -> Error {
        if matches!(err, Error::Cancelled | Error::Failed(_)) {
            return err;
        }
        if let Ok(mut frontier) = lock(&self.frontier) {
            frontier.failure.get_or_insert_with(|| err.to_string());
        }
        err
    }

    /// Finalizes the frontier chunk unless it has already moved past `target`.
    fn advance_frontier(&self, target: usize) -> Result<Option<(usize, Arc<DecodedChunk>)>> {
        {
            let mut frontier = lock(&self.frontier)?;
            while frontier.claimed {
                frontier = wait(&self.frontier_released, frontier)?;
            }
            if let Some(msg) = &frontier.failure {
                return Err(Error::Failed(msg.clone()));
            }
            frontier.claimed = true;
        }

        let result = self.finalize_frontier(target);

        let mut frontier = lock(&self.frontier)?;
        frontier.claimed = false;
        self.frontier_released.notify_all();
        drop(frontier);
        result.map_err(|e| self.fail(e))
    }

    fn finalize_frontier(&self, target: usize) -> Result<Option<(usize, Arc<DecodedChunk>)>> {
        let (i, point) = {
            let index = lock(&self.index)?;
            let last = index.len() - 1;
            if index.is_complete() || last > target {
                return Ok(None);
            }
            match index.get(last) {
                Some(point) => (last, point.clone()),
                None => return Ok(None),
            }
        };

        self.prefetch(i)?;
        let mut chunk = self.decode_frontier(point.compressed_bit_offset)?;
        resolve(&mut chunk, &point.window.decompress()?, self.ctx.format.window_size())?;
        lock(&self.frontier)?.checksum.update(&chunk)?;

        if let Some(offset) = chunk.trailing_garbage {
            warn!(offset, "ignoring trailing garbage after the last member");
        }

        let end_offset = point.decompressed_byte_offset + chunk.len() as u64;
        {
            let mut index = lock(&self.index)?;
            if chunk.is_last {
                index.mark_complete(chunk.end_bit, end_offset)?;
            } else {
                index.append(SeekPoint {
                    compressed_bit_offset: chunk.end_bit,
                    decompressed_byte_offset: end_offset,
                    window: Window::compress(&chunk.tail_window)?,
                })?;
            }
        }

        debug!(
            chunk = i,
            start_bit = chunk.start_bit,
            end_bit = chunk.end_bit,
            bytes = chunk.len(),
            last = chunk.is_last,
            "finalized chunk"
        );

        let chunk = Arc::new(chunk);
        let pinned = self
            .cache
            .insert(i, chunk.clone())
            .and_then(|kept| Ok(kept && self.cache.pin(i)?));
        // The old pin goes either way; an uncached chunk needs no protection.
        let previous = {
            let mut frontier = lock(&self.frontier)?;
            match pinned {
                Ok(true) => frontier.pinned.replace(i),
                _ => frontier.pinned.take(),
            }
        };
        if let Some(previous) = previous {
            self.cache.unpin(previous)?;
        }
        pinned?;
        Ok(Some((i, chunk)))
    }

    fn decode_frontier(&self, start_bit: u64) -> Result<DecodedChunk> {
        let range = self.ctx.range_of(start_bit);
        self.scheduler.discard_speculative_before(range)?;
        if let Some(future) = self.scheduler.take(TaskKey::Speculative(range))? {
            match future.wait() {
                Ok(Some(chunk)) if chunk.start_bit == start_bit => {
                    debug!(range, start_bit, "reusing speculative chunk");
                    bump(&self.counters.speculative_reused);
                    return Ok(chunk);
                }
                Ok(Some(chunk)) => {
                    bump(&self.counters.speculative_discarded);
                    debug!(
                        range,
                        candidate = chunk.start_bit,
                        expected = start_bit,
                        "discarding misaligned speculative chunk"
                    );
                }
                Ok(None) => {}
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e @ Error::Io(_)) => {
                    bump(&self.counters.speculative_failed);
                    warn!(range, error = %e, "speculative decode hit an I/O error, decoding inline");
                }
                Err(e) => {
                    bump(&self.counters.speculative_failed);
                    debug!(range, error = %e, "speculative decode failed");
                }
            }
        }
        bump(&self.counters.inline_decodes);
        self.ctx
            .decode(start_bit, self.ctx.threshold_for(start_bit))
            .map_err(|e| e.into_mandatory(start_bit))
    }

    /// Queues decodes for the `lookahead` chunks following chunk `i`: replays
    /// for chunks already in the index, speculative search ranges past the
    /// frontier.
    fn prefetch(&self, i: usize) -> Result<()> {
        if self.lookahead == 0 {
            return Ok(());
        }
        let window = i + 1..i + 1 + self.lookahead;
        self.scheduler.retain_known(window.clone())?;

        let mut remaining = self.lookahead;
        for j in window {
            match self.lookup(j)? {
                Lookup::Known(known) => {
                    if !self.cache.contains(j)? {
                        self.scheduler.submit_known(j, known.start_bit, known.end_bit)?;
                    }
                    remaining -= 1;
                }
                Lookup::PastEnd => return Ok(()),
                Lookup::Pending => break,
            }
        }
        if remaining == 0 {
            return Ok(());
        }

        let frontier_bit = {
            let index = lock(&self.index)?;
            match index.points().last() {
                Some(point) if !index.is_complete() => point.compressed_bit_offset,
                _ => return Ok(()),
            }
        };
        let first = self.ctx.range_of(frontier_bit) + 1;
        let mut last = first + remaining as u64 - 1;
        if let Some(count) = self.ctx.range_count() {
            last = last.min(count.saturating_sub(1));
        }
        let from = self
            .next_range
            .fetch_max(last + 1, Ordering::Relaxed)
            .max(first);
        for range in from..=last {
            self.scheduler.submit_speculative(range)?;
        }
        Ok(())
    }

    /// Stops all pending work and drops cached chunks.
    pub fn shutdown(&self) -> Result<()> {
        self.scheduler.cancel()?;
        self.cache.clear()
    }
}
