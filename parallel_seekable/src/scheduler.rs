//! Fixed-size worker pool running chunk decodes.
//!
//! Every task reports through its own single-slot channel, which acts as the
//! task's future. At most one task per [`TaskKey`] is in flight; submitting a
//! key that is already pending is a no-op.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::{Arc, Mutex};

use crossbeam_channel::{bounded, Receiver};
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::error;

use crate::chunk::{DecodeContext, DecodedChunk, StopCondition};
use crate::error::{lock, Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKey {
    /// Decode search range `r` from its first viable candidate.
    Speculative(u64),
    /// Replay chunk `i` from its seek point.
    Known(usize),
}

/// Pending result of a submitted task. A speculative task whose range holds no
/// viable candidate yields `Ok(None)`.
pub struct ChunkFuture {
    receiver: Receiver<Result<Option<DecodedChunk>>>,
}

impl ChunkFuture {
    /// Blocks until the task finishes.
    pub fn wait(self) -> Result<Option<DecodedChunk>> {
        self.receiver.recv().map_err(|_| Error::WorkerLost)?
    }
}

pub struct Scheduler {
    pool: ThreadPool,
    ctx: Arc<DecodeContext>,
    in_flight: Mutex<HashMap<TaskKey, ChunkFuture>>,
}

impl Scheduler {
    pub fn new(ctx: Arc<DecodeContext>, threads: usize) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|i| format!("chunk-decoder-{i}"))
            .panic_handler(|_| error!("chunk decode task panicked"))
            .build()
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        Ok(Self {
            pool,
            ctx,
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    pub fn context(&self) -> &Arc<DecodeContext> {
        &self.ctx
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Queues a speculative decode of search range `range`.
    pub fn submit_speculative(&self, range: u64) -> Result<bool> {
        self.submit(TaskKey::Speculative(range), move |ctx| ctx.decode_speculative(range))
    }

    /// Queues the replay of chunk `index`, known to span `[start_bit, end_bit)`.
    pub fn submit_known(&self, index: usize, start_bit: u64, end_bit: u64) -> Result<bool> {
        self.submit(TaskKey::Known(index), move |ctx| {
            ctx.decode(start_bit, StopCondition::Exact(end_bit))
                .map(Some)
                .map_err(|e| e.into_mandatory(start_bit))
        })
    }

    fn submit<F>(&self, key: TaskKey, job: F) -> Result<bool>
    where
        F: FnOnce(&DecodeContext) -> Result<Option<DecodedChunk>> + Send + 'static,
    {
        self.ctx.check_cancelled()?;
        let mut in_flight = lock(&self.in_flight)?;
        if in_flight.contains_key(&key) {
            return Ok(false);
        }
        let (tx, rx) = bounded(1);
        let ctx = self.ctx.clone();
        self.pool.spawn(move || {
            let result = ctx.check_cancelled().and_then(|_| job(&ctx));
            // The future may have been dropped by a discard or a close.
            let _ = tx.send(result);
        });
        in_flight.insert(key, ChunkFuture { receiver: rx });
        Ok(true)
    }

    pub fn is_pending(&self, key: TaskKey) -> Result<bool> {
        Ok(lock(&self.in_flight)?.contains_key(&key))
    }

    /// Removes and returns the future of `key`, leaving the caller to wait on it.
    pub fn take(&self, key: TaskKey) -> Result<Option<ChunkFuture>> {
        Ok(lock(&self.in_flight)?.remove(&key))
    }

    /// Drops pending speculative tasks of ranges below `range`; their results
    /// can no longer be used.
    pub fn discard_speculative_before(&self, range: u64) -> Result<()> {
        lock(&self.in_flight)?
            .retain(|key, _| !matches!(key, TaskKey::Speculative(r) if *r < range));
        Ok(())
    }

    /// Drops pending replays of chunks outside `keep`.
    pub fn retain_known(&self, keep: Range<usize>) -> Result<()> {
        lock(&self.in_flight)?
            .retain(|key, _| !matches!(key, TaskKey::Known(i) if !keep.contains(i)));
        Ok(())
    }

    pub fn pending(&self) -> Result<usize> {
        Ok(lock(&self.in_flight)?.len())
    }

    /// Signals every task to stop at its next safe point and forgets them.
    pub fn cancel(&self) -> Result<()> {
        self.ctx.cancel();
        lock(&self.in_flight)?.clear();
        Ok(())
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.ctx.cancel();
    }
}
