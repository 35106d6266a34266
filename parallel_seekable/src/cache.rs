//! Byte-budgeted cache of finalized chunks.
//!
//! Eviction picks the least recently used unpinned chunk. The budget is a
//! hard bound: a chunk that cannot fit, even after evicting every unpinned
//! entry, is not cached at all and is simply decoded again when asked for.

use std::sync::{Arc, Mutex};

use lru::LruCache;

use crate::chunk::DecodedChunk;
use crate::error::{lock, Result};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

struct Entry {
    chunk: Arc<DecodedChunk>,
    size: usize,
    pins: usize,
}

struct CacheState {
    /// Recency order only; the byte budget is enforced on top of it.
    entries: LruCache<usize, Entry>,
    used: usize,
    stats: CacheStats,
}

impl CacheState {
    /// Drops the least recently used unpinned chunk.
    fn evict_one(&mut self) -> bool {
        let victim = self
            .entries
            .iter()
            .rev()
            .find(|(_, e)| e.pins == 0)
            .map(|(&index, _)| index);
        match victim.and_then(|index| self.entries.pop(&index)) {
            Some(entry) => {
                self.used -= entry.size;
                self.stats.evictions += 1;
                true
            }
            None => false,
        }
    }
}

pub struct ChunkCache {
    budget: usize,
    state: Mutex<CacheState>,
}

impl ChunkCache {
    pub fn new(budget: usize) -> Self {
        Self {
            budget,
            state: Mutex::new(CacheState {
                entries: LruCache::unbounded(),
                used: 0,
                stats: CacheStats::default(),
            }),
        }
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    pub fn get(&self, index: usize) -> Result<Option<Arc<DecodedChunk>>> {
        let mut state = lock(&self.state)?;
        let found = state.entries.get(&index).map(|entry| entry.chunk.clone());
        if found.is_some() {
            state.stats.hits += 1;
        } else {
            state.stats.misses += 1;
        }
        Ok(found)
    }

    pub fn contains(&self, index: usize) -> Result<bool> {
        Ok(lock(&self.state)?.entries.contains(&index))
    }

    /// Caches `chunk` under `index`, evicting as needed. Returns whether the
    /// chunk was kept.
    pub fn insert(&self, index: usize, chunk: Arc<DecodedChunk>) -> Result<bool> {
        let size = chunk.memory_size();
        let mut state = lock(&self.state)?;
        if let Some(old) = state.entries.pop(&index) {
            state.used -= old.size;
        }
        if size > self.budget {
            return Ok(false);
        }
        while state.used + size > self.budget {
            if !state.evict_one() {
                return Ok(false);
            }
        }
        state.used += size;
        state.entries.put(
            index,
            Entry {
                chunk,
                size,
                pins: 0,
            },
        );
        Ok(true)
    }

    /// Protects `index` from eviction. Returns false if it is not cached.
    pub fn pin(&self, index: usize) -> Result<bool> {
        let mut state = lock(&self.state)?;
        Ok(match state.entries.peek_mut(&index) {
            Some(entry) => {
                entry.pins += 1;
                true
            }
            None => false,
        })
    }

    pub fn unpin(&self, index: usize) -> Result<()> {
        if let Some(entry) = lock(&self.state)?.entries.peek_mut(&index) {
            entry.pins = entry.pins.saturating_sub(1);
        }
        Ok(())
    }

    /// Number of cached chunks currently protected from eviction.
    pub fn pinned(&self) -> Result<usize> {
        Ok(lock(&self.state)?
            .entries
            .iter()
            .filter(|(_, e)| e.pins > 0)
            .count())
    }

    pub fn used_bytes(&self) -> Result<usize> {
        Ok(lock(&self.state)?.used)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(lock(&self.state)?.entries.len())
    }

    pub fn stats(&self) -> Result<CacheStats> {
        Ok(lock(&self.state)?.stats)
    }

    pub fn clear(&self) -> Result<()> {
        let mut state = lock(&self.state)?;
        state.entries.clear();
        state.used = 0;
        Ok(())
    }
}
