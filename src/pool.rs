//! The [SizeClassPool] recycles large fixed-shape [Block]s so producers do not have to allocate fresh ones.
//!
//! The pool is shared between worker threads and the delivery context, so all of its state lives behind one lock.
//! Operations are map lookups plus linked-list splices; nothing long-running happens under the lock.
//!
//! Accounting is explicit: `current_size` goes up exactly once per accepted `put` and down exactly once per block
//! leaving through `get` or eviction.
use parking_lot::Mutex;

use crate::block::{Block, BlockShape};
use crate::pool_strategy::{MatchStrategy, NearestFit, PoolStrategyKind};

/// How hard the system is asking us to give memory back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TrimLevel {
    /// The process is in the background: halve what we hold.
    Background,
    /// Memory is getting tight: drop everything.
    Moderate,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub current_size: u64,
    pub max_size: u64,
    pub hits: u64,
    pub misses: u64,
    pub puts: u64,
    pub rejections: u64,
    pub evictions: u64,
    pub buckets: usize,
    pub blocks: usize,
}

struct PoolState {
    strategy: Box<dyn MatchStrategy>,
    initial_max_size: u64,
    max_size: u64,
    single_block_limit: Option<u64>,
    current_size: u64,
    hits: u64,
    misses: u64,
    puts: u64,
    rejections: u64,
    evictions: u64,
}

impl PoolState {
    fn block_limit(&self) -> u64 {
        self.single_block_limit.unwrap_or(self.max_size / 2)
    }

    fn evict_to_size(&mut self, size: u64) {
        while self.current_size > size {
            let block = match self.strategy.remove_last() {
                Some(b) => b,
                None => {
                    tracing::warn!(
                        current_size = self.current_size,
                        "pool size accounting mismatch, resetting"
                    );
                    self.current_size = 0;
                    break;
                }
            };
            self.current_size -= self.strategy.size_of(&block);
            self.evictions += 1;
            tracing::trace!(shape = %block.shape(), current_size = self.current_size, "evicted pooled block");
        }
    }

    fn clear(&mut self) {
        self.evictions += self.strategy.block_count() as u64;
        self.strategy.clear();
        self.current_size = 0;
    }
}

pub struct SizeClassPool {
    state: Mutex<PoolState>,
}

impl SizeClassPool {
    /// A pool using the given matching strategy.
    pub fn new<S: MatchStrategy + 'static>(max_size: u64, strategy: S) -> SizeClassPool {
        SizeClassPool::with_boxed_strategy(max_size, Box::new(strategy))
    }

    pub fn with_boxed_strategy(max_size: u64, strategy: Box<dyn MatchStrategy>) -> SizeClassPool {
        SizeClassPool {
            state: Mutex::new(PoolState {
                strategy,
                initial_max_size: max_size,
                max_size,
                single_block_limit: None,
                current_size: 0,
                hits: 0,
                misses: 0,
                puts: 0,
                rejections: 0,
                evictions: 0,
            }),
        }
    }

    pub fn from_kind(max_size: u64, kind: PoolStrategyKind, nearest_fit_multiple: u64) -> SizeClassPool {
        SizeClassPool::with_boxed_strategy(max_size, kind.build(nearest_fit_multiple))
    }

    /// Override the largest block the pool accepts.  The default is half the maximum size.
    pub fn with_single_block_limit(self, limit: u64) -> SizeClassPool {
        self.state.lock().single_block_limit = Some(limit);
        self
    }

    pub fn max_size(&self) -> u64 {
        self.state.lock().max_size
    }

    pub fn current_size(&self) -> u64 {
        self.state.lock().current_size
    }

    /// Offer a free block to the pool.  Returns whether the pool kept it.
    ///
    /// Blocks above the single-block limit are dropped; that is a capacity decision, not an error.
    pub fn put(&self, block: Block) -> bool {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let size = state.strategy.size_of(&block);
        if size == 0 || size > state.block_limit() {
            state.rejections += 1;
            tracing::trace!(shape = %block.shape(), size, "rejected block from pool");
            return false;
        }

        state.strategy.put(block);
        state.current_size += size;
        state.puts += 1;
        let ceiling = state.max_size;
        state.evict_to_size(ceiling);
        true
    }

    /// Take a block of the given shape, with its contents zeroed.
    pub fn get(&self, shape: &BlockShape) -> Option<Block> {
        let mut block = self.get_dirty(shape)?;
        block.erase();
        Some(block)
    }

    /// Take a block of the given shape, contents unspecified.
    pub fn get_dirty(&self, shape: &BlockShape) -> Option<Block> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        match state.strategy.get(shape) {
            Some(block) => {
                state.current_size -= state.strategy.size_of(&block);
                state.hits += 1;
                Some(block)
            }
            None => {
                state.misses += 1;
                None
            }
        }
    }

    /// Take a pooled block or allocate a fresh one.
    pub fn get_or_alloc(&self, shape: &BlockShape) -> Block {
        self.get(shape).unwrap_or_else(|| Block::new(*shape))
    }

    pub fn evict_to_size(&self, size: u64) {
        self.state.lock().evict_to_size(size);
    }

    /// Drop every pooled block.
    pub fn clear_memory(&self) {
        self.state.lock().clear();
    }

    /// Respond to memory pressure.
    pub fn trim(&self, level: TrimLevel) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        tracing::debug!(?level, current_size = state.current_size, "trimming pool");
        match level {
            TrimLevel::Moderate => state.clear(),
            TrimLevel::Background => {
                let half = state.current_size / 2;
                state.evict_to_size(half);
            }
        }
    }

    /// Rescale the maximum size relative to the configured one and evict down to it.
    pub fn set_size_multiplier(&self, multiplier: f32) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let multiplier = f64::from(multiplier.max(0.0));
        state.max_size = (state.initial_max_size as f64 * multiplier).round() as u64;
        let ceiling = state.max_size;
        state.evict_to_size(ceiling);
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            current_size: state.current_size,
            max_size: state.max_size,
            hits: state.hits,
            misses: state.misses,
            puts: state.puts,
            rejections: state.rejections,
            evictions: state.evictions,
            buckets: state.strategy.bucket_count(),
            blocks: state.strategy.block_count(),
        }
    }
}

impl Default for SizeClassPool {
    fn default() -> Self {
        SizeClassPool::new(32 * 1024 * 1024, NearestFit::new())
    }
}

impl std::fmt::Debug for SizeClassPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SizeClassPool").field("stats", &self.stats()).finish()
    }
}
