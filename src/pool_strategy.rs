//! Pluggable matching policies for the [SizeClassPool](crate::SizeClassPool).
//!
//! A [MatchStrategy] decides which free block may satisfy a request.  [ExactMatch] only hands out blocks of the
//! identical shape; [NearestFit] hands out the smallest block of the same format whose allocation is within a
//! multiple of the requested size, reconfigured to the requested shape.
use std::collections::{BTreeMap, HashMap};

use ahash::RandomState;

use crate::block::{Block, BlockShape, PixelFormat};
use crate::grouped_lru::GroupedLruMap;

/// Default bound on how much larger than requested a nearest-fit block may be.
pub const DEFAULT_NEAREST_FIT_MULTIPLE: u64 = 8;

pub trait MatchStrategy: Send {
    /// Keep a free block.
    fn put(&mut self, block: Block);

    /// Take a block able to hold `shape`, already configured to it.
    fn get(&mut self, shape: &BlockShape) -> Option<Block>;

    /// Take a block from the least recently used size class.
    fn remove_last(&mut self) -> Option<Block>;

    /// Drop every free block.
    fn clear(&mut self);

    fn bucket_count(&self) -> usize;

    fn block_count(&self) -> usize;

    /// The size a block is accounted at.
    fn size_of(&self, block: &Block) -> u64 {
        block.allocation_size()
    }
}

/// Choice of strategy, for configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolStrategyKind {
    Exact,
    NearestFit,
}

impl Default for PoolStrategyKind {
    fn default() -> Self {
        PoolStrategyKind::NearestFit
    }
}

impl PoolStrategyKind {
    pub fn build(self, nearest_fit_multiple: u64) -> Box<dyn MatchStrategy> {
        match self {
            PoolStrategyKind::Exact => Box::new(ExactMatch::new()),
            PoolStrategyKind::NearestFit => Box::new(NearestFit::with_multiple(nearest_fit_multiple)),
        }
    }
}

/// Buckets keyed by the full shape.
pub struct ExactMatch {
    groups: GroupedLruMap<BlockShape, Block>,
}

impl ExactMatch {
    pub fn new() -> ExactMatch {
        ExactMatch {
            groups: GroupedLruMap::new(),
        }
    }
}

impl Default for ExactMatch {
    fn default() -> Self {
        ExactMatch::new()
    }
}

impl MatchStrategy for ExactMatch {
    fn put(&mut self, block: Block) {
        self.groups.put(block.shape(), block);
    }

    fn get(&mut self, shape: &BlockShape) -> Option<Block> {
        self.groups.get(shape)
    }

    fn remove_last(&mut self) -> Option<Block> {
        self.groups.remove_last().map(|(_, b)| b)
    }

    fn clear(&mut self) {
        self.groups.clear();
    }

    fn bucket_count(&self) -> usize {
        self.groups.group_count()
    }

    fn block_count(&self) -> usize {
        self.groups.value_count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SizeKey {
    bytes: u64,
    format: PixelFormat,
}

/// Buckets keyed by allocation size and format, searched for the smallest adequate size.
pub struct NearestFit {
    groups: GroupedLruMap<SizeKey, Block>,
    /// For each format, how many free blocks exist at each allocation size.
    sizes: HashMap<PixelFormat, BTreeMap<u64, usize>, RandomState>,
    multiple: u64,
}

impl NearestFit {
    pub fn new() -> NearestFit {
        NearestFit::with_multiple(DEFAULT_NEAREST_FIT_MULTIPLE)
    }

    pub fn with_multiple(multiple: u64) -> NearestFit {
        NearestFit {
            groups: GroupedLruMap::new(),
            sizes: Default::default(),
            multiple: multiple.max(1),
        }
    }

    fn forget_one(&mut self, key: &SizeKey) {
        if let Some(sizes) = self.sizes.get_mut(&key.format) {
            if let Some(count) = sizes.get_mut(&key.bytes) {
                *count -= 1;
                if *count == 0 {
                    sizes.remove(&key.bytes);
                }
            }
            if sizes.is_empty() {
                self.sizes.remove(&key.format);
            }
        }
    }

    fn best_size(&self, shape: &BlockShape) -> Option<u64> {
        let wanted = shape.checked_byte_size()?;
        let ceiling = wanted.saturating_mul(self.multiple);
        self.sizes
            .get(&shape.format)?
            .range(wanted..=ceiling)
            .next()
            .map(|(size, _)| *size)
    }
}

impl Default for NearestFit {
    fn default() -> Self {
        NearestFit::new()
    }
}

impl MatchStrategy for NearestFit {
    fn put(&mut self, block: Block) {
        let key = SizeKey {
            bytes: block.allocation_size(),
            format: block.shape().format,
        };
        *self
            .sizes
            .entry(key.format)
            .or_default()
            .entry(key.bytes)
            .or_insert(0) += 1;
        self.groups.put(key, block);
    }

    fn get(&mut self, shape: &BlockShape) -> Option<Block> {
        let key = SizeKey {
            bytes: self.best_size(shape)?,
            format: shape.format,
        };
        let mut block = self.groups.get(&key)?;
        self.forget_one(&key);
        if !block.reconfigure(*shape) {
            self.put(block);
            return None;
        }
        Some(block)
    }

    fn remove_last(&mut self) -> Option<Block> {
        let (key, block) = self.groups.remove_last()?;
        self.forget_one(&key);
        Some(block)
    }

    fn clear(&mut self) {
        self.groups.clear();
        self.sizes.clear();
    }

    fn bucket_count(&self) -> usize {
        self.groups.group_count()
    }

    fn block_count(&self) -> usize {
        self.groups.value_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rgba(w: u32, h: u32) -> BlockShape {
        BlockShape::new(w, h, PixelFormat::Rgba8888)
    }

    #[test]
    fn exact_requires_identical_shape() {
        let mut s = ExactMatch::new();
        s.put(Block::new(rgba(10, 10)));
        assert!(s.get(&rgba(5, 5)).is_none());
        assert!(s.get(&BlockShape::new(10, 10, PixelFormat::Alpha8)).is_none());
        let b = s.get(&rgba(10, 10)).expect("same shape");
        assert_eq!(b.shape(), rgba(10, 10));
        assert_eq!(s.block_count(), 0);
        assert_eq!(s.bucket_count(), 0);
    }

    #[test]
    fn nearest_fit_picks_smallest_adequate_block() {
        let mut s = NearestFit::new();
        s.put(Block::new(rgba(20, 20)));
        s.put(Block::new(rgba(12, 12)));
        s.put(Block::new(rgba(100, 100)));

        let b = s.get(&rgba(10, 10)).expect("a 12x12 block fits");
        assert_eq!(b.allocation_size(), 12 * 12 * 4);
        assert_eq!(b.shape(), rgba(10, 10));
        assert_eq!(b.pixels().len(), 400);
        assert_eq!(s.block_count(), 2);
    }

    #[test]
    fn nearest_fit_respects_multiple() {
        let mut s = NearestFit::with_multiple(8);
        // 100x100 is 100 times larger than 10x10.
        s.put(Block::new(rgba(100, 100)));
        assert!(s.get(&rgba(10, 10)).is_none());
        // 25x25 is 6.25 times larger than 10x10.
        s.put(Block::new(rgba(25, 25)));
        assert!(s.get(&rgba(10, 10)).is_some());
    }

    #[test]
    fn nearest_fit_multiple_is_inclusive() {
        let mut s = NearestFit::with_multiple(8);
        // 40x20 is exactly 8 times larger than 10x10.
        s.put(Block::new(rgba(40, 20)));
        let b = s.get(&rgba(10, 10)).expect("exactly 8 times fits");
        assert_eq!(b.allocation_size(), 8 * 400);

        // One pixel more is out of range.
        s.put(Block::new(BlockShape::new(801, 1, PixelFormat::Rgba8888)));
        assert!(s.get(&rgba(10, 10)).is_none());
    }

    #[test]
    fn overflowing_requests_miss() {
        for mut s in [PoolStrategyKind::Exact.build(8), PoolStrategyKind::NearestFit.build(8)] {
            s.put(Block::new(BlockShape::new(4, 4, PixelFormat::Rgb565)));
            assert!(s
                .get(&BlockShape::new(u32::MAX, u32::MAX, PixelFormat::RgbaF16))
                .is_none());
            assert_eq!(s.block_count(), 1);
        }
    }

    #[test]
    fn nearest_fit_does_not_cross_formats() {
        let mut s = NearestFit::new();
        s.put(Block::new(BlockShape::new(10, 10, PixelFormat::Alpha8)));
        assert!(s.get(&BlockShape::new(5, 5, PixelFormat::Alpha8)).is_some());
        s.put(Block::new(BlockShape::new(10, 10, PixelFormat::Alpha8)));
        assert!(s.get(&BlockShape::new(5, 5, PixelFormat::Rgb565)).is_none());
    }

    #[test]
    fn nearest_fit_remove_last_updates_sizes() {
        let mut s = NearestFit::new();
        s.put(Block::new(rgba(10, 10)));
        assert!(s.remove_last().is_some());
        assert!(s.remove_last().is_none());
        assert!(s.get(&rgba(10, 10)).is_none());
        assert!(s.sizes.is_empty());
    }

    #[test]
    fn kinds_build_their_strategy() {
        let mut exact = PoolStrategyKind::Exact.build(8);
        exact.put(Block::new(rgba(4, 4)));
        assert!(exact.get(&rgba(2, 2)).is_none());

        let mut nearest = PoolStrategyKind::NearestFit.build(8);
        nearest.put(Block::new(rgba(4, 4)));
        assert!(nearest.get(&rgba(2, 2)).is_some());
    }
}
