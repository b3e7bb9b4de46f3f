//! Counting-sort bucket index over hashed grid cells.
//!
//! The index is built in three phases that may each be split across workers:
//!
//! 1. **count**: `counters[bucket] += 1` for every particle (atomic add);
//! 2. **scan**: inclusive prefix sum over all `M + 1` counters, so that
//!    `counters[b]` is the end of bucket `b` and `counters[M] == N`;
//! 3. **scatter**: `slot = counters[bucket] - 1` via atomic decrement, then
//!    `map[slot] = particle`.
//!
//! Each decrement hands out a unique slot, so every map entry is written
//! exactly once. After scatter `counters[b]` has been decremented down to the
//! start of bucket `b`: the counters hold the exclusive prefix sum and bucket
//! `b` occupies `map[counters[b] .. counters[b + 1]]`.
//!
//! The parallel scan splits the counters into one range per worker: each
//! worker scans its range locally and publishes the range total, then after a
//! barrier adds the totals of all lower ranges.

use std::ops::Range;

use crate::hashing::{CellHash, GridHasher};
use crate::storage::AtomicWords;

/// Phase 1: count the bucket of every particle in `particles`.
pub fn count_range(counters: &AtomicWords, particles: Range<usize>, bucket_of: impl Fn(usize) -> u32) {
    for i in particles {
        let b = bucket_of(i) as usize;
        debug_assert!(b + 1 < counters.len(), "bucket {b} outside table");
        counters.fetch_add(b, 1);
    }
}

/// Inclusive scan of `counters[range]` in place. Returns the range total.
pub fn scan_range(counters: &AtomicWords, range: Range<usize>) -> u32 {
    let mut sum = 0_u32;
    for b in range {
        sum += counters.load(b);
        counters.store(b, sum);
    }
    sum
}

/// Add `offset` to every counter in `range`.
pub fn add_offset(counters: &AtomicWords, range: Range<usize>, offset: u32) {
    if offset == 0 {
        return;
    }
    for b in range {
        counters.store(b, counters.load(b) + offset);
    }
}

/// Phase 2 on a single thread.
pub fn scan_all(counters: &AtomicWords) {
    scan_range(counters, 0..counters.len());
}

/// Phase 3: place every particle of `particles` into its bucket.
pub fn scatter_range(
    counters: &AtomicWords,
    map: &AtomicWords,
    particles: Range<usize>,
    bucket_of: impl Fn(usize) -> u32,
) {
    for i in particles {
        let b = bucket_of(i) as usize;
        let slot = counters.fetch_sub(b, 1) - 1;
        debug_assert!((slot as usize) < map.len(), "slot {slot} out of range");
        map.store(slot as usize, i as u32);
    }
}

/// All three phases on a single thread, starting from zeroed counters.
pub fn build(counters: &AtomicWords, map: &AtomicWords, count: usize, bucket_of: impl Fn(usize) -> u32) {
    counters.fill(0..counters.len(), 0);
    count_range(counters, 0..count, &bucket_of);
    scan_all(counters);
    scatter_range(counters, map, 0..count, &bucket_of);
}

/// Read access to a finished bucket index.
#[derive(Debug, Clone, Copy)]
pub struct BucketIndex<'a> {
    counters: &'a AtomicWords,
    map: &'a AtomicWords,
}

impl<'a> BucketIndex<'a> {
    /// Wrap counters (`M + 1` words) and map (`N` words) after scatter.
    pub fn new(counters: &'a AtomicWords, map: &'a AtomicWords) -> Self {
        Self { counters, map }
    }

    /// Number of buckets M.
    pub fn table_size(&self) -> usize {
        self.counters.len() - 1
    }

    /// Number of indexed particles.
    pub fn particle_count(&self) -> usize {
        self.map.len()
    }

    /// Slots of bucket `bucket`.
    #[inline]
    pub fn bucket(&self, bucket: u32) -> Range<usize> {
        let b = bucket as usize;
        let begin = self.counters.load(b) as usize;
        let end = self.counters.load(b + 1) as usize;
        debug_assert!(begin <= end, "bucket {b} begins at {begin} after its end {end}");
        debug_assert!(end <= self.map.len());
        begin..end
    }

    /// Particle stored in `slot`.
    #[inline]
    pub fn particle(&self, slot: usize) -> usize {
        self.map.load(slot) as usize
    }
}

/// Owned, build-once bucket index, used for static geometry.
#[derive(Debug)]
pub struct SpatialHash<H: CellHash> {
    grid: GridHasher<H>,
    counters: AtomicWords,
    map: AtomicWords,
}

impl<H: CellHash> SpatialHash<H> {
    /// Index `positions` into `grid`'s buckets.
    pub fn build(grid: GridHasher<H>, count: usize, position_of: impl Fn(usize) -> glam::Vec3) -> Self {
        let counters = AtomicWords::zeroed(grid.table_size() as usize + 1);
        let map = AtomicWords::zeroed(count);
        build(&counters, &map, count, |i| grid.bucket_of(position_of(i)));
        Self { grid, counters, map }
    }

    /// Hasher the index was built with.
    pub fn grid(&self) -> &GridHasher<H> {
        &self.grid
    }

    /// Lookup view.
    pub fn index(&self) -> BucketIndex<'_> {
        BucketIndex::new(&self.counters, &self.map)
    }

    /// Raw counters, `M + 1` words.
    pub fn counters(&self) -> &AtomicWords {
        &self.counters
    }

    /// Raw particle map, `N` words.
    pub fn map(&self) -> &AtomicWords {
        &self.map
    }
}
