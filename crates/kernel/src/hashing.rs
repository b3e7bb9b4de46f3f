//! Uniform-grid cell mapping and the two cell hash functions.
//!
//! Two hashes exist, one per execution target:
//!
//! - [`XorCellHash`]: multiplicative XOR hash (primes 73856093, 19349663,
//!   83492791), used by the CPU system.
//! - [`MortonCellHash`]: Z-order bit interleave of the cell coordinates,
//!   centered in a 1024-cell cube, used by device kernels.
//!
//! They are not bit-compatible. A [`GridHasher`] is typed by its hash so a
//! bucket index built with one can never be queried with the other.

use glam::{IVec3, Vec3};

/// Grid cell containing `position` for cell size `h`.
#[inline]
pub fn cell_of(position: Vec3, h: f32) -> IVec3 {
    (position / h).floor().as_ivec3()
}

/// Hash of an integer grid cell, before reduction to the table size.
pub trait CellHash: Copy + Send + Sync + 'static {
    /// Short name used in log output.
    const NAME: &'static str;

    /// Raw 32-bit hash of `cell`.
    fn hash_cell(&self, cell: IVec3) -> u32;
}

/// Multiplicative XOR hash used on the CPU path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct XorCellHash;

impl CellHash for XorCellHash {
    const NAME: &'static str = "xor";

    #[inline]
    fn hash_cell(&self, cell: IVec3) -> u32 {
        (cell.x as u32).wrapping_mul(73_856_093)
            ^ (cell.y as u32).wrapping_mul(19_349_663)
            ^ (cell.z as u32).wrapping_mul(83_492_791)
    }
}

/// Width of the cube covered by the Morton hash, in cells per axis.
pub const MORTON_EXTENT: i32 = 1024;

/// Z-order hash used by device kernels.
///
/// Cells are shifted by half the extent and wrapped to 10 bits per axis, so
/// the hash repeats every 1024 cells. Wrapped cells collide and are separated
/// by the distance test like any other collision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MortonCellHash;

/// Spread the low 10 bits of `v` so two zero bits separate each pair.
#[inline]
pub fn spread_bits(v: u32) -> u32 {
    let mut x = v & 0x3ff;
    x = (x | (x << 16)) & 0x0300_00ff;
    x = (x | (x << 8)) & 0x0300_f00f;
    x = (x | (x << 4)) & 0x030c_30c3;
    x = (x | (x << 2)) & 0x0924_9249;
    x
}

impl CellHash for MortonCellHash {
    const NAME: &'static str = "morton";

    #[inline]
    fn hash_cell(&self, cell: IVec3) -> u32 {
        let half = MORTON_EXTENT / 2;
        let mask = MORTON_EXTENT - 1;
        let x = ((cell.x + half) & mask) as u32;
        let y = ((cell.y + half) & mask) as u32;
        let z = ((cell.z + half) & mask) as u32;
        spread_bits(x) | (spread_bits(y) << 1) | (spread_bits(z) << 2)
    }
}

/// Cell hash reduced to a fixed table size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridHasher<H: CellHash> {
    hash: H,
    cell_size: f32,
    table_size: u32,
}

impl<H: CellHash> GridHasher<H> {
    /// Create a hasher for cells of `cell_size` and `table_size` buckets.
    pub fn new(hash: H, cell_size: f32, table_size: u32) -> Self {
        debug_assert!(cell_size > 0.0);
        debug_assert!(table_size > 0);
        Self {
            hash,
            cell_size,
            table_size,
        }
    }

    /// Number of buckets.
    pub fn table_size(&self) -> u32 {
        self.table_size
    }

    /// Edge length of a grid cell.
    pub fn cell_size(&self) -> f32 {
        self.cell_size
    }

    /// Bucket of an integer cell.
    #[inline]
    pub fn bucket_of_cell(&self, cell: IVec3) -> u32 {
        self.hash.hash_cell(cell) % self.table_size
    }

    /// Bucket of the cell containing `position`.
    #[inline]
    pub fn bucket_of(&self, position: Vec3) -> u32 {
        self.bucket_of_cell(cell_of(position, self.cell_size))
    }

    /// Distinct buckets of the 3x3x3 block of cells centered on `position`.
    pub fn neighbor_buckets(&self, position: Vec3) -> NeighborBuckets {
        let center = cell_of(position, self.cell_size);
        let mut out = NeighborBuckets::default();
        for dz in -1..=1 {
            for dy in -1..=1 {
                for dx in -1..=1 {
                    out.insert(self.bucket_of_cell(center + IVec3::new(dx, dy, dz)));
                }
            }
        }
        out
    }
}

/// Up to 27 distinct bucket ids.
///
/// Two cells of the neighborhood may hash to the same bucket; keeping each
/// bucket once prevents counting the particles in it twice.
#[derive(Debug, Clone, Copy)]
pub struct NeighborBuckets {
    buckets: [u32; 27],
    len: usize,
}

impl Default for NeighborBuckets {
    fn default() -> Self {
        Self {
            buckets: [0; 27],
            len: 0,
        }
    }
}

impl NeighborBuckets {
    #[inline]
    fn insert(&mut self, bucket: u32) {
        if !self.buckets[..self.len].contains(&bucket) {
            self.buckets[self.len] = bucket;
            self.len += 1;
        }
    }

    /// Number of distinct buckets.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always false: the center cell's bucket is present.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The distinct buckets.
    pub fn as_slice(&self) -> &[u32] {
        &self.buckets[..self.len]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_floors_negative_coordinates() {
        assert_eq!(cell_of(Vec3::new(-0.1, 0.0, 1.9), 1.0), IVec3::new(-1, 0, 1));
        assert_eq!(cell_of(Vec3::new(0.25, 0.5, -0.5), 0.25), IVec3::new(1, 2, -2));
    }

    #[test]
    fn xor_hash_uses_the_three_primes() {
        let h = XorCellHash.hash_cell(IVec3::new(1, 1, 1));
        assert_eq!(h, 73_856_093 ^ 19_349_663 ^ 83_492_791);
        assert_eq!(XorCellHash.hash_cell(IVec3::ZERO), 0);
    }

    #[test]
    fn spread_bits_interleaves() {
        assert_eq!(spread_bits(0b1), 0b1);
        assert_eq!(spread_bits(0b11), 0b1001);
        assert_eq!(spread_bits(0x3ff), 0x0924_9249);
    }

    #[test]
    fn morton_hash_is_centered() {
        // Cell (-512, -512, -512) maps to the cube corner.
        assert_eq!(MortonCellHash.hash_cell(IVec3::splat(-512)), 0);
        let origin = MortonCellHash.hash_cell(IVec3::ZERO);
        assert_eq!(origin, spread_bits(512) * 0b111);
    }

    #[test]
    fn morton_hash_wraps_every_extent() {
        let a = MortonCellHash.hash_cell(IVec3::new(3, -7, 100));
        let b = MortonCellHash.hash_cell(IVec3::new(3 + MORTON_EXTENT, -7, 100 - MORTON_EXTENT));
        assert_eq!(a, b);
    }

    #[test]
    fn hashes_disagree_for_same_cell() {
        let cell = IVec3::new(4, 5, 6);
        assert_ne!(XorCellHash.hash_cell(cell), MortonCellHash.hash_cell(cell));
    }

    #[test]
    fn neighbor_buckets_are_distinct() {
        let grid = GridHasher::new(XorCellHash, 1.0, 5);
        let buckets = grid.neighbor_buckets(Vec3::new(0.5, 0.5, 0.5));
        assert!(buckets.len() <= 5);
        let mut sorted = buckets.as_slice().to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), buckets.len());
    }

    #[test]
    fn large_table_yields_27_buckets() {
        let grid = GridHasher::new(MortonCellHash, 1.0, 1 << 30);
        assert_eq!(grid.neighbor_buckets(Vec3::splat(2.5)).len(), 27);
    }
}
