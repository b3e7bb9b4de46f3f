//! Buffers and constants shared by the pressure and dynamics passes.
//!
//! Both passes iterate over bucket *slots* rather than particle indices:
//! slot `k` processes input particle `map[k]`. Output goes to slot `k` when
//! reordering (the output generation ends up in bucket order) and to the
//! particle's own index otherwise.

use crate::hashing::{CellHash, GridHasher};
use crate::particle::{DynamicView, StaticView};
use crate::smoothing::KernelConstants;
use crate::spatial_hash::BucketIndex;

/// Static boundary particles and their bucket index.
#[derive(Debug, Clone, Copy)]
pub struct StaticNeighbors<'a, H: CellHash> {
    /// Static positions.
    pub particles: StaticView<'a>,
    /// Static bucket index.
    pub index: BucketIndex<'a>,
    /// Hasher the static index was built with.
    pub grid: &'a GridHasher<H>,
}

/// Everything a pass reads and writes for one step.
#[derive(Debug, Clone, Copy)]
pub struct PassContext<'a, H: CellHash> {
    /// Precomputed kernel constants.
    pub constants: &'a KernelConstants,
    /// Dynamic hasher; also used for the next-step hash.
    pub grid: &'a GridHasher<H>,
    /// Read-locked generation.
    pub input: DynamicView<'a>,
    /// Write-locked generation.
    pub output: DynamicView<'a>,
    /// Dynamic bucket index over `input`.
    pub index: BucketIndex<'a>,
    /// Boundary particles, if any.
    pub statics: Option<StaticNeighbors<'a, H>>,
    /// Whether output records are placed in slot order.
    pub reorder: bool,
}

impl<H: CellHash> PassContext<'_, H> {
    /// Number of dynamic particles.
    pub fn particle_count(&self) -> usize {
        self.index.particle_count()
    }

    /// Output index for the particle processed in `slot`.
    #[inline]
    pub fn output_index(&self, slot: usize) -> usize {
        if self.reorder {
            slot
        } else {
            self.index.particle(slot)
        }
    }
}
