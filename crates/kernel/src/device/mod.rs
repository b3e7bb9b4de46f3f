//! Compute device abstraction and the event-driven device system.
//!
//! The core only needs two things from a device:
//!
//! - enqueue a kernel over N work-items, with its buffers and a wait-list,
//!   and get back a completion [`Event`];
//! - enqueue a barrier that completes once a set of events has.
//!
//! Kernels are described by the closed [`Kernel`] enum rather than by source
//! handles, so a device is free to implement them natively ([`HostDevice`])
//! or with shaders (`WgpuDevice`, feature `gpu`).
//!
//! Device kernels hash cells with the Morton hash.

mod host;
mod system;

pub use host::{HostBuffer, HostDevice};
pub use system::{DeviceConfig, DeviceSystem, MAX_STEPS_IN_FLIGHT};

use bytemuck::{Pod, Zeroable};
use glam::Vec3;

use crate::boundary::BoxBoundary;
use crate::buffers::ParticleStorage;
use crate::error::SystemError;
use crate::particle::{DynamicParticle, DYNAMIC_WORDS};
use crate::smoothing::KernelConstants;
use crate::sync::Event;
use crate::PassTimings;

/// Counters handled by one scan block.
pub const SCAN_BLOCK: u32 = 256;

/// Uniform flag: box boundary enabled.
pub const FLAG_BOUNDED: u32 = 1;
/// Uniform flag: box roof enabled.
pub const FLAG_ROOF: u32 = 2;
/// Uniform flag: output in slot order.
pub const FLAG_REORDER: u32 = 4;

/// Scalars shared by every kernel of a step.
///
/// Layout matches the `SimUniforms` struct of the device shaders: seven
/// 16-byte rows.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct SimUniforms {
    /// Dynamic particles N.
    pub particle_count: u32,
    /// Dynamic hash table size M.
    pub table_size: u32,
    /// Static particles.
    pub static_count: u32,
    /// Static hash table size.
    pub static_table_size: u32,
    /// Interaction radius h.
    pub h: f32,
    /// h squared.
    pub h_sq: f32,
    /// Kernel normalization.
    pub norm: f32,
    /// Particle mass.
    pub mass: f32,
    /// Self density contribution.
    pub self_density: f32,
    /// Equation-of-state stiffness.
    pub gas_constant: f32,
    /// Rest density.
    pub rest_density: f32,
    /// Viscosity coefficient.
    pub viscosity: f32,
    /// Gravity.
    pub gravity: [f32; 3],
    /// Time step.
    pub dt: f32,
    /// Box minimum corner.
    pub bounds_min: [f32; 3],
    /// Fraction of normal velocity kept on a wall hit.
    pub wall_elasticity: f32,
    /// Box maximum corner.
    pub bounds_max: [f32; 3],
    /// `FLAG_*` bits.
    pub flags: u32,
    /// Scan block count, `ceil((M + 1) / SCAN_BLOCK)`.
    pub block_count: u32,
    /// Work-items of the launch; set by the device.
    pub work_items: u32,
    /// Fill word of a `Fill` launch; set by the device.
    pub fill_value: u32,
    /// Padding.
    pub _pad: u32,
}

impl SimUniforms {
    /// Uniforms for a system; `dt` is filled in per step.
    pub fn new(
        constants: &KernelConstants,
        boundary: &BoxBoundary,
        particle_count: u32,
        table_size: u32,
        static_count: u32,
        static_table_size: u32,
        reorder: bool,
    ) -> Self {
        let mut flags = 0;
        if boundary.enabled {
            flags |= FLAG_BOUNDED;
        }
        if boundary.roof {
            flags |= FLAG_ROOF;
        }
        if reorder {
            flags |= FLAG_REORDER;
        }
        Self {
            particle_count,
            table_size,
            static_count,
            static_table_size,
            h: constants.h,
            h_sq: constants.h_sq,
            norm: constants.norm,
            mass: constants.mass,
            self_density: constants.self_density,
            gas_constant: constants.gas_constant,
            rest_density: constants.rest_density,
            viscosity: constants.viscosity,
            gravity: constants.gravity.to_array(),
            dt: 0.0,
            bounds_min: boundary.min.to_array(),
            wall_elasticity: boundary.wall_elasticity,
            bounds_max: boundary.max.to_array(),
            flags,
            block_count: (table_size + 1).div_ceil(SCAN_BLOCK),
            work_items: 0,
            fill_value: 0,
            _pad: 0,
        }
    }

    /// Copy with time step `dt`.
    pub fn with_dt(mut self, dt: f32) -> Self {
        self.dt = dt;
        self
    }

    /// Kernel constants encoded in the uniforms.
    pub fn constants(&self) -> KernelConstants {
        KernelConstants {
            h: self.h,
            h_sq: self.h_sq,
            norm: self.norm,
            mass: self.mass,
            self_density: self.self_density,
            gas_constant: self.gas_constant,
            rest_density: self.rest_density,
            viscosity: self.viscosity,
            gravity: Vec3::from_array(self.gravity),
        }
    }

    /// Box boundary encoded in the uniforms.
    pub fn boundary(&self) -> BoxBoundary {
        BoxBoundary {
            min: Vec3::from_array(self.bounds_min),
            max: Vec3::from_array(self.bounds_max),
            enabled: self.flags & FLAG_BOUNDED != 0,
            roof: self.flags & FLAG_ROOF != 0,
            wall_elasticity: self.wall_elasticity,
        }
    }

    /// Whether outputs are stored in slot order.
    pub fn reorder(&self) -> bool {
        self.flags & FLAG_REORDER != 0
    }
}

/// Buffers read and written by the pressure and dynamics kernels.
#[derive(Debug, Clone)]
pub struct PassBindings<B> {
    /// Read generation.
    pub input: B,
    /// Write generation.
    pub output: B,
    /// Dynamic particle map.
    pub map: B,
    /// Dynamic bucket starts (`M + 1`).
    pub counters: B,
    /// Static particles (at least one record, even when there are none).
    pub static_particles: B,
    /// Static particle map.
    pub static_map: B,
    /// Static bucket starts.
    pub static_counters: B,
}

/// Kernels a device must provide.
#[derive(Debug, Clone)]
pub enum Kernel<B> {
    /// `buffer[i] = value` for every work-item `i`.
    Fill {
        /// Target buffer.
        buffer: B,
        /// Fill word.
        value: u32,
    },
    /// `counters[particles[i].hash] += 1`.
    CountHashes {
        /// Particles with valid hashes.
        particles: B,
        /// `M + 1` counters.
        counters: B,
    },
    /// Inclusive scan inside each block of [`SCAN_BLOCK`] counters; block
    /// totals go to `partials`. One work-item per block.
    ScanBlocks {
        /// Counters scanned in place.
        counters: B,
        /// One total per block.
        partials: B,
    },
    /// Inclusive scan of the block totals. One work-item.
    ScanPartials {
        /// Block totals scanned in place.
        partials: B,
    },
    /// Add the running total of all lower blocks to every counter.
    AddBlockOffsets {
        /// Counters.
        counters: B,
        /// Scanned block totals.
        partials: B,
    },
    /// `map[--counters[hash]] = i`.
    Scatter {
        /// Particles with valid hashes.
        particles: B,
        /// Scanned counters.
        counters: B,
        /// Particle map.
        map: B,
    },
    /// Density summation and equation of state.
    Pressure(PassBindings<B>),
    /// Forces, integration, boundary and next-step counting.
    Dynamics {
        /// Pass buffers.
        pass: PassBindings<B>,
        /// Zeroed counters for the next step.
        next_counters: B,
        /// `[0]` accumulates coincident pairs.
        diagnostics: B,
    },
}

/// Coarse stage a kernel belongs to, for timings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelStage {
    /// Bucket index construction.
    HashBuild,
    /// Pressure pass.
    Pressure,
    /// Dynamics pass.
    Dynamics,
}

impl<B> Kernel<B> {
    /// Entry point name.
    pub fn name(&self) -> &'static str {
        match self {
            Kernel::Fill { .. } => "fill",
            Kernel::CountHashes { .. } => "count_hashes",
            Kernel::ScanBlocks { .. } => "scan_blocks",
            Kernel::ScanPartials { .. } => "scan_partials",
            Kernel::AddBlockOffsets { .. } => "add_block_offsets",
            Kernel::Scatter { .. } => "scatter",
            Kernel::Pressure(_) => "pressure",
            Kernel::Dynamics { .. } => "dynamics",
        }
    }

    /// Stage for timings.
    pub fn stage(&self) -> KernelStage {
        match self {
            Kernel::Pressure(_) => KernelStage::Pressure,
            Kernel::Dynamics { .. } => KernelStage::Dynamics,
            _ => KernelStage::HashBuild,
        }
    }
}

/// Per-stage wall-clock accumulator. A step closes when its dynamics kernel
/// finishes.
#[derive(Debug, Default)]
pub(crate) struct StageClock {
    current: PassTimings,
    last: Option<PassTimings>,
}

impl StageClock {
    pub(crate) fn record(&mut self, stage: KernelStage, elapsed: std::time::Duration) {
        let us = elapsed.as_micros() as u64;
        match stage {
            KernelStage::HashBuild => self.current.hash_build_us += us,
            KernelStage::Pressure => self.current.pressure_us += us,
            KernelStage::Dynamics => {
                self.current.dynamics_us += us;
                let mut done = std::mem::take(&mut self.current);
                done.total_us = done.hash_build_us + done.pressure_us + done.dynamics_us;
                self.last = Some(done);
            }
        }
    }

    pub(crate) fn last(&self) -> Option<PassTimings> {
        self.last
    }
}

/// One kernel enqueue.
#[derive(Debug, Clone)]
pub struct KernelLaunch<B> {
    /// Kernel and its buffers.
    pub kernel: Kernel<B>,
    /// Number of work-items.
    pub work_items: u32,
    /// Step scalars.
    pub uniforms: SimUniforms,
}

/// Asynchronous compute device.
///
/// Kernels may run as soon as their wait-list has completed; the device gives
/// no other ordering guarantee to callers.
pub trait ComputeDevice: Send + Sync + 'static {
    /// Handle to a device buffer of 32-bit words.
    type Buffer: Clone + Send + Sync + std::fmt::Debug + 'static;

    /// Device name for logs.
    fn name(&self) -> &'static str;

    /// Zeroed buffer of `words` words (at least one).
    fn create_buffer(&self, words: usize, label: &str) -> Result<Self::Buffer, SystemError>;

    /// Upload `data` to the start of `buffer`.
    ///
    /// Only valid while no enqueued work touches `buffer`.
    fn write_buffer(&self, buffer: &Self::Buffer, data: &[u32]) -> Result<(), SystemError>;

    /// Enqueue a kernel to run after every event in `wait_list`.
    fn enqueue_kernel(&self, launch: KernelLaunch<Self::Buffer>, wait_list: &[Event]) -> Event;

    /// Event completing once every event in `wait_list` has.
    fn enqueue_barrier(&self, wait_list: &[Event]) -> Event;

    /// Blocking copy of the first `words` words of `buffer`.
    ///
    /// The caller must already have waited for every write to `buffer`.
    fn read_buffer(&self, buffer: &Self::Buffer, words: usize) -> Result<Vec<u32>, SystemError>;

    /// Push enqueued work towards execution.
    fn flush(&self);

    /// Stage timings of the most recent completed step, if measured.
    fn last_timings(&self) -> Option<PassTimings> {
        None
    }
}

/// A dynamic generation living in a device buffer.
pub struct DeviceStorage<D: ComputeDevice> {
    device: std::sync::Arc<D>,
    buffer: D::Buffer,
}

impl<D: ComputeDevice> DeviceStorage<D> {
    /// Wrap `buffer` of `device`.
    pub fn new(device: std::sync::Arc<D>, buffer: D::Buffer) -> Self {
        Self { device, buffer }
    }

    /// Device buffer.
    pub fn buffer(&self) -> &D::Buffer {
        &self.buffer
    }
}

impl<D: ComputeDevice> std::fmt::Debug for DeviceStorage<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceStorage")
            .field("device", &self.device.name())
            .field("buffer", &self.buffer)
            .finish()
    }
}

impl<D: ComputeDevice> ParticleStorage for DeviceStorage<D> {
    fn read_particles(&self, count: usize) -> Result<Vec<DynamicParticle>, SystemError> {
        let words = self.device.read_buffer(&self.buffer, count * DYNAMIC_WORDS)?;
        Ok(bytemuck::pod_collect_to_vec(&words))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParticleBehaviourParameters;

    #[test]
    fn uniforms_are_seven_rows() {
        assert_eq!(std::mem::size_of::<SimUniforms>(), 7 * 16);
    }

    #[test]
    fn uniforms_round_trip_constants_and_boundary() {
        let mut params = ParticleBehaviourParameters::default();
        params.extra.insert("boundRoof", true);
        let constants = KernelConstants::new(&params);
        let boundary = BoxBoundary::from_params(&params);
        let u = SimUniforms::new(&constants, &boundary, 10, 21, 0, 1, true).with_dt(0.5);
        assert_eq!(u.constants(), constants);
        assert_eq!(u.boundary(), boundary);
        assert!(u.reorder());
        assert_eq!(u.dt, 0.5);
        assert_eq!(u.block_count, 1);
    }

    #[test]
    fn stage_clock_closes_on_dynamics() {
        use std::time::Duration;
        let mut clock = StageClock::default();
        clock.record(KernelStage::HashBuild, Duration::from_micros(3));
        clock.record(KernelStage::HashBuild, Duration::from_micros(2));
        clock.record(KernelStage::Pressure, Duration::from_micros(10));
        assert_eq!(clock.last(), None);
        clock.record(KernelStage::Dynamics, Duration::from_micros(20));
        let last = clock.last().unwrap();
        assert_eq!(last.hash_build_us, 5);
        assert_eq!(last.total_us, 35);
    }

    #[test]
    fn block_count_covers_all_counters() {
        let c = KernelConstants::new(&ParticleBehaviourParameters::default());
        let b = BoxBoundary::disabled();
        let u = SimUniforms::new(&c, &b, 300, 601, 0, 1, false);
        assert_eq!(u.block_count, 3);
        assert_eq!(u.flags, 0);
    }
}
