//! SPH Fluid Simulation Kernel
//!
//! Smoothed Particle Hydrodynamics engine with two interchangeable execution
//! back-ends: a pool of CPU worker threads running in lock-step, and an
//! event-driven compute device that receives kernel enqueues with wait-lists.
//!
//! Every step runs the same pipeline:
//!
//! 1. **Spatial hash build**: counting sort of particles into hashed grid
//!    buckets (count, prefix sum, scatter).
//! 2. **Pressure pass**: density summation over the 27 surrounding cells and
//!    the equation of state.
//! 3. **Dynamics pass**: pressure and viscosity forces, symplectic Euler
//!    integration, box boundary, and the next step's bucket count.
//!
//! Results are written into rotating buffer generations so rendering can read
//! one generation while the simulation writes another.
//!
//! # Modules
//! - [`smoothing`] -- Spiky kernel terms, normalization and degeneracy tiebreak.
//! - [`hashing`] -- Grid cells, XOR (CPU) and Morton (device) cell hashes.
//! - [`spatial_hash`] -- Counting-sort bucket index.
//! - [`pressure`], [`dynamics`] -- The two per-particle passes.
//! - [`buffers`], [`sync`] -- Buffer generations, render locks, events, locks.
//! - [`scheduler`] -- Lock-step worker pool.
//! - [`cpu`] -- Multi-threaded CPU system.
//! - [`device`] -- Device abstraction, host device and device system.
//! - `gpu` -- wgpu compute device (feature `gpu`).

#![warn(missing_docs)]

pub mod boundary;
pub mod buffers;
pub mod cpu;
pub mod device;
pub mod dynamics;
pub mod eos;
pub mod error;
pub mod hashing;
pub mod params;
pub mod particle;
pub mod pass;
pub mod pressure;
pub mod scheduler;
pub mod smoothing;
pub mod spatial_hash;
pub mod storage;
pub mod sync;

#[cfg(feature = "gpu")]
pub mod gpu;

pub use boundary::BoxBoundary;
pub use buffers::{DynamicRenderLock, StaticRenderLock};
pub use cpu::{CpuConfig, CpuSystem};
pub use device::{ComputeDevice, DeviceConfig, DeviceSystem, HostDevice};
pub use error::SystemError;
pub use hashing::{CellHash, GridHasher, MortonCellHash, XorCellHash};
pub use params::{Bounds, ExtraParameters, ParticleBehaviourParameters};
pub use particle::{DynamicParticle, StaticParticle};
pub use sync::Event;

#[cfg(feature = "gpu")]
pub use gpu::WgpuDevice;

use serde::Serialize;

// ---------------------------------------------------------------------------
// ParticleSystem trait
// ---------------------------------------------------------------------------

/// Number of particles held by a system.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ParticleCounts {
    /// Fluid particles.
    pub dynamic_count: usize,
    /// Boundary particles.
    pub static_count: usize,
}

/// What a non-blocking [`ParticleSystem::update`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// A step was submitted.
    Enqueued,
    /// The system was behind; no step was submitted.
    Skipped,
}

/// Wall-clock breakdown of one step (microseconds).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PassTimings {
    /// Bucket index build: clear + count + prefix sum + scatter.
    pub hash_build_us: u64,
    /// Density summation + equation of state.
    pub pressure_us: u64,
    /// Forces + integration + boundary + next-step count.
    pub dynamics_us: u64,
    /// Whole step, including lock waits.
    pub total_us: u64,
}

/// Counters and timings reported by a system.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProfilingData {
    /// Back-end name.
    pub backend: String,
    /// Steps that ran to completion.
    pub completed_steps: u64,
    /// Updates skipped because too many steps were in flight.
    pub skipped_updates: u64,
    /// Coincident particle pairs resolved by the pseudo-random tiebreak.
    pub degenerate_pairs: u64,
    /// Timings of the most recent completed step.
    pub last_step: PassTimings,
}

/// A particle simulation back-end.
///
/// Rendering and simulation are separate capabilities: a renderer only needs
/// the `lock_*_for_rendering` methods and never drives steps.
pub trait ParticleSystem: Send {
    /// Back-end name used in logs and profiling output.
    fn name(&self) -> &'static str;

    /// Allocate buffers and build the static index. Replaces any previous state.
    fn initialize(
        &mut self,
        dynamic: Vec<DynamicParticle>,
        statics: Vec<StaticParticle>,
        params: &ParticleBehaviourParameters,
    ) -> Result<(), SystemError>;

    /// Submit one step of `dt` unless the system is behind.
    fn update(&mut self, dt: f32) -> Result<StepOutcome, SystemError>;

    /// Submit one step of `dt`, waiting for queue space if needed.
    fn step(&mut self, dt: f32) -> Result<(), SystemError>;

    /// Block until every submitted step has completed.
    fn synchronize(&mut self) -> Result<(), SystemError>;

    /// Wait for outstanding work and release all buffers.
    fn clear(&mut self);

    /// Particle counts; zero when not initialized.
    fn particle_counts(&self) -> ParticleCounts;

    /// Counters and timings.
    fn profiling_data(&self) -> ProfilingData;

    /// Render lock on the latest dynamic generation.
    fn lock_dynamic_particles_for_rendering(&self) -> Result<DynamicRenderLock, SystemError>;

    /// Render lock on the static particles.
    fn lock_static_particles_for_rendering(&self) -> Result<StaticRenderLock, SystemError>;

    /// Build the render snapshot of the latest generation ahead of time.
    fn prepare_dynamic_for_rendering(&self) -> Result<(), SystemError>;
}

/// Elapsed microseconds since `start`.
pub(crate) fn elapsed_us(start: std::time::Instant) -> u64 {
    start.elapsed().as_micros() as u64
}
