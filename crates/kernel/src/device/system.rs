//! Particle system driving a [`ComputeDevice`] through event chains.
//!
//! A step never blocks the caller. It is enqueued as a chain of kernels whose
//! wait-lists encode every dependency:
//!
//! ```text
//! read wait-list ─┬─ [clear, count]   (first step only)
//!                 └─ scan blocks ─ scan partials ─ add offsets ─ scatter ─┐
//! write wait-list ──────────────────────────────────────────────── pressure ─┐
//! previous dynamics ─ clear next counters ───────────────────────────────── barrier ─ dynamics
//! ```
//!
//! The dynamics event releases both generation intents, so renderers and
//! later steps order themselves against it. At most
//! [`MAX_STEPS_IN_FLIGHT`] steps are outstanding.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use super::{ComputeDevice, DeviceStorage, Kernel, KernelLaunch, PassBindings, SimUniforms};
use crate::boundary::BoxBoundary;
use crate::buffers::{DynamicRenderLock, Generation, ParticleBufferSet, StaticParticleSet, StaticRenderLock};
use crate::dynamics::DegeneracyLog;
use crate::error::SystemError;
use crate::hashing::{GridHasher, MortonCellHash};
use crate::params::{hash_table_size, ParticleBehaviourParameters};
use crate::particle::{DynamicParticle, StaticParticle, DYNAMIC_WORDS, STATIC_WORDS};
use crate::smoothing::KernelConstants;
use crate::spatial_hash::SpatialHash;
use crate::sync::{Event, EventTicketLock, DEFAULT_TICKET_CAPACITY};
use crate::{ParticleCounts, ParticleSystem, ProfilingData, StepOutcome};

/// Steps that may be enqueued but not yet complete.
pub const MAX_STEPS_IN_FLIGHT: usize = 3;

/// Device back-end settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Buffer generations, 2 or 3.
    pub generations: usize,
    /// Store output particles in bucket order.
    pub reorder: bool,
    /// Intent queue capacity of each generation lock.
    pub ticket_capacity: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            generations: 3,
            reorder: false,
            ticket_capacity: DEFAULT_TICKET_CAPACITY,
        }
    }
}

struct DeviceState<D: ComputeDevice> {
    buffers: ParticleBufferSet<DeviceStorage<D>, EventTicketLock>,
    statics: StaticParticleSet,
    uniforms: SimUniforms,
    /// Bucket counters; one array indexes the step while the other is counted.
    counters: [D::Buffer; 2],
    active: usize,
    primed: bool,
    map: D::Buffer,
    partials: D::Buffer,
    diagnostics: D::Buffer,
    static_particles: D::Buffer,
    static_map: D::Buffer,
    static_counters: D::Buffer,
    in_flight: VecDeque<Event>,
    previous_dynamics: Option<Event>,
    completed: Arc<AtomicU64>,
    degeneracy: DegeneracyLog,
    /// Diagnostics word value already passed to `degeneracy`.
    degenerate_seen: u32,
}

impl<D: ComputeDevice> DeviceState<D> {
    fn retire(&mut self) {
        while self.in_flight.front().is_some_and(Event::is_complete) {
            self.in_flight.pop_front();
        }
    }

    fn wait_all(&mut self) {
        while let Some(event) = self.in_flight.pop_front() {
            event.wait();
        }
    }

    /// Enqueue one step of `dt`.
    fn submit(&mut self, device: &D, dt: f32) -> Result<(), SystemError> {
        let input = self.buffers.current();
        let output = self.buffers.next();
        let read = input.sync().acquire_read().ok_or(SystemError::LockQueueFull)?;
        let Some(write) = output.sync().acquire_write() else {
            input.sync().release(read.ticket, &Event::signaled());
            return Err(SystemError::LockQueueFull);
        };
        output.invalidate_snapshot();

        let u = self.uniforms.with_dt(dt);
        let n = u.particle_count;
        let counter_words = u.table_size + 1;
        let counters = self.counters[self.active].clone();
        let next_counters = self.counters[1 - self.active].clone();
        let particles = input.storage().buffer().clone();
        let launch = |kernel, work_items| KernelLaunch {
            kernel,
            work_items,
            uniforms: u,
        };

        // -- bucket index --
        let counted = if self.primed {
            device.enqueue_barrier(&read.wait_list)
        } else {
            let cleared = device.enqueue_kernel(
                launch(Kernel::Fill { buffer: counters.clone(), value: 0 }, counter_words),
                &read.wait_list,
            );
            device.enqueue_kernel(
                launch(
                    Kernel::CountHashes {
                        particles: particles.clone(),
                        counters: counters.clone(),
                    },
                    n,
                ),
                &[cleared],
            )
        };
        let scanned = device.enqueue_kernel(
            launch(
                Kernel::ScanBlocks {
                    counters: counters.clone(),
                    partials: self.partials.clone(),
                },
                u.block_count,
            ),
            &[counted],
        );
        let totals = device.enqueue_kernel(
            launch(Kernel::ScanPartials { partials: self.partials.clone() }, 1),
            &[scanned],
        );
        let offsets = device.enqueue_kernel(
            launch(
                Kernel::AddBlockOffsets {
                    counters: counters.clone(),
                    partials: self.partials.clone(),
                },
                counter_words,
            ),
            &[totals],
        );
        let scattered = device.enqueue_kernel(
            launch(
                Kernel::Scatter {
                    particles: particles.clone(),
                    counters: counters.clone(),
                    map: self.map.clone(),
                },
                n,
            ),
            &[offsets],
        );
        // The previous step still indexes with what is now the next array.
        let next_cleared = device.enqueue_kernel(
            launch(Kernel::Fill { buffer: next_counters.clone(), value: 0 }, counter_words),
            self.previous_dynamics.as_slice(),
        );

        // -- passes --
        let bindings = PassBindings {
            input: particles,
            output: output.storage().buffer().clone(),
            map: self.map.clone(),
            counters,
            static_particles: self.static_particles.clone(),
            static_map: self.static_map.clone(),
            static_counters: self.static_counters.clone(),
        };
        let mut pressure_wait = write.wait_list;
        pressure_wait.push(scattered);
        let pressured = device.enqueue_kernel(launch(Kernel::Pressure(bindings.clone()), n), &pressure_wait);
        let settled = device.enqueue_barrier(&[pressured, next_cleared]);
        let dynamics = device.enqueue_kernel(
            launch(
                Kernel::Dynamics {
                    pass: bindings,
                    next_counters,
                    diagnostics: self.diagnostics.clone(),
                },
                n,
            ),
            &[settled],
        );

        input.sync().release(read.ticket, &dynamics);
        output.sync().release(write.ticket, &dynamics);
        self.buffers.advance();
        self.active = 1 - self.active;
        self.primed = true;
        self.previous_dynamics = Some(dynamics.clone());
        let completed = self.completed.clone();
        dynamics.on_complete(move || {
            completed.fetch_add(1, Ordering::Relaxed);
        });
        self.in_flight.push_back(dynamics);
        device.flush();
        Ok(())
    }

    /// Fold new coincident-pair counts from the device into the log.
    fn collect_diagnostics(&mut self, device: &D) -> Result<(), SystemError> {
        let words = device.read_buffer(&self.diagnostics, 1)?;
        let total = words.first().copied().unwrap_or(0);
        if total > self.degenerate_seen {
            self.degeneracy.record(u64::from(total - self.degenerate_seen));
            self.degenerate_seen = total;
        }
        Ok(())
    }
}

/// SPH system running on a compute device.
pub struct DeviceSystem<D: ComputeDevice> {
    device: Arc<D>,
    config: DeviceConfig,
    state: Option<DeviceState<D>>,
    skipped: u64,
}

impl<D: ComputeDevice> std::fmt::Debug for DeviceSystem<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSystem")
            .field("device", &self.device.name())
            .field("config", &self.config)
            .field("initialized", &self.state.is_some())
            .finish()
    }
}

impl<D: ComputeDevice> DeviceSystem<D> {
    /// Uninitialized system on `device`.
    pub fn new(device: D, config: DeviceConfig) -> Self {
        Self {
            device: Arc::new(device),
            config,
            state: None,
            skipped: 0,
        }
    }

    /// The device.
    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    /// Settings in use.
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    fn state(&self) -> Result<&DeviceState<D>, SystemError> {
        self.state.as_ref().ok_or(SystemError::NotInitialized)
    }

    fn state_mut(&mut self) -> Result<&mut DeviceState<D>, SystemError> {
        self.state.as_mut().ok_or(SystemError::NotInitialized)
    }

    fn upload(&self, words: &[u32], label: &str) -> Result<D::Buffer, SystemError> {
        let buffer = self.device.create_buffer(words.len(), label)?;
        self.device.write_buffer(&buffer, words)?;
        Ok(buffer)
    }
}

impl<D: ComputeDevice> ParticleSystem for DeviceSystem<D> {
    fn name(&self) -> &'static str {
        self.device.name()
    }

    fn initialize(
        &mut self,
        dynamic: Vec<DynamicParticle>,
        statics: Vec<StaticParticle>,
        params: &ParticleBehaviourParameters,
    ) -> Result<(), SystemError> {
        params.validate().map_err(SystemError::InvalidParameters)?;
        if dynamic.is_empty() {
            return Err(SystemError::EmptyParticleSet);
        }
        self.clear();

        let n = dynamic.len();
        let constants = KernelConstants::new(params);
        let table_size = hash_table_size(n, params.dynamic_table_factor());
        let grid = GridHasher::new(MortonCellHash, constants.h, table_size);

        let mut initial = dynamic;
        for p in &mut initial {
            p.hash = grid.bucket_of(p.position);
        }
        let mut generations = Vec::with_capacity(self.config.generations);
        for g in 0..self.config.generations {
            let buffer = if g == 0 {
                self.upload(bytemuck::cast_slice(&initial), "particles-0")?
            } else {
                self.device.create_buffer(n * DYNAMIC_WORDS, &format!("particles-{g}"))?
            };
            generations.push(Generation::new(
                DeviceStorage::new(self.device.clone(), buffer),
                EventTicketLock::new(self.config.ticket_capacity),
            ));
        }
        let buffers = ParticleBufferSet::new(generations, n)?;

        // Static index is built once on the host and uploaded.
        let (static_particles, static_map, static_counters, static_table_size) = if statics.is_empty() {
            (
                self.device.create_buffer(STATIC_WORDS, "static-particles")?,
                self.device.create_buffer(1, "static-map")?,
                self.device.create_buffer(2, "static-counters")?,
                1,
            )
        } else {
            let size = hash_table_size(statics.len(), params.static_table_factor());
            let hash = SpatialHash::build(
                GridHasher::new(MortonCellHash, constants.h, size),
                statics.len(),
                |i| statics[i].position,
            );
            (
                self.upload(bytemuck::cast_slice(&statics), "static-particles")?,
                self.upload(&hash.map().to_vec(), "static-map")?,
                self.upload(&hash.counters().to_vec(), "static-counters")?,
                size,
            )
        };

        let uniforms = SimUniforms::new(
            &constants,
            &BoxBoundary::from_params(params),
            n as u32,
            table_size,
            statics.len() as u32,
            static_table_size,
            self.config.reorder,
        );
        let counter_words = table_size as usize + 1;
        let state = DeviceState {
            buffers,
            statics: StaticParticleSet::new(statics),
            uniforms,
            counters: [
                self.device.create_buffer(counter_words, "counters-0")?,
                self.device.create_buffer(counter_words, "counters-1")?,
            ],
            active: 0,
            primed: false,
            map: self.device.create_buffer(n, "map")?,
            partials: self.device.create_buffer(uniforms.block_count as usize, "scan-partials")?,
            diagnostics: self.device.create_buffer(1, "diagnostics")?,
            static_particles,
            static_map,
            static_counters,
            in_flight: VecDeque::with_capacity(MAX_STEPS_IN_FLIGHT),
            previous_dynamics: None,
            completed: Arc::new(AtomicU64::new(0)),
            degeneracy: DegeneracyLog::new(),
            degenerate_seen: 0,
        };
        self.skipped = 0;
        info!(
            device = self.device.name(),
            particles = n,
            statics = state.statics.len(),
            generations = self.config.generations,
            table_size,
            reorder = self.config.reorder,
            "device particle system initialized"
        );
        self.state = Some(state);
        Ok(())
    }

    fn update(&mut self, dt: f32) -> Result<StepOutcome, SystemError> {
        let device = self.device.clone();
        let state = self.state_mut()?;
        state.retire();
        let outcome = if state.in_flight.len() >= MAX_STEPS_IN_FLIGHT {
            StepOutcome::Skipped
        } else {
            match state.submit(&device, dt) {
                Ok(()) => StepOutcome::Enqueued,
                Err(SystemError::LockQueueFull) => StepOutcome::Skipped,
                Err(e) => return Err(e),
            }
        };
        if outcome == StepOutcome::Skipped {
            self.skipped += 1;
            debug!(skipped = self.skipped, "device behind, update skipped");
        }
        Ok(outcome)
    }

    fn step(&mut self, dt: f32) -> Result<(), SystemError> {
        let device = self.device.clone();
        let state = self.state_mut()?;
        state.retire();
        while state.in_flight.len() >= MAX_STEPS_IN_FLIGHT {
            if let Some(oldest) = state.in_flight.front() {
                oldest.wait();
            }
            state.retire();
        }
        state.submit(&device, dt)
    }

    fn synchronize(&mut self) -> Result<(), SystemError> {
        let device = self.device.clone();
        let state = self.state_mut()?;
        device.flush();
        state.wait_all();
        state.collect_diagnostics(&device)
    }

    fn clear(&mut self) {
        let device = self.device.clone();
        if let Some(mut state) = self.state.take() {
            device.flush();
            state.wait_all();
            if let Err(e) = state.collect_diagnostics(&device) {
                debug!(error = %e, "diagnostics unavailable at clear");
            }
            info!(
                device = device.name(),
                steps = state.completed.load(Ordering::Relaxed),
                degenerate_pairs = state.degeneracy.total(),
                "device particle system cleared"
            );
        }
    }

    fn particle_counts(&self) -> ParticleCounts {
        self.state
            .as_ref()
            .map(|s| ParticleCounts {
                dynamic_count: s.buffers.particle_count(),
                static_count: s.statics.len(),
            })
            .unwrap_or_default()
    }

    /// Degenerate pairs are collected from the device on `synchronize`.
    fn profiling_data(&self) -> ProfilingData {
        let mut data = ProfilingData {
            backend: self.name().to_string(),
            skipped_updates: self.skipped,
            ..Default::default()
        };
        if let Some(state) = &self.state {
            data.completed_steps = state.completed.load(Ordering::Relaxed);
            data.degenerate_pairs = state.degeneracy.total();
            data.last_step = self.device.last_timings().unwrap_or_default();
        }
        data
    }

    fn lock_dynamic_particles_for_rendering(&self) -> Result<DynamicRenderLock, SystemError> {
        let state = self.state()?;
        self.device.flush();
        state.buffers.lock_for_rendering()
    }

    fn lock_static_particles_for_rendering(&self) -> Result<StaticRenderLock, SystemError> {
        Ok(self.state()?.statics.lock_for_rendering())
    }

    fn prepare_dynamic_for_rendering(&self) -> Result<(), SystemError> {
        let state = self.state()?;
        self.device.flush();
        state.buffers.prepare_for_rendering()
    }
}

impl<D: ComputeDevice> Drop for DeviceSystem<D> {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::HostDevice;
    use glam::Vec3;

    fn params() -> ParticleBehaviourParameters {
        let mut p = ParticleBehaviourParameters {
            particle_mass: 1.0,
            gas_constant: 1.0,
            rest_density: 0.0,
            viscosity: 0.1,
            interaction_radius: 1.0,
            gravity: Vec3::ZERO,
            ..Default::default()
        };
        p.extra.insert("bounded", false);
        p
    }

    fn lattice(n: usize, spacing: f32) -> Vec<DynamicParticle> {
        (0..n)
            .map(|i| {
                let p = Vec3::new((i % 4) as f32, ((i / 4) % 4) as f32, (i / 16) as f32) * spacing;
                DynamicParticle::new(p, Vec3::ZERO)
            })
            .collect()
    }

    fn system(config: DeviceConfig) -> DeviceSystem<HostDevice> {
        DeviceSystem::new(HostDevice::new().unwrap(), config)
    }

    #[test]
    fn uninitialized_system_reports_errors() {
        let mut sys = system(DeviceConfig::default());
        assert_eq!(sys.update(0.01), Err(SystemError::NotInitialized));
        assert_eq!(sys.synchronize(), Err(SystemError::NotInitialized));
        assert_eq!(sys.name(), "host-device");
    }

    #[test]
    fn rejects_unsupported_generation_count() {
        let mut sys = system(DeviceConfig {
            generations: 4,
            ..Default::default()
        });
        assert!(matches!(
            sys.initialize(lattice(4, 0.5), vec![], &params()),
            Err(SystemError::InvalidParameters(_))
        ));
    }

    #[test]
    fn steps_complete_and_release_every_intent() {
        let mut sys = system(DeviceConfig::default());
        sys.initialize(lattice(40, 0.3), vec![], &params()).unwrap();
        for _ in 0..8 {
            sys.step(0.001).unwrap();
        }
        sys.synchronize().unwrap();
        let profile = sys.profiling_data();
        assert_eq!(profile.completed_steps, 8);
        assert!(profile.last_step.total_us >= profile.last_step.dynamics_us);
        let state = sys.state().unwrap();
        for g in 0..state.buffers.generation_count() {
            assert_eq!(state.buffers.generation(g).sync().outstanding(), 0);
        }
        let guard = sys.lock_dynamic_particles_for_rendering().unwrap();
        assert_eq!(guard.len(), 40);
        assert!(guard.iter().all(|p| p.position.is_finite()));
    }

    #[test]
    fn held_render_lock_backs_up_updates() {
        let mut sys = system(DeviceConfig {
            generations: 2,
            ..Default::default()
        });
        sys.initialize(lattice(16, 0.4), vec![], &params()).unwrap();
        let guard = sys.lock_dynamic_particles_for_rendering().unwrap();
        let outcomes: Vec<_> = (0..6).map(|_| sys.update(0.001).unwrap()).collect();
        assert!(outcomes.contains(&StepOutcome::Skipped));
        drop(guard);
        sys.synchronize().unwrap();
        let enqueued = outcomes.iter().filter(|o| **o == StepOutcome::Enqueued).count();
        let profile = sys.profiling_data();
        assert_eq!(profile.completed_steps, enqueued as u64);
        assert_eq!(profile.skipped_updates, (6 - enqueued) as u64);
    }

    #[test]
    fn coincident_particles_are_collected_on_synchronize() {
        let mut sys = system(DeviceConfig::default());
        let pair = vec![
            DynamicParticle::new(Vec3::splat(0.5), Vec3::ZERO),
            DynamicParticle::new(Vec3::splat(0.5), Vec3::ZERO),
        ];
        sys.initialize(pair, vec![], &params()).unwrap();
        sys.step(0.01).unwrap();
        sys.synchronize().unwrap();
        assert_eq!(sys.profiling_data().degenerate_pairs, 2);
        let guard = sys.lock_dynamic_particles_for_rendering().unwrap();
        assert!(guard.iter().all(|p| p.position.is_finite()));
        assert_ne!(guard[0].position, guard[1].position);
    }

    #[test]
    fn static_particles_push_back() {
        let mut sys = system(DeviceConfig::default());
        let statics = vec![StaticParticle::new(Vec3::new(0.5, 0.5, 0.0))];
        let fluid = vec![DynamicParticle::new(Vec3::new(0.5, 0.5, 0.4), Vec3::ZERO)];
        sys.initialize(fluid, statics, &params()).unwrap();
        sys.step(0.01).unwrap();
        sys.synchronize().unwrap();
        let guard = sys.lock_dynamic_particles_for_rendering().unwrap();
        assert!(guard[0].velocity.z > 0.0);
        assert_eq!(sys.lock_static_particles_for_rendering().unwrap().len(), 1);
    }
}
