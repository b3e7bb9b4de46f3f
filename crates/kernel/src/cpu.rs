//! Multi-threaded CPU particle system.
//!
//! One simulation step is a single task run by every worker of a
//! [`WorkerPool`]. Phases inside the task are separated by barriers:
//!
//! ```text
//! leader: read-lock current, write-lock next
//! | count buckets (first step only; later steps were counted by dynamics)
//! | local scan of own counter range, publish range total
//! | add totals of lower ranges
//! | scatter into particle map, zero next-step counters
//! | pressure pass over own slot range
//! | dynamics pass over own slot range, count next-step buckets
//! leader: unlock, advance generation, swap counter arrays
//! ```
//!
//! Cell hashes use the multiplicative XOR hash.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tracing::{debug, info};

use crate::boundary::BoxBoundary;
use crate::buffers::{
    DynamicRenderLock, Generation, ParticleBufferSet, StaticParticleSet, StaticRenderLock,
};
use crate::dynamics::{self, DegeneracyLog, Integration};
use crate::error::SystemError;
use crate::hashing::{GridHasher, XorCellHash};
use crate::params::{hash_table_size, ParticleBehaviourParameters};
use crate::particle::{DynamicParticle, DynamicView, StaticParticle, StaticView, DYNAMIC_WORDS};
use crate::pass::{PassContext, StaticNeighbors};
use crate::pressure;
use crate::scheduler::{Task, WorkerContext, WorkerPool};
use crate::smoothing::KernelConstants;
use crate::spatial_hash::{add_offset, count_range, scan_range, scatter_range, BucketIndex, SpatialHash};
use crate::storage::AtomicWords;
use crate::sync::ThreadGenerationLock;
use crate::{elapsed_us, ParticleCounts, ParticleSystem, PassTimings, ProfilingData, StepOutcome};

type CpuGeneration = Generation<AtomicWords, ThreadGenerationLock>;

/// CPU back-end settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuConfig {
    /// Worker threads.
    pub threads: usize,
    /// Buffer generations, 2 or 3.
    pub generations: usize,
    /// Store output particles in bucket order.
    pub reorder: bool,
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            threads: std::thread::available_parallelism().map_or(4, |n| n.get()),
            generations: 2,
            reorder: false,
        }
    }
}

#[derive(Clone)]
struct StepBuffers {
    input: Arc<CpuGeneration>,
    output: Arc<CpuGeneration>,
}

#[derive(Default)]
struct StepStats {
    completed: u64,
    last: PassTimings,
}

struct StaticTable {
    words: AtomicWords,
    hash: SpatialHash<XorCellHash>,
}

/// State shared by all workers for the lifetime of one initialization.
struct CpuShared {
    constants: KernelConstants,
    grid: GridHasher<XorCellHash>,
    boundary: BoxBoundary,
    reorder: bool,
    buffers: ParticleBufferSet<AtomicWords, ThreadGenerationLock>,
    statics: StaticParticleSet,
    static_table: Option<StaticTable>,
    /// Bucket counters; one array is scanned while the other is counted.
    counters: [AtomicWords; 2],
    active: AtomicUsize,
    primed: AtomicBool,
    map: AtomicWords,
    partials: AtomicWords,
    io: Mutex<Option<StepBuffers>>,
    degeneracy: DegeneracyLog,
    stats: Mutex<StepStats>,
}

impl CpuShared {
    fn io(&self) -> MutexGuard<'_, Option<StepBuffers>> {
        self.io.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stats(&self) -> MutexGuard<'_, StepStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run_step(&self, ctx: &WorkerContext<'_>, dt: f32) {
        let n = self.buffers.particle_count();
        let table_words = self.grid.table_size() as usize + 1;
        let start = ctx.is_leader().then(Instant::now);

        if ctx.is_leader() {
            let input = self.buffers.current();
            let output = self.buffers.next();
            input.sync().lock_read();
            output.sync().lock_write();
            output.invalidate_snapshot();
            *self.io() = Some(StepBuffers { input, output });
        }
        ctx.sync_threads();

        let Some(io) = self.io().clone() else {
            return;
        };
        let active = self.active.load(Ordering::Relaxed);
        let counters = &self.counters[active];
        let next_counters = &self.counters[1 - active];
        let input = DynamicView::new(io.input.storage());
        let output = DynamicView::new(io.output.storage());

        // -- bucket index --
        if !self.primed.load(Ordering::Relaxed) {
            counters.fill(ctx.range(table_words), 0);
            ctx.sync_threads();
            count_range(counters, ctx.range(n), |i| input.hash(i));
            ctx.sync_threads();
        }
        let own = ctx.range(table_words);
        let total = scan_range(counters, own.clone());
        self.partials.store(ctx.index(), total);
        ctx.sync_threads();
        let offset: u32 = (0..ctx.index()).map(|w| self.partials.load(w)).sum();
        add_offset(counters, own, offset);
        ctx.sync_threads();
        scatter_range(counters, &self.map, ctx.range(n), |i| input.hash(i));
        next_counters.fill(ctx.range(table_words), 0);
        ctx.sync_threads();
        let hashed = start.map(|_| Instant::now());

        // -- pressure --
        let pass = PassContext {
            constants: &self.constants,
            grid: &self.grid,
            input,
            output,
            index: BucketIndex::new(counters, &self.map),
            statics: self.static_table.as_ref().map(|t| StaticNeighbors {
                particles: StaticView::new(&t.words),
                index: t.hash.index(),
                grid: t.hash.grid(),
            }),
            reorder: self.reorder,
        };
        pressure::run(&pass, ctx.range(n));
        ctx.sync_threads();
        let pressured = start.map(|_| Instant::now());

        // -- dynamics --
        let integration = Integration {
            dt,
            boundary: &self.boundary,
            next_counters,
        };
        let degenerate = dynamics::run(&pass, &integration, ctx.range(n));
        self.degeneracy.record(u64::from(degenerate));
        ctx.sync_threads();

        if let (Some(start), Some(hashed), Some(pressured)) = (start, hashed, pressured) {
            io.input.sync().unlock_read();
            io.output.sync().unlock_write();
            *self.io() = None;
            self.buffers.advance();
            self.active.store(1 - active, Ordering::Relaxed);
            self.primed.store(true, Ordering::Relaxed);

            let done = Instant::now();
            let timings = PassTimings {
                hash_build_us: hashed.duration_since(start).as_micros() as u64,
                pressure_us: pressured.duration_since(hashed).as_micros() as u64,
                dynamics_us: done.duration_since(pressured).as_micros() as u64,
                total_us: elapsed_us(start),
            };
            let mut stats = self.stats();
            stats.completed += 1;
            stats.last = timings;
            debug!(step = stats.completed, ?timings, "cpu step finished");
        }
    }
}

struct CpuState {
    shared: Arc<CpuShared>,
    pool: WorkerPool,
}

/// SPH system running on a pool of CPU threads.
pub struct CpuSystem {
    config: CpuConfig,
    state: Option<CpuState>,
    skipped: AtomicU64,
}

impl std::fmt::Debug for CpuSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuSystem")
            .field("config", &self.config)
            .field("initialized", &self.state.is_some())
            .finish()
    }
}

impl CpuSystem {
    /// Uninitialized system.
    pub fn new(config: CpuConfig) -> Self {
        Self {
            config,
            state: None,
            skipped: AtomicU64::new(0),
        }
    }

    /// Settings in use.
    pub fn config(&self) -> &CpuConfig {
        &self.config
    }

    fn state(&self) -> Result<&CpuState, SystemError> {
        self.state.as_ref().ok_or(SystemError::NotInitialized)
    }

    fn step_task(shared: &Arc<CpuShared>, dt: f32) -> Task {
        let shared = shared.clone();
        Arc::new(move |ctx: &WorkerContext<'_>| shared.run_step(ctx, dt))
    }
}

impl Default for CpuSystem {
    fn default() -> Self {
        Self::new(CpuConfig::default())
    }
}

impl ParticleSystem for CpuSystem {
    fn name(&self) -> &'static str {
        "cpu"
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
        let grid = GridHasher::new(XorCellHash, constants.h, table_size);

        let mut initial = dynamic;
        for p in &mut initial {
            p.hash = grid.bucket_of(p.position);
        }
        let generations = (0..self.config.generations)
            .map(|g| {
                let words = if g == 0 {
                    AtomicWords::from_pod(&initial)
                } else {
                    AtomicWords::zeroed(n * DYNAMIC_WORDS)
                };
                Generation::new(words, ThreadGenerationLock::new())
            })
            .collect();
        let buffers = ParticleBufferSet::new(generations, n)?;

        let static_table = (!statics.is_empty()).then(|| {
            let static_grid = GridHasher::new(
                XorCellHash,
                constants.h,
                hash_table_size(statics.len(), params.static_table_factor()),
            );
            let hash = SpatialHash::build(static_grid, statics.len(), |i| statics[i].position);
            StaticTable {
                words: AtomicWords::from_pod(&statics),
                hash,
            }
        });
        let static_count = statics.len();

        let pool = WorkerPool::new(self.config.threads)
            .map_err(|e| SystemError::DeviceUnavailable(format!("worker threads: {e}")))?;
        let workers = pool.workers();

        let shared = Arc::new(CpuShared {
            constants,
            grid,
            boundary: BoxBoundary::from_params(params),
            reorder: self.config.reorder,
            buffers,
            statics: StaticParticleSet::new(statics),
            static_table,
            counters: [
                AtomicWords::zeroed(table_size as usize + 1),
                AtomicWords::zeroed(table_size as usize + 1),
            ],
            active: AtomicUsize::new(0),
            primed: AtomicBool::new(false),
            map: AtomicWords::zeroed(n),
            partials: AtomicWords::zeroed(workers),
            io: Mutex::new(None),
            degeneracy: DegeneracyLog::new(),
            stats: Mutex::new(StepStats::default()),
        });
        self.skipped.store(0, Ordering::Relaxed);
        self.state = Some(CpuState { shared, pool });

        info!(
            particles = n,
            statics = static_count,
            workers,
            generations = self.config.generations,
            table_size,
            reorder = self.config.reorder,
            "CPU particle system initialized"
        );
        Ok(())
    }

    fn update(&mut self, dt: f32) -> Result<StepOutcome, SystemError> {
        let state = self.state()?;
        if state.pool.try_enqueue(Self::step_task(&state.shared, dt)) {
            Ok(StepOutcome::Enqueued)
        } else {
            let skipped = self.skipped.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(skipped, "simulation behind, update skipped");
            Ok(StepOutcome::Skipped)
        }
    }

    fn step(&mut self, dt: f32) -> Result<(), SystemError> {
        let state = self.state()?;
        state.pool.enqueue(Self::step_task(&state.shared, dt));
        Ok(())
    }

    fn synchronize(&mut self) -> Result<(), SystemError> {
        self.state()?.pool.wait_idle();
        Ok(())
    }

    fn clear(&mut self) {
        if let Some(mut state) = self.state.take() {
            state.pool.wait_idle();
            state.pool.shutdown();
            info!(
                steps = state.shared.stats().completed,
                degenerate_pairs = state.shared.degeneracy.total(),
                "CPU particle system cleared"
            );
        }
    }

    fn particle_counts(&self) -> ParticleCounts {
        self.state
            .as_ref()
            .map(|s| ParticleCounts {
                dynamic_count: s.shared.buffers.particle_count(),
                static_count: s.shared.statics.len(),
            })
            .unwrap_or_default()
    }

    fn profiling_data(&self) -> ProfilingData {
        let mut data = ProfilingData {
            backend: self.name().to_string(),
            skipped_updates: self.skipped.load(Ordering::Relaxed),
            ..Default::default()
        };
        if let Some(state) = &self.state {
            let stats = state.shared.stats();
            data.completed_steps = stats.completed;
            data.last_step = stats.last;
            data.degenerate_pairs = state.shared.degeneracy.total();
        }
        data
    }

    fn lock_dynamic_particles_for_rendering(&self) -> Result<DynamicRenderLock, SystemError> {
        self.state()?.shared.buffers.lock_for_rendering()
    }

    fn lock_static_particles_for_rendering(&self) -> Result<StaticRenderLock, SystemError> {
        Ok(self.state()?.shared.statics.lock_for_rendering())
    }

    fn prepare_dynamic_for_rendering(&self) -> Result<(), SystemError> {
        self.state()?.shared.buffers.prepare_for_rendering()
    }
}

impl Drop for CpuSystem {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    fn params() -> ParticleBehaviourParameters {
        ParticleBehaviourParameters {
            particle_mass: 1.0,
            gas_constant: 1.0,
            rest_density: 0.0,
            viscosity: 0.1,
            interaction_radius: 1.0,
            gravity: Vec3::ZERO,
            ..Default::default()
        }
    }

    fn unbounded() -> ParticleBehaviourParameters {
        let mut p = params();
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

    #[test]
    fn uninitialized_system_reports_errors() {
        let mut sys = CpuSystem::new(CpuConfig { threads: 2, ..Default::default() });
        assert_eq!(sys.step(0.01), Err(SystemError::NotInitialized));
        assert!(sys.lock_dynamic_particles_for_rendering().is_err());
        assert_eq!(sys.particle_counts(), ParticleCounts::default());
    }

    #[test]
    fn initialize_rejects_empty_and_invalid() {
        let mut sys = CpuSystem::new(CpuConfig { threads: 1, ..Default::default() });
        assert_eq!(sys.initialize(vec![], vec![], &params()), Err(SystemError::EmptyParticleSet));
        let bad = ParticleBehaviourParameters { gas_constant: 0.0, ..params() };
        assert!(matches!(
            sys.initialize(lattice(2, 0.5), vec![], &bad),
            Err(SystemError::InvalidParameters(_))
        ));
    }

    #[test]
    fn zero_steps_leave_particles_unchanged() {
        let particles = lattice(8, 0.4);
        let mut sys = CpuSystem::new(CpuConfig { threads: 2, ..Default::default() });
        sys.initialize(particles.clone(), vec![], &unbounded()).unwrap();
        let guard = sys.lock_dynamic_particles_for_rendering().unwrap();
        for (a, b) in particles.iter().zip(guard.iter()) {
            assert_eq!(a.position, b.position);
            assert_eq!(a.velocity, b.velocity);
        }
    }

    #[test]
    fn steps_complete_and_are_counted() {
        let mut sys = CpuSystem::new(CpuConfig { threads: 3, generations: 3, reorder: false });
        sys.initialize(lattice(40, 0.3), vec![], &unbounded()).unwrap();
        for _ in 0..5 {
            sys.step(0.001).unwrap();
        }
        sys.synchronize().unwrap();
        let profile = sys.profiling_data();
        assert_eq!(profile.completed_steps, 5);
        assert_eq!(profile.backend, "cpu");
        assert!(profile.last_step.total_us >= profile.last_step.pressure_us);
        let guard = sys.lock_dynamic_particles_for_rendering().unwrap();
        assert!(guard.iter().all(|p| p.position.is_finite() && p.velocity.is_finite()));
    }

    #[test]
    fn static_particles_are_exposed_for_rendering() {
        let mut sys = CpuSystem::new(CpuConfig { threads: 1, ..Default::default() });
        let statics = vec![StaticParticle::new(Vec3::ZERO), StaticParticle::new(Vec3::X)];
        sys.initialize(lattice(4, 0.5), statics, &unbounded()).unwrap();
        assert_eq!(sys.lock_static_particles_for_rendering().unwrap().len(), 2);
        assert_eq!(sys.particle_counts().static_count, 2);
    }

    #[test]
    fn clear_releases_state() {
        let mut sys = CpuSystem::new(CpuConfig { threads: 2, ..Default::default() });
        sys.initialize(lattice(4, 0.5), vec![], &unbounded()).unwrap();
        sys.step(0.01).unwrap();
        sys.clear();
        assert_eq!(sys.particle_counts().dynamic_count, 0);
        assert_eq!(sys.synchronize(), Err(SystemError::NotInitialized));
    }
}
