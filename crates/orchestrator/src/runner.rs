//! Simulation runner with lifecycle management
//!
//! `SimulationRunner` owns a particle system and drives it from a background
//! thread: every frame it submits one non-blocking `update`, which the system
//! skips when it is behind. The control handle starts, pauses, resumes and
//! stops the loop and reads progress counters; renderers take snapshots
//! through the same handle.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use fluidsim_kernel::{DynamicRenderLock, ParticleSystem, ProfilingData, StaticRenderLock, StepOutcome, SystemError};

/// Poll period while waiting for start or while paused.
const IDLE_POLL: Duration = Duration::from_millis(10);

/// Runner state enum
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    /// Simulation created but not yet started
    Created,
    /// Simulation actively running
    Running,
    /// Simulation paused
    Paused,
    /// Stopped on request before reaching a stopping condition
    Stopped,
    /// Simulation finished (reached the step limit)
    Finished,
    /// Simulation encountered an error
    Error,
}

impl RunnerState {
    fn is_terminal(self) -> bool {
        matches!(self, RunnerState::Stopped | RunnerState::Finished | RunnerState::Error)
    }
}

/// How the loop advances.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunSettings {
    /// Simulated seconds per step
    pub dt: f32,
    /// Stop after this many submitted steps
    pub max_steps: Option<u64>,
    /// Wall-clock frame period; free-running when `None`
    pub frame_time: Option<Duration>,
}

/// Shared state between the runner thread and control interface
#[derive(Debug)]
struct SharedState {
    state: RunnerState,
    /// Loop iterations while running
    frame_count: u64,
    /// Updates that submitted a step
    step_count: u64,
    /// Updates the system skipped
    skipped_count: u64,
    error_message: Option<String>,
}

type SharedSystem = Arc<Mutex<Box<dyn ParticleSystem>>>;

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle for controlling and querying a running simulation
pub struct SimulationRunner {
    shared: Arc<Mutex<SharedState>>,
    system: SharedSystem,
    thread_handle: Option<thread::JoinHandle<()>>,
}

impl std::fmt::Debug for SimulationRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulationRunner")
            .field("shared", &*lock(&self.shared))
            .finish_non_exhaustive()
    }
}

impl SimulationRunner {
    /// Create a runner for an initialized system. The loop waits for [`Self::start`].
    pub fn new(system: Box<dyn ParticleSystem>, settings: RunSettings) -> Self {
        let shared = Arc::new(Mutex::new(SharedState {
            state: RunnerState::Created,
            frame_count: 0,
            step_count: 0,
            skipped_count: 0,
            error_message: None,
        }));
        let system: SharedSystem = Arc::new(Mutex::new(system));

        let thread_shared = Arc::clone(&shared);
        let thread_system = Arc::clone(&system);
        let thread_handle = thread::Builder::new()
            .name("fluidsim-runner".into())
            .spawn(move || run_simulation_loop(&thread_system, &thread_shared, settings));

        let thread_handle = match thread_handle {
            Ok(handle) => Some(handle),
            Err(e) => {
                let mut guard = lock(&shared);
                guard.state = RunnerState::Error;
                guard.error_message = Some(format!("failed to spawn runner thread: {e}"));
                None
            }
        };

        Self {
            shared,
            system,
            thread_handle,
        }
    }

    /// Get current runner state
    pub fn state(&self) -> RunnerState {
        lock(&self.shared).state
    }

    /// Loop iterations run so far
    pub fn frame_count(&self) -> u64 {
        lock(&self.shared).frame_count
    }

    /// Steps submitted so far
    pub fn step_count(&self) -> u64 {
        lock(&self.shared).step_count
    }

    /// Updates skipped because the system was behind
    pub fn skipped_count(&self) -> u64 {
        lock(&self.shared).skipped_count
    }

    /// Get error message if state is Error
    pub fn error_message(&self) -> Option<String> {
        lock(&self.shared).error_message.clone()
    }

    /// Start the simulation (transition from Created to Running)
    pub fn start(&self) {
        let mut state = lock(&self.shared);
        if state.state == RunnerState::Created {
            state.state = RunnerState::Running;
        }
    }

    /// Pause the simulation
    pub fn pause(&self) {
        let mut state = lock(&self.shared);
        if state.state == RunnerState::Running {
            state.state = RunnerState::Paused;
        }
    }

    /// Resume the simulation
    pub fn resume(&self) {
        let mut state = lock(&self.shared);
        if state.state == RunnerState::Paused {
            state.state = RunnerState::Running;
        }
    }

    /// Ask the loop to exit after its current frame
    pub fn stop(&self) {
        let mut state = lock(&self.shared);
        if !state.state.is_terminal() {
            state.state = RunnerState::Stopped;
        }
    }

    /// Counters and timings of the underlying system
    pub fn profiling_data(&self) -> ProfilingData {
        lock(&self.system).profiling_data()
    }

    /// Render lock on the latest dynamic particles
    pub fn lock_dynamic_particles(&self) -> Result<DynamicRenderLock, SystemError> {
        lock(&self.system).lock_dynamic_particles_for_rendering()
    }

    /// Render lock on the static particles
    pub fn lock_static_particles(&self) -> Result<StaticRenderLock, SystemError> {
        lock(&self.system).lock_static_particles_for_rendering()
    }

    /// Wait for the simulation thread to complete
    pub fn join(&mut self) -> Result<(), String> {
        if let Some(handle) = self.thread_handle.take() {
            handle.join().map_err(|_| "Thread panicked".to_string())?;
        }
        Ok(())
    }
}

impl Drop for SimulationRunner {
    fn drop(&mut self) {
        self.stop();
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

/// Main simulation loop executed in background thread
fn run_simulation_loop(system: &SharedSystem, shared: &Mutex<SharedState>, settings: RunSettings) {
    // Wait for start signal
    loop {
        let state = lock(shared).state;
        match state {
            RunnerState::Created => thread::sleep(IDLE_POLL),
            RunnerState::Running => break,
            _ => return,
        }
    }

    let start_wall_time = Instant::now();
    let mut next_frame = Instant::now();

    let reason = loop {
        let current = lock(shared).state;
        match current {
            RunnerState::Running => {}
            RunnerState::Paused => {
                thread::sleep(IDLE_POLL);
                next_frame = Instant::now();
                continue;
            }
            other => break other,
        }

        let outcome = lock(system).update(settings.dt);
        let steps = {
            let mut guard = lock(shared);
            guard.frame_count += 1;
            match outcome {
                Ok(StepOutcome::Enqueued) => guard.step_count += 1,
                Ok(StepOutcome::Skipped) => guard.skipped_count += 1,
                Err(e) => {
                    tracing::error!(error = %e, "simulation update failed");
                    guard.state = RunnerState::Error;
                    guard.error_message = Some(e.to_string());
                    break RunnerState::Error;
                }
            }
            if guard.frame_count % 1000 == 0 {
                tracing::debug!(
                    frames = guard.frame_count,
                    steps = guard.step_count,
                    skipped = guard.skipped_count,
                    "runner progress"
                );
            }
            guard.step_count
        };

        if settings.max_steps.is_some_and(|max| steps >= max) {
            tracing::info!(steps, "Simulation finished: reached max_steps");
            let mut guard = lock(shared);
            if !guard.state.is_terminal() {
                guard.state = RunnerState::Finished;
            }
            break RunnerState::Finished;
        }

        if let Some(frame_time) = settings.frame_time {
            next_frame += frame_time;
            let now = Instant::now();
            if next_frame > now {
                thread::sleep(next_frame - now);
            } else {
                next_frame = now;
            }
        }
    };

    let mut system = lock(system);
    if let Err(e) = system.synchronize() {
        tracing::warn!(error = %e, "synchronize after run failed");
    }
    let profile = system.profiling_data();
    let guard = lock(shared);
    tracing::info!(
        ?reason,
        frames = guard.frame_count,
        steps = guard.step_count,
        skipped = guard.skipped_count,
        completed = profile.completed_steps,
        degenerate_pairs = profile.degenerate_pairs,
        wall_time_s = start_wall_time.elapsed().as_secs_f64(),
        "Simulation thread exiting"
    );
}
