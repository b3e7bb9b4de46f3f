//! Rotating particle buffer generations and render locks.
//!
//! A [`ParticleBufferSet`] owns two or three generations of the dynamic
//! particle array. At any time one generation is *current* (the latest
//! completed or enqueued result, readable by the renderer) and the following
//! one is *next* (the write target of the step in progress). [`advance`]
//! rotates the roles once a step has been issued.
//!
//! Each generation pairs its storage with a lock. The storage and lock types
//! are parameters so the same rotation serves both execution paths:
//!
//! | path   | storage                     | lock                     |
//! |--------|-----------------------------|--------------------------|
//! | CPU    | [`AtomicWords`]             | [`ThreadGenerationLock`] |
//! | device | [`DeviceStorage`]           | [`EventTicketLock`]      |
//!
//! Render locks copy the generation into a lazily built snapshot the first
//! time it is needed; the snapshot is dropped as soon as a writer takes the
//! generation.
//!
//! [`advance`]: ParticleBufferSet::advance
//! [`DeviceStorage`]: crate::device::DeviceStorage

use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::SystemError;
use crate::particle::{DynamicParticle, StaticParticle};
use crate::storage::AtomicWords;
use crate::sync::{wait_all, Event, EventTicketLock, ThreadGenerationLock, Ticket};

/// Storage a generation's particles can be copied out of.
pub trait ParticleStorage: Send + Sync + 'static {
    /// Copy of the first `count` particles.
    fn read_particles(&self, count: usize) -> Result<Vec<DynamicParticle>, SystemError>;
}

impl ParticleStorage for AtomicWords {
    fn read_particles(&self, count: usize) -> Result<Vec<DynamicParticle>, SystemError> {
        Ok(self.read_pod(count))
    }
}

/// Lock side used by render readers.
pub trait RenderSync: Send + Sync + 'static {
    /// Proof of an acquired render lock.
    type Token: Send + 'static;

    /// Take a render lock, blocking until the data is safe to read.
    fn acquire_render(&self) -> Result<Self::Token, SystemError>;

    /// Release a render lock. The next writer waits for `fence`.
    fn release_render(&self, token: Self::Token, fence: Event);
}

impl RenderSync for ThreadGenerationLock {
    type Token = ();

    fn acquire_render(&self) -> Result<(), SystemError> {
        self.lock_read();
        Ok(())
    }

    fn release_render(&self, _token: (), fence: Event) {
        self.unlock_render(fence);
    }
}

impl RenderSync for EventTicketLock {
    type Token = Ticket;

    fn acquire_render(&self) -> Result<Ticket, SystemError> {
        let grant = self.acquire_read().ok_or(SystemError::LockQueueFull)?;
        wait_all(&grant.wait_list);
        Ok(grant.ticket)
    }

    fn release_render(&self, token: Ticket, fence: Event) {
        self.release(token, &fence);
    }
}

/// One physical copy of the dynamic particle array.
#[derive(Debug)]
pub struct Generation<S, B> {
    storage: S,
    sync: B,
    snapshot: Mutex<Option<Arc<[DynamicParticle]>>>,
}

impl<S: ParticleStorage, B: RenderSync> Generation<S, B> {
    /// Pair `storage` with its lock.
    pub fn new(storage: S, sync: B) -> Self {
        Self {
            storage,
            sync,
            snapshot: Mutex::new(None),
        }
    }

    /// Backing storage.
    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Lock.
    pub fn sync(&self) -> &B {
        &self.sync
    }

    fn snapshot_slot(&self) -> MutexGuard<'_, Option<Arc<[DynamicParticle]>>> {
        self.snapshot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop the render snapshot. Called whenever a writer takes the generation.
    pub fn invalidate_snapshot(&self) {
        *self.snapshot_slot() = None;
    }

    /// Render snapshot, copied out of storage on first use.
    ///
    /// Must be called with a render lock held.
    pub fn snapshot(&self, count: usize) -> Result<Arc<[DynamicParticle]>, SystemError> {
        let mut slot = self.snapshot_slot();
        if let Some(snapshot) = slot.as_ref() {
            return Ok(snapshot.clone());
        }
        let snapshot: Arc<[DynamicParticle]> = self.storage.read_particles(count)?.into();
        *slot = Some(snapshot.clone());
        Ok(snapshot)
    }

    /// Whether a snapshot is cached.
    pub fn is_prepared(&self) -> bool {
        self.snapshot_slot().is_some()
    }
}

/// Two or three rotating generations of the dynamic particles.
#[derive(Debug)]
pub struct ParticleBufferSet<S, B> {
    generations: Vec<Arc<Generation<S, B>>>,
    current: AtomicUsize,
    particle_count: usize,
}

impl<S: ParticleStorage, B: RenderSync> ParticleBufferSet<S, B> {
    /// Set over `generations`, each holding `particle_count` particles.
    pub fn new(generations: Vec<Generation<S, B>>, particle_count: usize) -> Result<Self, SystemError> {
        if !(2..=3).contains(&generations.len()) {
            return Err(SystemError::InvalidParameters(format!(
                "buffer generations must be 2 or 3, got {}",
                generations.len()
            )));
        }
        Ok(Self {
            generations: generations.into_iter().map(Arc::new).collect(),
            current: AtomicUsize::new(0),
            particle_count,
        })
    }

    /// Particles per generation.
    pub fn particle_count(&self) -> usize {
        self.particle_count
    }

    /// Number of generations.
    pub fn generation_count(&self) -> usize {
        self.generations.len()
    }

    /// Index of the current generation.
    pub fn current_index(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }

    /// Latest generation, readable.
    pub fn current(&self) -> Arc<Generation<S, B>> {
        self.generations[self.current_index()].clone()
    }

    /// Write target of the next step.
    pub fn next(&self) -> Arc<Generation<S, B>> {
        self.generations[(self.current_index() + 1) % self.generations.len()].clone()
    }

    /// Generation by index.
    pub fn generation(&self, index: usize) -> Arc<Generation<S, B>> {
        self.generations[index].clone()
    }

    /// Make *next* the current generation.
    pub fn advance(&self) {
        let n = self.generations.len();
        let _ = self
            .current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| Some((c + 1) % n));
    }

    /// Render lock on the current generation.
    pub fn lock_for_rendering(&self) -> Result<DynamicRenderLock, SystemError> {
        let generation = self.current();
        let token = generation.sync().acquire_render()?;
        match generation.snapshot(self.particle_count) {
            Ok(particles) => {
                let held = generation.clone();
                Ok(DynamicRenderLock {
                    particles,
                    release: Some(Box::new(move |fence| held.sync().release_render(token, fence))),
                })
            }
            Err(e) => {
                generation.sync().release_render(token, Event::signaled());
                Err(e)
            }
        }
    }

    /// Build the render snapshot of the current generation now.
    pub fn prepare_for_rendering(&self) -> Result<(), SystemError> {
        self.lock_for_rendering().map(drop)
    }
}

type ReleaseFn = Box<dyn FnOnce(Event) + Send>;

/// Render view of one dynamic generation.
///
/// The slice stays valid and unchanged while the guard lives. Dropping the
/// guard releases with an already-complete fence; use
/// [`release_with_fence`](Self::release_with_fence) when the renderer keeps
/// using the data asynchronously.
pub struct DynamicRenderLock {
    particles: Arc<[DynamicParticle]>,
    release: Option<ReleaseFn>,
}

impl std::fmt::Debug for DynamicRenderLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicRenderLock")
            .field("particles", &self.particles.len())
            .finish()
    }
}

impl DynamicRenderLock {
    /// Locked particles.
    pub fn particles(&self) -> &[DynamicParticle] {
        &self.particles
    }

    /// Release; the next writer of this generation waits for `fence`.
    pub fn release_with_fence(mut self, fence: Event) {
        if let Some(release) = self.release.take() {
            release(fence);
        }
    }
}

impl Deref for DynamicRenderLock {
    type Target = [DynamicParticle];

    fn deref(&self) -> &[DynamicParticle] {
        &self.particles
    }
}

impl Drop for DynamicRenderLock {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release(Event::signaled());
        }
    }
}

/// Immutable boundary particles.
#[derive(Debug, Clone, Default)]
pub struct StaticParticleSet {
    particles: Arc<[StaticParticle]>,
}

impl StaticParticleSet {
    /// Take ownership of `particles`.
    pub fn new(particles: Vec<StaticParticle>) -> Self {
        Self {
            particles: particles.into(),
        }
    }

    /// Number of particles.
    pub fn len(&self) -> usize {
        self.particles.len()
    }

    /// True when there is no boundary geometry.
    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }

    /// All particles.
    pub fn particles(&self) -> &[StaticParticle] {
        &self.particles
    }

    /// Render view. Static particles never change, so this never blocks.
    pub fn lock_for_rendering(&self) -> StaticRenderLock {
        StaticRenderLock {
            particles: self.particles.clone(),
        }
    }
}

/// Render view of the static particles.
#[derive(Debug, Clone)]
pub struct StaticRenderLock {
    particles: Arc<[StaticParticle]>,
}

impl StaticRenderLock {
    /// An empty view, for systems without boundary geometry.
    pub fn empty() -> Self {
        Self {
            particles: Arc::new([]),
        }
    }
}

impl Deref for StaticRenderLock {
    type Target = [StaticParticle];

    fn deref(&self) -> &[StaticParticle] {
        &self.particles
    }
}
