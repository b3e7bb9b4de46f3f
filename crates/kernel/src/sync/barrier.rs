//! Reusable thread barrier with a shutdown release.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

#[derive(Debug)]
struct BarrierState {
    arrived: usize,
    generation: u64,
    released: bool,
}

/// Barrier for a fixed number of parties, reusable across phases.
///
/// Arrivals are counted per generation: the last party to arrive bumps the
/// generation and wakes the others, so a fast thread entering the next phase
/// cannot be confused with a slow one leaving the previous one.
#[derive(Debug)]
pub struct PhaseBarrier {
    parties: usize,
    state: Mutex<BarrierState>,
    cond: Condvar,
}

impl PhaseBarrier {
    /// Barrier for `parties` threads.
    pub fn new(parties: usize) -> Self {
        assert!(parties > 0, "barrier needs at least one party");
        Self {
            parties,
            state: Mutex::new(BarrierState {
                arrived: 0,
                generation: 0,
                released: false,
            }),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BarrierState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of parties.
    pub fn parties(&self) -> usize {
        self.parties
    }

    /// Wait for all parties. Returns `true` on the last thread to arrive.
    ///
    /// After [`release`](Self::release) every call returns `false` at once.
    pub fn wait(&self) -> bool {
        let mut state = self.lock();
        if state.released {
            return false;
        }
        state.arrived += 1;
        if state.arrived == self.parties {
            state.arrived = 0;
            state.generation = state.generation.wrapping_add(1);
            drop(state);
            self.cond.notify_all();
            return true;
        }
        let generation = state.generation;
        while state.generation == generation && !state.released {
            state = self.cond.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
        false
    }

    /// Let every current and future waiter through.
    pub fn release(&self) {
        self.lock().released = true;
        self.cond.notify_all();
    }

    /// Whether [`release`](Self::release) was called.
    pub fn is_released(&self) -> bool {
        self.lock().released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn phases_do_not_overlap() {
        let barrier = Arc::new(PhaseBarrier::new(4));
        let counter = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let barrier = barrier.clone();
                let counter = counter.clone();
                std::thread::spawn(move || {
                    let mut leaders = 0;
                    for phase in 0..50 {
                        counter.fetch_add(1, Ordering::SeqCst);
                        if barrier.wait() {
                            leaders += 1;
                        }
                        // Everyone finished this phase's increment.
                        assert!(counter.load(Ordering::SeqCst) >= 4 * (phase + 1));
                        barrier.wait();
                    }
                    leaders
                })
            })
            .collect();
        let leaders: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(leaders, 50);
    }

    #[test]
    fn release_unblocks_waiters() {
        let barrier = Arc::new(PhaseBarrier::new(2));
        let b = barrier.clone();
        let h = std::thread::spawn(move || b.wait());
        std::thread::sleep(std::time::Duration::from_millis(10));
        barrier.release();
        assert!(!h.join().unwrap());
        assert!(barrier.is_released());
        assert!(!barrier.wait());
    }
}
