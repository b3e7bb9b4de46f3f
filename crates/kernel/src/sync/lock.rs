//! Reader/writer lock for one CPU-side buffer generation.
//!
//! The state is a signed counter guarded by a mutex and condition variable:
//! `> 0` is the number of readers, `-1` means one writer, `0` is free.
//! Render readers additionally leave a fence behind when they release; the
//! next writer waits for that fence to complete before it takes the lock, so
//! a renderer that is still consuming the data (for example an in-flight
//! upload) is not overwritten. The fence is only waited on by a writer.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use tracing::error;

use super::event::Event;

#[derive(Debug, Default)]
struct LockState {
    count: i32,
    render_fence: Option<Event>,
}

/// Single-writer, multi-reader lock.
#[derive(Debug, Default)]
pub struct ThreadGenerationLock {
    state: Mutex<LockState>,
    cond: Condvar,
}

/// Abort on a locking protocol violation.
#[track_caller]
pub(crate) fn protocol_violation(message: &str) -> ! {
    error!("lock protocol violation: {message}");
    panic!("lock protocol violation: {message}");
}

impl ThreadGenerationLock {
    /// Unlocked lock.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until no writer holds the lock, then add a reader.
    pub fn lock_read(&self) {
        let mut state = self.lock();
        while state.count < 0 {
            state = self.cond.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
        state.count += 1;
    }

    /// Add a reader unless a writer holds the lock.
    pub fn try_lock_read(&self) -> bool {
        let mut state = self.lock();
        if state.count < 0 {
            return false;
        }
        state.count += 1;
        true
    }

    /// Remove a reader.
    pub fn unlock_read(&self) {
        let mut state = self.lock();
        if state.count <= 0 {
            drop(state);
            protocol_violation("read unlock without a read lock");
        }
        state.count -= 1;
        if state.count == 0 {
            self.cond.notify_all();
        }
    }

    /// Remove a render reader and arm `fence` for the next writer.
    pub fn unlock_render(&self, fence: Event) {
        {
            let mut state = self.lock();
            if !fence.is_complete() {
                state.render_fence = Some(fence);
            }
        }
        self.unlock_read();
    }

    /// Block until the lock is free and any armed render fence completed,
    /// then take it exclusively.
    pub fn lock_write(&self) {
        let mut state = self.lock();
        loop {
            while state.count != 0 {
                state = self.cond.wait(state).unwrap_or_else(PoisonError::into_inner);
            }
            match state.render_fence.take() {
                Some(fence) if !fence.is_complete() => {
                    drop(state);
                    fence.wait();
                    state = self.lock();
                }
                _ => break,
            }
        }
        state.count = -1;
    }

    /// Release the exclusive lock.
    pub fn unlock_write(&self) {
        let mut state = self.lock();
        if state.count != -1 {
            drop(state);
            protocol_violation("write unlock without a write lock");
        }
        state.count = 0;
        drop(state);
        self.cond.notify_all();
    }

    /// Current reader count, `-1` while write-locked.
    pub fn holders(&self) -> i32 {
        self.lock().count
    }
}

impl Drop for ThreadGenerationLock {
    fn drop(&mut self) {
        let count = self.state.get_mut().map(|s| s.count).unwrap_or(0);
        if count != 0 && !std::thread::panicking() {
            protocol_violation("generation lock destroyed while held");
        }
    }
}
