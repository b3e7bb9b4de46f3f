//! One-shot completion signal shared between threads and devices.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

type Callback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct EventState {
    complete: bool,
    callbacks: Vec<Callback>,
}

#[derive(Default)]
struct EventInner {
    state: Mutex<EventState>,
    cond: Condvar,
}

impl EventInner {
    fn lock(&self) -> MutexGuard<'_, EventState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Completion signal. Clones refer to the same signal.
///
/// An event starts pending and becomes complete exactly once. Callbacks
/// registered with [`Event::on_complete`] run on the signalling thread before
/// the event reads as complete, or immediately if it already is.
#[derive(Clone, Default)]
pub struct Event {
    inner: Arc<EventInner>,
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event").field("complete", &self.is_complete()).finish()
    }
}

impl Event {
    /// Pending event.
    pub fn new() -> Self {
        Self::default()
    }

    /// Event that is already complete.
    pub fn signaled() -> Self {
        let event = Self::new();
        event.signal();
        event
    }

    /// Run callbacks, then mark complete and wake waiters. Later calls do
    /// nothing.
    ///
    /// Waiters never observe completion before every callback has run.
    pub fn signal(&self) {
        loop {
            let callbacks = {
                let mut state = self.inner.lock();
                if state.complete {
                    return;
                }
                if state.callbacks.is_empty() {
                    state.complete = true;
                    break;
                }
                std::mem::take(&mut state.callbacks)
            };
            for cb in callbacks {
                cb();
            }
        }
        self.inner.cond.notify_all();
    }

    /// Whether the event has completed.
    pub fn is_complete(&self) -> bool {
        self.inner.lock().complete
    }

    /// Block until complete.
    pub fn wait(&self) {
        let mut state = self.inner.lock();
        while !state.complete {
            state = self.inner.cond.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block until complete or `timeout` elapses. Returns completion.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let state = self.inner.lock();
        let (state, _) = self
            .inner
            .cond
            .wait_timeout_while(state, timeout, |s| !s.complete)
            .unwrap_or_else(PoisonError::into_inner);
        state.complete
    }

    /// Run `f` once the event completes.
    pub fn on_complete(&self, f: impl FnOnce() + Send + 'static) {
        {
            let mut state = self.inner.lock();
            if !state.complete {
                state.callbacks.push(Box::new(f));
                return;
            }
        }
        f();
    }

    /// Whether both handles refer to the same signal.
    pub fn same_as(&self, other: &Event) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Block until every event in `events` completes.
pub fn wait_all(events: &[Event]) {
    for e in events {
        e.wait();
    }
}

/// Whether every event in `events` has completed.
pub fn all_complete(events: &[Event]) -> bool {
    events.iter().all(Event::is_complete)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn signal_wakes_waiter() {
        let e = Event::new();
        let e2 = e.clone();
        let h = std::thread::spawn(move || e2.wait());
        assert!(!e.is_complete());
        e.signal();
        h.join().unwrap();
        assert!(e.is_complete());
    }

    #[test]
    fn wait_timeout_reports_pending() {
        let e = Event::new();
        assert!(!e.wait_timeout(Duration::from_millis(5)));
        assert!(Event::signaled().wait_timeout(Duration::from_millis(5)));
    }

    #[test]
    fn callbacks_run_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let e = Event::new();
        let h = hits.clone();
        e.on_complete(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        e.signal();
        e.signal();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Registered after completion: runs immediately.
        let h = hits.clone();
        e.on_complete(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn waiters_see_callback_effects() {
        let e = Event::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        e.on_complete(move || {
            std::thread::sleep(Duration::from_millis(10));
            h.fetch_add(1, Ordering::SeqCst);
        });
        let e2 = e.clone();
        let signaller = std::thread::spawn(move || e2.signal());
        e.wait();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        signaller.join().unwrap();
    }

    #[test]
    fn chained_events_complete_together() {
        let a = Event::new();
        let b = Event::new();
        let b2 = b.clone();
        a.on_complete(move || b2.signal());
        assert!(!all_complete(&[a.clone(), b.clone()]));
        a.signal();
        assert!(all_complete(&[a, b]));
    }
}
