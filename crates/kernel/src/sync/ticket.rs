//! Non-blocking lock for device-side buffer generations.
//!
//! Instead of blocking the submitting thread, each access is registered as an
//! *intent* in a FIFO queue and handed back a wait-list of completion events:
//!
//! - a read waits on every earlier write;
//! - a write waits on every earlier intent.
//!
//! Each intent owns a placeholder `done` event. On release the caller passes
//! the event that marks the end of its access (typically the last kernel that
//! touches the buffer) and the placeholder is chained to it, so later intents
//! can be enqueued before the earlier work has even been submitted.
//!
//! The queue has a fixed capacity; when it is full the acquire logs a warning
//! and returns `None`, and the caller must retry later or drop the request.

use std::collections::VecDeque;
use std::num::NonZeroU64;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::warn;

use super::event::Event;
use super::lock::protocol_violation;

/// Default intent queue capacity.
pub const DEFAULT_TICKET_CAPACITY: usize = 16;

/// Kind of access an intent declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Shared read.
    Read,
    /// Exclusive write.
    Write,
}

/// Handle of a registered intent. Never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ticket(NonZeroU64);

impl Ticket {
    /// Numeric id.
    pub fn id(&self) -> u64 {
        self.0.get()
    }
}

/// Granted intent: its ticket and the events to wait on before accessing.
#[derive(Debug, Clone)]
pub struct Grant {
    /// Ticket to pass to [`EventTicketLock::release`].
    pub ticket: Ticket,
    /// Events that must complete before the access may start.
    pub wait_list: Vec<Event>,
}

#[derive(Debug)]
struct Intent {
    ticket: Ticket,
    access: Access,
    done: Event,
    released: bool,
}

#[derive(Debug)]
struct TicketState {
    intents: VecDeque<Intent>,
    next_ticket: u64,
}

/// FIFO intent queue resolved against completion events.
#[derive(Debug)]
pub struct EventTicketLock {
    capacity: usize,
    state: Mutex<TicketState>,
}

impl Default for EventTicketLock {
    fn default() -> Self {
        Self::new(DEFAULT_TICKET_CAPACITY)
    }
}

impl EventTicketLock {
    /// Lock holding at most `capacity` outstanding intents.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(TicketState {
                intents: VecDeque::new(),
                next_ticket: 1,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TicketState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a read intent.
    pub fn acquire_read(&self) -> Option<Grant> {
        self.acquire(Access::Read)
    }

    /// Register a write intent.
    pub fn acquire_write(&self) -> Option<Grant> {
        self.acquire(Access::Write)
    }

    /// Register an intent of kind `access`. `None` when the queue is full.
    pub fn acquire(&self, access: Access) -> Option<Grant> {
        let mut state = self.lock();
        // Completed intents constrain nobody.
        state.intents.retain(|i| !(i.released && i.done.is_complete()));
        if state.intents.len() >= self.capacity {
            warn!(
                capacity = self.capacity,
                ?access,
                "lock ticket queue full, request dropped"
            );
            return None;
        }

        let wait_list = state
            .intents
            .iter()
            .filter(|i| access == Access::Write || i.access == Access::Write)
            .map(|i| i.done.clone())
            .collect();

        let Some(id) = NonZeroU64::new(state.next_ticket) else {
            protocol_violation("ticket counter wrapped");
        };
        state.next_ticket += 1;
        let ticket = Ticket(id);
        state.intents.push_back(Intent {
            ticket,
            access,
            done: Event::new(),
            released: false,
        });
        Some(Grant { ticket, wait_list })
    }

    /// End the access of `ticket` once `completion` completes.
    pub fn release(&self, ticket: Ticket, completion: &Event) {
        let done = {
            let mut state = self.lock();
            let Some(pos) = state.intents.iter().position(|i| i.ticket == ticket) else {
                protocol_violation("release of unknown ticket");
            };
            let intent = &mut state.intents[pos];
            if intent.released {
                protocol_violation("ticket released twice");
            }
            intent.released = true;
            intent.done.clone()
        };
        completion.on_complete(move || done.signal());
    }

    /// Number of intents not yet known to be complete.
    pub fn outstanding(&self) -> usize {
        let mut state = self.lock();
        state.intents.retain(|i| !(i.released && i.done.is_complete()));
        state.intents.len()
    }

    /// Completion events of every current intent.
    pub fn pending_events(&self) -> Vec<Event> {
        self.lock().intents.iter().map(|i| i.done.clone()).collect()
    }
}

impl Drop for EventTicketLock {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        let held = self
            .state
            .get_mut()
            .map(|s| s.intents.iter().any(|i| !i.released))
            .unwrap_or(false);
        if held {
            protocol_violation("ticket lock destroyed with unreleased intents");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::event::all_complete;

    #[test]
    fn first_write_waits_on_nothing() {
        let lock = EventTicketLock::default();
        let grant = lock.acquire_write().unwrap();
        assert!(grant.wait_list.is_empty());
        lock.release(grant.ticket, &Event::signaled());
    }

    #[test]
    fn reads_wait_only_on_writes() {
        let lock = EventTicketLock::default();
        let r1 = lock.acquire_read().unwrap();
        let w = lock.acquire_write().unwrap();
        let r2 = lock.acquire_read().unwrap();
        assert_eq!(w.wait_list.len(), 1);
        assert_eq!(r2.wait_list.len(), 1);

        let write_done = Event::new();
        lock.release(w.ticket, &write_done);
        lock.release(r1.ticket, &Event::signaled());
        assert!(!all_complete(&r2.wait_list));
        write_done.signal();
        assert!(all_complete(&r2.wait_list));
        lock.release(r2.ticket, &Event::signaled());
    }

    #[test]
    fn write_waits_on_all_earlier_intents() {
        let lock = EventTicketLock::default();
        let a = lock.acquire_read().unwrap();
        let b = lock.acquire_read().unwrap();
        let w = lock.acquire_write().unwrap();
        assert_eq!(w.wait_list.len(), 2);
        for g in [a, b, w] {
            lock.release(g.ticket, &Event::signaled());
        }
        assert_eq!(lock.outstanding(), 0);
    }

    #[test]
    fn full_queue_returns_none() {
        let lock = EventTicketLock::new(2);
        let a = lock.acquire_read().unwrap();
        let b = lock.acquire_read().unwrap();
        assert!(lock.acquire_write().is_none());
        lock.release(a.ticket, &Event::signaled());
        let c = lock.acquire_write().unwrap();
        lock.release(b.ticket, &Event::signaled());
        lock.release(c.ticket, &Event::signaled());
    }

    #[test]
    #[should_panic(expected = "lock protocol violation")]
    fn double_release_is_fatal() {
        let lock = EventTicketLock::default();
        let g = lock.acquire_write().unwrap();
        let pending = Event::new();
        lock.release(g.ticket, &pending);
        lock.release(g.ticket, &pending);
    }
}
