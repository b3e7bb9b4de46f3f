//! Synchronization primitives for buffer generations and worker threads.
//!
//! - [`Event`]: one-shot completion signal, the currency of the device path.
//! - [`PhaseBarrier`]: lock-step barrier between worker phases.
//! - [`ThreadGenerationLock`]: blocking reader/writer lock (CPU path).
//! - [`EventTicketLock`]: event-resolved intent queue (device path).

pub mod barrier;
pub mod event;
pub mod lock;
pub mod ticket;

pub use barrier::PhaseBarrier;
pub use event::{all_complete, wait_all, Event};
pub use lock::ThreadGenerationLock;
pub use ticket::{Access, EventTicketLock, Grant, Ticket, DEFAULT_TICKET_CAPACITY};
