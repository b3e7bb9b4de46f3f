//! Fixed worker pool running lock-step tasks.
//!
//! Every task is run by *all* workers at once. Inside a task, workers split
//! index ranges statically (see [`partition`]) and separate sub-phases with
//! [`WorkerContext::sync_threads`]. A task ends with an implicit barrier, so
//! tasks never overlap.
//!
//! Submission is asynchronous with a bounded queue of [`MAX_TASKS_IN_FLIGHT`]
//! tasks: [`WorkerPool::enqueue`] blocks while the queue is full and
//! [`WorkerPool::try_enqueue`] gives up instead, letting a frame loop skip a
//! step rather than stall.

use std::collections::VecDeque;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::sync::PhaseBarrier;

/// Queue depth of submitted, unfinished tasks.
pub const MAX_TASKS_IN_FLIGHT: usize = 3;

/// How long `shutdown` waits for workers before giving up on them.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Contiguous share of `len` items for `worker` out of `workers`.
///
/// Shares differ in size by at most one item and cover `0..len` in order.
pub fn partition(len: usize, workers: usize, worker: usize) -> Range<usize> {
    debug_assert!(worker < workers);
    let base = len / workers;
    let extra = len % workers;
    let start = worker * base + worker.min(extra);
    let size = base + usize::from(worker < extra);
    start..start + size
}

/// Per-worker view handed to a running task.
pub struct WorkerContext<'a> {
    index: usize,
    workers: usize,
    barrier: &'a PhaseBarrier,
}

impl WorkerContext<'_> {
    /// This worker's index.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Number of workers.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Whether this is worker 0, which performs single-threaded duties.
    pub fn is_leader(&self) -> bool {
        self.index == 0
    }

    /// This worker's share of `len` items.
    pub fn range(&self, len: usize) -> Range<usize> {
        partition(len, self.workers, self.index)
    }

    /// Wait until every worker reaches this point.
    pub fn sync_threads(&self) {
        self.barrier.wait();
    }
}

/// Work run by every worker.
pub type Task = Arc<dyn Fn(&WorkerContext<'_>) + Send + Sync>;

struct QueueState {
    tasks: VecDeque<Task>,
    /// Sequence number of `tasks[0]`.
    head: u64,
    shutdown: bool,
}

struct PoolShared {
    queue: Mutex<QueueState>,
    task_ready: Condvar,
    task_done: Condvar,
    barrier: PhaseBarrier,
    workers: usize,
}

impl PoolShared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Fixed set of worker threads executing [`Task`]s in lock-step.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    handles: Vec<JoinHandle<()>>,
    stopped: AtomicBool,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.shared.workers)
            .finish()
    }
}

impl WorkerPool {
    /// Spawn `workers` threads (at least one).
    pub fn new(workers: usize) -> std::io::Result<Self> {
        let workers = workers.max(1);
        let shared = Arc::new(PoolShared {
            queue: Mutex::new(QueueState {
                tasks: VecDeque::new(),
                head: 0,
                shutdown: false,
            }),
            task_ready: Condvar::new(),
            task_done: Condvar::new(),
            barrier: PhaseBarrier::new(workers),
            workers,
        });
        let mut pool = Self {
            shared: shared.clone(),
            handles: Vec::with_capacity(workers),
            stopped: AtomicBool::new(false),
        };
        for index in 0..workers {
            let shared = shared.clone();
            let handle = thread::Builder::new()
                .name(format!("fluidsim-worker-{index}"))
                .spawn(move || worker_loop(&shared, index));
            match handle {
                Ok(handle) => pool.handles.push(handle),
                Err(e) => {
                    pool.shutdown();
                    return Err(e);
                }
            }
        }
        debug!(workers, "worker pool started");
        Ok(pool)
    }

    /// Number of worker threads.
    pub fn workers(&self) -> usize {
        self.shared.workers
    }

    /// Submit `task`, blocking while [`MAX_TASKS_IN_FLIGHT`] tasks are pending.
    pub fn enqueue(&self, task: Task) {
        let mut queue = self.shared.lock();
        while queue.tasks.len() >= MAX_TASKS_IN_FLIGHT && !queue.shutdown {
            queue = self
                .shared
                .task_done
                .wait(queue)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if queue.shutdown {
            return;
        }
        queue.tasks.push_back(task);
        drop(queue);
        self.shared.task_ready.notify_all();
    }

    /// Submit `task` unless the queue is full. Returns whether it was queued.
    pub fn try_enqueue(&self, task: Task) -> bool {
        let mut queue = self.shared.lock();
        if queue.shutdown || queue.tasks.len() >= MAX_TASKS_IN_FLIGHT {
            return false;
        }
        queue.tasks.push_back(task);
        drop(queue);
        self.shared.task_ready.notify_all();
        true
    }

    /// Number of submitted, unfinished tasks.
    pub fn pending(&self) -> usize {
        self.shared.lock().tasks.len()
    }

    /// Block until every submitted task has finished.
    pub fn wait_idle(&self) {
        let mut queue = self.shared.lock();
        while !queue.tasks.is_empty() && !queue.shutdown {
            queue = self
                .shared
                .task_done
                .wait(queue)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Stop the workers after the running task.
    ///
    /// Queued tasks that have not started are dropped. Workers that do not
    /// exit within [`SHUTDOWN_TIMEOUT`] are detached with a warning.
    pub fn shutdown(&mut self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut queue = self.shared.lock();
            queue.shutdown = true;
        }
        self.shared.task_ready.notify_all();
        self.shared.task_done.notify_all();
        self.shared.barrier.release();

        let deadline = Instant::now() + SHUTDOWN_TIMEOUT;
        while Instant::now() < deadline && !self.handles.iter().all(JoinHandle::is_finished) {
            thread::sleep(Duration::from_millis(1));
        }
        let mut unclean = 0;
        for handle in self.handles.drain(..) {
            if handle.is_finished() {
                if handle.join().is_err() {
                    unclean += 1;
                }
            } else {
                unclean += 1;
            }
        }
        if unclean > 0 {
            warn!(unclean, "worker pool shut down uncleanly");
        } else {
            debug!("worker pool stopped");
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &PoolShared, index: usize) {
    let mut next: u64 = 0;
    loop {
        let task = {
            let mut queue = shared.lock();
            loop {
                if queue.shutdown {
                    return;
                }
                let offset = next.wrapping_sub(queue.head) as usize;
                if let Some(task) = queue.tasks.get(offset) {
                    break task.clone();
                }
                queue = shared
                    .task_ready
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };

        let ctx = WorkerContext {
            index,
            workers: shared.workers,
            barrier: &shared.barrier,
        };
        task(&ctx);
        next += 1;

        // Implicit end-of-task barrier; the last worker to arrive retires it.
        if shared.barrier.wait() {
            let mut queue = shared.lock();
            queue.tasks.pop_front();
            queue.head += 1;
            drop(queue);
            shared.task_done.notify_all();
        }
    }
}
