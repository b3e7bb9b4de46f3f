//! Compute device backed by a host executor thread.
//!
//! Buffers are shared [`AtomicWords`]. Enqueued commands run on one executor
//! thread in submission order, each after its wait-list has completed, so the
//! device behaves like an in-order queue that honours event dependencies.
//! Kernels reuse the pass functions of the CPU path with the Morton hash.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use super::{
    ComputeDevice, Kernel, KernelLaunch, KernelStage, PassBindings, SimUniforms, StageClock, SCAN_BLOCK,
};
use crate::dynamics::{self, Integration};
use crate::error::SystemError;
use crate::hashing::{GridHasher, MortonCellHash};
use crate::particle::{DynamicView, StaticView};
use crate::pass::{PassContext, StaticNeighbors};
use crate::pressure;
use crate::spatial_hash::{add_offset, count_range, scan_range, scatter_range, BucketIndex};
use crate::storage::AtomicWords;
use crate::sync::Event;
use crate::PassTimings;

/// Buffer of the host device.
pub type HostBuffer = Arc<AtomicWords>;

/// Wait-list polling interval; bounds how long shutdown takes.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

enum Command {
    Kernel {
        launch: KernelLaunch<HostBuffer>,
        wait_list: Vec<Event>,
        done: Event,
    },
    Barrier {
        wait_list: Vec<Event>,
        done: Event,
    },
}

struct HostShared {
    shutdown: AtomicBool,
    timings: Mutex<StageClock>,
}

impl HostShared {
    fn timings(&self) -> MutexGuard<'_, StageClock> {
        self.timings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for every event, giving up on shutdown.
    fn await_events(&self, wait_list: &[Event]) -> bool {
        for event in wait_list {
            while !event.wait_timeout(POLL_INTERVAL) {
                if self.shutdown.load(Ordering::Relaxed) {
                    return false;
                }
            }
        }
        true
    }

    fn record(&self, stage: KernelStage, elapsed: Duration) {
        self.timings().record(stage, elapsed);
    }
}

/// In-process compute device.
pub struct HostDevice {
    sender: Option<Sender<Command>>,
    shared: Arc<HostShared>,
    executor: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for HostDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostDevice")
            .field("running", &self.executor.is_some())
            .finish()
    }
}

impl HostDevice {
    /// Start the executor thread.
    pub fn new() -> Result<Self, SystemError> {
        let (sender, receiver) = mpsc::channel();
        let shared = Arc::new(HostShared {
            shutdown: AtomicBool::new(false),
            timings: Mutex::new(StageClock::default()),
        });
        let executor = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("fluidsim-host-device".into())
                .spawn(move || executor_loop(&receiver, &shared))
                .map_err(|e| SystemError::DeviceUnavailable(format!("host executor: {e}")))?
        };
        debug!("host device started");
        Ok(Self {
            sender: Some(sender),
            shared,
            executor: Some(executor),
        })
    }

    fn submit(&self, command: Command) {
        let Some(sender) = &self.sender else {
            return;
        };
        if let Err(mpsc::SendError(command)) = sender.send(command) {
            warn!("host device executor gone, command dropped");
            match command {
                Command::Kernel { done, .. } | Command::Barrier { done, .. } => done.signal(),
            }
        }
    }
}

impl Drop for HostDevice {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Relaxed);
        self.sender = None;
        if let Some(handle) = self.executor.take() {
            if handle.join().is_err() {
                warn!("host device executor panicked");
            }
        }
        debug!("host device stopped");
    }
}

impl ComputeDevice for HostDevice {
    type Buffer = HostBuffer;

    fn name(&self) -> &'static str {
        "host-device"
    }

    fn create_buffer(&self, words: usize, label: &str) -> Result<HostBuffer, SystemError> {
        trace!(label, words, "host buffer created");
        Ok(Arc::new(AtomicWords::zeroed(words.max(1))))
    }

    fn write_buffer(&self, buffer: &HostBuffer, data: &[u32]) -> Result<(), SystemError> {
        if data.len() > buffer.len() {
            return Err(SystemError::DeviceUnavailable(format!(
                "write of {} words into a buffer of {}",
                data.len(),
                buffer.len()
            )));
        }
        buffer.write_words(0, data);
        Ok(())
    }

    fn enqueue_kernel(&self, launch: KernelLaunch<HostBuffer>, wait_list: &[Event]) -> Event {
        let done = Event::new();
        self.submit(Command::Kernel {
            launch,
            wait_list: wait_list.to_vec(),
            done: done.clone(),
        });
        done
    }

    fn enqueue_barrier(&self, wait_list: &[Event]) -> Event {
        let done = Event::new();
        self.submit(Command::Barrier {
            wait_list: wait_list.to_vec(),
            done: done.clone(),
        });
        done
    }

    fn read_buffer(&self, buffer: &HostBuffer, words: usize) -> Result<Vec<u32>, SystemError> {
        if words > buffer.len() {
            return Err(SystemError::DeviceUnavailable(format!(
                "read of {words} words from a buffer of {}",
                buffer.len()
            )));
        }
        let mut data = buffer.to_vec();
        data.truncate(words);
        Ok(data)
    }

    fn flush(&self) {}

    fn last_timings(&self) -> Option<PassTimings> {
        self.shared.timings().last()
    }
}

fn executor_loop(receiver: &Receiver<Command>, shared: &HostShared) {
    while let Ok(command) = receiver.recv() {
        match command {
            Command::Barrier { wait_list, done } => {
                shared.await_events(&wait_list);
                done.signal();
            }
            Command::Kernel {
                launch,
                wait_list,
                done,
            } => {
                if shared.await_events(&wait_list) {
                    let start = Instant::now();
                    execute(&launch);
                    shared.record(launch.kernel.stage(), start.elapsed());
                } else {
                    debug!(kernel = launch.kernel.name(), "kernel abandoned at shutdown");
                }
                done.signal();
            }
        }
    }
}

fn execute(launch: &KernelLaunch<HostBuffer>) {
    let u = &launch.uniforms;
    let items = launch.work_items as usize;
    let blocks = u.block_count as usize;
    let block = SCAN_BLOCK as usize;
    match &launch.kernel {
        Kernel::Fill { buffer, value } => buffer.fill(0..items.min(buffer.len()), *value),
        Kernel::CountHashes { particles, counters } => {
            let view = DynamicView::new(particles);
            count_range(counters, 0..items, |i| view.hash(i));
        }
        Kernel::ScanBlocks { counters, partials } => {
            for b in 0..items.min(blocks) {
                let start = (b * block).min(counters.len());
                let end = (start + block).min(counters.len());
                let total = scan_range(counters, start..end);
                partials.store(b, total);
            }
        }
        Kernel::ScanPartials { partials } => {
            scan_range(partials, 0..blocks);
        }
        Kernel::AddBlockOffsets { counters, partials } => {
            for b in 1..blocks {
                let start = (b * block).min(counters.len());
                let end = (start + block).min(counters.len());
                add_offset(counters, start..end, partials.load(b - 1));
            }
        }
        Kernel::Scatter {
            particles,
            counters,
            map,
        } => {
            let view = DynamicView::new(particles);
            scatter_range(counters, map, 0..items, |i| view.hash(i));
        }
        Kernel::Pressure(bindings) => {
            with_pass(u, bindings, |ctx| pressure::run(ctx, 0..items));
        }
        Kernel::Dynamics {
            pass,
            next_counters,
            diagnostics,
        } => {
            let boundary = u.boundary();
            let integration = Integration {
                dt: u.dt,
                boundary: &boundary,
                next_counters,
            };
            let degenerate = with_pass(u, pass, |ctx| dynamics::run(ctx, &integration, 0..items));
            if degenerate > 0 {
                diagnostics.fetch_add(0, degenerate);
            }
        }
    }
}

fn with_pass<R>(
    u: &SimUniforms,
    bindings: &PassBindings<HostBuffer>,
    body: impl FnOnce(&PassContext<'_, MortonCellHash>) -> R,
) -> R {
    let constants = u.constants();
    let grid = GridHasher::new(MortonCellHash, u.h, u.table_size);
    let static_grid = GridHasher::new(MortonCellHash, u.h, u.static_table_size);
    let ctx = PassContext {
        constants: &constants,
        grid: &grid,
        input: DynamicView::new(&bindings.input),
        output: DynamicView::new(&bindings.output),
        index: BucketIndex::new(&bindings.counters, &bindings.map),
        statics: (u.static_count > 0).then(|| StaticNeighbors {
            particles: StaticView::new(&bindings.static_particles),
            index: BucketIndex::new(&bindings.static_counters, &bindings.static_map),
            grid: &static_grid,
        }),
        reorder: u.reorder(),
    };
    body(&ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boundary::BoxBoundary;
    use crate::params::ParticleBehaviourParameters;
    use crate::smoothing::KernelConstants;

    fn uniforms(particles: u32, table_size: u32) -> SimUniforms {
        let constants = KernelConstants::new(&ParticleBehaviourParameters::default());
        SimUniforms::new(&constants, &BoxBoundary::disabled(), particles, table_size, 0, 1, false)
    }

    fn launch(kernel: Kernel<HostBuffer>, work_items: u32, uniforms: SimUniforms) -> KernelLaunch<HostBuffer> {
        KernelLaunch {
            kernel,
            work_items,
            uniforms,
        }
    }

    #[test]
    fn kernel_waits_for_its_wait_list() {
        let device = HostDevice::new().unwrap();
        let buffer = device.create_buffer(4, "fill").unwrap();
        let gate = Event::new();
        let u = uniforms(1, 3);
        let done = device.enqueue_kernel(
            launch(Kernel::Fill { buffer: buffer.clone(), value: 7 }, 4, u),
            std::slice::from_ref(&gate),
        );
        assert!(!done.wait_timeout(Duration::from_millis(20)));
        assert_eq!(buffer.to_vec(), vec![0; 4]);
        gate.signal();
        done.wait();
        assert_eq!(device.read_buffer(&buffer, 4).unwrap(), vec![7; 4]);
    }

    #[test]
    fn blocked_scan_yields_bucket_starts() {
        // 600 buckets span three scan blocks.
        let device = HostDevice::new().unwrap();
        let table = 600_u32;
        let u = uniforms(0, table);
        let counters = device.create_buffer(table as usize + 1, "counters").unwrap();
        let partials = device.create_buffer(u.block_count as usize, "partials").unwrap();
        let ones: Vec<u32> = (0..=table).map(|b| u32::from(b < table)).collect();
        device.write_buffer(&counters, &ones).unwrap();

        let a = device.enqueue_kernel(
            launch(Kernel::ScanBlocks { counters: counters.clone(), partials: partials.clone() }, u.block_count, u),
            &[],
        );
        let b = device.enqueue_kernel(launch(Kernel::ScanPartials { partials: partials.clone() }, 1, u), &[a]);
        let c = device.enqueue_kernel(
            launch(Kernel::AddBlockOffsets { counters: counters.clone(), partials }, table + 1, u),
            &[b],
        );
        c.wait();
        let scanned = device.read_buffer(&counters, table as usize + 1).unwrap();
        let expected: Vec<u32> = (1..=table).chain(std::iter::once(table)).collect();
        assert_eq!(scanned, expected);
    }

    #[test]
    fn barrier_completes_after_all_inputs() {
        let device = HostDevice::new().unwrap();
        let (a, b) = (Event::new(), Event::new());
        let barrier = device.enqueue_barrier(&[a.clone(), b.clone()]);
        a.signal();
        assert!(!barrier.wait_timeout(Duration::from_millis(20)));
        b.signal();
        barrier.wait();
    }

    #[test]
    fn oversized_transfers_are_rejected() {
        let device = HostDevice::new().unwrap();
        let buffer = device.create_buffer(2, "small").unwrap();
        assert!(device.write_buffer(&buffer, &[1, 2, 3]).is_err());
        assert!(device.read_buffer(&buffer, 3).is_err());
    }

    #[test]
    fn drop_abandons_blocked_commands() {
        let device = HostDevice::new().unwrap();
        let never = Event::new();
        let done = device.enqueue_barrier(std::slice::from_ref(&never));
        drop(device);
        assert!(done.is_complete());
    }
}
