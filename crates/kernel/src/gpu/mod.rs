//! GPU (Metal/Vulkan/DX12 via wgpu) implementation of [`ComputeDevice`].
//!
//! Each [`Kernel`] maps to one WGSL compute module built from a shared
//! prelude plus the kernel body. Pipelines use automatic layouts: binding 0
//! is the per-launch [`SimUniforms`], the storage buffers follow in the order
//! [`storage_bindings`] lists them.
//!
//! A dedicated executor thread receives enqueues, waits for each wait-list,
//! then encodes and submits the dispatch. Completion is reported through
//! `Queue::on_submitted_work_done`; the executor keeps polling the device so
//! those callbacks fire even when nobody else is waiting on the queue.
//!
//! Cell hashes use the Morton hash, as on every device.

pub mod buffers;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use wgpu::util::DeviceExt;

pub use buffers::GpuBuffer;

use crate::device::{ComputeDevice, Kernel, KernelLaunch, SimUniforms, StageClock};
use crate::error::SystemError;
use crate::sync::Event;
use crate::PassTimings;

/// Threads per workgroup; must match `WORKGROUP_SIZE` in the prelude.
const WORKGROUP_SIZE: u32 = 64;

/// Largest workgroup count per dispatch dimension.
const MAX_GROUPS_PER_DIM: u32 = 65_535;

/// Executor idle/poll interval.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

const PRELUDE: &str = include_str!("shaders/prelude.wgsl");

/// Check whether a GPU adapter is available.
pub fn gpu_available() -> bool {
    let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        ..Default::default()
    });
    let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
        power_preference: wgpu::PowerPreference::HighPerformance,
        compatible_surface: None,
        force_fallback_adapter: false,
    }));
    adapter.is_some()
}

struct KernelPipelines {
    fill: wgpu::ComputePipeline,
    count_hashes: wgpu::ComputePipeline,
    scan_blocks: wgpu::ComputePipeline,
    scan_partials: wgpu::ComputePipeline,
    add_block_offsets: wgpu::ComputePipeline,
    scatter: wgpu::ComputePipeline,
    pressure: wgpu::ComputePipeline,
    dynamics: wgpu::ComputePipeline,
}

impl KernelPipelines {
    fn new(device: &wgpu::Device) -> Self {
        let build = |label: &str, body: &str| {
            let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(label),
                source: wgpu::ShaderSource::Wgsl(format!("{PRELUDE}\n{body}").into()),
            });
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(label),
                layout: None,
                module: &module,
                entry_point: Some("main"),
                compilation_options: Default::default(),
                cache: None,
            })
        };
        Self {
            fill: build("fill", include_str!("shaders/fill.wgsl")),
            count_hashes: build("count_hashes", include_str!("shaders/count_hashes.wgsl")),
            scan_blocks: build("scan_blocks", include_str!("shaders/scan_blocks.wgsl")),
            scan_partials: build("scan_partials", include_str!("shaders/scan_partials.wgsl")),
            add_block_offsets: build("add_block_offsets", include_str!("shaders/add_block_offsets.wgsl")),
            scatter: build("scatter", include_str!("shaders/scatter.wgsl")),
            pressure: build("pressure", include_str!("shaders/pressure.wgsl")),
            dynamics: build("dynamics", include_str!("shaders/dynamics.wgsl")),
        }
    }

    fn for_kernel(&self, kernel: &Kernel<GpuBuffer>) -> &wgpu::ComputePipeline {
        match kernel {
            Kernel::Fill { .. } => &self.fill,
            Kernel::CountHashes { .. } => &self.count_hashes,
            Kernel::ScanBlocks { .. } => &self.scan_blocks,
            Kernel::ScanPartials { .. } => &self.scan_partials,
            Kernel::AddBlockOffsets { .. } => &self.add_block_offsets,
            Kernel::Scatter { .. } => &self.scatter,
            Kernel::Pressure(_) => &self.pressure,
            Kernel::Dynamics { .. } => &self.dynamics,
        }
    }
}

/// Storage buffers of `kernel` in binding order, starting at binding 1.
fn storage_bindings(kernel: &Kernel<GpuBuffer>) -> Vec<&GpuBuffer> {
    match kernel {
        Kernel::Fill { buffer, .. } => vec![buffer],
        Kernel::CountHashes { particles, counters } => vec![particles, counters],
        Kernel::ScanBlocks { counters, partials } => vec![counters, partials],
        Kernel::ScanPartials { partials } => vec![partials],
        Kernel::AddBlockOffsets { counters, partials } => vec![counters, partials],
        Kernel::Scatter {
            particles,
            counters,
            map,
        } => vec![particles, counters, map],
        Kernel::Pressure(b) => vec![
            &b.input,
            &b.output,
            &b.map,
            &b.counters,
            &b.static_particles,
            &b.static_map,
            &b.static_counters,
        ],
        Kernel::Dynamics {
            pass: b,
            next_counters,
            diagnostics,
        } => vec![
            &b.input,
            &b.output,
            &b.map,
            &b.counters,
            &b.static_particles,
            &b.static_map,
            &b.static_counters,
            next_counters,
            diagnostics,
        ],
    }
}

/// Workgroup grid covering `items` invocations.
fn dispatch_size(items: u32) -> (u32, u32) {
    let groups = items.div_ceil(WORKGROUP_SIZE);
    let x = groups.clamp(1, MAX_GROUPS_PER_DIM);
    (x, groups.div_ceil(x))
}

struct GpuContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipelines: KernelPipelines,
    timings: Arc<Mutex<StageClock>>,
    shutdown: AtomicBool,
}

impl GpuContext {
    fn poll(&self) {
        self.device.poll(wgpu::Maintain::Poll);
    }

    /// Wait for every event while keeping device callbacks flowing. Gives up
    /// on shutdown.
    fn await_events(&self, wait_list: &[Event]) -> bool {
        for event in wait_list {
            while !event.wait_timeout(POLL_INTERVAL) {
                self.poll();
                if self.shutdown.load(Ordering::Relaxed) {
                    return false;
                }
            }
        }
        true
    }

    fn submit_kernel(&self, launch: &KernelLaunch<GpuBuffer>, done: Event) {
        let mut uniforms: SimUniforms = launch.uniforms;
        uniforms.work_items = launch.work_items;
        if let Kernel::Fill { value, .. } = &launch.kernel {
            uniforms.fill_value = *value;
        }
        let name = launch.kernel.name();
        let pipeline = self.pipelines.for_kernel(&launch.kernel);

        let params = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("sim_uniforms"),
            contents: bytemuck::bytes_of(&uniforms),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let storage = storage_bindings(&launch.kernel);
        let mut entries = Vec::with_capacity(storage.len() + 1);
        entries.push(wgpu::BindGroupEntry {
            binding: 0,
            resource: params.as_entire_binding(),
        });
        for (slot, buffer) in storage.iter().enumerate() {
            entries.push(wgpu::BindGroupEntry {
                binding: slot as u32 + 1,
                resource: buffer.raw().as_entire_binding(),
            });
        }
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(name),
            layout: &pipeline.get_bind_group_layout(0),
            entries: &entries,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(name) });
        if launch.work_items > 0 {
            let (x, y) = dispatch_size(launch.work_items);
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(name),
                timestamp_writes: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(x, y, 1);
        }
        let submitted = Instant::now();
        self.queue.submit(std::iter::once(encoder.finish()));

        let stage = launch.kernel.stage();
        let timings = self.timings.clone();
        self.queue.on_submitted_work_done(move || {
            timings
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .record(stage, submitted.elapsed());
            done.signal();
        });
    }
}

enum Command {
    Kernel {
        launch: KernelLaunch<GpuBuffer>,
        wait_list: Vec<Event>,
        done: Event,
    },
    Barrier {
        wait_list: Vec<Event>,
        done: Event,
    },
}

fn executor_loop(context: &GpuContext, receiver: &Receiver<Command>) {
    loop {
        match receiver.recv_timeout(POLL_INTERVAL) {
            Ok(Command::Barrier { wait_list, done }) => {
                context.await_events(&wait_list);
                done.signal();
            }
            Ok(Command::Kernel {
                launch,
                wait_list,
                done,
            }) => {
                if context.await_events(&wait_list) {
                    context.submit_kernel(&launch, done);
                } else {
                    debug!(kernel = launch.kernel.name(), "kernel abandoned at shutdown");
                    done.signal();
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        context.poll();
    }
    // Fire the callbacks of work still on the queue.
    context.device.poll(wgpu::Maintain::Wait);
}

/// GPU compute device.
pub struct WgpuDevice {
    context: Arc<GpuContext>,
    adapter_name: String,
    sender: Option<Sender<Command>>,
    executor: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for WgpuDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WgpuDevice")
            .field("adapter", &self.adapter_name)
            .finish()
    }
}

impl WgpuDevice {
    /// Open the highest-performance adapter and compile every kernel.
    ///
    /// Returns `DeviceUnavailable` if no suitable adapter is found, allowing
    /// callers to fall back to another back-end.
    pub fn new() -> Result<Self, SystemError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| SystemError::DeviceUnavailable("no suitable GPU adapter found".into()))?;
        let adapter_name = adapter.get_info().name;
        info!(adapter = %adapter_name, "GPU adapter selected");

        // The dynamics kernel binds nine storage buffers; the default limit is
        // eight.
        let adapter_limits = adapter.limits();
        let mut required_limits = wgpu::Limits::default();
        required_limits.max_storage_buffers_per_shader_stage =
            adapter_limits.max_storage_buffers_per_shader_stage;
        if required_limits.max_storage_buffers_per_shader_stage < 9 {
            return Err(SystemError::DeviceUnavailable(format!(
                "adapter supports {} storage buffers per stage, 9 required",
                required_limits.max_storage_buffers_per_shader_stage
            )));
        }

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("fluidsim_gpu_device"),
                required_features: wgpu::Features::empty(),
                required_limits,
                memory_hints: wgpu::MemoryHints::Performance,
            },
            None,
        ))
        .map_err(|e| SystemError::DeviceUnavailable(format!("failed to create device: {e}")))?;

        let context = Arc::new(GpuContext {
            pipelines: KernelPipelines::new(&device),
            device,
            queue,
            timings: Arc::new(Mutex::new(StageClock::default())),
            shutdown: AtomicBool::new(false),
        });

        let (sender, receiver) = mpsc::channel();
        let executor = {
            let context = context.clone();
            thread::Builder::new()
                .name("fluidsim-gpu-executor".into())
                .spawn(move || executor_loop(&context, &receiver))
                .map_err(|e| SystemError::DeviceUnavailable(format!("gpu executor: {e}")))?
        };

        Ok(Self {
            context,
            adapter_name,
            sender: Some(sender),
            executor: Some(executor),
        })
    }

    /// Name of the adapter in use.
    pub fn adapter_name(&self) -> &str {
        &self.adapter_name
    }

    fn timings(&self) -> MutexGuard<'_, StageClock> {
        self.context.timings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn submit(&self, command: Command) {
        let Some(sender) = &self.sender else {
            return;
        };
        if let Err(mpsc::SendError(command)) = sender.send(command) {
            warn!("gpu executor gone, command dropped");
            match command {
                Command::Kernel { done, .. } | Command::Barrier { done, .. } => done.signal(),
            }
        }
    }
}

impl Drop for WgpuDevice {
    fn drop(&mut self) {
        self.context.shutdown.store(true, Ordering::Relaxed);
        self.sender = None;
        if let Some(handle) = self.executor.take() {
            if handle.join().is_err() {
                warn!("gpu executor panicked");
            }
        }
        debug!("gpu device stopped");
    }
}

impl ComputeDevice for WgpuDevice {
    type Buffer = GpuBuffer;

    fn name(&self) -> &'static str {
        "gpu"
    }

    fn create_buffer(&self, words: usize, label: &str) -> Result<GpuBuffer, SystemError> {
        Ok(buffers::create_storage_buf(&self.context.device, label, words))
    }

    fn write_buffer(&self, buffer: &GpuBuffer, data: &[u32]) -> Result<(), SystemError> {
        if data.len() > buffer.words() {
            return Err(SystemError::DeviceUnavailable(format!(
                "write of {} words into a buffer of {}",
                data.len(),
                buffer.words()
            )));
        }
        self.context
            .queue
            .write_buffer(buffer.raw(), 0, bytemuck::cast_slice(data));
        Ok(())
    }

    fn enqueue_kernel(&self, launch: KernelLaunch<GpuBuffer>, wait_list: &[Event]) -> Event {
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

    fn read_buffer(&self, buffer: &GpuBuffer, words: usize) -> Result<Vec<u32>, SystemError> {
        buffers::read_u32_buffer(&self.context.device, &self.context.queue, buffer, words)
    }

    fn flush(&self) {
        self.context.poll();
    }

    fn last_timings(&self) -> Option<PassTimings> {
        self.timings().last()
    }
}
