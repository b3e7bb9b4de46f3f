//! Orchestration Layer
//!
//! This crate turns a scene description into a running simulation:
//! - Scene configuration loading and validation ([`config`])
//! - Particle-set blueprints ([`blueprint`])
//! - Back-end selection ([`create_system`])
//! - Simulation runner with lifecycle management ([`runner`])

#![warn(missing_docs)]

pub mod blueprint;
pub mod config;
pub mod runner;

pub use blueprint::Blueprint;
pub use config::{BackendConfig, SceneConfig};
pub use runner::{RunSettings, RunnerState, SimulationRunner};

use std::time::Duration;

use anyhow::Context;
use fluidsim_kernel::{CpuConfig, CpuSystem, DeviceConfig, DeviceSystem, HostDevice, ParticleSystem, SystemError};

/// Create an uninitialized particle system for the scene's back-end.
///
/// For `Auto`, uses the GPU when the `gpu` feature is enabled and an adapter
/// is available, and the CPU otherwise.
pub fn create_system(config: &SceneConfig) -> Result<Box<dyn ParticleSystem>, SystemError> {
    let device_config = DeviceConfig {
        generations: config.generations.unwrap_or(DeviceConfig::default().generations),
        reorder: config.reorder,
        ..Default::default()
    };

    match &config.backend {
        BackendConfig::Cpu { threads } => Ok(Box::new(cpu_system(config, *threads))),
        BackendConfig::HostDevice => {
            tracing::info!("Creating host-device particle system...");
            Ok(Box::new(DeviceSystem::new(HostDevice::new()?, device_config)))
        }
        #[cfg(feature = "gpu")]
        BackendConfig::Gpu => {
            tracing::info!("Creating GPU particle system...");
            Ok(Box::new(DeviceSystem::new(fluidsim_kernel::WgpuDevice::new()?, device_config)))
        }
        #[cfg(not(feature = "gpu"))]
        BackendConfig::Gpu => Err(SystemError::DeviceUnavailable(
            "GPU backend requested but the 'gpu' feature is not enabled".to_string(),
        )),
        #[cfg(feature = "gpu")]
        BackendConfig::Auto => {
            if fluidsim_kernel::gpu::gpu_available() {
                match fluidsim_kernel::WgpuDevice::new() {
                    Ok(device) => return Ok(Box::new(DeviceSystem::new(device, device_config))),
                    Err(e) => tracing::warn!("GPU init failed ({e}), falling back to CPU"),
                }
            } else {
                tracing::info!("No GPU available, using CPU system");
            }
            Ok(Box::new(cpu_system(config, None)))
        }
        #[cfg(not(feature = "gpu"))]
        BackendConfig::Auto => {
            tracing::info!("GPU feature not enabled, using CPU system");
            Ok(Box::new(cpu_system(config, None)))
        }
    }
}

fn cpu_system(config: &SceneConfig, threads: Option<usize>) -> CpuSystem {
    let defaults = CpuConfig::default();
    tracing::info!("Creating CPU particle system...");
    CpuSystem::new(CpuConfig {
        threads: threads.unwrap_or(defaults.threads),
        generations: config.generations.unwrap_or(defaults.generations),
        reorder: config.reorder,
    })
}

/// Run settings taken from the scene.
pub fn run_settings(config: &SceneConfig) -> RunSettings {
    RunSettings {
        dt: config.time_step,
        max_steps: config.max_steps,
        frame_time: config.frame_time_ms.map(Duration::from_millis),
    }
}

/// Build an initialized system for a validated scene.
pub fn build_system(config: &SceneConfig) -> anyhow::Result<Box<dyn ParticleSystem>> {
    let (dynamic, statics) = config.build_particles();
    tracing::info!(
        dynamic = dynamic.len(),
        statics = statics.len(),
        "Generated particles for scene '{}'",
        config.name
    );

    let mut system =
        create_system(config).with_context(|| format!("creating {} back-end", config.backend.name()))?;
    system
        .initialize(dynamic, statics, &config.parameters)
        .with_context(|| format!("initializing {} system", system.name()))?;
    Ok(system)
}

/// Create a complete simulation from a configuration file
///
/// Loads and validates the scene, generates its particles, initializes the
/// configured back-end and wraps it in a [`SimulationRunner`] that waits for
/// [`SimulationRunner::start`].
pub fn create_simulation(config_path: &str) -> anyhow::Result<SimulationRunner> {
    tracing::info!("Creating simulation from config: {}", config_path);
    let config = SceneConfig::load(config_path).map_err(anyhow::Error::msg)?;
    tracing::info!("Configuration loaded: {}", config.name);

    let system = build_system(&config)?;
    tracing::info!("Simulation ready to start");
    Ok(SimulationRunner::new(system, run_settings(&config)))
}
