//! CPU vs device parity.
//!
//! Runs the same scene on the CPU system and on the device system (host
//! device, and the wgpu device when the `gpu` feature is enabled and an
//! adapter exists), then compares the resulting particles.
//!
//! The back-ends hash cells differently, so neighbor summation order differs
//! and results only agree to floating-point tolerance. With reordering the
//! output order is bucket order, which depends on the hash, so only
//! order-independent aggregates are compared.

use fluidsim_kernel::{
    Bounds, CpuConfig, CpuSystem, DeviceConfig, DeviceSystem, DynamicParticle, HostDevice,
    ParticleBehaviourParameters, ParticleSystem, StaticParticle,
};
use glam::Vec3;

const STEPS: usize = 12;
const DT: f32 = 0.002;

fn params() -> ParticleBehaviourParameters {
    ParticleBehaviourParameters {
        particle_mass: 1.0,
        gas_constant: 2.0,
        rest_density: 1.0,
        viscosity: 0.3,
        interaction_radius: 1.0,
        gravity: Vec3::new(0.0, -9.81, 0.0),
        bounds: Bounds {
            min: Vec3::ZERO,
            max: Vec3::splat(4.0),
        },
        ..Default::default()
    }
}

/// 4x4x4 block resting near the floor plus a static floor patch under it.
fn scene() -> (Vec<DynamicParticle>, Vec<StaticParticle>) {
    let dynamic = (0..64)
        .map(|i| {
            let p = Vec3::new((i % 4) as f32, ((i / 4) % 4) as f32, (i / 16) as f32) * 0.45;
            DynamicParticle::new(p + Vec3::new(0.8, 0.3, 0.8), Vec3::new(0.05 * (i % 3) as f32, 0.0, 0.0))
        })
        .collect();
    let statics = (0..36)
        .map(|i| StaticParticle::new(Vec3::new((i % 6) as f32 * 0.5 + 0.5, 0.0, (i / 6) as f32 * 0.5 + 0.5)))
        .collect();
    (dynamic, statics)
}

fn run(sys: &mut dyn ParticleSystem) -> Vec<DynamicParticle> {
    let (dynamic, statics) = scene();
    sys.initialize(dynamic, statics, &params()).unwrap();
    for _ in 0..STEPS {
        sys.step(DT).unwrap();
    }
    sys.synchronize().unwrap();
    assert_eq!(sys.profiling_data().completed_steps, STEPS as u64);
    let guard = sys.lock_dynamic_particles_for_rendering().unwrap();
    guard.to_vec()
}

fn assert_close(label: &str, cpu: &[DynamicParticle], device: &[DynamicParticle]) {
    assert_eq!(cpu.len(), device.len());
    let mut max_pos = 0.0_f32;
    let mut max_vel = 0.0_f32;
    let mut max_pressure = 0.0_f32;
    for (a, b) in cpu.iter().zip(device) {
        max_pos = max_pos.max((a.position - b.position).length());
        max_vel = max_vel.max((a.velocity - b.velocity).length());
        max_pressure = max_pressure.max((a.pressure - b.pressure).abs() / a.pressure.abs().max(1.0));
    }
    eprintln!("{label}: max |dx| = {max_pos:e}, max |dv| = {max_vel:e}, max rel dp = {max_pressure:e}");
    assert!(max_pos < 1.0e-3, "{label}: positions diverged by {max_pos}");
    assert!(max_vel < 1.0e-2, "{label}: velocities diverged by {max_vel}");
    assert!(max_pressure < 1.0e-3, "{label}: pressures diverged by {max_pressure}");
}

fn centroid_and_energy(particles: &[DynamicParticle]) -> (Vec3, f32) {
    let n = particles.len() as f32;
    let centroid = particles.iter().map(|p| p.position).sum::<Vec3>() / n;
    let energy = particles.iter().map(|p| 0.5 * p.velocity.length_squared()).sum::<f32>();
    (centroid, energy)
}

#[test]
fn host_device_matches_cpu() {
    let cpu = run(&mut CpuSystem::new(CpuConfig {
        threads: 4,
        ..Default::default()
    }));
    let device = run(&mut DeviceSystem::new(HostDevice::new().unwrap(), DeviceConfig::default()));
    assert_close("host-device", &cpu, &device);
}

#[test]
fn thread_count_does_not_change_results() {
    let one = run(&mut CpuSystem::new(CpuConfig {
        threads: 1,
        ..Default::default()
    }));
    let many = run(&mut CpuSystem::new(CpuConfig {
        threads: 6,
        generations: 3,
        reorder: false,
    }));
    assert_close("cpu threads", &one, &many);
}

#[test]
fn reordered_runs_agree_in_aggregate() {
    let cpu = run(&mut CpuSystem::new(CpuConfig {
        threads: 3,
        generations: 2,
        reorder: true,
    }));
    let device = run(&mut DeviceSystem::new(
        HostDevice::new().unwrap(),
        DeviceConfig {
            reorder: true,
            ..Default::default()
        },
    ));
    let (c_cpu, e_cpu) = centroid_and_energy(&cpu);
    let (c_dev, e_dev) = centroid_and_energy(&device);
    assert!((c_cpu - c_dev).length() < 1.0e-3, "centroid {c_cpu} vs {c_dev}");
    assert!((e_cpu - e_dev).abs() < 1.0e-3 * e_cpu.max(1.0), "energy {e_cpu} vs {e_dev}");
}

#[cfg(feature = "gpu")]
#[test]
fn wgpu_device_matches_cpu() {
    if !fluidsim_kernel::gpu::gpu_available() {
        eprintln!("Skipping: no GPU adapter available");
        return;
    }
    let gpu = match fluidsim_kernel::WgpuDevice::new() {
        Ok(device) => device,
        Err(e) => {
            eprintln!("Skipping: {e}");
            return;
        }
    };
    let cpu = run(&mut CpuSystem::new(CpuConfig {
        threads: 2,
        ..Default::default()
    }));
    let device = run(&mut DeviceSystem::new(gpu, DeviceConfig::default()));
    assert_close("wgpu", &cpu, &device);
}
