//! A fluid block dropped into a closed box stays inside it and stays finite.
//!
//! Runs a few hundred steps through the non-blocking `update` path with three
//! generations and a render lock taken every frame, the way a renderer would.

use fluidsim_kernel::{
    Bounds, CpuConfig, CpuSystem, DeviceConfig, DeviceSystem, DynamicParticle, HostDevice,
    ParticleBehaviourParameters, ParticleSystem, StepOutcome,
};
use glam::Vec3;

const FRAMES: usize = 200;

fn params() -> ParticleBehaviourParameters {
    let mut params = ParticleBehaviourParameters {
        particle_mass: 1.0,
        gas_constant: 4.0,
        rest_density: 2.0,
        viscosity: 1.0,
        interaction_radius: 1.0,
        gravity: Vec3::new(0.0, -9.81, 0.0),
        bounds: Bounds {
            min: Vec3::ZERO,
            max: Vec3::new(3.0, 3.0, 3.0),
        },
        ..Default::default()
    };
    params.extra.insert("boundRoof", true);
    params
}

fn block() -> Vec<DynamicParticle> {
    (0..125)
        .map(|i| {
            let p = Vec3::new((i % 5) as f32, ((i / 5) % 5) as f32, (i / 25) as f32) * 0.4;
            DynamicParticle::new(p + Vec3::new(0.5, 1.0, 0.5), Vec3::ZERO)
        })
        .collect()
}

fn drive(sys: &mut dyn ParticleSystem) {
    let params = params();
    sys.initialize(block(), vec![], &params).unwrap();
    let mut enqueued = 0_u64;
    for _ in 0..FRAMES {
        if sys.update(0.002).unwrap() == StepOutcome::Enqueued {
            enqueued += 1;
        }
        let guard = sys.lock_dynamic_particles_for_rendering().unwrap();
        assert_eq!(guard.len(), 125);
    }
    sys.synchronize().unwrap();

    let profile = sys.profiling_data();
    assert_eq!(profile.completed_steps, enqueued);
    assert_eq!(profile.completed_steps + profile.skipped_updates, FRAMES as u64);

    let b = params.bounds;
    let guard = sys.lock_dynamic_particles_for_rendering().unwrap();
    for (i, p) in guard.iter().enumerate() {
        assert!(p.position.is_finite() && p.velocity.is_finite(), "particle {i} not finite");
        assert!(
            p.position.cmpge(b.min).all() && p.position.cmple(b.max).all(),
            "particle {i} escaped: {}",
            p.position
        );
    }
}

#[test]
fn cpu_block_stays_in_box() {
    drive(&mut CpuSystem::new(CpuConfig {
        threads: 4,
        generations: 3,
        reorder: false,
    }));
}

#[test]
fn host_device_block_stays_in_box() {
    drive(&mut DeviceSystem::new(HostDevice::new().unwrap(), DeviceConfig::default()));
}
