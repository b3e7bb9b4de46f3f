//! Two-particle hand-computed scenario.
//!
//! Particles at (0,0,0) and (0.5,0,0) with h = 1, mass = 1, k = 1, rho0 = 0.
//! Every value is available in closed form:
//!
//! ```text
//! norm = 15 / pi
//! rho  = norm * (W0(0) + W0(0.5)) = norm * (1 + 0.125)
//! p    = rho
//! |F|  = 0.5 * norm * 2p * |W1(0.5)| = 0.75 * norm * p
//! |a|  = |F| / rho = 0.75 * norm
//! ```

use std::f32::consts::PI;

use fluidsim_kernel::{CpuConfig, CpuSystem, DynamicParticle, ParticleBehaviourParameters, ParticleSystem};
use glam::Vec3;

const DT: f32 = 0.001;

fn params() -> ParticleBehaviourParameters {
    let mut params = ParticleBehaviourParameters {
        particle_mass: 1.0,
        gas_constant: 1.0,
        rest_density: 0.0,
        viscosity: 0.5,
        interaction_radius: 1.0,
        gravity: Vec3::ZERO,
        ..Default::default()
    };
    params.extra.insert("bounded", false);
    params
}

fn run_one_step(threads: usize) -> Vec<DynamicParticle> {
    let mut sys = CpuSystem::new(CpuConfig {
        threads,
        ..Default::default()
    });
    let particles = vec![
        DynamicParticle::new(Vec3::ZERO, Vec3::ZERO),
        DynamicParticle::new(Vec3::new(0.5, 0.0, 0.0), Vec3::ZERO),
    ];
    sys.initialize(particles, vec![], &params()).unwrap();
    sys.step(DT).unwrap();
    sys.synchronize().unwrap();
    let guard = sys.lock_dynamic_particles_for_rendering().unwrap();
    guard.to_vec()
}

#[test]
fn pressures_match_hand_values() {
    let expected = 1.125 * 15.0 / PI;
    for p in run_one_step(1) {
        assert!(
            (p.pressure - expected).abs() < 1.0e-4,
            "pressure {} vs {expected}",
            p.pressure
        );
    }
}

#[test]
fn pair_repels_symmetrically() {
    let out = run_one_step(2);
    let accel = 0.75 * 15.0 / PI;

    // Particle 0 is pushed towards -x, particle 1 towards +x.
    assert!(out[0].velocity.x < 0.0);
    assert!(out[1].velocity.x > 0.0);
    assert!((out[0].velocity.x + accel * DT).abs() < 1.0e-5, "{}", out[0].velocity.x);
    assert!((out[1].velocity.x - accel * DT).abs() < 1.0e-5, "{}", out[1].velocity.x);

    // Equal and opposite, nothing off-axis.
    let momentum = out[0].velocity + out[1].velocity;
    assert!(momentum.length() < 1.0e-6, "net momentum {momentum}");
    for p in &out {
        assert!(p.velocity.y.abs() < 1.0e-7 && p.velocity.z.abs() < 1.0e-7);
    }
}

#[test]
fn positions_follow_symplectic_euler() {
    let out = run_one_step(1);
    // x += v dt with the already-updated velocity.
    let expected_shift = 0.75 * 15.0 / PI * DT * DT;
    assert!((out[0].position.x + expected_shift).abs() < 1.0e-7);
    assert!((out[1].position.x - 0.5 - expected_shift).abs() < 1.0e-6);
}
