//! Step-level invariants of the CPU system.
//!
//! Covers idempotence (zero steps, zero time step), coincident particles, a
//! lone particle in free flight and the box wall response.

use fluidsim_kernel::params::hash_table_size;
use fluidsim_kernel::{
    Bounds, CpuConfig, CpuSystem, DynamicParticle, GridHasher, ParticleBehaviourParameters, ParticleSystem,
    XorCellHash,
};
use glam::Vec3;

fn params() -> ParticleBehaviourParameters {
    ParticleBehaviourParameters {
        particle_mass: 1.0,
        gas_constant: 1.0,
        rest_density: 0.0,
        viscosity: 0.2,
        interaction_radius: 1.0,
        gravity: Vec3::ZERO,
        bounds: Bounds {
            min: Vec3::ZERO,
            max: Vec3::ONE,
        },
        ..Default::default()
    }
}

fn unbounded() -> ParticleBehaviourParameters {
    let mut p = params();
    p.extra.insert("bounded", false);
    p
}

fn cpu(threads: usize) -> CpuSystem {
    CpuSystem::new(CpuConfig {
        threads,
        ..Default::default()
    })
}

fn block(n: usize, spacing: f32) -> Vec<DynamicParticle> {
    (0..n)
        .map(|i| {
            let p = Vec3::new((i % 4) as f32, ((i / 4) % 4) as f32, (i / 16) as f32) * spacing;
            let v = Vec3::new(0.1 * (i % 3) as f32, -0.05, 0.02 * (i % 5) as f32);
            DynamicParticle::new(p + Vec3::splat(3.0), v)
        })
        .collect()
}

fn snapshot(sys: &CpuSystem) -> Vec<DynamicParticle> {
    sys.lock_dynamic_particles_for_rendering().unwrap().to_vec()
}

#[test]
fn zero_steps_leave_state_untouched() {
    let initial = block(32, 0.4);
    let mut sys = cpu(3);
    sys.initialize(initial.clone(), vec![], &unbounded()).unwrap();
    let out = snapshot(&sys);
    for (a, b) in initial.iter().zip(&out) {
        assert_eq!(a.position, b.position);
        assert_eq!(a.velocity, b.velocity);
    }
    assert_eq!(sys.profiling_data().completed_steps, 0);
}

#[test]
fn zero_time_step_keeps_positions_and_rehashes() {
    let initial = block(48, 0.4);
    let params = unbounded();
    let mut sys = cpu(4);
    sys.initialize(initial.clone(), vec![], &params).unwrap();
    for _ in 0..3 {
        sys.step(0.0).unwrap();
    }
    sys.synchronize().unwrap();
    assert_eq!(sys.profiling_data().completed_steps, 3);

    let grid = GridHasher::new(
        XorCellHash,
        params.interaction_radius,
        hash_table_size(initial.len(), params.dynamic_table_factor()),
    );
    let out = snapshot(&sys);
    for (a, b) in initial.iter().zip(&out) {
        assert_eq!(a.position, b.position);
        assert_eq!(a.velocity, b.velocity);
        assert_eq!(b.hash, grid.bucket_of(b.position));
        assert!(b.pressure > 0.0, "pressure pass did not run");
    }
}

#[test]
fn coincident_pair_is_counted_and_stays_finite() {
    let at = Vec3::new(0.5, 0.5, 0.5);
    let mut sys = cpu(2);
    sys.initialize(
        vec![DynamicParticle::new(at, Vec3::ZERO), DynamicParticle::new(at, Vec3::ZERO)],
        vec![],
        &unbounded(),
    )
    .unwrap();
    sys.step(0.01).unwrap();
    sys.synchronize().unwrap();

    // Each particle sees the other once.
    assert_eq!(sys.profiling_data().degenerate_pairs, 2);
    let out = snapshot(&sys);
    for p in &out {
        assert!(p.position.is_finite() && p.velocity.is_finite() && p.pressure.is_finite());
    }
    assert_ne!(out[0].position, out[1].position);
    // Pushed apart along opposite directions.
    assert!(out[0].velocity.dot(out[1].velocity) < 0.0);
    assert!((out[0].velocity + out[1].velocity).length() < 1.0e-5);
}

#[test]
fn lone_particle_keeps_constant_velocity() {
    let v = Vec3::new(0.3, -0.2, 0.1);
    let x0 = Vec3::new(2.0, 2.0, 2.0);
    let dt = 0.01;
    let steps = 25;
    let mut sys = cpu(2);
    sys.initialize(vec![DynamicParticle::new(x0, v)], vec![], &unbounded())
        .unwrap();
    for _ in 0..steps {
        sys.step(dt).unwrap();
    }
    sys.synchronize().unwrap();

    let out = snapshot(&sys);
    assert_eq!(out[0].velocity, v);
    let expected = x0 + v * dt * steps as f32;
    assert!((out[0].position - expected).length() < 1.0e-5, "{} vs {expected}", out[0].position);
    assert_eq!(sys.profiling_data().degenerate_pairs, 0);
}

#[test]
fn wall_reflects_with_elasticity() {
    let mut params = params();
    params.interaction_radius = 0.1;
    params.extra.insert("wallElasticity", 0.8);
    let mut sys = cpu(1);
    sys.initialize(
        vec![
            // Just outside the near x wall, moving away from the box.
            DynamicParticle::new(Vec3::new(-0.001, 0.5, 0.5), Vec3::new(-1.0, 0.0, 0.0)),
            // Just outside the far z wall, moving away from the box.
            DynamicParticle::new(Vec3::new(0.2, 0.5, 1.001), Vec3::new(0.0, 0.0, 1.0)),
        ],
        vec![],
        &params,
    )
    .unwrap();
    sys.step(0.01).unwrap();
    sys.synchronize().unwrap();

    let out = snapshot(&sys);
    assert_eq!(out[0].velocity.x, 0.8);
    assert_eq!(out[0].position.x, 0.0);
    assert_eq!(out[1].velocity.z, -0.8);
    assert_eq!(out[1].position.z, 1.0 - fluidsim_kernel::boundary::BOUNDARY_EPSILON);
}

#[test]
fn open_roof_lets_particles_leave_upwards() {
    let mut sys = cpu(1);
    sys.initialize(
        vec![DynamicParticle::new(Vec3::new(0.5, 0.999, 0.5), Vec3::new(0.0, 1.0, 0.0))],
        vec![],
        &params(),
    )
    .unwrap();
    sys.step(0.01).unwrap();
    sys.synchronize().unwrap();
    let out = snapshot(&sys);
    assert!(out[0].position.y > 1.0);
    assert_eq!(out[0].velocity.y, 1.0);
}
