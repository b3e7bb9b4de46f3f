//! Smoothing kernel functions and the per-simulation constants derived from them.
//!
//! The kernel family used by both passes is the spiky kernel of Müller et al.
//! (2003), written without its normalization so the constant can be applied
//! once per sum instead of once per neighbor pair:
//!
//! ```text
//! W0(r, h) = (h - r)^3        value
//! W1(r, h) = -3 (h - r)^2     gradient magnitude
//! W2(r, h) = 6 (h - r)        Laplacian
//! norm(h)  = 15 / (pi h^6)
//! ```
//!
//! All three are zero for `r >= h`.

use std::f32::consts::PI;

use glam::Vec3;

use crate::params::ParticleBehaviourParameters;

/// Kernel value term `(h - r)^3`, zero outside the support.
#[inline]
pub fn w0(r: f32, h: f32) -> f32 {
    if r < h {
        let d = h - r;
        d * d * d
    } else {
        0.0
    }
}

/// Kernel gradient term `-3 (h - r)^2`, zero outside the support.
#[inline]
pub fn w1(r: f32, h: f32) -> f32 {
    if r < h {
        let d = h - r;
        -3.0 * d * d
    } else {
        0.0
    }
}

/// Kernel Laplacian term `6 (h - r)`, zero outside the support.
#[inline]
pub fn w2(r: f32, h: f32) -> f32 {
    if r < h {
        6.0 * (h - r)
    } else {
        0.0
    }
}

/// Normalization constant `15 / (pi h^6)` shared by `w0`, `w1` and `w2`.
#[inline]
pub fn normalization(h: f32) -> f32 {
    15.0 / (PI * h.powi(6))
}

/// Sine-hash noise in `[0, 1)`.
#[inline]
pub fn noise(x: f32) -> f32 {
    let s = (x * 12.9898).sin() * 43758.547;
    let f = s - s.floor();
    // Tiny negative `s` rounds up to exactly 1.0.
    if f < 1.0 {
        f
    } else {
        0.0
    }
}

/// Deterministic pseudo-random unit vector for a scalar seed.
///
/// Only used to separate particles that sit on exactly the same point, where
/// the pair direction is undefined.
pub fn random_direction(seed: f32) -> Vec3 {
    let v = Vec3::new(noise(seed), noise(seed + 17.17), noise(seed + 43.43)) * 2.0 - Vec3::ONE;
    v.try_normalize().unwrap_or(Vec3::X)
}

/// Seed-derived direction for the coincident pair `(i, j)`.
///
/// The seed only depends on the unordered pair, and the sign flips with the
/// order, so `i` and `j` are pushed in opposite directions.
pub fn pair_direction(i: usize, j: usize) -> Vec3 {
    let (lo, hi) = if i < j { (i, j) } else { (j, i) };
    let seed = lo as f32 * 0.618_034 + hi as f32 * 1.324_718;
    let dir = random_direction(seed);
    if i < j {
        dir
    } else {
        -dir
    }
}

/// Constants read by every pass, precomputed once at initialization.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KernelConstants {
    /// Interaction radius `h`.
    pub h: f32,
    /// `h^2`, compared against squared pair distances.
    pub h_sq: f32,
    /// `15 / (pi h^6)`.
    pub norm: f32,
    /// Particle mass (all dynamic particles share it).
    pub mass: f32,
    /// Density a particle contributes to itself: `mass * W0(0, h) * norm`.
    pub self_density: f32,
    /// Equation-of-state stiffness.
    pub gas_constant: f32,
    /// Density at which pressure is zero.
    pub rest_density: f32,
    /// Viscosity coefficient.
    pub viscosity: f32,
    /// Gravitational acceleration.
    pub gravity: Vec3,
}

impl KernelConstants {
    /// Derive the pass constants from the behaviour parameters.
    pub fn new(params: &ParticleBehaviourParameters) -> Self {
        let h = params.interaction_radius;
        let norm = normalization(h);
        Self {
            h,
            h_sq: h * h,
            norm,
            mass: params.particle_mass,
            self_density: params.particle_mass * w0(0.0, h) * norm,
            gas_constant: params.gas_constant,
            rest_density: params.rest_density,
            viscosity: params.viscosity,
            gravity: params.gravity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_terms_at_zero_distance() {
        let h = 2.0;
        assert_eq!(w0(0.0, h), 8.0);
        assert_eq!(w1(0.0, h), -12.0);
        assert_eq!(w2(0.0, h), 12.0);
    }

    #[test]
    fn kernel_terms_vanish_at_and_beyond_support() {
        for r in [1.0_f32, 1.5, 10.0] {
            assert_eq!(w0(r, 1.0), 0.0);
            assert_eq!(w1(r, 1.0), 0.0);
            assert_eq!(w2(r, 1.0), 0.0);
        }
    }

    #[test]
    fn gradient_term_is_derivative_of_value_term() {
        let h = 1.0;
        let eps = 1.0e-3;
        for r in [0.1_f32, 0.4, 0.8] {
            let numeric = (w0(r + eps, h) - w0(r - eps, h)) / (2.0 * eps);
            assert!((numeric - w1(r, h)).abs() < 1.0e-3, "r={r}: {numeric} vs {}", w1(r, h));
        }
    }

    #[test]
    fn normalization_integrates_value_term_to_one() {
        // Radial integral of 4 pi r^2 W0(r) norm over [0, h].
        let h = 0.5_f32;
        let steps = 10_000;
        let dr = h / steps as f32;
        let mut integral = 0.0_f64;
        for k in 0..steps {
            let r = (k as f32 + 0.5) * dr;
            integral += (4.0 * PI * r * r * w0(r, h) * normalization(h) * dr) as f64;
        }
        assert!((integral - 1.0).abs() < 1.0e-3, "integral = {integral}");
    }

    #[test]
    fn noise_is_deterministic_and_in_unit_interval() {
        for k in 0..100 {
            let x = k as f32 * 0.37;
            let n = noise(x);
            assert!((0.0..1.0).contains(&n));
            assert_eq!(n, noise(x));
        }
    }

    #[test]
    fn random_direction_is_unit_length() {
        for k in 0..50 {
            let d = random_direction(k as f32);
            assert!((d.length() - 1.0).abs() < 1.0e-5);
        }
    }

    #[test]
    fn pair_direction_is_antisymmetric() {
        let a = pair_direction(3, 11);
        let b = pair_direction(11, 3);
        assert!((a + b).length() < 1.0e-6);
    }

    #[test]
    fn self_density_matches_formula() {
        let params = ParticleBehaviourParameters {
            particle_mass: 2.0,
            interaction_radius: 1.0,
            ..ParticleBehaviourParameters::default()
        };
        let c = KernelConstants::new(&params);
        assert!((c.self_density - 2.0 * 15.0 / PI).abs() < 1.0e-5);
        assert_eq!(c.h_sq, 1.0);
    }
}
