//! Particle-set blueprints
//!
//! A blueprint describes a block of particles declaratively; generating it
//! yields particles on a regular lattice in a fixed order (x fastest, then y,
//! then z), so the same scene always produces the same particle indices.

use fluidsim_kernel::{DynamicParticle, StaticParticle};
use glam::Vec3;
use serde::{Deserialize, Serialize};

/// Upper bound on the particles a single blueprint may generate.
pub const MAX_BLUEPRINT_PARTICLES: usize = 16 * 1024 * 1024;

/// A generator of particle positions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Blueprint {
    /// Solid axis-aligned block.
    Box {
        /// Minimum corner.
        min: Vec3,
        /// Maximum corner.
        max: Vec3,
        /// Lattice spacing.
        spacing: f32,
        /// Initial velocity of every particle.
        #[serde(default)]
        velocity: Vec3,
    },
    /// Solid ball.
    Sphere {
        /// Center.
        center: Vec3,
        /// Radius.
        radius: f32,
        /// Lattice spacing.
        spacing: f32,
        /// Initial velocity of every particle.
        #[serde(default)]
        velocity: Vec3,
    },
    /// Flat rectangular sheet, typically static geometry.
    #[serde(rename_all = "camelCase")]
    Plane {
        /// First corner.
        origin: Vec3,
        /// First edge direction.
        axis_u: Vec3,
        /// Second edge direction.
        axis_v: Vec3,
        /// Length along `axis_u`.
        extent_u: f32,
        /// Length along `axis_v`.
        extent_v: f32,
        /// Lattice spacing.
        spacing: f32,
    },
    /// Open-top container: floor plus four side walls.
    Walls {
        /// Minimum corner.
        min: Vec3,
        /// Maximum corner.
        max: Vec3,
        /// Lattice spacing.
        spacing: f32,
    },
}

/// Lattice points along an edge of length `extent`, both ends included.
fn steps(extent: f32, spacing: f32) -> usize {
    // Tolerate rounding so an exact multiple keeps its far end.
    (extent / spacing + 1.0e-4).floor() as usize + 1
}

fn lattice_dims(min: Vec3, max: Vec3, spacing: f32) -> [usize; 3] {
    let extent = max - min;
    [
        steps(extent.x, spacing),
        steps(extent.y, spacing),
        steps(extent.z, spacing),
    ]
}

impl Blueprint {
    /// Short kind name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Blueprint::Box { .. } => "box",
            Blueprint::Sphere { .. } => "sphere",
            Blueprint::Plane { .. } => "plane",
            Blueprint::Walls { .. } => "walls",
        }
    }

    fn spacing(&self) -> f32 {
        match *self {
            Blueprint::Box { spacing, .. }
            | Blueprint::Sphere { spacing, .. }
            | Blueprint::Plane { spacing, .. }
            | Blueprint::Walls { spacing, .. } => spacing,
        }
    }

    /// Initial velocity of generated dynamic particles.
    pub fn velocity(&self) -> Vec3 {
        match *self {
            Blueprint::Box { velocity, .. } | Blueprint::Sphere { velocity, .. } => velocity,
            Blueprint::Plane { .. } | Blueprint::Walls { .. } => Vec3::ZERO,
        }
    }

    /// Check that the blueprint describes a finite, non-empty lattice.
    pub fn validate(&self) -> Result<(), String> {
        let spacing = self.spacing();
        if !(spacing.is_finite() && spacing > 0.0) {
            return Err(format!("{}: spacing must be positive, got {spacing}", self.kind()));
        }
        match *self {
            Blueprint::Box { min, max, .. } | Blueprint::Walls { min, max, .. } => {
                if !(min.is_finite() && max.is_finite()) || min.cmpgt(max).any() {
                    return Err(format!("{}: min {min} must not exceed max {max}", self.kind()));
                }
            }
            Blueprint::Sphere { center, radius, .. } => {
                if !center.is_finite() || !(radius.is_finite() && radius >= 0.0) {
                    return Err(format!("sphere: invalid center {center} or radius {radius}"));
                }
            }
            Blueprint::Plane {
                origin,
                axis_u,
                axis_v,
                extent_u,
                extent_v,
                ..
            } => {
                if !origin.is_finite() {
                    return Err(format!("plane: invalid origin {origin}"));
                }
                if axis_u.try_normalize().is_none() || axis_v.try_normalize().is_none() {
                    return Err("plane: axes must be non-zero".to_string());
                }
                if !(extent_u >= 0.0 && extent_v >= 0.0) {
                    return Err(format!("plane: extents must be non-negative, got {extent_u} x {extent_v}"));
                }
            }
        }
        let estimate = self.lattice_size();
        if estimate > MAX_BLUEPRINT_PARTICLES {
            return Err(format!(
                "{}: lattice of {estimate} points exceeds {MAX_BLUEPRINT_PARTICLES}",
                self.kind()
            ));
        }
        Ok(())
    }

    /// Points of the enclosing lattice before any shape filtering.
    fn lattice_size(&self) -> usize {
        let spacing = self.spacing();
        match *self {
            Blueprint::Box { min, max, .. } | Blueprint::Walls { min, max, .. } => {
                lattice_dims(min, max, spacing).iter().product()
            }
            Blueprint::Sphere { radius, .. } => steps(2.0 * radius, spacing).pow(3),
            Blueprint::Plane { extent_u, extent_v, .. } => steps(extent_u, spacing) * steps(extent_v, spacing),
        }
    }

    /// Lattice positions in generation order.
    pub fn positions(&self) -> Vec<Vec3> {
        let spacing = self.spacing();
        match *self {
            Blueprint::Box { min, max, .. } => {
                let [nx, ny, nz] = lattice_dims(min, max, spacing);
                let mut out = Vec::with_capacity(nx * ny * nz);
                for k in 0..nz {
                    for j in 0..ny {
                        for i in 0..nx {
                            out.push(min + Vec3::new(i as f32, j as f32, k as f32) * spacing);
                        }
                    }
                }
                out
            }
            Blueprint::Sphere { center, radius, .. } => {
                let n = steps(2.0 * radius, spacing);
                let corner = center - Vec3::splat(radius);
                let r2 = radius * radius * (1.0 + 1.0e-5);
                let mut out = Vec::new();
                for k in 0..n {
                    for j in 0..n {
                        for i in 0..n {
                            let p = corner + Vec3::new(i as f32, j as f32, k as f32) * spacing;
                            if (p - center).length_squared() <= r2 {
                                out.push(p);
                            }
                        }
                    }
                }
                out
            }
            Blueprint::Plane {
                origin,
                axis_u,
                axis_v,
                extent_u,
                extent_v,
                ..
            } => {
                let u = axis_u.normalize_or_zero() * spacing;
                let v = axis_v.normalize_or_zero() * spacing;
                let (nu, nv) = (steps(extent_u, spacing), steps(extent_v, spacing));
                let mut out = Vec::with_capacity(nu * nv);
                for b in 0..nv {
                    for a in 0..nu {
                        out.push(origin + u * a as f32 + v * b as f32);
                    }
                }
                out
            }
            Blueprint::Walls { min, max, .. } => {
                let [nx, ny, nz] = lattice_dims(min, max, spacing);
                let mut out = Vec::new();
                for k in 0..nz {
                    for j in 0..ny {
                        for i in 0..nx {
                            let side = i == 0 || i + 1 == nx || k == 0 || k + 1 == nz;
                            if side || j == 0 {
                                out.push(min + Vec3::new(i as f32, j as f32, k as f32) * spacing);
                            }
                        }
                    }
                }
                out
            }
        }
    }

    /// Fluid particles at the lattice positions, moving at [`Self::velocity`].
    pub fn generate_dynamic(&self) -> Vec<DynamicParticle> {
        let velocity = self.velocity();
        self.positions()
            .into_iter()
            .map(|p| DynamicParticle::new(p, velocity))
            .collect()
    }

    /// Boundary particles at the lattice positions.
    pub fn generate_static(&self) -> Vec<StaticParticle> {
        self.positions().into_iter().map(StaticParticle::new).collect()
    }
}
