//! Axis-aligned box that keeps dynamic particles inside the simulation domain.
//!
//! The side walls (x and z) and the floor always apply when the box is
//! enabled; the roof is optional. A particle found past a face is clamped onto
//! it and the matching velocity component is scaled by `-wall_elasticity`.
//! Clamps onto a max face are inset by [`BOUNDARY_EPSILON`] so the particle
//! does not land exactly on the face and trigger it again next step.

use glam::Vec3;

use crate::params::ParticleBehaviourParameters;

/// Inset applied when clamping onto a max face.
pub const BOUNDARY_EPSILON: f32 = 1.0e-4;

/// Reflecting box boundary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoxBoundary {
    /// Minimum corner.
    pub min: Vec3,
    /// Maximum corner.
    pub max: Vec3,
    /// Whether any face applies.
    pub enabled: bool,
    /// Whether the top (`max.y`) face applies.
    pub roof: bool,
    /// Fraction of the normal velocity kept after a hit.
    pub wall_elasticity: f32,
}

impl BoxBoundary {
    /// Box described by the parameters' bounds and extras.
    pub fn from_params(params: &ParticleBehaviourParameters) -> Self {
        Self {
            min: params.bounds.min,
            max: params.bounds.max,
            enabled: params.bounded(),
            roof: params.bound_roof(),
            wall_elasticity: params.wall_elasticity(),
        }
    }

    /// A box that never touches particles.
    pub fn disabled() -> Self {
        Self {
            min: Vec3::ZERO,
            max: Vec3::ZERO,
            enabled: false,
            roof: false,
            wall_elasticity: 0.0,
        }
    }

    /// Clamp `position` into the box and reflect `velocity` on every face hit.
    #[inline]
    pub fn apply(&self, position: &mut Vec3, velocity: &mut Vec3) {
        if !self.enabled {
            return;
        }
        let bounce = -self.wall_elasticity;

        // x walls
        if position.x < self.min.x {
            position.x = self.min.x;
            velocity.x *= bounce;
        } else if position.x > self.max.x {
            position.x = self.max.x - BOUNDARY_EPSILON;
            velocity.x *= bounce;
        }

        // floor
        if position.y < self.min.y {
            position.y = self.min.y;
            velocity.y *= bounce;
        } else if self.roof && position.y > self.max.y {
            position.y = self.max.y - BOUNDARY_EPSILON;
            velocity.y *= bounce;
        }

        // z walls
        if position.z < self.min.z {
            position.z = self.min.z;
            velocity.z *= bounce;
        } else if position.z > self.max.z {
            position.z = self.max.z - BOUNDARY_EPSILON;
            velocity.z *= bounce;
        }
    }
}
