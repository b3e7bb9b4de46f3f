//! Dynamics pass: forces, integration, boundary and next-step hashing.
//!
//! The particle's density is recovered from the pressure written by the
//! pressure pass through the inverse equation of state. Forces use the
//! symmetric pressure form and the velocity-difference viscosity form:
//!
//! ```text
//! F_p = -0.5 * mass * norm * sum dir * (p_i + p_j) * W1
//! F_v = viscosity * mass * norm * sum (v_j - v_i) * W2
//! a   = (F_p + F_v) / rho_i + g
//! v  += a dt;  x += v dt
//! ```
//!
//! Static neighbors respond with `2 |p_i|` (they push, never pull) and are
//! treated as having zero velocity. Their viscosity term is scaled by
//! [`STATIC_VISCOSITY_SCALE`].
//!
//! After integration the new bucket is stored in the particle and counted into
//! the next step's counters, which replaces the count phase of the next
//! bucket index build.

use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use glam::Vec3;
use tracing::warn;

use crate::boundary::BoxBoundary;
use crate::eos::density_from_pressure;
use crate::hashing::CellHash;
use crate::pass::PassContext;
use crate::smoothing::{pair_direction, w1, w2};
use crate::storage::AtomicWords;

/// Scale of the viscosity force from static neighbors.
///
/// Zero, which disables the term. Kept as a named constant so the term stays
/// visible until its intended value is settled.
pub const STATIC_VISCOSITY_SCALE: f32 = 0.0;

/// Per-step inputs of the dynamics pass beyond the shared pass context.
#[derive(Debug, Clone, Copy)]
pub struct Integration<'a> {
    /// Time step.
    pub dt: f32,
    /// Box applied after integration.
    pub boundary: &'a BoxBoundary,
    /// Zeroed `M + 1` counters receiving next-step bucket populations.
    pub next_counters: &'a AtomicWords,
}

/// Force on the particle in `slot`, and the number of coincident neighbors.
pub fn force_at<H: CellHash>(ctx: &PassContext<'_, H>, slot: usize) -> (Vec3, u32) {
    let c = ctx.constants;
    let i = ctx.index.particle(slot);
    let xi = ctx.input.position(i);
    let vi = ctx.input.velocity(i);
    let pi = ctx.output.pressure(ctx.output_index(slot));
    let mut degenerate = 0_u32;

    let mut pressure_sum = Vec3::ZERO;
    let mut viscosity_sum = Vec3::ZERO;
    for &bucket in ctx.grid.neighbor_buckets(xi).as_slice() {
        for s in ctx.index.bucket(bucket) {
            if s == slot {
                continue;
            }
            let j = ctx.index.particle(s);
            let d = xi - ctx.input.position(j);
            let r2 = d.length_squared();
            if r2 > c.h_sq {
                continue;
            }
            let r = r2.sqrt();
            let dir = if r > 0.0 {
                d / r
            } else {
                degenerate += 1;
                pair_direction(i, j)
            };
            let pj = ctx.output.pressure(ctx.output_index(s));
            pressure_sum += dir * (pi + pj) * w1(r, c.h);
            viscosity_sum += (ctx.input.velocity(j) - vi) * w2(r, c.h);
        }
    }

    let mut static_pressure = Vec3::ZERO;
    let mut static_viscosity = Vec3::ZERO;
    if let Some(statics) = &ctx.statics {
        let seed_base = ctx.particle_count();
        for &bucket in statics.grid.neighbor_buckets(xi).as_slice() {
            for s in statics.index.bucket(bucket) {
                let j = statics.index.particle(s);
                let d = xi - statics.particles.position(j);
                let r2 = d.length_squared();
                if r2 > c.h_sq {
                    continue;
                }
                let r = r2.sqrt();
                let dir = if r > 0.0 {
                    d / r
                } else {
                    degenerate += 1;
                    pair_direction(i, seed_base + j)
                };
                static_pressure += dir * (2.0 * pi.abs()) * w1(r, c.h);
                static_viscosity += -vi * w2(r, c.h);
            }
        }
    }

    let pressure_total = pressure_sum + static_pressure;
    let viscosity_total = viscosity_sum + static_viscosity * STATIC_VISCOSITY_SCALE;
    let force = pressure_total * (-0.5 * c.mass * c.norm) + viscosity_total * (c.viscosity * c.mass * c.norm);
    (force, degenerate)
}

/// Run the dynamics pass over `slots`. Returns the coincident pairs seen.
pub fn run<H: CellHash>(ctx: &PassContext<'_, H>, step: &Integration<'_>, slots: Range<usize>) -> u32 {
    let c = ctx.constants;
    let mut degenerate = 0_u32;
    for slot in slots {
        let i = ctx.index.particle(slot);
        let dst = ctx.output_index(slot);
        let (force, pairs) = force_at(ctx, slot);
        degenerate += pairs;

        let density = density_from_pressure(ctx.output.pressure(dst), c.rest_density, c.gas_constant);
        let acceleration = force / density + c.gravity;

        let mut velocity = ctx.input.velocity(i) + acceleration * step.dt;
        let mut position = ctx.input.position(i) + velocity * step.dt;
        step.boundary.apply(&mut position, &mut velocity);

        let hash = ctx.grid.bucket_of(position);
        ctx.output.set_motion(dst, position, velocity, hash);
        step.next_counters.fetch_add(hash as usize, 1);
    }
    degenerate
}

/// Running count of coincident particle pairs.
///
/// The first occurrence is logged as a warning: from then on the run depends
/// on the tiebreak direction and is no longer physically meaningful for those
/// particles. Later occurrences are only counted.
#[derive(Debug, Default)]
pub struct DegeneracyLog {
    pairs: AtomicU64,
    warned: AtomicBool,
}

impl DegeneracyLog {
    /// Fresh log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `pairs` coincident pairs seen during a pass.
    pub fn record(&self, pairs: u64) {
        if pairs == 0 {
            return;
        }
        self.pairs.fetch_add(pairs, Ordering::Relaxed);
        if !self.warned.swap(true, Ordering::Relaxed) {
            warn!(
                pairs,
                "coincident particles separated by pseudo-random direction; results are no longer deterministic"
            );
        }
    }

    /// Total pairs recorded.
    pub fn total(&self) -> u64 {
        self.pairs.load(Ordering::Relaxed)
    }

    /// Forget all recorded pairs.
    pub fn reset(&self) {
        self.pairs.store(0, Ordering::Relaxed);
        self.warned.store(false, Ordering::Relaxed);
    }
}
