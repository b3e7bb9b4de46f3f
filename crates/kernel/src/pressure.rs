//! Pressure pass: density summation and equation of state.
//!
//! For the particle in slot `k` the 27 cells around it are searched in both
//! the dynamic and the static index:
//!
//! ```text
//! rho_i = self_density + (sum_dyn W0 + sum_static W0) * mass * norm
//! p_i   = k (rho_i - rho0)
//! ```
//!
//! Only input positions are read. The full input record, with the new
//! pressure, is written to the output generation so the dynamics pass can
//! rely on every output slot being populated.

use std::ops::Range;

use crate::eos::pressure_from_density;
use crate::hashing::CellHash;
use crate::pass::PassContext;
use crate::smoothing::w0;

/// Density of the particle in `slot`.
pub fn density_at<H: CellHash>(ctx: &PassContext<'_, H>, slot: usize) -> f32 {
    let c = ctx.constants;
    let i = ctx.index.particle(slot);
    let xi = ctx.input.position(i);

    let mut dynamic_sum = 0.0_f32;
    for &bucket in ctx.grid.neighbor_buckets(xi).as_slice() {
        for s in ctx.index.bucket(bucket) {
            if s == slot {
                continue;
            }
            let j = ctx.index.particle(s);
            let r2 = (xi - ctx.input.position(j)).length_squared();
            if r2 > c.h_sq {
                continue;
            }
            dynamic_sum += w0(r2.sqrt(), c.h);
        }
    }

    let mut static_sum = 0.0_f32;
    if let Some(statics) = &ctx.statics {
        for &bucket in statics.grid.neighbor_buckets(xi).as_slice() {
            for s in statics.index.bucket(bucket) {
                let j = statics.index.particle(s);
                let r2 = (xi - statics.particles.position(j)).length_squared();
                if r2 > c.h_sq {
                    continue;
                }
                static_sum += w0(r2.sqrt(), c.h);
            }
        }
    }

    c.self_density + (dynamic_sum + static_sum) * c.mass * c.norm
}

/// Run the pressure pass over `slots`.
pub fn run<H: CellHash>(ctx: &PassContext<'_, H>, slots: Range<usize>) {
    let c = ctx.constants;
    for slot in slots {
        let density = density_at(ctx, slot);
        let mut record = ctx.input.get(ctx.index.particle(slot));
        record.pressure = pressure_from_density(density, c.rest_density, c.gas_constant);
        ctx.output.set(ctx.output_index(slot), &record);
    }
}
