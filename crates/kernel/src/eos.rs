//! Equation of state closing the SPH force equations.
//!
//! A linear, ideal-gas-like relation is used:
//!
//! ```text
//! P = k * (rho - rho0)
//! ```
//!
//! It is cheap to invert, which lets the dynamics pass recover a particle's
//! density from the pressure written by the pressure pass instead of summing
//! the neighborhood a second time.

/// Pressure for a given density. Negative below rest density.
///
/// # Arguments
/// * `density` - Summed density rho.
/// * `rest_density` - Density rho0 at which the fluid is at rest.
/// * `gas_constant` - Stiffness k.
#[inline]
pub fn pressure_from_density(density: f32, rest_density: f32, gas_constant: f32) -> f32 {
    gas_constant * (density - rest_density)
}

/// Inverse of [`pressure_from_density`]. `gas_constant` must be non-zero.
#[inline]
pub fn density_from_pressure(pressure: f32, rest_density: f32, gas_constant: f32) -> f32 {
    pressure / gas_constant + rest_density
}
