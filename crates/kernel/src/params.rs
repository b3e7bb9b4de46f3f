//! Simulation constants supplied at initialization.
//!
//! [`ParticleBehaviourParameters`] is read-only for the lifetime of a
//! system. Optional named settings live in [`ExtraParameters`], which never
//! fails: a missing key yields the caller's default and a malformed value is
//! logged and treated as missing.

use std::collections::BTreeMap;

use glam::Vec3;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Default gravitational acceleration (m/s^2, y up).
pub const DEFAULT_GRAVITY: Vec3 = Vec3::new(0.0, -9.81, 0.0);

/// Extra key: enable the bounding box at all.
pub const EXTRA_BOUNDED: &str = "bounded";
/// Extra key: reflect particles at the top face of the box.
pub const EXTRA_BOUND_ROOF: &str = "boundRoof";
/// Extra key: fraction of the normal velocity kept after a wall hit.
pub const EXTRA_WALL_ELASTICITY: &str = "wallElasticity";
/// Extra key: dynamic hash table size as a multiple of the particle count.
pub const EXTRA_DYNAMIC_TABLE_FACTOR: &str = "dynamicHashTableFactor";
/// Extra key: static hash table size as a multiple of the particle count.
pub const EXTRA_STATIC_TABLE_FACTOR: &str = "staticHashTableFactor";

/// Axis-aligned simulation box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    /// Minimum corner.
    pub min: Vec3,
    /// Maximum corner.
    pub max: Vec3,
}

impl Default for Bounds {
    fn default() -> Self {
        Self {
            min: Vec3::ZERO,
            max: Vec3::ONE,
        }
    }
}

/// Named optional settings, parsed on demand.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExtraParameters(BTreeMap<String, serde_json::Value>);

impl ExtraParameters {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Set `key` to `value`, replacing any previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Raw value for `key`.
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    /// Float value for `key`, or `default` if missing or malformed.
    ///
    /// Numbers are taken as-is and strings are parsed.
    pub fn float(&self, key: &str, default: f32) -> f32 {
        let Some(value) = self.0.get(key) else {
            return default;
        };
        let parsed = match value {
            serde_json::Value::Number(n) => n.as_f64().map(|v| v as f32),
            serde_json::Value::String(s) => s.trim().parse::<f32>().ok(),
            _ => None,
        };
        match parsed {
            Some(v) if v.is_finite() => v,
            _ => {
                warn!(key, %value, default, "malformed float parameter, using default");
                default
            }
        }
    }

    /// Boolean value for `key`, or `default` if missing or malformed.
    ///
    /// Accepts JSON booleans, the numbers 0 and 1, and the strings
    /// `true/false`, `yes/no`, `on/off`, `1/0` in any case.
    pub fn flag(&self, key: &str, default: bool) -> bool {
        let Some(value) = self.0.get(key) else {
            return default;
        };
        let parsed = match value {
            serde_json::Value::Bool(b) => Some(*b),
            serde_json::Value::Number(n) => match n.as_f64() {
                Some(v) if v == 0.0 => Some(false),
                Some(v) if v == 1.0 => Some(true),
                _ => None,
            },
            serde_json::Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => Some(true),
                "false" | "no" | "off" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        };
        parsed.unwrap_or_else(|| {
            warn!(key, %value, default, "malformed flag parameter, using default");
            default
        })
    }
}

/// Physical constants of the simulated fluid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticleBehaviourParameters {
    /// Mass of every dynamic particle.
    pub particle_mass: f32,
    /// Equation-of-state stiffness k.
    pub gas_constant: f32,
    /// Viscosity coefficient.
    pub viscosity: f32,
    /// Gravitational acceleration.
    #[serde(default = "default_gravity")]
    pub gravity: Vec3,
    /// Density at which pressure is zero.
    pub rest_density: f32,
    /// Smoothing length h; also the grid cell size.
    pub interaction_radius: f32,
    /// Simulation box.
    #[serde(default)]
    pub bounds: Bounds,
    /// Optional named settings.
    #[serde(default)]
    pub extra: ExtraParameters,
}

fn default_gravity() -> Vec3 {
    DEFAULT_GRAVITY
}

impl Default for ParticleBehaviourParameters {
    fn default() -> Self {
        Self {
            particle_mass: 0.02,
            gas_constant: 3.0,
            viscosity: 3.5,
            gravity: DEFAULT_GRAVITY,
            rest_density: 998.29,
            interaction_radius: 0.0457,
            bounds: Bounds::default(),
            extra: ExtraParameters::default(),
        }
    }
}

impl ParticleBehaviourParameters {
    /// Check that the constants describe a runnable simulation.
    pub fn validate(&self) -> Result<(), String> {
        if !(self.particle_mass.is_finite() && self.particle_mass > 0.0) {
            return Err(format!("particleMass must be positive, got {}", self.particle_mass));
        }
        if !(self.interaction_radius.is_finite() && self.interaction_radius > 0.0) {
            return Err(format!(
                "interactionRadius must be positive, got {}",
                self.interaction_radius
            ));
        }
        if !self.gas_constant.is_finite() || self.gas_constant == 0.0 {
            return Err(format!(
                "gasConstant must be finite and non-zero, got {}",
                self.gas_constant
            ));
        }
        if !self.viscosity.is_finite() || self.viscosity < 0.0 {
            return Err(format!("viscosity must be non-negative, got {}", self.viscosity));
        }
        if !self.rest_density.is_finite() {
            return Err("restDensity must be finite".to_string());
        }
        if !self.gravity.is_finite() {
            return Err("gravity must be finite".to_string());
        }
        if self.bounded() {
            let b = &self.bounds;
            if !(b.min.is_finite() && b.max.is_finite()) || b.min.cmpge(b.max).any() {
                return Err(format!("bounds min {} must be below max {}", b.min, b.max));
            }
        }
        let elasticity = self.wall_elasticity();
        if !(0.0..=1.0).contains(&elasticity) {
            return Err(format!("wallElasticity must lie in [0, 1], got {elasticity}"));
        }
        for (name, factor) in [
            (EXTRA_DYNAMIC_TABLE_FACTOR, self.dynamic_table_factor()),
            (EXTRA_STATIC_TABLE_FACTOR, self.static_table_factor()),
        ] {
            if factor <= 0.0 {
                return Err(format!("{name} must be positive, got {factor}"));
            }
        }
        Ok(())
    }

    /// Whether the box boundary is applied at all.
    pub fn bounded(&self) -> bool {
        self.extra.flag(EXTRA_BOUNDED, true)
    }

    /// Whether the top face of the box reflects.
    pub fn bound_roof(&self) -> bool {
        self.extra.flag(EXTRA_BOUND_ROOF, false)
    }

    /// Fraction of the normal velocity kept after a wall hit.
    pub fn wall_elasticity(&self) -> f32 {
        self.extra.float(EXTRA_WALL_ELASTICITY, 0.5)
    }

    /// Dynamic hash table size factor.
    pub fn dynamic_table_factor(&self) -> f32 {
        self.extra.float(EXTRA_DYNAMIC_TABLE_FACTOR, 2.0)
    }

    /// Static hash table size factor.
    pub fn static_table_factor(&self) -> f32 {
        self.extra.float(EXTRA_STATIC_TABLE_FACTOR, 1.0)
    }
}

/// Hash table size for `count` particles: `ceil(factor * count) + 1`.
pub fn hash_table_size(count: usize, factor: f32) -> u32 {
    let scaled = (factor as f64 * count as f64).ceil();
    (scaled.max(0.0) as u32).saturating_add(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_extra_uses_default() {
        let extra = ExtraParameters::new();
        assert_eq!(extra.float("wallElasticity", 0.25), 0.25);
        assert!(extra.flag("bounded", true));
    }

    #[test]
    fn extra_accepts_numbers_and_strings() {
        let extra = ExtraParameters::new()
            .with("a", 0.75)
            .with("b", "1.5")
            .with("c", "off")
            .with("d", 1)
            .with("e", "YES");
        assert_eq!(extra.float("a", 0.0), 0.75);
        assert_eq!(extra.float("b", 0.0), 1.5);
        assert!(!extra.flag("c", true));
        assert!(extra.flag("d", false));
        assert!(extra.flag("e", false));
    }

    #[test]
    fn malformed_extra_falls_back() {
        let extra = ExtraParameters::new()
            .with("f", "not a number")
            .with("g", serde_json::json!([1, 2]))
            .with("h", 7);
        assert_eq!(extra.float("f", 2.0), 2.0);
        assert_eq!(extra.float("g", 3.0), 3.0);
        assert!(extra.flag("h", true));
    }

    #[test]
    fn deserializes_camel_case() {
        let json = r#"{
            "particleMass": 1.0,
            "gasConstant": 2.0,
            "viscosity": 0.5,
            "restDensity": 10.0,
            "interactionRadius": 0.1,
            "bounds": { "min": [0, 0, 0], "max": [1, 2, 1] },
            "extra": { "boundRoof": true, "wallElasticity": "0.8" }
        }"#;
        let p: ParticleBehaviourParameters = serde_json::from_str(json).unwrap();
        assert_eq!(p.gravity, DEFAULT_GRAVITY);
        assert_eq!(p.bounds.max, Vec3::new(1.0, 2.0, 1.0));
        assert!(p.bound_roof());
        assert!(p.bounded());
        assert_eq!(p.wall_elasticity(), 0.8);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut p = ParticleBehaviourParameters {
            gas_constant: 0.0,
            ..Default::default()
        };
        assert!(p.validate().is_err());
        p.gas_constant = 1.0;
        p.interaction_radius = -1.0;
        assert!(p.validate().is_err());
        p.interaction_radius = 0.1;
        p.bounds.max = Vec3::new(1.0, -1.0, 1.0);
        assert!(p.validate().is_err());
        p.extra.insert(EXTRA_BOUNDED, false);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn table_size_policy() {
        assert_eq!(hash_table_size(100, 2.0), 201);
        assert_eq!(hash_table_size(100, 1.0), 101);
        assert_eq!(hash_table_size(0, 2.0), 1);
        assert_eq!(hash_table_size(3, 0.5), 3);
    }
}
