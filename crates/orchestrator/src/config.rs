//! Scene configuration parsing and validation

use std::fs;
use std::path::Path;

use fluidsim_kernel::{DynamicParticle, ParticleBehaviourParameters, StaticParticle};
use serde::{Deserialize, Serialize};

use crate::blueprint::Blueprint;

/// Which particle system runs the scene.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum BackendConfig {
    /// Worker threads on the CPU.
    Cpu {
        /// Worker count; all available cores when absent.
        #[serde(default)]
        threads: Option<usize>,
    },
    /// Software compute device running the device pipeline on the host.
    HostDevice,
    /// wgpu compute device (requires the `gpu` feature).
    Gpu,
    /// GPU when one is available, CPU otherwise.
    Auto,
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Cpu { threads: None }
    }
}

impl BackendConfig {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            BackendConfig::Cpu { .. } => "cpu",
            BackendConfig::HostDevice => "host-device",
            BackendConfig::Gpu => "gpu",
            BackendConfig::Auto => "auto",
        }
    }
}

/// A complete scene: parameters, particles and how to run them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneConfig {
    /// Human-readable scene name
    pub name: String,
    /// Execution back-end
    #[serde(default)]
    pub backend: BackendConfig,
    /// Buffer generations (2 or 3); back-end default when absent
    #[serde(default)]
    pub generations: Option<usize>,
    /// Store output particles in bucket order
    #[serde(default)]
    pub reorder: bool,
    /// Simulated seconds per step
    #[serde(default = "default_time_step")]
    pub time_step: f32,
    /// Stop after this many submitted steps
    #[serde(default)]
    pub max_steps: Option<u64>,
    /// Wall-clock frame period in milliseconds; free-running when absent
    #[serde(default)]
    pub frame_time_ms: Option<u64>,
    /// Fluid behaviour
    #[serde(default)]
    pub parameters: ParticleBehaviourParameters,
    /// Fluid particle sets
    pub dynamic: Vec<Blueprint>,
    /// Boundary particle sets
    #[serde(default, rename = "static")]
    pub statics: Vec<Blueprint>,
}

fn default_time_step() -> f32 {
    0.005
}

impl SceneConfig {
    /// Load configuration from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, String> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {}: {}", path.display(), e))?;
        Self::from_json(&contents)
    }

    /// Parse and validate a JSON document
    pub fn from_json(json: &str) -> Result<Self, String> {
        let config: SceneConfig =
            serde_json::from_str(json).map_err(|e| format!("Failed to parse config JSON: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if let Some(generations) = self.generations {
            if !(2..=3).contains(&generations) {
                return Err(format!("generations must be 2 or 3, got {generations}"));
            }
        }
        if let BackendConfig::Cpu { threads: Some(0) } = self.backend {
            return Err("cpu threads must be at least 1".to_string());
        }

        if !(self.time_step.is_finite() && self.time_step >= 0.0) {
            return Err(format!("timeStep must be non-negative, got {}", self.time_step));
        }

        if let Some(max_steps) = self.max_steps {
            if max_steps == 0 {
                return Err("maxSteps must be at least 1".to_string());
            }
        }

        self.parameters.validate()?;

        if self.dynamic.is_empty() {
            return Err("at least one dynamic blueprint is required".to_string());
        }
        for blueprint in self.dynamic.iter().chain(&self.statics) {
            blueprint.validate()?;
        }
        Ok(())
    }

    /// Generate every dynamic and static particle of the scene.
    pub fn build_particles(&self) -> (Vec<DynamicParticle>, Vec<StaticParticle>) {
        let dynamic = self.dynamic.iter().flat_map(Blueprint::generate_dynamic).collect();
        let statics = self.statics.iter().flat_map(Blueprint::generate_static).collect();
        (dynamic, statics)
    }
}
