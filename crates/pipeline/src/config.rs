use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::checkpoint::ActivationPolicy;
use crate::error::{PipelineError, Result};

fn default_seed() -> u64 {
    0
}

/// Pipeline geometry and loop options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub num_stages: usize,
    pub num_microbatches: usize,
    #[serde(default)]
    pub activation_policy: ActivationPolicy,
    /// Value of the carry "produced" by every stage before timestep 0. It
    /// only ever reaches bubble stages.
    #[serde(default)]
    pub bubble_fill: f64,
    /// Seed behind [`crate::Pipeline::root_key`].
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl PipelineConfig {
    pub fn new(num_stages: usize, num_microbatches: usize) -> Self {
        Self {
            num_stages,
            num_microbatches,
            activation_policy: ActivationPolicy::default(),
            bubble_fill: 0.0,
            seed: default_seed(),
        }
    }

    pub fn with_activation_policy(mut self, policy: ActivationPolicy) -> Self {
        self.activation_policy = policy;
        self
    }

    pub fn with_bubble_fill(mut self, value: f64) -> Self {
        self.bubble_fill = value;
        self
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let config: PipelineConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(PipelineError::ConfigFormat(format!(
                    "unsupported configuration extension '{other}'"
                )));
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.num_stages == 0 {
            errors.push("num_stages must be greater than 0".to_string());
        }

        if self.num_microbatches == 0 {
            errors.push("num_microbatches must be greater than 0".to_string());
        }

        if !self.bubble_fill.is_finite() {
            errors.push("bubble_fill must be finite".to_string());
        }

        if !errors.is_empty() {
            return Err(PipelineError::Validation(errors));
        }

        Ok(())
    }

    /// `M + N - 1`; only meaningful on a validated config.
    pub fn num_timesteps(&self) -> usize {
        (self.num_microbatches + self.num_stages).saturating_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_collects_every_problem() {
        let mut config = PipelineConfig::new(0, 0);
        config.bubble_fill = f64::NAN;
        match config.validate() {
            Err(PipelineError::Validation(errors)) => assert_eq!(errors.len(), 3),
            other => panic!("unexpected {other:?}"),
        }
        assert!(PipelineConfig::new(4, 8).validate().is_ok());
    }

    #[test]
    fn toml_defaults_fill_optional_fields() -> Result<()> {
        let config: PipelineConfig = toml::from_str("num_stages = 2\nnum_microbatches = 3\n")?;
        assert_eq!(config, PipelineConfig::new(2, 3));
        assert_eq!(config.num_timesteps(), 4);
        Ok(())
    }

    #[test]
    fn activation_policy_is_snake_case() -> Result<()> {
        let config: PipelineConfig = serde_json::from_str(
            r#"{"num_stages": 1, "num_microbatches": 1, "activation_policy": "recompute"}"#,
        )?;
        assert_eq!(config.activation_policy, ActivationPolicy::Recompute);
        Ok(())
    }
}
