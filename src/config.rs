//! Run configuration.
//!
//! Loaded from `<workdir>/config.yml`. Every section and field has a default,
//! so a partial file only overrides what it names. Empty (`~`) values fall
//! back to the default as well.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::merging::MergeConfig;
use crate::planning::PlanningConfig;
use crate::reconstruction::{ReconstructionConfig, ValidationConfig};
use crate::telemetry::{TelemetryConfig, TelemetryIndex};

/// `plant` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlantConfig {
    pub name: String,
}

impl Default for PlantConfig {
    fn default() -> Self {
        Self {
            name: "plant".into(),
        }
    }
}

/// Complete configuration of a plant run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub plant: PlantConfig,
    pub telemetry: TelemetryConfig,
    pub planning: PlanningConfig,
    pub reconstruction: ReconstructionConfig,
    pub validation: ValidationConfig,
    pub merging: MergeConfig,
}

impl RunConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        let value: serde_yaml::Value = serde_yaml::from_str(yaml)
            .map_err(|e| PipelineError::Config(format!("invalid YAML: {}", e)))?;
        serde_yaml::from_value(remove_nulls(value))
            .map_err(|e| PipelineError::Config(format!("invalid configuration: {}", e)))
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    /// Reject inconsistent settings before any work starts.
    pub fn validate(&self) -> Result<()> {
        if self.plant.name.trim().is_empty() {
            return Err(PipelineError::Config("plant.name must not be empty".into()));
        }
        TelemetryIndex::check_thresholds(
            self.telemetry.max_time_gap_s,
            self.telemetry.max_spatial_jump_m,
        )?;
        self.planning.validate()?;
        self.reconstruction.validate()?;
        self.validation.validate()?;
        self.merging.validate()?;
        Ok(())
    }
}

/// Drop null mapping entries so they take their defaults.
fn remove_nulls(value: serde_yaml::Value) -> serde_yaml::Value {
    match value {
        serde_yaml::Value::Mapping(map) => serde_yaml::Value::Mapping(
            map.into_iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k, remove_nulls(v)))
                .collect(),
        ),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_gives_defaults() {
        let cfg = RunConfig::from_yaml_str("").unwrap();
        assert_eq!(cfg, RunConfig::default());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_partial_file_overrides_named_fields() {
        let yaml = r#"
plant:
  name: Solarpark Nord
planning:
  max_cluster_size: 500
telemetry:
  max_time_gap_s: ~
reconstruction:
  retry_budget: 3
  engine:
    program: /usr/local/bin/opensfm-run
merging:
  camera:
    fx: 1100.0
"#;
        let cfg = RunConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(cfg.plant.name, "Solarpark Nord");
        assert_eq!(cfg.planning.max_cluster_size, 500);
        assert_eq!(cfg.planning.overlap_size, 50);
        assert_eq!(cfg.telemetry.max_time_gap_s, 5.0);
        assert_eq!(cfg.reconstruction.retry.retry_budget, 3);
        assert!(cfg.reconstruction.engine.program.is_some());
        assert_eq!(cfg.merging.camera.fx, 1100.0);
        assert_eq!(cfg.merging.camera.cx, 320.0);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_inconsistent_planning_rejected() {
        let cfg = RunConfig::from_yaml_str("planning:\n  max_cluster_size: 40\n  overlap_size: 40\n").unwrap();
        assert!(matches!(cfg.validate(), Err(PipelineError::Planning(_))));
    }

    #[test]
    fn test_malformed_yaml_is_config_error() {
        assert!(matches!(
            RunConfig::from_yaml_str("planning: [1, 2"),
            Err(PipelineError::Config(_))
        ));
    }
}
