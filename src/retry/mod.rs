//! Retry and escalation of per-cluster reconstructions.

pub mod controller;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

pub use controller::{AttemptOutcome, AttemptRecord, ClusterOutcome, RetryController};

/// Retry policy. Lives in the `reconstruction` config section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries allowed after the first attempt.
    pub retry_budget: u32,
    /// Multiplier applied to the match ratio when tightening.
    pub tighten_factor: f64,
    /// Multiplier applied to the feature count when tightening.
    pub feature_growth: f64,
    /// Re-splitting never produces a segment shorter than this.
    pub min_split_size: usize,
    /// Keep the last degraded result instead of abandoning the cluster.
    pub accept_degraded_on_exhaustion: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retry_budget: 2,
            tighten_factor: 0.9,
            feature_growth: 1.5,
            min_split_size: 20,
            accept_degraded_on_exhaustion: false,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.tighten_factor > 0.0 && self.tighten_factor <= 1.0) {
            return Err(PipelineError::Config(format!(
                "tighten_factor {} outside (0, 1]",
                self.tighten_factor
            )));
        }
        if !(self.feature_growth >= 1.0) {
            return Err(PipelineError::Config(format!(
                "feature_growth {} below 1",
                self.feature_growth
            )));
        }
        if self.min_split_size == 0 {
            return Err(PipelineError::Config(
                "min_split_size must be positive".into(),
            ));
        }
        Ok(())
    }
}
