//! Per-cluster reconstruction: engine interface, invocation, and validation.

pub mod command_engine;
pub mod engine;
pub mod invoker;
pub mod result;
pub mod validator;
pub mod workspace;

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::retry::RetryConfig;

pub use command_engine::{CommandEngine, EngineCommandConfig};
pub use engine::{
    EngineOutput, EnginePose, EngineRequest, ImageRef, ReconstructionParams, StructureFromMotion,
};
pub use invoker::{Invocation, ReconstructionInvoker};
pub use result::{PointCloudHandle, QualityMetrics, ReconstructionResult};
pub use validator::{Classification, ReconstructionValidator, ValidationConfig, ValidationReport};
pub use workspace::ScopedWorkspace;

/// `reconstruction` section of the run configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconstructionConfig {
    /// Per-invocation engine timeout.
    pub timeout_secs: u64,
    /// Grace period for a cancelled engine to stop.
    pub cancel_grace_ms: u64,
    /// Worker threads. 0 = available parallelism.
    pub workers: usize,
    /// Parent of the run's scratch workspace. System temp dir if unset.
    pub workspace_root: Option<PathBuf>,
    /// When set, artifacts of accepted attempts are kept here.
    pub artifacts_dir: Option<PathBuf>,
    /// Parameters of the first attempt.
    pub params: ReconstructionParams,
    #[serde(flatten)]
    pub retry: RetryConfig,
    pub engine: EngineCommandConfig,
}

impl Default for ReconstructionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 3600,
            cancel_grace_ms: 2000,
            workers: 0,
            workspace_root: None,
            artifacts_dir: None,
            params: ReconstructionParams::default(),
            retry: RetryConfig::default(),
            engine: EngineCommandConfig::default(),
        }
    }
}

impl ReconstructionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    /// Effective worker count.
    pub fn worker_count(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.timeout_secs == 0 {
            return Err(PipelineError::Config(
                "reconstruction.timeout_secs must be positive".into(),
            ));
        }
        let p = &self.params;
        if !(p.feature_match_ratio > 0.0 && p.feature_match_ratio <= 1.0) {
            return Err(PipelineError::Config(format!(
                "feature_match_ratio {} outside (0, 1]",
                p.feature_match_ratio
            )));
        }
        if p.max_features == 0 {
            return Err(PipelineError::Config("max_features must be positive".into()));
        }
        self.retry.validate()
    }
}
