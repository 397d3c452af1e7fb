//! Error taxonomy for a plant run.
//!
//! Telemetry and planning errors are structural and abort the run before any
//! reconstruction starts. Engine errors are recoverable at cluster granularity
//! and feed the retry controller; they never escape a cluster lifecycle.

use thiserror::Error;

use crate::planning::ClusterId;
use crate::planning::ClusterStatus;

/// Errors produced by the mapping pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Frames are unordered, duplicated, or missing required fields.
    #[error("Malformed telemetry at record {record}: {reason}")]
    MalformedTelemetry { record: usize, reason: String },

    /// Planning parameters are inconsistent.
    #[error("Planning error: {0}")]
    Planning(String),

    /// The engine crashed, timed out, or produced unreadable output.
    #[error("Reconstruction engine error for {cluster}: {reason}")]
    ReconstructionEngine { cluster: ClusterId, reason: String },

    /// The engine returned but localized none of the requested frames.
    #[error("Reconstruction of {cluster} produced no usable poses")]
    ReconstructionIncomplete { cluster: ClusterId },

    /// Configuration values rejected before the run started.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The segmentation collaborator failed for a frame.
    #[error("Segmentation error: {0}")]
    Segmentation(String),

    /// A cluster lifecycle attempted a transition the state machine forbids.
    #[error("Invalid transition for {cluster}: {from:?} -> {to:?}")]
    InvalidTransition {
        cluster: ClusterId,
        from: ClusterStatus,
        to: ClusterStatus,
    },

    /// The run was aborted through its cancellation token.
    #[error("Run cancelled")]
    Cancelled,

    /// Working-area or output I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Convenience constructor used by telemetry ingestion.
    pub fn malformed(record: usize, reason: impl Into<String>) -> Self {
        Self::MalformedTelemetry {
            record,
            reason: reason.into(),
        }
    }

    /// Whether this error is recoverable by retrying the cluster.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ReconstructionEngine { .. } | Self::ReconstructionIncomplete { .. }
        )
    }
}

/// Convenience Result type for the library.
pub type Result<T> = std::result::Result<T, PipelineError>;
