//! Cluster records and their status state machine.

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::telemetry::FrameId;

/// Identifier of a planned cluster. Assigned sequentially in capture order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterId(pub u32);

impl ClusterId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Directory name used for the cluster's working area and artifacts.
    pub fn dir_name(&self) -> String {
        format!("cluster_{:06}", self.0)
    }
}

impl std::fmt::Display for ClusterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "C{}", self.0)
    }
}

/// Lifecycle status of a cluster.
///
/// ```text
/// Planned -> Running -> Accepted (terminal)
///               |   \-> Degraded -> Running | Failed | Accepted
///               \-----> Failed   -> Running | Abandoned (terminal)
/// ```
/// Any non-terminal status may move to Abandoned when the run is cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClusterStatus {
    Planned,
    Running,
    Accepted,
    Degraded,
    Failed,
    Abandoned,
}

impl ClusterStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Accepted | Self::Abandoned)
    }

    /// Whether the state machine allows `self -> next`.
    pub fn can_transition_to(self, next: ClusterStatus) -> bool {
        use ClusterStatus::*;
        match (self, next) {
            (Planned, Running) => true,
            (Running, Accepted | Degraded | Failed) => true,
            // retry, budget exhausted, or degraded result kept on exhaustion
            (Degraded, Running | Failed | Accepted) => true,
            (Failed, Running | Abandoned) => true,
            (Planned | Running | Degraded, Abandoned) => true,
            _ => false,
        }
    }
}

impl Default for ClusterStatus {
    fn default() -> Self {
        Self::Planned
    }
}

/// A contiguous (plus overlap) run of frames reconstructed as one unit.
///
/// Frame order is fixed at planning time; only the status changes afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: ClusterId,
    frames: Vec<FrameId>,
    /// Sequence index of the first frame.
    pub first_sequence: usize,
    /// Sequence index of the last frame.
    pub last_sequence: usize,
    /// Previous cluster sharing overlap frames with this one.
    pub predecessor: Option<ClusterId>,
    /// Next cluster sharing overlap frames with this one.
    pub successor: Option<ClusterId>,
    /// Number of leading frames duplicated from the predecessor.
    pub overlap_with_predecessor: usize,
    status: ClusterStatus,
}

impl Cluster {
    pub fn new(
        id: ClusterId,
        frames: Vec<FrameId>,
        first_sequence: usize,
        last_sequence: usize,
    ) -> Self {
        Self {
            id,
            frames,
            first_sequence,
            last_sequence,
            predecessor: None,
            successor: None,
            overlap_with_predecessor: 0,
            status: ClusterStatus::Planned,
        }
    }

    pub fn frames(&self) -> &[FrameId] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn status(&self) -> ClusterStatus {
        self.status
    }

    pub fn first_frame(&self) -> Option<FrameId> {
        self.frames.first().copied()
    }

    pub fn last_frame(&self) -> Option<FrameId> {
        self.frames.last().copied()
    }

    /// Move to `next`, enforcing the lifecycle state machine.
    pub fn transition(&mut self, next: ClusterStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(PipelineError::InvalidTransition {
                cluster: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }
}
