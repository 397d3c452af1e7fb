//! Messages exchanged between the orchestrator and cluster workers.

use crate::error::Result;
use crate::planning::Cluster;
use crate::retry::ClusterOutcome;

/// Work item handed to a worker: one planned cluster.
///
/// The worker owns the cluster for the duration of its lifecycle; only it
/// changes the cluster's status.
#[derive(Debug)]
pub struct ClusterJob {
    pub cluster: Cluster,
}

/// Sent back by a worker once the cluster reached a terminal status.
#[derive(Debug)]
pub struct ClusterDone {
    /// The cluster in its terminal status.
    pub cluster: Cluster,
    /// Err only for lifecycle bugs (illegal transitions).
    pub outcome: Result<ClusterOutcome>,
}
