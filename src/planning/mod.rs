//! Cluster planning: partitions an ordered capture into reconstruction units.

pub mod cluster;
pub mod planner;

pub use cluster::{Cluster, ClusterId, ClusterStatus};
pub use planner::{plan_clusters, PlanningConfig};
