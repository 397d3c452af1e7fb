//! Run orchestration and worker management.
//!
//! This module contains the top-level `PlantRunner` that sequences a run,
//! the `RunContext` shared by its workers, the worker pool with its message
//! types, and the report that ends up in the plant model.

pub mod cancellation;
pub mod messages;
mod plant_runner;
pub mod report;
pub mod run_context;
pub mod worker_pool;

pub use cancellation::CancellationToken;
pub use messages::{ClusterDone, ClusterJob};
pub use plant_runner::PlantRunner;
pub use report::{
    AbandonedCluster, AcceptedCluster, ClusterReport, CoverageGap, PlantModel, RunCounters,
    RunReport,
};
pub use run_context::RunContext;
