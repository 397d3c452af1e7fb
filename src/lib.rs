//! Drone survey mapping of photovoltaic plants.
//!
//! Partitions a long thermal capture into reconstructable clusters, drives an
//! external structure-from-motion engine over them with validation and
//! retries, and merges per-frame module detections into one geo-referenced
//! registry of PV modules.

pub mod config;
pub mod error;
pub mod geometry;
pub mod io;
pub mod merging;
pub mod planning;
pub mod reconstruction;
pub mod retry;
pub mod system;
pub mod telemetry;

pub use config::RunConfig;
pub use error::{PipelineError, Result};
pub use system::{CancellationToken, PlantModel, PlantRunner};
