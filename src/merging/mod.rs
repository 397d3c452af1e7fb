//! Module registry: back-projection, association and deduplication of PV
//! module detections across clusters.

pub mod candidate;
pub mod detection;
pub mod registry;

pub use candidate::{back_project, ground_height, Candidate};
pub use detection::{DetectionSet, ModuleDetection, ModuleSegmenter};
pub use registry::{MergeConfig, MergeStats, ModuleId, ModuleRecord, RegistryMerger, Support};
