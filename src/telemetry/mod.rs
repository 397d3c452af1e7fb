//! Telemetry index: typed frames, ordering checks, and discontinuity queries.

pub mod frame;
pub mod index;
pub mod interpolation;

use serde::{Deserialize, Serialize};

pub use frame::{frames_from_records, validate_frames, Frame, FrameId, TelemetryRecord};
pub use index::{DiscontinuityKind, DiscontinuityMarker, Discontinuities, TelemetryIndex};
pub use interpolation::interpolate_repeated_fixes;

/// Telemetry settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Smooth repeated low-rate GPS fixes before indexing.
    pub interpolate_gps: bool,
    /// Time gap (seconds) between consecutive frames that forces a split.
    pub max_time_gap_s: f64,
    /// Position jump (meters) between consecutive frames that forces a split.
    pub max_spatial_jump_m: f64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            interpolate_gps: true,
            max_time_gap_s: 5.0,
            max_spatial_jump_m: 50.0,
        }
    }
}
