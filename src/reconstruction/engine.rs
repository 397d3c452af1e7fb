//! Structure-from-motion collaborator interface.
//!
//! The engine is a black box: it receives an ordered image set and returns
//! camera poses plus a sparse point cloud, expressed in a topocentric frame
//! anchored at a geodetic reference of its choosing.

use std::collections::HashMap;
use std::path::PathBuf;

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::geometry::{CameraPose, GeoPoint};
use crate::planning::ClusterId;
use crate::system::CancellationToken;
use crate::telemetry::{Frame, FrameId};

/// Tunable engine parameters. The retry controller adjusts these between attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconstructionParams {
    /// Lowe ratio for descriptor matching. Lower is stricter.
    pub feature_match_ratio: f64,
    /// Features extracted per image.
    pub max_features: usize,
    /// Neighbouring frames each image is matched against.
    pub matching_window: usize,
}

impl Default for ReconstructionParams {
    fn default() -> Self {
        Self {
            feature_match_ratio: 0.8,
            max_features: 8000,
            matching_window: 10,
        }
    }
}

/// One entry of the ordered image set handed to the engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageRef {
    pub frame: FrameId,
    pub sequence: usize,
    pub image: Option<PathBuf>,
    /// GPS prior for the frame.
    pub position: GeoPoint,
}

impl From<&Frame> for ImageRef {
    fn from(frame: &Frame) -> Self {
        Self {
            frame: frame.id,
            sequence: frame.sequence,
            image: frame.image.clone(),
            position: frame.position,
        }
    }
}

/// Everything an engine needs for one run. Owned so it can cross threads.
#[derive(Debug, Clone)]
pub struct EngineRequest {
    pub cluster: ClusterId,
    /// Isolated working area; released by the caller after the run.
    pub work_dir: PathBuf,
    /// Images in capture order.
    pub images: Vec<ImageRef>,
    pub params: ReconstructionParams,
    /// Set when the caller gives up on this invocation.
    pub cancel: CancellationToken,
}

/// Pose of one localized frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnginePose {
    pub pose: CameraPose,
    /// Feature tracks observed by this frame.
    pub num_tracks: usize,
}

/// Raw engine output.
#[derive(Debug, Clone, Default)]
pub struct EngineOutput {
    /// Origin of the topocentric frame the poses are expressed in.
    pub reference: Option<GeoPoint>,
    pub poses: HashMap<FrameId, EnginePose>,
    /// Sparse reconstructed points.
    pub points: Vec<Vector3<f64>>,
    /// Mean reprojection error in pixels.
    pub reprojection_error: f64,
}

/// A structure-from-motion engine.
///
/// Implementations must be thread-safe: several clusters are reconstructed
/// concurrently. They should poll `request.cancel` and return early once it
/// is set.
pub trait StructureFromMotion: Send + Sync {
    fn name(&self) -> &str;

    fn reconstruct(&self, request: &EngineRequest) -> anyhow::Result<EngineOutput>;
}
