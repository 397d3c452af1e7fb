//! Segmentation collaborator interface.

use std::collections::BTreeMap;

use nalgebra::Vector2;
use serde::{Deserialize, Serialize};

use crate::telemetry::{Frame, FrameId};

/// One PV module outline detected in one image, in pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleDetection {
    pub frame: FrameId,
    pub polygon: Vec<Vector2<f64>>,
    pub confidence: f64,
}

/// Detections keyed by frame. Frames without an entry have no detections.
pub type DetectionSet = BTreeMap<FrameId, Vec<ModuleDetection>>;

/// Instance-segmentation model. Called at most once per frame.
pub trait ModuleSegmenter: Send + Sync {
    fn detect(&self, frame: &Frame) -> anyhow::Result<Vec<ModuleDetection>>;
}
