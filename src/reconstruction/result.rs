//! Reconstruction results handed from the invoker to the validator and merger.

use std::collections::BTreeMap;
use std::sync::Arc;

use nalgebra::Vector3;
use serde::Serialize;

use crate::geometry::{CameraPose, GeoPoint};
use crate::planning::ClusterId;
use crate::telemetry::FrameId;

/// Shared, read-only handle to a sparse point cloud.
#[derive(Debug, Clone)]
pub struct PointCloudHandle {
    points: Arc<[Vector3<f64>]>,
}

impl Default for PointCloudHandle {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl PointCloudHandle {
    pub fn new(points: Vec<Vector3<f64>>) -> Self {
        Self {
            points: points.into(),
        }
    }

    pub fn points(&self) -> &[Vector3<f64>] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Median height of the cloud. None if empty.
    pub fn median_height(&self) -> Option<f64> {
        let mut zs: Vec<f64> = self
            .points
            .iter()
            .map(|p| p.z)
            .filter(|z| z.is_finite())
            .collect();
        if zs.is_empty() {
            return None;
        }
        zs.sort_by(|a, b| a.total_cmp(b));
        Some(zs[zs.len() / 2])
    }
}

/// Quality figures of one reconstruction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct QualityMetrics {
    pub requested_frames: usize,
    pub localized_frames: usize,
    pub reprojection_error: f64,
    pub num_points: usize,
}

/// Output of one successful engine run for one cluster (or cluster segment).
///
/// Poses are expressed in the local ENU frame anchored at `reference`.
#[derive(Debug, Clone)]
pub struct ReconstructionResult {
    pub cluster: ClusterId,
    /// Retry round that produced this result (0 = first attempt).
    pub attempt: u32,
    pub reference: GeoPoint,
    pub poses: BTreeMap<FrameId, CameraPose>,
    pub track_counts: BTreeMap<FrameId, usize>,
    pub point_cloud: PointCloudHandle,
    pub metrics: QualityMetrics,
}

impl ReconstructionResult {
    pub fn pose(&self, frame: FrameId) -> Option<&CameraPose> {
        self.poses.get(&frame)
    }

    pub fn is_localized(&self, frame: FrameId) -> bool {
        self.poses.contains_key(&frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_median_height() {
        let cloud = PointCloudHandle::new(vec![
            Vector3::new(0.0, 0.0, -30.0),
            Vector3::new(0.0, 0.0, -29.0),
            Vector3::new(0.0, 0.0, 5.0),
            Vector3::new(0.0, 0.0, -31.0),
            Vector3::new(0.0, 0.0, f64::NAN),
        ]);
        assert_eq!(cloud.median_height(), Some(-29.0));
        assert!(PointCloudHandle::default().median_height().is_none());
    }
}
