//! Back-projection of image detections into plant-frame footprints.

use geo::Polygon;
use nalgebra::{Vector2, Vector3};
use tracing::debug;

use crate::geometry::{convex_footprint, footprint_centroid, CameraIntrinsics, LocalFrame};
use crate::planning::ClusterId;
use crate::reconstruction::ReconstructionResult;
use crate::telemetry::{FrameId, TelemetryIndex};

use super::detection::{DetectionSet, ModuleDetection};

/// A detection placed on the ground in plant coordinates.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub cluster: ClusterId,
    pub frame: FrameId,
    pub sequence: usize,
    /// Position of the detection within its frame's list.
    pub detection_index: usize,
    pub confidence: f64,
    pub footprint: Polygon<f64>,
    pub centroid: Vector2<f64>,
    /// Ground plane height in the plant frame.
    pub ground_z: f64,
    pub image_polygon: Vec<Vector2<f64>>,
}

/// Height of the module plane in the result's own frame.
///
/// Median of the sparse cloud, or the mean camera height minus the nominal
/// flight height when the engine returned no points.
pub fn ground_height(result: &ReconstructionResult, nominal_flight_height: f64) -> f64 {
    if let Some(z) = result.point_cloud.median_height() {
        return z;
    }
    let n = result.poses.len().max(1) as f64;
    let mean_z = result.poses.values().map(|p| p.center.z).sum::<f64>() / n;
    mean_z - nominal_flight_height
}

/// Project every usable detection of the result's localized frames.
///
/// Skipped detections are counted in the returned tally.
pub fn back_project(
    result: &ReconstructionResult,
    detections: &DetectionSet,
    index: &TelemetryIndex,
    camera: &CameraIntrinsics,
    plant: &LocalFrame,
    min_confidence: f64,
    nominal_flight_height: f64,
) -> (Vec<Candidate>, usize) {
    let engine_frame = LocalFrame::new(result.reference);
    let ground_z = ground_height(result, nominal_flight_height);
    let mut out = Vec::new();
    let mut skipped = 0;

    for (frame, pose) in &result.poses {
        let Some(list) = detections.get(frame) else {
            continue;
        };
        let Some(sequence) = index.frame(*frame).map(|f| f.sequence) else {
            continue;
        };

        for (i, det) in list.iter().enumerate() {
            if det.confidence < min_confidence || !det.confidence.is_finite() {
                skipped += 1;
                continue;
            }
            match project_detection(det, pose, camera, ground_z, &engine_frame, plant) {
                Some((footprint, centroid, z)) => out.push(Candidate {
                    cluster: result.cluster,
                    frame: *frame,
                    sequence,
                    detection_index: i,
                    confidence: det.confidence,
                    footprint,
                    centroid,
                    ground_z: z,
                    image_polygon: det.polygon.clone(),
                }),
                None => {
                    debug!(
                        "{}: detection {} of {} has no usable footprint",
                        result.cluster, i, frame
                    );
                    skipped += 1;
                }
            }
        }
    }
    (out, skipped)
}

fn project_detection(
    det: &ModuleDetection,
    pose: &crate::geometry::CameraPose,
    camera: &CameraIntrinsics,
    ground_z: f64,
    engine_frame: &LocalFrame,
    plant: &LocalFrame,
) -> Option<(Polygon<f64>, Vector2<f64>, f64)> {
    if det.polygon.len() < 3 {
        return None;
    }
    let ground: Vec<Vector3<f64>> = det
        .polygon
        .iter()
        .map(|px| {
            camera
                .back_project_to_plane(pose, px, ground_z)
                .map(|p| engine_frame.transfer_point(&p, plant))
        })
        .collect::<Option<_>>()?;

    let xy: Vec<Vector2<f64>> = ground.iter().map(|p| p.xy()).collect();
    let footprint = convex_footprint(&xy)?;
    let centroid = footprint_centroid(&footprint)?;
    let z = ground.iter().map(|p| p.z).sum::<f64>() / ground.len() as f64;
    Some((footprint, centroid, z))
}
