//! Pinhole camera intrinsics and ground-plane back-projection.

use nalgebra::{Vector2, Vector3};
use serde::{Deserialize, Serialize};

use super::pose::CameraPose;

/// Rays flatter than this (|dz| of the unit direction) never hit the ground
/// within a useful distance.
const MIN_RAY_DESCENT: f64 = 1e-3;

/// Pinhole intrinsics in pixels.
///
/// Defaults describe a 640x512 radiometric thermal core with a 13 mm lens,
/// the most common payload for PV inspection flights.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraIntrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl Default for CameraIntrinsics {
    fn default() -> Self {
        Self {
            fx: 765.0,
            fy: 765.0,
            cx: 320.0,
            cy: 256.0,
        }
    }
}

impl CameraIntrinsics {
    pub fn is_valid(&self) -> bool {
        self.fx.is_finite() && self.fy.is_finite() && self.fx > 0.0 && self.fy > 0.0
    }

    /// Normalized viewing direction of a pixel, in the camera frame.
    pub fn pixel_ray(&self, pixel: &Vector2<f64>) -> Vector3<f64> {
        Vector3::new(
            (pixel.x - self.cx) / self.fx,
            (pixel.y - self.cy) / self.fy,
            1.0,
        )
        .normalize()
    }

    /// Project a world point into pixel coordinates.
    ///
    /// Returns None if the point is behind the camera.
    pub fn project(&self, pose: &CameraPose, point_world: &Vector3<f64>) -> Option<Vector2<f64>> {
        let p_cam = pose.to_camera(point_world);
        if p_cam.z <= 0.0 {
            return None;
        }
        Some(Vector2::new(
            self.fx * p_cam.x / p_cam.z + self.cx,
            self.fy * p_cam.y / p_cam.z + self.cy,
        ))
    }

    /// Intersect the viewing ray of `pixel` with the horizontal plane `z = ground_z`.
    ///
    /// Returns None when the ray does not descend towards the plane.
    pub fn back_project_to_plane(
        &self,
        pose: &CameraPose,
        pixel: &Vector2<f64>,
        ground_z: f64,
    ) -> Option<Vector3<f64>> {
        let dir = pose.rotation * self.pixel_ray(pixel);
        let drop = ground_z - pose.center.z;
        if dir.z.abs() < MIN_RAY_DESCENT || drop.signum() != dir.z.signum() {
            return None;
        }
        let t = drop / dir.z;
        Some(pose.center + dir * t)
    }
}
