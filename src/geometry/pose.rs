//! Camera poses as returned by the reconstruction engine.

use nalgebra::{Rotation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

/// Reconstructed pose of one camera.
///
/// `rotation` takes camera-frame directions (x right, y down, z forward) into
/// the world frame; `center` is the optical center in world coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraPose {
    pub rotation: UnitQuaternion<f64>,
    pub center: Vector3<f64>,
}

impl CameraPose {
    pub fn new(rotation: UnitQuaternion<f64>, center: Vector3<f64>) -> Self {
        Self { rotation, center }
    }

    /// Build from a world-to-camera transform `x_cam = R_cw * x_world + t`.
    ///
    /// `rotation_cw` is an angle-axis vector, which is how most SfM engines
    /// store shot rotations.
    pub fn from_world_to_camera(rotation_cw: &Vector3<f64>, translation: &Vector3<f64>) -> Self {
        let r_cw = Rotation3::new(*rotation_cw);
        let r_wc = r_cw.inverse();
        Self {
            rotation: UnitQuaternion::from_rotation_matrix(&r_wc),
            center: -(r_wc * translation),
        }
    }

    /// Nadir-looking camera with image "up" pointing north.
    pub fn nadir(center: Vector3<f64>) -> Self {
        Self {
            rotation: UnitQuaternion::from_axis_angle(&Vector3::x_axis(), std::f64::consts::PI),
            center,
        }
    }

    /// Camera-frame point to world.
    pub fn to_world(&self, p_cam: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p_cam + self.center
    }

    /// World point to camera frame.
    pub fn to_camera(&self, p_world: &Vector3<f64>) -> Vector3<f64> {
        self.rotation.inverse() * (p_world - self.center)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_world_camera_roundtrip() {
        let pose = CameraPose::new(
            UnitQuaternion::from_euler_angles(0.1, -0.2, 0.3),
            Vector3::new(1.0, 2.0, 30.0),
        );
        let p = Vector3::new(4.0, -3.0, 0.5);
        assert_relative_eq!(pose.to_world(&pose.to_camera(&p)), p, epsilon = 1e-9);
    }

    #[test]
    fn test_from_world_to_camera() {
        let expected = CameraPose::nadir(Vector3::new(5.0, -2.0, 25.0));
        let r_cw = expected.rotation.inverse();
        let t = -(r_cw * expected.center);

        let pose = CameraPose::from_world_to_camera(&r_cw.scaled_axis(), &t);
        assert_relative_eq!(pose.center, expected.center, epsilon = 1e-9);
        let z = Vector3::new(0.0, 0.0, 1.0);
        assert_relative_eq!(pose.rotation * z, expected.rotation * z, epsilon = 1e-9);
    }

    #[test]
    fn test_nadir_looks_down() {
        let pose = CameraPose::nadir(Vector3::zeros());
        let forward = pose.rotation * Vector3::new(0.0, 0.0, 1.0);
        assert_relative_eq!(forward, Vector3::new(0.0, 0.0, -1.0), epsilon = 1e-12);
        // Image x stays east, image y (down) points south.
        let right = pose.rotation * Vector3::new(1.0, 0.0, 0.0);
        let down = pose.rotation * Vector3::new(0.0, 1.0, 0.0);
        assert_relative_eq!(right, Vector3::new(1.0, 0.0, 0.0), epsilon = 1e-12);
        assert_relative_eq!(down, Vector3::new(0.0, -1.0, 0.0), epsilon = 1e-12);
    }
}
