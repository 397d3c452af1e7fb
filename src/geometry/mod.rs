//! Geometry utilities: geodesy, camera poses, back-projection, footprints.

pub mod camera;
pub mod geodesy;
pub mod polygon;
pub mod pose;

pub use camera::CameraIntrinsics;
pub use geodesy::{GeoPoint, LocalFrame};
pub use polygon::{convex_footprint, exterior_coords, footprint_centroid, polygon_iou};
pub use pose::CameraPose;
