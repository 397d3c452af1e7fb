//! WGS84 geodesy: geodetic <-> ECEF <-> local ENU conversions.
//!
//! Two kinds of local frames appear in a plant run:
//!
//! 1. **Plant frame** - ENU anchored at the first frame of the capture. Every
//!    module footprint in the final model is expressed here.
//! 2. **Engine frames** - each reconstruction is returned in its own
//!    topocentric frame, anchored at a reference reported by the engine.
//!
//! Converting an engine-frame point into the plant frame goes through geodetic
//! coordinates: `plant.to_local(&engine.to_geodetic(p))`.
//!
//! # Frame convention
//! ```text
//!        +U (up)
//!         |
//!         |
//!         +------ +E (east)
//!        /
//!       /
//!      +N (north)
//! ```
//! Local vectors are stored as `(east, north, up)` in meters.

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

/// WGS84 semi-major axis (meters).
const WGS84_A: f64 = 6_378_137.0;

/// WGS84 flattening.
const WGS84_F: f64 = 1.0 / 298.257_223_563;

/// Fixed-point iterations for ECEF -> geodetic latitude.
const LATITUDE_ITERATIONS: usize = 6;

fn eccentricity_sq() -> f64 {
    WGS84_F * (2.0 - WGS84_F)
}

/// A geodetic position: latitude/longitude in degrees, altitude in meters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64, alt: f64) -> Self {
        Self { lat, lon, alt }
    }

    /// Whether all components are finite and lat/lon are within range.
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && self.alt.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }

    /// Earth-centered, earth-fixed coordinates of this point.
    pub fn to_ecef(&self) -> Vector3<f64> {
        let lat = self.lat.to_radians();
        let lon = self.lon.to_radians();
        let e2 = eccentricity_sq();
        let n = WGS84_A / (1.0 - e2 * lat.sin().powi(2)).sqrt();
        Vector3::new(
            (n + self.alt) * lat.cos() * lon.cos(),
            (n + self.alt) * lat.cos() * lon.sin(),
            (n * (1.0 - e2) + self.alt) * lat.sin(),
        )
    }

    /// Inverse of [`GeoPoint::to_ecef`].
    pub fn from_ecef(ecef: &Vector3<f64>) -> Self {
        let e2 = eccentricity_sq();
        let lon = ecef.y.atan2(ecef.x);
        let p = (ecef.x * ecef.x + ecef.y * ecef.y).sqrt();

        let mut lat = ecef.z.atan2(p * (1.0 - e2));
        let mut alt = 0.0;
        for _ in 0..LATITUDE_ITERATIONS {
            let n = WGS84_A / (1.0 - e2 * lat.sin().powi(2)).sqrt();
            alt = p / lat.cos() - n;
            lat = ecef.z.atan2(p * (1.0 - e2 * n / (n + alt)));
        }

        Self {
            lat: lat.to_degrees(),
            lon: lon.to_degrees(),
            alt,
        }
    }

    /// Straight-line distance in meters between two geodetic points.
    pub fn distance_to(&self, other: &GeoPoint) -> f64 {
        (self.to_ecef() - other.to_ecef()).norm()
    }
}

/// East-north-up tangent frame anchored at a geodetic origin.
#[derive(Debug, Clone)]
pub struct LocalFrame {
    origin: GeoPoint,
    origin_ecef: Vector3<f64>,
    /// Rotation taking ECEF offsets into ENU.
    ecef_to_enu: Matrix3<f64>,
}

impl LocalFrame {
    pub fn new(origin: GeoPoint) -> Self {
        let lat = origin.lat.to_radians();
        let lon = origin.lon.to_radians();
        let (slat, clat) = lat.sin_cos();
        let (slon, clon) = lon.sin_cos();

        #[rustfmt::skip]
        let ecef_to_enu = Matrix3::new(
            -slon,         clon,        0.0,
            -slat * clon, -slat * slon, clat,
             clat * clon,  clat * slon, slat,
        );

        Self {
            origin,
            origin_ecef: origin.to_ecef(),
            ecef_to_enu,
        }
    }

    pub fn origin(&self) -> &GeoPoint {
        &self.origin
    }

    /// Express a geodetic point in this frame.
    pub fn to_local(&self, point: &GeoPoint) -> Vector3<f64> {
        self.ecef_to_enu * (point.to_ecef() - self.origin_ecef)
    }

    /// Geodetic position of a local point.
    pub fn to_geodetic(&self, local: &Vector3<f64>) -> GeoPoint {
        let ecef = self.origin_ecef + self.ecef_to_enu.transpose() * local;
        GeoPoint::from_ecef(&ecef)
    }

    /// Re-express a point given in `self` in `other`.
    pub fn transfer_point(&self, point: &Vector3<f64>, other: &LocalFrame) -> Vector3<f64> {
        other.to_local(&self.to_geodetic(point))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn plant_origin() -> GeoPoint {
        GeoPoint::new(48.137_154, 11.576_124, 520.0)
    }

    #[test]
    fn test_ecef_roundtrip() {
        let p = plant_origin();
        let back = GeoPoint::from_ecef(&p.to_ecef());
        assert_relative_eq!(back.lat, p.lat, epsilon = 1e-9);
        assert_relative_eq!(back.lon, p.lon, epsilon = 1e-9);
        assert_relative_eq!(back.alt, p.alt, epsilon = 1e-4);
    }

    #[test]
    fn test_origin_maps_to_zero() {
        let frame = LocalFrame::new(plant_origin());
        let local = frame.to_local(&plant_origin());
        assert!(local.norm() < 1e-6);
    }

    #[test]
    fn test_enu_axes() {
        let origin = plant_origin();
        let frame = LocalFrame::new(origin);

        // Moving north increases the N component, leaves E near zero.
        let north = GeoPoint::new(origin.lat + 0.001, origin.lon, origin.alt);
        let local = frame.to_local(&north);
        assert!(local.y > 100.0 && local.y < 120.0);
        assert!(local.x.abs() < 1e-3);

        // Moving east increases the E component.
        let east = GeoPoint::new(origin.lat, origin.lon + 0.001, origin.alt);
        let local = frame.to_local(&east);
        assert!(local.x > 70.0 && local.x < 80.0);

        // Altitude maps onto U.
        let up = GeoPoint::new(origin.lat, origin.lon, origin.alt + 30.0);
        assert_relative_eq!(frame.to_local(&up).z, 30.0, epsilon = 1e-6);
    }

    #[test]
    fn test_local_roundtrip() {
        let frame = LocalFrame::new(plant_origin());
        let local = Vector3::new(120.0, -45.0, -28.0);
        let back = frame.to_local(&frame.to_geodetic(&local));
        assert_relative_eq!(back, local, epsilon = 1e-6);
    }

    #[test]
    fn test_transfer_between_frames() {
        let origin = plant_origin();
        let plant = LocalFrame::new(origin);
        let other = LocalFrame::new(GeoPoint::new(origin.lat + 0.0005, origin.lon, origin.alt));

        let p_plant = Vector3::new(10.0, 80.0, -30.0);
        let p_other = plant.transfer_point(&p_plant, &other);
        let back = other.transfer_point(&p_other, &plant);
        assert_relative_eq!(back, p_plant, epsilon = 1e-6);
    }

    #[test]
    fn test_distance() {
        let a = plant_origin();
        let b = GeoPoint::new(a.lat, a.lon, a.alt + 12.5);
        assert_relative_eq!(a.distance_to(&b), 12.5, epsilon = 1e-6);
    }

    #[test]
    fn test_validity() {
        assert!(plant_origin().is_valid());
        assert!(!GeoPoint::new(91.0, 0.0, 0.0).is_valid());
        assert!(!GeoPoint::new(0.0, f64::NAN, 0.0).is_valid());
    }
}
