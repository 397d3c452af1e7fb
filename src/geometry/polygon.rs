//! Ground-plane footprints built on `geo` polygons.

use geo::{Area, BooleanOps, Centroid, ConvexHull, Coord, MultiPoint, Point, Polygon};
use nalgebra::Vector2;

/// Footprints smaller than this (square meters) are treated as degenerate.
const MIN_FOOTPRINT_AREA: f64 = 1e-6;

/// Convex footprint of a set of ground points.
///
/// Segmentation masks are reduced to their convex hull before matching, so
/// ragged mask borders do not depress the overlap score.
/// Returns None for fewer than three points or a degenerate hull.
pub fn convex_footprint(points: &[Vector2<f64>]) -> Option<Polygon<f64>> {
    if points.len() < 3 {
        return None;
    }
    let multi: MultiPoint<f64> = points.iter().map(|p| Point::new(p.x, p.y)).collect();
    let hull = multi.convex_hull();
    if hull.unsigned_area() < MIN_FOOTPRINT_AREA {
        return None;
    }
    Some(hull)
}

/// Area centroid of a footprint.
pub fn footprint_centroid(polygon: &Polygon<f64>) -> Option<Vector2<f64>> {
    polygon.centroid().map(|c| Vector2::new(c.x(), c.y()))
}

/// Intersection-over-union of two footprints. Zero when either is empty.
pub fn polygon_iou(a: &Polygon<f64>, b: &Polygon<f64>) -> f64 {
    let intersection = a.intersection(b).unsigned_area();
    if intersection <= MIN_FOOTPRINT_AREA {
        return 0.0;
    }
    let union = a.unsigned_area() + b.unsigned_area() - intersection;
    if union <= MIN_FOOTPRINT_AREA {
        return 0.0;
    }
    intersection / union
}

/// Exterior ring without the closing vertex, as plain coordinates.
pub fn exterior_coords(polygon: &Polygon<f64>) -> Vec<[f64; 2]> {
    let ring: Vec<Coord<f64>> = polygon.exterior().coords().copied().collect();
    let open = match (ring.first(), ring.last()) {
        (Some(first), Some(last)) if ring.len() > 1 && first == last => &ring[..ring.len() - 1],
        _ => &ring[..],
    };
    open.iter().map(|c| [c.x, c.y]).collect()
}
