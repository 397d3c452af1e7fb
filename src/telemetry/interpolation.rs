//! Piecewise linear interpolation of low-rate GPS fixes.
//!
//! Many drone payloads stamp each video frame with the most recent GPS fix,
//! which updates at 1-10 Hz while frames arrive at 30 Hz. Runs of identical
//! positions therefore describe a staircase trajectory. Each distinct fix is
//! taken as valid at the timestamp of the first frame that carries it, and the
//! frames between two fixes are placed on the straight line joining them.
//! Frames after the last fix keep that fix (no extrapolation).
//!
//! Two fixes further apart than the discontinuity thresholds are never joined:
//! the frames between them keep their raw fix, so the jump stays visible to
//! discontinuity detection.

use crate::geometry::GeoPoint;

use super::frame::Frame;

/// Replace repeated GPS fixes by time-interpolated positions, in place.
///
/// Fix pairs more than `max_time_gap_s` seconds or `max_spatial_jump_m`
/// meters apart are left untouched. Returns the number of frames whose
/// position changed.
pub fn interpolate_repeated_fixes(
    frames: &mut [Frame],
    max_time_gap_s: f64,
    max_spatial_jump_m: f64,
) -> usize {
    // Positions of frames that introduce a new fix.
    let fix_starts: Vec<usize> = (0..frames.len())
        .filter(|&i| i == 0 || frames[i].position != frames[i - 1].position)
        .collect();

    let mut changed = 0;
    for pair in fix_starts.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        let (t0, p0) = (frames[a].timestamp_s, frames[a].position);
        let (t1, p1) = (frames[b].timestamp_s, frames[b].position);
        let span = t1 - t0;
        if span <= 0.0 || span > max_time_gap_s {
            continue;
        }
        if p0.distance_to(&p1) > max_spatial_jump_m {
            continue;
        }

        for frame in &mut frames[a + 1..b] {
            let s = (frame.timestamp_s - t0) / span;
            frame.position = lerp(&p0, &p1, s);
            changed += 1;
        }
    }
    changed
}

fn lerp(a: &GeoPoint, b: &GeoPoint, s: f64) -> GeoPoint {
    GeoPoint::new(
        a.lat + (b.lat - a.lat) * s,
        a.lon + (b.lon - a.lon) * s,
        a.alt + (b.alt - a.alt) * s,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::LocalFrame;
    use crate::telemetry::{FrameId, TelemetryIndex};
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    const MAX_GAP_S: f64 = 5.0;
    const MAX_JUMP_M: f64 = 50.0;

    fn frame(i: usize, t: f64, lat: f64) -> Frame {
        Frame {
            id: FrameId::new(i as u64),
            timestamp_s: t,
            position: GeoPoint::new(lat, 8.0, 400.0),
            sequence: i,
            image: None,
        }
    }

    #[test]
    fn test_staircase_is_smoothed() {
        // Fix updates every 4 frames.
        let mut frames = vec![
            frame(0, 0.0, 47.0),
            frame(1, 0.1, 47.0),
            frame(2, 0.2, 47.0),
            frame(3, 0.3, 47.0),
            frame(4, 0.4, 47.00004),
            frame(5, 0.5, 47.00004),
        ];
        let changed = interpolate_repeated_fixes(&mut frames, MAX_GAP_S, MAX_JUMP_M);
        assert_eq!(changed, 3);
        assert_relative_eq!(frames[1].position.lat, 47.00001, epsilon = 1e-12);
        assert_relative_eq!(frames[3].position.lat, 47.00003, epsilon = 1e-12);
        // After the last fix nothing is extrapolated.
        assert_relative_eq!(frames[5].position.lat, 47.00004, epsilon = 1e-12);
    }

    #[test]
    fn test_distinct_fixes_untouched() {
        let mut frames = vec![frame(0, 0.0, 47.0), frame(1, 0.1, 47.1)];
        assert_eq!(interpolate_repeated_fixes(&mut frames, MAX_GAP_S, MAX_JUMP_M), 0);
        assert_eq!(frames[1].position.lat, 47.1);
    }

    #[test]
    fn test_zero_span_skipped() {
        let mut frames = vec![
            frame(0, 1.0, 47.0),
            frame(1, 1.0, 47.0),
            frame(2, 1.0, 47.2),
        ];
        assert_eq!(interpolate_repeated_fixes(&mut frames, MAX_GAP_S, MAX_JUMP_M), 0);
    }

    #[test]
    fn test_jump_between_fixes_is_kept() {
        // 10 Hz frames, fix A repeated on 0..9, then a fix 200 m east.
        let plant = LocalFrame::new(GeoPoint::new(47.0, 8.0, 400.0));
        let mut frames: Vec<Frame> = (0..20)
            .map(|i| {
                let east = if i < 10 { 0.0 } else { 200.0 };
                Frame {
                    id: FrameId::new(i as u64),
                    timestamp_s: i as f64 * 0.1,
                    position: plant.to_geodetic(&Vector3::new(east, 0.0, 0.0)),
                    sequence: i,
                    image: None,
                }
            })
            .collect();
        let raw: Vec<_> = frames.iter().map(|f| f.position).collect();

        assert_eq!(interpolate_repeated_fixes(&mut frames, MAX_GAP_S, MAX_JUMP_M), 0);
        assert!(frames.iter().zip(&raw).all(|(f, p)| f.position == *p));

        let index = TelemetryIndex::build(frames).unwrap();
        let markers: Vec<_> = index.find_discontinuities(MAX_GAP_S, MAX_JUMP_M).collect();
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].after, FrameId::new(10));
    }

    #[test]
    fn test_long_pause_between_fixes_is_kept() {
        let mut frames = vec![
            frame(0, 0.0, 47.0),
            frame(1, 3.0, 47.0),
            frame(2, 10.0, 47.0001),
        ];
        assert_eq!(interpolate_repeated_fixes(&mut frames, MAX_GAP_S, MAX_JUMP_M), 0);
        assert_eq!(frames[1].position.lat, 47.0);
    }
}
