//! Telemetry index and discontinuity queries.
//!
//! The index is built once per plant run from a validated, ordered frame list.
//! Every query is side-effect-free.

use std::collections::HashMap;

use nalgebra::Vector3;
use serde::Serialize;

use crate::error::{PipelineError, Result};
use crate::geometry::{GeoPoint, LocalFrame};

use super::frame::{validate_frames, Frame, FrameId};

/// Why two adjacent frames must not share a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DiscontinuityKind {
    /// Capture paused (e.g., battery swap).
    Temporal,
    /// Position jumped (e.g., GPS reset or a new flight line far away).
    Spatial,
    Both,
}

/// Break in capture continuity between two consecutive frames.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscontinuityMarker {
    pub before: FrameId,
    pub after: FrameId,
    /// Sequence index of `after`.
    pub after_sequence: usize,
    pub time_gap_s: f64,
    pub jump_m: f64,
    pub kind: DiscontinuityKind,
}

/// Ordered frames plus lookup tables.
#[derive(Debug, Clone)]
pub struct TelemetryIndex {
    frames: Vec<Frame>,
    /// FrameId -> position in `frames`.
    by_id: HashMap<FrameId, usize>,
    /// Plant frame anchored at the first frame.
    plant: Option<LocalFrame>,
    /// Frame positions in the plant frame.
    local_positions: Vec<Vector3<f64>>,
}

impl TelemetryIndex {
    /// Build the index, rejecting unordered or malformed frames.
    pub fn build(frames: Vec<Frame>) -> Result<Self> {
        validate_frames(&frames)?;

        let by_id = frames
            .iter()
            .enumerate()
            .map(|(pos, f)| (f.id, pos))
            .collect();
        let plant = frames.first().map(|f| LocalFrame::new(f.position));
        let local_positions = match &plant {
            Some(plant) => frames.iter().map(|f| plant.to_local(&f.position)).collect(),
            None => Vec::new(),
        };

        Ok(Self {
            frames,
            by_id,
            plant,
            local_positions,
        })
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// All frames in capture order.
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    /// Frame at an index position.
    pub fn get(&self, pos: usize) -> Option<&Frame> {
        self.frames.get(pos)
    }

    /// Index position of a frame id.
    pub fn position_of(&self, id: FrameId) -> Option<usize> {
        self.by_id.get(&id).copied()
    }

    pub fn frame(&self, id: FrameId) -> Option<&Frame> {
        self.position_of(id).map(|pos| &self.frames[pos])
    }

    /// Geodetic origin of the plant coordinate frame (the first frame).
    pub fn plant_reference(&self) -> Option<GeoPoint> {
        self.plant.as_ref().map(|p| *p.origin())
    }

    pub fn plant_frame(&self) -> Option<&LocalFrame> {
        self.plant.as_ref()
    }

    /// Lazily enumerate discontinuities between consecutive frames.
    ///
    /// The returned iterator is finite and ordered by sequence index; calling
    /// this again (or cloning the iterator) restarts the enumeration.
    pub fn find_discontinuities(
        &self,
        max_time_gap_s: f64,
        max_spatial_jump_m: f64,
    ) -> Discontinuities<'_> {
        Discontinuities {
            index: self,
            next: 1,
            max_time_gap_s,
            max_spatial_jump_m,
        }
    }

    /// Validate thresholds before any enumeration.
    pub fn check_thresholds(max_time_gap_s: f64, max_spatial_jump_m: f64) -> Result<()> {
        if !(max_time_gap_s > 0.0) || !(max_spatial_jump_m > 0.0) {
            return Err(PipelineError::Config(format!(
                "discontinuity thresholds must be positive (time gap {}, spatial jump {})",
                max_time_gap_s, max_spatial_jump_m
            )));
        }
        Ok(())
    }
}

/// Iterator over [`DiscontinuityMarker`]s of a [`TelemetryIndex`].
#[derive(Debug, Clone)]
pub struct Discontinuities<'a> {
    index: &'a TelemetryIndex,
    /// Position of the next "after" frame to examine.
    next: usize,
    max_time_gap_s: f64,
    max_spatial_jump_m: f64,
}

impl Iterator for Discontinuities<'_> {
    type Item = DiscontinuityMarker;

    fn next(&mut self) -> Option<Self::Item> {
        let frames = &self.index.frames;
        let positions = &self.index.local_positions;

        while self.next < frames.len() {
            let pos = self.next;
            self.next += 1;

            let prev = &frames[pos - 1];
            let cur = &frames[pos];
            let time_gap_s = cur.timestamp_s - prev.timestamp_s;
            let jump_m = (positions[pos] - positions[pos - 1]).norm();

            let temporal = time_gap_s > self.max_time_gap_s;
            let spatial = jump_m > self.max_spatial_jump_m;
            let kind = match (temporal, spatial) {
                (true, true) => DiscontinuityKind::Both,
                (true, false) => DiscontinuityKind::Temporal,
                (false, true) => DiscontinuityKind::Spatial,
                (false, false) => continue,
            };

            return Some(DiscontinuityMarker {
                before: prev.id,
                after: cur.id,
                after_sequence: cur.sequence,
                time_gap_s,
                jump_m,
                kind,
            });
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.index.frames.len().saturating_sub(self.next)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Frames flying north at 5 m/s, 10 Hz.
    fn line_frames(n: usize) -> Vec<Frame> {
        (0..n)
            .map(|i| Frame {
                id: FrameId::new(i as u64),
                timestamp_s: i as f64 * 0.1,
                position: GeoPoint::new(47.0 + i as f64 * 0.5 / 111_200.0, 8.0, 480.0),
                sequence: i,
                image: None,
            })
            .collect()
    }

    #[test]
    fn test_build_and_lookup() {
        let index = TelemetryIndex::build(line_frames(5)).unwrap();
        assert_eq!(index.len(), 5);
        assert_eq!(index.position_of(FrameId::new(3)), Some(3));
        assert!(index.frame(FrameId::new(99)).is_none());
        let frame = index.frame(FrameId::new(4)).unwrap();
        let p = index.plant_frame().unwrap().to_local(&frame.position);
        assert!((p.y - 2.0).abs() < 0.05);
    }

    #[test]
    fn test_build_rejects_unordered() {
        let mut frames = line_frames(3);
        frames.swap(1, 2);
        assert!(matches!(
            TelemetryIndex::build(frames),
            Err(PipelineError::MalformedTelemetry { .. })
        ));
    }

    #[test]
    fn test_no_discontinuities_on_smooth_capture() {
        let index = TelemetryIndex::build(line_frames(50)).unwrap();
        assert_eq!(index.find_discontinuities(1.0, 10.0).count(), 0);
    }

    #[test]
    fn test_temporal_and_spatial_markers() {
        let mut frames = line_frames(10);
        // battery swap: 3 minutes pause before frame 4
        for f in frames.iter_mut().skip(4) {
            f.timestamp_s += 180.0;
        }
        // GPS jump of ~200 m before frame 7
        for f in frames.iter_mut().skip(7) {
            f.position.lon += 200.0 / 75_800.0;
        }
        let index = TelemetryIndex::build(frames).unwrap();
        let markers: Vec<_> = index.find_discontinuities(5.0, 50.0).collect();

        assert_eq!(markers.len(), 2);
        assert_eq!(markers[0].after, FrameId::new(4));
        assert_eq!(markers[0].kind, DiscontinuityKind::Temporal);
        assert_eq!(markers[1].before, FrameId::new(6));
        assert_eq!(markers[1].kind, DiscontinuityKind::Spatial);
    }

    #[test]
    fn test_discontinuities_restartable() {
        let mut frames = line_frames(6);
        frames[3].timestamp_s += 30.0;
        frames[4].timestamp_s += 30.0;
        frames[5].timestamp_s += 30.0;
        let index = TelemetryIndex::build(frames).unwrap();

        let iter = index.find_discontinuities(5.0, 50.0);
        let first: Vec<_> = iter.clone().collect();
        let second: Vec<_> = iter.collect();
        assert_eq!(first, second);
        assert_eq!(first.len(), 1);
    }

    #[test]
    fn test_empty_index() {
        let index = TelemetryIndex::build(Vec::new()).unwrap();
        assert!(index.is_empty());
        assert!(index.plant_reference().is_none());
        assert_eq!(index.find_discontinuities(1.0, 1.0).count(), 0);
    }

    #[test]
    fn test_threshold_check() {
        assert!(TelemetryIndex::check_thresholds(1.0, 5.0).is_ok());
        assert!(TelemetryIndex::check_thresholds(0.0, 5.0).is_err());
        assert!(TelemetryIndex::check_thresholds(1.0, f64::NAN).is_err());
    }
}
