//! Frame records and ingestion-boundary validation.

use std::collections::HashSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::geometry::GeoPoint;

/// Identifier of a captured frame, as assigned by the capture device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FrameId(pub u64);

impl FrameId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for FrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "F{}", self.0)
    }
}

/// One captured frame with its GPS telemetry. Immutable once ingested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub id: FrameId,
    /// Capture time in seconds.
    pub timestamp_s: f64,
    pub position: GeoPoint,
    /// Position in capture order.
    pub sequence: usize,
    /// Image payload handed opaquely to the collaborators.
    pub image: Option<PathBuf>,
}

/// Raw telemetry record as read from disk. Every field may be missing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelemetryRecord {
    pub id: Option<u64>,
    pub timestamp: Option<f64>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub alt: Option<f64>,
    #[serde(default)]
    pub image: Option<String>,
}

impl TelemetryRecord {
    fn into_frame(self, record: usize) -> Result<Frame> {
        let id = self
            .id
            .ok_or_else(|| PipelineError::malformed(record, "missing id"))?;
        let timestamp_s = self
            .timestamp
            .ok_or_else(|| PipelineError::malformed(record, "missing timestamp"))?;
        let lat = self
            .lat
            .ok_or_else(|| PipelineError::malformed(record, "missing lat"))?;
        let lon = self
            .lon
            .ok_or_else(|| PipelineError::malformed(record, "missing lon"))?;
        let alt = self
            .alt
            .ok_or_else(|| PipelineError::malformed(record, "missing alt"))?;

        let image = self
            .image
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        Ok(Frame {
            id: FrameId(id),
            timestamp_s,
            position: GeoPoint::new(lat, lon, alt),
            sequence: record,
            image,
        })
    }
}

/// Convert raw records into typed frames, in capture order.
///
/// The sequence index of each frame is its position in `records`.
pub fn frames_from_records(records: Vec<TelemetryRecord>) -> Result<Vec<Frame>> {
    let frames = records
        .into_iter()
        .enumerate()
        .map(|(i, rec)| rec.into_frame(i))
        .collect::<Result<Vec<_>>>()?;
    validate_frames(&frames)?;
    Ok(frames)
}

/// Check the ordering and field invariants of a frame list.
///
/// Sequence indices must strictly increase, timestamps must not decrease,
/// ids must be unique, and every numeric field must be finite and in range.
pub fn validate_frames(frames: &[Frame]) -> Result<()> {
    let mut seen = HashSet::with_capacity(frames.len());

    for (i, frame) in frames.iter().enumerate() {
        if !frame.timestamp_s.is_finite() {
            return Err(PipelineError::malformed(i, "non-finite timestamp"));
        }
        if !frame.position.is_valid() {
            return Err(PipelineError::malformed(
                i,
                format!("invalid GPS position {:?}", frame.position),
            ));
        }
        if !seen.insert(frame.id) {
            return Err(PipelineError::malformed(
                i,
                format!("duplicate frame id {}", frame.id),
            ));
        }
        if i > 0 {
            let prev = &frames[i - 1];
            if frame.sequence <= prev.sequence {
                return Err(PipelineError::malformed(
                    i,
                    format!(
                        "sequence index {} does not follow {}",
                        frame.sequence, prev.sequence
                    ),
                ));
            }
            if frame.timestamp_s < prev.timestamp_s {
                return Err(PipelineError::malformed(
                    i,
                    format!(
                        "timestamp {:.3}s precedes previous frame at {:.3}s",
                        frame.timestamp_s, prev.timestamp_s
                    ),
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: u64, t: f64) -> TelemetryRecord {
        TelemetryRecord {
            id: Some(id),
            timestamp: Some(t),
            lat: Some(47.0),
            lon: Some(8.0),
            alt: Some(450.0),
            image: None,
        }
    }

    #[test]
    fn test_records_become_ordered_frames() {
        let frames = frames_from_records(vec![record(10, 0.0), record(11, 0.1)]).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].id, FrameId::new(11));
        assert_eq!(frames[1].sequence, 1);
    }

    #[test]
    fn test_missing_field_is_malformed() {
        let mut bad = record(2, 0.2);
        bad.lat = None;
        let err = frames_from_records(vec![record(1, 0.1), bad]).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::MalformedTelemetry { record: 1, .. }
        ));
    }

    #[test]
    fn test_unordered_timestamps_rejected() {
        let err = frames_from_records(vec![record(1, 1.0), record(2, 0.5)]).unwrap_err();
        assert!(matches!(err, PipelineError::MalformedTelemetry { .. }));
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let err = frames_from_records(vec![record(1, 0.0), record(1, 0.1)]).unwrap_err();
        assert!(format!("{}", err).contains("duplicate"));
    }

    #[test]
    fn test_out_of_range_position_rejected() {
        let mut bad = record(1, 0.0);
        bad.lat = Some(123.0);
        assert!(frames_from_records(vec![bad]).is_err());
    }

    #[test]
    fn test_blank_image_is_none() {
        let mut rec = record(1, 0.0);
        rec.image = Some("  ".to_string());
        let frames = frames_from_records(vec![rec]).unwrap();
        assert!(frames[0].image.is_none());
    }
}
