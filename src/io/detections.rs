//! Precomputed segmentation output.
//!
//! `detections.json` maps frame ids to module outlines:
//! `{ "<frame id>": [ { "polygon": [[u, v], ...], "confidence": 0.93 } ] }`

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use anyhow::{Context, Result};
use nalgebra::Vector2;
use serde::Deserialize;

use crate::merging::{ModuleDetection, ModuleSegmenter};
use crate::telemetry::{Frame, FrameId};

#[derive(Debug, Deserialize)]
struct RawDetection {
    polygon: Vec<[f64; 2]>,
    confidence: f64,
}

/// Segmenter that serves detections loaded from disk.
#[derive(Debug, Clone, Default)]
pub struct PrecomputedSegmenter {
    by_frame: HashMap<FrameId, Vec<ModuleDetection>>,
}

impl PrecomputedSegmenter {
    pub fn from_path(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        let raw: HashMap<String, Vec<RawDetection>> = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        let mut by_frame = HashMap::with_capacity(raw.len());
        for (key, list) in raw {
            let frame = FrameId::new(
                key.trim()
                    .parse()
                    .with_context(|| format!("Detection key {:?} is not a frame id", key))?,
            );
            let detections = list
                .into_iter()
                .map(|d| ModuleDetection {
                    frame,
                    polygon: d.polygon.into_iter().map(Vector2::from).collect(),
                    confidence: d.confidence,
                })
                .collect();
            by_frame.insert(frame, detections);
        }
        Ok(Self { by_frame })
    }

    pub fn len(&self) -> usize {
        self.by_frame.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_frame.is_empty()
    }
}

impl ModuleSegmenter for PrecomputedSegmenter {
    fn detect(&self, frame: &Frame) -> anyhow::Result<Vec<ModuleDetection>> {
        Ok(self.by_frame.get(&frame.id).cloned().unwrap_or_default())
    }
}
