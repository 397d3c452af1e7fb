//! Fusion of per-cluster candidates into one deduplicated module registry.
//!
//! Candidates from every accepted result are processed in a canonical order
//! (confidence desc, cluster, frame sequence, detection index), so the output
//! does not depend on the order results or detections were supplied in.
//! Each record's footprint is that of its first, highest-confidence candidate.

use std::collections::{BTreeMap, BTreeSet};

use geo::Polygon;
use nalgebra::{Vector2, Vector3};
use rstar::{PointDistance, RTree, RTreeObject, AABB};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{PipelineError, Result};
use crate::geometry::{exterior_coords, polygon_iou, CameraIntrinsics, GeoPoint, LocalFrame};
use crate::planning::ClusterId;
use crate::reconstruction::ReconstructionResult;
use crate::telemetry::{FrameId, TelemetryIndex};

use super::candidate::{back_project, Candidate};
use super::detection::DetectionSet;

/// Merger thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Footprints overlapping at least this much are the same module.
    pub merge_iou_threshold: f64,
    /// Candidates whose centroids are farther apart are never compared (m).
    pub association_distance_m: f64,
    /// Records seen in fewer frames are dropped.
    pub min_detection_support: usize,
    pub min_detection_confidence: f64,
    /// Overlap at which an unmatched candidate contradicts a record already
    /// supported by the same frame.
    pub duplicate_iou_threshold: f64,
    /// Used to place the ground plane when a cluster has no sparse points.
    pub nominal_flight_height_m: f64,
    pub camera: CameraIntrinsics,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            merge_iou_threshold: 0.7,
            association_distance_m: 2.0,
            min_detection_support: 2,
            min_detection_confidence: 0.3,
            duplicate_iou_threshold: 0.5,
            nominal_flight_height_m: 30.0,
            camera: CameraIntrinsics::default(),
        }
    }
}

impl MergeConfig {
    pub fn validate(&self) -> Result<()> {
        let unit = |v: f64| v > 0.0 && v <= 1.0;
        if !unit(self.merge_iou_threshold) || !unit(self.duplicate_iou_threshold) {
            return Err(PipelineError::Config(
                "IoU thresholds must lie in (0, 1]".into(),
            ));
        }
        if !(self.association_distance_m > 0.0) {
            return Err(PipelineError::Config(
                "association_distance_m must be positive".into(),
            ));
        }
        if self.min_detection_support == 0 {
            return Err(PipelineError::Config(
                "min_detection_support must be at least 1".into(),
            ));
        }
        if !self.camera.is_valid() {
            return Err(PipelineError::Config(format!(
                "invalid camera intrinsics {:?}",
                self.camera
            )));
        }
        Ok(())
    }
}

/// Identifier of a merged module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(pub u32);

impl std::fmt::Display for ModuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "M{:06}", self.0)
    }
}

impl Serialize for ModuleId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

/// One detection backing a record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Support {
    pub cluster: ClusterId,
    pub confidence: f64,
    /// Outline in image pixels.
    pub polygon: Vec<[f64; 2]>,
}

/// A physical PV module in the plant model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModuleRecord {
    pub id: ModuleId,
    /// Centroid in the plant frame (ENU at the first frame, meters).
    pub centroid: [f64; 3],
    /// Footprint outline in the plant frame.
    pub polygon: Vec<[f64; 3]>,
    pub geodetic: GeoPoint,
    /// Supporting detections by frame.
    pub supports: BTreeMap<FrameId, Support>,
    pub provenance: BTreeSet<ClusterId>,
    pub confidence: f64,
}

impl ModuleRecord {
    pub fn support_count(&self) -> usize {
        self.supports.len()
    }
}

/// Counters of one merge.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MergeStats {
    pub candidates: usize,
    pub skipped: usize,
    pub merged: usize,
    pub same_frame_conflicts: usize,
    pub overlap_duplicates: usize,
    pub contradicting: usize,
    pub below_support: usize,
    pub records: usize,
}

/// Record under construction.
struct Draft {
    footprint: Polygon<f64>,
    centroid: Vector2<f64>,
    ground_z: f64,
    confidence: f64,
    supports: BTreeMap<FrameId, Support>,
    provenance: BTreeSet<ClusterId>,
}

/// Draft centroid stored in the R-tree.
struct IndexedCentroid {
    draft: usize,
    point: [f64; 2],
}

impl RTreeObject for IndexedCentroid {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point(self.point)
    }
}

impl PointDistance for IndexedCentroid {
    fn distance_2(&self, point: &[f64; 2]) -> f64 {
        let dx = self.point[0] - point[0];
        let dy = self.point[1] - point[1];
        dx * dx + dy * dy
    }
}

/// Builds the module registry from accepted results.
#[derive(Debug, Clone, Default)]
pub struct RegistryMerger {
    config: MergeConfig,
}

impl RegistryMerger {
    pub fn new(config: MergeConfig) -> Self {
        Self { config }
    }

    /// Merge detections seen through `results` into module records.
    ///
    /// `plant` is the common output frame.
    pub fn merge(
        &self,
        results: &[ReconstructionResult],
        detections: &DetectionSet,
        index: &TelemetryIndex,
        plant: &LocalFrame,
    ) -> (Vec<ModuleRecord>, MergeStats) {
        let cfg = &self.config;
        let mut stats = MergeStats::default();

        let mut candidates = Vec::new();
        for result in results {
            let (mut c, skipped) = back_project(
                result,
                detections,
                index,
                &cfg.camera,
                plant,
                cfg.min_detection_confidence,
                cfg.nominal_flight_height_m,
            );
            stats.skipped += skipped;
            candidates.append(&mut c);
        }
        stats.candidates = candidates.len();
        candidates.sort_by(canonical_order);

        let mut drafts: Vec<Draft> = Vec::new();
        let mut tree: RTree<IndexedCentroid> = RTree::new();
        let radius_2 = cfg.association_distance_m * cfg.association_distance_m;

        for cand in candidates {
            let query = [cand.centroid.x, cand.centroid.y];
            let mut nearby: Vec<(f64, usize)> = tree
                .locate_within_distance(query, radius_2)
                .map(|ic| (ic.distance_2(&query), ic.draft))
                .collect();
            nearby.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

            let mut target = None;
            let mut contradicts = false;
            for &(_, k) in &nearby {
                let iou = polygon_iou(&drafts[k].footprint, &cand.footprint);
                if iou >= cfg.merge_iou_threshold {
                    target = Some(k);
                    break;
                }
                if iou >= cfg.duplicate_iou_threshold && drafts[k].supports.contains_key(&cand.frame)
                {
                    contradicts = true;
                }
            }

            match target {
                Some(k) => {
                    let draft = &mut drafts[k];
                    match draft.supports.get(&cand.frame) {
                        None => {
                            draft.supports.insert(cand.frame, support_of(&cand));
                            draft.provenance.insert(cand.cluster);
                            stats.merged += 1;
                        }
                        Some(existing) if existing.cluster == cand.cluster => {
                            // Two detections of one image on the same module:
                            // the earlier one has the higher confidence.
                            stats.same_frame_conflicts += 1;
                        }
                        Some(_) => {
                            // Same image seen through an overlapping cluster.
                            draft.provenance.insert(cand.cluster);
                            stats.overlap_duplicates += 1;
                        }
                    }
                }
                None if contradicts => {
                    debug!(
                        "Dropping detection {} of {}: contradicts a module already seen in that frame",
                        cand.detection_index, cand.frame
                    );
                    stats.contradicting += 1;
                }
                None => {
                    let id = drafts.len();
                    tree.insert(IndexedCentroid { draft: id, point: query });
                    let mut supports = BTreeMap::new();
                    supports.insert(cand.frame, support_of(&cand));
                    drafts.push(Draft {
                        footprint: cand.footprint,
                        centroid: cand.centroid,
                        ground_z: cand.ground_z,
                        confidence: cand.confidence,
                        supports,
                        provenance: BTreeSet::from([cand.cluster]),
                    });
                }
            }
        }

        let mut records = Vec::new();
        for draft in drafts {
            if draft.supports.len() < cfg.min_detection_support {
                stats.below_support += 1;
                continue;
            }
            let centroid = Vector3::new(draft.centroid.x, draft.centroid.y, draft.ground_z);
            records.push(ModuleRecord {
                id: ModuleId(records.len() as u32 + 1),
                centroid: [centroid.x, centroid.y, centroid.z],
                polygon: exterior_coords(&draft.footprint)
                    .into_iter()
                    .map(|[x, y]| [x, y, draft.ground_z])
                    .collect(),
                geodetic: plant.to_geodetic(&centroid),
                supports: draft.supports,
                provenance: draft.provenance,
                confidence: draft.confidence,
            });
        }
        stats.records = records.len();

        info!(
            "Merged {} candidates from {} results into {} modules ({} below support, {} overlap duplicates)",
            stats.candidates,
            results.len(),
            stats.records,
            stats.below_support,
            stats.overlap_duplicates
        );
        (records, stats)
    }
}

fn support_of(cand: &Candidate) -> Support {
    Support {
        cluster: cand.cluster,
        confidence: cand.confidence,
        polygon: cand.image_polygon.iter().map(|p| [p.x, p.y]).collect(),
    }
}

fn canonical_order(a: &Candidate, b: &Candidate) -> std::cmp::Ordering {
    b.confidence
        .total_cmp(&a.confidence)
        .then(a.cluster.cmp(&b.cluster))
        .then(a.sequence.cmp(&b.sequence))
        .then(a.detection_index.cmp(&b.detection_index))
}
