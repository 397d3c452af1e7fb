//! Cluster planner: partitions the capture into overlapping clusters.
//!
//! The capture is first cut into continuous segments at every discontinuity.
//! Each segment is then tiled by windows of at most `max_cluster_size` frames,
//! each window starting `overlap_size` frames before the previous one ended.
//! Overlap never crosses a discontinuity.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};
use crate::telemetry::{DiscontinuityMarker, Frame};

use super::cluster::{Cluster, ClusterId};

/// Planning settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanningConfig {
    /// Hard cap on frames per cluster, overlap included.
    pub max_cluster_size: usize,
    /// Frames shared by consecutive clusters of one continuous segment.
    pub overlap_size: usize,
}

impl Default for PlanningConfig {
    fn default() -> Self {
        Self {
            max_cluster_size: 2000,
            overlap_size: 50,
        }
    }
}

impl PlanningConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_cluster_size == 0 {
            return Err(PipelineError::Planning(
                "max_cluster_size must be at least 1".into(),
            ));
        }
        if self.overlap_size >= self.max_cluster_size {
            return Err(PipelineError::Planning(format!(
                "overlap_size ({}) must be smaller than max_cluster_size ({})",
                self.overlap_size, self.max_cluster_size
            )));
        }
        Ok(())
    }
}

/// Partition `frames` into clusters.
///
/// Invariants of the output:
/// - every frame appears in at least one cluster;
/// - `1 <= cluster.len() <= max_cluster_size`;
/// - consecutive clusters inside one segment share exactly `overlap_size`
///   frames, clusters on either side of a discontinuity share none.
pub fn plan_clusters<I>(
    frames: &[Frame],
    discontinuities: I,
    max_cluster_size: usize,
    overlap_size: usize,
) -> Result<Vec<Cluster>>
where
    I: IntoIterator<Item = DiscontinuityMarker>,
{
    PlanningConfig {
        max_cluster_size,
        overlap_size,
    }
    .validate()?;

    if frames.is_empty() {
        return Ok(Vec::new());
    }

    let positions: HashMap<_, _> = frames.iter().enumerate().map(|(i, f)| (f.id, i)).collect();

    // Positions where a new continuous segment starts.
    let mut cuts = BTreeSet::new();
    for marker in discontinuities {
        match positions.get(&marker.after) {
            Some(&pos) if pos > 0 && frames[pos - 1].id == marker.before => {
                cuts.insert(pos);
            }
            _ => warn!(
                "Ignoring discontinuity {} -> {}: frames are not adjacent in this capture",
                marker.before, marker.after
            ),
        }
    }

    let mut bounds = Vec::with_capacity(cuts.len() + 1);
    let mut start = 0;
    for &cut in &cuts {
        bounds.push((start, cut));
        start = cut;
    }
    bounds.push((start, frames.len()));

    let mut clusters: Vec<Cluster> = Vec::new();
    for (seg_start, seg_end) in bounds {
        let mut start = seg_start;
        let mut predecessor: Option<usize> = None;

        loop {
            let end = (start + max_cluster_size).min(seg_end);
            let window = &frames[start..end];
            let id = ClusterId::new(clusters.len() as u32);

            let mut cluster = Cluster::new(
                id,
                window.iter().map(|f| f.id).collect(),
                window[0].sequence,
                window[window.len() - 1].sequence,
            );
            if let Some(prev) = predecessor {
                cluster.predecessor = Some(clusters[prev].id);
                cluster.overlap_with_predecessor = overlap_size;
                clusters[prev].successor = Some(id);
            }

            debug!(
                "Planned {} with {} frames (sequence {}..={})",
                id,
                cluster.len(),
                cluster.first_sequence,
                cluster.last_sequence
            );

            predecessor = Some(clusters.len());
            clusters.push(cluster);

            if end == seg_end {
                break;
            }
            start = end - overlap_size;
        }
    }

    info!(
        "Planned {} clusters over {} frames ({} discontinuities)",
        clusters.len(),
        frames.len(),
        cuts.len()
    );
    Ok(clusters)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::GeoPoint;
    use crate::telemetry::{DiscontinuityKind, FrameId};

    fn frames(n: usize) -> Vec<Frame> {
        (0..n)
            .map(|i| Frame {
                id: FrameId::new(i as u64),
                timestamp_s: i as f64 * 0.1,
                position: GeoPoint::new(47.0, 8.0, 450.0),
                sequence: i,
                image: None,
            })
            .collect()
    }

    fn marker_before(frames: &[Frame], pos: usize) -> DiscontinuityMarker {
        DiscontinuityMarker {
            before: frames[pos - 1].id,
            after: frames[pos].id,
            after_sequence: frames[pos].sequence,
            time_gap_s: 120.0,
            jump_m: 0.0,
            kind: DiscontinuityKind::Temporal,
        }
    }

    fn shared(a: &Cluster, b: &Cluster) -> usize {
        a.frames().iter().filter(|f| b.frames().contains(f)).count()
    }

    #[test]
    fn test_overlap_must_be_smaller_than_cap() {
        let f = frames(10);
        assert!(matches!(
            plan_clusters(&f, Vec::new(), 5, 5),
            Err(PipelineError::Planning(_))
        ));
        assert!(plan_clusters(&f, Vec::new(), 0, 0).is_err());
    }

    #[test]
    fn test_short_sequence_single_cluster() {
        let f = frames(300);
        let clusters = plan_clusters(&f, Vec::new(), 2000, 50).unwrap();
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].len(), 300);
        assert!(clusters[0].predecessor.is_none());
    }

    #[test]
    fn test_empty_capture() {
        assert!(plan_clusters(&[], Vec::new(), 10, 2).unwrap().is_empty());
    }

    #[test]
    fn test_scenario_long_capture_without_breaks() {
        let f = frames(4500);
        let clusters = plan_clusters(&f, Vec::new(), 2000, 50).unwrap();

        assert_eq!(clusters.len(), 3);
        let sizes: Vec<_> = clusters.iter().map(|c| c.len()).collect();
        assert_eq!(sizes, vec![2000, 2000, 550 + 50]);
        assert_eq!(shared(&clusters[0], &clusters[1]), 50);
        assert_eq!(shared(&clusters[1], &clusters[2]), 50);
        assert_eq!(clusters[1].overlap_with_predecessor, 50);
        assert_eq!(clusters[0].successor, Some(clusters[1].id));
        assert_eq!(clusters[2].predecessor, Some(clusters[1].id));
        assert_eq!(clusters[2].last_sequence, 4499);
    }

    #[test]
    fn test_scenario_discontinuity_forces_split() {
        let f = frames(3000);
        let clusters = plan_clusters(&f, vec![marker_before(&f, 1200)], 2000, 50).unwrap();

        assert_eq!(clusters.len(), 2);
        assert_eq!(
            (clusters[0].first_sequence, clusters[0].last_sequence),
            (0, 1199)
        );
        assert_eq!(
            (clusters[1].first_sequence, clusters[1].last_sequence),
            (1200, 2999)
        );
        assert_eq!(shared(&clusters[0], &clusters[1]), 0);
        assert!(clusters[1].predecessor.is_none());
        assert_eq!(clusters[1].overlap_with_predecessor, 0);
    }

    #[test]
    fn test_foreign_marker_ignored() {
        let f = frames(20);
        let bogus = DiscontinuityMarker {
            before: FrameId::new(3),
            after: FrameId::new(9),
            after_sequence: 9,
            time_gap_s: 60.0,
            jump_m: 0.0,
            kind: DiscontinuityKind::Temporal,
        };
        let clusters = plan_clusters(&f, vec![bogus], 100, 5).unwrap();
        assert_eq!(clusters.len(), 1);
    }

    #[test]
    fn test_plan_properties_over_many_shapes() {
        for n in [1usize, 2, 7, 49, 50, 51, 99, 100, 101, 1234] {
            for (cap, overlap) in [(10usize, 0usize), (10, 3), (10, 9), (50, 10), (1, 0)] {
                let f = frames(n);
                let cuts: Vec<_> = [n / 3, n / 2]
                    .iter()
                    .copied()
                    .filter(|&p| p > 0 && p < n)
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .map(|p| marker_before(&f, p))
                    .collect();
                let cut_positions: BTreeSet<_> =
                    cuts.iter().map(|m| m.after_sequence).collect();
                let clusters = plan_clusters(&f, cuts, cap, overlap).unwrap();

                // coverage
                let mut covered = vec![false; n];
                for c in &clusters {
                    assert!(c.len() >= 1 && c.len() <= cap, "size bound n={n} cap={cap}");
                    for id in c.frames() {
                        covered[id.0 as usize] = true;
                    }
                }
                assert!(covered.iter().all(|&c| c), "coverage n={n} cap={cap}");

                // overlap
                for pair in clusters.windows(2) {
                    let expected = if cut_positions.contains(&pair[1].first_sequence) {
                        0
                    } else {
                        overlap
                    };
                    assert_eq!(shared(&pair[0], &pair[1]), expected, "overlap n={n} cap={cap}");
                }
            }
        }
    }
}
