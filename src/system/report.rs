//! Run report and the final plant model.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::geometry::GeoPoint;
use crate::merging::{MergeStats, ModuleRecord};
use crate::planning::{Cluster, ClusterId, ClusterStatus};
use crate::retry::{AttemptRecord, ClusterOutcome};
use crate::telemetry::FrameId;

/// Report entry of one cluster. Written only by the worker owning it.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterReport {
    pub cluster: ClusterId,
    pub status: ClusterStatus,
    pub first_frame: Option<FrameId>,
    pub last_frame: Option<FrameId>,
    pub first_sequence: usize,
    pub last_sequence: usize,
    pub frames: usize,
    pub retries: u32,
    pub attempts: Vec<AttemptRecord>,
    pub last_diagnostic: Option<String>,
}

impl ClusterReport {
    pub fn planned(cluster: &Cluster) -> Self {
        Self {
            cluster: cluster.id,
            status: cluster.status(),
            first_frame: cluster.first_frame(),
            last_frame: cluster.last_frame(),
            first_sequence: cluster.first_sequence,
            last_sequence: cluster.last_sequence,
            frames: cluster.len(),
            retries: 0,
            attempts: Vec::new(),
            last_diagnostic: None,
        }
    }

    pub fn update(&mut self, cluster: &Cluster, outcome: &ClusterOutcome) {
        self.status = cluster.status();
        self.retries = outcome.retries;
        self.attempts = outcome.attempts.clone();
        self.last_diagnostic = outcome.last_diagnostic.clone();
    }
}

/// An abandoned cluster, for manual re-capture or re-tuning.
#[derive(Debug, Clone, Serialize)]
pub struct AbandonedCluster {
    pub cluster: ClusterId,
    pub first_frame: Option<FrameId>,
    pub last_frame: Option<FrameId>,
    pub retries: u32,
    pub last_diagnostic: Option<String>,
}

/// Sequence range with no accepted reconstruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoverageGap {
    pub first_sequence: usize,
    pub last_sequence: usize,
    pub frames: usize,
    /// Abandoned clusters that should have covered the range.
    pub clusters: Vec<ClusterId>,
}

/// Run-wide counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunCounters {
    pub frames: usize,
    pub interpolated_frames: usize,
    pub discontinuities: usize,
    pub clusters: usize,
    pub accepted: usize,
    pub abandoned: usize,
    pub attempts: usize,
    pub retries: usize,
    /// Engine runs that ignored cancellation and were left running.
    pub detached_engines: usize,
    pub modules: usize,
    pub elapsed_s: f64,
}

/// Failure and progress report of a run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub clusters: BTreeMap<ClusterId, ClusterReport>,
    pub abandoned: Vec<AbandonedCluster>,
    pub coverage_gaps: Vec<CoverageGap>,
    pub counters: RunCounters,
    pub merge: MergeStats,
}

impl RunReport {
    /// Fill the abandoned list and coverage gaps from the cluster entries.
    ///
    /// A gap is a maximal sequence range covered by abandoned clusters and by
    /// no accepted one.
    pub fn summarize(&mut self) {
        self.abandoned = self
            .clusters
            .values()
            .filter(|c| c.status == ClusterStatus::Abandoned)
            .map(|c| AbandonedCluster {
                cluster: c.cluster,
                first_frame: c.first_frame,
                last_frame: c.last_frame,
                retries: c.retries,
                last_diagnostic: c.last_diagnostic.clone(),
            })
            .collect();

        let accepted: Vec<(usize, usize)> = self
            .clusters
            .values()
            .filter(|c| c.status == ClusterStatus::Accepted)
            .map(|c| (c.first_sequence, c.last_sequence))
            .collect();

        let mut gaps: Vec<CoverageGap> = Vec::new();
        for c in self.clusters.values().filter(|c| c.status == ClusterStatus::Abandoned) {
            let mut seq = c.first_sequence;
            while seq <= c.last_sequence {
                // Skip ranges an accepted cluster covers.
                if let Some(&(_, end)) = accepted.iter().find(|(s, e)| *s <= seq && seq <= *e) {
                    seq = end + 1;
                    continue;
                }
                let next_covered = accepted
                    .iter()
                    .filter(|(s, _)| *s > seq && *s <= c.last_sequence)
                    .map(|(s, _)| *s)
                    .min();
                let end = next_covered.map_or(c.last_sequence, |s| s - 1);
                push_gap(&mut gaps, seq, end, c.cluster);
                seq = end + 1;
            }
        }
        self.coverage_gaps = gaps;

        self.counters.clusters = self.clusters.len();
        self.counters.accepted = accepted.len();
        self.counters.abandoned = self.abandoned.len();
        self.counters.retries = self.clusters.values().map(|c| c.retries as usize).sum();
        self.counters.attempts = self.clusters.values().map(|c| c.attempts.len()).sum();
    }
}

/// Append a gap, joining it with the previous one when they touch.
fn push_gap(gaps: &mut Vec<CoverageGap>, first: usize, last: usize, cluster: ClusterId) {
    if let Some(prev) = gaps.last_mut() {
        if first <= prev.last_sequence + 1 {
            prev.last_sequence = prev.last_sequence.max(last);
            prev.frames = prev.last_sequence - prev.first_sequence + 1;
            if !prev.clusters.contains(&cluster) {
                prev.clusters.push(cluster);
            }
            return;
        }
    }
    gaps.push(CoverageGap {
        first_sequence: first,
        last_sequence: last,
        frames: last - first + 1,
        clusters: vec![cluster],
    });
}

/// Accepted cluster as listed in the plant model.
#[derive(Debug, Clone, Serialize)]
pub struct AcceptedCluster {
    pub cluster: ClusterId,
    pub first_frame: Option<FrameId>,
    pub last_frame: Option<FrameId>,
    pub segments: usize,
    pub localized_frames: usize,
    /// Geodetic reference of each segment's reconstruction.
    pub references: Vec<GeoPoint>,
}

/// Final output of a run. Produced once, by consuming the run context.
#[derive(Debug, Clone, Serialize)]
pub struct PlantModel {
    pub plant: String,
    /// Origin of the plant frame (ENU at the first frame).
    pub reference: Option<GeoPoint>,
    pub clusters: Vec<AcceptedCluster>,
    pub modules: Vec<ModuleRecord>,
    pub report: RunReport,
}
