//! Plant runner: the top-level entry point of a mapping run.
//!
//! Sequences the pipeline over one plant capture:
//! 1. Telemetry index and discontinuities (fatal on malformed input)
//! 2. Cluster plan (fatal on inconsistent settings)
//! 3. Per-cluster reconstruction lifecycles on the worker pool
//! 4. Segmentation of the accepted frames and registry merge
//!
//! Only steps 1 and 2 can abort a run. Cluster failures end up in the report.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::RunConfig;
use crate::error::{PipelineError, Result};
use crate::merging::{DetectionSet, MergeStats, ModuleSegmenter, RegistryMerger};
use crate::planning::{plan_clusters, ClusterStatus};
use crate::reconstruction::{
    ReconstructionInvoker, ReconstructionResult, ReconstructionValidator, StructureFromMotion,
};
use crate::retry::RetryController;
use crate::telemetry::{interpolate_repeated_fixes, Frame, TelemetryIndex};

use super::cancellation::CancellationToken;
use super::messages::{ClusterDone, ClusterJob};
use super::report::{AcceptedCluster, PlantModel};
use super::run_context::RunContext;
use super::worker_pool::run_cluster_jobs;

/// Owns the collaborators and configuration of plant runs.
pub struct PlantRunner {
    config: RunConfig,
    engine: Arc<dyn StructureFromMotion>,
    segmenter: Arc<dyn ModuleSegmenter>,
}

impl PlantRunner {
    pub fn new(
        config: RunConfig,
        engine: Arc<dyn StructureFromMotion>,
        segmenter: Arc<dyn ModuleSegmenter>,
    ) -> Self {
        Self {
            config,
            engine,
            segmenter,
        }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Map one plant capture.
    ///
    /// `frames` must be in capture order. Returns `Cancelled` if `cancel` is
    /// set before the run completes; every worker has joined and every
    /// working area is released by then.
    pub fn run(&self, mut frames: Vec<Frame>, cancel: CancellationToken) -> Result<PlantModel> {
        self.config.validate()?;
        let cfg = &self.config;

        // Telemetry and planning: structural, abort before any reconstruction.
        let interpolated = if cfg.telemetry.interpolate_gps {
            interpolate_repeated_fixes(
                &mut frames,
                cfg.telemetry.max_time_gap_s,
                cfg.telemetry.max_spatial_jump_m,
            )
        } else {
            0
        };
        let index = Arc::new(TelemetryIndex::build(frames)?);
        let discontinuities: Vec<_> = index
            .find_discontinuities(cfg.telemetry.max_time_gap_s, cfg.telemetry.max_spatial_jump_m)
            .collect();
        for marker in &discontinuities {
            info!(
                "Discontinuity {:?} between {} and {} ({:.1}s, {:.1}m)",
                marker.kind, marker.before, marker.after, marker.time_gap_s, marker.jump_m
            );
        }
        let clusters = plan_clusters(
            index.frames(),
            discontinuities.iter().cloned(),
            cfg.planning.max_cluster_size,
            cfg.planning.overlap_size,
        )?;
        info!(
            "Planned {} clusters over {} frames ({} discontinuities)",
            clusters.len(),
            index.len(),
            discontinuities.len()
        );

        let ctx = RunContext::begin(cfg.clone(), cancel)?;
        ctx.record_telemetry(index.len(), interpolated, discontinuities.len());
        ctx.record_plan(&clusters);

        // Reconstruction lifecycles.
        let invoker = ReconstructionInvoker::new(
            Arc::clone(&self.engine),
            Arc::clone(&index),
            ctx.workspace_root().to_path_buf(),
            cfg.reconstruction.timeout(),
            cfg.reconstruction.cancel_grace(),
        );
        let validator = ReconstructionValidator::new(cfg.validation.clone());
        let controller = RetryController::new(
            &invoker,
            &validator,
            &index,
            &cfg.reconstruction.retry,
            &cfg.reconstruction.params,
        )
        .with_artifacts_dir(cfg.reconstruction.artifacts_dir.as_deref());

        let jobs = clusters.into_iter().map(|cluster| ClusterJob { cluster }).collect();
        let mut done = run_cluster_jobs(cfg.reconstruction.worker_count(), jobs, |job| {
            let mut cluster = job.cluster;
            let outcome = controller.run(&mut cluster, ctx.cancel_token());
            if let Ok(outcome) = &outcome {
                ctx.record_outcome(&cluster, outcome);
            }
            ClusterDone { cluster, outcome }
        })?;
        ctx.record_detached_engines(invoker.detached_engines());

        if ctx.is_cancelled() {
            let interrupted = done
                .iter()
                .filter(|d| {
                    matches!(&d.outcome, Ok(o) if o.last_diagnostic.as_deref() == Some("cancelled"))
                })
                .count();
            warn!(
                "Run cancelled: {} of {} clusters did not finish",
                interrupted,
                ctx.clusters_done()
            );
            return Err(PipelineError::Cancelled);
        }

        done.sort_by_key(|d| d.cluster.id);
        let mut accepted = Vec::new();
        let mut results: Vec<ReconstructionResult> = Vec::new();
        for d in done {
            let outcome = d.outcome?;
            if d.cluster.status() != ClusterStatus::Accepted {
                continue;
            }
            accepted.push(AcceptedCluster {
                cluster: d.cluster.id,
                first_frame: d.cluster.first_frame(),
                last_frame: d.cluster.last_frame(),
                segments: outcome.results.len(),
                localized_frames: outcome.results.iter().map(|r| r.poses.len()).sum(),
                references: outcome.results.iter().map(|r| r.reference).collect(),
            });
            results.extend(outcome.results);
        }

        // Registry merge.
        let detections = self.detect_modules(&index, &results, &ctx)?;
        let (modules, stats) = match index.plant_frame() {
            Some(plant) => RegistryMerger::new(cfg.merging.clone()).merge(
                &results,
                &detections,
                &index,
                plant,
            ),
            None => (Vec::new(), MergeStats::default()),
        };

        ctx.finish(index.plant_reference(), accepted, modules, stats)
    }

    /// Run the segmenter once on every frame some accepted result localized.
    fn detect_modules(
        &self,
        index: &TelemetryIndex,
        results: &[ReconstructionResult],
        ctx: &RunContext,
    ) -> Result<DetectionSet> {
        let localized: BTreeSet<_> = results
            .iter()
            .flat_map(|r| r.poses.keys().copied())
            .collect();

        let mut detections = DetectionSet::new();
        let mut failures = 0;
        for id in localized {
            if ctx.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            let Some(frame) = index.frame(id) else {
                continue;
            };
            match self.segmenter.detect(frame) {
                Ok(list) if !list.is_empty() => {
                    detections.insert(id, list);
                }
                Ok(_) => {}
                Err(e) => {
                    failures += 1;
                    let err = PipelineError::Segmentation(format!("{}: {:#}", id, e));
                    warn!("{}; frame treated as empty", err);
                }
            }
        }
        info!(
            "Segmented {} frames with detections ({} failures)",
            detections.len(),
            failures
        );
        Ok(detections)
    }
}
