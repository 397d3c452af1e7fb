//! State of one plant run, shared by the orchestrator and its workers.
//!
//! The `RunContext` is created explicitly at the start of a run and consumed
//! by [`RunContext::finish`], which produces the plant model. It owns the
//! run's scratch workspace; dropping the context (on success, error or
//! cancellation) removes it.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::config::RunConfig;
use crate::error::Result;
use crate::geometry::GeoPoint;
use crate::merging::{MergeStats, ModuleRecord};
use crate::planning::Cluster;
use crate::retry::ClusterOutcome;

use super::cancellation::CancellationToken;
use super::report::{AcceptedCluster, ClusterReport, PlantModel, RunReport};

/// Shared state of a plant run.
pub struct RunContext {
    config: RunConfig,
    cancel: CancellationToken,
    /// Failure/progress report. Entries are keyed by cluster id and written
    /// only by the worker that owns the cluster.
    report: Mutex<RunReport>,
    /// Clusters that reached a terminal status.
    clusters_done: AtomicUsize,
    workspace: TempDir,
    started: Instant,
}

impl RunContext {
    /// Start a run: create its scratch workspace.
    pub fn begin(config: RunConfig, cancel: CancellationToken) -> Result<Self> {
        let builder = {
            let mut b = tempfile::Builder::new();
            b.prefix("pv-mapper-run-");
            b
        };
        let workspace = match &config.reconstruction.workspace_root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };
        info!(
            "Run for plant '{}' started, workspace {}",
            config.plant.name,
            workspace.path().display()
        );
        Ok(Self {
            config,
            cancel,
            report: Mutex::new(RunReport::default()),
            clusters_done: AtomicUsize::new(0),
            workspace,
            started: Instant::now(),
        })
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Parent directory of every invocation's working area.
    pub fn workspace_root(&self) -> &Path {
        self.workspace.path()
    }

    pub fn clusters_done(&self) -> usize {
        self.clusters_done.load(Ordering::SeqCst)
    }

    /// Record ingestion figures.
    pub fn record_telemetry(&self, frames: usize, interpolated: usize, discontinuities: usize) {
        let mut report = self.report.lock();
        report.counters.frames = frames;
        report.counters.interpolated_frames = interpolated;
        report.counters.discontinuities = discontinuities;
    }

    /// Record engine runs left behind after cancellation or timeout.
    pub fn record_detached_engines(&self, count: usize) {
        if count > 0 {
            warn!("{} engine run(s) ignored cancellation and were detached", count);
        }
        self.report.lock().counters.detached_engines = count;
    }

    /// Create one report entry per planned cluster.
    pub fn record_plan(&self, clusters: &[Cluster]) {
        let mut report = self.report.lock();
        for cluster in clusters {
            report
                .clusters
                .insert(cluster.id, ClusterReport::planned(cluster));
        }
    }

    /// Update the entry of a cluster that reached a terminal status.
    pub fn record_outcome(&self, cluster: &Cluster, outcome: &ClusterOutcome) {
        {
            let mut report = self.report.lock();
            report
                .clusters
                .entry(cluster.id)
                .or_insert_with(|| ClusterReport::planned(cluster))
                .update(cluster, outcome);
        }
        let done = self.clusters_done.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("{} finished as {:?} ({} done)", cluster.id, cluster.status(), done);
    }

    /// Tear the run down into its plant model.
    ///
    /// Consumes the context, so a run is finalized exactly once.
    pub fn finish(
        self,
        reference: Option<GeoPoint>,
        clusters: Vec<AcceptedCluster>,
        modules: Vec<ModuleRecord>,
        merge: MergeStats,
    ) -> Result<PlantModel> {
        let RunContext {
            config,
            report,
            workspace,
            started,
            ..
        } = self;

        let mut report = report.into_inner();
        report.merge = merge;
        report.counters.modules = modules.len();
        report.counters.elapsed_s = started.elapsed().as_secs_f64();
        report.summarize();

        workspace.close()?;
        info!(
            "Run finished: {} clusters ({} accepted, {} abandoned), {} modules in {:.1}s",
            report.counters.clusters,
            report.counters.accepted,
            report.counters.abandoned,
            report.counters.modules,
            report.counters.elapsed_s
        );

        Ok(PlantModel {
            plant: config.plant.name,
            reference,
            clusters,
            modules,
            report,
        })
    }
}
