//! Reconstruction invoker: runs the engine for one cluster segment.
//!
//! Each call:
//! 1. Acquires an isolated working area
//! 2. Runs the engine on a helper thread, bounded by the invocation timeout
//! 3. Forwards run-level cancellation to the engine while waiting
//! 4. Filters the output to the requested frames and packages the result
//!
//! The working area travels with the returned [`Invocation`] and is released
//! when it is dropped, unless the caller keeps the artifacts.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, RecvTimeoutError};
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};
use crate::planning::ClusterId;
use crate::system::CancellationToken;
use crate::telemetry::{FrameId, TelemetryIndex};

use super::engine::{EngineOutput, EngineRequest, ImageRef, ReconstructionParams, StructureFromMotion};
use super::result::{PointCloudHandle, QualityMetrics, ReconstructionResult};
use super::workspace::ScopedWorkspace;

/// How often the waiting invoker checks run-level cancellation.
const CANCEL_POLL: Duration = Duration::from_millis(100);

/// A finished engine run together with its working area.
#[derive(Debug)]
pub struct Invocation {
    pub result: ReconstructionResult,
    workspace: ScopedWorkspace,
}

impl Invocation {
    pub fn work_dir(&self) -> &Path {
        self.workspace.path()
    }

    /// Move the working area to `dest` and return the result.
    ///
    /// The result is returned even when the move fails.
    pub fn keep_artifacts(self, dest: &Path) -> (ReconstructionResult, Result<PathBuf>) {
        let Invocation { result, workspace } = self;
        (result, workspace.persist(dest))
    }

    /// Release the working area and return the result.
    pub fn into_result(self) -> ReconstructionResult {
        self.result
    }
}

/// Drives the external engine for cluster segments.
pub struct ReconstructionInvoker {
    engine: Arc<dyn StructureFromMotion>,
    index: Arc<TelemetryIndex>,
    workspace_root: PathBuf,
    timeout: Duration,
    /// How long to wait for a cancelled engine before releasing its area.
    cancel_grace: Duration,
    /// Engine threads left running after their grace period.
    detached: AtomicUsize,
}

impl ReconstructionInvoker {
    pub fn new(
        engine: Arc<dyn StructureFromMotion>,
        index: Arc<TelemetryIndex>,
        workspace_root: PathBuf,
        timeout: Duration,
        cancel_grace: Duration,
    ) -> Self {
        Self {
            engine,
            index,
            workspace_root,
            timeout,
            cancel_grace,
            detached: AtomicUsize::new(0),
        }
    }

    /// Number of engine threads that ignored cancellation and were detached.
    pub fn detached_engines(&self) -> usize {
        self.detached.load(Ordering::SeqCst)
    }

    /// Reconstruct `frames` (in capture order) of `cluster`.
    ///
    /// Identical inputs may be re-invoked safely: every call works in a fresh area.
    pub fn invoke(
        &self,
        cluster: ClusterId,
        frames: &[FrameId],
        params: &ReconstructionParams,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> Result<Invocation> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let images = frames
            .iter()
            .map(|id| {
                self.index
                    .frame(*id)
                    .map(ImageRef::from)
                    .ok_or_else(|| PipelineError::ReconstructionEngine {
                        cluster,
                        reason: format!("frame {} is not in the telemetry index", id),
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        let fallback_reference = match images.first() {
            Some(first) => first.position,
            None => return Err(PipelineError::ReconstructionIncomplete { cluster }),
        };

        let workspace = ScopedWorkspace::acquire(
            &self.workspace_root,
            cluster,
            &format!("a{}", attempt),
        )?;

        let invocation_cancel = CancellationToken::new();
        let request = EngineRequest {
            cluster,
            work_dir: workspace.path().to_path_buf(),
            images,
            params: params.clone(),
            cancel: invocation_cancel.clone(),
        };

        let output = self.run_engine(request, &invocation_cancel, cancel)?;

        let result = self.package(cluster, attempt, frames, output, fallback_reference)?;
        debug!(
            "{} attempt {} ({}): {}/{} frames localized, {} points",
            cluster,
            attempt,
            self.engine.name(),
            result.metrics.localized_frames,
            result.metrics.requested_frames,
            result.metrics.num_points
        );
        Ok(Invocation { result, workspace })
    }

    /// Run the engine on a helper thread and wait for it.
    fn run_engine(
        &self,
        request: EngineRequest,
        invocation_cancel: &CancellationToken,
        run_cancel: &CancellationToken,
    ) -> Result<EngineOutput> {
        let cluster = request.cluster;
        let (tx, rx) = bounded(1);
        let engine = Arc::clone(&self.engine);
        let thread_name = format!("sfm-{}", cluster);

        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                let out = engine.reconstruct(&request);
                let _ = tx.send(out);
            })?;

        let deadline = Instant::now() + self.timeout;
        let outcome = loop {
            if run_cancel.is_cancelled() {
                invocation_cancel.cancel();
                self.wait_for_abort(&rx, &thread_name);
                return Err(PipelineError::Cancelled);
            }

            let now = Instant::now();
            if now >= deadline {
                invocation_cancel.cancel();
                self.wait_for_abort(&rx, &thread_name);
                return Err(PipelineError::ReconstructionEngine {
                    cluster,
                    reason: format!("engine timed out after {:?}", self.timeout),
                });
            }

            match rx.recv_timeout(CANCEL_POLL.min(deadline - now)) {
                Ok(out) => break out,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    let _ = handle.join();
                    return Err(PipelineError::ReconstructionEngine {
                        cluster,
                        reason: "engine thread panicked".into(),
                    });
                }
            }
        };

        let _ = handle.join();
        outcome.map_err(|e| PipelineError::ReconstructionEngine {
            cluster,
            reason: format!("{:#}", e),
        })
    }

    /// Give a cancelled engine a bounded chance to stop before its working
    /// area is released. An engine that misses the grace period keeps its
    /// thread but loses its area, and is counted as detached.
    fn wait_for_abort<T>(&self, rx: &crossbeam_channel::Receiver<T>, thread_name: &str) {
        match rx.recv_timeout(self.cancel_grace) {
            Ok(_) | Err(RecvTimeoutError::Disconnected) => {}
            Err(RecvTimeoutError::Timeout) => {
                let detached = self.detached.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(
                    "Engine thread {} did not stop within {:?} of cancellation, detaching it ({} detached so far)",
                    thread_name, self.cancel_grace, detached
                );
            }
        }
    }

    fn package(
        &self,
        cluster: ClusterId,
        attempt: u32,
        frames: &[FrameId],
        output: EngineOutput,
        fallback_reference: crate::geometry::GeoPoint,
    ) -> Result<ReconstructionResult> {
        let mut poses = BTreeMap::new();
        let mut track_counts = BTreeMap::new();
        for id in frames {
            if let Some(p) = output.poses.get(id) {
                poses.insert(*id, p.pose);
                track_counts.insert(*id, p.num_tracks);
            }
        }

        let dropped = output.poses.len() - poses.len();
        if dropped > 0 {
            debug!("{}: ignoring {} poses for frames outside the request", cluster, dropped);
        }
        if poses.is_empty() {
            return Err(PipelineError::ReconstructionIncomplete { cluster });
        }

        let metrics = QualityMetrics {
            requested_frames: frames.len(),
            localized_frames: poses.len(),
            reprojection_error: output.reprojection_error,
            num_points: output.points.len(),
        };

        Ok(ReconstructionResult {
            cluster,
            attempt,
            reference: output.reference.unwrap_or(fallback_reference),
            poses,
            track_counts,
            point_cloud: PointCloudHandle::new(output.points),
            metrics,
        })
    }
}
