//! Per-cluster lifecycle: attempt, validate, escalate, give up.
//!
//! A cluster is reconstructed as one or more segments. The first round has a
//! single segment covering the whole cluster. After each round every
//! non-accepted segment is escalated:
//! - Degraded: tighten feature matching and retry.
//! - Failed (or engine error): re-split at the weakest coverage point when both
//!   halves stay long enough, otherwise tighten.
//!
//! Accepted segments are kept across rounds. The number of retry rounds is
//! bounded by the retry budget, after which the cluster is abandoned.

use std::path::Path;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};
use crate::planning::{Cluster, ClusterId, ClusterStatus};
use crate::reconstruction::{
    Classification, ReconstructionInvoker, ReconstructionParams, ReconstructionResult,
    ReconstructionValidator, ValidationReport,
};
use crate::system::CancellationToken;
use crate::telemetry::{FrameId, TelemetryIndex};

use super::RetryConfig;

/// Outcome of one engine attempt on one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AttemptOutcome {
    Accepted,
    Degraded,
    Failed,
    /// Engine crash, timeout or zero usable poses.
    EngineError,
}

impl From<Classification> for AttemptOutcome {
    fn from(c: Classification) -> Self {
        match c {
            Classification::Accepted => AttemptOutcome::Accepted,
            Classification::Degraded => AttemptOutcome::Degraded,
            Classification::Failed => AttemptOutcome::Failed,
        }
    }
}

/// Report entry for one attempt.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    /// Retry round (0 = first attempt).
    pub round: u32,
    pub first_frame: FrameId,
    pub last_frame: FrameId,
    pub frames: usize,
    pub feature_match_ratio: f64,
    pub max_features: usize,
    pub outcome: AttemptOutcome,
    pub diagnostic: String,
}

/// Terminal result of a cluster lifecycle.
#[derive(Debug, Clone)]
pub struct ClusterOutcome {
    pub cluster: ClusterId,
    pub status: ClusterStatus,
    /// Accepted results, one per segment, in capture order. Empty unless
    /// the cluster was accepted.
    pub results: Vec<ReconstructionResult>,
    pub retries: u32,
    pub attempts: Vec<AttemptRecord>,
    pub last_diagnostic: Option<String>,
}

/// Sub-range of a cluster with its own parameters and state.
#[derive(Debug)]
struct Segment {
    frames: Vec<FrameId>,
    params: ReconstructionParams,
    accepted: Option<ReconstructionResult>,
    /// Latest non-accepted attempt.
    last: Option<SegmentAttempt>,
}

#[derive(Debug)]
struct SegmentAttempt {
    outcome: AttemptOutcome,
    result: Option<ReconstructionResult>,
    report: Option<ValidationReport>,
}

impl Segment {
    fn new(frames: Vec<FrameId>, params: ReconstructionParams) -> Self {
        Self {
            frames,
            params,
            accepted: None,
            last: None,
        }
    }

    fn is_accepted(&self) -> bool {
        self.accepted.is_some()
    }
}

/// Drives one cluster at a time through its lifecycle.
pub struct RetryController<'a> {
    invoker: &'a ReconstructionInvoker,
    validator: &'a ReconstructionValidator,
    index: &'a TelemetryIndex,
    config: &'a RetryConfig,
    base_params: &'a ReconstructionParams,
    artifacts_dir: Option<&'a Path>,
}

impl<'a> RetryController<'a> {
    pub fn new(
        invoker: &'a ReconstructionInvoker,
        validator: &'a ReconstructionValidator,
        index: &'a TelemetryIndex,
        config: &'a RetryConfig,
        base_params: &'a ReconstructionParams,
    ) -> Self {
        Self {
            invoker,
            validator,
            index,
            config,
            base_params,
            artifacts_dir: None,
        }
    }

    /// Keep accepted working areas under `dir`.
    pub fn with_artifacts_dir(mut self, dir: Option<&'a Path>) -> Self {
        self.artifacts_dir = dir;
        self
    }

    /// Run `cluster` to a terminal status.
    ///
    /// Reconstruction problems never surface as errors: they end in
    /// `Abandoned`. Errors are reserved for illegal state transitions.
    pub fn run(&self, cluster: &mut Cluster, cancel: &CancellationToken) -> Result<ClusterOutcome> {
        let id = cluster.id;
        let mut segments = vec![Segment::new(cluster.frames().to_vec(), self.base_params.clone())];
        let mut attempts = Vec::new();
        let mut last_diagnostic = None;
        let mut round: u32 = 0;
        if let Some(dir) = self.artifacts_dir {
            clear_stale_artifacts(&dir.join(id.dir_name()));
        }

        loop {
            if cancel.is_cancelled() {
                return self.abandon(cluster, round, attempts, Some("cancelled".into()));
            }
            cluster.transition(ClusterStatus::Running)?;

            for segment in segments.iter_mut().filter(|s| !s.is_accepted()) {
                match self.attempt(id, segment, round, cancel) {
                    Ok(record) => {
                        last_diagnostic = Some(record.diagnostic.clone());
                        attempts.push(record);
                    }
                    Err(PipelineError::Cancelled) => {
                        return self.abandon(cluster, round, attempts, Some("cancelled".into()));
                    }
                    Err(e) => return Err(e),
                }
            }

            let status = round_status(&segments);
            cluster.transition(status)?;
            if status == ClusterStatus::Accepted {
                info!(
                    "{} accepted after {} retries ({} segment(s))",
                    id,
                    round,
                    segments.len()
                );
                return Ok(self.accept(cluster, segments, round, attempts, last_diagnostic));
            }

            if round >= self.config.retry_budget {
                if status == ClusterStatus::Degraded && self.config.accept_degraded_on_exhaustion {
                    for segment in &mut segments {
                        if segment.accepted.is_none() {
                            segment.accepted = segment.last.take().and_then(|a| a.result);
                        }
                    }
                    cluster.transition(ClusterStatus::Accepted)?;
                    warn!("{} kept degraded after exhausting {} retries", id, round);
                    return Ok(self.accept(cluster, segments, round, attempts, last_diagnostic));
                }
                if status == ClusterStatus::Degraded {
                    cluster.transition(ClusterStatus::Failed)?;
                }
                warn!("{} abandoned after {} retries: {:?}", id, round, last_diagnostic);
                return self.abandon(cluster, round, attempts, last_diagnostic);
            }

            segments = self.escalate(id, segments);
            round += 1;
        }
    }

    /// Invoke and validate one segment. Only cancellation is an error here.
    fn attempt(
        &self,
        cluster: ClusterId,
        segment: &mut Segment,
        round: u32,
        cancel: &CancellationToken,
    ) -> Result<AttemptRecord> {
        let frames = &segment.frames;
        let mut record = AttemptRecord {
            round,
            first_frame: frames.first().copied().unwrap_or(FrameId(0)),
            last_frame: frames.last().copied().unwrap_or(FrameId(0)),
            frames: frames.len(),
            feature_match_ratio: segment.params.feature_match_ratio,
            max_features: segment.params.max_features,
            outcome: AttemptOutcome::EngineError,
            diagnostic: String::new(),
        };

        match self.invoker.invoke(cluster, frames, &segment.params, round, cancel) {
            Ok(invocation) => {
                let report = self.validator.validate(&invocation.result, frames, self.index);
                record.outcome = report.classification.into();
                record.diagnostic = report.diagnostic();
                debug!("{} round {}: {}", cluster, round, record.diagnostic);

                if report.classification == Classification::Accepted {
                    let result = match self.artifacts_dir {
                        Some(dir) => {
                            let dest = dir.join(cluster.dir_name()).join(format!(
                                "{}_{}",
                                record.first_frame.0, record.last_frame.0
                            ));
                            let (result, kept) = invocation.keep_artifacts(&dest);
                            if let Err(e) = kept {
                                warn!("{}: could not keep artifacts: {}", cluster, e);
                            }
                            result
                        }
                        None => invocation.into_result(),
                    };
                    segment.accepted = Some(result);
                    segment.last = None;
                } else {
                    segment.last = Some(SegmentAttempt {
                        outcome: record.outcome,
                        result: Some(invocation.into_result()),
                        report: Some(report),
                    });
                }
            }
            Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
            Err(e) => {
                if e.is_recoverable() {
                    debug!("{} round {}: {}", cluster, round, e);
                } else {
                    warn!("{} round {}: unexpected failure: {}", cluster, round, e);
                }
                record.diagnostic = e.to_string();
                segment.last = Some(SegmentAttempt {
                    outcome: AttemptOutcome::EngineError,
                    result: None,
                    report: None,
                });
            }
        }
        Ok(record)
    }

    /// Build the next round's segments.
    fn escalate(&self, cluster: ClusterId, segments: Vec<Segment>) -> Vec<Segment> {
        let mut next = Vec::with_capacity(segments.len() + 1);
        for mut segment in segments {
            let Some(last) = segment.last.take() else {
                next.push(segment);
                continue;
            };

            if last.outcome != AttemptOutcome::Degraded {
                let split = last
                    .report
                    .as_ref()
                    .and_then(|r| r.weakest_point)
                    .filter(|&at| {
                        at >= self.config.min_split_size
                            && segment.frames.len() - at >= self.config.min_split_size
                    });
                if let Some(at) = split {
                    info!(
                        "{}: re-splitting {} frames at {} (frame {})",
                        cluster,
                        segment.frames.len(),
                        at,
                        segment.frames[at]
                    );
                    let right = segment.frames.split_off(at);
                    next.push(Segment::new(segment.frames, segment.params.clone()));
                    next.push(Segment::new(right, segment.params));
                    continue;
                }
            }

            segment.params = self.tighten(&segment.params);
            debug!(
                "{}: tightened matching to ratio {:.3}, {} features",
                cluster, segment.params.feature_match_ratio, segment.params.max_features
            );
            next.push(segment);
        }
        next
    }

    fn tighten(&self, params: &ReconstructionParams) -> ReconstructionParams {
        ReconstructionParams {
            feature_match_ratio: params.feature_match_ratio * self.config.tighten_factor,
            max_features: (params.max_features as f64 * self.config.feature_growth).round() as usize,
            matching_window: params.matching_window,
        }
    }

    fn accept(
        &self,
        cluster: &Cluster,
        segments: Vec<Segment>,
        retries: u32,
        attempts: Vec<AttemptRecord>,
        last_diagnostic: Option<String>,
    ) -> ClusterOutcome {
        ClusterOutcome {
            cluster: cluster.id,
            status: cluster.status(),
            results: segments.into_iter().filter_map(|s| s.accepted).collect(),
            retries,
            attempts,
            last_diagnostic,
        }
    }

    fn abandon(
        &self,
        cluster: &mut Cluster,
        retries: u32,
        attempts: Vec<AttemptRecord>,
        last_diagnostic: Option<String>,
    ) -> Result<ClusterOutcome> {
        cluster.transition(ClusterStatus::Abandoned)?;
        Ok(ClusterOutcome {
            cluster: cluster.id,
            status: ClusterStatus::Abandoned,
            results: Vec::new(),
            retries,
            attempts,
            last_diagnostic,
        })
    }
}

/// Remove segment directories left by an earlier run of the same cluster.
fn clear_stale_artifacts(dir: &Path) {
    if !dir.exists() {
        return;
    }
    match std::fs::remove_dir_all(dir) {
        Ok(()) => debug!("Removed stale artifacts at {}", dir.display()),
        Err(e) => warn!("Could not remove stale artifacts at {}: {}", dir.display(), e),
    }
}

/// Cluster status after a round: Accepted if every segment is, Failed if
/// any segment failed, Degraded otherwise.
fn round_status(segments: &[Segment]) -> ClusterStatus {
    let mut status = ClusterStatus::Accepted;
    for segment in segments {
        match segment.last.as_ref().map(|a| a.outcome) {
            None => {}
            Some(AttemptOutcome::Degraded) => {
                if status == ClusterStatus::Accepted {
                    status = ClusterStatus::Degraded;
                }
            }
            Some(_) => status = ClusterStatus::Failed,
        }
    }
    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{CameraPose, GeoPoint, LocalFrame};
    use crate::reconstruction::{
        EngineOutput, EnginePose, EngineRequest, StructureFromMotion, ValidationConfig,
    };
    use crate::telemetry::Frame;
    use nalgebra::Vector3;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    const N: usize = 100;

    fn index() -> Arc<TelemetryIndex> {
        let plant = LocalFrame::new(GeoPoint::new(47.0, 8.0, 500.0));
        let frames = (0..N)
            .map(|i| Frame {
                id: FrameId::new(i as u64),
                timestamp_s: i as f64 * 0.5,
                position: plant.to_geodetic(&Vector3::new(i as f64 * 2.0, 0.0, 30.0)),
                sequence: i,
                image: None,
            })
            .collect();
        Arc::new(TelemetryIndex::build(frames).unwrap())
    }

    type Behaviour = dyn Fn(&EngineRequest, usize) -> Option<Vec<bool>> + Send + Sync;

    /// Engine whose localization mask is chosen per call.
    /// Returning None simulates an engine crash.
    struct ScriptedEngine {
        index: Arc<TelemetryIndex>,
        calls: AtomicUsize,
        behaviour: Box<Behaviour>,
        requests: Mutex<Vec<(usize, f64)>>,
    }

    impl ScriptedEngine {
        fn new(
            index: Arc<TelemetryIndex>,
            behaviour: impl Fn(&EngineRequest, usize) -> Option<Vec<bool>> + Send + Sync + 'static,
        ) -> Self {
            Self {
                index,
                calls: AtomicUsize::new(0),
                behaviour: Box::new(behaviour),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    impl StructureFromMotion for ScriptedEngine {
        fn name(&self) -> &str {
            "scripted"
        }

        fn reconstruct(&self, request: &EngineRequest) -> anyhow::Result<EngineOutput> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests
                .lock()
                .unwrap()
                .push((request.images.len(), request.params.feature_match_ratio));
            let Some(mask) = (self.behaviour)(request, call) else {
                anyhow::bail!("segfault in bundle adjustment");
            };
            let reference = request.images[0].position;
            let frame = LocalFrame::new(reference);
            let poses: HashMap<_, _> = request
                .images
                .iter()
                .zip(mask)
                .filter(|(_, keep)| *keep)
                .map(|(img, _)| {
                    let pos = self.index.frame(img.frame).unwrap().position;
                    (
                        img.frame,
                        EnginePose {
                            pose: CameraPose::nadir(frame.to_local(&pos)),
                            num_tracks: 300,
                        },
                    )
                })
                .collect();
            Ok(EngineOutput {
                reference: Some(reference),
                poses,
                points: Vec::new(),
                reprojection_error: 0.6,
            })
        }
    }

    struct Harness {
        index: Arc<TelemetryIndex>,
        engine: Arc<ScriptedEngine>,
        invoker: ReconstructionInvoker,
        validator: ReconstructionValidator,
        root: tempfile::TempDir,
    }

    fn harness(
        behaviour: impl Fn(&EngineRequest, usize) -> Option<Vec<bool>> + Send + Sync + 'static,
    ) -> Harness {
        let index = index();
        let engine = Arc::new(ScriptedEngine::new(index.clone(), behaviour));
        let root = tempfile::tempdir().unwrap();
        let invoker = ReconstructionInvoker::new(
            engine.clone(),
            index.clone(),
            root.path().to_path_buf(),
            Duration::from_secs(10),
            Duration::from_millis(100),
        );
        Harness {
            index,
            engine,
            invoker,
            validator: ReconstructionValidator::new(ValidationConfig::default()),
            root,
        }
    }

    fn cluster() -> Cluster {
        Cluster::new(
            ClusterId::new(3),
            (0..N as u64).map(FrameId::new).collect(),
            0,
            N - 1,
        )
    }

    fn mask(len: usize, localized: impl Fn(usize) -> bool) -> Vec<bool> {
        (0..len).map(localized).collect()
    }

    #[test]
    fn test_first_attempt_accepted() {
        let h = harness(|r, _| Some(vec![true; r.images.len()]));
        let cfg = RetryConfig::default();
        let params = ReconstructionParams::default();
        let ctl = RetryController::new(&h.invoker, &h.validator, &h.index, &cfg, &params);

        let mut c = cluster();
        let out = ctl.run(&mut c, &CancellationToken::new()).unwrap();
        assert_eq!(out.status, ClusterStatus::Accepted);
        assert_eq!(c.status(), ClusterStatus::Accepted);
        assert_eq!(out.retries, 0);
        assert_eq!(out.results.len(), 1);
        assert_eq!(out.attempts.len(), 1);
        // Working areas are gone.
        assert_eq!(std::fs::read_dir(h.root.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_sixty_percent_poses_abandoned_after_budget() {
        // Every attempt localizes only the first 60% of the request.
        let h = harness(|r, _| {
            let n = r.images.len();
            Some(mask(n, |i| i < n * 6 / 10))
        });
        let cfg = RetryConfig {
            retry_budget: 2,
            min_split_size: 1000,
            ..Default::default()
        };
        let params = ReconstructionParams::default();
        let ctl = RetryController::new(&h.invoker, &h.validator, &h.index, &cfg, &params);

        let mut c = cluster();
        let out = ctl.run(&mut c, &CancellationToken::new()).unwrap();
        assert_eq!(out.status, ClusterStatus::Abandoned);
        assert_eq!(c.status(), ClusterStatus::Abandoned);
        assert_eq!(out.retries, 2);
        assert_eq!(out.attempts.len(), 3);
        assert!(out.attempts.iter().all(|a| a.outcome == AttemptOutcome::Failed));
        assert!(out.results.is_empty());
        assert!(out.last_diagnostic.unwrap().contains("below minimum"));

        // Each retry tightened the matching ratio.
        let ratios: Vec<f64> = h.engine.requests.lock().unwrap().iter().map(|r| r.1).collect();
        assert!(ratios.windows(2).all(|w| w[1] < w[0]));
    }

    #[test]
    fn test_failed_cluster_is_resplit_and_segments_kept() {
        // First call: frames 45..70 lost. Later calls: everything localized.
        let h = harness(|r, call| {
            let n = r.images.len();
            if call == 0 {
                Some(mask(n, |i| !(45..70).contains(&i)))
            } else {
                Some(vec![true; n])
            }
        });
        let cfg = RetryConfig::default();
        let params = ReconstructionParams::default();
        let ctl = RetryController::new(&h.invoker, &h.validator, &h.index, &cfg, &params);

        let mut c = cluster();
        let out = ctl.run(&mut c, &CancellationToken::new()).unwrap();
        assert_eq!(out.status, ClusterStatus::Accepted);
        assert_eq!(out.retries, 1);
        assert_eq!(out.results.len(), 2);
        // Split at the middle of the gap.
        let sizes: Vec<usize> = h.engine.requests.lock().unwrap().iter().map(|r| r.0).collect();
        assert_eq!(sizes, vec![100, 57, 43]);
        let total: usize = out.results.iter().map(|r| r.poses.len()).sum();
        assert_eq!(total, N);
    }

    #[test]
    fn test_engine_errors_consume_budget() {
        let h = harness(|_, _| None);
        let cfg = RetryConfig {
            retry_budget: 1,
            ..Default::default()
        };
        let params = ReconstructionParams::default();
        let ctl = RetryController::new(&h.invoker, &h.validator, &h.index, &cfg, &params);

        let mut c = cluster();
        let out = ctl.run(&mut c, &CancellationToken::new()).unwrap();
        assert_eq!(out.status, ClusterStatus::Abandoned);
        assert_eq!(out.retries, 1);
        assert!(out
            .attempts
            .iter()
            .all(|a| a.outcome == AttemptOutcome::EngineError));
        assert!(out.last_diagnostic.unwrap().contains("segfault"));
    }

    #[test]
    fn test_degraded_retry_then_accepted() {
        // 90% localized first (degraded), complete after tightening.
        let h = harness(|r, call| {
            let n = r.images.len();
            if call == 0 {
                Some(mask(n, |i| i % 10 != 0))
            } else {
                Some(vec![true; n])
            }
        });
        let cfg = RetryConfig::default();
        let params = ReconstructionParams::default();
        let ctl = RetryController::new(&h.invoker, &h.validator, &h.index, &cfg, &params);

        let mut c = cluster();
        let out = ctl.run(&mut c, &CancellationToken::new()).unwrap();
        assert_eq!(out.status, ClusterStatus::Accepted);
        assert_eq!(out.attempts[0].outcome, AttemptOutcome::Degraded);
        assert_eq!(out.attempts[1].max_features, 12000);
        assert_eq!(out.results.len(), 1);
    }

    #[test]
    fn test_degraded_kept_on_exhaustion_when_enabled() {
        let h = harness(|r, _| Some(mask(r.images.len(), |i| i % 10 != 0)));
        let cfg = RetryConfig {
            retry_budget: 1,
            accept_degraded_on_exhaustion: true,
            ..Default::default()
        };
        let params = ReconstructionParams::default();
        let ctl = RetryController::new(&h.invoker, &h.validator, &h.index, &cfg, &params);

        let mut c = cluster();
        let out = ctl.run(&mut c, &CancellationToken::new()).unwrap();
        assert_eq!(out.status, ClusterStatus::Accepted);
        assert_eq!(out.results.len(), 1);
        assert_eq!(out.results[0].poses.len(), 90);
    }

    #[test]
    fn test_retry_count_never_exceeds_budget() {
        for budget in 0..4 {
            let h = harness(|_, _| None);
            let cfg = RetryConfig {
                retry_budget: budget,
                ..Default::default()
            };
            let params = ReconstructionParams::default();
            let ctl = RetryController::new(&h.invoker, &h.validator, &h.index, &cfg, &params);
            let mut c = cluster();
            let out = ctl.run(&mut c, &CancellationToken::new()).unwrap();
            assert!(out.retries <= budget);
            assert!(c.status().is_terminal());
            assert!(c.transition(ClusterStatus::Running).is_err());
        }
    }

    #[test]
    fn test_cancelled_before_start() {
        let h = harness(|r, _| Some(vec![true; r.images.len()]));
        let cfg = RetryConfig::default();
        let params = ReconstructionParams::default();
        let ctl = RetryController::new(&h.invoker, &h.validator, &h.index, &cfg, &params);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut c = cluster();
        let out = ctl.run(&mut c, &cancel).unwrap();
        assert_eq!(out.status, ClusterStatus::Abandoned);
        assert_eq!(out.last_diagnostic.as_deref(), Some("cancelled"));
        assert_eq!(h.engine.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_accepted_artifacts_kept() {
        let h = harness(|r, _| Some(vec![true; r.images.len()]));
        let artifacts = tempfile::tempdir().unwrap();
        let cfg = RetryConfig::default();
        let params = ReconstructionParams::default();
        let ctl = RetryController::new(&h.invoker, &h.validator, &h.index, &cfg, &params)
            .with_artifacts_dir(Some(artifacts.path()));

        let mut c = cluster();
        ctl.run(&mut c, &CancellationToken::new()).unwrap();
        assert!(artifacts.path().join("cluster_000003").join("0_99").is_dir());
    }

    #[test]
    fn test_stale_segment_artifacts_cleared() {
        let h = harness(|r, _| Some(vec![true; r.images.len()]));
        let artifacts = tempfile::tempdir().unwrap();
        // An earlier run split this cluster differently.
        let stale = artifacts.path().join("cluster_000003").join("0_49");
        std::fs::create_dir_all(&stale).unwrap();
        let cfg = RetryConfig::default();
        let params = ReconstructionParams::default();
        let ctl = RetryController::new(&h.invoker, &h.validator, &h.index, &cfg, &params)
            .with_artifacts_dir(Some(artifacts.path()));

        let mut c = cluster();
        ctl.run(&mut c, &CancellationToken::new()).unwrap();
        assert!(!stale.exists());
        let kept: Vec<_> = std::fs::read_dir(artifacts.path().join("cluster_000003"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(kept, vec![std::ffi::OsString::from("0_99")]);
    }
}
