//! Reconstruction quality checks.
//!
//! Scores a result against the frames that were requested and classifies it.
//! Pure function of its inputs: the same result always yields the same report.

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::geometry::LocalFrame;
use crate::telemetry::{FrameId, TelemetryIndex};

use super::result::ReconstructionResult;

/// Validator thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Below this localized fraction the reconstruction is unusable.
    pub min_pose_fraction: f64,
    /// Below this localized fraction the reconstruction is degraded.
    pub full_pose_fraction: f64,
    /// Longest tolerated run of unlocalized frames.
    pub max_gap_frames: usize,
    /// Mean reprojection error (px) above which the result is degraded.
    pub residual_warn_threshold: f64,
    /// Fraction of reversed steps above which the trajectory is rejected.
    pub max_order_violation_fraction: f64,
    /// Steps shorter than this (m) are ignored by the order check.
    pub order_tolerance_m: f64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            min_pose_fraction: 0.8,
            full_pose_fraction: 0.95,
            max_gap_frames: 5,
            residual_warn_threshold: 2.0,
            max_order_violation_fraction: 0.1,
            order_tolerance_m: 0.5,
        }
    }
}

impl ValidationConfig {
    pub fn validate(&self) -> Result<()> {
        let fraction = |v: f64| (0.0..=1.0).contains(&v);
        if !fraction(self.min_pose_fraction) || !fraction(self.full_pose_fraction) {
            return Err(PipelineError::Config(
                "pose fractions must lie in [0, 1]".into(),
            ));
        }
        if self.min_pose_fraction > self.full_pose_fraction {
            return Err(PipelineError::Config(format!(
                "min_pose_fraction ({}) exceeds full_pose_fraction ({})",
                self.min_pose_fraction, self.full_pose_fraction
            )));
        }
        if !fraction(self.max_order_violation_fraction) {
            return Err(PipelineError::Config(
                "max_order_violation_fraction must lie in [0, 1]".into(),
            ));
        }
        if !(self.residual_warn_threshold > 0.0) || !(self.order_tolerance_m >= 0.0) {
            return Err(PipelineError::Config(
                "residual and order thresholds must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Validator verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Classification {
    Accepted,
    Degraded,
    Failed,
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Classification::Accepted => "accepted",
            Classification::Degraded => "degraded",
            Classification::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Diagnostic report of one validation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationReport {
    pub classification: Classification,
    pub requested_frames: usize,
    pub localized_frames: usize,
    pub pose_fraction: f64,
    /// Longest run of consecutive unlocalized frames.
    pub longest_gap: usize,
    pub reprojection_error: f64,
    /// Consecutive localized pairs long enough to be order-checked.
    pub order_checked: usize,
    pub order_violations: usize,
    /// Position (within the requested frames) where a re-split helps most.
    pub weakest_point: Option<usize>,
    pub reasons: Vec<String>,
}

impl ValidationReport {
    /// One-line summary for logs and the run report.
    pub fn diagnostic(&self) -> String {
        let mut s = format!(
            "{}: {}/{} frames localized ({:.1}%), gap {}, reproj {:.2}px, order {}/{}",
            self.classification,
            self.localized_frames,
            self.requested_frames,
            self.pose_fraction * 100.0,
            self.longest_gap,
            self.reprojection_error,
            self.order_violations,
            self.order_checked
        );
        if !self.reasons.is_empty() {
            s.push_str(" [");
            s.push_str(&self.reasons.join("; "));
            s.push(']');
        }
        s
    }
}

/// Classifies reconstructions.
#[derive(Debug, Clone, Default)]
pub struct ReconstructionValidator {
    config: ValidationConfig,
}

impl ReconstructionValidator {
    pub fn new(config: ValidationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ValidationConfig {
        &self.config
    }

    /// Validate `result` against the requested `frames` (capture order).
    pub fn validate(
        &self,
        result: &ReconstructionResult,
        frames: &[FrameId],
        index: &TelemetryIndex,
    ) -> ValidationReport {
        let cfg = &self.config;
        let requested = frames.len();
        let localized = frames.iter().filter(|f| result.is_localized(**f)).count();
        let pose_fraction = if requested == 0 {
            0.0
        } else {
            localized as f64 / requested as f64
        };

        let (gap_start, longest_gap) = longest_unlocalized_run(result, frames);
        let (order_checked, order_violations) = self.order_check(result, frames, index);
        let reprojection_error = result.metrics.reprojection_error;

        let mut reasons = Vec::new();
        let mut failed = false;
        let mut degraded = false;

        if pose_fraction < cfg.min_pose_fraction {
            failed = true;
            reasons.push(format!(
                "pose fraction {:.3} below minimum {:.3}",
                pose_fraction, cfg.min_pose_fraction
            ));
        }
        if order_checked > 0 {
            let violation_fraction = order_violations as f64 / order_checked as f64;
            if violation_fraction > cfg.max_order_violation_fraction {
                failed = true;
                reasons.push(format!(
                    "trajectory contradicts capture order in {} of {} steps",
                    order_violations, order_checked
                ));
            }
        }
        if !failed {
            if pose_fraction < cfg.full_pose_fraction {
                degraded = true;
                reasons.push(format!("pose fraction {:.3} incomplete", pose_fraction));
            }
            if longest_gap > cfg.max_gap_frames {
                degraded = true;
                reasons.push(format!("coverage gap of {} frames", longest_gap));
            }
            if reprojection_error > cfg.residual_warn_threshold {
                degraded = true;
                reasons.push(format!(
                    "reprojection error {:.2}px above {:.2}px",
                    reprojection_error, cfg.residual_warn_threshold
                ));
            }
        }

        let classification = if failed {
            Classification::Failed
        } else if degraded {
            Classification::Degraded
        } else {
            Classification::Accepted
        };

        let weakest_point = if longest_gap > 0 {
            Some(gap_start + longest_gap / 2)
        } else {
            fewest_tracks(result, frames)
        };

        ValidationReport {
            classification,
            requested_frames: requested,
            localized_frames: localized,
            pose_fraction,
            longest_gap,
            reprojection_error,
            order_checked,
            order_violations,
            weakest_point,
            reasons,
        }
    }

    /// Compare reconstructed and GPS displacement directions between
    /// consecutive localized frames. Returns (checked pairs, violations).
    fn order_check(
        &self,
        result: &ReconstructionResult,
        frames: &[FrameId],
        index: &TelemetryIndex,
    ) -> (usize, usize) {
        let engine_frame = LocalFrame::new(result.reference);
        let tol = self.config.order_tolerance_m;

        let track: Vec<_> = frames
            .iter()
            .filter_map(|id| {
                let pose = result.pose(*id)?;
                let gps = engine_frame.to_local(&index.frame(*id)?.position);
                Some((pose.center, gps))
            })
            .collect();

        let mut checked = 0;
        let mut violations = 0;
        for pair in track.windows(2) {
            let recon_step = pair[1].0 - pair[0].0;
            let gps_step = pair[1].1 - pair[0].1;
            if recon_step.norm() <= tol || gps_step.norm() <= tol {
                continue;
            }
            checked += 1;
            if recon_step.dot(&gps_step) < 0.0 {
                violations += 1;
            }
        }
        (checked, violations)
    }
}

/// (start position, length) of the longest unlocalized run. First one wins ties.
fn longest_unlocalized_run(result: &ReconstructionResult, frames: &[FrameId]) -> (usize, usize) {
    let mut best = (0, 0);
    let mut run_start = 0;
    let mut run_len = 0;
    for (pos, id) in frames.iter().enumerate() {
        if result.is_localized(*id) {
            run_len = 0;
        } else {
            if run_len == 0 {
                run_start = pos;
            }
            run_len += 1;
            if run_len > best.1 {
                best = (run_start, run_len);
            }
        }
    }
    best
}

/// Interior position with the fewest feature tracks.
fn fewest_tracks(result: &ReconstructionResult, frames: &[FrameId]) -> Option<usize> {
    if frames.len() < 3 {
        return None;
    }
    (1..frames.len() - 1).min_by_key(|&pos| {
        result
            .track_counts
            .get(&frames[pos])
            .copied()
            .unwrap_or(0)
    })
}
