//! Engine adapter that drives an external SfM executable.
//!
//! Layout of the working area handed to the executable:
//!
//! ```text
//! <work_dir>/image_list.txt      one image path per line, capture order
//! <work_dir>/gps_priors.csv      frame_id,lat,lon,alt
//! <work_dir>/params.json         ReconstructionParams
//! <work_dir>/engine.log          stdout + stderr of the child
//! <work_dir>/reconstruction.json written by the executable
//! ```
//!
//! `reconstruction.json`:
//!
//! ```text
//! {
//!   "reference_lla": {"latitude": .., "longitude": .., "altitude": ..},
//!   "shots": {"<frame id>": {"rotation": [rx, ry, rz], "translation": [tx, ty, tz], "num_tracks": n}},
//!   "points": [[x, y, z], ...],
//!   "reprojection_error": 0.9
//! }
//! ```
//!
//! Shot rotations are angle-axis world-to-camera, as OpenSfM stores them.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::geometry::{CameraPose, GeoPoint};
use crate::telemetry::FrameId;

use super::engine::{EngineOutput, EnginePose, EngineRequest, StructureFromMotion};

const OUTPUT_FILE: &str = "reconstruction.json";

/// How the external executable is launched.
///
/// `{work_dir}` in `args` is replaced by the invocation's working area.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineCommandConfig {
    pub program: Option<PathBuf>,
    pub args: Vec<String>,
    pub poll_interval_ms: u64,
}

impl Default for EngineCommandConfig {
    fn default() -> Self {
        Self {
            program: None,
            args: vec!["reconstruct".into(), "{work_dir}".into()],
            poll_interval_ms: 50,
        }
    }
}

/// Runs one child process per reconstruction.
#[derive(Debug, Clone)]
pub struct CommandEngine {
    program: PathBuf,
    args: Vec<String>,
    poll_interval: Duration,
}

impl CommandEngine {
    pub fn new(program: PathBuf, args: Vec<String>, poll_interval: Duration) -> Self {
        Self {
            program,
            args,
            poll_interval,
        }
    }

    /// Build from configuration. Fails if no program is configured.
    pub fn from_config(config: &EngineCommandConfig) -> anyhow::Result<Self> {
        let program = config
            .program
            .clone()
            .context("reconstruction.engine.program is not configured")?;
        Ok(Self::new(
            program,
            config.args.clone(),
            Duration::from_millis(config.poll_interval_ms.max(1)),
        ))
    }

    fn write_inputs(&self, request: &EngineRequest) -> anyhow::Result<()> {
        let dir = &request.work_dir;

        let mut list = BufWriter::new(File::create(dir.join("image_list.txt"))?);
        for img in &request.images {
            match &img.image {
                Some(path) => writeln!(list, "{}", path.display())?,
                None => bail!("frame {} has no image reference", img.frame),
            }
        }
        list.flush()?;

        let mut priors = csv::Writer::from_path(dir.join("gps_priors.csv"))?;
        priors.write_record(["frame_id", "lat", "lon", "alt"])?;
        for img in &request.images {
            priors.write_record(&[
                img.frame.0.to_string(),
                img.position.lat.to_string(),
                img.position.lon.to_string(),
                img.position.alt.to_string(),
            ])?;
        }
        priors.flush()?;

        fs::write(
            dir.join("params.json"),
            serde_json::to_vec_pretty(&request.params)?,
        )?;
        Ok(())
    }

    fn expand_args(&self, work_dir: &Path) -> Vec<String> {
        let dir = work_dir.display().to_string();
        self.args.iter().map(|a| a.replace("{work_dir}", &dir)).collect()
    }
}

impl StructureFromMotion for CommandEngine {
    fn name(&self) -> &str {
        "command"
    }

    fn reconstruct(&self, request: &EngineRequest) -> anyhow::Result<EngineOutput> {
        self.write_inputs(request)
            .context("failed to prepare engine inputs")?;

        let log = File::create(request.work_dir.join("engine.log"))?;
        let mut child = Command::new(&self.program)
            .args(self.expand_args(&request.work_dir))
            .current_dir(&request.work_dir)
            .stdin(Stdio::null())
            .stdout(log.try_clone()?)
            .stderr(log)
            .spawn()
            .with_context(|| format!("failed to start {}", self.program.display()))?;
        debug!(
            "{}: started {} (pid {})",
            request.cluster,
            self.program.display(),
            child.id()
        );

        let status = loop {
            if request.cancel.is_cancelled() {
                if let Err(e) = child.kill() {
                    warn!("{}: failed to kill engine: {}", request.cluster, e);
                }
                let _ = child.wait();
                bail!("engine cancelled");
            }
            match child.try_wait()? {
                Some(status) => break status,
                None => thread::sleep(self.poll_interval),
            }
        };

        if !status.success() {
            bail!(
                "engine exited with {} (see engine.log)",
                status
            );
        }

        let raw = fs::read(request.work_dir.join(OUTPUT_FILE))
            .with_context(|| format!("engine produced no {}", OUTPUT_FILE))?;
        parse_output(&raw)
    }
}

#[derive(Debug, Deserialize)]
struct RawReference {
    latitude: f64,
    longitude: f64,
    altitude: f64,
}

#[derive(Debug, Deserialize)]
struct RawShot {
    rotation: [f64; 3],
    translation: [f64; 3],
    #[serde(default)]
    num_tracks: usize,
}

#[derive(Debug, Deserialize)]
struct RawReconstruction {
    reference_lla: Option<RawReference>,
    #[serde(default)]
    shots: HashMap<String, RawShot>,
    #[serde(default)]
    points: Vec<[f64; 3]>,
    #[serde(default)]
    reprojection_error: f64,
}

/// Parse the engine's `reconstruction.json`.
pub fn parse_output(raw: &[u8]) -> anyhow::Result<EngineOutput> {
    let parsed: RawReconstruction =
        serde_json::from_slice(raw).context("malformed reconstruction output")?;

    let mut poses = HashMap::with_capacity(parsed.shots.len());
    for (key, shot) in parsed.shots {
        let id: u64 = key
            .trim()
            .parse()
            .with_context(|| format!("shot key {:?} is not a frame id", key))?;
        let pose = CameraPose::from_world_to_camera(
            &Vector3::from(shot.rotation),
            &Vector3::from(shot.translation),
        );
        poses.insert(
            FrameId::new(id),
            EnginePose {
                pose,
                num_tracks: shot.num_tracks,
            },
        );
    }

    Ok(EngineOutput {
        reference: parsed
            .reference_lla
            .map(|r| GeoPoint::new(r.latitude, r.longitude, r.altitude)),
        poses,
        points: parsed.points.into_iter().map(Vector3::from).collect(),
        reprojection_error: parsed.reprojection_error,
    })
}
