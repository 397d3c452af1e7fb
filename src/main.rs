use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pv_mapper::io::{load_telemetry_csv, write_plant_model, PrecomputedSegmenter};
use pv_mapper::reconstruction::CommandEngine;
use pv_mapper::{CancellationToken, PipelineError, PlantRunner, RunConfig};

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let work_dir = PathBuf::from(std::env::args().nth(1).unwrap_or_else(|| ".".to_string()));
    info!("Work directory: {}", work_dir.display());

    let config_path = work_dir.join("config.yml");
    let config = if config_path.exists() {
        RunConfig::from_path(&config_path)
            .with_context(|| format!("Failed to load {}", config_path.display()))?
    } else {
        warn!("No config.yml in work directory, using defaults");
        RunConfig::default()
    };

    let frames = load_telemetry_csv(&work_dir.join("telemetry.csv"))?;
    info!("Loaded {} frames", frames.len());

    let detections_path = work_dir.join("detections.json");
    let segmenter = if detections_path.exists() {
        PrecomputedSegmenter::from_path(&detections_path)?
    } else {
        warn!("No detections.json in work directory, module registry will be empty");
        PrecomputedSegmenter::default()
    };
    info!("Loaded detections for {} frames", segmenter.len());

    let engine = CommandEngine::from_config(&config.reconstruction.engine)?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || {
            warn!("Interrupt received, cancelling run");
            cancel.cancel();
        })
        .context("Failed to install Ctrl-C handler")?;
    }

    let runner = PlantRunner::new(config, Arc::new(engine), Arc::new(segmenter));
    let model = match runner.run(frames, cancel) {
        Ok(model) => model,
        Err(PipelineError::Cancelled) => {
            warn!("Run cancelled, no plant model written");
            std::process::exit(130);
        }
        Err(e) => return Err(e.into()),
    };

    let out = work_dir.join("plant_model.json");
    write_plant_model(&out, &model)?;
    info!(
        "Wrote {} modules ({} abandoned clusters) to {}",
        model.modules.len(),
        model.report.abandoned.len(),
        out.display()
    );
    for abandoned in &model.report.abandoned {
        warn!(
            "Abandoned {} (frames {:?}..{:?}): {}",
            abandoned.cluster,
            abandoned.first_frame,
            abandoned.last_frame,
            abandoned.last_diagnostic.as_deref().unwrap_or("no diagnostic")
        );
    }
    Ok(())
}
