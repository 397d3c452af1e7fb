//! Thin file loaders and writers around a run's work directory.

pub mod detections;
pub mod telemetry_csv;

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};

use crate::system::PlantModel;

pub use detections::PrecomputedSegmenter;
pub use telemetry_csv::{load_telemetry_csv, read_telemetry_records};

/// Write the plant model as pretty JSON.
///
/// The file is written next to its destination and renamed into place, so a
/// reader never sees a partial model.
pub fn write_plant_model(path: &Path, model: &PlantModel) -> Result<()> {
    let tmp = path.with_extension("json.partial");
    {
        let file = File::create(&tmp).with_context(|| format!("Failed to create {}", tmp.display()))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, model)?;
        writer.flush()?;
    }
    fs::rename(&tmp, path).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}
