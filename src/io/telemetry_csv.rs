//! Telemetry CSV loader.
//!
//! Columns: `id,timestamp,lat,lon,alt[,image]` with a header row. Lines
//! starting with `#` are comments. Relative image paths are resolved against
//! the CSV's directory.

use std::path::Path;

use anyhow::{Context, Result};
use csv::ReaderBuilder;
use serde::Deserialize;

use crate::telemetry::{frames_from_records, Frame, TelemetryRecord};

/// Row as it appears on disk. Unparseable cells become None and are reported
/// as missing fields during validation.
#[derive(Debug, Deserialize)]
struct CsvRow {
    #[serde(default, deserialize_with = "csv::invalid_option")]
    id: Option<u64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    timestamp: Option<f64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    lat: Option<f64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    lon: Option<f64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    alt: Option<f64>,
    #[serde(default)]
    image: Option<String>,
}

/// Read raw telemetry records in file order.
pub fn read_telemetry_records(csv_path: &Path) -> Result<Vec<TelemetryRecord>> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(true)
        .comment(Some(b'#'))
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(csv_path)
        .with_context(|| format!("Failed to open {}", csv_path.display()))?;

    let base = csv_path.parent().unwrap_or_else(|| Path::new(""));
    let mut records = Vec::new();
    for (i, row) in rdr.deserialize::<CsvRow>().enumerate() {
        let row = row.with_context(|| format!("Bad telemetry row {} in {}", i, csv_path.display()))?;
        let image = row
            .image
            .filter(|s| !s.is_empty())
            .map(|s| base.join(s).to_string_lossy().into_owned());
        records.push(TelemetryRecord {
            id: row.id,
            timestamp: row.timestamp,
            lat: row.lat,
            lon: row.lon,
            alt: row.alt,
            image,
        });
    }
    Ok(records)
}

/// Load and validate frames from a telemetry CSV.
pub fn load_telemetry_csv(csv_path: &Path) -> Result<Vec<Frame>> {
    let records = read_telemetry_records(csv_path)?;
    let frames = frames_from_records(records)
        .with_context(|| format!("Invalid telemetry in {}", csv_path.display()))?;
    Ok(frames)
}
