//! Snow-depth enrichment of the cached weather series.
//!
//! For every `<lat>_<lon>.csv` in the year's weather directory, adds the
//! gridded snow depth to each hour and writes `<lat>_<lon>_snow.csv`. When
//! the metadata sidecar is present the engine-ready weather file is written
//! too.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use futures_util::{StreamExt, stream};
use tracing::{error, info};

use crate::config::{Config, coordinate_key};
use crate::errors::{PipelineError, Result};
use crate::models::weather::{ENGINE_WEATHER_HEADERS, WeatherMetadata, WeatherRecord};
use crate::services::acquisition::{metadata_path, read_cached};
use crate::services::snow_depth::{SnowDepthSource, SnowGrid};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrichOutcome {
    Enriched { engine_file: bool },
    Skipped,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EnrichSummary {
    pub enriched: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Coordinates from a plain cache file name `<lat>_<lon>.csv`. Any other
/// name (snow or metadata variants included) yields `None`.
pub fn parse_coordinates(file_name: &str) -> Option<(f64, f64)> {
    let stem = file_name.strip_suffix(".csv")?;
    let (lat, lon) = stem.split_once('_')?;
    let lat: f64 = lat.parse().ok()?;
    let lon: f64 = lon.parse().ok()?;
    (lat.is_finite() && lon.is_finite()).then_some((lat, lon))
}

pub fn snow_path(dir: &Path, latitude: f64, longitude: f64) -> PathBuf {
    dir.join(format!("{}_snow.csv", coordinate_key(latitude, longitude)))
}

/// Cache files eligible for enrichment, sorted by name.
pub fn discover(dir: &Path) -> Result<Vec<(PathBuf, f64, f64)>> {
    if !dir.is_dir() {
        return Err(PipelineError::MissingInput(dir.to_path_buf()));
    }
    let mut found = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if let Some((lat, lon)) = parse_coordinates(name) {
            found.push((path.clone(), lat, lon));
        }
    }
    found.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(found)
}

pub fn enrich_file(
    source: &Path,
    latitude: f64,
    longitude: f64,
    snow: &dyn SnowDepthSource,
    engine_weather_path: &Path,
) -> Result<EnrichOutcome> {
    let dir = source.parent().unwrap_or_else(|| Path::new("."));
    let target = snow_path(dir, latitude, longitude);
    if target.exists() {
        info!(path = %target.display(), "snow file already exists, skipping");
        return Ok(EnrichOutcome::Skipped);
    }

    let mut records = read_cached(source)?;
    let cell = snow.cell_series(latitude, longitude)?;
    for record in &mut records {
        record.snow_depth = Some(cell.depth_cm(record.timestamp));
    }

    // The snow file marks the site done, so it lands last.
    let sidecar = metadata_path(source);
    let engine_file = if sidecar.exists() {
        let metadata: WeatherMetadata = serde_json::from_slice(&std::fs::read(&sidecar)?)?;
        write_engine_weather_file(engine_weather_path, &metadata, &records)?;
        true
    } else {
        false
    };

    let tmp = target.with_extension("partial");
    {
        let mut writer = csv::Writer::from_path(&tmp)?;
        for record in &records {
            writer.serialize(record)?;
        }
        writer.flush()?;
    }
    std::fs::rename(&tmp, &target)?;

    info!(lat = latitude, lon = longitude, rows = records.len(), engine_file, "enriched weather series");
    Ok(EnrichOutcome::Enriched { engine_file })
}

/// Writes the three-header-line weather file the simulation engine reads:
/// metadata keys, metadata values, then the column headers and data rows.
pub fn write_engine_weather_file(
    path: &Path,
    metadata: &WeatherMetadata,
    records: &[WeatherRecord],
) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let tmp = path.with_extension("partial");
    {
        let mut writer = csv::WriterBuilder::new().flexible(true).from_path(&tmp)?;
        writer.write_record(metadata.keys())?;
        writer.write_record(metadata.values())?;
        writer.write_record(ENGINE_WEATHER_HEADERS)?;
        for record in records {
            writer.write_record(record.engine_fields())?;
        }
        writer.flush()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

pub async fn run(config: &Config, year: i32) -> Result<EnrichSummary> {
    let weather_dir = config.weather_dir(year);
    let files = discover(&weather_dir)?;
    let grid_path = config.snow_grid_path(year);
    let variable = config.snow.variable.clone();
    let grid = Arc::new(tokio::task::spawn_blocking(move || SnowGrid::open(&grid_path, &variable)).await.map_err(
        |e| PipelineError::Io(std::io::Error::other(e)),
    )??);

    let total = files.len();
    info!(total, dir = %weather_dir.display(), "enriching weather files with snow depth");
    let done = Arc::new(AtomicUsize::new(0));
    let started = Instant::now();

    let outcomes: Vec<Result<EnrichOutcome>> = stream::iter(files)
        .map(|(path, lat, lon)| {
            let grid = grid.clone();
            let done = done.clone();
            let engine_path = config.engine_weather_path(year, lat, lon);
            async move {
                let source = path.clone();
                let outcome = tokio::task::spawn_blocking(move || {
                    enrich_file(&source, lat, lon, &*grid, &engine_path)
                })
                .await
                .map_err(|e| PipelineError::Io(std::io::Error::other(e)))
                .and_then(|r| r);
                if let Err(e) = &outcome {
                    error!(path = %path.display(), error = %e, "snow enrichment failed");
                }
                let n = done.fetch_add(1, Ordering::Relaxed) + 1;
                info!(
                    "progress: {}/{} files processed ({:.2}%), elapsed {:.2}s",
                    n,
                    total,
                    n as f64 / total as f64 * 100.0,
                    started.elapsed().as_secs_f64()
                );
                outcome
            }
        })
        .buffer_unordered(config.acquisition.enrich_concurrency.max(1))
        .collect()
        .await;

    let mut summary = EnrichSummary::default();
    for outcome in outcomes {
        match outcome {
            Ok(EnrichOutcome::Enriched { .. }) => summary.enriched += 1,
            Ok(EnrichOutcome::Skipped) => summary.skipped += 1,
            Err(_) => summary.failed += 1,
        }
    }
    Ok(summary)
}
