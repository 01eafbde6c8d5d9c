//! Runs the PV engine for every site in both scenarios and writes the
//! local-time result series with their UTC timestamps.

use std::path::Path;

use chrono::Utc;
use chrono_tz::Tz;
use tracing::{error, info, warn};

use crate::config::{Config, EngineConfig};
use crate::errors::{PipelineError, Result};
use crate::models::results::{EngineOutputs, ResultRow, Scenario};
use crate::models::site::{SiteRecord, TrackingType};
use crate::services::local_time::{format_local, format_utc, localize, resolve_timezone};
use crate::services::pv_engine::{ArrayType, SimulationEngine, SystemDesign, WeatherFile};
use crate::services::site_selection::read_dictionary;

const HOURS_PER_YEAR: usize = 8760;
const BLANK_TILT_DEFAULT: f64 = 30.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulationOutcome {
    Written,
    Skipped,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SimulationSummary {
    pub written: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Engine design for one site and scenario.
pub fn design_for_site(site: &SiteRecord, engine: &EngineConfig, scenario: Scenario) -> Result<SystemDesign> {
    let capacity_mw = site
        .capacity_mw_dc
        .filter(|c| c.is_finite())
        .ok_or_else(|| PipelineError::MissingAttribute {
            site: site.project_name.clone(),
            attribute: "Solar Capacity MW-DC",
        })?;

    let mut design = SystemDesign {
        system_capacity_kw: capacity_mw * 1000.0,
        snow_model: scenario.snow_model_enabled(),
        ..SystemDesign::default()
    };
    match site.tracking() {
        TrackingType::FixedTilt => {
            design.array_type = ArrayType::FixedOpenRack;
            design.tilt_deg = site.tilt_degrees().unwrap_or(BLANK_TILT_DEFAULT);
        }
        TrackingType::SingleAxis => {
            design.array_type = ArrayType::SingleAxis;
            design.tilt_deg = 0.0;
        }
        TrackingType::Other => {}
    }
    if let Some(v) = engine.dc_ac_ratio {
        design.dc_ac_ratio = v;
    }
    if let Some(v) = engine.inverter_efficiency {
        design.inverter_efficiency = v;
    }
    if let Some(v) = engine.system_losses {
        design.losses_pct = v;
    }
    if let Some(v) = engine.roof_slide_coefficient {
        design.roof_slide_coefficient = v;
    }
    Ok(design)
}

/// Pairs engine outputs with their local and UTC timestamps.
pub fn build_result_rows(weather: &WeatherFile, outputs: &EngineOutputs, tz: &Tz) -> Result<Vec<ResultRow>> {
    let n = weather.records.len();
    let lengths = [
        outputs.ac.len(),
        outputs.dc.len(),
        outputs.dc_snow_derate.len(),
        outputs.generation.len(),
        outputs.snow.len(),
        outputs.poa.len(),
        outputs.tamb.len(),
    ];
    if lengths.iter().any(|&l| l != n) {
        return Err(PipelineError::Engine(format!(
            "engine returned {:?} values for {} weather rows",
            lengths, n
        )));
    }

    weather
        .records
        .iter()
        .enumerate()
        .map(|(i, record)| {
            let local = localize(tz, record.timestamp)?;
            Ok(ResultRow {
                utc: format_utc(&local.with_timezone(&Utc)),
                ac_w: outputs.ac[i],
                dc_w: outputs.dc[i],
                dc_snow_derate_pct: outputs.dc_snow_derate[i],
                generation_kw: outputs.generation[i],
                snow_depth_cm: outputs.snow[i],
                poa: outputs.poa[i],
                tamb: outputs.tamb[i],
                local: format_local(&local),
            })
        })
        .collect()
}

pub fn write_results(path: &Path, rows: &[ResultRow]) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let tmp = path.with_extension("partial");
    {
        let mut writer = csv::Writer::from_path(&tmp)?;
        for row in rows {
            writer.serialize(row)?;
        }
        writer.flush()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Simulates one site for one scenario; skips when the result already exists.
pub fn simulate_site(
    config: &Config,
    engine: &dyn SimulationEngine,
    site: &SiteRecord,
    year: i32,
    scenario: Scenario,
) -> Result<SimulationOutcome> {
    let output = config.local_results_path(scenario, year, &site.project_name);
    if output.exists() {
        info!(project = %site.project_name, %scenario, "results already exist, skipping");
        return Ok(SimulationOutcome::Skipped);
    }

    let design = design_for_site(site, &config.engine, scenario)?;
    let weather = WeatherFile::read(&config.engine_weather_path(year, site.latitude, site.longitude))?;
    if weather.records.len() != HOURS_PER_YEAR {
        warn!(
            project = %site.project_name,
            rows = weather.records.len(),
            "weather file does not have {} rows", HOURS_PER_YEAR
        );
    }
    let tz = resolve_timezone(site.latitude, site.longitude)?;
    let outputs = engine.execute(&design, &weather)?;
    let rows = build_result_rows(&weather, &outputs, &tz)?;
    write_results(&output, &rows)?;
    info!(project = %site.project_name, %scenario, tz = %tz, rows = rows.len(), "simulation written");
    Ok(SimulationOutcome::Written)
}

pub fn run(config: &Config, engine: &dyn SimulationEngine, year: i32) -> Result<SimulationSummary> {
    let sites = read_dictionary(&config.dictionary_path(year))?;
    let mut summary = SimulationSummary::default();
    for scenario in Scenario::ALL {
        info!(%scenario, sites = sites.len(), "starting scenario");
        for (index, site) in &sites {
            match simulate_site(config, engine, site, year, scenario) {
                Ok(SimulationOutcome::Written) => summary.written += 1,
                Ok(SimulationOutcome::Skipped) => summary.skipped += 1,
                Err(e) => {
                    summary.failed += 1;
                    error!(site = index, project = %site.project_name, %scenario, error = %e, "simulation failed");
                }
            }
        }
    }
    Ok(summary)
}
