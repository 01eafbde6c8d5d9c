//! Fleet-level snow-loss summaries built from the stitched UTC series.
//!
//! Every summary is written as a plot-ready CSV table under
//! `<base>/analysis/`.

use std::path::Path;

use chrono::{DateTime, Datelike, FixedOffset};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::{AnalysisConfig, Config, SnowEventConfig};
use crate::errors::{PipelineError, Result};
use crate::models::results::{Scenario, StitchedRow};
use crate::models::site::{MountClass, SiteRecord};
use crate::services::site_selection::read_dictionary;
use crate::services::stitching::parse_utc;

/// Both scenario series of one site for one year.
#[derive(Debug, Clone)]
pub struct SiteSeries {
    pub site: SiteRecord,
    pub no_snow: Vec<StitchedRow>,
    pub snow: Vec<StitchedRow>,
}

impl SiteSeries {
    pub fn mount(&self) -> MountClass {
        self.site.mount_class()
    }
}

pub fn read_series(path: &Path) -> Result<Vec<StitchedRow>> {
    if !path.exists() {
        return Err(PipelineError::MissingInput(path.to_path_buf()));
    }
    let mut reader = csv::Reader::from_path(path)?;
    let rows = reader.deserialize().collect::<std::result::Result<Vec<StitchedRow>, _>>()?;
    Ok(rows)
}

fn is_included(site: &SiteRecord, analysis: &AnalysisConfig) -> bool {
    !analysis.excluded_sites.iter().any(|name| name == &site.project_name)
        && analysis.min_latitude.is_none_or(|min| site.latitude >= min)
}

/// Loads every included site of `year` that has both stitched series.
pub fn load_year(config: &Config, year: i32) -> Result<Vec<SiteSeries>> {
    let sites = read_dictionary(&config.dictionary_path(year))?;
    let mut loaded = Vec::new();
    for site in sites.into_values().filter(|s| is_included(s, &config.analysis)) {
        let no_snow = read_series(&config.utc_results_path(Scenario::NoSnow, year, &site.project_name));
        let snow = read_series(&config.utc_results_path(Scenario::RoofSlideCoeff, year, &site.project_name));
        match (no_snow, snow) {
            (Ok(no_snow), Ok(snow)) => loaded.push(SiteSeries { site, no_snow, snow }),
            (Err(e), _) | (_, Err(e)) => {
                warn!(year, project = %site.project_name, error = %e, "site left out of analysis");
            }
        }
    }
    info!(year, sites = loaded.len(), "stitched series loaded");
    Ok(loaded)
}

fn in_months(row: &StitchedRow, months: &[u32]) -> bool {
    parse_utc(&row.utc).is_some_and(|t| months.contains(&t.month()))
}

fn loss_pct(no_snow: f64, snow: f64) -> f64 {
    if no_snow != 0.0 { (no_snow - snow) / no_snow * 100.0 } else { 0.0 }
}

// ─── Seasonal totals ─────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SiteTotal {
    #[serde(rename = "Year")]
    pub year: i32,
    #[serde(rename = "Project Name")]
    pub project: String,
    #[serde(rename = "Mount")]
    pub mount: MountClass,
    #[serde(rename = "No Snow Total DC Inverter Input Power [W]")]
    pub no_snow_w: f64,
    #[serde(rename = "Snow Total DC Inverter Input Power [W]")]
    pub snow_w: f64,
    #[serde(rename = "Total Snow Loss [W]")]
    pub loss_w: f64,
    #[serde(rename = "Site Snow Loss [%]")]
    pub loss_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeasonalTotals {
    #[serde(rename = "Year")]
    pub year: i32,
    #[serde(rename = "Tracking Sites without Snow [W]")]
    pub tracking_no_snow_w: f64,
    #[serde(rename = "Tracking Sites with Snow [W]")]
    pub tracking_snow_w: f64,
    #[serde(rename = "Tracking Total Loss [%]")]
    pub tracking_loss_pct: f64,
    #[serde(rename = "Fixed Sites without Snow [W]")]
    pub fixed_no_snow_w: f64,
    #[serde(rename = "Fixed Sites with Snow [W]")]
    pub fixed_snow_w: f64,
    #[serde(rename = "Fixed Total Loss [%]")]
    pub fixed_loss_pct: f64,
    #[serde(rename = "All Sites without Snow [W]")]
    pub all_no_snow_w: f64,
    #[serde(rename = "All Sites with Snow [W]")]
    pub all_snow_w: f64,
    #[serde(rename = "Total Loss [%]")]
    pub all_loss_pct: f64,
}

pub fn site_totals(year: i32, series: &[SiteSeries], months: &[u32]) -> Vec<SiteTotal> {
    series
        .iter()
        .map(|s| {
            let sum = |rows: &[StitchedRow]| -> f64 {
                rows.iter().filter(|r| in_months(r, months)).map(|r| r.dc_w).sum()
            };
            let no_snow_w = sum(&s.no_snow);
            let snow_w = sum(&s.snow);
            SiteTotal {
                year,
                project: s.site.project_name.clone(),
                mount: s.mount(),
                no_snow_w,
                snow_w,
                loss_w: no_snow_w - snow_w,
                loss_pct: loss_pct(no_snow_w, snow_w),
            }
        })
        .collect()
}

/// Fleet totals by mount class. Sites of any other mount count toward the
/// overall totals only.
pub fn seasonal_totals(year: i32, totals: &[SiteTotal]) -> SeasonalTotals {
    let by = |class: Option<MountClass>| -> (f64, f64) {
        totals
            .iter()
            .filter(|t| class.is_none_or(|c| t.mount == c))
            .fold((0.0, 0.0), |(ns, s), t| (ns + t.no_snow_w, s + t.snow_w))
    };
    let (tracking_no_snow_w, tracking_snow_w) = by(Some(MountClass::Tracking));
    let (fixed_no_snow_w, fixed_snow_w) = by(Some(MountClass::FixedTilt));
    let (all_no_snow_w, all_snow_w) = by(None);
    SeasonalTotals {
        year,
        tracking_no_snow_w,
        tracking_snow_w,
        tracking_loss_pct: loss_pct(tracking_no_snow_w, tracking_snow_w),
        fixed_no_snow_w,
        fixed_snow_w,
        fixed_loss_pct: loss_pct(fixed_no_snow_w, fixed_snow_w),
        all_no_snow_w,
        all_snow_w,
        all_loss_pct: loss_pct(all_no_snow_w, all_snow_w),
    }
}

// ─── Maximum loss hour ───────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MaxLossHour {
    #[serde(rename = "Year")]
    pub year: i32,
    #[serde(rename = "Max Loss Timestamp")]
    pub utc: String,
    #[serde(rename = "Total Max Loss [W]")]
    pub loss_w: f64,
    #[serde(rename = "Total Power Generation at Max Loss [W]")]
    pub no_snow_w: f64,
    #[serde(rename = "Total Power Generation at Max Loss with snow [W]")]
    pub snow_w: f64,
    #[serde(rename = "Total Fixed Tilt Loss at Max")]
    pub fixed_loss_w: f64,
    #[serde(rename = "Total Fixed Tilt Power Generation at Max Loss [W]")]
    pub fixed_no_snow_w: f64,
    #[serde(rename = "Total Fixed Tilt Power Generation at Max Loss with snow [W]")]
    pub fixed_snow_w: f64,
    #[serde(rename = "Total Tracking Loss at Max")]
    pub tracking_loss_w: f64,
    #[serde(rename = "Total Tracking Power Generation at Max Loss [W]")]
    pub tracking_no_snow_w: f64,
    #[serde(rename = "Total Tracking Power Generation at Max Loss with snow [W]")]
    pub tracking_snow_w: f64,
}

/// The hour with the largest fleet-wide loss. Sites are aligned by row
/// position, which the stitched grid makes identical across sites; the
/// first hour wins a tie.
pub fn max_loss_hour(year: i32, series: &[SiteSeries], months: &[u32]) -> Option<MaxLossHour> {
    let filtered: Vec<(MountClass, Vec<&StitchedRow>, Vec<&StitchedRow>)> = series
        .iter()
        .map(|s| {
            (
                s.mount(),
                s.no_snow.iter().filter(|r| in_months(r, months)).collect(),
                s.snow.iter().filter(|r| in_months(r, months)).collect(),
            )
        })
        .collect();
    let hours = filtered.iter().map(|(_, ns, s)| ns.len().min(s.len())).max()?;

    let mut best: Option<(usize, f64)> = None;
    for h in 0..hours {
        let total: f64 = filtered
            .iter()
            .filter_map(|(_, ns, s)| Some(ns.get(h)?.dc_w - s.get(h)?.dc_w))
            .sum();
        if best.is_none_or(|(_, b)| total > b) {
            best = Some((h, total));
        }
    }
    let (hour, loss_w) = best?;

    let mut out = MaxLossHour {
        year,
        utc: String::new(),
        loss_w,
        no_snow_w: 0.0,
        snow_w: 0.0,
        fixed_loss_w: 0.0,
        fixed_no_snow_w: 0.0,
        fixed_snow_w: 0.0,
        tracking_loss_w: 0.0,
        tracking_no_snow_w: 0.0,
        tracking_snow_w: 0.0,
    };
    for (mount, ns, s) in &filtered {
        let (Some(ns), Some(s)) = (ns.get(hour), s.get(hour)) else { continue };
        if out.utc.is_empty() {
            out.utc = ns.utc.clone();
        }
        out.no_snow_w += ns.dc_w;
        out.snow_w += s.dc_w;
        match mount {
            MountClass::FixedTilt => {
                out.fixed_loss_w += ns.dc_w - s.dc_w;
                out.fixed_no_snow_w += ns.dc_w;
                out.fixed_snow_w += s.dc_w;
            }
            MountClass::Tracking => {
                out.tracking_loss_w += ns.dc_w - s.dc_w;
                out.tracking_no_snow_w += ns.dc_w;
                out.tracking_snow_w += s.dc_w;
            }
            MountClass::Other => {}
        }
    }
    Some(out)
}

// ─── Snow event ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnowEventRow {
    #[serde(rename = "Local Datetime")]
    pub local: String,
    #[serde(rename = "DC Power without Snow [kW]")]
    pub dc_no_snow_kw: f64,
    #[serde(rename = "DC Power with Snow [kW]")]
    pub dc_snow_kw: f64,
    #[serde(rename = "Snow Depth [cm]")]
    pub snow_depth_cm: f64,
    #[serde(rename = "POA Irradiance [W/m2]")]
    pub poa: f64,
    #[serde(rename = "Ambient Temperature [C]")]
    pub tamb: f64,
}

fn parse_local(raw: &str) -> Option<DateTime<FixedOffset>> {
    let raw = raw.trim();
    ["%Y-%m-%d %H:%M:%S%:z", "%Y-%m-%d %H:%M:%S%z", "%Y-%m-%d %H:%M:%S %z"]
        .iter()
        .find_map(|fmt| DateTime::parse_from_str(raw, fmt).ok())
}

/// Hourly rows of one site inside a local-time window, both bounds inclusive.
pub fn snow_event(series: &SiteSeries, window: &SnowEventConfig) -> Result<Vec<SnowEventRow>> {
    let bound = |raw: &str| parse_local(raw).ok_or_else(|| PipelineError::UnparseableTimestamp(raw.to_string()));
    let (start, end) = (bound(&window.start)?, bound(&window.end)?);

    Ok(series
        .no_snow
        .iter()
        .zip(&series.snow)
        .filter(|(ns, _)| parse_local(&ns.local).is_some_and(|t| t >= start && t <= end))
        .map(|(ns, s)| SnowEventRow {
            local: ns.local.clone(),
            dc_no_snow_kw: ns.dc_w / 1000.0,
            dc_snow_kw: s.dc_w / 1000.0,
            snow_depth_cm: s.snow_depth_cm,
            poa: ns.poa,
            tamb: s.tamb,
        })
        .collect())
}

// ─── Hour snapshot ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotRow {
    #[serde(rename = "Project Name")]
    pub project: String,
    #[serde(rename = "Latitude")]
    pub latitude: f64,
    #[serde(rename = "Longitude")]
    pub longitude: f64,
    #[serde(rename = "Mount")]
    pub mount: MountClass,
    #[serde(rename = "Solar COD Year")]
    pub cod_year: Option<i32>,
    #[serde(rename = "DC without Snow [GW]")]
    pub no_snow_gw: f64,
    #[serde(rename = "DC with Snow [GW]")]
    pub snow_gw: f64,
    #[serde(rename = "Snow Loss [GW]")]
    pub loss_gw: f64,
    #[serde(rename = "Snow Loss [%]")]
    pub loss_pct: f64,
}

/// Per-site DC output at one UTC hour, for mapping.
pub fn hour_snapshot(series: &[SiteSeries], utc: &str) -> Result<Vec<SnapshotRow>> {
    let target = parse_utc(utc).ok_or_else(|| PipelineError::UnparseableTimestamp(utc.to_string()))?;
    let at = |rows: &[StitchedRow]| -> Option<f64> {
        rows.iter().find(|r| parse_utc(&r.utc) == Some(target)).map(|r| r.dc_w)
    };
    Ok(series
        .iter()
        .filter_map(|s| {
            let no_snow = at(&s.no_snow)? / 1e9;
            let snow = at(&s.snow)? / 1e9;
            Some(SnapshotRow {
                project: s.site.project_name.clone(),
                latitude: s.site.latitude,
                longitude: s.site.longitude,
                mount: s.mount(),
                cod_year: s.site.cod_year,
                no_snow_gw: no_snow,
                snow_gw: snow,
                loss_gw: no_snow - snow,
                loss_pct: loss_pct(no_snow, snow),
            })
        })
        .collect())
}

// ─── Stage entry point ───────────────────────────────────────

fn write_table<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let mut writer = csv::Writer::from_path(path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    info!(path = %path.display(), rows = rows.len(), "analysis table written");
    Ok(())
}

pub fn run(config: &Config, year: i32) -> Result<()> {
    let analysis = &config.analysis;
    let start_year = analysis.start_year.unwrap_or(year);
    let end_year = analysis.end_year.unwrap_or(year);
    let out_dir = config.analysis_dir();

    let mut site_rows = Vec::new();
    let mut fleet_rows = Vec::new();
    let mut max_rows = Vec::new();
    for y in start_year..=end_year {
        let series = match load_year(config, y) {
            Ok(series) => series,
            Err(e) => {
                warn!(year = y, error = %e, "year left out of analysis");
                continue;
            }
        };
        let totals = site_totals(y, &series, &analysis.months);
        fleet_rows.push(seasonal_totals(y, &totals));
        site_rows.extend(totals);
        match max_loss_hour(y, &series, &analysis.months) {
            Some(row) => {
                info!(year = y, utc = %row.utc, loss_w = row.loss_w, "maximum loss hour");
                max_rows.push(row);
            }
            None => warn!(year = y, "no hours to rank for maximum loss"),
        }
    }
    let label = &analysis.season_label;
    write_table(&out_dir.join(format!("site_totals_{}.csv", label)), &site_rows)?;
    write_table(&out_dir.join(format!("seasonal_totals_{}.csv", label)), &fleet_rows)?;
    write_table(&out_dir.join("max_loss_hours.csv"), &max_rows)?;

    if let Some(event) = &analysis.snow_event {
        let event_year = parse_local(&event.start)
            .map(|t| t.year())
            .ok_or_else(|| PipelineError::UnparseableTimestamp(event.start.clone()))?;
        let series = load_year(config, event_year)?;
        match series.iter().find(|s| s.site.project_name == event.site) {
            Some(site) => {
                let rows = snow_event(site, event)?;
                write_table(&out_dir.join(format!("snow_event_{}.csv", event.site)), &rows)?;
            }
            None => warn!(site = %event.site, year = event_year, "snow event site has no stitched series"),
        }
    }

    if let Some(utc) = &analysis.snapshot_utc {
        let snapshot_year = parse_utc(utc)
            .map(|t| t.year())
            .ok_or_else(|| PipelineError::UnparseableTimestamp(utc.clone()))?;
        let series = load_year(config, snapshot_year)?;
        let rows = hour_snapshot(&series, utc)?;
        write_table(&out_dir.join(format!("hour_snapshot_{}.csv", snapshot_year)), &rows)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(utc: &str, local: &str, dc: f64) -> StitchedRow {
        StitchedRow {
            utc: utc.into(),
            dc_w: dc,
            snow_depth_cm: 10.0,
            poa: 300.0,
            tamb: -4.0,
            local: local.into(),
        }
    }

    fn site(name: &str, mount: &str, lat: f64) -> SiteRecord {
        SiteRecord {
            project_name: name.into(),
            state: "MI".into(),
            region: "MISO".into(),
            latitude: lat,
            longitude: -84.0,
            capacity_mw_dc: Some(1.0),
            tracking_type: String::new(),
            mount: mount.into(),
            tilt: String::new(),
            cod_year: Some(2015),
        }
    }

    const HOURS: [&str; 3] = [
        "2022-01-15 17:30:00+00:00",
        "2022-01-15 18:30:00+00:00",
        "2022-07-15 18:30:00+00:00",
    ];
    const LOCALS: [&str; 3] = [
        "2022-01-15 12:30:00-05:00",
        "2022-01-15 13:30:00-05:00",
        "2022-07-15 14:30:00-04:00",
    ];

    fn series(name: &str, mount: &str, no_snow: [f64; 3], snow: [f64; 3]) -> SiteSeries {
        let build = |values: [f64; 3]| -> Vec<StitchedRow> {
            (0..3).map(|i| row(HOURS[i], LOCALS[i], values[i])).collect()
        };
        SiteSeries { site: site(name, mount, 42.0), no_snow: build(no_snow), snow: build(snow) }
    }

    fn fleet() -> Vec<SiteSeries> {
        vec![
            series("Fixed A", "Fixed Tilt", [100.0, 200.0, 500.0], [50.0, 0.0, 500.0]),
            series("Tracker B", "Tracking", [300.0, 300.0, 600.0], [300.0, 100.0, 600.0]),
            series("Roof C", "Rooftop", [10.0, 10.0, 10.0], [10.0, 10.0, 10.0]),
        ]
    }

    #[test]
    fn test_site_and_seasonal_totals() {
        let winter = [12, 1, 2];
        let totals = site_totals(2022, &fleet(), &winter);
        assert_eq!(totals[0].no_snow_w, 300.0);
        assert_eq!(totals[0].snow_w, 50.0);
        assert_eq!(totals[0].loss_w, 250.0);
        assert!((totals[0].loss_pct - 250.0 / 3.0).abs() < 1e-9);

        let fleet_totals = seasonal_totals(2022, &totals);
        assert_eq!(fleet_totals.fixed_no_snow_w, 300.0);
        assert_eq!(fleet_totals.tracking_snow_w, 400.0);
        assert_eq!(fleet_totals.all_no_snow_w, 920.0);
        assert_eq!(fleet_totals.all_snow_w, 470.0);
    }

    #[test]
    fn test_zero_denominator_is_zero_percent() {
        let totals = site_totals(2022, &[series("Dark", "Tracking", [0.0; 3], [0.0; 3])], &[1]);
        assert_eq!(totals[0].loss_pct, 0.0);
        assert_eq!(seasonal_totals(2022, &totals).fixed_loss_pct, 0.0);
    }

    #[test]
    fn test_max_loss_hour() {
        let max = max_loss_hour(2022, &fleet(), &[1, 2, 12]).unwrap();
        assert_eq!(max.utc, HOURS[1]);
        assert_eq!(max.loss_w, 400.0);
        assert_eq!(max.fixed_loss_w, 200.0);
        assert_eq!(max.tracking_loss_w, 200.0);
        assert_eq!(max.no_snow_w, 510.0);
        assert_eq!(max.snow_w, 110.0);
        assert!(max_loss_hour(2022, &[], &[1]).is_none());
    }

    #[test]
    fn test_snow_event_window_is_inclusive() {
        let fleet = fleet();
        let window = SnowEventConfig {
            site: "Fixed A".into(),
            start: "2022-01-15 12:30:00-05:00".into(),
            end: "2022-01-15 13:30:00-05:00".into(),
        };
        let rows = snow_event(&fleet[0], &window).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].dc_no_snow_kw, 0.2);
        assert_eq!(rows[1].dc_snow_kw, 0.0);

        let bad = SnowEventConfig { start: "yesterday".into(), ..window };
        assert!(matches!(snow_event(&fleet[0], &bad), Err(PipelineError::UnparseableTimestamp(_))));
    }

    #[test]
    fn test_hour_snapshot() {
        let rows = hour_snapshot(&fleet(), "2022-01-15 18:30:00+00:00").unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1].project, "Tracker B");
        assert!((rows[1].loss_gw - 200.0 / 1e9).abs() < 1e-18);
        assert!((rows[1].loss_pct - 200.0 / 3.0).abs() < 1e-9);
        assert_eq!(rows[1].cod_year, Some(2015));
        assert_eq!(rows[0].loss_pct, 100.0);
        assert_eq!(rows[2].loss_pct, 0.0);
        assert!(hour_snapshot(&fleet(), "2022-03-01 00:30:00+00:00").unwrap().is_empty());
    }

    #[test]
    fn test_hour_snapshot_dark_site_and_missing_cod() {
        let mut dark = series("Dark", "Tracking", [0.0; 3], [0.0; 3]);
        dark.site.cod_year = None;
        let rows = hour_snapshot(&[dark], HOURS[1]).unwrap();
        assert_eq!(rows[0].loss_pct, 0.0);
        assert_eq!(rows[0].cod_year, None);

        let mut writer = csv::Writer::from_writer(vec![]);
        writer.serialize(&rows[0]).unwrap();
        let text = String::from_utf8(writer.into_inner().unwrap()).unwrap();
        let mut lines = text.lines();
        let header = lines.next().unwrap();
        assert!(header.contains("Solar COD Year"));
        assert!(header.ends_with("Snow Loss [%]"));
        assert!(lines.next().unwrap().contains(",Tracking,,"));
    }

    #[test]
    fn test_exclusion_and_latitude_filters() {
        let analysis = AnalysisConfig {
            excluded_sites: vec!["Tank Farm 4".into()],
            min_latitude: Some(30.0),
            ..AnalysisConfig::default()
        };
        assert!(!is_included(&site("Tank Farm 4", "Tracking", 40.0), &analysis));
        assert!(!is_included(&site("Southern", "Tracking", 28.0), &analysis));
        assert!(is_included(&site("Northern", "Tracking", 42.0), &analysis));
    }

    #[test]
    fn test_run_writes_tables() {
        let dir = tempfile::tempdir().unwrap();
        let config: Config = serde_json::from_value(serde_json::json!({
            "base_dir": dir.path(),
            "year": 2022,
            "sites": { "registry": "unused.csv" },
            "analysis": { "months": [1], "season_label": "january" }
        }))
        .unwrap();
        let dict: crate::models::site::SiteDictionary =
            [(0, site("Fixed A", "Fixed Tilt", 42.0))].into_iter().collect();
        crate::services::site_selection::write_dictionary(&config.dictionary_path(2022), &dict).unwrap();
        for scenario in Scenario::ALL {
            let path = config.utc_results_path(scenario, 2022, "Fixed A");
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(
                &path,
                "UTC,DC Inverter Input Power [W],Weather File Snow Depth,poa,tamb,Local Datetime\n\
                 2022-01-15 17:30:00+00:00,100,5,300,-2,2022-01-15 12:30:00-05:00\n",
            )
            .unwrap();
        }
        run(&config, 2022).unwrap();
        let text = std::fs::read_to_string(config.analysis_dir().join("seasonal_totals_january.csv")).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(config.analysis_dir().join("max_loss_hours.csv").exists());
    }
}
