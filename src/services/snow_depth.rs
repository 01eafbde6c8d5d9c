//! Gridded daily snow depth.
//!
//! Reads the 4 km SWE/depth NetCDF product. Only the `time`, `lat` and `lon`
//! axes are held in memory; each site reads the single grid column nearest
//! to it. Lookups snap to the nearest day, latitude and longitude
//! independently, like a nearest-neighbour selection on each axis.

use std::path::{Path, PathBuf};

use chrono::{Duration, NaiveDate, NaiveDateTime};
use netcdf::AttributeValue;
use tracing::{debug, info};

use crate::errors::{PipelineError, Result};

/// Anything that can produce the daily depth series at one location.
pub trait SnowDepthSource: Send + Sync {
    fn cell_series(&self, lat: f64, lon: f64) -> Result<CellSeries>;
}

/// Daily depth of one grid cell, in mm.
#[derive(Debug, Clone, PartialEq)]
pub struct CellSeries {
    days: Vec<NaiveDate>,
    depth_mm: Vec<f64>,
}

impl CellSeries {
    /// `days` must be ascending and the same length as `depth_mm`.
    pub fn new(days: Vec<NaiveDate>, depth_mm: Vec<f64>) -> Self {
        Self { days, depth_mm }
    }

    /// Depth in cm on the nearest day; `NaN` when the grid has no value.
    pub fn depth_cm(&self, timestamp: NaiveDateTime) -> f64 {
        nearest_day(&self.days, timestamp.date())
            .and_then(|d| self.depth_mm.get(d))
            .map_or(f64::NAN, |mm| mm / 10.0)
    }
}

#[derive(Debug, Clone)]
pub struct SnowGrid {
    path: PathBuf,
    variable: String,
    days: Vec<NaiveDate>,
    lats: Vec<f64>,
    lons: Vec<f64>,
}

impl SnowGrid {
    pub fn open(path: &Path, variable: &str) -> Result<Self> {
        if !path.exists() {
            return Err(PipelineError::MissingInput(path.to_path_buf()));
        }
        let file = netcdf::open(path)?;
        let axis = |name: &str| -> Result<Vec<f64>> {
            let var = file
                .variable(name)
                .ok_or_else(|| PipelineError::format(path, format!("no '{}' variable", name)))?;
            Ok(var.get_values::<f64, _>(..)?)
        };
        let lats = axis("lat")?;
        let lons = axis("lon")?;
        let offsets = axis("time")?;

        let time = file
            .variable("time")
            .ok_or_else(|| PipelineError::format(path, "no 'time' variable"))?;
        let units = match time.attribute("units").map(|a| a.value()).transpose()? {
            Some(AttributeValue::Str(units)) => units,
            _ => return Err(PipelineError::format(path, "'time' has no units attribute")),
        };
        let days = decode_days(&units, &offsets).ok_or_else(|| {
            PipelineError::format(path, format!("unsupported time units '{}'", units))
        })?;

        let depth = file
            .variable(variable)
            .ok_or_else(|| PipelineError::format(path, format!("no '{}' variable", variable)))?;
        let dims: Vec<String> = depth.dimensions().iter().map(|d| d.name()).collect();
        if dims != ["time", "lat", "lon"] {
            return Err(PipelineError::format(
                path,
                format!("'{}' is dimensioned {:?}, expected (time, lat, lon)", variable, dims),
            ));
        }

        info!(
            path = %path.display(),
            days = days.len(),
            lats = lats.len(),
            lons = lons.len(),
            "snow grid opened"
        );
        Ok(Self { path: path.to_path_buf(), variable: variable.to_string(), days, lats, lons })
    }
}

impl SnowDepthSource for SnowGrid {
    fn cell_series(&self, lat: f64, lon: f64) -> Result<CellSeries> {
        let (Some(la), Some(lo)) = (nearest(&self.lats, lat), nearest(&self.lons, lon)) else {
            debug!(lat, lon, "snow grid lookup outside grid");
            return Ok(CellSeries::new(self.days.clone(), vec![f64::NAN; self.days.len()]));
        };
        let file = netcdf::open(&self.path)?;
        let var = file
            .variable(&self.variable)
            .ok_or_else(|| PipelineError::format(&self.path, format!("no '{}' variable", self.variable)))?;
        let raw = var.get_values::<f64, _>([0..self.days.len(), la..la + 1, lo..lo + 1])?;

        let attr = |name: &str| var.attribute(name).and_then(|a| a.value().ok()).and_then(as_f64);
        let fill = [attr("_FillValue"), attr("missing_value")];
        let scale = attr("scale_factor").unwrap_or(1.0);
        let offset = attr("add_offset").unwrap_or(0.0);
        let depth_mm = raw
            .into_iter()
            .map(|v| {
                if !v.is_finite() || fill.contains(&Some(v)) { f64::NAN } else { v * scale + offset }
            })
            .collect();
        Ok(CellSeries::new(self.days.clone(), depth_mm))
    }
}

fn as_f64(value: AttributeValue) -> Option<f64> {
    Some(match value {
        AttributeValue::Double(v) => v,
        AttributeValue::Float(v) => v as f64,
        AttributeValue::Int(v) => v as f64,
        AttributeValue::Short(v) => v as f64,
        AttributeValue::Longlong(v) => v as f64,
        AttributeValue::Doubles(v) => *v.first()?,
        AttributeValue::Floats(v) => *v.first()? as f64,
        _ => return None,
    })
}

/// Decodes CF time offsets such as `days since 1900-01-01 00:00:00`.
fn decode_days(units: &str, offsets: &[f64]) -> Option<Vec<NaiveDate>> {
    let (unit, base) = units.trim().split_once(" since ")?;
    let step_s = match unit.trim().to_lowercase().as_str() {
        "days" | "day" => 86_400.0,
        "hours" | "hour" => 3_600.0,
        "minutes" | "minute" => 60.0,
        "seconds" | "second" => 1.0,
        _ => return None,
    };
    let base = base.trim();
    let start = NaiveDateTime::parse_from_str(base.get(..19).unwrap_or(base), "%Y-%m-%d %H:%M:%S")
        .ok()
        .or_else(|| NaiveDate::parse_from_str(base.get(..10)?, "%Y-%m-%d").ok()?.and_hms_opt(0, 0, 0))?;
    offsets
        .iter()
        .map(|o| {
            o.is_finite()
                .then(|| (start + Duration::seconds((o * step_s).round() as i64)).date())
        })
        .collect()
}

/// Index of the closest axis value; ties go to the larger value. The axis
/// may be ascending or descending.
fn nearest(axis: &[f64], value: f64) -> Option<usize> {
    if !value.is_finite() {
        return None;
    }
    axis.iter()
        .copied()
        .enumerate()
        .filter(|&(_, v)| v.is_finite())
        .min_by(|&(_, a), &(_, b)| (a - value).abs().total_cmp(&(b - value).abs()).then_with(|| b.total_cmp(&a)))
        .map(|(i, _)| i)
}

fn nearest_day(days: &[NaiveDate], day: NaiveDate) -> Option<usize> {
    if days.is_empty() {
        return None;
    }
    let i = days.partition_point(|&d| d < day);
    if i == 0 {
        return Some(0);
    }
    if i == days.len() {
        return Some(days.len() - 1);
    }
    let before = (day - days[i - 1]).num_days();
    let after = (days[i] - day).num_days();
    if before < after { Some(i - 1) } else { Some(i) }
}
