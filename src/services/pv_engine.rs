/// ============================================================
///  Hourly PV performance engine (PVWatts-style)
///
///  Algorithm pipeline, once per weather row:
///   1. Solar geometry  – declination, equation of time, hour angle,
///                        elevation angle, azimuth angle
///   2. Array orientation – fixed plane, or a horizontal N-S single-axis
///                        tracker with backtracking-free true tracking
///   3. Plane-of-array irradiance – beam + isotropic sky diffuse +
///                        ground reflected (weather-file albedo)
///   4. Cell temperature  – Faiman model with measured wind speed
///   5. Snow coverage     – Marion-style: new snow covers, panels shed
///                        snow by sliding when warm enough, melt-out clears
///   6. DC power          – P = P_nom × (G_poa/1000) × η_temp × (1 − losses)
///                        × (1 − snow derate)
///   7. AC power          – inverter efficiency, clipped at AC nameplate
/// ============================================================
use std::f64::consts::PI;
use std::path::Path;

use chrono::{Datelike, NaiveDate, Timelike};

use crate::errors::{PipelineError, Result};
use crate::models::results::EngineOutputs;
use crate::models::weather::{WeatherMetadata, WeatherRecord};

// ─── Physical constants ──────────────────────────────────────
const DEG: f64 = PI / 180.0;
const FAIMAN_U0: f64 = 25.0;
const FAIMAN_U1: f64 = 6.84;
const DEFAULT_ALBEDO: f64 = 0.2;
/// Depth increase (cm) that counts as a new snowfall.
const NEW_SNOW_CM: f64 = 1.0;
/// Sliding threshold slope: snow slides when T_amb > −G_poa / 80.
const SLIDE_M: f64 = 80.0;

// ─── System design ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ArrayType {
    FixedOpenRack,
    FixedRoof,
    SingleAxis,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SystemDesign {
    pub system_capacity_kw: f64,
    pub array_type: ArrayType,
    pub tilt_deg: f64,
    pub azimuth_deg: f64,
    /// Tracker rotation limit (degrees either side of horizontal).
    pub rotation_limit_deg: f64,
    pub dc_ac_ratio: f64,
    pub inverter_efficiency: f64,
    /// Total system losses, percent.
    pub losses_pct: f64,
    /// Power temperature coefficient, 1/°C.
    pub gamma_pdc: f64,
    pub snow_model: bool,
    pub roof_slide_coefficient: f64,
}

impl Default for SystemDesign {
    fn default() -> Self {
        Self {
            system_capacity_kw: 4.0,
            array_type: ArrayType::FixedRoof,
            tilt_deg: 20.0,
            azimuth_deg: 180.0,
            rotation_limit_deg: 45.0,
            dc_ac_ratio: 1.15,
            inverter_efficiency: 0.96,
            losses_pct: 14.0757,
            gamma_pdc: -0.0037,
            snow_model: false,
            roof_slide_coefficient: 1.97,
        }
    }
}

// ─── Weather input ───────────────────────────────────────────

/// An engine-ready weather file: metadata block plus hourly rows.
#[derive(Debug, Clone)]
pub struct WeatherFile {
    pub latitude: f64,
    pub longitude: f64,
    /// Standard-time UTC offset of the timestamps, hours.
    pub time_zone: f64,
    pub records: Vec<WeatherRecord>,
}

impl WeatherFile {
    /// Reads the three-header-line format written by enrichment.
    pub fn read(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(PipelineError::MissingInput(path.to_path_buf()));
        }
        let bad = |msg: String| PipelineError::format(path, msg);
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_path(path)?;
        let mut rows = reader.records();
        let keys = rows.next().ok_or_else(|| bad("empty file".into()))??;
        let values = rows.next().ok_or_else(|| bad("missing metadata values".into()))??;
        let metadata = WeatherMetadata {
            fields: keys.iter().zip(values.iter()).map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        };
        let meta_f64 = |key: &str| metadata.get(key).and_then(|v| v.parse::<f64>().ok());
        let latitude = meta_f64("Latitude").ok_or_else(|| bad("metadata has no Latitude".into()))?;
        let longitude = meta_f64("Longitude").ok_or_else(|| bad("metadata has no Longitude".into()))?;
        let time_zone = meta_f64("Time Zone").unwrap_or_else(|| (longitude / 15.0).round());

        let header = rows.next().ok_or_else(|| bad("missing column header".into()))??;
        let column = |name: &str| header.iter().position(|h| h.eq_ignore_ascii_case(name));
        let required = |name: &str| column(name).ok_or_else(|| bad(format!("missing column {}", name)));
        let (year_c, month_c, day_c, hour_c, minute_c) =
            (required("Year")?, required("Month")?, required("Day")?, required("Hour")?, required("Minute")?);
        let cols = [
            column("DHI"),
            column("DNI"),
            column("GHI"),
            column("Dew Point"),
            column("Temperature"),
            column("Pressure"),
            column("Wind Direction"),
            column("Wind Speed"),
            column("Surface Albedo"),
            column("snow depth"),
        ];

        let mut records = Vec::with_capacity(8760);
        for (line, row) in rows.enumerate() {
            let row = row?;
            let int = |idx: usize| -> Result<u32> {
                row.get(idx)
                    .and_then(|v| v.parse::<f64>().ok())
                    .map(|v| v as u32)
                    .ok_or_else(|| bad(format!("non-numeric time field on data row {}", line + 1)))
            };
            let value = |idx: Option<usize>| -> Option<f64> {
                idx.and_then(|i| row.get(i)).and_then(|v| v.parse::<f64>().ok())
            };
            let timestamp = NaiveDate::from_ymd_opt(int(year_c)? as i32, int(month_c)?, int(day_c)?)
                .and_then(|d| d.and_hms_opt(int(hour_c).ok()?, int(minute_c).ok()?, 0))
                .ok_or_else(|| bad(format!("invalid timestamp on data row {}", line + 1)))?;
            let v = cols.map(|c| value(c).unwrap_or(f64::NAN));
            records.push(WeatherRecord {
                timestamp,
                dhi: v[0],
                dni: v[1],
                ghi: v[2],
                dew_point: v[3],
                temp_air: v[4],
                surface_pressure: v[5],
                wind_direction: v[6],
                wind_speed: v[7],
                surface_albedo: v[8],
                snow_depth: value(cols[9]),
            });
        }
        Ok(Self { latitude, longitude, time_zone, records })
    }
}

// ─── Engine seam ─────────────────────────────────────────────

/// A PV performance model. Every output series has exactly one value per
/// weather row.
pub trait SimulationEngine: Send + Sync {
    fn execute(&self, design: &SystemDesign, weather: &WeatherFile) -> Result<EngineOutputs>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PvWattsEngine;

impl SimulationEngine for PvWattsEngine {
    fn execute(&self, design: &SystemDesign, weather: &WeatherFile) -> Result<EngineOutputs> {
        if !(design.system_capacity_kw.is_finite() && design.system_capacity_kw > 0.0) {
            return Err(PipelineError::Engine(format!(
                "system capacity must be positive, got {}",
                design.system_capacity_kw
            )));
        }
        let n = weather.records.len();
        let mut out = EngineOutputs::with_capacity(n);
        let mut snow = SnowCover::default();
        let snow_tilt = match design.array_type {
            ArrayType::SingleAxis => design.rotation_limit_deg,
            _ => design.tilt_deg,
        };

        let nameplate_w = design.system_capacity_kw * 1000.0;
        let ac_limit_w = nameplate_w / design.dc_ac_ratio;
        let loss_factor = 1.0 - design.losses_pct / 100.0;

        for record in &weather.records {
            let sun = solar_position(record, weather.latitude, weather.longitude, weather.time_zone);
            let (surface_tilt, surface_azimuth) = orientation(design, &sun);
            let poa = plane_of_array(record, &sun, surface_tilt, surface_azimuth);

            let tamb = finite_or(record.temp_air, 0.0);
            let wind = finite_or(record.wind_speed, 0.0).max(0.0);
            let cell_temp = tamb + poa / (FAIMAN_U0 + FAIMAN_U1 * wind);

            let depth = finite_or(record.snow_depth.unwrap_or(f64::NAN), 0.0);
            let derate = if design.snow_model {
                snow.step(depth, tamb, poa, snow_tilt, design.roof_slide_coefficient)
            } else {
                0.0
            };

            let temp_factor = 1.0 + design.gamma_pdc * (cell_temp - 25.0);
            let dc = (nameplate_w * (poa / 1000.0) * temp_factor * loss_factor * (1.0 - derate)).max(0.0);
            let ac = (dc * design.inverter_efficiency).min(ac_limit_w).max(0.0);

            out.ac.push(ac);
            out.dc.push(dc);
            out.dc_snow_derate.push(derate * 100.0);
            out.generation.push(ac / 1000.0);
            out.snow.push(depth);
            out.poa.push(poa);
            out.tamb.push(tamb);

            #[cfg(feature = "verbose_log")]
            tracing::debug!(
                timestamp = %record.timestamp,
                elevation = sun.elevation_deg,
                poa,
                cell_temp,
                derate,
                dc,
                ac,
                "engine step"
            );
        }
        Ok(out)
    }
}

#[inline]
fn finite_or(v: f64, fallback: f64) -> f64 {
    if v.is_finite() { v } else { fallback }
}

// ─── Solar geometry ──────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct SunPosition {
    pub elevation_deg: f64,
    /// Degrees from North, clockwise.
    pub azimuth_deg: f64,
}

impl SunPosition {
    pub fn zenith_deg(&self) -> f64 {
        90.0 - self.elevation_deg
    }
}

/// Sun position for a row stamped in local standard time.
pub fn solar_position(record: &WeatherRecord, lat_deg: f64, lon_deg: f64, tz_hours: f64) -> SunPosition {
    let ts = record.timestamp;
    let doy = ts.ordinal() as f64;
    let clock_h = ts.hour() as f64 + ts.minute() as f64 / 60.0 + ts.second() as f64 / 3600.0;

    // a) Declination (Spencer 1971)
    let b = 2.0 * PI * (doy - 1.0) / 365.0;
    let decl = 0.006918 - 0.399912 * b.cos() + 0.070257 * b.sin() - 0.006758 * (2.0 * b).cos()
        + 0.000907 * (2.0 * b).sin()
        - 0.002697 * (3.0 * b).cos()
        + 0.00148 * (3.0 * b).sin();

    // b) Equation of time (minutes, Spencer 1971)
    let eot_min = 229.18
        * (0.000075 + 0.001868 * b.cos() - 0.032077 * b.sin() - 0.014615 * (2.0 * b).cos()
            - 0.04089 * (2.0 * b).sin());

    // c) Local solar time from the file's standard meridian
    let lst_h = clock_h + (4.0 * (lon_deg - 15.0 * tz_hours) + eot_min) / 60.0;

    // d) Hour angle, negative in the morning
    let omega_deg = 15.0 * (lst_h - 12.0);
    let omega = omega_deg * DEG;

    let lat = lat_deg * DEG;
    let sin_alpha = lat.sin() * decl.sin() + lat.cos() * decl.cos() * omega.cos();
    let alpha = sin_alpha.clamp(-1.0, 1.0).asin();

    let cos_az = if alpha.cos().abs() > 1e-9 && lat.cos().abs() > 1e-9 {
        (decl.sin() - sin_alpha * lat.sin()) / (alpha.cos() * lat.cos())
    } else {
        0.0
    };
    let az_abs = cos_az.clamp(-1.0, 1.0).acos() / DEG;
    let azimuth_deg = if omega_deg > 0.0 { 360.0 - az_abs } else { az_abs };

    SunPosition { elevation_deg: alpha / DEG, azimuth_deg }
}

/// Surface tilt and azimuth for this hour.
fn orientation(design: &SystemDesign, sun: &SunPosition) -> (f64, f64) {
    match design.array_type {
        ArrayType::FixedOpenRack | ArrayType::FixedRoof => (design.tilt_deg, design.azimuth_deg),
        ArrayType::SingleAxis => {
            if sun.elevation_deg <= 0.0 {
                return (0.0, 90.0);
            }
            let zen = sun.zenith_deg() * DEG;
            let az = sun.azimuth_deg * DEG;
            // Rotation about a horizontal N-S axis, positive toward the east.
            let rotation = (zen.sin() * az.sin()).atan2(zen.cos()) / DEG;
            let tilt = rotation.abs().min(design.rotation_limit_deg);
            let facing = if rotation >= 0.0 { 90.0 } else { 270.0 };
            (tilt, facing)
        }
    }
}

fn plane_of_array(record: &WeatherRecord, sun: &SunPosition, tilt_deg: f64, surface_az_deg: f64) -> f64 {
    let dni = finite_or(record.dni, 0.0).max(0.0);
    let dhi = finite_or(record.dhi, 0.0).max(0.0);
    let ghi = finite_or(record.ghi, 0.0).max(0.0);
    let albedo = match record.surface_albedo {
        a if a.is_finite() && a > 0.0 && a < 1.0 => a,
        _ => DEFAULT_ALBEDO,
    };

    let tilt = tilt_deg * DEG;
    let beam = if sun.elevation_deg > 0.0 {
        let zen = sun.zenith_deg() * DEG;
        let cos_aoi = zen.cos() * tilt.cos()
            + zen.sin() * tilt.sin() * ((sun.azimuth_deg - surface_az_deg) * DEG).cos();
        dni * cos_aoi.max(0.0)
    } else {
        0.0
    };
    let sky = dhi * (1.0 + tilt.cos()) / 2.0;
    let ground = ghi * albedo * (1.0 - tilt.cos()) / 2.0;
    (beam + sky + ground).max(0.0)
}

// ─── Snow coverage ───────────────────────────────────────────

/// Fraction of the array covered by snow, carried hour to hour.
#[derive(Debug, Clone, Copy, Default)]
struct SnowCover {
    coverage: f64,
    last_depth: f64,
}

impl SnowCover {
    /// Advances one hour and returns the coverage used as DC derate.
    fn step(&mut self, depth_cm: f64, tamb: f64, poa: f64, tilt_deg: f64, slide_coefficient: f64) -> f64 {
        if depth_cm <= 0.0 {
            self.coverage = 0.0;
        } else if depth_cm - self.last_depth >= NEW_SNOW_CM {
            self.coverage = 1.0;
        } else if self.coverage > 0.0 && tamb + poa / SLIDE_M > 0.0 {
            let slide = slide_coefficient * (tilt_deg * DEG).sin() * 0.1;
            self.coverage = (self.coverage - slide).max(0.0);
        }
        self.last_depth = depth_cm;
        self.coverage
    }
}
