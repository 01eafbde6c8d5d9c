use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

// ─── Site registry row ───────────────────────────────────────────────────────

/// One utility-scale PV project from the site registry.
///
/// Field names follow the registry's column headers so the same type reads
/// the registry CSV and the site dictionary JSON.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SiteRecord {
    #[serde(rename = "Project Name")]
    pub project_name: String,
    #[serde(rename = "State", default)]
    pub state: String,
    #[serde(rename = "Region", default)]
    pub region: String,
    #[serde(rename = "Latitude")]
    pub latitude: f64,
    #[serde(rename = "Longitude")]
    pub longitude: f64,
    #[serde(rename = "Solar Capacity MW-DC", default, deserialize_with = "csv::invalid_option")]
    pub capacity_mw_dc: Option<f64>,
    #[serde(rename = "Tracking Type", default)]
    pub tracking_type: String,
    #[serde(rename = "Mount", default)]
    pub mount: String,
    /// Raw tilt text; the registry leaves it blank for many sites.
    #[serde(rename = "Tilt", default)]
    pub tilt: String,
    #[serde(rename = "Solar COD Year", default, deserialize_with = "lenient_year")]
    pub cod_year: Option<i32>,
}

impl SiteRecord {
    /// Tilt in degrees, or `None` when the registry leaves it blank.
    pub fn tilt_degrees(&self) -> Option<f64> {
        self.tilt.trim().parse::<f64>().ok().filter(|t| t.is_finite())
    }

    pub fn tracking(&self) -> TrackingType {
        TrackingType::from_label(&self.tracking_type)
    }

    pub fn mount_class(&self) -> MountClass {
        MountClass::from_label(&self.mount)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum YearField {
    Int(i64),
    Float(f64),
    Text(String),
}

/// COD years arrive as `2015`, `2015.0` or blank depending on the export.
fn lenient_year<'de, D>(deserializer: D) -> Result<Option<i32>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<YearField> = Option::deserialize(deserializer)?;
    Ok(match raw {
        Some(YearField::Int(v)) => i32::try_from(v).ok(),
        Some(YearField::Float(v)) if v.is_finite() => Some(v.round() as i32),
        Some(YearField::Text(s)) => s.trim().parse::<f64>().ok().map(|v| v.round() as i32),
        _ => None,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingType {
    FixedTilt,
    SingleAxis,
    Other,
}

impl TrackingType {
    pub fn from_label(label: &str) -> Self {
        match label.trim() {
            "Fixed Tilt" => TrackingType::FixedTilt,
            "Single Axis" => TrackingType::SingleAxis,
            _ => TrackingType::Other,
        }
    }
}

/// Mount grouping used by the fleet aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MountClass {
    Tracking,
    FixedTilt,
    Other,
}

impl MountClass {
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_lowercase().as_str() {
            "tracking" => MountClass::Tracking,
            "fixed tilt" => MountClass::FixedTilt,
            _ => MountClass::Other,
        }
    }
}

// ─── Site dictionary ─────────────────────────────────────────────────────────

/// Index → site mapping written once by site selection and read by every
/// later stage.
pub type SiteDictionary = BTreeMap<usize, SiteRecord>;
