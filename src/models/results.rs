use serde::{Deserialize, Serialize};

// ─── Scenarios ───────────────────────────────────────────────────────────────

/// The two simulation runs made for every site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scenario {
    /// Snow model on, using the roof-slide coefficient.
    RoofSlideCoeff,
    /// Snow model off.
    NoSnow,
}

impl Scenario {
    pub const ALL: [Scenario; 2] = [Scenario::RoofSlideCoeff, Scenario::NoSnow];

    pub fn dir_name(self) -> &'static str {
        match self {
            Scenario::RoofSlideCoeff => "Roof_Slide_Coeff",
            Scenario::NoSnow => "No_Snow",
        }
    }

    pub fn snow_model_enabled(self) -> bool {
        matches!(self, Scenario::RoofSlideCoeff)
    }
}

impl std::fmt::Display for Scenario {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Local-time column shared by result and stitched files.
pub const COL_LOCAL: &str = "Local Datetime";

/// Hourly engine outputs for one run, one value per weather row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineOutputs {
    /// AC inverter output (W)
    pub ac: Vec<f64>,
    /// DC inverter input (W)
    pub dc: Vec<f64>,
    /// DC loss due to snow (%)
    pub dc_snow_derate: Vec<f64>,
    /// System power generated (kW)
    pub generation: Vec<f64>,
    /// Snow depth seen by the model (cm)
    pub snow: Vec<f64>,
    /// Plane-of-array irradiance (W/m²)
    pub poa: Vec<f64>,
    /// Ambient temperature (°C)
    pub tamb: Vec<f64>,
}

impl EngineOutputs {
    pub fn with_capacity(n: usize) -> Self {
        Self {
            ac: Vec::with_capacity(n),
            dc: Vec::with_capacity(n),
            dc_snow_derate: Vec::with_capacity(n),
            generation: Vec::with_capacity(n),
            snow: Vec::with_capacity(n),
            poa: Vec::with_capacity(n),
            tamb: Vec::with_capacity(n),
        }
    }
}

/// One row of a local-time simulation result file.
#[derive(Debug, Clone, Serialize)]
pub struct ResultRow {
    #[serde(rename = "UTC")]
    pub utc: String,
    #[serde(rename = "AC Inverter Output Power [W]")]
    pub ac_w: f64,
    #[serde(rename = "DC Inverter Input Power [W]")]
    pub dc_w: f64,
    #[serde(rename = "DC Power Loss Due to Snow [%]")]
    pub dc_snow_derate_pct: f64,
    #[serde(rename = "System Power Generated [kW]")]
    pub generation_kw: f64,
    #[serde(rename = "Weather File Snow Depth")]
    pub snow_depth_cm: f64,
    #[serde(rename = "poa")]
    pub poa: f64,
    #[serde(rename = "tamb")]
    pub tamb: f64,
    #[serde(rename = "Local Datetime")]
    pub local: String,
}

/// The columns analysis reads back from a stitched UTC file.
#[derive(Debug, Clone, Deserialize)]
pub struct StitchedRow {
    #[serde(rename = "UTC")]
    pub utc: String,
    #[serde(rename = "DC Inverter Input Power [W]")]
    pub dc_w: f64,
    #[serde(rename = "Weather File Snow Depth", default)]
    pub snow_depth_cm: f64,
    #[serde(rename = "poa", default)]
    pub poa: f64,
    #[serde(rename = "tamb", default)]
    pub tamb: f64,
    #[serde(rename = "Local Datetime", default)]
    pub local: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scenario_names() {
        assert_eq!(Scenario::RoofSlideCoeff.to_string(), "Roof_Slide_Coeff");
        assert!(Scenario::RoofSlideCoeff.snow_model_enabled());
        assert!(!Scenario::NoSnow.snow_model_enabled());
    }

    #[test]
    fn test_result_row_header_order() {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer
            .serialize(ResultRow {
                utc: "2022-01-01 05:30:00+00:00".into(),
                ac_w: 0.0,
                dc_w: 0.0,
                dc_snow_derate_pct: 0.0,
                generation_kw: 0.0,
                snow_depth_cm: 3.0,
                poa: 0.0,
                tamb: -2.0,
                local: "2022-01-01 00:30:00 -0500".into(),
            })
            .unwrap();
        let text = String::from_utf8(writer.into_inner().unwrap()).unwrap();
        let header = text.lines().next().unwrap();
        let expected = [
            "UTC",
            "AC Inverter Output Power [W]",
            "DC Inverter Input Power [W]",
            "DC Power Loss Due to Snow [%]",
            "System Power Generated [kW]",
            "Weather File Snow Depth",
            "poa",
            "tamb",
            COL_LOCAL,
        ]
        .join(",");
        assert_eq!(header, expected);
    }
}
