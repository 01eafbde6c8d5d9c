use chrono::{Datelike, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};

/// One hourly row of provider weather, local standard time.
///
/// Channel names follow the provider's mapped variable names. Missing
/// channels are `NaN`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WeatherRecord {
    pub timestamp: NaiveDateTime,
    pub dhi: f64,
    pub dni: f64,
    pub ghi: f64,
    pub dew_point: f64,
    pub temp_air: f64,
    pub surface_pressure: f64,
    pub wind_direction: f64,
    pub wind_speed: f64,
    pub surface_albedo: f64,
    /// Snow depth in cm, present once the series has been enriched.
    #[serde(default)]
    pub snow_depth: Option<f64>,
}

/// Header of the engine-ready weather file, in column order.
pub const ENGINE_WEATHER_HEADERS: [&str; 15] = [
    "Year", "Month", "Day", "Hour", "Minute", "DHI", "DNI", "GHI", "Dew Point",
    "Temperature", "Pressure", "Wind Direction", "Wind Speed", "Surface Albedo", "snow depth",
];

impl WeatherRecord {
    /// Row values in `ENGINE_WEATHER_HEADERS` order.
    pub fn engine_fields(&self) -> Vec<String> {
        let ts = self.timestamp;
        let snow = match self.snow_depth {
            Some(v) if v.is_finite() => v.to_string(),
            _ => String::new(),
        };
        vec![
            ts.year().to_string(),
            ts.month().to_string(),
            ts.day().to_string(),
            ts.hour().to_string(),
            ts.minute().to_string(),
            fmt_channel(self.dhi),
            fmt_channel(self.dni),
            fmt_channel(self.ghi),
            fmt_channel(self.dew_point),
            fmt_channel(self.temp_air),
            fmt_channel(self.surface_pressure),
            fmt_channel(self.wind_direction),
            fmt_channel(self.wind_speed),
            fmt_channel(self.surface_albedo),
            snow,
        ]
    }
}

fn fmt_channel(v: f64) -> String {
    if v.is_finite() { v.to_string() } else { String::new() }
}

/// Provider metadata block, kept in the provider's field order.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WeatherMetadata {
    pub fields: Vec<(String, String)>,
}

impl WeatherMetadata {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(k, _)| k.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(_, v)| v.as_str())
    }
}

/// A complete provider response for one site and year.
#[derive(Debug, Clone)]
pub struct WeatherDownload {
    pub metadata: WeatherMetadata,
    pub records: Vec<WeatherRecord>,
}
