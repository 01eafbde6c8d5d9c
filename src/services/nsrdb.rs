//! NSRDB PSM3 client.
//!
//! Downloads one year of hourly irradiance/meteorology for one location as
//! CSV. The body starts with two metadata lines (keys, values), followed by
//! the data table whose first five columns are `Year,Month,Day,Hour,Minute`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::{Client, StatusCode};
use tracing::debug;

use crate::config::NsrdbConfig;
use crate::errors::{PipelineError, Result};
use crate::models::weather::{WeatherDownload, WeatherMetadata, WeatherRecord};
use crate::services::acquisition::{SiteLocation, WeatherProvider};

const ATTRIBUTES: &str =
    "dhi,dni,air_temperature,ghi,dew_point,surface_pressure,wind_direction,wind_speed,surface_albedo";
const RATE_LIMIT_MARKER: &str = "OVER_RATE_LIMIT";

pub struct NsrdbClient {
    client: Client,
    url: String,
    api_key: String,
    email: String,
}

impl NsrdbClient {
    pub fn new(config: &NsrdbConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_s))
            .build()?;
        Ok(Self {
            client,
            url: config.url.clone(),
            api_key: config.resolve_api_key()?,
            email: config.email.clone(),
        })
    }
}

#[async_trait]
impl WeatherProvider for NsrdbClient {
    async fn fetch(&self, site: &SiteLocation, year: i32) -> Result<WeatherDownload> {
        let wkt = format!("POINT({} {})", site.longitude, site.latitude);
        let year = year.to_string();
        let resp = self
            .client
            .get(&self.url)
            .query(&[
                ("api_key", self.api_key.as_str()),
                ("email", self.email.as_str()),
                ("wkt", wkt.as_str()),
                ("names", year.as_str()),
                ("attributes", ATTRIBUTES),
                ("leap_day", "false"),
                ("interval", "60"),
                ("utc", "false"),
            ])
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(classify_error(status, &body));
        }
        debug!(project = %site.project_name, bytes = body.len(), "PSM3 response received");
        parse_psm3(&body)
    }
}

/// Maps a failed response onto the rate-limit / provider split.
pub fn classify_error(status: StatusCode, body: &str) -> PipelineError {
    let text = format!("{}: {}", status, body.trim());
    if status == StatusCode::TOO_MANY_REQUESTS || body.contains(RATE_LIMIT_MARKER) {
        PipelineError::RateLimited(text)
    } else {
        PipelineError::Provider(text)
    }
}

/// Parses a PSM3 CSV body into metadata and hourly records.
pub fn parse_psm3(body: &str) -> Result<WeatherDownload> {
    let bad = |msg: &str| PipelineError::format("PSM3 response", msg);

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(body.as_bytes());
    let mut rows = reader.records();

    let keys = rows.next().ok_or_else(|| bad("empty body"))??;
    let values = rows.next().ok_or_else(|| bad("missing metadata values"))??;
    let metadata = WeatherMetadata {
        fields: keys
            .iter()
            .zip(values.iter())
            .filter(|(k, _)| !k.is_empty())
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    };

    let header = rows.next().ok_or_else(|| bad("missing data header"))??;
    let column = |name: &str| header.iter().position(|h| h == name);
    let time_cols = ["Year", "Month", "Day", "Hour", "Minute"]
        .map(|name| column(name).ok_or_else(|| bad(&format!("missing column {}", name))));
    let [year_c, month_c, day_c, hour_c, minute_c] = match time_cols {
        [Ok(a), Ok(b), Ok(c), Ok(d), Ok(e)] => [a, b, c, d, e],
        _ => return Err(bad("missing time columns")),
    };
    let channel = |name: &str| column(name);
    let dhi_c = channel("DHI");
    let dni_c = channel("DNI");
    let ghi_c = channel("GHI");
    let dew_c = channel("Dew Point");
    let temp_c = channel("Temperature");
    let pres_c = channel("Pressure");
    let wdir_c = channel("Wind Direction");
    let wspd_c = channel("Wind Speed");
    let alb_c = channel("Surface Albedo");

    let mut records = Vec::with_capacity(8760);
    for row in rows {
        let row = row?;
        let int = |idx: usize| -> Result<u32> {
            row.get(idx)
                .and_then(|v| v.parse::<f64>().ok())
                .map(|v| v as u32)
                .ok_or_else(|| bad("non-numeric time field"))
        };
        let value = |idx: Option<usize>| -> f64 {
            idx.and_then(|i| row.get(i))
                .and_then(|v| v.parse::<f64>().ok())
                .unwrap_or(f64::NAN)
        };
        let date = NaiveDate::from_ymd_opt(int(year_c)? as i32, int(month_c)?, int(day_c)?)
            .ok_or_else(|| bad("invalid date"))?;
        let timestamp = date
            .and_hms_opt(int(hour_c)?, int(minute_c)?, 0)
            .ok_or_else(|| bad("invalid time of day"))?;
        records.push(WeatherRecord {
            timestamp,
            dhi: value(dhi_c),
            dni: value(dni_c),
            ghi: value(ghi_c),
            dew_point: value(dew_c),
            temp_air: value(temp_c),
            surface_pressure: value(pres_c),
            wind_direction: value(wdir_c),
            wind_speed: value(wspd_c),
            surface_albedo: value(alb_c),
            snow_depth: None,
        });
    }

    if records.is_empty() {
        return Err(bad("no data rows"));
    }
    Ok(WeatherDownload { metadata, records })
}
