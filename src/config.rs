use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::errors::{PipelineError, Result};
use crate::models::results::Scenario;

fn default_title() -> String { "Eastern Interconnect".to_string() }
fn default_drop_trailing() -> usize { 19 }
fn default_all() -> Vec<String> { vec!["All".to_string()] }
fn default_regions() -> Vec<String> {
    ["PJM", "MISO", "ISO-NE", "NYISO", "SPP", "Southeast (non-ISO)"]
        .iter()
        .map(|r| r.to_string())
        .collect()
}
fn default_true() -> bool { true }
fn default_api_key_env() -> String { "NSRDB_API_KEY".to_string() }
fn default_nsrdb_url() -> String {
    "https://developer.nrel.gov/api/nsrdb/v2/solar/psm3-download.csv".to_string()
}
fn default_request_timeout_s() -> u64 { 120 }
fn default_fetch_concurrency() -> usize { 10 }
fn default_enrich_concurrency() -> usize { 20 }
fn default_cooldown_s() -> u64 { 60 }
fn default_error_delay_s() -> u64 { 10 }
fn default_snow_dir() -> PathBuf { PathBuf::from("Data/Snow Data") }
fn default_snow_template() -> String { "4km_SWE_Depth_WY{year}_v01.nc".to_string() }
fn default_snow_variable() -> String { "DEPTH".to_string() }
fn default_months() -> Vec<u32> { (1..=12).collect() }
fn default_season_label() -> String { "all".to_string() }

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Root of the study's directory tree (weather cache, results, logs).
    pub base_dir: PathBuf,
    pub year: i32,
    #[serde(default = "default_title")]
    pub title: String,
    pub sites: SiteSelectionConfig,
    #[serde(default)]
    pub nsrdb: NsrdbConfig,
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    #[serde(default)]
    pub snow: SnowConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub stitch: StitchConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SiteSelectionConfig {
    /// Master site registry spreadsheet (CSV export).
    pub registry: PathBuf,
    /// Trailing registry columns that carry no site attributes.
    #[serde(default = "default_drop_trailing")]
    pub drop_trailing_columns: usize,
    #[serde(default = "default_regions")]
    pub regions: Vec<String>,
    #[serde(default = "default_all")]
    pub tracking_types: Vec<String>,
    #[serde(default = "default_all")]
    pub states: Vec<String>,
    /// Keep only sites in commercial operation by the analysis year.
    #[serde(default = "default_true")]
    pub operating_by_year: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct NsrdbConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default)]
    pub email: String,
    #[serde(default = "default_nsrdb_url")]
    pub url: String,
    #[serde(default = "default_request_timeout_s")]
    pub request_timeout_s: u64,
}

impl Default for NsrdbConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_key_env: default_api_key_env(),
            email: String::new(),
            url: default_nsrdb_url(),
            request_timeout_s: default_request_timeout_s(),
        }
    }
}

impl NsrdbConfig {
    /// API key from the config file, or from the configured environment variable.
    pub fn resolve_api_key(&self) -> Result<String> {
        if !self.api_key.is_empty() {
            return Ok(self.api_key.clone());
        }
        std::env::var(&self.api_key_env).map_err(|_| {
            PipelineError::Config(format!(
                "no NSRDB api key in config and ${} is not set",
                self.api_key_env
            ))
        })
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AcquisitionConfig {
    #[serde(default = "default_fetch_concurrency")]
    pub max_in_flight: usize,
    #[serde(default = "default_cooldown_s")]
    pub rate_limit_cooldown_s: u64,
    #[serde(default = "default_error_delay_s")]
    pub error_delay_s: u64,
    #[serde(default = "default_enrich_concurrency")]
    pub enrich_concurrency: usize,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            max_in_flight: default_fetch_concurrency(),
            rate_limit_cooldown_s: default_cooldown_s(),
            error_delay_s: default_error_delay_s(),
            enrich_concurrency: default_enrich_concurrency(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SnowConfig {
    #[serde(default = "default_snow_dir")]
    pub grid_dir: PathBuf,
    /// NetCDF file of the gridded depth product; `{year}` is substituted.
    #[serde(default = "default_snow_template")]
    pub grid_file: String,
    /// Depth variable in the grid, dimensioned `(time, lat, lon)`, in mm.
    #[serde(default = "default_snow_variable")]
    pub variable: String,
}

impl Default for SnowConfig {
    fn default() -> Self {
        Self {
            grid_dir: default_snow_dir(),
            grid_file: default_snow_template(),
            variable: default_snow_variable(),
        }
    }
}

/// Engine parameters that are not site specific. Unset values keep the
/// engine defaults.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct EngineConfig {
    pub dc_ac_ratio: Option<f64>,
    pub inverter_efficiency: Option<f64>,
    pub system_losses: Option<f64>,
    pub roof_slide_coefficient: Option<f64>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MissingAdjacentPolicy {
    /// A missing prior/next year file contributes no rows.
    #[default]
    ContributeNothing,
    /// A missing prior/next year file skips the whole site.
    SkipSite,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StitchConfig {
    #[serde(default)]
    pub missing_adjacent: MissingAdjacentPolicy,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SnowEventConfig {
    pub site: String,
    /// Local-time window bounds, e.g. `2014-01-10 00:30:00-05:00`.
    pub start: String,
    pub end: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnalysisConfig {
    pub start_year: Option<i32>,
    pub end_year: Option<i32>,
    #[serde(default = "default_months")]
    pub months: Vec<u32>,
    #[serde(default = "default_season_label")]
    pub season_label: String,
    #[serde(default)]
    pub min_latitude: Option<f64>,
    /// Projects left out of every aggregate.
    #[serde(default)]
    pub excluded_sites: Vec<String>,
    #[serde(default)]
    pub snow_event: Option<SnowEventConfig>,
    /// UTC hour for the per-site snapshot table, e.g. `2022-02-01 18:30:00+00:00`.
    #[serde(default)]
    pub snapshot_utc: Option<String>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            start_year: None,
            end_year: None,
            months: default_months(),
            season_label: default_season_label(),
            min_latitude: None,
            excluded_sites: Vec::new(),
            snow_event: None,
            snapshot_utc: None,
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|_| PipelineError::MissingInput(path.to_path_buf()))?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.acquisition.max_in_flight == 0 {
            return Err(PipelineError::Config("acquisition.max_in_flight must be at least 1".into()));
        }
        if self.analysis.months.iter().any(|m| !(1..=12).contains(m)) {
            return Err(PipelineError::Config("analysis.months must be within 1..=12".into()));
        }
        Ok(())
    }

    pub fn rate_limit_cooldown(&self) -> Duration {
        Duration::from_secs(self.acquisition.rate_limit_cooldown_s)
    }

    pub fn error_delay(&self) -> Duration {
        Duration::from_secs(self.acquisition.error_delay_s)
    }

    // ─── File-system layout ─────────────────────────────────────────────────

    pub fn log_dir(&self) -> PathBuf {
        self.base_dir.join("log_files")
    }

    pub fn dictionary_path(&self, year: i32) -> PathBuf {
        self.base_dir
            .join("Project json files")
            .join(format!("{} {} Analysis.json", year, self.title))
    }

    pub fn site_metadata_path(&self, year: i32) -> PathBuf {
        self.base_dir
            .join("Existing Site Metadata Files")
            .join(format!("{}_PV_existing_site_metadata.csv", year))
    }

    pub fn weather_dir(&self, year: i32) -> PathBuf {
        self.base_dir.join("NSRDB").join(format!("{}_NSRDB", year))
    }

    pub fn engine_weather_dir(&self, year: i32) -> PathBuf {
        self.base_dir.join("SAM_Weather_Files").join(format!("{} Weather Files", year))
    }

    pub fn engine_weather_path(&self, year: i32, latitude: f64, longitude: f64) -> PathBuf {
        self.engine_weather_dir(year)
            .join(format!("{}_SAM_final.csv", coordinate_key(latitude, longitude)))
    }

    pub fn snow_grid_path(&self, year: i32) -> PathBuf {
        self.snow.grid_dir.join(self.snow.grid_file.replace("{year}", &year.to_string()))
    }

    pub fn local_results_path(&self, scenario: Scenario, year: i32, project: &str) -> PathBuf {
        self.base_dir
            .join("PySAM_Results_UTC")
            .join(scenario.dir_name())
            .join(format!("{} SAM Results", year))
            .join(format!("{}_{}_Results.csv", project, year))
    }

    pub fn utc_results_path(&self, scenario: Scenario, year: i32, project: &str) -> PathBuf {
        self.base_dir
            .join("PySAM_Results_UTC")
            .join("Full_UTC")
            .join(scenario.dir_name())
            .join(format!("{} SAM Results", year))
            .join(format!("{}_{}_Results.csv", project, year))
    }

    pub fn analysis_dir(&self) -> PathBuf {
        self.base_dir.join("analysis")
    }
}

/// File-name key for a site location, `<lat>_<lon>`.
pub fn coordinate_key(latitude: f64, longitude: f64) -> String {
    format!("{}_{}", latitude, longitude)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_json() -> &'static str {
        r#"{
            "base_dir": "/data/snow",
            "year": 2022,
            "sites": { "registry": "sites.csv" }
        }"#
    }

    #[test]
    fn test_defaults_fill_optional_sections() {
        let config: Config = serde_json::from_str(minimal_json()).unwrap();
        assert_eq!(config.title, "Eastern Interconnect");
        assert_eq!(config.sites.drop_trailing_columns, 19);
        assert_eq!(config.sites.regions.len(), 6);
        assert_eq!(config.acquisition.max_in_flight, 10);
        assert_eq!(config.acquisition.enrich_concurrency, 20);
        assert_eq!(config.rate_limit_cooldown(), Duration::from_secs(60));
        assert_eq!(config.stitch.missing_adjacent, MissingAdjacentPolicy::ContributeNothing);
        assert_eq!(config.analysis.months.len(), 12);
    }

    #[test]
    fn test_layout_paths() {
        let config: Config = serde_json::from_str(minimal_json()).unwrap();
        assert_eq!(
            config.dictionary_path(2022),
            PathBuf::from("/data/snow/Project json files/2022 Eastern Interconnect Analysis.json")
        );
        assert_eq!(
            config.engine_weather_path(2022, 42.5, -84.25),
            PathBuf::from("/data/snow/SAM_Weather_Files/2022 Weather Files/42.5_-84.25_SAM_final.csv")
        );
        assert_eq!(
            config.local_results_path(Scenario::NoSnow, 2021, "Solar One"),
            PathBuf::from("/data/snow/PySAM_Results_UTC/No_Snow/2021 SAM Results/Solar One_2021_Results.csv")
        );
        assert_eq!(
            config.snow_grid_path(2020),
            PathBuf::from("Data/Snow Data/4km_SWE_Depth_WY2020_v01.nc")
        );
    }

    #[test]
    fn test_stitch_policy_parses_snake_case() {
        let json = r#"{
            "base_dir": ".", "year": 2022,
            "sites": { "registry": "sites.csv" },
            "stitch": { "missing_adjacent": "skip_site" }
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.stitch.missing_adjacent, MissingAdjacentPolicy::SkipSite);
    }

    #[test]
    fn test_load_rejects_zero_concurrency() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{ "base_dir": ".", "year": 2022, "sites": { "registry": "s.csv" },
                 "acquisition": { "max_in_flight": 0 } }"#,
        )
        .unwrap();
        assert!(matches!(Config::load(&path), Err(PipelineError::Config(_))));
    }

    #[test]
    fn test_bundled_config_parses() {
        let config: Config = serde_json::from_str(include_str!("../config.json")).unwrap();
        config.validate().unwrap();
        assert_eq!(config.analysis.months, vec![12, 1, 2]);
        assert!(config.analysis.snow_event.is_some());
        assert_eq!(config.analysis.excluded_sites.len(), 9);
        assert!(config.analysis.excluded_sites.iter().any(|s| s == "Monroe County Sites C  D  & E"));
        assert_eq!(config.snow.variable, "DEPTH");
        assert!(config.snow_grid_path(2022).ends_with("4km_SWE_Depth_WY2022_v01.nc"));
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, PipelineError::MissingInput(_)));
    }
}
