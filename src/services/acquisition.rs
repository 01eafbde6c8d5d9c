//! Bounded-concurrency weather download with an on-disk cache.
//!
//! One task per site. A semaphore caps provider calls in flight, and the
//! shared lock in [`FetchState`] covers the existence check and the save.
//! A cached file means no provider call. A rate-limited site gives up its
//! permit, waits out the cooldown and is retried once. Any other failure
//! waits the short delay and drops the site for this run.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::config::coordinate_key;
use crate::errors::{PipelineError, Result};
use crate::models::site::SiteDictionary;
use crate::models::weather::WeatherDownload;
use crate::shared_state::FetchState;

/// Rate-limit retries granted to one site per run.
const MAX_RATE_LIMIT_RETRIES: u32 = 1;

/// The remote weather-data provider.
#[async_trait]
pub trait WeatherProvider: Send + Sync {
    async fn fetch(&self, site: &SiteLocation, year: i32) -> Result<WeatherDownload>;
}

#[derive(Debug, Clone)]
pub struct SiteLocation {
    pub index: usize,
    pub project_name: String,
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone)]
pub struct AcquisitionSettings {
    pub year: i32,
    pub output_dir: PathBuf,
    pub max_in_flight: usize,
    pub rate_limit_cooldown: Duration,
    pub error_delay: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Saved,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcquisitionSummary {
    pub saved: usize,
    pub skipped: usize,
    pub failed: usize,
    pub provider_calls: usize,
    pub peak_in_flight: usize,
}

/// Cache file for one location: `<dir>/<lat>_<lon>.csv`.
pub fn cache_path(dir: &Path, latitude: f64, longitude: f64) -> PathBuf {
    dir.join(format!("{}.csv", coordinate_key(latitude, longitude)))
}

/// Metadata sidecar next to a cache file: `<lat>_<lon>_metadata.json`.
pub fn metadata_path(data_path: &Path) -> PathBuf {
    let stem = data_path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
    data_path.with_file_name(format!("{}_metadata.json", stem))
}

pub async fn fetch_all<P>(
    provider: Arc<P>,
    sites: &SiteDictionary,
    settings: &AcquisitionSettings,
) -> AcquisitionSummary
where
    P: WeatherProvider + 'static,
{
    let state = FetchState::new();
    let semaphore = Arc::new(Semaphore::new(settings.max_in_flight.max(1)));
    let mut tasks = JoinSet::new();

    for (&index, site) in sites {
        let location = SiteLocation {
            index,
            project_name: site.project_name.clone(),
            latitude: site.latitude,
            longitude: site.longitude,
        };
        tasks.spawn(fetch_site(
            provider.clone(),
            semaphore.clone(),
            state.clone(),
            settings.clone(),
            location,
        ));
    }

    let mut summary = AcquisitionSummary::default();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(FetchOutcome::Saved) => summary.saved += 1,
            Ok(FetchOutcome::Skipped) => summary.skipped += 1,
            Ok(FetchOutcome::Failed) => summary.failed += 1,
            Err(e) => {
                error!(error = %e, "fetch task aborted");
                summary.failed += 1;
            }
        }
    }
    summary.provider_calls = state.provider_calls();
    summary.peak_in_flight = state.peak_in_flight();
    summary
}

async fn fetch_site<P>(
    provider: Arc<P>,
    semaphore: Arc<Semaphore>,
    state: FetchState,
    settings: AcquisitionSettings,
    site: SiteLocation,
) -> FetchOutcome
where
    P: WeatherProvider + 'static,
{
    let path = cache_path(&settings.output_dir, site.latitude, site.longitude);
    if !state.claim(&path).await {
        info!(site = site.index, project = %site.project_name, "data already saved, skipping");
        return FetchOutcome::Skipped;
    }

    let mut rate_limit_retries = 0;
    loop {
        let attempt = {
            let Ok(_permit) = semaphore.acquire().await else {
                return FetchOutcome::Failed;
            };
            let _flight = state.enter_flight();
            provider.fetch(&site, settings.year).await
        };

        match attempt {
            Ok(download) => {
                return match save_download(&state, &path, &download).await {
                    Ok(()) => {
                        info!(
                            site = site.index,
                            project = %site.project_name,
                            rows = download.records.len(),
                            path = %path.display(),
                            "weather data saved"
                        );
                        FetchOutcome::Saved
                    }
                    Err(e) => {
                        error!(site = site.index, project = %site.project_name, error = %e, "failed to save weather data");
                        FetchOutcome::Failed
                    }
                };
            }
            Err(PipelineError::RateLimited(msg)) if rate_limit_retries < MAX_RATE_LIMIT_RETRIES => {
                warn!(
                    project = %site.project_name,
                    lat = site.latitude,
                    lon = site.longitude,
                    cooldown_s = settings.rate_limit_cooldown.as_secs_f64(),
                    "rate limit exceeded, pausing before retry: {}", msg
                );
                rate_limit_retries += 1;
                tokio::time::sleep(settings.rate_limit_cooldown).await;
            }
            Err(e) => {
                error!(
                    project = %site.project_name,
                    lat = site.latitude,
                    lon = site.longitude,
                    error = %e,
                    "fetch failed, giving up on site for this run"
                );
                tokio::time::sleep(settings.error_delay).await;
                return FetchOutcome::Failed;
            }
        }
    }
}

/// Writes the metadata sidecar, then the data file, each through a
/// temporary sibling and a rename. The data file appears last, so its
/// existence means both are complete.
async fn save_download(state: &FetchState, path: &Path, download: &WeatherDownload) -> Result<()> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for record in &download.records {
        writer.serialize(record)?;
    }
    let data = writer
        .into_inner()
        .map_err(|e| PipelineError::Io(e.into_error()))?;
    let metadata = serde_json::to_vec_pretty(&download.metadata)?;

    let _lock = state.save_lock().await;
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    write_atomic(&metadata_path(path), &metadata).await?;
    write_atomic(path, &data).await?;
    Ok(())
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("partial");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Reads a cached weather series back.
pub fn read_cached(path: &Path) -> Result<Vec<crate::models::weather::WeatherRecord>> {
    if !path.exists() {
        return Err(PipelineError::MissingInput(path.to_path_buf()));
    }
    let mut reader = csv::Reader::from_path(path)?;
    let records = reader.deserialize().collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(records)
}
