mod config;
mod errors;
mod logging;
mod models;
mod services;
mod shared_state;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{Instrument, info, info_span};
use uuid::Uuid;

use crate::config::Config;
use crate::services::acquisition::{self, AcquisitionSettings};
use crate::services::nsrdb::NsrdbClient;
use crate::services::pv_engine::PvWattsEngine;
use crate::services::site_selection::read_dictionary;
use crate::services::{analysis, enrichment, simulation, site_selection, stitching};

/// Snow-loss study pipeline for utility-scale PV fleets.
#[derive(Parser, Debug)]
#[command(name = "snowloss", version, about)]
struct Cli {
    /// Study configuration file.
    #[arg(long, short, default_value = "config.json")]
    config: PathBuf,

    /// Analysis year; overrides `year` from the config file.
    #[arg(long, short)]
    year: Option<i32>,

    #[command(subcommand)]
    stage: Stage,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Stage {
    /// Filter the site registry and write the site dictionary.
    SelectSites,
    /// Download one year of hourly weather for every selected site.
    FetchWeather,
    /// Attach gridded snow depth and write engine weather files.
    EnrichSnow,
    /// Run both scenarios for every site.
    Simulate,
    /// Rebuild each site's series on a UTC calendar year.
    Stitch,
    /// Write fleet loss tables from the stitched series.
    Analyze,
}

impl Stage {
    fn log_name(self) -> &'static str {
        match self {
            Stage::SelectSites => "site_selection",
            Stage::FetchWeather => "weather_fetch",
            Stage::EnrichSnow => "snow_enrichment",
            Stage::Simulate => "simulation",
            Stage::Stitch => "utc_stitching",
            Stage::Analyze => "analysis",
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    let year = cli.year.unwrap_or(config.year);

    let _guard = logging::init(&config.log_dir(), cli.stage.log_name())?;
    let run_id = Uuid::new_v4();
    let span = info_span!("run", %run_id, stage = cli.stage.log_name(), year);

    run_stage(cli.stage, config, year).instrument(span).await
}

async fn run_stage(stage: Stage, config: Config, year: i32) -> anyhow::Result<()> {
    info!(base = %config.base_dir.display(), "stage started");
    match stage {
        Stage::SelectSites => {
            let dictionary = site_selection::run(&config, year)?;
            info!(sites = dictionary.len(), "site selection finished");
        }
        Stage::FetchWeather => {
            let sites = read_dictionary(&config.dictionary_path(year))?;
            let provider = Arc::new(NsrdbClient::new(&config.nsrdb)?);
            let settings = AcquisitionSettings {
                year,
                output_dir: config.weather_dir(year),
                max_in_flight: config.acquisition.max_in_flight,
                rate_limit_cooldown: config.rate_limit_cooldown(),
                error_delay: config.error_delay(),
            };
            let summary = acquisition::fetch_all(provider, &sites, &settings).await;
            info!(
                saved = summary.saved,
                skipped = summary.skipped,
                failed = summary.failed,
                provider_calls = summary.provider_calls,
                peak_in_flight = summary.peak_in_flight,
                "weather fetch finished"
            );
        }
        Stage::EnrichSnow => {
            let summary = enrichment::run(&config, year).await?;
            info!(
                enriched = summary.enriched,
                skipped = summary.skipped,
                failed = summary.failed,
                "snow enrichment finished"
            );
        }
        Stage::Simulate => {
            let summary = tokio::task::spawn_blocking(move || simulation::run(&config, &PvWattsEngine, year))
                .await??;
            info!(
                written = summary.written,
                skipped = summary.skipped,
                failed = summary.failed,
                "simulation finished"
            );
        }
        Stage::Stitch => {
            let summary = stitching::run(&config, year)?;
            info!(
                written = summary.written,
                skipped = summary.skipped,
                failed = summary.failed,
                "UTC stitching finished"
            );
        }
        Stage::Analyze => {
            analysis::run(&config, year)?;
            info!(dir = %config.analysis_dir().display(), "analysis finished");
        }
    }
    Ok(())
}
