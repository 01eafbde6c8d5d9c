use std::path::PathBuf;

use thiserror::Error;

/// Failure taxonomy shared by every stage.
///
/// Stages catch these at site granularity, log the site identity with the
/// message and move on to the next site. Only configuration and site registry
/// failures stop a run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("missing input file {}", .0.display())]
    MissingInput(PathBuf),

    #[error("provider rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("unparseable timestamp '{0}'")]
    UnparseableTimestamp(String),

    #[error("no {attribute} value for site '{site}'")]
    MissingAttribute { site: String, attribute: &'static str },

    #[error("could not determine timezone at lat {lat}, lon {lon}")]
    TimezoneLookup { lat: f64, lon: f64 },

    #[error("simulation engine error: {0}")]
    Engine(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("malformed data in {}: {message}", .path.display())]
    Format { path: PathBuf, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    NetCdf(#[from] netcdf::Error),
}

impl PipelineError {
    pub fn format(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        PipelineError::Format { path: path.into(), message: message.into() }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
