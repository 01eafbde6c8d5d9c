//! Console plus per-stage log file.
//!
//! The level comes from `RUST_LOG` and defaults to `info`. Each stage appends
//! to `<base>/log_files/<stage>.log`; the returned guard flushes the file
//! writer on drop and must live until the stage finishes.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

pub fn init(log_dir: &Path, stage: &str) -> anyhow::Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)?;
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;

    let appender = tracing_appender::rolling::never(log_dir, format!("{}.log", stage));
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stdout))
        .with(fmt::layer().with_writer(file_writer).with_ansi(false).with_target(true))
        .try_init()?;
    Ok(guard)
}
