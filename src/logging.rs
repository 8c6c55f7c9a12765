use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::{AppError, AppResult};

pub const LOG_TARGET: &str = "ledgerkeep";
const LOG_ENV: &str = "LEDGERKEEP_LOG";
const DEFAULT_FILTER: &str = "ledgerkeep=info";
const LOG_FILE_PREFIX: &str = "ledgerkeep.log";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the JSON subscriber on stderr. Safe to call more than once.
pub fn init_logging() {
    let _ = fmt()
        .json()
        .with_env_filter(env_filter())
        .with_target(true)
        .with_timer(UtcTime::rfc_3339())
        .with_writer(std::io::stderr)
        .try_init();
}

/// Install stderr plus a daily-rolling JSON file sink under `dir`.
///
/// The returned guard flushes the background writer on drop; keep it alive
/// for the life of the process.
pub fn init_file_logging(dir: &Path) -> AppResult<WorkerGuard> {
    std::fs::create_dir_all(dir).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "create_log_dir")
            .with_context("path", dir.display().to_string())
    })?;

    let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let stderr_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_timer(UtcTime::rfc_3339())
        .with_writer(std::io::stderr);
    let file_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_ansi(false)
        .with_timer(UtcTime::rfc_3339())
        .with_writer(writer);

    tracing_subscriber::registry()
        .with(env_filter())
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|err| AppError::new("LOGGING/INIT", err.to_string()))?;

    Ok(guard)
}
