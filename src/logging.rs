//! Structured logging setup: a rotating file sink under `logs/`, plus an
//! `EnvFilter` defaulting to `info` and overridable via `RUST_LOG`.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

use crate::state::Paths;

/// Initializes the global tracing subscriber. The returned `WorkerGuard`
/// must be held for the lifetime of the process — dropping it flushes
/// and stops the non-blocking file writer.
pub fn init(paths: &Paths, component: &str) -> anyhow::Result<WorkerGuard> {
    std::fs::create_dir_all(paths.logs_dir())?;
    let file_appender = tracing_appender::rolling::daily(paths.logs_dir(), format!("{component}.log"));
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);
    let stderr_layer = fmt::layer().with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install global tracing subscriber: {e}"))?;

    Ok(guard)
}
