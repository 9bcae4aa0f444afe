//! Diagnostic logging setup.
//!
//! The dashboard owns the terminal, so in UI mode events go to a file under
//! the log directory. Line mode logs to stderr, keeping stdout for status lines.

use std::io;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Environment variable holding the log filter (e.g. `devrack=debug`).
pub const LOG_ENV: &str = "DEVRACK_LOG";
pub const LOG_FILE_NAME: &str = "devrack.log";

/// Where diagnostic logs go.
#[derive(Debug, Clone, Copy)]
pub enum LogTarget<'a> {
    File { dir: &'a Path },
    Stderr,
}

/// Keeps the background writer alive; drop it last to flush.
pub struct LogGuard {
    _guard: Option<WorkerGuard>,
}

/// Installs the global subscriber.
pub fn init(target: LogTarget<'_>) -> Result<LogGuard> {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var(LOG_ENV)
        .from_env_lossy();

    let guard = match target {
        LogTarget::File { dir } => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::never(dir, LOG_FILE_NAME);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_filter(filter);
            tracing_subscriber::registry()
                .with(layer)
                .try_init()
                .context("failed to install log subscriber")?;
            Some(guard)
        }
        LogTarget::Stderr => {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(io::stderr)
                .with_target(false)
                .compact()
                .with_filter(filter);
            tracing_subscriber::registry()
                .with(layer)
                .try_init()
                .context("failed to install log subscriber")?;
            None
        }
    };
    Ok(LogGuard { _guard: guard })
}
