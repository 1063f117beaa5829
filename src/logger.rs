use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use anyhow::{Context, Result, anyhow};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

static INIT: OnceLock<()> = OnceLock::new();
static GUARD: Mutex<Option<WorkerGuard>> = Mutex::new(None);

/// Shape of each log line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// Human-readable `key=value` lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Where and how to write logs.
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    pub format: LogFormat,
    /// Append to this file instead of writing to stderr.
    pub file: Option<PathBuf>,
}

/// Install the global subscriber. Later calls are no-ops.
///
/// The level filter comes from `RUST_LOG` and defaults to `info`.
pub fn init(options: &LogOptions) -> Result<()> {
    if INIT.get().is_some() {
        return Ok(());
    }

    init_inner(options)?;
    let _ = INIT.set(());
    Ok(())
}

/// Flush buffered log lines and stop the background writer. Call once,
/// right before the process exits; later events are dropped.
pub fn shutdown() {
    let guard = GUARD.lock().ok().and_then(|mut slot| slot.take());
    drop(guard);
}

fn keep_guard(guard: WorkerGuard) {
    if let Ok(mut slot) = GUARD.lock() {
        *slot = Some(guard);
    }
}

fn init_inner(options: &LogOptions) -> Result<()> {
    let (writer, ansi) = match &options.file {
        Some(path) => (file_writer(path)?, false),
        None => {
            let (non_blocking, guard) = tracing_appender::non_blocking(std::io::stderr());
            keep_guard(guard);
            (non_blocking, true)
        }
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (text, json) = match options.format {
        LogFormat::Text => (
            Some(
                fmt::layer()
                    .with_writer(writer)
                    .with_timer(UtcTime::rfc_3339())
                    .with_ansi(ansi)
                    .with_target(false),
            ),
            None,
        ),
        LogFormat::Json => (
            None,
            Some(
                fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_timer(UtcTime::rfc_3339())
                    .with_current_span(false)
                    .with_target(false),
            ),
        ),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(text)
        .with(json)
        .try_init()
        .context("Failed to initialize tracing subscriber")?;

    Ok(())
}

fn file_writer(path: &Path) -> Result<NonBlocking> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create log directory at {}", parent.display()))?;
    }

    let (directory, file_name) = split_path(path)?;
    let file_appender = rolling::never(directory, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    keep_guard(guard);
    Ok(non_blocking)
}

fn split_path(path: &Path) -> Result<(PathBuf, &str)> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("Invalid log file name"))?;

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    Ok((dir, file_name))
}
