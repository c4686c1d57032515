//! Log file setup.
//!
//! Code logs through the `log` macros; records are bridged into a
//! `tracing-subscriber` registry that writes the configured level to the log
//! file and mirrors warnings and errors to stderr.

use std::{fs, path::Path};

use anyhow::{anyhow, Context, Result};
use log::LevelFilter;
use time::macros::format_description;
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{
    filter::LevelFilter as TracingLevel, fmt, fmt::time::UtcTime, layer::SubscriberExt,
    util::SubscriberInitExt, Layer,
};

/// Flushes buffered log lines when dropped; keep it alive until exit.
#[must_use = "dropping the guard stops file logging"]
pub struct LoggingGuard {
    _file_guard: WorkerGuard,
}

/// Accepts the usual names plus `WARNING` and `CRITICAL`; anything else
/// falls back to INFO.
pub fn parse_log_level(level: &str) -> LevelFilter {
    match level.to_uppercase().as_str() {
        "TRACE" => LevelFilter::Trace,
        "DEBUG" => LevelFilter::Debug,
        "INFO" => LevelFilter::Info,
        "WARN" | "WARNING" => LevelFilter::Warn,
        "ERROR" | "CRITICAL" => LevelFilter::Error,
        "OFF" => LevelFilter::Off,
        _ => {
            eprintln!("Invalid log level '{}', defaulting to INFO.", level);
            LevelFilter::Info
        }
    }
}

fn tracing_level(level: LevelFilter) -> TracingLevel {
    match level {
        LevelFilter::Off => TracingLevel::OFF,
        LevelFilter::Error => TracingLevel::ERROR,
        LevelFilter::Warn => TracingLevel::WARN,
        LevelFilter::Info => TracingLevel::INFO,
        LevelFilter::Debug => TracingLevel::DEBUG,
        LevelFilter::Trace => TracingLevel::TRACE,
    }
}

pub fn init_logging(log_path: &Path, level: LevelFilter) -> Result<LoggingGuard> {
    let log_dir = log_path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = log_path
        .file_name()
        .ok_or_else(|| anyhow!("Log path {} has no file name", log_path.display()))?;
    fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory: {}", log_dir.display()))?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(file_name.to_string_lossy().into_owned())
        .build(log_dir)
        .with_context(|| format!("Failed to open log file: {}", log_path.display()))?;
    let (file_writer, file_guard) = tracing_appender::non_blocking(appender);

    let timer = UtcTime::new(format_description!(
        "[year]-[month]-[day] [hour]:[minute]:[second]"
    ));
    let level = tracing_level(level);

    let file_layer = fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_timer(timer.clone())
        .with_target(true)
        .with_filter(level);
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_timer(timer)
        .with_target(false)
        .with_filter(level.min(TracingLevel::WARN));

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .context("Failed to initialize logging")?;

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}
