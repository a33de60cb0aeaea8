//! # Logging Utilities
//!
//! Subscriber setup for hosts embedding `imgmap-core`.
//!
//! The library crates only emit `tracing` events; whoever owns the process
//! (a debugger front end, a dump analysis service) picks where they go:
//! - Pretty output for development, JSON for log pipelines
//! - Console, a daily-rolling file, or a file only (when stdout belongs to a REPL)
//! - `RUST_LOG` filters, e.g. `RUST_LOG=imgmap_core::memory=trace`
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use imgmap_utils::init_logging;
//!
//! // Keep the guard alive for as long as file output should be flushed
//! let _guard = init_logging().expect("Failed to initialize logging");
//! tracing::info!("Dump opened");
//! ```
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: level filter (default `info`)
//! - `IMGMAP_LOG_FORMAT`: `pretty` (default) or `json`
//! - `IMGMAP_LOG_FILE`: optional path of a daily-rolling log file written in
//!   addition to the console

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::{env, io};

use chrono::Utc;
use tracing::Level;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::fmt::{self};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat
{
    /// Human-readable output (default)
    #[default]
    Pretty,
    /// One JSON object per event
    Json,
}

impl FromStr for LogFormat
{
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.to_lowercase().as_str() {
            "pretty" | "dev" | "development" => Ok(LogFormat::Pretty),
            "json" | "prod" | "production" => Ok(LogFormat::Json),
            _ => Err(LoggingError::InvalidFormat(format!("{s}; use 'pretty' or 'json'"))),
        }
    }
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel
{
    Error,
    Warn,
    /// Default level
    #[default]
    Info,
    Debug,
    /// Per-page cache and relocation detail
    Trace,
}

impl From<LogLevel> for Level
{
    fn from(level: LogLevel) -> Self
    {
        match level {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

impl FromStr for LogLevel
{
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.to_lowercase().as_str() {
            "error" | "err" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" | "dbg" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(LoggingError::InvalidLevel(format!(
                "{s}; use 'error', 'warn', 'info', 'debug' or 'trace'"
            ))),
        }
    }
}

/// Initialize logging from the environment
///
/// Logs go to stdout, and additionally to `IMGMAP_LOG_FILE` when it is set.
/// The returned guard flushes the file writer when dropped; it is `None`
/// when no file is written.
///
/// ## Errors
///
/// Returns an error if:
/// - A global subscriber is already installed
/// - `IMGMAP_LOG_FORMAT` holds an unknown format
pub fn init_logging() -> Result<Option<WorkerGuard>, LoggingError>
{
    let format = match env::var("IMGMAP_LOG_FORMAT") {
        Ok(value) => value.parse()?,
        Err(_) => LogFormat::Pretty,
    };
    // RUST_LOG may hold a directive list rather than a bare level
    let default_level = env::var("RUST_LOG")
        .ok()
        .and_then(|value| value.parse::<LogLevel>().ok())
        .map_or(Level::INFO, Into::into);

    init_console(format, default_level, env::var("IMGMAP_LOG_FILE").ok().map(PathBuf::from))
}

/// Initialize console logging with an explicit default level and format
///
/// `RUST_LOG`, when set, still overrides `level`.
///
/// ```rust,no_run
/// use imgmap_utils::{init_logging_with_level, LogFormat, LogLevel};
///
/// init_logging_with_level(LogLevel::Debug, LogFormat::Pretty).expect("Failed to initialize logging");
/// ```
///
/// ## Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init_logging_with_level(level: LogLevel, format: LogFormat) -> Result<(), LoggingError>
{
    init_console(format, level.into(), None).map(|_| ())
}

/// Initialize logging to `path` only, leaving stdout untouched
///
/// For hosts that own the terminal, such as an interactive debugger. An
/// explicit `level` wins over `RUST_LOG`; with `None`, `RUST_LOG` (or
/// `info`) applies. The file is appended to, never rotated.
///
/// ```rust,no_run
/// use imgmap_utils::{default_log_path, init_logging_to_file, LogFormat};
///
/// let path = default_log_path(std::path::Path::new("/tmp"));
/// let _guard = init_logging_to_file(&path, LogFormat::Json, None).expect("Failed to initialize logging");
/// ```
///
/// ## Errors
///
/// Returns an error if the log directory cannot be created or a global
/// subscriber is already installed.
pub fn init_logging_to_file(
    path: &Path,
    format: LogFormat,
    level: Option<LogLevel>,
) -> Result<WorkerGuard, LoggingError>
{
    let directory = path.parent().filter(|parent| !parent.as_os_str().is_empty()).unwrap_or(Path::new("."));
    std::fs::create_dir_all(directory)?;
    let file_name = path
        .file_name()
        .ok_or_else(|| LoggingError::InitializationFailed(format!("{} is not a file path", path.display())))?;

    let filter = match level {
        Some(level) => EnvFilter::new(Level::from(level).to_string()),
        None => env_filter(Level::INFO),
    };
    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(directory, file_name));
    install(vec![file_layer(format, writer, filter)])?;
    Ok(guard)
}

/// `<directory>/<UTC date>-imgmap.log`, for hosts writing one file per day.
#[must_use]
pub fn default_log_path(directory: &Path) -> PathBuf
{
    directory.join(format!("{}-imgmap.log", Utc::now().format("%Y-%m-%d")))
}

fn init_console(
    format: LogFormat,
    default_level: Level,
    log_file: Option<PathBuf>,
) -> Result<Option<WorkerGuard>, LoggingError>
{
    let mut layers = vec![console_layer(format, env_filter(default_level))];
    let mut guard = None;

    if let Some(path) = log_file {
        let directory = path.parent().unwrap_or(Path::new(".")).to_path_buf();
        let file_name = path.file_name().unwrap_or_default().to_os_string();
        let (writer, file_guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(directory, file_name));
        layers.push(file_layer(format, writer, env_filter(default_level)));
        guard = Some(file_guard);
    }

    install(layers)?;
    Ok(guard)
}

/// `RUST_LOG` if it parses as a filter, otherwise `default_level`.
fn env_filter(default_level: Level) -> EnvFilter
{
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level.to_string()))
}

fn console_layer(format: LogFormat, filter: EnvFilter) -> BoxedLayer
{
    match format {
        LogFormat::Pretty => fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_thread_names(true)
            .with_file(true)
            .with_line_number(true)
            .with_timer(ChronoUtc::rfc_3339())
            .with_ansi(true)
            .with_writer(io::stdout)
            .with_filter(filter)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .with_timer(ChronoUtc::rfc_3339())
            .with_current_span(true)
            .with_span_list(true)
            .with_writer(io::stdout)
            .with_filter(filter)
            .boxed(),
    }
}

fn file_layer(format: LogFormat, writer: NonBlocking, filter: EnvFilter) -> BoxedLayer
{
    match format {
        LogFormat::Pretty => fmt::layer()
            .with_writer(writer)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .with_timer(ChronoUtc::rfc_3339())
            .with_ansi(false) // No ANSI in files
            .with_filter(filter)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(writer)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .with_timer(ChronoUtc::rfc_3339())
            .with_current_span(true)
            .with_span_list(true)
            .with_filter(filter)
            .boxed(),
    }
}

fn install(layers: Vec<BoxedLayer>) -> Result<(), LoggingError>
{
    Registry::default()
        .with(layers)
        .try_init()
        .map_err(|error| LoggingError::InitializationFailed(error.to_string()))
}

/// Logging initialization error
#[derive(Debug, thiserror::Error)]
pub enum LoggingError
{
    #[error("Invalid log format: {0}")]
    InvalidFormat(String),

    #[error("Invalid log level: {0}")]
    InvalidLevel(String),

    /// A subscriber is already installed, or the sink is unusable
    #[error("Failed to initialize logging: {0}")]
    InitializationFailed(String),

    #[error("File logging error: {0}")]
    FileError(#[from] io::Error),
}
