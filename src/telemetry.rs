//! Tracing infrastructure.
//!
//! Structured logging for the acquisition core, built on `tracing` and
//! `tracing-subscriber`:
//! - environment-based filtering (`RUST_LOG` wins over configuration)
//! - pretty format for interactive runs, compact for batch runs
//! - thread names in every event, since the interesting behavior here is
//!   which thread (signal, data, worker, custody) did what, in what order
//!
//! # Example
//! ```no_run
//! use scope_core::telemetry;
//!
//! telemetry::init(&telemetry::TracingConfig::default());
//! tracing::info!("acquisition core started");
//! ```

use tracing::Level;
use tracing_subscriber::{fmt, EnvFilter};

/// Output format for tracing.
#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    /// Pretty-printed format with colors (for development).
    Pretty,
    /// Compact format without colors (for batch / log capture).
    Compact,
}

/// Tracing configuration options.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Log level used when `RUST_LOG` is unset.
    pub level: Level,
    /// Output format.
    pub format: OutputFormat,
    /// Whether to include thread names.
    pub with_thread_names: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Pretty,
            with_thread_names: true,
        }
    }
}

impl TracingConfig {
    /// Build a config from a textual log level (e.g. from `Settings`).
    pub fn from_level_str(level: &str) -> Result<Self, String> {
        let level = parse_log_level(level)?;
        Ok(Self {
            level,
            ..Default::default()
        })
    }
}

fn parse_log_level(s: &str) -> Result<Level, String> {
    match s.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => Err(format!("unknown log level '{other}'")),
    }
}

/// Initialize the global subscriber; panics if one is already set.
pub fn init(config: &TracingConfig) {
    try_init(config).unwrap_or_else(|e| panic!("failed to initialize tracing: {e}"));
}

/// Initialize the global subscriber, reporting failure instead of
/// panicking. Useful in tests where a subscriber may already exist.
pub fn try_init(config: &TracingConfig) -> Result<(), String> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.to_string().to_lowercase()));

    let builder = fmt()
        .with_env_filter(filter)
        .with_thread_names(config.with_thread_names);

    match config.format {
        OutputFormat::Pretty => builder.pretty().try_init().map_err(|e| e.to_string()),
        OutputFormat::Compact => builder
            .compact()
            .with_ansi(false)
            .try_init()
            .map_err(|e| e.to_string()),
    }
}
