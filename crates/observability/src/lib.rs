//! # Observability
//!
//! Centralized logging layer for the delivery workspace.
//!
//! Crates in this workspace are **log producers** only. They use standard
//! `tracing` macros and never decide where logs go. The host process calls
//! [`init_with_config`] once at startup.
//!
//! ## Output
//!
//! Every event is written as one JSON object per line to a central file
//! (`~/.deliverer/logs/deliverer.jsonl` unless overridden), so the stream
//! can be followed with `tail -f ... | jq`. An optional compact stderr layer
//! gives immediate feedback in foreground runs.
//!
//! ## Usage
//!
//! ```rust,ignore
//! observability::init_with_config(observability::LogConfig {
//!     service_name: "deliverer".into(),
//!     default_level: "debug".into(),
//!     also_stderr: true,
//!     ..Default::default()
//! });
//! tracing::info!("service started");
//! ```

mod file_sink;
mod json_layer;

pub use file_sink::LogFile;
pub use json_layer::{JsonLayer, LogEntry};

use std::io;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the logging system.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Name of the service, included in every log line for filtering.
    pub service_name: String,

    /// Default log level filter (e.g., "debug", "info", "warn").
    /// Can be overridden by `RUST_LOG` environment variable.
    pub default_level: String,

    /// Optional custom log file path.
    /// Defaults to `~/.deliverer/logs/deliverer.jsonl`.
    pub log_path: Option<PathBuf>,

    /// Also emit logs to stderr.
    pub also_stderr: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown".into(),
            default_level: "info".into(),
            log_path: None,
            also_stderr: false,
        }
    }
}

/// Central log file location.
pub fn default_log_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".deliverer").join("logs").join("deliverer.jsonl"))
}

/// Initialize the observability layer with custom configuration.
///
/// Installing a global subscriber twice is a no-op, so tests and embedders
/// may call this more than once. If the log file cannot be opened, logging
/// falls back to stderr.
pub fn init_with_config(config: LogConfig) {
    let env_filter = build_filter(&config.default_level);

    let log_file = config
        .log_path
        .clone()
        .or_else(default_log_path)
        .and_then(|path| match LogFile::open(&path) {
            Ok(file) => Some(file),
            Err(e) => {
                eprintln!("failed to open log file {}: {}", path.display(), e);
                None
            }
        });

    let Some(log_file) = log_file else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .compact()
            .with_writer(io::stderr)
            .try_init();
        return;
    };
    let log_path = log_file.path().to_path_buf();
    let json_layer = JsonLayer::new(config.service_name.clone(), log_file);

    let stderr_layer = if config.also_stderr {
        Some(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_file(false)
                .with_line_number(false)
                .compact()
                .with_writer(io::stderr)
                .with_ansi(true)
                .with_filter(build_filter(&config.default_level)),
        )
    } else {
        None
    };

    let installed = tracing_subscriber::registry()
        .with(json_layer.with_filter(env_filter))
        .with(stderr_layer)
        .try_init()
        .is_ok();

    if installed {
        tracing::info!(
            log_path = %log_path.display(),
            service = %config.service_name,
            "observability initialized"
        );
    }
}

fn build_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}
