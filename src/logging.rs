// src/logging.rs

//! Logging setup for `pipewright` using `tracing` + `tracing-subscriber`.
//!
//! Priority for determining the filter:
//! 1. `--log-level` CLI flag (if provided)
//! 2. `PIPEWRIGHT_LOG` environment variable: a level ("info", "debug") or
//!    full directives ("warn,pipewright::engine=debug")
//! 3. default to `info`
//!
//! Logs are sent to STDERR so that stdout carries only command output
//! (values, JSON).

use anyhow::{anyhow, Result};
use tracing_subscriber::{fmt, EnvFilter};

use crate::cli::LogLevel;

pub const LOG_ENV: &str = "PIPEWRIGHT_LOG";

const DEFAULT_DIRECTIVE: &str = "info";

/// Initialise global logging subscriber.
///
/// Safe to call once at startup.
pub fn init_logging(cli_level: Option<LogLevel>) -> Result<()> {
    let env = std::env::var(LOG_ENV).ok();
    let filter = log_filter(cli_level, env.as_deref());

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow!("failed to initialise logging: {e}"))
}

/// Build the filter from the CLI level and the value of `PIPEWRIGHT_LOG`.
pub fn log_filter(cli_level: Option<LogLevel>, env: Option<&str>) -> EnvFilter {
    if let Some(level) = cli_level {
        return EnvFilter::new(level_directive(level));
    }
    let Some(spec) = env.map(str::trim).filter(|s| !s.is_empty()) else {
        return EnvFilter::new(DEFAULT_DIRECTIVE);
    };
    let spec = if spec.eq_ignore_ascii_case("warning") { "warn" } else { spec };
    EnvFilter::try_new(spec.to_lowercase()).unwrap_or_else(|e| {
        eprintln!("ignoring invalid {LOG_ENV}={spec:?}: {e}");
        EnvFilter::new(DEFAULT_DIRECTIVE)
    })
}

fn level_directive(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Error => "error",
        LogLevel::Warn => "warn",
        LogLevel::Info => "info",
        LogLevel::Debug => "debug",
        LogLevel::Trace => "trace",
    }
}
