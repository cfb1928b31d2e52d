//! Logging initialization using tracing.

use anyhow::{Context, Result};
use tracing_subscriber::{
    fmt,
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Level used when neither the caller nor the environment picks one.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Environment variable consulted by [`level_from_env`].
pub const LOG_LEVEL_ENV: &str = "ZCONTROL_LOG_LEVEL";

/// Resolve the log level from `ZCONTROL_LOG_LEVEL`, falling back to `info`.
pub fn level_from_env() -> String {
    std::env::var(LOG_LEVEL_ENV)
        .ok()
        .filter(|level| !level.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string())
}

fn build_filter(level: &str) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(level)
            .with_context(|| format!("Invalid log level directive '{}'", level)),
    }
}

/// Initialize the tracing subscriber with the specified log level.
///
/// `RUST_LOG` wins over `level` when set. Calling this more than once is
/// harmless: later calls keep the subscriber that is already installed.
///
/// # Arguments
/// * `level` - Log level string (trace, debug, info, warn, error)
///
/// # Example
/// ```
/// zcontrol_common::init_logging("info").unwrap();
/// ```
pub fn init_logging(level: &str) -> Result<()> {
    let filter = build_filter(level)?;

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
        );

    // Already initialized (e.g. another test in the same binary).
    let _ = subscriber.try_init();

    Ok(())
}

/// Initialize logging with JSON output format.
/// Suitable for automation pipelines that ship logs to an aggregator.
pub fn init_logging_json(level: &str) -> Result<()> {
    let filter = build_filter(level)?;

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .json()
                .with_target(true)
                .with_thread_ids(true)
        );

    let _ = subscriber.try_init();

    Ok(())
}
