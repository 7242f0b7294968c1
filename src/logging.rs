//! Logging bootstrap.
//!
//! Engine components attach `account_id` / `position_id` / `order_id`
//! fields to their events; the JSON file layer flattens the current span
//! into each line so those fields stay queryable in log search. `RUST_LOG`
//! overrides the built-in directives.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{self, RollingFileAppender};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config::LoggingConfig;

/// Built-in directive set: the engine at the configured level, with sqlx's
/// per-statement logging capped at warn so the file log stays readable
/// under load.
fn filter_directives(config: &LoggingConfig) -> String {
    format!(
        "{level},position_engine={level},sqlx=warn",
        level = config.log_level
    )
}

fn file_appender(config: &LoggingConfig) -> RollingFileAppender {
    match config.rotation.as_str() {
        "hourly" => rolling::hourly(&config.log_dir, &config.log_file),
        "daily" => rolling::daily(&config.log_dir, &config.log_file),
        _ => rolling::never(&config.log_dir, &config.log_file),
    }
}

/// Install the global subscriber: rolling file plus stdout, JSON optional.
/// Keep the returned guard alive for the lifetime of the process.
pub fn init_logging(config: &LoggingConfig) -> WorkerGuard {
    let (writer, guard) = tracing_appender::non_blocking(file_appender(config));

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(config)));
    let registry = tracing_subscriber::registry().with(filter);

    if config.use_json {
        // one object per line; span fields land next to the event fields
        let file_layer = fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(false)
            .with_writer(writer)
            .with_ansi(false);
        registry.with(file_layer).init();
    } else {
        let file_layer = fmt::layer()
            .with_target(false)
            .with_writer(writer)
            .with_ansi(false);
        let stdout_layer = fmt::layer().compact().with_ansi(true);
        registry.with(file_layer).with(stdout_layer).init();
    }

    tracing::info!(
        dir = %config.log_dir,
        file = %config.log_file,
        rotation = %config.rotation,
        json = config.use_json,
        "logging initialised"
    );
    guard
}
