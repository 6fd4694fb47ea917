//! Tracing setup for processes embedding the coordinator
//!
//! The library itself only emits `tracing` events. A host process calls
//! [`init_logging`] once at startup with its [`LoggingConfig`] and holds the
//! returned guard until shutdown; dropping it flushes the file writer.

use crate::config::LoggingConfig;
use crate::coordinator::error::CoordinatorError;
use tracing::Subscriber;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::RollingFileAppender;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Install the global subscriber; keep the guard alive for the process lifetime
pub fn init_logging(config: &LoggingConfig) -> Result<WorkerGuard, CoordinatorError> {
    let (subscriber, guard) = build_subscriber(config);
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| CoordinatorError::Config(format!("logging already initialized: {}", e)))?;
    Ok(guard)
}

/// Build the subscriber without installing it
pub fn build_subscriber(
    config: &LoggingConfig,
) -> (Box<dyn Subscriber + Send + Sync>, WorkerGuard) {
    let (writer, guard) = tracing_appender::non_blocking(rolling_appender(config));
    let registry = tracing_subscriber::registry().with(level_filter(config));

    let subscriber: Box<dyn Subscriber + Send + Sync> = if config.use_json {
        Box::new(registry.with(json_layer(writer)))
    } else {
        let file_layer = fmt::layer()
            .with_target(false)
            .with_writer(writer)
            .with_ansi(false);
        let stdout_layer = fmt::layer().with_target(false).with_ansi(true);
        Box::new(registry.with(file_layer).with(stdout_layer))
    };
    (subscriber, guard)
}

fn json_layer<S>(writer: NonBlocking) -> impl tracing_subscriber::Layer<S>
where
    S: Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fmt::layer()
        .json()
        .with_target(true)
        .with_writer(writer)
        .with_ansi(false)
}

fn rolling_appender(config: &LoggingConfig) -> RollingFileAppender {
    match config.rotation.as_str() {
        "hourly" => tracing_appender::rolling::hourly(&config.log_dir, &config.log_file),
        "daily" => tracing_appender::rolling::daily(&config.log_dir, &config.log_file),
        _ => tracing_appender::rolling::never(&config.log_dir, &config.log_file),
    }
}

/// RUST_LOG wins over the configured level; an unparsable level means info
fn level_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}
