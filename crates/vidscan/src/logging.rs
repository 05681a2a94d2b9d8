//! Process-wide log setup for the worker binary and embedding applications.
//!
//! Library code logs through the `log` facade; `LogTracer` forwards those
//! records into the `tracing` subscriber installed here.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

use crate::config::LoggingConfig;
use crate::error::VidscanError;

/// Builds the filter: `RUST_LOG` when set, otherwise the configured level.
pub fn build_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Installs the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<(), VidscanError> {
    let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = if config.json {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_target(true)
            .boxed()
    } else {
        fmt::layer().with_target(true).boxed()
    };

    let subscriber = Registry::default()
        .with(fmt_layer)
        .with(build_filter(&config.level));

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| VidscanError::Logging(e.to_string()))?;

    tracing_log::LogTracer::init().map_err(|e| VidscanError::Logging(e.to_string()))?;

    Ok(())
}
