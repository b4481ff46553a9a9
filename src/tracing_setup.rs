use eyre::{Result, WrapErr, eyre};
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{LogFormat, LoggingConfig};

/// Build the filter: `RUST_LOG` wins over the configured level.
pub fn env_filter(level: &str) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(level).wrap_err_with(|| format!("Invalid log level: {level}")),
    }
}

/// Initialize the global subscriber from the logging section of the config
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = env_filter(&config.level)?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let result = match config.format {
        LogFormat::Json => Registry::default()
            .with(filter)
            .with(fmt_layer.json().with_current_span(true).with_span_list(true))
            .try_init(),
        LogFormat::Pretty => Registry::default()
            .with(filter)
            .with(fmt_layer.pretty().with_ansi(true))
            .try_init(),
    };
    result.map_err(|e| eyre!("Failed to install tracing subscriber: {e}"))?;

    tracing::info!(level = %config.level, format = ?config.format, "Switchyard logging initialized");
    Ok(())
}

/// Console logging for commands that run before a config is loaded
pub fn init_console_tracing() -> Result<()> {
    init_tracing(&LoggingConfig {
        level: "info".to_string(),
        format: LogFormat::Pretty,
    })
}

/// Span wrapping one background task
pub fn component_span(component: &str, service: Option<&str>) -> tracing::Span {
    tracing::info_span!("component", name = component, service = service)
}
