use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// Initialise structured logging. JSON output for production, pretty
/// for development, optionally teeing to a file. `RUST_LOG` wins over
/// the configured level when set.
pub fn init(config: &LoggingConfig) -> anyhow::Result<()> {
    let level = parse_level(&config.level)?;
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    let registry = tracing_subscriber::registry().with(filter);

    let file = match &config.file_path {
        Some(path) => Some(std::sync::Arc::new(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?,
        )),
        None => None,
    };

    match (config.format.as_str(), file) {
        ("json", Some(f)) => registry.with(fmt::layer().json().with_writer(f)).init(),
        ("json", None) => registry.with(fmt::layer().json()).init(),
        (_, Some(f)) => registry
            .with(fmt::layer().with_ansi(false).with_writer(f))
            .init(),
        (_, None) => registry.with(fmt::layer()).init(),
    }
    Ok(())
}

fn parse_level(level: &str) -> anyhow::Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" | "warning" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(anyhow::anyhow!("invalid log level: {level}")),
    }
}
