use std::fs::{File, OpenOptions};
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

use crate::config::LoggingConfig;

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Install the global `tracing` subscriber for a host embedding the session core.
///
/// `RUST_LOG` wins over the configured level. JSON output carries span lists
/// for log shipping; the pretty format is meant for local development.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let level = parse_log_level(&config.level)?;

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    let file = config.file_path.as_deref().map(open_log_file).transpose()?;
    let layer = build_layer(&config.format, file);

    tracing_subscriber::registry()
        .with(layer)
        .with(env_filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Logging already initialized: {e}"))
}

fn build_layer(format: &str, file: Option<File>) -> BoxedLayer {
    if format == "json" {
        let layer = fmt::layer()
            .json()
            .with_span_events(FmtSpan::CLOSE)
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .with_line_number(true);
        match file {
            Some(file) => layer.with_writer(Arc::new(file)).boxed(),
            None => layer.boxed(),
        }
    } else {
        let layer = fmt::layer()
            .pretty()
            .with_target(true)
            .with_line_number(true)
            .with_file(false);
        match file {
            Some(file) => layer.with_writer(Arc::new(file)).with_ansi(false).boxed(),
            None => layer.boxed(),
        }
    }
}

fn open_log_file(path: &str) -> anyhow::Result<File> {
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

fn parse_log_level(level: &str) -> anyhow::Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" | "warning" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        // Directive strings such as "roomcall_media=debug" are handed to EnvFilter
        other if other.contains('=') => Ok(Level::INFO),
        _ => Err(anyhow::anyhow!("Invalid log level: {level}")),
    }
}
