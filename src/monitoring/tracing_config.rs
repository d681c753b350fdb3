//! Structured logging with tracing
//!
//! Sets up:
//! - Console logging, text or JSON per `LOG_FORMAT`
//! - File logging with daily rotation (always JSON)
//! - Level filtering from RUST_LOG

use super::config::{LogFormat, MonitoringConfig};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::daily;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

pub const LOG_FILE_PREFIX: &str = "sprintcore.log";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Initialize the global tracing subscriber.
///
/// Returns the file writer guard when file logging is on; keep it alive
/// for the life of the process or buffered lines are lost.
/// A subscriber already installed (tests, embedding apps) is left in place.
pub fn init_tracing(config: &MonitoringConfig) -> std::io::Result<Option<WorkerGuard>> {
    if !config.enabled {
        return Ok(None);
    }

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let mut layers: Vec<BoxedLayer> = Vec::new();
    let mut guard = None;

    if config.enable_console_logging {
        let console = fmt::layer()
            .with_writer(std::io::stderr)
            .with_span_events(FmtSpan::CLOSE)
            .with_target(true)
            .with_line_number(true);
        let console: BoxedLayer = match config.log_format {
            LogFormat::Json => console.json().boxed(),
            LogFormat::Text => console.boxed(),
        };
        layers.push(console);
    }

    if config.enable_file_logging {
        config.ensure_log_dir()?;
        let file_appender = daily(&config.log_dir, LOG_FILE_PREFIX);
        let (writer, file_guard) = tracing_appender::non_blocking(file_appender);
        layers.push(
            fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .json()
                .boxed(),
        );
        guard = Some(file_guard);
    }

    let _ = tracing_subscriber::registry()
        .with(layers)
        .with(env_filter)
        .try_init();

    Ok(guard)
}

/// Log the outcome of a recovered operation
#[macro_export]
macro_rules! log_recovery {
    ($operation:expr, $outcome:expr, $attempts:expr, $duration_ms:expr) => {
        tracing::info!(
            operation = $operation,
            outcome = $outcome,
            attempts = $attempts,
            duration_ms = $duration_ms,
            "Recovered operation finished"
        );
    };
}
