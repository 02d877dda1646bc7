//! Logging initialization.
//!
//! Every crate logs through `tracing` macros; the host application calls
//! [`init_logging`] once at startup to install a subscriber.

use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Line format for emitted logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Compact human-readable lines.
    #[default]
    Compact,
    /// One JSON object per line.
    Json,
}

/// Configuration for the logging system.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Default filter (e.g. "info", "beacon_queue=debug").
    /// Overridden by the `RUST_LOG` environment variable.
    pub default_level: String,
    pub format: LogFormat,
    /// Include the module target in each line.
    pub with_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            default_level: "info".into(),
            format: LogFormat::Compact,
            with_target: true,
        }
    }
}

/// Initialize logging with a default level.
///
/// ```ignore
/// beacon_core::init_logging("info");
/// tracing::info!("tracker started");
/// ```
pub fn init_logging(level: &str) {
    init_logging_with(LogConfig {
        default_level: level.into(),
        ..Default::default()
    });
}

/// Initialize logging with custom configuration.
///
/// Calling this more than once keeps the first subscriber.
pub fn init_logging_with(config: LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.with_target);

    let result = match config.format {
        LogFormat::Compact => builder.compact().finish().try_init(),
        LogFormat::Json => builder.json().finish().try_init(),
    };

    if result.is_err() {
        tracing::debug!("Logging already initialized");
    }
}
