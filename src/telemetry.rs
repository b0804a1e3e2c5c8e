//! Tracing setup for the server binary and tests.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;

use crate::config::LoggingConfig;

#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    pub verbosity: u8,
    pub stdout: bool,
    pub filter: Option<String>,
}

impl TelemetryConfig {
    pub fn new(verbosity: u8, logging: &LoggingConfig) -> Self {
        Self {
            verbosity,
            stdout: logging.stdout,
            filter: logging.filter.clone(),
        }
    }
}

/// Install the global subscriber. Filter precedence: explicit config
/// filter, then the `LOG` env var, then the `-v` verbosity level.
/// Safe to call more than once; later calls are no-ops.
pub fn init(config: TelemetryConfig) {
    let filter = match &config.filter {
        Some(directive) => EnvFilter::new(directive),
        None => EnvFilter::builder()
            .with_default_directive(level_from_verbosity(config.verbosity).into())
            .with_env_var("LOG")
            .from_env_lossy(),
    };

    let builder = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact();
    let result = if config.stdout {
        builder.try_init()
    } else {
        builder.with_writer(std::io::sink).try_init()
    };
    if result.is_err() {
        tracing::debug!("telemetry already initialized");
    }
}

fn level_from_verbosity(verbosity: u8) -> tracing::level_filters::LevelFilter {
    match verbosity {
        0 => tracing::level_filters::LevelFilter::INFO,
        1 => tracing::level_filters::LevelFilter::DEBUG,
        _ => tracing::level_filters::LevelFilter::TRACE,
    }
}
