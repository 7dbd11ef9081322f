//! Tracing subscriber setup.
//!
//! `RUST_LOG` wins over the configured level when set.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::ApplicationConfig;
use crate::error::{AppResult, RigError};

/// Log line format.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable, coloured when writing to a terminal.
    Pretty,
    /// One JSON object per event.
    Json,
}

impl OutputFormat {
    /// Case-insensitive `pretty` or `json`.
    pub fn parse(name: &str) -> AppResult<Self> {
        match name.to_lowercase().as_str() {
            "pretty" => Ok(OutputFormat::Pretty),
            "json" => Ok(OutputFormat::Json),
            other => Err(RigError::Settings(format!(
                "Invalid log format '{other}'. Must be one of: pretty, json"
            ))),
        }
    }
}

fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Installs the global subscriber. A second call is a no-op.
pub fn init(level: &str, format: OutputFormat) -> AppResult<()> {
    let result = match format {
        OutputFormat::Pretty => tracing_subscriber::registry()
            .with(fmt::layer().with_target(false).with_filter(filter(level)))
            .try_init(),
        OutputFormat::Json => tracing_subscriber::registry()
            .with(fmt::layer().json().with_filter(filter(level)))
            .try_init(),
    };

    match result {
        Ok(()) => Ok(()),
        // Already initialised, e.g. by a test harness.
        Err(e) if e.to_string().contains("already been set") => Ok(()),
        Err(e) => Err(RigError::Settings(format!("Failed to initialize tracing: {e}"))),
    }
}

/// Installs the subscriber described by the `[application]` section.
pub fn init_from_config(app: &ApplicationConfig) -> AppResult<()> {
    init(&app.log_level, OutputFormat::parse(&app.log_format)?)
}
