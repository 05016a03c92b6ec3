//! Tracing setup for the frame receiver.
//!
//! Uses `tracing-subscriber` with an [`EnvFilter`], so `RUST_LOG` overrides the
//! configured level when set. Three output formats are available:
//! pretty (development), compact (production) and JSON (log aggregation).
//!
//! # Example
//! ```no_run
//! use frame_receiver::logging::{self, OutputFormat, TracingConfig};
//! use tracing::Level;
//!
//! # fn main() -> Result<(), String> {
//! logging::init(TracingConfig::new(Level::DEBUG).with_format(OutputFormat::Compact))?;
//! tracing::info!(endpoint = "tcp://*:5060", "Control channel bound");
//! # Ok(())
//! # }
//! ```

use crate::config::ReceiverConfig;
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Output format for tracing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Pretty-printed format with colors
    Pretty,
    /// Single-line format without colors
    Compact,
    /// One JSON object per event
    Json,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(OutputFormat::Pretty),
            "compact" => Ok(OutputFormat::Compact),
            "json" => Ok(OutputFormat::Json),
            other => Err(format!(
                "Invalid log format '{other}'. Must be one of: pretty, compact, json"
            )),
        }
    }
}

/// Tracing configuration options
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Maximum level emitted
    pub level: Level,
    /// Output layout
    pub format: OutputFormat,
    /// Emit span NEW/CLOSE events
    pub with_span_events: bool,
    /// Include source file and line in each event
    pub with_file_and_line: bool,
    /// Include the emitting thread name
    pub with_thread_names: bool,
    /// Only honoured by the pretty format
    pub with_ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Compact,
            with_span_events: false,
            with_file_and_line: false,
            // The dispatch and acquisition threads are named; show which one logged.
            with_thread_names: true,
            with_ansi: true,
        }
    }
}

impl TracingConfig {
    /// Defaults with the given `level`
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Build from the `[application]` section of the receiver configuration
    pub fn from_receiver_config(config: &ReceiverConfig) -> Result<Self, String> {
        Ok(Self::new(parse_log_level(&config.application.log_level)?))
    }

    /// Use another output layout
    #[must_use]
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Log span open and close events
    #[must_use]
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }

    /// Enable or disable ANSI colors
    #[must_use]
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }
}

/// Initialize the global subscriber.
///
/// Idempotent: if a global subscriber is already installed (tests, embedding
/// applications) this returns `Ok(())` and leaves it in place.
pub fn init(config: TracingConfig) -> Result<(), String> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_to_filter_string(config.level)));

    let span_events = if config.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let layer = fmt::layer()
        .with_span_events(span_events)
        .with_file(config.with_file_and_line)
        .with_line_number(config.with_file_and_line)
        .with_thread_names(config.with_thread_names);

    let layer = match config.format {
        OutputFormat::Pretty => layer.pretty().with_ansi(config.with_ansi).boxed(),
        OutputFormat::Compact => layer.compact().with_ansi(false).boxed(),
        OutputFormat::Json => layer.json().boxed(),
    };

    tracing_subscriber::registry()
        .with(layer.with_filter(env_filter))
        .try_init()
        .or_else(|e| {
            if e.to_string().contains("global default trace dispatcher has already been set") {
                Ok(())
            } else {
                Err(format!("Failed to initialize tracing: {e}"))
            }
        })
}

/// Parse log level string into tracing Level
pub fn parse_log_level(level: &str) -> Result<Level, String> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(format!(
            "Invalid log level '{level}'. Must be one of: trace, debug, info, warn, error"
        )),
    }
}

fn level_to_filter_string(level: Level) -> String {
    level.to_string().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("trace").unwrap(), Level::TRACE);
        assert_eq!(parse_log_level("WARN").unwrap(), Level::WARN);
        assert_eq!(parse_log_level("Debug").unwrap(), Level::DEBUG);
        assert!(parse_log_level("verbose").is_err());
    }

    #[test]
    fn test_filter_string_matches_level_names() {
        assert_eq!(level_to_filter_string(Level::INFO), "info");
        assert_eq!(level_to_filter_string(Level::ERROR), "error");
    }

    #[test]
    fn test_config_from_receiver_config() {
        let mut config = ReceiverConfig::default();
        config.application.log_level = "debug".to_string();
        let tracing_config = TracingConfig::from_receiver_config(&config).unwrap();
        assert_eq!(tracing_config.level, Level::DEBUG);

        config.application.log_level = "loud".to_string();
        assert!(TracingConfig::from_receiver_config(&config).is_err());
    }

    #[test]
    fn test_output_format_parsing() {
        assert_eq!("json".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert_eq!("Pretty".parse::<OutputFormat>().unwrap(), OutputFormat::Pretty);
        assert!("xml".parse::<OutputFormat>().is_err());
    }
}
