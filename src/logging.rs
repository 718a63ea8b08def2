//! Tracing subscriber setup
//!
//! The level comes from [`Settings::log_level`](crate::config::Settings);
//! `RUST_LOG`, when set, takes precedence.
//!
//! # Example
//! ```no_run
//! use sr785_daq::{config::Settings, logging};
//!
//! let settings = Settings::load(None)?;
//! logging::init_from_settings(&settings)?;
//! tracing::info!("ready");
//! # Ok::<(), anyhow::Error>(())
//! ```

use crate::config::Settings;
use anyhow::{anyhow, Result};
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Multi-line with colors, for interactive use
    Pretty,
    /// One line per event, no colors
    Compact,
}

/// Subscriber options.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Default level when `RUST_LOG` is unset
    pub level: Level,
    /// Output format
    pub format: OutputFormat,
    /// Log span close events (shows how long each exchange took)
    pub with_span_events: bool,
    /// Include source file and line
    pub with_file_and_line: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Compact,
            with_span_events: false,
            with_file_and_line: false,
        }
    }
}

impl TracingConfig {
    /// Options for `level`, everything else default.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Options from loaded settings.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Ok(Self::new(parse_log_level(&settings.log_level)?))
    }

    /// Set output format.
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Enable or disable span close events.
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }
}

/// Install the global subscriber from settings.
pub fn init_from_settings(settings: &Settings) -> Result<()> {
    init(TracingConfig::from_settings(settings)?)
}

/// Install the global subscriber.
///
/// Calling this twice is not an error; the first subscriber stays.
pub fn init(config: TracingConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str().to_lowercase()));

    let span_events = if config.with_span_events {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let result = match config.format {
        OutputFormat::Pretty => tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .pretty()
                    .with_span_events(span_events)
                    .with_file(config.with_file_and_line)
                    .with_line_number(config.with_file_and_line)
                    .with_filter(env_filter),
            )
            .try_init(),
        OutputFormat::Compact => tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .compact()
                    .with_span_events(span_events)
                    .with_file(config.with_file_and_line)
                    .with_line_number(config.with_file_and_line)
                    .with_ansi(false)
                    .with_filter(env_filter),
            )
            .try_init(),
    };

    result.or_else(|e| {
        if e.to_string().contains("global default trace dispatcher has already been set") {
            Ok(())
        } else {
            Err(anyhow!("Failed to initialize tracing: {e}"))
        }
    })
}

/// Parse a level name, case-insensitively.
pub fn parse_log_level(level: &str) -> Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(anyhow!(
            "Invalid log level '{level}'. Must be one of: trace, debug, info, warn, error"
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("debug").unwrap(), Level::DEBUG);
        assert_eq!(parse_log_level("WARN").unwrap(), Level::WARN);
        assert!(parse_log_level("loud").is_err());
    }

    #[test]
    fn test_config_from_settings() {
        let settings = Settings {
            log_level: "trace".into(),
            ..Settings::default()
        };
        let config = TracingConfig::from_settings(&settings)
            .unwrap()
            .with_format(OutputFormat::Pretty);
        assert_eq!(config.level, Level::TRACE);
        assert_eq!(config.format, OutputFormat::Pretty);
    }

    #[test]
    fn test_init_twice_is_ok() {
        assert!(init(TracingConfig::new(Level::WARN)).is_ok());
        assert!(init(TracingConfig::new(Level::WARN)).is_ok());
    }
}
