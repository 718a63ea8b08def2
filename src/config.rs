//! Layered settings using Figment
//!
//! Settings are merged from, in increasing priority:
//! 1. Built-in defaults (SR785 over RS-232 at 9600 baud)
//! 2. An optional TOML file
//! 3. Environment variables prefixed with `SR785_`, `__` separating nested keys
//!
//! # Example
//! ```no_run
//! use sr785_daq::config::Settings;
//! use std::path::Path;
//!
//! // SR785_CONNECTION__PORT=/dev/ttyS1 overrides the file
//! let settings = Settings::load(Some(Path::new("config/sr785.toml")))?;
//! println!("Port: {}", settings.connection.port);
//! # Ok::<(), anyhow::Error>(())
//! ```

use anyhow::{bail, Context, Result};
use daq_core::serial::SerialConfig;
use daq_driver_sr785::{Dialect, PollConfig};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "SR785_";

/// Top-level settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Serial link
    pub connection: SerialConfig,
    /// Wire constants
    pub dialect: Dialect,
    /// Default completion polling
    pub polling: PollConfig,
    /// Data file output
    pub output: OutputSettings,
}

/// Where and how measurement files are written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    /// Directory for data and parameter files
    pub directory: PathBuf,
    /// Column delimiter in the data file
    pub delimiter: char,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            connection: SerialConfig::default(),
            dialect: Dialect::default(),
            polling: PollConfig::default(),
            output: OutputSettings::default(),
        }
    }
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("data"),
            delimiter: '\t',
        }
    }
}

impl Settings {
    /// Figment with defaults, `path` (if given) and the environment merged.
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Load and validate settings.
    ///
    /// A `path` that does not exist is an error; with `None` only defaults and
    /// the environment apply.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            if !path.exists() {
                bail!("config file {} not found", path.display());
            }
        }

        let settings: Settings = Self::figment(path)
            .extract()
            .with_context(|| match path {
                Some(p) => format!("failed to load settings from {}", p.display()),
                None => "failed to load settings from environment".to_string(),
            })?;

        settings.validate()?;
        Ok(settings)
    }

    /// Reject values that would fail only once the port is open.
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            bail!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            );
        }

        self.connection
            .validate()
            .map_err(anyhow::Error::msg)
            .context("invalid [connection] settings")?;
        self.dialect
            .validate()
            .map_err(anyhow::Error::msg)
            .context("invalid [dialect] settings")?;
        self.polling
            .validate()
            .map_err(anyhow::Error::msg)
            .context("invalid [polling] settings")?;

        let delimiter = self.output.delimiter;
        if !delimiter.is_ascii() || delimiter == '\n' || delimiter == '\r' {
            bail!("output delimiter must be an ASCII character other than a line break");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.connection.baud_rate, 9600);
        assert_eq!(settings.output.delimiter, '\t');
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
log_level = "debug"

[connection]
port = "/dev/ttyS3"
baud_rate = 19200
timeout = "250ms"

[polling]
timeout = "2m"
interval = "1s"
"#
        )
        .unwrap();

        let settings: Settings = Settings::figment(Some(file.path())).extract().unwrap();
        assert_eq!(settings.log_level, "debug");
        assert_eq!(settings.connection.port, "/dev/ttyS3");
        assert_eq!(settings.connection.baud_rate, 19200);
        assert_eq!(settings.connection.timeout, Duration::from_millis(250));
        assert_eq!(settings.connection.write_retries, 3);
        assert_eq!(settings.polling.timeout, Duration::from_secs(120));
        assert_eq!(settings.dialect, Dialect::default());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut settings = Settings::default();
        settings.log_level = "verbose".into();
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.connection.baud_rate = 0;
        let err = settings.validate().unwrap_err();
        assert!(format!("{err:#}").contains("baud_rate"));

        let mut settings = Settings::default();
        settings.polling.interval = Duration::ZERO;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let err = Settings::load(Some(Path::new("/nonexistent/sr785.toml"))).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
