//! Application configuration using Figment.
//!
//! Configuration is layered from:
//! 1. `config/daq_plan.toml` (or a file given on the command line)
//! 2. Environment variables prefixed with `DAQ_PLAN_`, nested keys separated
//!    by a double underscore, e.g. `DAQ_PLAN_APPLICATION__LOG_LEVEL=debug`
//!
//! Every key has a default, so a missing file yields a usable configuration.
//!
//! # Example
//! ```no_run
//! use daq_plan::config::AppConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AppConfig::load()?;
//! config.validate()?;
//! println!("Writing data below {}", config.storage.data_dir.display());
//! # Ok(())
//! # }
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{PlanError, PlanResult};

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/daq_plan.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "DAQ_PLAN_";

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Where experiment output goes
    #[serde(default)]
    pub storage: StorageConfig,
    /// Plan engine defaults
    #[serde(default)]
    pub engine: EngineConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

/// Storage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root data directory; each plan run writes below `<data_dir>/<plan>`
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Save the experiment record as JSON when a run finishes
    #[serde(default = "default_save_record")]
    pub save_record: bool,
}

/// Plan engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// SEV polling period used when a plan file does not specify one
    #[serde(default = "default_poll_period_ms")]
    pub default_poll_period_ms: u64,
}

fn default_name() -> String {
    "daq-plan".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_save_record() -> bool {
    true
}

fn default_poll_period_ms() -> u64 {
    100
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            save_record: default_save_record(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_poll_period_ms: default_poll_period_ms(),
        }
    }
}

impl EngineConfig {
    /// Default SEV polling period.
    pub fn default_poll_period(&self) -> Duration {
        Duration::from_millis(self.default_poll_period_ms)
    }
}

impl AppConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> PlanResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from `path` and the environment. A missing file is not an error.
    pub fn load_from<P: AsRef<Path>>(path: P) -> PlanResult<Self> {
        let config = Self::figment(path.as_ref()).extract()?;
        Ok(config)
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> PlanResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(PlanError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.to_lowercase().as_str()) {
            return Err(PlanError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.engine.default_poll_period_ms == 0 {
            return Err(PlanError::Configuration(
                "default_poll_period_ms must be greater than 0".to_string(),
            ));
        }

        if self.storage.data_dir.as_os_str().is_empty() {
            return Err(PlanError::Configuration("data_dir must not be empty".to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let config = AppConfig::load_from(dir.path().join("absent.toml")).unwrap();

        assert_eq!(config.application.log_format, "pretty");
        assert_eq!(config.storage.data_dir, PathBuf::from("data"));
        assert!(config.storage.save_record);
        assert_eq!(config.engine.default_poll_period(), Duration::from_millis(100));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("daq_plan.toml");
        fs::write(
            &path,
            r#"
[application]
name = "I15-1 plans"
log_format = "json"

[storage]
data_dir = "/dls/i15-1/data/2026"
save_record = false

[engine]
default_poll_period_ms = 250
"#,
        )
        .unwrap();

        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.application.name, "I15-1 plans");
        assert_eq!(config.application.log_format, "json");
        assert_eq!(config.storage.data_dir, PathBuf::from("/dls/i15-1/data/2026"));
        assert!(!config.storage.save_record);
        assert_eq!(config.engine.default_poll_period_ms, 250);
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "[engine]\ndefault_poll_period_ms = \"soon\"\n").unwrap();

        let err = AppConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, PlanError::Config(_)));
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.application.log_level = "verbose".to_string();
        assert!(config.validate().unwrap_err().is_configuration());

        let mut config = AppConfig::default();
        config.application.log_format = "xml".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.engine.default_poll_period_ms = 0;
        assert!(config.validate().is_err());
    }
}
