//! Configuration System using Figment
//!
//! Configuration is layered from:
//! 1. Built-in defaults (`SweepConfig::default()`)
//! 2. A TOML file (optional, e.g. `config/sweep.toml`)
//! 3. Environment variables prefixed with `SWEEP_DAQ_`, using `__` to
//!    separate nested keys
//!
//! # Example
//! ```no_run
//! use sweep_daq::config::SweepConfig;
//!
//! let config = SweepConfig::load_from("config/sweep.toml")?;
//! println!("Flushing every {} rows", config.capture.max_buf_size);
//! # Ok::<(), sweep_daq::error::SweepError>(())
//! ```
//!
//! Environment override example: `SWEEP_DAQ_CAPTURE__MAX_BUF_SIZE=50`.

use crate::error::{SweepError, SweepResult};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Capture pipeline and export settings
    #[serde(default)]
    pub capture: CaptureConfig,
    /// Sweep controller timing and mode
    #[serde(default)]
    pub controller: ControllerConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "sweep_daq".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Capture pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Rows buffered in memory before a synchronous flush
    #[serde(default = "default_max_buf_size")]
    pub max_buf_size: usize,
    /// Whether rows are exported to CSV at all
    #[serde(default = "default_true")]
    pub export_enabled: bool,
    /// Directory receiving `YYYY-MM-DD_HH-MM-SS.csv` files
    #[serde(default)]
    pub export_dir: Option<PathBuf>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            max_buf_size: default_max_buf_size(),
            export_enabled: true,
            export_dir: None,
        }
    }
}

/// Sweep controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Status polling cadence for control surfaces
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Completion is not announced before this much time has passed since start
    #[serde(default = "default_min_display", with = "humantime_serde")]
    pub min_display: Duration,
    /// Settle time used when no changed variable specifies its own wait
    #[serde(default, with = "humantime_serde")]
    pub default_dwell: Duration,
    /// Restart the iteration space after exhaustion until aborted
    #[serde(default)]
    pub continuous: bool,
    /// Capacity of the sweep event broadcast channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            min_display: default_min_display(),
            default_dwell: Duration::ZERO,
            continuous: false,
            event_capacity: default_event_capacity(),
        }
    }
}

// Default value functions
fn default_max_buf_size() -> usize {
    10
}

fn default_true() -> bool {
    true
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(50)
}

fn default_min_display() -> Duration {
    Duration::from_secs(2)
}

fn default_event_capacity() -> usize {
    1024
}

impl SweepConfig {
    /// Load defaults overridden by environment variables only
    pub fn load() -> SweepResult<Self> {
        let config: Self = Self::base_figment()
            .merge(Env::prefixed("SWEEP_DAQ_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path, then the environment
    pub fn load_from<P: AsRef<Path>>(path: P) -> SweepResult<Self> {
        let config: Self = Self::base_figment()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SWEEP_DAQ_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    fn base_figment() -> Figment {
        Figment::from(Serialized::defaults(SweepConfig::default()))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> SweepResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(SweepError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.capture.max_buf_size == 0 {
            return Err(SweepError::Configuration(
                "capture.max_buf_size must be at least 1".to_string(),
            ));
        }

        if self.controller.event_capacity == 0 {
            return Err(SweepError::Configuration(
                "controller.event_capacity must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = SweepConfig::default();
        assert_eq!(config.capture.max_buf_size, 10);
        assert!(config.capture.export_enabled);
        assert_eq!(config.controller.poll_interval, Duration::from_millis(50));
        assert_eq!(config.controller.min_display, Duration::from_secs(2));
        assert!(!config.controller.continuous);
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[application]
name = "bench"
log_level = "debug"

[capture]
max_buf_size = 25
export_dir = "/tmp/sweeps"

[controller]
min_display = "500ms"
default_dwell = "20ms"
continuous = true
"#
        )
        .unwrap();

        let config = SweepConfig::load_from(file.path()).unwrap();
        assert_eq!(config.application.name, "bench");
        assert_eq!(config.capture.max_buf_size, 25);
        assert_eq!(config.capture.export_dir, Some(PathBuf::from("/tmp/sweeps")));
        assert_eq!(config.controller.min_display, Duration::from_millis(500));
        assert_eq!(config.controller.default_dwell, Duration::from_millis(20));
        assert!(config.controller.continuous);
        // Untouched keys keep their defaults
        assert_eq!(config.controller.poll_interval, Duration::from_millis(50));
    }

    #[test]
    #[serial]
    fn test_env_override() {
        std::env::set_var("SWEEP_DAQ_CAPTURE__MAX_BUF_SIZE", "3");
        let config = SweepConfig::load();
        std::env::remove_var("SWEEP_DAQ_CAPTURE__MAX_BUF_SIZE");

        assert_eq!(config.unwrap().capture.max_buf_size, 3);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = SweepConfig::default();
        config.application.log_level = "verbose".to_string();
        assert!(config.validate().is_err());

        let mut config = SweepConfig::default();
        config.capture.max_buf_size = 0;
        assert!(config.validate().is_err());
    }
}
