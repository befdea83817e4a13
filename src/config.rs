//! Configuration loading using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (default `config/confocal_stepper.toml`)
//! 2. Environment variables (prefixed with `CONFOCAL_STEPPER_`)
//!
//! Every field has a default, so an empty or missing file yields a usable
//! configuration.
//!
//! # Example
//! ```no_run
//! use confocal_stepper::config::StepperConfig;
//!
//! let config = StepperConfig::load()?;
//! println!("Scanning axes {}", config.scan.axes);
//! # Ok::<(), figment::Error>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{AppResult, StepperError};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepperConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Scan geometry and counter settings
    #[serde(default)]
    pub scan: ScanConfig,
    /// Fallback axis settings for axes whose hardware read-back fails
    #[serde(default)]
    pub axis_defaults: AxisDefaults,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Scan configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Two scan axes, e.g. "xz" or "x,z"
    #[serde(default = "default_axes")]
    pub axes: String,
    /// Swap fast and slow axis
    #[serde(default)]
    pub inverted: bool,
    /// Steps (and counter bins) per line
    #[serde(default = "default_steps_per_line")]
    pub steps_per_line: usize,
    /// Lines per scan (0 = until stopped)
    #[serde(default)]
    pub lines: usize,
    /// Counter clock frequency in Hz; follows the fast-axis step frequency when unset
    #[serde(default)]
    pub clock_frequency: Option<f64>,
    /// Number of finished scans kept for back/forward navigation
    #[serde(default = "default_history_length")]
    pub history_length: usize,
}

/// Per-axis fallbacks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AxisDefaults {
    /// Step frequency in Hz
    #[serde(default = "default_frequency")]
    pub frequency: f64,
    /// Step amplitude in V
    #[serde(default = "default_amplitude")]
    pub amplitude: f64,
}

fn default_name() -> String {
    "Confocal Stepper".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_axes() -> String {
    "xz".to_string()
}

fn default_steps_per_line() -> usize {
    50
}

fn default_history_length() -> usize {
    10
}

fn default_frequency() -> f64 {
    100.0
}

fn default_amplitude() -> f64 {
    30.0
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            axes: default_axes(),
            inverted: false,
            steps_per_line: default_steps_per_line(),
            lines: 0,
            clock_frequency: None,
            history_length: default_history_length(),
        }
    }
}

impl Default for AxisDefaults {
    fn default() -> Self {
        Self {
            frequency: default_frequency(),
            amplitude: default_amplitude(),
        }
    }
}

impl StepperConfig {
    /// Load configuration from `config/confocal_stepper.toml` and environment variables
    ///
    /// Environment variables override the file with prefix `CONFOCAL_STEPPER_`.
    /// Example: `CONFOCAL_STEPPER_SCAN__STEPS_PER_LINE=100`
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from("config/confocal_stepper.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(StepperConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("CONFOCAL_STEPPER_").split("__"))
            .extract()
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(StepperError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.scan.steps_per_line == 0 {
            return Err(StepperError::Configuration(
                "steps_per_line must be at least 1".to_string(),
            ));
        }

        if let Some(clock) = self.scan.clock_frequency {
            if !(clock.is_finite() && clock > 0.0) {
                return Err(StepperError::Configuration(format!(
                    "Invalid clock_frequency {clock}. Must be positive and finite"
                )));
            }
        }

        let frequency = self.axis_defaults.frequency;
        if !(frequency.is_finite() && frequency > 0.0) {
            return Err(StepperError::Configuration(format!(
                "Invalid default frequency {}. Must be positive and finite",
                self.axis_defaults.frequency
            )));
        }

        let amplitude = self.axis_defaults.amplitude;
        if !(amplitude.is_finite() && amplitude >= 0.0) {
            return Err(StepperError::Configuration(format!(
                "Invalid default amplitude {}. Must be finite and not negative",
                self.axis_defaults.amplitude
            )));
        }

        crate::scan::ScanAxes::parse(&self.scan.axes, self.scan.inverted)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = StepperConfig::default();
        assert_eq!(config.scan.axes, "xz");
        assert_eq!(config.scan.steps_per_line, 50);
        assert!(!config.scan.inverted);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [application]
            log_level = "debug"

            [scan]
            axes = "x,y"
            inverted = true
            steps_per_line = 20
            lines = 5
            clock_frequency = 250.0
            "#
        )
        .unwrap();

        let config = StepperConfig::load_from(file.path()).unwrap();
        assert_eq!(config.application.log_level, "debug");
        assert_eq!(config.application.name, "Confocal Stepper");
        assert_eq!(config.scan.axes, "x,y");
        assert!(config.scan.inverted);
        assert_eq!(config.scan.steps_per_line, 20);
        assert_eq!(config.scan.lines, 5);
        assert_eq!(config.scan.clock_frequency, Some(250.0));
        assert_eq!(config.scan.history_length, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = StepperConfig::load_from("does/not/exist.toml").unwrap();
        assert_eq!(config.scan.steps_per_line, 50);
        assert_eq!(config.scan.clock_frequency, None);
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = StepperConfig::default();
        config.application.log_level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_steps_rejected() {
        let mut config = StepperConfig::default();
        config.scan.steps_per_line = 0;
        assert!(matches!(
            config.validate(),
            Err(StepperError::Configuration(_))
        ));
    }

    #[test]
    fn test_single_axis_rejected() {
        let mut config = StepperConfig::default();
        config.scan.axes = "x".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_non_finite_rates_rejected() {
        let mut config = StepperConfig::default();
        config.scan.clock_frequency = Some(f64::NAN);
        assert!(config.validate().is_err());

        let mut config = StepperConfig::default();
        config.scan.clock_frequency = Some(f64::INFINITY);
        assert!(config.validate().is_err());

        let mut config = StepperConfig::default();
        config.axis_defaults.frequency = f64::NAN;
        assert!(config.validate().is_err());

        let mut config = StepperConfig::default();
        config.axis_defaults.amplitude = f64::INFINITY;
        assert!(config.validate().is_err());
    }
}
