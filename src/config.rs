//! Configuration system using Figment
//!
//! Settings are layered, highest precedence last:
//! 1. Built-in defaults
//! 2. A TOML file (default `config/minipuls.toml`, missing file is fine)
//! 3. Environment variables prefixed with `MINIPULS_`, nested with `__`
//!
//! ```text
//! MINIPULS_SERIAL__PORT=/dev/ttyUSB1
//! MINIPULS_SERIAL__UNIT_ID=31
//! MINIPULS_TIMING__COMMAND_INTERVAL_S=0.25
//! ```
//!
//! # Example
//!
//! ```toml
//! [application]
//! log_level = "debug"
//!
//! [serial]
//! port = "/dev/ttyUSB0"
//! unit_id = 30
//! simulate = false
//!
//! [timing]
//! command_interval_s = 0.2
//! monitor_interval_ms = 100
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default location of the settings file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/minipuls.toml";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Figment could not read or merge a layer
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    /// A value is out of range
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Serial bus and unit addressing
    #[serde(default)]
    pub serial: SerialConfig,
    /// Pacing of device commands, previews and progress reports
    #[serde(default)]
    pub timing: TimingConfig,
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
    /// Emit JSON formatted log lines instead of human readable ones
    #[serde(default)]
    pub json_logs: bool,
    /// Number of log entries kept in the in-memory log buffer
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,
}

/// Serial transport configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Serial port (e.g., "/dev/ttyUSB0", "COM4")
    #[serde(default = "default_port")]
    pub port: String,
    /// Bus unit id of the pump
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
    /// Baud rate
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Handshake read timeout in milliseconds
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,
    /// Delay after the bus-reset byte in milliseconds
    #[serde(default = "default_reset_delay")]
    pub reset_delay_ms: u64,
    /// Run without hardware; every command is only logged
    #[serde(default)]
    pub simulate: bool,
}

/// Timing configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Delay enforced after buffered commands, in seconds
    #[serde(default = "default_command_interval")]
    pub command_interval_s: f64,
    /// Ramp granularity used for previews when no pump is connected, in seconds
    #[serde(default = "default_ramp_interval")]
    pub default_ramp_interval_s: f64,
    /// Progress report cadence in milliseconds
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_ms: u64,
    /// Interpreter step cap for plan expansion
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_name() -> String {
    "MINIPULS 3 Controller".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_capacity() -> usize {
    1000
}

fn default_port() -> String {
    if cfg!(windows) {
        "COM4".to_string()
    } else {
        "/dev/ttyUSB0".to_string()
    }
}

fn default_unit_id() -> u8 {
    30
}

fn default_baud_rate() -> u32 {
    19200
}

fn default_read_timeout() -> u64 {
    1000
}

fn default_reset_delay() -> u64 {
    50
}

fn default_command_interval() -> f64 {
    0.2
}

fn default_ramp_interval() -> f64 {
    0.1
}

fn default_monitor_interval() -> u64 {
    100
}

fn default_max_iterations() -> usize {
    10_000
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            json_logs: false,
            log_capacity: default_log_capacity(),
        }
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            unit_id: default_unit_id(),
            baud_rate: default_baud_rate(),
            read_timeout_ms: default_read_timeout(),
            reset_delay_ms: default_reset_delay(),
            simulate: false,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            command_interval_s: default_command_interval(),
            default_ramp_interval_s: default_ramp_interval(),
            monitor_interval_ms: default_monitor_interval(),
            max_iterations: default_max_iterations(),
        }
    }
}

// ============================================================================
// Loading and Validation
// ============================================================================

impl Settings {
    /// Load settings from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load settings from a specific TOML file and the environment.
    ///
    /// A missing file leaves the defaults in place; a malformed one is an error.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::from_figment(
            Figment::from(Serialized::defaults(Settings::default()))
                .merge(Toml::file(path.as_ref()))
                .merge(Env::prefixed("MINIPULS_").split("__")),
        )
    }

    /// Parse settings from a TOML string (no environment overrides).
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        Self::from_figment(
            Figment::from(Serialized::defaults(Settings::default())).merge(Toml::string(toml)),
        )
    }

    fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let settings: Self = figment
            .extract()
            .map_err(|e| ConfigError::LoadError(Box::new(e)))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate settings after loading
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.application.log_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "log_capacity must be at least 1".to_string(),
            ));
        }

        if self.serial.unit_id > 0x7F {
            return Err(ConfigError::ValidationError(format!(
                "Invalid unit_id {}. Must be 0-127",
                self.serial.unit_id
            )));
        }

        if !self.serial.simulate && self.serial.port.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "serial.port cannot be empty unless simulate = true".to_string(),
            ));
        }

        if self.serial.baud_rate == 0 {
            return Err(ConfigError::ValidationError(
                "baud_rate must be positive".to_string(),
            ));
        }

        for (name, value) in [
            ("command_interval_s", self.timing.command_interval_s),
            ("default_ramp_interval_s", self.timing.default_ramp_interval_s),
        ] {
            if Duration::try_from_secs_f64(value).is_err() {
                return Err(ConfigError::ValidationError(format!(
                    "{} must be a non-negative number of seconds, got {}",
                    name, value
                )));
            }
        }

        if self.timing.monitor_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "monitor_interval_ms must be positive".to_string(),
            ));
        }

        if self.timing.max_iterations == 0 {
            return Err(ConfigError::ValidationError(
                "max_iterations must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

/// Seconds as a [`Duration`], saturating for values [`Settings::validate`] rejects.
fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(if value > 0.0 {
        Duration::MAX
    } else {
        Duration::ZERO
    })
}

impl SerialConfig {
    /// Handshake read timeout.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Settle time after the bus-reset byte.
    pub fn reset_delay(&self) -> Duration {
        Duration::from_millis(self.reset_delay_ms)
    }
}

impl TimingConfig {
    /// Inter-command delay as a [`Duration`].
    pub fn command_interval(&self) -> Duration {
        seconds(self.command_interval_s)
    }

    /// Ramp sampling interval for previews while disconnected.
    pub fn default_ramp_interval(&self) -> Duration {
        seconds(self.default_ramp_interval_s)
    }

    /// Progress report cadence.
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        settings.validate().unwrap();
        assert_eq!(settings.serial.unit_id, 30);
        assert_eq!(settings.serial.baud_rate, 19200);
        assert_eq!(settings.timing.command_interval(), Duration::from_millis(200));
        assert_eq!(settings.timing.max_iterations, 10_000);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let settings = Settings::from_toml_str(
            r#"
[serial]
port = "COM7"
simulate = true

[timing]
command_interval_s = 0.5
"#,
        )
        .unwrap();
        assert_eq!(settings.serial.port, "COM7");
        assert!(settings.serial.simulate);
        assert_eq!(settings.serial.unit_id, 30);
        assert_eq!(settings.timing.command_interval_s, 0.5);
        assert_eq!(settings.timing.monitor_interval_ms, 100);
    }

    #[test]
    fn test_rejects_negative_interval() {
        let err = Settings::from_toml_str("[timing]\ncommand_interval_s = -1.0\n").unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_rejects_unrepresentable_interval() {
        let err = Settings::from_toml_str("[timing]\ncommand_interval_s = 1e30\n").unwrap_err();
        assert!(err.to_string().contains("command_interval_s"));
        let err =
            Settings::from_toml_str("[timing]\ndefault_ramp_interval_s = 1e30\n").unwrap_err();
        assert!(err.to_string().contains("default_ramp_interval_s"));

        let timing = TimingConfig {
            command_interval_s: 1e30,
            default_ramp_interval_s: f64::NAN,
            ..TimingConfig::default()
        };
        assert_eq!(timing.command_interval(), Duration::MAX);
        assert_eq!(timing.default_ramp_interval(), Duration::ZERO);
    }

    #[test]
    fn test_rejects_bad_log_level() {
        let err = Settings::from_toml_str("[application]\nlog_level = \"loud\"\n").unwrap_err();
        assert!(err.to_string().contains("Invalid log_level"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("minipuls.toml");
        std::fs::write(&path, "[serial]\nunit_id = 12\nsimulate = true\n").unwrap();
        let settings = Settings::load_from(&path).unwrap();
        assert_eq!(settings.serial.unit_id, 12);
    }
}
