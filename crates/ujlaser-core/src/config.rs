//! Configuration loading using Figment.
//!
//! Configuration is loaded from:
//! 1. a TOML file (`config/ujlaser.toml` by default)
//! 2. environment variables prefixed with `UJLASER_`, `__` separating nested
//!    keys (`UJLASER_TIMING__ARMING_DELAY=8s`)
//!
//! Every field has a default, so an empty or missing file yields a usable
//! configuration. Durations are written in humantime notation (`"500ms"`).
//!
//! # Example
//! ```no_run
//! use ujlaser_core::config::LaserConfig;
//!
//! let config = LaserConfig::load_from("config/ujlaser.toml")?;
//! config.validate().map_err(ujlaser_core::error::LaserError::Configuration)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::limits;
use crate::types::DeviceLimits;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/ujlaser.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "UJLASER_";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaserConfig {
    /// Serial link settings
    pub serial: SerialConfig,
    /// Device addressing
    pub device: DeviceConfig,
    /// Arming, fire and kicker timing
    pub timing: TimingConfig,
    /// Parameter ranges enforced before commands reach the wire
    pub limits: DeviceLimits,
    /// Log output
    pub logging: LoggingConfig,
}

/// Serial link settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Port path (e.g. `/dev/ttyUSB0`). Usually supplied on the command line.
    pub port: Option<String>,
    /// Line rate in baud.
    pub baud_rate: u32,
    /// Time allowed for each response.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: limits::DEFAULT_BAUD_RATE,
            timeout: limits::RESPONSE_TIMEOUT,
        }
    }
}

/// Device addressing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Two-character address in every frame.
    pub address: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            address: limits::DEFAULT_ADDRESS.to_string(),
        }
    }
}

/// Timing of the arm/fire sequence and the background tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Delay between `EN 1` and ready-to-fire on the emulated device.
    #[serde(with = "humantime_serde")]
    pub arming_delay: Duration,
    /// Cadence of the kicker's status queries.
    #[serde(with = "humantime_serde")]
    pub kicker_interval: Duration,
    /// Shortest fire sequence that runs the kicker.
    #[serde(with = "humantime_serde")]
    pub kicker_threshold: Duration,
    /// Status poll cadence during a fire sequence and while arming.
    #[serde(with = "humantime_serde")]
    pub fire_poll_interval: Duration,
    /// How long after the sequence ends the laser may still report active.
    #[serde(with = "humantime_serde")]
    pub fire_completion_grace: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            arming_delay: limits::ARMING_DELAY,
            kicker_interval: limits::KICKER_INTERVAL,
            kicker_threshold: limits::KICKER_THRESHOLD,
            fire_poll_interval: limits::FIRE_POLL_INTERVAL,
            fire_completion_grace: limits::FIRE_COMPLETION_GRACE,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, human-readable
    #[default]
    Pretty,
    /// Single line per event
    Compact,
    /// Structured JSON
    Json,
}

/// Log output settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive (trace, debug, info, warn, error). `RUST_LOG` wins.
    pub level: String,
    /// Output layout.
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl LaserConfig {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path. A missing file yields defaults.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let address = &self.device.address;
        if address.len() != 2 || !address.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(format!(
                "Invalid device address '{address}'. Must be two ASCII letters or digits"
            ));
        }

        if self.serial.baud_rate == 0 {
            return Err("Invalid baud_rate 0".to_string());
        }

        let durations = [
            ("serial.timeout", self.serial.timeout),
            ("timing.arming_delay", self.timing.arming_delay),
            ("timing.kicker_interval", self.timing.kicker_interval),
            ("timing.kicker_threshold", self.timing.kicker_threshold),
            ("timing.fire_poll_interval", self.timing.fire_poll_interval),
            ("timing.fire_completion_grace", self.timing.fire_completion_grace),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(format!("Invalid {name}: must be greater than zero"));
            }
        }

        let limits = &self.limits;
        let ordered = [
            ("burst_count", limits.burst_count.is_ordered()),
            ("diode_current", limits.diode_current.is_ordered()),
            ("pulse_width", limits.pulse_width.is_ordered()),
            ("pulse_period", limits.pulse_period.is_ordered()),
            ("rep_rate", limits.rep_rate.is_ordered()),
            ("settings_slot", limits.settings_slot.is_ordered()),
        ];
        for (name, ok) in ordered {
            if !ok {
                return Err(format!("Invalid limits.{name}: min exceeds max"));
            }
        }

        if limits.rep_rate.min < 1.0 || limits.rep_rate.max > 5.0 {
            return Err(format!(
                "Invalid limits.rep_rate {}. Must lie within 1..=5 Hz",
                limits.rep_rate
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels
            .iter()
            .any(|level| level.eq_ignore_ascii_case(&self.logging.level))
        {
            return Err(format!(
                "Invalid logging.level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = LaserConfig::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.device.address, "LA");
        assert_eq!(config.timing.arming_delay, Duration::from_secs(8));
        assert_eq!(config.serial.baud_rate, 115_200);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parses_humantime_durations() {
        let file = write_config(
            r#"
            [serial]
            port = "/dev/ttyUSB0"
            timeout = "250ms"

            [timing]
            arming_delay = "2s"
            kicker_interval = "1s"

            [limits.rep_rate]
            min = 1.0
            max = 3.0

            [logging]
            level = "debug"
            format = "json"
            "#,
        );

        let config = LaserConfig::load_from(file.path()).unwrap();
        assert_eq!(config.serial.port.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(config.serial.timeout, Duration::from_millis(250));
        assert_eq!(config.timing.arming_delay, Duration::from_secs(2));
        assert_eq!(config.timing.kicker_interval, Duration::from_secs(1));
        assert_eq!(config.timing.kicker_threshold, Duration::from_secs(2));
        assert_eq!(config.limits.rep_rate.max, 3.0);
        assert_eq!(config.limits.burst_count.max, 65535);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_bad_address() {
        let mut config = LaserConfig::default();
        config.device.address = "LAS".into();
        assert!(config.validate().is_err());
        config.device.address = "L;".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_interval() {
        let mut config = LaserConfig::default();
        config.timing.kicker_interval = Duration::ZERO;
        let err = config.validate().unwrap_err();
        assert!(err.contains("kicker_interval"));
    }

    #[test]
    fn rejects_inverted_and_out_of_range_limits() {
        let mut config = LaserConfig::default();
        config.limits.diode_current.min = 200.0;
        assert!(config.validate().unwrap_err().contains("diode_current"));

        let mut config = LaserConfig::default();
        config.limits.rep_rate.max = 10.0;
        assert!(config.validate().unwrap_err().contains("rep_rate"));
    }

    #[test]
    fn rejects_unknown_log_level() {
        let mut config = LaserConfig::default();
        config.logging.level = "loud".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn log_level_is_case_insensitive() {
        let mut config = LaserConfig::default();
        config.logging.level = "DEBUG".into();
        assert!(config.validate().is_ok());
        config.logging.level = "Warn".into();
        assert!(config.validate().is_ok());
    }
}
