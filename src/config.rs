/*
  hydroctl, an environmental control runtime for hydroponic installations.
  Copyright (C) 2024 the hydroctl developers.

  hydroctl is free software: you can redistribute it and/or modify
  it under the terms of the GNU General Public License as published by
  the Free Software Foundation, either version 3 of the License, or
  (at your option) any later version.

  hydroctl is distributed in the hope that it will be useful,
  but WITHOUT ANY WARRANTY; without even the implied warranty of
  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
  GNU General Public License for more details.

  You should have received a copy of the GNU General Public License
  along with this program.  If not, see <http://www.gnu.org/licenses/>.
*/

//! Loading and validating the runtime configuration.
//!
//! The configuration declares everything the runtime needs before any sensor
//! or controller exists: the GPIO character device, the output pin pool with
//! its safety interlocks, bus numbers, retention limits and the data
//! directory. The runtime refuses to start on any schema violation.

use std::{io::Read, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default maximum continuous HIGH time for an output pin, in seconds.
const DEFAULT_MAX_ON_SECS: u64 = 600;

/// Default ADC reference voltage in millivolts.
const DEFAULT_VREF_MV: u32 = 3300;

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(deny_unknown_fields)]
/// The full configuration of the control runtime.
pub struct RuntimeConfig {
    /// Directory where the entity registry and measurement logs live.
    pub data_dir: PathBuf,
    /// Path of the GPIO character device.
    #[serde(default = "default_gpio_chip")]
    pub gpio_chip: String,
    /// The I²C bus numbers that drivers are allowed to open.
    #[serde(default)]
    pub i2c_buses: Vec<u8>,
    /// Directory of the 1-Wire slave tree.
    #[serde(default = "default_onewire_dir")]
    pub onewire_dir: PathBuf,
    /// The pool of output pins the arbiter manages.
    /// No other component may touch a pin, and no pin outside this pool can
    /// ever be driven.
    pub output_pins: Vec<OutputPinConfig>,
    /// Retention limits for measurements and controller actions.
    #[serde(default)]
    pub retention: RetentionConfig,
    /// ADC reference voltage in millivolts, used to scale CS1237 counts.
    #[serde(default = "default_vref_mv")]
    pub adc_vref_mv: u32,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
#[serde(deny_unknown_fields)]
/// One managed output pin and its safety interlocks.
pub struct OutputPinConfig {
    /// The platform pin number.
    pub pin: u8,
    /// Human-readable label, unique across the pool.
    pub label: String,
    /// Maximum continuous HIGH time in seconds before the arbiter forces the
    /// pin LOW.
    #[serde(default = "default_max_on_secs")]
    pub max_on_secs: u64,
    /// Minimum time in seconds between two LOW-to-HIGH transitions.
    #[serde(default)]
    pub min_interval_secs: u64,
}

impl OutputPinConfig {
    #[must_use]
    /// The maximum continuous HIGH time as a [`Duration`].
    pub fn max_on(&self) -> Duration {
        Duration::from_secs(self.max_on_secs)
    }

    #[must_use]
    /// The minimum rise-to-rise interval as a [`Duration`].
    pub fn min_interval(&self) -> Duration {
        Duration::from_secs(self.min_interval_secs)
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
#[serde(deny_unknown_fields)]
/// Bounds on how much history the measurement store keeps.
pub struct RetentionConfig {
    /// Maximum age of an in-memory measurement, in seconds.
    pub max_age_secs: u64,
    /// Maximum number of in-memory measurements per sensor.
    pub max_points: usize,
    /// Age of the window replayed from disk after a restart, in seconds.
    pub durable_age_secs: u64,
    /// Maximum number of retained controller action entries.
    pub action_log_cap: usize,
}

impl Default for RetentionConfig {
    fn default() -> RetentionConfig {
        RetentionConfig {
            max_age_secs: 24 * 60 * 60,
            max_points: 100_000,
            durable_age_secs: 6 * 60 * 60,
            action_log_cap: 10_000,
        }
    }
}

fn default_gpio_chip() -> String {
    "/dev/gpiochip0".into()
}

fn default_onewire_dir() -> PathBuf {
    "/sys/bus/w1/devices".into()
}

fn default_max_on_secs() -> u64 {
    DEFAULT_MAX_ON_SECS
}

fn default_vref_mv() -> u32 {
    DEFAULT_VREF_MV
}

#[derive(Debug, Error)]
/// The set of errors that can occur when validating a configuration.
pub enum ConfigError {
    /// The configuration could not be parsed at all.
    #[error("failed to parse configuration JSON: {0}")]
    Malformed(#[from] serde_json::Error),
    /// A pin number is reserved or out of range for the platform.
    #[error("GPIO pin {0} is reserved or out of range")]
    ReservedPin(u8),
    /// The same pin appears twice in the output pool.
    #[error("GPIO pin {0} is declared more than once")]
    DuplicatePin(u8),
    /// Two output pins share a label.
    #[error("output label {0:?} is used more than once")]
    DuplicateLabel(String),
    /// An output pin label is empty.
    #[error("output pin {0} has an empty label")]
    EmptyLabel(u8),
    /// The same I²C bus number appears twice.
    #[error("I2C bus {0} is declared more than once")]
    DuplicateBus(u8),
    /// A retention limit is zero, which would drop every measurement.
    #[error("retention limit {0} must be nonzero")]
    ZeroRetention(&'static str),
    /// A pin's maximum on-time interlock is zero.
    #[error("pin {0} has a zero maximum on-time interlock")]
    ZeroMaxOn(u8),
    /// The data directory is empty.
    #[error("data_dir must not be empty")]
    EmptyDataDir,
    /// A driver or controller config payload was rejected.
    /// The string names the offending field and constraint.
    #[error("invalid config: {0}")]
    Invalid(String),
    /// A controller role could not be filled from its bound sensors.
    #[error("role {role:?} requires a bound sensor producing {kind}")]
    UnfilledRole {
        /// The role name the controller requires.
        role: &'static str,
        /// The measurement kind the role must produce.
        kind: &'static str,
    },
    /// An operation referenced a pin outside the declared output pool.
    #[error("pin {0} is not in the declared output pool")]
    UndeclaredPin(u8),
}

impl RuntimeConfig {
    /// Construct a `RuntimeConfig` by parsing some readable source, then
    /// check it for logical inconsistencies.
    ///
    /// # Errors
    ///
    /// Returns errors in line with the definition of [`ConfigError`].
    pub fn parse(source: &mut impl Read) -> Result<RuntimeConfig, ConfigError> {
        let config: RuntimeConfig = serde_json::from_reader(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate a deserialized configuration.
    ///
    /// # Errors
    ///
    /// Returns the first violation found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::EmptyDataDir);
        }

        let mut pins_used = std::collections::HashSet::new();
        let mut labels_used = std::collections::HashSet::new();
        for out in &self.output_pins {
            if !is_legal(out.pin) {
                return Err(ConfigError::ReservedPin(out.pin));
            }
            if !pins_used.insert(out.pin) {
                return Err(ConfigError::DuplicatePin(out.pin));
            }
            if out.label.is_empty() {
                return Err(ConfigError::EmptyLabel(out.pin));
            }
            if !labels_used.insert(out.label.clone()) {
                return Err(ConfigError::DuplicateLabel(out.label.clone()));
            }
            if out.max_on_secs == 0 {
                return Err(ConfigError::ZeroMaxOn(out.pin));
            }
        }

        let mut buses_used = std::collections::HashSet::new();
        for bus in &self.i2c_buses {
            if !buses_used.insert(*bus) {
                return Err(ConfigError::DuplicateBus(*bus));
            }
        }

        if self.retention.max_age_secs == 0 {
            return Err(ConfigError::ZeroRetention("max_age_secs"));
        }
        if self.retention.max_points == 0 {
            return Err(ConfigError::ZeroRetention("max_points"));
        }
        if self.retention.durable_age_secs == 0 {
            return Err(ConfigError::ZeroRetention("durable_age_secs"));
        }
        if self.retention.action_log_cap == 0 {
            return Err(ConfigError::ZeroRetention("action_log_cap"));
        }

        Ok(())
    }

    #[must_use]
    /// Whether `pin` belongs to the declared output pool.
    pub fn is_declared_output(&self, pin: u8) -> bool {
        self.output_pins.iter().any(|p| p.pin == pin)
    }

    #[must_use]
    /// A minimal configuration backed by the simulator, for tests and
    /// dry runs. The data directory must still be supplied by the caller.
    pub fn simulated(data_dir: PathBuf) -> RuntimeConfig {
        RuntimeConfig {
            data_dir,
            gpio_chip: default_gpio_chip(),
            i2c_buses: vec![1],
            onewire_dir: default_onewire_dir(),
            output_pins: vec![
                OutputPinConfig {
                    pin: 17,
                    label: "acid_pump".into(),
                    max_on_secs: DEFAULT_MAX_ON_SECS,
                    min_interval_secs: 0,
                },
                OutputPinConfig {
                    pin: 27,
                    label: "base_pump".into(),
                    max_on_secs: DEFAULT_MAX_ON_SECS,
                    min_interval_secs: 0,
                },
                OutputPinConfig {
                    pin: 22,
                    label: "circulation_pump".into(),
                    max_on_secs: DEFAULT_MAX_ON_SECS,
                    min_interval_secs: 0,
                },
            ],
            retention: RetentionConfig::default(),
            adc_vref_mv: DEFAULT_VREF_MV,
        }
    }
}

/// Determine whether a GPIO pin ID is a legal pin for use by the runtime.
fn is_legal(pin: u8) -> bool {
    // There are GPIO pins 0 through 27 (inclusive).
    // However, pins 0 and 1 are reserved for EEPROM.
    1 < pin && pin <= 27
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    /// Test the parsing of a full configuration string.
    fn full_config() {
        let config_str = r#"{
            "data_dir": "/var/lib/hydroctl",
            "gpio_chip": "/dev/gpiochip0",
            "i2c_buses": [1],
            "output_pins": [
                {
                    "pin": 17,
                    "label": "acid_pump",
                    "max_on_secs": 120,
                    "min_interval_secs": 30
                },
                {
                    "pin": 27,
                    "label": "base_pump"
                }
            ],
            "retention": {
                "max_age_secs": 86400,
                "max_points": 100000,
                "durable_age_secs": 21600,
                "action_log_cap": 10000
            },
            "adc_vref_mv": 3300
        }"#;

        let config = RuntimeConfig {
            data_dir: "/var/lib/hydroctl".into(),
            gpio_chip: "/dev/gpiochip0".into(),
            i2c_buses: vec![1],
            onewire_dir: "/sys/bus/w1/devices".into(),
            output_pins: vec![
                OutputPinConfig {
                    pin: 17,
                    label: "acid_pump".into(),
                    max_on_secs: 120,
                    min_interval_secs: 30,
                },
                OutputPinConfig {
                    pin: 27,
                    label: "base_pump".into(),
                    max_on_secs: 600,
                    min_interval_secs: 0,
                },
            ],
            retention: RetentionConfig::default(),
            adc_vref_mv: 3300,
        };

        let mut cursor = Cursor::new(config_str);
        assert_eq!(config, RuntimeConfig::parse(&mut cursor).unwrap());
    }

    #[test]
    fn duplicate_pin_rejected() {
        let config_str = r#"{
            "data_dir": "/tmp/h",
            "output_pins": [
                { "pin": 17, "label": "a" },
                { "pin": 17, "label": "b" }
            ]
        }"#;
        let err = RuntimeConfig::parse(&mut Cursor::new(config_str)).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicatePin(17)));
    }

    #[test]
    fn reserved_pin_rejected() {
        let config_str = r#"{
            "data_dir": "/tmp/h",
            "output_pins": [ { "pin": 1, "label": "a" } ]
        }"#;
        let err = RuntimeConfig::parse(&mut Cursor::new(config_str)).unwrap_err();
        assert!(matches!(err, ConfigError::ReservedPin(1)));
    }

    #[test]
    fn duplicate_label_rejected() {
        let config_str = r#"{
            "data_dir": "/tmp/h",
            "output_pins": [
                { "pin": 17, "label": "pump" },
                { "pin": 27, "label": "pump" }
            ]
        }"#;
        let err = RuntimeConfig::parse(&mut Cursor::new(config_str)).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateLabel(l) if l == "pump"));
    }

    #[test]
    fn unknown_field_rejected() {
        let config_str = r#"{
            "data_dir": "/tmp/h",
            "output_pins": [],
            "surprise": 1
        }"#;
        assert!(matches!(
            RuntimeConfig::parse(&mut Cursor::new(config_str)),
            Err(ConfigError::Malformed(_))
        ));
    }

    #[test]
    fn zero_retention_rejected() {
        let config_str = r#"{
            "data_dir": "/tmp/h",
            "output_pins": [],
            "retention": {
                "max_age_secs": 0,
                "max_points": 10,
                "durable_age_secs": 10,
                "action_log_cap": 10
            }
        }"#;
        let err = RuntimeConfig::parse(&mut Cursor::new(config_str)).unwrap_err();
        assert!(matches!(err, ConfigError::ZeroRetention("max_age_secs")));
    }
}
