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

//! The sensor entity and the driver framework.
//!
//! A driver is selected by a string tag out of a compile-time registry:
//! adding one is a source edit, not a plugin load. Each registry entry
//! carries the driver's metadata, a config validator used by the API before
//! anything touches hardware, and a constructor that claims the lines or
//! buses it needs. A driver read returns a vector of raw readings because
//! some chips (the SHT41) produce several quantities per cycle.

pub mod analog;
pub mod ds18b20;
pub mod sht41;

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    calibration::{Calibration, CalibrationStyle},
    error::Error,
    hardware::Platform,
    store::{Measurement, MeasurementKind, MeasurementStore},
    SensorId,
};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
/// A configured sensor.
pub struct Sensor {
    /// Stable identity.
    pub id: SensorId,
    /// Unique human-readable name.
    pub name: String,
    /// Registry tag of the driver serving this sensor.
    pub driver: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Whether the scheduler runs this sensor.
    pub enabled: bool,
    /// Seconds between reads; at least one.
    pub update_interval_secs: u64,
    /// Driver-specific configuration, validated against the driver's schema.
    #[serde(default)]
    pub config: serde_json::Value,
    /// The sensor's calibration points.
    #[serde(default)]
    pub calibration: Calibration,
    /// When the sensor last produced a measurement.
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub last_measurement_at: Option<DateTime<Utc>>,
}

impl Sensor {
    #[must_use]
    /// The configured update interval.
    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs.max(1))
    }
}

#[derive(Clone, Debug, PartialEq)]
/// One uncalibrated reading produced by a driver.
pub struct RawReading {
    /// The quantity this reading describes.
    pub kind: MeasurementKind,
    /// The raw value, in whatever domain the driver works in.
    pub raw: f64,
    /// The unit of the *calibrated* value.
    pub unit: String,
}

/// An opened sensor driver.
pub trait SensorDriver: Send {
    /// Take one reading cycle. Multi-output drivers return several entries.
    ///
    /// # Errors
    ///
    /// Transient faults (checksum, timeout, busy bus) bubble up and are
    /// retried at the next tick; persistent faults mark the sensor FAULTED.
    fn read(&mut self) -> Result<Vec<RawReading>, Error>;

    /// Take a single uncalibrated sample, for the calibration workflow.
    ///
    /// # Errors
    ///
    /// Same contract as [`SensorDriver::read`].
    fn sample_raw(&mut self) -> Result<f64, Error> {
        self.read()?
            .first()
            .map(|r| r.raw)
            .ok_or_else(|| Error::BusBusy("driver produced no reading".into()))
    }

    /// Release any held resources. Called before the driver is dropped on
    /// disable, reconfiguration or deletion.
    fn close(&mut self) {}
}

#[derive(Clone, Copy, Debug, Serialize)]
/// Registry metadata describing a driver variant.
pub struct DriverDescriptor {
    /// The registry tag.
    pub tag: &'static str,
    /// One-line description for the API catalog.
    pub summary: &'static str,
    /// The measurement kinds one read cycle produces.
    pub kinds: &'static [MeasurementKind],
    /// The unit of the primary calibrated value.
    pub unit: &'static str,
    /// How this driver expects to be calibrated.
    pub calibration: CalibrationStyle,
}

/// Everything a driver constructor may acquire.
pub struct DriverContext<'a> {
    /// The hardware factory.
    pub platform: &'a mut dyn Platform,
    /// The measurement store, for drivers that compensate against another
    /// sensor's latest reading.
    pub store: &'a Arc<MeasurementStore>,
    /// The wall clock, for freshness checks against the store.
    pub clock: &'a Arc<dyn crate::clock::Clock>,
    /// ADC reference voltage in millivolts.
    pub vref_mv: u32,
}

/// One compile-time registry row.
pub struct DriverSpec {
    /// The driver's metadata.
    pub descriptor: DriverDescriptor,
    validate: fn(&serde_json::Value) -> Result<(), Error>,
    open: fn(&Sensor, &mut DriverContext) -> Result<Box<dyn SensorDriver>, Error>,
}

/// The driver registry. Order is the order the API catalog presents.
static DRIVERS: &[DriverSpec] = &[
    DriverSpec {
        descriptor: DriverDescriptor {
            tag: "ds18b20",
            summary: "DS18B20 1-Wire water temperature probe",
            kinds: &[MeasurementKind::Temperature],
            unit: "°C",
            calibration: CalibrationStyle::None,
        },
        validate: ds18b20::validate,
        open: ds18b20::open,
    },
    DriverSpec {
        descriptor: DriverDescriptor {
            tag: "sht41",
            summary: "SHT41 I2C air temperature and humidity sensor",
            kinds: &[MeasurementKind::Temperature, MeasurementKind::Humidity],
            unit: "°C",
            calibration: CalibrationStyle::None,
        },
        validate: sht41::validate,
        open: sht41::open,
    },
    DriverSpec {
        descriptor: DriverDescriptor {
            tag: "cs1237_ph",
            summary: "pH probe on a CS1237 ADC, PGA 128",
            kinds: &[MeasurementKind::Ph],
            unit: "pH",
            calibration: CalibrationStyle::TwoPointPh,
        },
        validate: analog::validate_ph,
        open: analog::open_ph,
    },
    DriverSpec {
        descriptor: DriverDescriptor {
            tag: "cs1237_orp",
            summary: "ORP probe on a CS1237 ADC, PGA 1",
            kinds: &[MeasurementKind::Orp],
            unit: "mV",
            calibration: CalibrationStyle::OffsetOrp,
        },
        validate: analog::validate_orp,
        open: analog::open_orp,
    },
    DriverSpec {
        descriptor: DriverDescriptor {
            tag: "cs1237_ec",
            summary: "EC probe on a CS1237 ADC with temperature compensation",
            kinds: &[MeasurementKind::Ec],
            unit: "µS/cm",
            calibration: CalibrationStyle::FactorEc,
        },
        validate: analog::validate_ec,
        open: analog::open_ec,
    },
    DriverSpec {
        descriptor: DriverDescriptor {
            tag: "cs1237_generic",
            summary: "generic analog channel on a CS1237 ADC",
            kinds: &[MeasurementKind::Generic],
            unit: "",
            calibration: CalibrationStyle::Piecewise,
        },
        validate: analog::validate_generic,
        open: analog::open_generic,
    },
];

#[must_use]
/// Every registered driver's metadata.
pub fn driver_catalog() -> Vec<DriverDescriptor> {
    DRIVERS.iter().map(|d| d.descriptor).collect()
}

#[must_use]
/// Look up one driver's metadata by tag.
pub fn describe_driver(tag: &str) -> Option<&'static DriverDescriptor> {
    DRIVERS
        .iter()
        .find(|d| d.descriptor.tag == tag)
        .map(|d| &d.descriptor)
}

/// Check a driver config payload against the driver's schema without
/// touching hardware.
///
/// # Errors
///
/// Returns [`Error::Config`] naming the violation, or an unknown-tag error.
pub fn validate_driver_config(tag: &str, config: &serde_json::Value) -> Result<(), Error> {
    let spec = DRIVERS
        .iter()
        .find(|d| d.descriptor.tag == tag)
        .ok_or_else(|| {
            Error::Config(crate::config::ConfigError::Invalid(format!(
                "unknown driver tag {tag:?}"
            )))
        })?;
    (spec.validate)(config)
}

/// Open the driver a sensor names, acquiring its hardware.
///
/// # Errors
///
/// Returns [`Error::Config`] for an unknown tag or rejected config, and
/// persistent hardware errors if the lines or buses cannot be acquired.
pub fn open_driver(
    sensor: &Sensor,
    ctx: &mut DriverContext,
) -> Result<Box<dyn SensorDriver>, Error> {
    let spec = DRIVERS
        .iter()
        .find(|d| d.descriptor.tag == sensor.driver)
        .ok_or_else(|| {
            Error::Config(crate::config::ConfigError::Invalid(format!(
                "unknown driver tag {:?}",
                sensor.driver
            )))
        })?;
    (spec.validate)(&sensor.config)?;
    (spec.open)(sensor, ctx)
}

/// Turn one read cycle into calibrated measurements.
///
/// The calibration is evaluated on a clone taken under the caller's sensor
/// lock, so a concurrent calibration update cannot tear the mapping.
#[must_use]
pub fn calibrate_readings(
    sensor: &Sensor,
    readings: Vec<RawReading>,
    now: DateTime<Utc>,
) -> Vec<Measurement> {
    let calibration = sensor.calibration.clone();
    readings
        .into_iter()
        .map(|r| Measurement {
            sensor: sensor.id,
            taken_at: now,
            kind: r.kind,
            value: calibration.evaluate(r.raw),
            unit: r.unit,
            raw: Some(r.raw),
        })
        .collect()
}

/// Deserialize a typed driver config, mapping serde failures onto a
/// structured configuration error. Rejects unknown fields.
pub(crate) fn typed_config<T: serde::de::DeserializeOwned>(
    tag: &str,
    config: &serde_json::Value,
) -> Result<T, Error> {
    serde_json::from_value(config.clone()).map_err(|e| {
        Error::Config(crate::config::ConfigError::Invalid(format!(
            "{tag} config: {e}"
        )))
    })
}
