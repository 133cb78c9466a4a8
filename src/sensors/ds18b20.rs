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

//! The DS18B20 1-Wire temperature probe.
//!
//! The kernel's w1 driver does the wire work; this driver reads the slave's
//! measurement file and parses the decimal millidegree value out of it. A
//! failed bus CRC shows up as `NO` on the first line and is reported as a
//! transient checksum fault.

use serde::Deserialize;

use crate::{
    error::Error,
    hardware::bus::OneWireBus,
    store::MeasurementKind,
};

use super::{typed_config, DriverContext, RawReading, Sensor, SensorDriver};

/// The 1-Wire family code prefix of DS18B20 devices.
const FAMILY_PREFIX: &str = "28-";

/// The power-on reset reading, reported before the first real conversion.
const POWER_ON_MILLIDEGREES: i32 = 85_000;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Ds18b20Config {
    /// The slave id, like `28-000005e2fdc3`. When absent, the first DS18B20
    /// on the bus is used.
    #[serde(default)]
    device: Option<String>,
}

/// Check a config payload against the schema.
///
/// # Errors
///
/// Returns [`Error::Config`] naming the violation.
pub fn validate(config: &serde_json::Value) -> Result<(), Error> {
    typed_config::<Ds18b20Config>("ds18b20", config).map(|_| ())
}

/// Open the driver, resolving the slave id on the bus.
///
/// # Errors
///
/// Returns [`Error::DeviceMissing`] if no matching probe is enumerated.
pub fn open(sensor: &Sensor, ctx: &mut DriverContext) -> Result<Box<dyn SensorDriver>, Error> {
    let config: Ds18b20Config = typed_config("ds18b20", &sensor.config)?;
    let mut bus = ctx.platform.open_onewire()?;

    let device = match config.device {
        Some(id) => {
            if !bus.list()?.contains(&id) {
                return Err(Error::DeviceMissing(format!("1-Wire slave {id} not present")));
            }
            id
        }
        None => bus
            .list()?
            .into_iter()
            .find(|id| id.starts_with(FAMILY_PREFIX))
            .ok_or_else(|| Error::DeviceMissing("no DS18B20 on the 1-Wire bus".into()))?,
    };

    Ok(Box::new(Ds18b20 { bus, device }))
}

struct Ds18b20 {
    bus: Box<dyn OneWireBus>,
    device: String,
}

impl SensorDriver for Ds18b20 {
    fn read(&mut self) -> Result<Vec<RawReading>, Error> {
        let contents = self.bus.read_slave(&self.device)?;
        let celsius = parse_w1_slave(&contents)?;
        Ok(vec![RawReading {
            kind: MeasurementKind::Temperature,
            raw: celsius,
            unit: "°C".into(),
        }])
    }
}

/// Parse the kernel's `w1_slave` file format:
///
/// ```text
/// 6b 01 4b 46 7f ff 05 10 5f : crc=5f YES
/// 6b 01 4b 46 7f ff 05 10 5f t=22687
/// ```
fn parse_w1_slave(contents: &str) -> Result<f64, Error> {
    let mut lines = contents.lines();
    let crc_line = lines
        .next()
        .ok_or(Error::ChecksumMismatch { device: "ds18b20" })?;
    if !crc_line.trim_end().ends_with("YES") {
        return Err(Error::ChecksumMismatch { device: "ds18b20" });
    }
    let value_line = lines
        .next()
        .ok_or(Error::ChecksumMismatch { device: "ds18b20" })?;
    let millidegrees: i32 = value_line
        .rsplit_once("t=")
        .and_then(|(_, v)| v.trim().parse().ok())
        .ok_or(Error::ChecksumMismatch { device: "ds18b20" })?;
    if millidegrees == POWER_ON_MILLIDEGREES {
        // the probe answered before finishing its first conversion
        return Err(Error::BusBusy("DS18B20 returned its power-on value".into()));
    }
    Ok(f64::from(millidegrees) / 1000.0)
}

#[cfg(test)]
mod tests {
    use crate::hardware::bus::SimOneWire;

    use super::*;

    const GOOD: &str = "6b 01 4b 46 7f ff 05 10 5f : crc=5f YES\n\
                        6b 01 4b 46 7f ff 05 10 5f t=22687\n";
    const BAD_CRC: &str = "ff ff ff ff ff ff ff ff ff : crc=c9 NO\n\
                           ff ff ff ff ff ff ff ff ff t=-62\n";
    const NEGATIVE: &str = "5e fe 4b 46 7f ff 02 10 6d : crc=6d YES\n\
                            5e fe 4b 46 7f ff 02 10 6d t=-26125\n";

    #[test]
    fn parses_positive_temperature() {
        let celsius = parse_w1_slave(GOOD).unwrap();
        assert!((celsius - 22.687).abs() < 1e-9);
    }

    #[test]
    fn parses_negative_temperature() {
        let celsius = parse_w1_slave(NEGATIVE).unwrap();
        assert!((celsius - (-26.125)).abs() < 1e-9);
    }

    #[test]
    fn failed_crc_is_transient() {
        let err = parse_w1_slave(BAD_CRC).unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn power_on_value_is_transient() {
        let contents = "50 05 4b 46 7f ff 0c 10 1c : crc=1c YES\n\
                        50 05 4b 46 7f ff 0c 10 1c t=85000\n";
        let err = parse_w1_slave(contents).unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn reads_through_the_bus() {
        let mut bus = SimOneWire::new();
        bus.add_device("28-00000a1b2c3d", GOOD);
        let mut driver = Ds18b20 {
            bus: Box::new(bus),
            device: "28-00000a1b2c3d".into(),
        };
        let readings = driver.read().unwrap();
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].kind, MeasurementKind::Temperature);
        assert!((readings[0].raw - 22.687).abs() < 1e-9);
        assert_eq!(readings[0].unit, "°C");
    }

    #[test]
    fn config_rejects_unknown_fields() {
        let err = validate(&serde_json::json!({ "devic": "28-x" })).unwrap_err();
        assert!(err.is_config());
        validate(&serde_json::json!({ "device": "28-x" })).unwrap();
        validate(&serde_json::json!({})).unwrap();
    }
}
