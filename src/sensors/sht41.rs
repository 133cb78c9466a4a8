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

//! The SHT41 I²C air temperature and humidity sensor.
//!
//! One measurement command yields a six-byte frame: two bytes of temperature
//! ticks, a CRC, two bytes of humidity ticks, a CRC. Both quantities come out
//! of a single read cycle, which is why the driver framework hands back a
//! vector of readings.

use serde::Deserialize;

use crate::{
    error::Error,
    hardware::{bus::I2cBus, sleep_ms},
    store::MeasurementKind,
};

use super::{typed_config, DriverContext, RawReading, Sensor, SensorDriver};

/// The default I²C address of the SHT41.
const DEFAULT_ADDRESS: u16 = 0x44;

/// High-repeatability single-shot measurement command.
const CMD_MEASURE: u8 = 0xFD;

/// Conversion time for a high-repeatability measurement, with margin.
const MEASURE_DELAY_MS: u64 = 10;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Sht41Config {
    /// The I²C bus number.
    bus: u8,
    /// Override of the device address.
    #[serde(default)]
    address: Option<u16>,
}

/// Check a config payload against the schema.
///
/// # Errors
///
/// Returns [`Error::Config`] naming the violation.
pub fn validate(config: &serde_json::Value) -> Result<(), Error> {
    typed_config::<Sht41Config>("sht41", config).map(|_| ())
}

/// Open the driver on its configured bus.
///
/// # Errors
///
/// Returns [`Error::DeviceMissing`] if the bus cannot be opened.
pub fn open(sensor: &Sensor, ctx: &mut DriverContext) -> Result<Box<dyn SensorDriver>, Error> {
    let config: Sht41Config = typed_config("sht41", &sensor.config)?;
    let bus = ctx.platform.open_i2c(config.bus)?;
    Ok(Box::new(Sht41 {
        bus,
        address: config.address.unwrap_or(DEFAULT_ADDRESS),
    }))
}

struct Sht41 {
    bus: Box<dyn I2cBus>,
    address: u16,
}

impl SensorDriver for Sht41 {
    fn read(&mut self) -> Result<Vec<RawReading>, Error> {
        self.bus.command(self.address, &[CMD_MEASURE])?;
        sleep_ms(MEASURE_DELAY_MS);
        let mut frame = [0u8; 6];
        self.bus.receive(self.address, &mut frame)?;

        let (temperature, humidity) = decode_frame(&frame)?;
        Ok(vec![
            RawReading {
                kind: MeasurementKind::Temperature,
                raw: temperature,
                unit: "°C".into(),
            },
            RawReading {
                kind: MeasurementKind::Humidity,
                raw: humidity,
                unit: "%RH".into(),
            },
        ])
    }
}

/// Decode a measurement frame into (°C, %RH), checking both CRCs.
fn decode_frame(frame: &[u8; 6]) -> Result<(f64, f64), Error> {
    if crc8(&frame[0..2]) != frame[2] || crc8(&frame[3..5]) != frame[5] {
        return Err(Error::ChecksumMismatch { device: "sht41" });
    }
    let t_ticks = f64::from(u16::from_be_bytes([frame[0], frame[1]]));
    let rh_ticks = f64::from(u16::from_be_bytes([frame[3], frame[4]]));
    let temperature = -45.0 + 175.0 * t_ticks / 65535.0;
    let humidity = (-6.0 + 125.0 * rh_ticks / 65535.0).clamp(0.0, 100.0);
    Ok((temperature, humidity))
}

/// The Sensirion CRC-8: polynomial 0x31, initial value 0xFF.
fn crc8(data: &[u8]) -> u8 {
    let mut crc: u8 = 0xFF;
    for byte in data {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ 0x31
            } else {
                crc << 1
            };
        }
    }
    crc
}

#[cfg(test)]
mod tests {
    use crate::hardware::bus::SimI2c;

    use super::*;

    #[test]
    fn crc_matches_datasheet_example() {
        assert_eq!(crc8(&[0xBE, 0xEF]), 0x92);
    }

    #[test]
    fn decodes_a_known_frame() {
        // 0x6666 ticks = 25.0 C; 0x8000 ticks = 56.5 %RH
        let frame = [0x66, 0x66, crc8(&[0x66, 0x66]), 0x80, 0x00, crc8(&[0x80, 0x00])];
        let (t, rh) = decode_frame(&frame).unwrap();
        assert!((t - 25.0).abs() < 0.01);
        assert!((rh - 56.5).abs() < 0.1);
    }

    #[test]
    fn rejects_corrupt_frames() {
        let mut frame = [0x66, 0x66, crc8(&[0x66, 0x66]), 0x80, 0x00, crc8(&[0x80, 0x00])];
        frame[0] ^= 0x01;
        let err = decode_frame(&frame).unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn humidity_is_clamped() {
        // 0xFFFF ticks would be 119 %RH before clamping
        let frame = [0x00, 0x00, crc8(&[0x00, 0x00]), 0xFF, 0xFF, crc8(&[0xFF, 0xFF])];
        let (_, rh) = decode_frame(&frame).unwrap();
        assert_eq!(rh, 100.0);
    }

    #[test]
    fn one_cycle_yields_temperature_and_humidity() {
        let bus = SimI2c::new();
        bus.queue_receive(
            DEFAULT_ADDRESS,
            vec![0x66, 0x66, crc8(&[0x66, 0x66]), 0x80, 0x00, crc8(&[0x80, 0x00])],
        );
        let mut driver = Sht41 {
            bus: Box::new(bus),
            address: DEFAULT_ADDRESS,
        };
        let readings = driver.read().unwrap();
        assert_eq!(readings.len(), 2);
        assert_eq!(readings[0].kind, MeasurementKind::Temperature);
        assert_eq!(readings[1].kind, MeasurementKind::Humidity);
        assert!((readings[0].raw - 25.0).abs() < 0.01);
    }

    #[test]
    fn config_requires_bus() {
        assert!(validate(&serde_json::json!({})).is_err());
        validate(&serde_json::json!({ "bus": 1 })).unwrap();
        validate(&serde_json::json!({ "bus": 1, "address": 69 })).unwrap();
        assert!(validate(&serde_json::json!({ "bus": 1, "extra": true })).is_err());
    }
}
