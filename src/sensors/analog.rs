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

//! The CS1237-backed analog probe drivers: pH, ORP, EC, and the generic
//! channel.
//!
//! Each probe owns its own chip on three dedicated lines and a continuous
//! [`Sampler`] worker; reads pull the ring median (the chemistry probes are
//! noisy) and convert counts into the probe's raw domain. Calibration to
//! final units happens in the framework through the sensor's point set: for
//! pH that is the two buffer points on voltage, for ORP a single millivolt
//! offset, for the generic channel whatever the user taught it.

use std::sync::Arc;

use serde::Deserialize;

use crate::{
    clock::Clock,
    error::Error,
    hardware::{
        cs1237::{Channel, ChipConfig, Cs1237, Pga, SampleReader, Sampler, Speed},
        Pull,
    },
    store::{MeasurementKind, MeasurementStore},
    SensorId,
};

use super::{typed_config, DriverContext, RawReading, Sensor, SensorDriver};

/// Per-degree conductivity change used for 25 °C referencing. The standard
/// 2 %/°C is a reasonable default for nutrient solutions; the divisor form
/// references the reading back to 25 °C.
const EC_TEMP_COEFF: f64 = 0.02;

/// How fresh a bound water-temperature reading must be to compensate with.
const EC_TEMP_FRESH_MINUTES: i64 = 5;

fn default_ring() -> usize {
    16
}

fn default_speed() -> Speed {
    Speed::Hz10
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PhConfig {
    sck: u8,
    dout: u8,
    din: u8,
    #[serde(default = "default_ring")]
    ring: usize,
    #[serde(default = "default_speed")]
    speed: Speed,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct OrpConfig {
    sck: u8,
    dout: u8,
    din: u8,
    #[serde(default = "default_ring")]
    ring: usize,
    #[serde(default = "default_speed")]
    speed: Speed,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct EcConfig {
    sck: u8,
    dout: u8,
    din: u8,
    /// Cell-constant factor mapping counts to µS/cm.
    k_factor: f64,
    /// A water-temperature sensor to compensate against, if bound.
    #[serde(default)]
    temp_sensor: Option<SensorId>,
    #[serde(default = "default_ring")]
    ring: usize,
    #[serde(default = "default_speed")]
    speed: Speed,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct GenericConfig {
    sck: u8,
    dout: u8,
    din: u8,
    /// Unit string reported with the calibrated value.
    unit: String,
    #[serde(default = "default_pga")]
    pga: Pga,
    #[serde(default = "default_statistic")]
    statistic: Statistic,
    #[serde(default = "default_ring")]
    ring: usize,
    #[serde(default = "default_speed")]
    speed: Speed,
}

fn default_pga() -> Pga {
    Pga::X1
}

fn default_statistic() -> Statistic {
    Statistic::Latest
}

#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Which ring statistic a generic channel reports.
enum Statistic {
    Latest,
    Mean,
    Median,
}

/// Validate a pH probe config.
///
/// # Errors
///
/// Returns [`Error::Config`] naming the violation.
pub fn validate_ph(config: &serde_json::Value) -> Result<(), Error> {
    typed_config::<PhConfig>("cs1237_ph", config).map(|_| ())
}

/// Validate an ORP probe config.
///
/// # Errors
///
/// Returns [`Error::Config`] naming the violation.
pub fn validate_orp(config: &serde_json::Value) -> Result<(), Error> {
    typed_config::<OrpConfig>("cs1237_orp", config).map(|_| ())
}

/// Validate an EC probe config.
///
/// # Errors
///
/// Returns [`Error::Config`] naming the violation.
pub fn validate_ec(config: &serde_json::Value) -> Result<(), Error> {
    let config: EcConfig = typed_config("cs1237_ec", config)?;
    if config.k_factor <= 0.0 || !config.k_factor.is_finite() {
        return Err(Error::Config(crate::config::ConfigError::Invalid(
            "cs1237_ec config: k_factor must be positive".into(),
        )));
    }
    Ok(())
}

/// Validate a generic channel config.
///
/// # Errors
///
/// Returns [`Error::Config`] naming the violation.
pub fn validate_generic(config: &serde_json::Value) -> Result<(), Error> {
    typed_config::<GenericConfig>("cs1237_generic", config).map(|_| ())
}

/// Claim the three lines and launch the chip's sampling worker.
fn spawn_sampler(
    ctx: &mut DriverContext,
    sck: u8,
    dout: u8,
    din: u8,
    pga: Pga,
    speed: Speed,
    ring: usize,
) -> Result<(Sampler, SampleReader), Error> {
    let sck = ctx.platform.claim_output(sck)?;
    let dout = ctx.platform.claim_input(dout, Pull::Up)?;
    let din = ctx.platform.claim_output(din)?;
    let chip = Cs1237::new(sck, dout, din);
    let config = ChipConfig {
        refo: false,
        channel: Channel::Analog,
        pga,
        speed,
    };
    let sampler = Sampler::spawn(chip, config, ring)?;
    let reader = sampler.reader();
    Ok((sampler, reader))
}

/// Take the ring median, mapping worker death and an empty ring onto the
/// framework's error vocabulary.
fn median_counts(reader: &SampleReader) -> Result<i32, Error> {
    if !reader.is_alive() {
        return Err(Error::DeviceMissing("CS1237 sampler stopped".into()));
    }
    reader
        .median()
        .ok_or_else(|| Error::BusBusy("no CS1237 sample yet".into()))
}

/// Open a pH probe: analog channel, PGA 128.
///
/// # Errors
///
/// Returns hardware errors from claiming the lines or configuring the chip.
pub fn open_ph(sensor: &Sensor, ctx: &mut DriverContext) -> Result<Box<dyn SensorDriver>, Error> {
    let config: PhConfig = typed_config("cs1237_ph", &sensor.config)?;
    let vref_mv = ctx.vref_mv;
    let (sampler, reader) = spawn_sampler(
        ctx,
        config.sck,
        config.dout,
        config.din,
        Pga::X128,
        config.speed,
        config.ring,
    )?;
    Ok(Box::new(PhProbe {
        _sampler: sampler,
        reader,
        vref_mv,
    }))
}

struct PhProbe {
    _sampler: Sampler,
    reader: SampleReader,
    vref_mv: u32,
}

impl SensorDriver for PhProbe {
    fn read(&mut self) -> Result<Vec<RawReading>, Error> {
        let counts = median_counts(&self.reader)?;
        let volts =
            crate::hardware::cs1237::millivolts(counts, self.vref_mv, Pga::X128) / 1000.0;
        Ok(vec![RawReading {
            kind: MeasurementKind::Ph,
            raw: volts,
            unit: "pH".into(),
        }])
    }
}

/// Open an ORP probe: analog channel, PGA 1.
///
/// # Errors
///
/// Returns hardware errors from claiming the lines or configuring the chip.
pub fn open_orp(sensor: &Sensor, ctx: &mut DriverContext) -> Result<Box<dyn SensorDriver>, Error> {
    let config: OrpConfig = typed_config("cs1237_orp", &sensor.config)?;
    let vref_mv = ctx.vref_mv;
    let (sampler, reader) = spawn_sampler(
        ctx,
        config.sck,
        config.dout,
        config.din,
        Pga::X1,
        config.speed,
        config.ring,
    )?;
    Ok(Box::new(OrpProbe {
        _sampler: sampler,
        reader,
        vref_mv,
    }))
}

struct OrpProbe {
    _sampler: Sampler,
    reader: SampleReader,
    vref_mv: u32,
}

impl SensorDriver for OrpProbe {
    fn read(&mut self) -> Result<Vec<RawReading>, Error> {
        let counts = median_counts(&self.reader)?;
        let mv = crate::hardware::cs1237::millivolts(counts, self.vref_mv, Pga::X1);
        Ok(vec![RawReading {
            kind: MeasurementKind::Orp,
            raw: mv,
            unit: "mV".into(),
        }])
    }
}

/// Open an EC probe: analog channel, PGA 1, with a cell-constant factor and
/// optional temperature compensation against another sensor.
///
/// # Errors
///
/// Returns hardware errors from claiming the lines or configuring the chip.
pub fn open_ec(sensor: &Sensor, ctx: &mut DriverContext) -> Result<Box<dyn SensorDriver>, Error> {
    validate_ec(&sensor.config)?;
    let config: EcConfig = typed_config("cs1237_ec", &sensor.config)?;
    let store = Arc::clone(ctx.store);
    let clock = Arc::clone(ctx.clock);
    let (sampler, reader) = spawn_sampler(
        ctx,
        config.sck,
        config.dout,
        config.din,
        Pga::X1,
        config.speed,
        config.ring,
    )?;
    Ok(Box::new(EcProbe {
        _sampler: sampler,
        reader,
        k_factor: config.k_factor,
        temp_sensor: config.temp_sensor,
        store,
        clock,
    }))
}

struct EcProbe {
    _sampler: Sampler,
    reader: SampleReader,
    k_factor: f64,
    temp_sensor: Option<SensorId>,
    store: Arc<MeasurementStore>,
    clock: Arc<dyn Clock>,
}

impl EcProbe {
    /// The compensation divisor referencing the reading to 25 °C, if a fresh
    /// water temperature is available. Otherwise compensation is bypassed.
    fn compensation(&self) -> Option<f64> {
        let temp_sensor = self.temp_sensor?;
        let reading = self.store.latest(temp_sensor)?;
        if reading.kind != MeasurementKind::Temperature {
            return None;
        }
        let age = self.clock.now_utc() - reading.taken_at;
        if age > chrono::Duration::minutes(EC_TEMP_FRESH_MINUTES) {
            return None;
        }
        Some(1.0 + EC_TEMP_COEFF * (reading.value - 25.0))
    }
}

impl SensorDriver for EcProbe {
    fn read(&mut self) -> Result<Vec<RawReading>, Error> {
        let counts = median_counts(&self.reader)?;
        let mut ec = f64::from(counts) * self.k_factor;
        if let Some(divisor) = self.compensation() {
            ec /= divisor;
        }
        Ok(vec![RawReading {
            kind: MeasurementKind::Ec,
            raw: ec,
            unit: "µS/cm".into(),
        }])
    }
}

/// Open a generic analog channel reporting raw counts.
///
/// # Errors
///
/// Returns hardware errors from claiming the lines or configuring the chip.
pub fn open_generic(
    sensor: &Sensor,
    ctx: &mut DriverContext,
) -> Result<Box<dyn SensorDriver>, Error> {
    let config: GenericConfig = typed_config("cs1237_generic", &sensor.config)?;
    let (sampler, reader) = spawn_sampler(
        ctx,
        config.sck,
        config.dout,
        config.din,
        config.pga,
        config.speed,
        config.ring,
    )?;
    Ok(Box::new(GenericProbe {
        _sampler: sampler,
        reader,
        unit: config.unit,
        statistic: config.statistic,
    }))
}

struct GenericProbe {
    _sampler: Sampler,
    reader: SampleReader,
    unit: String,
    statistic: Statistic,
}

impl SensorDriver for GenericProbe {
    fn read(&mut self) -> Result<Vec<RawReading>, Error> {
        if !self.reader.is_alive() {
            return Err(Error::DeviceMissing("CS1237 sampler stopped".into()));
        }
        let counts = match self.statistic {
            Statistic::Latest => self.reader.latest().map(f64::from),
            Statistic::Mean => self.reader.mean(),
            Statistic::Median => self.reader.median().map(f64::from),
        }
        .ok_or_else(|| Error::BusBusy("no CS1237 sample yet".into()))?;
        Ok(vec![RawReading {
            kind: MeasurementKind::Generic,
            raw: counts,
            unit: self.unit.clone(),
        }])
    }
}
