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

//! Definitions for hardware access.
//!
//! The goal of this module is to abstract away the details of exactly how the
//! board's lines and buses work so that drivers and the output arbiter can
//! focus on behavior. A [`Platform`] hands out pins and buses; on a real
//! board it is backed by the GPIO character device, and everywhere else the
//! [`Simulator`] produces deterministic values and records every call.

pub mod bus;
pub mod cs1237;

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use gpio_cdev::{Chip, LineHandle, LineRequestFlags};

use crate::error::Error;

use bus::{I2cBus, LinuxI2c, OneWireBus, SimI2c, SimOneWire, SysfsOneWire};

/// A trait for GPIO pins.
pub trait GpioPin: Send {
    /// Perform a GPIO read on this pin.
    /// Returns `true` if the pin is pulled high, and `false` otherwise.
    ///
    /// # Errors
    ///
    /// This can return an error if the read failed.
    fn read(&mut self) -> Result<bool, Error>;

    /// Perform a GPIO write on this pin, setting the pin's logic level to
    /// `value`.
    ///
    /// # Errors
    ///
    /// This can return an error if the write failed.
    fn write(&mut self, value: bool) -> Result<(), Error>;
}

impl GpioPin for Box<dyn GpioPin> {
    fn read(&mut self) -> Result<bool, Error> {
        (**self).read()
    }

    fn write(&mut self, value: bool) -> Result<(), Error> {
        (**self).write(value)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// The bias requested for an input line.
pub enum Pull {
    /// Leave the line floating.
    None,
    /// Pull the line towards the supply rail.
    Up,
    /// Pull the line towards ground.
    Down,
}

/// A factory for the physical resources the runtime may acquire.
///
/// This is the dependency-injection seam between the driver registry and the
/// machine: drivers are opened against `dyn Platform`, so the same registry
/// runs against the board or against the [`Simulator`].
pub trait Platform: Send {
    /// Claim a pin as an output, initially LOW.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LineUnavailable`] if the line cannot be acquired.
    fn claim_output(&mut self, pin: u8) -> Result<Box<dyn GpioPin>, Error>;

    /// Claim a pin as an input with the requested bias.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LineUnavailable`] if the line cannot be acquired.
    fn claim_input(&mut self, pin: u8, pull: Pull) -> Result<Box<dyn GpioPin>, Error>;

    /// Open an I²C bus by number.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceMissing`] if the bus device does not exist.
    fn open_i2c(&mut self, bus: u8) -> Result<Box<dyn I2cBus>, Error>;

    /// Open the platform 1-Wire tree.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceMissing`] if the tree is absent.
    fn open_onewire(&mut self) -> Result<Box<dyn OneWireBus>, Error>;
}

/// Busy-wait for roughly `nanos` nanoseconds.
///
/// The CS1237 bit cell is about one microsecond; an OS sleep at that scale
/// would overshoot by orders of magnitude, so the wait spins. Callers must be
/// on a dedicated thread.
pub fn ndelay(nanos: u64) {
    let limit = Duration::from_nanos(nanos);
    let start = Instant::now();
    while start.elapsed() < limit {
        std::hint::spin_loop();
    }
}

/// Sleep for `ms` milliseconds, yielding the thread.
pub fn sleep_ms(ms: u64) {
    std::thread::sleep(Duration::from_millis(ms));
}

/// The real platform: GPIO through the character device, I²C through
/// `/dev/i2c-N`, 1-Wire through the sysfs slave tree.
pub struct Board {
    chip: Chip,
    onewire_dir: std::path::PathBuf,
}

impl Board {
    /// Open the GPIO character device at `chip_path`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceMissing`] if the chip cannot be opened.
    pub fn open(chip_path: &str, onewire_dir: std::path::PathBuf) -> Result<Board, Error> {
        let chip = Chip::new(chip_path)
            .map_err(|e| Error::DeviceMissing(format!("{chip_path}: {e}")))?;
        Ok(Board { chip, onewire_dir })
    }

    fn claim(&mut self, pin: u8, flags: LineRequestFlags, default: u8) -> Result<CdevPin, Error> {
        let handle = self
            .chip
            .get_line(u32::from(pin))
            .and_then(|line| line.request(flags, default, "hydroctl"))
            .map_err(|e| Error::LineUnavailable {
                pin,
                cause: e.to_string(),
            })?;
        Ok(CdevPin { pin, handle })
    }
}

impl Platform for Board {
    fn claim_output(&mut self, pin: u8) -> Result<Box<dyn GpioPin>, Error> {
        Ok(Box::new(self.claim(pin, LineRequestFlags::OUTPUT, 0)?))
    }

    fn claim_input(&mut self, pin: u8, _pull: Pull) -> Result<Box<dyn GpioPin>, Error> {
        // Bias flags need the v2 line uAPI which gpio-cdev 0.5 does not
        // expose; the carrier board provides hard pulls on every input we use.
        Ok(Box::new(self.claim(pin, LineRequestFlags::INPUT, 0)?))
    }

    fn open_i2c(&mut self, bus: u8) -> Result<Box<dyn I2cBus>, Error> {
        Ok(Box::new(LinuxI2c::open(bus)?))
    }

    fn open_onewire(&mut self) -> Result<Box<dyn OneWireBus>, Error> {
        Ok(Box::new(SysfsOneWire::open(self.onewire_dir.clone())?))
    }
}

/// A GPIO character-device line with its platform pin number attached, so
/// failures name the pin they happened on.
struct CdevPin {
    pin: u8,
    handle: LineHandle,
}

impl GpioPin for CdevPin {
    fn read(&mut self) -> Result<bool, Error> {
        let value = self.handle.get_value().map_err(|e| Error::LineUnavailable {
            pin: self.pin,
            cause: e.to_string(),
        })?;
        Ok(value == 1)
    }

    fn write(&mut self, value: bool) -> Result<(), Error> {
        self.handle
            .set_value(u8::from(value))
            .map_err(|e| Error::LineUnavailable {
                pin: self.pin,
                cause: e.to_string(),
            })
    }
}

/// Shared state behind the [`Simulator`]: every pin level, every write, and
/// the scripted read queues, inspectable from tests.
#[derive(Default)]
pub struct SimState {
    pins: Mutex<HashMap<u8, SimPinRecord>>,
}

#[derive(Default)]
struct SimPinRecord {
    level: bool,
    history: Vec<bool>,
    reads: VecDeque<bool>,
}

impl SimState {
    /// The current level of `pin` (LOW if it was never written).
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[must_use]
    pub fn level(&self, pin: u8) -> bool {
        self.pins
            .lock()
            .unwrap()
            .get(&pin)
            .is_some_and(|r| r.level)
    }

    /// Every value ever written to `pin`, oldest first.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[must_use]
    pub fn history(&self, pin: u8) -> Vec<bool> {
        self.pins
            .lock()
            .unwrap()
            .get(&pin)
            .map(|r| r.history.clone())
            .unwrap_or_default()
    }

    /// Queue values that subsequent reads of `pin` will return, in order.
    /// Once the queue drains, reads fall back to the pin's written level.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn script_reads(&self, pin: u8, values: impl IntoIterator<Item = bool>) {
        let mut pins = self.pins.lock().unwrap();
        pins.entry(pin).or_default().reads.extend(values);
    }
}

/// The deterministic stand-in platform used by `--dry-run` and by tests.
#[derive(Clone, Default)]
pub struct Simulator {
    state: Arc<SimState>,
}

impl Simulator {
    #[must_use]
    /// Construct a fresh simulator with every pin LOW.
    pub fn new() -> Simulator {
        Simulator::default()
    }

    #[must_use]
    /// A handle onto the simulator's recorded state.
    pub fn state(&self) -> Arc<SimState> {
        Arc::clone(&self.state)
    }
}

impl Platform for Simulator {
    fn claim_output(&mut self, pin: u8) -> Result<Box<dyn GpioPin>, Error> {
        Ok(Box::new(SimPin {
            pin,
            state: Arc::clone(&self.state),
        }))
    }

    fn claim_input(&mut self, pin: u8, _pull: Pull) -> Result<Box<dyn GpioPin>, Error> {
        Ok(Box::new(SimPin {
            pin,
            state: Arc::clone(&self.state),
        }))
    }

    fn open_i2c(&mut self, _bus: u8) -> Result<Box<dyn I2cBus>, Error> {
        Ok(Box::new(SimI2c::new()))
    }

    fn open_onewire(&mut self) -> Result<Box<dyn OneWireBus>, Error> {
        Ok(Box::new(SimOneWire::with_default_probe()))
    }
}

/// A simulated pin bound to the shared [`SimState`].
struct SimPin {
    pin: u8,
    state: Arc<SimState>,
}

impl GpioPin for SimPin {
    fn read(&mut self) -> Result<bool, Error> {
        let mut pins = self.state.pins.lock().map_err(|_| Error::Poison)?;
        let record = pins.entry(self.pin).or_default();
        Ok(record.reads.pop_front().unwrap_or(record.level))
    }

    fn write(&mut self, value: bool) -> Result<(), Error> {
        let mut pins = self.state.pins.lock().map_err(|_| Error::Poison)?;
        let record = pins.entry(self.pin).or_default();
        record.level = value;
        record.history.push(value);
        Ok(())
    }
}

/// A structure for testing GPIO writes.
///
/// A `ListenerPin` stores the history of all writes to it.
/// When read from, a `ListenerPin` will return the last written value.
/// Clones share the same history.
#[derive(Clone)]
pub struct ListenerPin {
    history: Arc<Mutex<Vec<bool>>>,
}

impl ListenerPin {
    #[must_use]
    /// Construct a new `ListenerPin` with only one reading in its history.
    pub fn new(last_value: bool) -> ListenerPin {
        ListenerPin {
            history: Arc::new(Mutex::new(vec![last_value])),
        }
    }

    /// A copy of the history inside this pin.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[must_use]
    pub fn history(&self) -> Vec<bool> {
        self.history.lock().unwrap().clone()
    }
}

impl GpioPin for ListenerPin {
    fn read(&mut self) -> Result<bool, Error> {
        Ok(*self.history.lock().map_err(|_| Error::Poison)?.last().unwrap_or(&false))
    }

    fn write(&mut self, value: bool) -> Result<(), Error> {
        self.history.lock().map_err(|_| Error::Poison)?.push(value);
        Ok(())
    }
}

/// An input-pin double whose reads come from a prepared script.
///
/// Used to exercise the CS1237 wire protocol bit-by-bit: the script holds the
/// exact level sequence the chip would present on DOUT.
#[derive(Clone)]
pub struct ScriptPin {
    reads: Arc<Mutex<VecDeque<bool>>>,
    fallback: bool,
}

impl ScriptPin {
    #[must_use]
    /// A pin whose reads return `script` in order, then `fallback` forever.
    pub fn new(script: impl IntoIterator<Item = bool>, fallback: bool) -> ScriptPin {
        ScriptPin {
            reads: Arc::new(Mutex::new(script.into_iter().collect())),
            fallback,
        }
    }

    /// How many scripted values remain unread.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.reads.lock().unwrap().len()
    }
}

impl GpioPin for ScriptPin {
    fn read(&mut self) -> Result<bool, Error> {
        let mut reads = self.reads.lock().map_err(|_| Error::Poison)?;
        Ok(reads.pop_front().unwrap_or(self.fallback))
    }

    fn write(&mut self, _value: bool) -> Result<(), Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listener_pin_records_writes() {
        let mut pin = ListenerPin::new(false);
        pin.write(true).unwrap();
        pin.write(false).unwrap();
        assert_eq!(pin.history(), vec![false, true, false]);
        assert!(!pin.read().unwrap());
    }

    #[test]
    fn script_pin_plays_then_falls_back() {
        let mut pin = ScriptPin::new([true, false], true);
        assert!(pin.read().unwrap());
        assert!(!pin.read().unwrap());
        assert!(pin.read().unwrap());
        assert_eq!(pin.remaining(), 0);
    }

    #[test]
    fn simulator_pins_share_state() {
        let mut sim = Simulator::new();
        let state = sim.state();
        let mut out = sim.claim_output(17).unwrap();
        out.write(true).unwrap();
        out.write(false).unwrap();
        assert_eq!(state.history(17), vec![true, false]);
        assert!(!state.level(17));
    }

    #[test]
    fn simulator_scripted_reads_win_over_level() {
        let mut sim = Simulator::new();
        let state = sim.state();
        state.script_reads(5, [true, true]);
        let mut input = sim.claim_input(5, Pull::Up).unwrap();
        assert!(input.read().unwrap());
        assert!(input.read().unwrap());
        // script drained, falls back to the (never written) LOW level
        assert!(!input.read().unwrap());
    }

    #[test]
    fn ndelay_waits_at_least_requested() {
        let start = Instant::now();
        ndelay(100_000); // 100 us
        assert!(start.elapsed() >= Duration::from_micros(100));
    }
}
