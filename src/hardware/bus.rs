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

//! Access to the board's shared buses: I²C and the 1-Wire sysfs tree.
//!
//! Both come in a Linux flavor and a deterministic simulated flavor. The
//! simulated buses answer from queued or canned payloads and record writes so
//! tests can assert on the exact traffic.

use std::{
    collections::{HashMap, VecDeque},
    path::PathBuf,
    sync::Mutex,
};

use i2cdev::core::I2CDevice;
use i2cdev::linux::LinuxI2CDevice;

use crate::error::Error;

/// A trait for I²C buses.
///
/// Addresses are 7-bit device addresses; the bus handles addressing per call
/// so one handle serves every device on the wire.
pub trait I2cBus: Send {
    /// Write `register` then read `buf.len()` bytes from it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BusBusy`] on a NAK or bus fault.
    fn read_reg(&mut self, addr: u16, register: u8, buf: &mut [u8]) -> Result<(), Error>;

    /// Write `bytes` to `register`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BusBusy`] on a NAK or bus fault.
    fn write_reg(&mut self, addr: u16, register: u8, bytes: &[u8]) -> Result<(), Error>;

    /// Write a raw command with no register prefix.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BusBusy`] on a NAK or bus fault.
    fn command(&mut self, addr: u16, bytes: &[u8]) -> Result<(), Error>;

    /// Read `buf.len()` raw bytes from the device.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BusBusy`] on a NAK or bus fault.
    fn receive(&mut self, addr: u16, buf: &mut [u8]) -> Result<(), Error>;
}

/// An I²C bus backed by `/dev/i2c-N`.
pub struct LinuxI2c {
    dev: LinuxI2CDevice,
}

impl LinuxI2c {
    /// Open bus number `bus`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceMissing`] if the device node cannot be opened.
    pub fn open(bus: u8) -> Result<LinuxI2c, Error> {
        let path = format!("/dev/i2c-{bus}");
        let dev = LinuxI2CDevice::new(&path, 0)
            .map_err(|e| Error::DeviceMissing(format!("{path}: {e}")))?;
        Ok(LinuxI2c { dev })
    }

    fn select(&mut self, addr: u16) -> Result<(), Error> {
        self.dev
            .set_slave_address(addr)
            .map_err(|e| Error::BusBusy(e.to_string()))
    }
}

impl I2cBus for LinuxI2c {
    fn read_reg(&mut self, addr: u16, register: u8, buf: &mut [u8]) -> Result<(), Error> {
        self.select(addr)?;
        self.dev
            .write(&[register])
            .and_then(|()| self.dev.read(buf))
            .map_err(|e| Error::BusBusy(e.to_string()))
    }

    fn write_reg(&mut self, addr: u16, register: u8, bytes: &[u8]) -> Result<(), Error> {
        self.select(addr)?;
        let mut frame = Vec::with_capacity(bytes.len() + 1);
        frame.push(register);
        frame.extend_from_slice(bytes);
        self.dev
            .write(&frame)
            .map_err(|e| Error::BusBusy(e.to_string()))
    }

    fn command(&mut self, addr: u16, bytes: &[u8]) -> Result<(), Error> {
        self.select(addr)?;
        self.dev
            .write(bytes)
            .map_err(|e| Error::BusBusy(e.to_string()))
    }

    fn receive(&mut self, addr: u16, buf: &mut [u8]) -> Result<(), Error> {
        self.select(addr)?;
        self.dev
            .read(buf)
            .map_err(|e| Error::BusBusy(e.to_string()))
    }
}

/// A canned SHT4x measurement frame (25.0 °C, 56.5 %RH) with valid CRCs,
/// served by the simulated bus when nothing else is queued so dry runs keep
/// producing plausible climate data.
const SIM_SHT4X_FRAME: [u8; 6] = [0x66, 0x66, 0x93, 0x80, 0x00, 0xA2];

/// A deterministic I²C bus for tests and dry runs.
pub struct SimI2c {
    registers: HashMap<(u16, u8), Vec<u8>>,
    receive_queue: Mutex<HashMap<u16, VecDeque<Vec<u8>>>>,
    writes: Mutex<Vec<(u16, Vec<u8>)>>,
}

impl SimI2c {
    #[must_use]
    /// A fresh simulated bus with no queued payloads.
    pub fn new() -> SimI2c {
        SimI2c {
            registers: HashMap::new(),
            receive_queue: Mutex::new(HashMap::new()),
            writes: Mutex::new(Vec::new()),
        }
    }

    /// Preload the contents of a device register.
    pub fn set_register(&mut self, addr: u16, register: u8, bytes: Vec<u8>) {
        self.registers.insert((addr, register), bytes);
    }

    /// Queue a raw frame that the next `receive` from `addr` will return.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn queue_receive(&self, addr: u16, bytes: Vec<u8>) {
        self.receive_queue
            .lock()
            .unwrap()
            .entry(addr)
            .or_default()
            .push_back(bytes);
    }

    /// Every write (command or register) issued on this bus, in order.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[must_use]
    pub fn writes(&self) -> Vec<(u16, Vec<u8>)> {
        self.writes.lock().unwrap().clone()
    }
}

impl Default for SimI2c {
    fn default() -> SimI2c {
        SimI2c::new()
    }
}

impl I2cBus for SimI2c {
    fn read_reg(&mut self, addr: u16, register: u8, buf: &mut [u8]) -> Result<(), Error> {
        let canned = self
            .registers
            .get(&(addr, register))
            .ok_or_else(|| Error::BusBusy(format!("no simulated register {register:#04x}")))?;
        for (dst, src) in buf.iter_mut().zip(canned.iter().chain(std::iter::repeat(&0))) {
            *dst = *src;
        }
        Ok(())
    }

    fn write_reg(&mut self, addr: u16, register: u8, bytes: &[u8]) -> Result<(), Error> {
        let mut frame = vec![register];
        frame.extend_from_slice(bytes);
        self.writes.lock().map_err(|_| Error::Poison)?.push((addr, frame));
        Ok(())
    }

    fn command(&mut self, addr: u16, bytes: &[u8]) -> Result<(), Error> {
        self.writes
            .lock()
            .map_err(|_| Error::Poison)?
            .push((addr, bytes.to_vec()));
        Ok(())
    }

    fn receive(&mut self, addr: u16, buf: &mut [u8]) -> Result<(), Error> {
        let queued = self
            .receive_queue
            .lock()
            .map_err(|_| Error::Poison)?
            .get_mut(&addr)
            .and_then(VecDeque::pop_front);
        let frame = queued.unwrap_or_else(|| SIM_SHT4X_FRAME.to_vec());
        for (dst, src) in buf.iter_mut().zip(frame.iter().chain(std::iter::repeat(&0))) {
            *dst = *src;
        }
        Ok(())
    }
}

/// A trait for the platform 1-Wire tree.
pub trait OneWireBus: Send {
    /// List the ids of every enumerated slave device.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceMissing`] if the tree cannot be read.
    fn list(&mut self) -> Result<Vec<String>, Error>;

    /// Read the raw contents of a slave's measurement file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceMissing`] if the slave is gone, or
    /// [`Error::BusBusy`] on a read fault.
    fn read_slave(&mut self, id: &str) -> Result<String, Error>;
}

/// The kernel w1 sysfs tree, usually `/sys/bus/w1/devices`.
pub struct SysfsOneWire {
    dir: PathBuf,
}

impl SysfsOneWire {
    /// Open the tree rooted at `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceMissing`] if `dir` does not exist.
    pub fn open(dir: PathBuf) -> Result<SysfsOneWire, Error> {
        if !dir.is_dir() {
            return Err(Error::DeviceMissing(format!(
                "1-Wire tree {} not present",
                dir.display()
            )));
        }
        Ok(SysfsOneWire { dir })
    }
}

impl OneWireBus for SysfsOneWire {
    fn list(&mut self) -> Result<Vec<String>, Error> {
        let mut ids = Vec::new();
        let entries = std::fs::read_dir(&self.dir)
            .map_err(|e| Error::DeviceMissing(format!("{}: {e}", self.dir.display())))?;
        for entry in entries {
            let entry = entry.map_err(|e| Error::BusBusy(e.to_string()))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            // bus masters are not slaves
            if !name.starts_with("w1_bus_master") {
                ids.push(name);
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn read_slave(&mut self, id: &str) -> Result<String, Error> {
        let path = self.dir.join(id).join("w1_slave");
        std::fs::read_to_string(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::DeviceMissing(format!("1-Wire slave {id} not present"))
            } else {
                Error::BusBusy(format!("{}: {e}", path.display()))
            }
        })
    }
}

/// A deterministic 1-Wire tree for tests and dry runs.
pub struct SimOneWire {
    devices: HashMap<String, String>,
}

/// A w1_slave fixture reading 22.687 °C with a good CRC.
const SIM_W1_SLAVE: &str = "6b 01 4b 46 7f ff 05 10 5f : crc=5f YES\n\
                            6b 01 4b 46 7f ff 05 10 5f t=22687\n";

impl SimOneWire {
    #[must_use]
    /// An empty simulated tree.
    pub fn new() -> SimOneWire {
        SimOneWire {
            devices: HashMap::new(),
        }
    }

    #[must_use]
    /// A tree pre-populated with one DS18B20 probe, so dry runs find a
    /// temperature sensor without extra setup.
    pub fn with_default_probe() -> SimOneWire {
        let mut bus = SimOneWire::new();
        bus.add_device("28-000005e2fdc3", SIM_W1_SLAVE);
        bus
    }

    /// Add or replace a simulated slave and its `w1_slave` contents.
    pub fn add_device(&mut self, id: &str, contents: &str) {
        self.devices.insert(id.to_string(), contents.to_string());
    }
}

impl Default for SimOneWire {
    fn default() -> SimOneWire {
        SimOneWire::new()
    }
}

impl OneWireBus for SimOneWire {
    fn list(&mut self) -> Result<Vec<String>, Error> {
        let mut ids: Vec<String> = self.devices.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    fn read_slave(&mut self, id: &str) -> Result<String, Error> {
        self.devices
            .get(id)
            .cloned()
            .ok_or_else(|| Error::DeviceMissing(format!("1-Wire slave {id} not present")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sim_i2c_records_commands() {
        let mut bus = SimI2c::new();
        bus.command(0x44, &[0xFD]).unwrap();
        bus.write_reg(0x44, 0x10, &[0xAA, 0xBB]).unwrap();
        assert_eq!(
            bus.writes(),
            vec![(0x44, vec![0xFD]), (0x44, vec![0x10, 0xAA, 0xBB])]
        );
    }

    #[test]
    fn sim_i2c_receive_prefers_queue() {
        let mut bus = SimI2c::new();
        bus.queue_receive(0x44, vec![1, 2, 3]);
        let mut buf = [0u8; 3];
        bus.receive(0x44, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3]);
        // queue drained: the canned frame takes over
        let mut frame = [0u8; 6];
        bus.receive(0x44, &mut frame).unwrap();
        assert_eq!(frame, SIM_SHT4X_FRAME);
    }

    #[test]
    fn sim_onewire_lists_devices() {
        let mut bus = SimOneWire::with_default_probe();
        assert_eq!(bus.list().unwrap(), vec!["28-000005e2fdc3".to_string()]);
        assert!(bus.read_slave("28-000005e2fdc3").unwrap().contains("YES"));
        assert!(matches!(
            bus.read_slave("28-dead"),
            Err(Error::DeviceMissing(_))
        ));
    }
}
