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

//! The bit-banged serial protocol of the CS1237 24-bit sigma-delta ADC.
//!
//! The chip talks over three lines: SCK (clock, output), DOUT (data from the
//! chip, doubles as an active-low "data ready" flag), and DIN (data to the
//! chip). A bit cell drives SCK HIGH for about half a microsecond, samples or
//! drives the data line, then drives SCK LOW for the other half. Because the
//! cell is far below OS timer resolution, everything here busy-waits and must
//! run on a dedicated thread; the [`Sampler`] owns that thread and exports
//! samples through a spinlocked ring buffer.

use std::{
    cell::UnsafeCell,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use log::{debug, warn};

use crate::error::Error;

use super::{ndelay, GpioPin};

/// Half of one SCK bit cell, in nanoseconds.
const HALF_CELL_NS: u64 = 500;

/// How long to wait for DOUT to signal data-ready before giving up.
const READY_TIMEOUT: Duration = Duration::from_millis(500);

/// The 7-bit opcode that precedes a configuration register write.
const WRITE_OPCODE: u8 = 0x65;

/// The 7-bit opcode that precedes a configuration register read.
const READ_OPCODE: u8 = 0x56;

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
/// The programmable gain of the ADC front end.
pub enum Pga {
    /// Unity gain.
    X1,
    /// Gain of 2.
    X2,
    /// Gain of 64.
    X64,
    /// Gain of 128.
    X128,
}

impl Pga {
    #[must_use]
    /// The two register bits encoding this gain.
    pub fn bits(self) -> u8 {
        match self {
            Pga::X1 => 0,
            Pga::X2 => 1,
            Pga::X64 => 2,
            Pga::X128 => 3,
        }
    }

    #[must_use]
    /// The multiplicative gain applied to the input signal.
    pub fn gain(self) -> f64 {
        match self {
            Pga::X1 => 1.0,
            Pga::X2 => 2.0,
            Pga::X64 => 64.0,
            Pga::X128 => 128.0,
        }
    }

    fn from_bits(bits: u8) -> Pga {
        match bits & 3 {
            0 => Pga::X1,
            1 => Pga::X2,
            2 => Pga::X64,
            _ => Pga::X128,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
/// The output data rate of the ADC.
pub enum Speed {
    /// 10 samples per second.
    Hz10,
    /// 40 samples per second.
    Hz40,
    /// 640 samples per second.
    Hz640,
    /// 1280 samples per second.
    Hz1280,
}

impl Speed {
    #[must_use]
    /// The two register bits encoding this rate.
    pub fn bits(self) -> u8 {
        match self {
            Speed::Hz10 => 0,
            Speed::Hz40 => 1,
            Speed::Hz640 => 2,
            Speed::Hz1280 => 3,
        }
    }

    #[must_use]
    /// The nominal time between two samples at this rate.
    pub fn period(self) -> Duration {
        match self {
            Speed::Hz10 => Duration::from_nanos(100_000_000),
            Speed::Hz40 => Duration::from_nanos(25_000_000),
            Speed::Hz640 => Duration::from_nanos(1_562_500),
            Speed::Hz1280 => Duration::from_nanos(781_250),
        }
    }

    fn from_bits(bits: u8) -> Speed {
        match bits & 3 {
            0 => Speed::Hz10,
            1 => Speed::Hz40,
            2 => Speed::Hz640,
            _ => Speed::Hz1280,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
/// The multiplexer input the ADC converts.
pub enum Channel {
    /// The external analog input pair.
    Analog,
    /// The internal temperature sensor.
    Temperature,
}

impl Channel {
    #[must_use]
    /// The register bit encoding this channel.
    pub fn bit(self) -> u8 {
        match self {
            Channel::Analog => 0,
            Channel::Temperature => 1,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// The contents of the chip's 8-bit configuration register.
pub struct ChipConfig {
    /// Whether the internal reference output is enabled.
    pub refo: bool,
    /// The multiplexer input.
    pub channel: Channel,
    /// Front-end gain.
    pub pga: Pga,
    /// Output data rate.
    pub speed: Speed,
}

impl ChipConfig {
    #[must_use]
    /// Pack this configuration into the register wire format.
    pub fn pack(self) -> u8 {
        (self.speed.bits() & 3)
            | ((self.pga.bits() & 3) << 2)
            | ((self.channel.bit() & 1) << 4)
            | (u8::from(self.refo) << 5)
    }

    #[must_use]
    /// Decode a register value read back from the chip.
    pub fn unpack(raw: u8) -> ChipConfig {
        ChipConfig {
            refo: (raw >> 5) & 1 == 1,
            channel: if (raw >> 4) & 1 == 1 {
                Channel::Temperature
            } else {
                Channel::Analog
            },
            pga: Pga::from_bits(raw >> 2),
            speed: Speed::from_bits(raw),
        }
    }
}

/// Sign-extend a 24-bit two's-complement word into an `i32`.
#[must_use]
pub fn sign_extend_24(value: u32) -> i32 {
    let value = value & 0x00FF_FFFF;
    if value & 0x0080_0000 != 0 {
        (value as i32) - (1 << 24)
    } else {
        value as i32
    }
}

/// Convert a signed sample to millivolts given the reference and gain.
#[must_use]
pub fn millivolts(raw: i32, vref_mv: u32, pga: Pga) -> f64 {
    f64::from(raw) / f64::from(1u32 << 23) * f64::from(vref_mv) / pga.gain()
}

/// One CS1237 chip on three dedicated GPIO lines.
pub struct Cs1237<P: GpioPin> {
    sck: P,
    dout: P,
    din: P,
}

impl<P: GpioPin> Cs1237<P> {
    #[must_use]
    /// Wrap three claimed lines. SCK and DIN must be outputs, DOUT an input.
    pub fn new(sck: P, dout: P, din: P) -> Cs1237<P> {
        Cs1237 { sck, dout, din }
    }

    /// Block until DOUT falls, signalling a conversion is ready.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AdcTimeout`] if DOUT is still high after the protocol
    /// deadline, which usually means a broken wire or an unpowered chip.
    fn wait_ready(&mut self) -> Result<(), Error> {
        let start = std::time::Instant::now();
        loop {
            if !self.dout.read()? {
                return Ok(());
            }
            if start.elapsed() >= READY_TIMEOUT {
                return Err(Error::AdcTimeout);
            }
            ndelay(2 * HALF_CELL_NS);
        }
    }

    /// Clock one bit cell and sample DOUT during the high phase.
    fn cell_in(&mut self) -> Result<bool, Error> {
        self.sck.write(true)?;
        ndelay(HALF_CELL_NS);
        let bit = self.dout.read()?;
        self.sck.write(false)?;
        ndelay(HALF_CELL_NS);
        Ok(bit)
    }

    /// Clock one bit cell, driving DIN during the high phase.
    fn cell_out(&mut self, bit: bool) -> Result<(), Error> {
        self.sck.write(true)?;
        self.din.write(bit)?;
        ndelay(HALF_CELL_NS);
        self.sck.write(false)?;
        ndelay(HALF_CELL_NS);
        Ok(())
    }

    /// Read one signed 24-bit conversion.
    ///
    /// Waits for data-ready, clocks the 24 data bits MSB-first with DIN held
    /// LOW, clocks 3 further bits to terminate the frame, and sign-extends
    /// the result.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AdcTimeout`] if the chip never signals ready, or any
    /// pin fault from the underlying lines.
    pub fn read_sample(&mut self) -> Result<i32, Error> {
        self.din.write(false)?;
        self.wait_ready()?;

        let mut word: u32 = 0;
        for _ in 0..24 {
            word = (word << 1) | u32::from(self.cell_in()?);
        }
        // three extra clocks terminate the frame and re-arm DOUT
        for _ in 0..3 {
            self.cell_in()?;
        }

        Ok(sign_extend_24(word))
    }

    /// Check that DOUT has returned HIGH after a read.
    ///
    /// There is no CRC on the wire, so this is the only integrity signal
    /// available: a DOUT still low five bit cells after frame end points to a
    /// shorted or floating line.
    ///
    /// # Errors
    ///
    /// Returns a pin fault if DOUT cannot be read.
    pub fn wire_check(&mut self) -> Result<bool, Error> {
        for _ in 0..5 {
            if self.dout.read()? {
                return Ok(true);
            }
            ndelay(2 * HALF_CELL_NS);
        }
        Ok(false)
    }

    /// Clock through the 29 preamble cells shared by register access:
    /// 24 dummy data bits, 2 status bits, 1 bit that releases DOUT, and
    /// 2 bits while DOUT switches direction.
    fn register_preamble(&mut self) -> Result<(), Error> {
        self.wait_ready()?;
        for _ in 0..29 {
            self.cell_in()?;
        }
        Ok(())
    }

    /// Shift a 7-bit opcode out MSB-first. The chip inverts DIN internally,
    /// so every bit is inverted on the wire.
    fn shift_opcode(&mut self, opcode: u8) -> Result<(), Error> {
        for i in (0..7).rev() {
            self.cell_out((opcode >> i) & 1 == 0)?;
        }
        Ok(())
    }

    /// Write the 8-bit configuration register.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AdcTimeout`] or a pin fault.
    pub fn write_config(&mut self, value: u8) -> Result<(), Error> {
        self.register_preamble()?;
        self.shift_opcode(WRITE_OPCODE)?;
        // one switch cell between opcode and payload
        self.cell_in()?;
        for i in (0..8).rev() {
            self.cell_out((value >> i) & 1 == 0)?;
        }
        self.din.write(false)?;
        Ok(())
    }

    /// Read back the 8-bit configuration register.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AdcTimeout`] or a pin fault.
    pub fn read_config(&mut self) -> Result<u8, Error> {
        self.register_preamble()?;
        self.shift_opcode(READ_OPCODE)?;
        // after the switch cell DOUT turns back into an output
        self.cell_in()?;
        let mut value: u8 = 0;
        for _ in 0..8 {
            value = (value << 1) | u8::from(self.cell_in()?);
        }
        self.din.write(false)?;
        Ok(value)
    }
}

/// The sample window shared between a bit-bang worker and its readers.
///
/// The worker pushes from its dedicated thread; readers take the latest
/// sample or statistics from the cooperative side. The lock is a spinlock
/// because every critical section is a handful of loads and stores; nothing
/// that can block is ever done while holding it.
pub struct SampleRing {
    locked: AtomicBool,
    inner: UnsafeCell<RingInner>,
}

// Safety: all access to `inner` goes through `with`, which enforces mutual
// exclusion via the `locked` flag.
unsafe impl Sync for SampleRing {}

struct RingInner {
    buf: Vec<i32>,
    next: usize,
    filled: usize,
    sum: i64,
    total: u64,
    latest: Option<i32>,
}

impl SampleRing {
    #[must_use]
    /// A ring holding at most `capacity` samples.
    pub fn new(capacity: usize) -> SampleRing {
        let capacity = capacity.max(1);
        SampleRing {
            locked: AtomicBool::new(false),
            inner: UnsafeCell::new(RingInner {
                buf: vec![0; capacity],
                next: 0,
                filled: 0,
                sum: 0,
                total: 0,
                latest: None,
            }),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut RingInner) -> R) -> R {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
        // Safety: the flag above is held for the duration of the closure.
        let result = f(unsafe { &mut *self.inner.get() });
        self.locked.store(false, Ordering::Release);
        result
    }

    /// Push a sample, evicting the oldest once the ring is full.
    pub fn push(&self, value: i32) {
        self.with(|inner| {
            let capacity = inner.buf.len();
            if inner.filled == capacity {
                inner.sum -= i64::from(inner.buf[inner.next]);
            } else {
                inner.filled += 1;
            }
            inner.buf[inner.next] = value;
            inner.next = (inner.next + 1) % capacity;
            inner.sum += i64::from(value);
            inner.total += 1;
            inner.latest = Some(value);
        });
    }

    #[must_use]
    /// The most recent sample, if any.
    pub fn latest(&self) -> Option<i32> {
        self.with(|inner| inner.latest)
    }

    #[must_use]
    /// The mean over the current window.
    #[allow(clippy::cast_precision_loss)]
    pub fn mean(&self) -> Option<f64> {
        self.with(|inner| {
            if inner.filled == 0 {
                None
            } else {
                Some(inner.sum as f64 / inner.filled as f64)
            }
        })
    }

    #[must_use]
    /// The median over the current window.
    pub fn median(&self) -> Option<i32> {
        let mut window = self.snapshot();
        if window.is_empty() {
            return None;
        }
        window.sort_unstable();
        Some(window[window.len() / 2])
    }

    #[must_use]
    /// A copy of the current window, oldest first.
    pub fn snapshot(&self) -> Vec<i32> {
        self.with(|inner| {
            let capacity = inner.buf.len();
            let mut out = Vec::with_capacity(inner.filled);
            let start = (inner.next + capacity - inner.filled) % capacity;
            for i in 0..inner.filled {
                out.push(inner.buf[(start + i) % capacity]);
            }
            out
        })
    }

    #[must_use]
    /// How many samples have ever been pushed.
    pub fn total(&self) -> u64 {
        self.with(|inner| inner.total)
    }
}

/// A read-side handle onto a running [`Sampler`].
#[derive(Clone)]
pub struct SampleReader {
    ring: Arc<SampleRing>,
    wire_faults: Arc<AtomicU32>,
    alive: Arc<AtomicBool>,
}

impl SampleReader {
    #[must_use]
    /// The most recent sample.
    pub fn latest(&self) -> Option<i32> {
        self.ring.latest()
    }

    #[must_use]
    /// The mean over the ring window.
    pub fn mean(&self) -> Option<f64> {
        self.ring.mean()
    }

    #[must_use]
    /// The median over the ring window, for noisy channels.
    pub fn median(&self) -> Option<i32> {
        self.ring.median()
    }

    #[must_use]
    /// How many wire-check warnings the worker has recorded.
    pub fn wire_faults(&self) -> u32 {
        self.wire_faults.load(Ordering::Relaxed)
    }

    #[must_use]
    /// Whether the worker thread is still sampling.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
impl SampleReader {
    /// A detached reader over fixed samples, for driver tests that need
    /// known counts without a worker thread.
    pub(crate) fn fixed(samples: &[i32]) -> SampleReader {
        let ring = SampleRing::new(samples.len().max(1));
        for s in samples {
            ring.push(*s);
        }
        SampleReader {
            ring: Arc::new(ring),
            wire_faults: Arc::new(AtomicU32::new(0)),
            alive: Arc::new(AtomicBool::new(true)),
        }
    }
}

/// A continuous-sampling worker owning one CS1237 on its own OS thread.
///
/// The worker configures the chip, then loops: sleep about 95 % of the
/// nominal sample period, read a conversion, push it into the ring, and run
/// the wire check. Dropping the sampler stops and joins the thread.
pub struct Sampler {
    ring: Arc<SampleRing>,
    wire_faults: Arc<AtomicU32>,
    alive: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    join: Option<thread::JoinHandle<()>>,
}

impl Sampler {
    /// Configure the chip and launch the sampling thread.
    ///
    /// # Errors
    ///
    /// Returns any error from the initial configuration write; after that,
    /// faults are reported through the reader's liveness flag.
    pub fn spawn<P: GpioPin + 'static>(
        mut chip: Cs1237<P>,
        config: ChipConfig,
        ring_capacity: usize,
    ) -> Result<Sampler, Error> {
        chip.write_config(config.pack())?;

        let ring = Arc::new(SampleRing::new(ring_capacity));
        let wire_faults = Arc::new(AtomicU32::new(0));
        let alive = Arc::new(AtomicBool::new(true));
        let stop = Arc::new(AtomicBool::new(false));

        let period = config.speed.period().mul_f64(0.95);
        let worker = SamplerWorker {
            chip,
            ring: Arc::clone(&ring),
            wire_faults: Arc::clone(&wire_faults),
            alive: Arc::clone(&alive),
            stop: Arc::clone(&stop),
            period,
        };

        let join = thread::Builder::new()
            .name("cs1237-sampler".into())
            .spawn(move || worker.run())
            .map_err(Error::Storage)?;

        Ok(Sampler {
            ring,
            wire_faults,
            alive,
            stop,
            join: Some(join),
        })
    }

    #[must_use]
    /// A cloneable read-side handle.
    pub fn reader(&self) -> SampleReader {
        SampleReader {
            ring: Arc::clone(&self.ring),
            wire_faults: Arc::clone(&self.wire_faults),
            alive: Arc::clone(&self.alive),
        }
    }

    /// Signal the worker to stop and wait for it to exit.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
        self.alive.store(false, Ordering::Relaxed);
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        self.stop();
    }
}

struct SamplerWorker<P: GpioPin> {
    chip: Cs1237<P>,
    ring: Arc<SampleRing>,
    wire_faults: Arc<AtomicU32>,
    alive: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    period: Duration,
}

impl<P: GpioPin> SamplerWorker<P> {
    fn run(mut self) {
        // Deterministic microsecond timing matters more than fairness here.
        if let Err(e) =
            thread_priority::set_current_thread_priority(thread_priority::ThreadPriority::Max)
        {
            debug!("could not raise CS1237 worker priority: {e:?}");
        }

        while !self.stop.load(Ordering::Relaxed) {
            thread::sleep(self.period);
            match self.chip.read_sample() {
                Ok(sample) => {
                    self.ring.push(sample);
                    match self.chip.wire_check() {
                        Ok(true) => {}
                        Ok(false) => {
                            self.wire_faults.fetch_add(1, Ordering::Relaxed);
                            warn!("CS1237 wire check failed: DOUT did not return high");
                        }
                        Err(e) => {
                            warn!("CS1237 wire check unreadable: {e}");
                        }
                    }
                }
                Err(e) if e.is_transient() => {
                    warn!("CS1237 sample missed: {e}");
                }
                Err(e) => {
                    log::error!("CS1237 worker stopping on persistent fault: {e}");
                    break;
                }
            }
        }
        self.alive.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use crate::hardware::{ListenerPin, ScriptPin};

    use super::*;

    /// DOUT script for one conversion of `word`: one ready poll, 24 data
    /// bits MSB-first, 3 termination cells, then the post-read wire check.
    fn conversion_script(word: u32) -> Vec<bool> {
        let mut script = vec![false]; // data-ready poll sees DOUT low
        for i in (0..24).rev() {
            script.push((word >> i) & 1 == 1);
        }
        script.extend([false, false, false]); // termination cells
        script.push(true); // wire check: DOUT back high
        script
    }

    /// Mixed pin doubles share no concrete type; erase them like the real
    /// platform does.
    fn chip_with(
        sck: impl GpioPin + 'static,
        dout: impl GpioPin + 'static,
        din: impl GpioPin + 'static,
    ) -> Cs1237<Box<dyn GpioPin>> {
        Cs1237::new(Box::new(sck), Box::new(dout), Box::new(din))
    }

    #[test]
    fn config_packing_matches_layout() {
        let config = ChipConfig {
            refo: false,
            channel: Channel::Analog,
            pga: Pga::X128,
            speed: Speed::Hz10,
        };
        assert_eq!(config.pack(), 0b0000_1100);

        let config = ChipConfig {
            refo: true,
            channel: Channel::Temperature,
            pga: Pga::X2,
            speed: Speed::Hz1280,
        };
        assert_eq!(config.pack(), 0b0011_0111);
        assert_eq!(ChipConfig::unpack(config.pack()), config);
    }

    #[test]
    fn sign_extension() {
        assert_eq!(sign_extend_24(0x0080_0000), -8_388_608);
        assert_eq!(sign_extend_24(0x007F_FFFF), 8_388_607);
        assert_eq!(sign_extend_24(0x00FF_FFFF), -1);
        assert_eq!(sign_extend_24(0), 0);
    }

    #[test]
    fn millivolt_scaling() {
        let mv = millivolts(-8_388_608, 3300, Pga::X1);
        assert!((mv - (-3300.0)).abs() < 1e-9);
        let mv = millivolts(8_388_608 / 2, 3300, Pga::X2);
        assert!((mv - 825.0).abs() < 1e-9);
    }

    #[test]
    fn read_sample_full_scale_negative() {
        let dout = ScriptPin::new(conversion_script(0x0080_0000), true);
        let mut chip = chip_with(ListenerPin::new(false), dout, ListenerPin::new(false));
        assert_eq!(chip.read_sample().unwrap(), -8_388_608);
        assert!(chip.wire_check().unwrap());
    }

    #[test]
    fn read_sample_times_out_when_dout_stuck_high() {
        let dout = ScriptPin::new([], true);
        let mut chip = chip_with(ListenerPin::new(false), dout, ListenerPin::new(false));
        assert!(matches!(chip.read_sample(), Err(Error::AdcTimeout)));
    }

    #[test]
    fn write_config_inverts_opcode_and_payload_on_the_wire() {
        let din = ListenerPin::new(false);
        let dout = ScriptPin::new([false], false);
        let mut chip = chip_with(ListenerPin::new(false), dout, din.clone());
        chip.write_config(0b0000_1100).unwrap();

        // opcode 0x65 = 1100101 inverted, then payload 0x0C inverted, then
        // the final release of DIN
        let expected = [
            false, // initial level of the double
            false, false, true, true, false, true, false, // !opcode
            true, true, true, true, false, false, true, true, // !payload
            false, // DIN released low
        ];
        assert_eq!(din.history(), expected);
    }

    #[test]
    fn read_config_samples_payload_msb_first() {
        let mut script = vec![false]; // ready
        script.extend(std::iter::repeat(false).take(29)); // preamble cells
        script.push(false); // switch cell
        for i in (0..8).rev() {
            script.push((0x2Cu8 >> i) & 1 == 1);
        }
        let dout = ScriptPin::new(script, false);
        let mut chip = chip_with(ListenerPin::new(false), dout, ListenerPin::new(false));
        assert_eq!(chip.read_config().unwrap(), 0x2C);
    }

    #[test]
    fn ring_tracks_latest_mean_median() {
        let ring = SampleRing::new(4);
        assert_eq!(ring.latest(), None);
        assert_eq!(ring.mean(), None);
        for v in [10, 20, 30, 40] {
            ring.push(v);
        }
        assert_eq!(ring.latest(), Some(40));
        assert_eq!(ring.mean(), Some(25.0));
        // overwrite the oldest
        ring.push(50);
        assert_eq!(ring.snapshot(), vec![20, 30, 40, 50]);
        assert_eq!(ring.mean(), Some(35.0));
        assert_eq!(ring.median(), Some(40));
        assert_eq!(ring.total(), 5);
    }

    #[test]
    fn ring_is_safe_across_threads() {
        let ring = Arc::new(SampleRing::new(8));
        let writer = Arc::clone(&ring);
        let handle = std::thread::spawn(move || {
            for v in 0..1000 {
                writer.push(v);
            }
        });
        let mut last_seen = None;
        while ring.total() < 1000 {
            if let Some(v) = ring.latest() {
                last_seen = Some(v);
            }
            std::hint::spin_loop();
        }
        handle.join().unwrap();
        assert!(last_seen.is_some());
        assert_eq!(ring.latest(), Some(999));
    }
}
