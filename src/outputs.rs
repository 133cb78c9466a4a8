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

//! The output arbiter: sole authority over every controllable pin.
//!
//! Every MOSFET gate in the installation is claimed here at startup and
//! nothing else in the process may toggle GPIO. All transitions are
//! serialized per pin; pulses are timed by a single expiry worker; and two
//! interlocks guard the biology from a stuck controller: a maximum
//! continuous HIGH time (a dosing pump that never stops will empty its
//! canister into the reservoir) and a minimum interval between rises.
//! A panic-off drives everything LOW and latches further writes off until
//! explicitly cleared.

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, RwLock,
    },
    thread,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender};
use log::{error, info, warn};
use serde::Serialize;

use crate::{
    clock::Clock,
    config::OutputPinConfig,
    error::Error,
    hardware::{GpioPin, Platform},
};

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
/// The externally visible state of one managed pin.
pub enum PinState {
    /// Driven LOW.
    Low,
    /// Driven HIGH until told otherwise.
    High,
    /// Driven HIGH, with a scheduled fall.
    Pulsing {
        /// When the pulse ends.
        #[serde(with = "chrono::serde::ts_milliseconds")]
        until: DateTime<Utc>,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
/// One row of [`OutputArbiter::list`].
pub struct PinSnapshot {
    /// The platform pin number.
    pub pin: u8,
    /// The configured label.
    pub label: String,
    /// The pin's current state.
    pub state: PinState,
}

/// A cancellation token for an in-flight pulse.
///
/// The token is only valid for the pulse that created it: once the pulse
/// ends or the pin transitions for any other reason, cancelling becomes a
/// no-op.
#[derive(Clone, Copy, Debug)]
pub struct PulseHandle {
    pin: u8,
    generation: u64,
}

struct ManagedPin {
    pin: u8,
    label: String,
    line: Box<dyn GpioPin>,
    max_on: Duration,
    min_interval: Duration,
    level: bool,
    /// Bumped on every transition; deadlines carrying an older generation
    /// are stale and ignored by the expiry worker.
    generation: u64,
    pulse_until: Option<DateTime<Utc>>,
    high_since: Option<Instant>,
    last_rise: Option<Instant>,
}

impl ManagedPin {
    fn rise(&mut self, now: Instant) -> Result<(), Error> {
        if let Some(last) = self.last_rise {
            if now.duration_since(last) < self.min_interval {
                return Err(Error::Refused {
                    pin: self.pin,
                    reason: format!(
                        "rises closer than the configured {} s minimum interval",
                        self.min_interval.as_secs()
                    ),
                });
            }
        }
        self.line.write(true)?;
        self.level = true;
        self.generation += 1;
        self.last_rise = Some(now);
        self.high_since = Some(now);
        Ok(())
    }

    fn fall(&mut self) -> Result<(), Error> {
        self.line.write(false)?;
        self.level = false;
        self.generation += 1;
        self.pulse_until = None;
        self.high_since = None;
        Ok(())
    }

    fn state(&self) -> PinState {
        match (self.level, self.pulse_until) {
            (false, _) => PinState::Low,
            (true, None) => PinState::High,
            (true, Some(until)) => PinState::Pulsing { until },
        }
    }
}

enum WorkerMsg {
    Deadline {
        pin: u8,
        generation: u64,
        at: Instant,
        /// A forced deadline is the max-on watchdog rather than a pulse end.
        forced: bool,
    },
    Shutdown,
}

type PinTable = Arc<RwLock<HashMap<u8, Arc<Mutex<ManagedPin>>>>>;

/// Holds the authoritative state of every managed pin.
pub struct OutputArbiter {
    pins: PinTable,
    panicked: Arc<AtomicBool>,
    worker_tx: Sender<WorkerMsg>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
    clock: Arc<dyn Clock>,
}

impl OutputArbiter {
    /// Claim every declared pin from the platform and drive it LOW.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LineUnavailable`] if any pin cannot be claimed.
    pub fn new(
        platform: &mut dyn Platform,
        declared: &[OutputPinConfig],
        clock: Arc<dyn Clock>,
    ) -> Result<OutputArbiter, Error> {
        let mut table = HashMap::new();
        for spec in declared {
            let mut line = platform.claim_output(spec.pin)?;
            line.write(false)?;
            table.insert(
                spec.pin,
                Arc::new(Mutex::new(ManagedPin {
                    pin: spec.pin,
                    label: spec.label.clone(),
                    line,
                    max_on: spec.max_on(),
                    min_interval: spec.min_interval(),
                    level: false,
                    generation: 0,
                    pulse_until: None,
                    high_since: None,
                    last_rise: None,
                })),
            );
        }

        let pins: PinTable = Arc::new(RwLock::new(table));
        let (worker_tx, worker_rx) = bounded(64);
        let worker_pins = Arc::clone(&pins);
        let worker = thread::Builder::new()
            .name("arbiter-expiry".into())
            .spawn(move || expiry_worker(&worker_pins, &worker_rx))
            .map_err(Error::Storage)?;

        Ok(OutputArbiter {
            pins,
            panicked: Arc::new(AtomicBool::new(false)),
            worker_tx,
            worker: Mutex::new(Some(worker)),
            clock,
        })
    }

    fn slot(&self, pin: u8) -> Result<Arc<Mutex<ManagedPin>>, Error> {
        self.pins
            .read()?
            .get(&pin)
            .cloned()
            .ok_or(Error::NoSuchPin(pin))
    }

    fn refuse_if_panicked(&self) -> Result<(), Error> {
        if self.panicked.load(Ordering::SeqCst) {
            return Err(Error::PanicLatched);
        }
        Ok(())
    }

    fn schedule(&self, pin: u8, generation: u64, at: Instant, forced: bool) {
        // a full queue means the worker is wedged; the watchdog deadline is
        // then enforced on the next explicit transition instead
        let _ = self.worker_tx.try_send(WorkerMsg::Deadline {
            pin,
            generation,
            at,
            forced,
        });
    }

    /// Drive a pin permanently HIGH or LOW. Idempotent: repeating the
    /// current state produces no edge. Returns the previous level.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoSuchPin`], [`Error::PanicLatched`], or
    /// [`Error::Refused`] from the minimum-interval interlock.
    pub fn set(&self, pin: u8, on: bool) -> Result<bool, Error> {
        self.refuse_if_panicked()?;
        let slot = self.slot(pin)?;
        let mut managed = slot.lock()?;
        let previous = managed.level;

        if on {
            if managed.level {
                // already high; a pending pulse becomes a permanent on
                if managed.pulse_until.take().is_some() {
                    managed.generation += 1;
                    let base = managed.high_since.unwrap_or_else(Instant::now);
                    self.schedule(pin, managed.generation, base + managed.max_on, true);
                }
                return Ok(previous);
            }
            let now = Instant::now();
            managed.rise(now)?;
            self.schedule(pin, managed.generation, now + managed.max_on, true);
        } else {
            if !managed.level {
                return Ok(previous);
            }
            managed.fall()?;
        }
        Ok(previous)
    }

    /// Drive a pin HIGH for `duration`, then LOW. A second pulse on a
    /// pulsing pin cancels the first and restarts the timing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Refused`] if `duration` exceeds the pin's maximum
    /// on-time, plus the same errors as [`OutputArbiter::set`].
    pub fn pulse(&self, pin: u8, duration: Duration) -> Result<PulseHandle, Error> {
        self.refuse_if_panicked()?;
        let slot = self.slot(pin)?;
        let mut managed = slot.lock()?;

        if duration > managed.max_on {
            return Err(Error::Refused {
                pin,
                reason: format!(
                    "pulse of {} ms exceeds the {} s maximum on-time",
                    duration.as_millis(),
                    managed.max_on.as_secs()
                ),
            });
        }

        let now = Instant::now();
        if managed.level {
            // supersede the in-flight pulse
            managed.generation += 1;
        } else {
            managed.rise(now)?;
        }
        managed.pulse_until = Some(self.clock.now_utc() + chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero()));
        let generation = managed.generation;
        self.schedule(pin, generation, now + duration, false);
        if let Some(high_since) = managed.high_since {
            self.schedule(pin, generation, high_since + managed.max_on, true);
        }
        Ok(PulseHandle { pin, generation })
    }

    /// Cancel an in-flight pulse, driving the pin LOW now.
    /// Returns whether the handle still named the live pulse.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoSuchPin`] if the pin vanished.
    pub fn cancel(&self, handle: PulseHandle) -> Result<bool, Error> {
        let slot = self.slot(handle.pin)?;
        let mut managed = slot.lock()?;
        if managed.generation != handle.generation || managed.pulse_until.is_none() {
            return Ok(false);
        }
        managed.fall()?;
        Ok(true)
    }

    #[must_use]
    /// A snapshot of every managed pin, ordered by pin number.
    pub fn list(&self) -> Vec<PinSnapshot> {
        let Ok(table) = self.pins.read() else {
            return Vec::new();
        };
        let mut snapshots: Vec<PinSnapshot> = table
            .values()
            .filter_map(|slot| {
                let managed = slot.lock().ok()?;
                Some(PinSnapshot {
                    pin: managed.pin,
                    label: managed.label.clone(),
                    state: managed.state(),
                })
            })
            .collect();
        snapshots.sort_by_key(|s| s.pin);
        snapshots
    }

    #[must_use]
    /// Whether a pin is currently driven HIGH.
    pub fn is_high(&self, pin: u8) -> bool {
        self.slot(pin)
            .ok()
            .and_then(|slot| slot.lock().ok().map(|m| m.level))
            .unwrap_or(false)
    }

    /// Drive every managed pin LOW and refuse all further writes until
    /// [`OutputArbiter::clear_panic`].
    ///
    /// # Errors
    ///
    /// Returns the first pin fault encountered; every remaining pin is still
    /// attempted. A failed panic-off is fatal to the runtime.
    pub fn panic_off(&self) -> Result<(), Error> {
        self.panicked.store(true, Ordering::SeqCst);
        warn!("panic-off: driving all outputs low");
        let table = self.pins.read()?;
        let mut first_failure = None;
        for slot in table.values() {
            match slot.lock() {
                Ok(mut managed) => {
                    if let Err(e) = managed.fall() {
                        error!("panic-off failed on pin {}: {e}", managed.pin);
                        first_failure.get_or_insert(e);
                    }
                }
                Err(_) => {
                    first_failure.get_or_insert(Error::Poison);
                }
            }
        }
        match first_failure {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Lift the panic-off latch.
    pub fn clear_panic(&self) {
        info!("panic-off latch cleared");
        self.panicked.store(false, Ordering::SeqCst);
    }

    #[must_use]
    /// Whether the panic-off latch is set.
    pub fn is_panicked(&self) -> bool {
        self.panicked.load(Ordering::SeqCst)
    }
}

impl Drop for OutputArbiter {
    fn drop(&mut self) {
        let _ = self.worker_tx.send(WorkerMsg::Shutdown);
        if let Ok(mut guard) = self.worker.lock() {
            if let Some(join) = guard.take() {
                let _ = join.join();
            }
        }
    }
}

/// The expiry worker: sleeps until the earliest pending deadline and drives
/// the pin LOW if its generation is still current.
fn expiry_worker(pins: &PinTable, rx: &Receiver<WorkerMsg>) {
    let mut deadlines: BinaryHeap<Reverse<(Instant, u8, u64, bool)>> = BinaryHeap::new();
    loop {
        let msg = match deadlines.peek() {
            None => rx.recv().ok(),
            Some(Reverse((at, _, _, _))) => {
                let timeout = at.saturating_duration_since(Instant::now());
                match rx.recv_timeout(timeout) {
                    Ok(msg) => Some(msg),
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                        fire(pins, &mut deadlines);
                        continue;
                    }
                    Err(crossbeam_channel::RecvTimeoutError::Disconnected) => None,
                }
            }
        };
        match msg {
            Some(WorkerMsg::Deadline {
                pin,
                generation,
                at,
                forced,
            }) => {
                deadlines.push(Reverse((at, pin, generation, forced)));
            }
            Some(WorkerMsg::Shutdown) | None => break,
        }
    }
}

fn fire(pins: &PinTable, deadlines: &mut BinaryHeap<Reverse<(Instant, u8, u64, bool)>>) {
    let Some(Reverse((_, pin, generation, forced))) = deadlines.pop() else {
        return;
    };
    let Ok(table) = pins.read() else { return };
    let Some(slot) = table.get(&pin) else { return };
    let Ok(mut managed) = slot.lock() else { return };
    if managed.generation != generation || !managed.level {
        return;
    }
    if forced {
        warn!(
            "interlock: pin {pin} ({}) exceeded its maximum on-time, forcing low",
            managed.label
        );
    }
    if let Err(e) = managed.fall() {
        error!("failed to drive pin {pin} low at deadline: {e}");
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        clock::SystemClock,
        config::OutputPinConfig,
        hardware::Simulator,
    };

    use super::*;

    fn pin_config(pin: u8, max_on_secs: u64, min_interval_secs: u64) -> OutputPinConfig {
        OutputPinConfig {
            pin,
            label: format!("pin{pin}"),
            max_on_secs,
            min_interval_secs,
        }
    }

    fn arbiter_with(
        declared: &[OutputPinConfig],
    ) -> (OutputArbiter, Arc<crate::hardware::SimState>) {
        let mut sim = Simulator::new();
        let state = sim.state();
        let arbiter = OutputArbiter::new(&mut sim, declared, Arc::new(SystemClock)).unwrap();
        (arbiter, state)
    }

    #[test]
    fn set_is_idempotent() {
        let (arbiter, state) = arbiter_with(&[pin_config(17, 600, 0)]);
        assert!(!arbiter.set(17, true).unwrap());
        assert!(arbiter.set(17, true).unwrap());
        // claim drives low once, then exactly one rising edge
        assert_eq!(state.history(17), vec![false, true]);
        assert!(arbiter.set(17, false).unwrap());
        assert!(!arbiter.set(17, false).unwrap());
        assert_eq!(state.history(17), vec![false, true, false]);
    }

    #[test]
    fn unknown_pin_is_refused() {
        let (arbiter, _) = arbiter_with(&[pin_config(17, 600, 0)]);
        assert!(matches!(arbiter.set(5, true), Err(Error::NoSuchPin(5))));
    }

    #[test]
    fn pulse_expires() {
        let (arbiter, state) = arbiter_with(&[pin_config(17, 600, 0)]);
        arbiter.pulse(17, Duration::from_millis(40)).unwrap();
        assert!(arbiter.is_high(17));
        assert!(matches!(
            arbiter.list()[0].state,
            PinState::Pulsing { .. }
        ));
        thread::sleep(Duration::from_millis(150));
        assert!(!arbiter.is_high(17));
        assert_eq!(state.history(17), vec![false, true, false]);
    }

    #[test]
    fn second_pulse_supersedes_first() {
        let (arbiter, state) = arbiter_with(&[pin_config(17, 600, 0)]);
        arbiter.pulse(17, Duration::from_secs(30)).unwrap();
        arbiter.pulse(17, Duration::from_millis(40)).unwrap();
        thread::sleep(Duration::from_millis(150));
        assert!(!arbiter.is_high(17));
        // one rise, one fall: the second pulse reused the high level
        assert_eq!(state.history(17), vec![false, true, false]);
    }

    #[test]
    fn cancel_only_applies_to_live_pulse() {
        let (arbiter, _) = arbiter_with(&[pin_config(17, 600, 0)]);
        let first = arbiter.pulse(17, Duration::from_secs(30)).unwrap();
        let second = arbiter.pulse(17, Duration::from_secs(30)).unwrap();
        // the first handle is stale
        assert!(!arbiter.cancel(first).unwrap());
        assert!(arbiter.is_high(17));
        assert!(arbiter.cancel(second).unwrap());
        assert!(!arbiter.is_high(17));
    }

    #[test]
    fn over_long_pulse_is_refused() {
        let (arbiter, _) = arbiter_with(&[pin_config(17, 1, 0)]);
        let err = arbiter.pulse(17, Duration::from_secs(5)).unwrap_err();
        assert!(err.is_refusal());
        assert!(!arbiter.is_high(17));
    }

    #[test]
    fn min_interval_interlock_refuses_fast_rises() {
        let (arbiter, _) = arbiter_with(&[pin_config(17, 600, 3600)]);
        arbiter.set(17, true).unwrap();
        arbiter.set(17, false).unwrap();
        let err = arbiter.set(17, true).unwrap_err();
        assert!(err.is_refusal());
        assert!(!arbiter.is_high(17));
    }

    #[test]
    fn watchdog_forces_stuck_pin_low() {
        let mut sim = Simulator::new();
        let state = sim.state();
        let declared = [OutputPinConfig {
            pin: 17,
            label: "stuck".into(),
            max_on_secs: 600,
            min_interval_secs: 0,
        }];
        let arbiter = OutputArbiter::new(&mut sim, &declared, Arc::new(SystemClock)).unwrap();
        // shrink the interlock under the lock to avoid a test-only config knob
        {
            let slot = arbiter.slot(17).unwrap();
            slot.lock().unwrap().max_on = Duration::from_millis(40);
        }
        arbiter.set(17, true).unwrap();
        thread::sleep(Duration::from_millis(200));
        assert!(!arbiter.is_high(17));
        assert_eq!(state.history(17), vec![false, true, false]);
    }

    #[test]
    fn panic_off_latches_writes() {
        let (arbiter, state) = arbiter_with(&[pin_config(17, 600, 0), pin_config(27, 600, 0)]);
        arbiter.set(17, true).unwrap();
        arbiter.set(27, true).unwrap();
        arbiter.panic_off().unwrap();
        assert!(!arbiter.is_high(17));
        assert!(!arbiter.is_high(27));
        assert!(state.history(17).ends_with(&[false]));
        assert!(matches!(arbiter.set(17, true), Err(Error::PanicLatched)));
        assert!(matches!(
            arbiter.pulse(27, Duration::from_millis(10)),
            Err(Error::PanicLatched)
        ));
        arbiter.clear_panic();
        arbiter.set(17, true).unwrap();
        assert!(arbiter.is_high(17));
    }

    #[test]
    fn list_reports_levels() {
        let (arbiter, _) = arbiter_with(&[pin_config(17, 600, 0), pin_config(27, 600, 0)]);
        arbiter.set(27, true).unwrap();
        let listing = arbiter.list();
        assert_eq!(listing.len(), 2);
        assert_eq!(listing[0].pin, 17);
        assert_eq!(listing[0].state, PinState::Low);
        assert_eq!(listing[1].pin, 27);
        assert_eq!(listing[1].state, PinState::High);
    }
}
