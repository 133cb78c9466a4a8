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

//! The cooperative scheduler loop.
//!
//! One thread drives every enabled sensor and controller: each task has a
//! next-fire instant, the loop sleeps until the earliest one (or an incoming
//! command), runs the due tasks to completion, and advances their deadlines
//! by the entity's update interval. A missed deadline coalesces into at most
//! one deferred run — the loop never queues a backlog.
//!
//! Error policy per task, from the crate's error vocabulary: transient
//! faults retry at the next normal tick, configuration and persistent faults
//! mark the task FAILED until its entity is reconfigured, and fatal faults
//! stop the loop. However the loop ends, the outputs are driven low on the
//! way out.

use std::{
    collections::HashMap,
    fmt::Display,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use log::{error, info, warn};

use crate::{error::Error, runtime::Core, ControllerId, SensorId};

/// How long an idle loop (no tasks at all) waits between table re-scans.
const IDLE_RESCAN: Duration = Duration::from_millis(500);

/// How long [`Scheduler::stop`] waits for graceful completion.
const STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
/// Names one schedulable task.
pub enum TaskKey {
    /// A sensor read cycle.
    Sensor(SensorId),
    /// A controller process step.
    Controller(ControllerId),
}

impl Display for TaskKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskKey::Sensor(id) => write!(f, "sensor {id}"),
            TaskKey::Controller(id) => write!(f, "controller {id}"),
        }
    }
}

enum Command {
    /// Pull a task's next fire to now.
    RunNow(TaskKey),
    /// Re-scan the entity tables.
    Wake,
    /// Exit the loop.
    Stop,
}

struct Shared {
    running: AtomicBool,
    fatal: AtomicBool,
    ticks: AtomicU64,
    last_tick: Mutex<Option<DateTime<Utc>>>,
}

/// A handle on the running scheduler loop.
pub struct Scheduler {
    tx: Sender<Command>,
    done_rx: Receiver<()>,
    shared: Arc<Shared>,
    join: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Scheduler {
    /// Spawn the loop over the runtime core.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the thread cannot be spawned.
    pub(crate) fn start(core: Arc<Core>) -> Result<Scheduler, Error> {
        let (tx, rx) = unbounded();
        let (done_tx, done_rx) = bounded(1);
        let shared = Arc::new(Shared {
            running: AtomicBool::new(true),
            fatal: AtomicBool::new(false),
            ticks: AtomicU64::new(0),
            last_tick: Mutex::new(None),
        });

        let worker = Worker {
            core,
            rx,
            shared: Arc::clone(&shared),
        };
        let join = thread::Builder::new()
            .name("scheduler".into())
            .spawn(move || {
                worker.run();
                let _ = done_tx.send(());
            })
            .map_err(Error::Storage)?;

        Ok(Scheduler {
            tx,
            done_rx,
            shared,
            join: Mutex::new(Some(join)),
        })
    }

    /// Pull one task's next fire to now.
    pub fn run_now(&self, key: TaskKey) {
        let _ = self.tx.send(Command::RunNow(key));
    }

    /// Ask the loop to re-scan the entity tables.
    pub fn wake(&self) {
        let _ = self.tx.send(Command::Wake);
    }

    /// Signal the loop and wait up to five seconds for it to finish its
    /// current task and exit.
    pub fn stop(&self) {
        let _ = self.tx.send(Command::Stop);
        if self.done_rx.recv_timeout(STOP_GRACE).is_err() {
            warn!("scheduler did not confirm shutdown within {STOP_GRACE:?}");
        }
        if let Ok(mut guard) = self.join.lock() {
            if let Some(join) = guard.take() {
                let _ = join.join();
            }
        }
    }

    #[must_use]
    /// A receiver that yields once when the loop exits.
    pub fn done_receiver(&self) -> Receiver<()> {
        self.done_rx.clone()
    }

    #[must_use]
    /// (running, last tick, completed ticks).
    pub fn snapshot(&self) -> (bool, Option<DateTime<Utc>>, u64) {
        (
            self.shared.running.load(Ordering::Relaxed),
            self.shared.last_tick.lock().ok().and_then(|g| *g),
            self.shared.ticks.load(Ordering::Relaxed),
        )
    }

    #[must_use]
    /// Whether the loop exited on a fatal error.
    pub fn was_fatal(&self) -> bool {
        self.shared.fatal.load(Ordering::Relaxed)
    }
}

struct Worker {
    core: Arc<Core>,
    rx: Receiver<Command>,
    shared: Arc<Shared>,
}

impl Worker {
    fn run(self) {
        info!("scheduler loop running");
        let mut next_fire: HashMap<TaskKey, Instant> = HashMap::new();

        'outer: loop {
            let tasks = self.core.task_intervals();
            next_fire.retain(|key, _| tasks.iter().any(|(k, _)| k == key));
            let now = Instant::now();
            for (key, _) in &tasks {
                next_fire.entry(*key).or_insert(now);
            }

            let timeout = next_fire
                .values()
                .min()
                .map_or(IDLE_RESCAN, |at| at.saturating_duration_since(Instant::now()));

            match self.rx.recv_timeout(timeout) {
                Ok(Command::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                Ok(Command::Wake) => continue,
                Ok(Command::RunNow(key)) => {
                    if let Some(due) = next_fire.get_mut(&key) {
                        *due = Instant::now();
                    }
                    continue;
                }
                Err(RecvTimeoutError::Timeout) => {}
            }

            let now = Instant::now();
            for (key, interval) in &tasks {
                let Some(due) = next_fire.get_mut(key) else {
                    continue;
                };
                if *due > now {
                    continue;
                }

                match self.core.run_task(*key) {
                    Ok(()) => {}
                    Err(e) if e.is_transient() => {
                        warn!("{key}: transient fault, retrying at next tick: {e}");
                    }
                    Err(e) if e.is_fatal() => {
                        error!("{key}: fatal error, stopping the scheduler: {e}");
                        self.shared.fatal.store(true, Ordering::Relaxed);
                        break 'outer;
                    }
                    Err(e) => {
                        // configuration or persistent hardware fault:
                        // suppress until the entity is reconfigured
                        warn!("{key}: marked FAILED: {e}");
                        self.core.mark_failed(*key, &e.to_string());
                    }
                }

                // coalesce missed fires into at most one deferred run
                let next = *due + *interval;
                *due = if next < Instant::now() {
                    Instant::now()
                } else {
                    next
                };

                self.shared.ticks.fetch_add(1, Ordering::Relaxed);
                if let Ok(mut last) = self.shared.last_tick.lock() {
                    *last = Some(self.core.clock.now_utc());
                }
            }
        }

        info!("scheduler loop exiting, securing outputs");
        self.core.secure_outputs();
        self.shared.running.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::{
        clock::SystemClock,
        config::RuntimeConfig,
        hardware::Simulator,
        runtime::{Runtime, SensorSpec},
    };

    use super::*;

    fn test_runtime() -> (Runtime, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = RuntimeConfig::simulated(dir.path().to_path_buf());
        let runtime = Runtime::new(
            config,
            Box::new(Simulator::new()),
            Arc::new(SystemClock),
        )
        .unwrap();
        (runtime, dir)
    }

    fn ds18b20_spec(name: &str) -> SensorSpec {
        SensorSpec {
            name: name.into(),
            driver: "ds18b20".into(),
            description: String::new(),
            enabled: true,
            update_interval_secs: 1,
            config: serde_json::json!({}),
            calibration: crate::calibration::Calibration::new(),
        }
    }

    #[test]
    fn scheduler_drives_an_enabled_sensor() {
        let (runtime, _dir) = test_runtime();
        let sensor = runtime.create_sensor(ds18b20_spec("tank_temp")).unwrap();
        runtime.start().unwrap();
        std::thread::sleep(Duration::from_millis(1500));
        runtime.stop().unwrap();

        let latest = runtime.latest_measurement(sensor.id).unwrap().unwrap();
        // the simulated probe reads 22.687 C
        assert!((latest.value - 22.687).abs() < 1e-9);
        assert!(runtime.get_sensor(sensor.id).unwrap().last_measurement_at.is_some());
    }

    #[test]
    fn persistent_fault_marks_the_task_failed() {
        let (runtime, _dir) = test_runtime();
        let spec = SensorSpec {
            config: serde_json::json!({ "device": "28-not-there" }),
            ..ds18b20_spec("ghost_probe")
        };
        let sensor = runtime.create_sensor(spec).unwrap();
        runtime.start().unwrap();
        std::thread::sleep(Duration::from_millis(1500));

        let status = runtime.status();
        assert_eq!(status.failed.len(), 1);
        assert_eq!(status.failed[0].name, "ghost_probe");
        assert!(runtime.latest_measurement(sensor.id).unwrap().is_none());
        // the entity's enabled flag is untouched
        assert!(runtime.get_sensor(sensor.id).unwrap().enabled);
        runtime.stop().unwrap();
    }

    #[test]
    fn reconfiguring_a_failed_task_revives_it() {
        let (runtime, _dir) = test_runtime();
        let spec = SensorSpec {
            config: serde_json::json!({ "device": "28-not-there" }),
            ..ds18b20_spec("flaky_probe")
        };
        let sensor = runtime.create_sensor(spec).unwrap();
        runtime.start().unwrap();
        std::thread::sleep(Duration::from_millis(1200));
        assert_eq!(runtime.status().failed.len(), 1);

        // point it at the device that exists
        runtime
            .update_sensor(sensor.id, ds18b20_spec("flaky_probe"))
            .unwrap();
        std::thread::sleep(Duration::from_millis(1500));
        assert!(runtime.status().failed.is_empty());
        assert!(runtime.latest_measurement(sensor.id).unwrap().is_some());
        runtime.stop().unwrap();
    }

    #[test]
    fn stop_secures_the_outputs() {
        let (runtime, _dir) = test_runtime();
        runtime.set_output(22, true).unwrap();
        runtime.start().unwrap();
        runtime.stop().unwrap();
        let status = runtime.status();
        assert!(!status.running);
        assert!(status.panicked);
        assert!(runtime.list_outputs().iter().all(|p| p.state
            == crate::outputs::PinState::Low));
    }

    #[test]
    fn status_counts_ticks() {
        let (runtime, _dir) = test_runtime();
        runtime.create_sensor(ds18b20_spec("tick_probe")).unwrap();
        runtime.start().unwrap();
        std::thread::sleep(Duration::from_millis(1500));
        let status = runtime.status();
        assert!(status.running);
        assert!(status.ticks >= 1);
        assert!(status.last_tick.is_some());
        runtime.stop().unwrap();
    }
}
