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

//! The runtime: entity tables, the operation surface consumed by the
//! external HTTP layer, and the per-entity cycle functions the scheduler
//! drives.
//!
//! Every physical resource is owned here: the arbiter holds the pins, the
//! store holds the measurements, and each sensor or controller entity sits
//! behind its own mutex shared by the scheduler and the API front end. All
//! mutating operations validate first and mutate second, so a rejected
//! request leaves no trace, and repeating a request that matches current
//! state is a no-op.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex, RwLock,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::{
    calibration::{CalPoint, Calibration},
    clock::Clock,
    config::{ConfigError, RuntimeConfig},
    controllers::{
        check_actions_declared, describe_controller, open_controller, resolve_roles,
        validate_controller_config, ControlAction, ControlLogic, Controller,
        ControllerDescriptor, ProcessInput,
    },
    error::Error,
    hardware::Platform,
    outputs::{OutputArbiter, PinSnapshot, PulseHandle},
    persist::{DataDir, RegistrySnapshot},
    scheduler::{Scheduler, TaskKey},
    sensors::{
        calibrate_readings, describe_driver, driver_catalog, open_driver,
        validate_driver_config, DriverContext, DriverDescriptor, Sensor, SensorDriver,
    },
    store::{ActionLog, ControllerAction, Measurement, MeasurementStore},
    ControllerId, SensorId,
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "health", rename_all = "snake_case")]
/// Whether an entity's task is able to run.
pub enum Health {
    /// Running normally.
    Ok,
    /// Suppressed until its configuration is replaced.
    Failed {
        /// The diagnostic exposed through the API.
        reason: String,
    },
}

pub(crate) struct SensorState {
    pub entity: Sensor,
    pub driver: Option<Box<dyn SensorDriver>>,
    pub health: Health,
}

pub(crate) struct ControllerState {
    pub entity: Controller,
    pub logic: Option<Box<dyn ControlLogic>>,
    pub roles: HashMap<&'static str, SensorId>,
    pub health: Health,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
/// The payload creating or atomically replacing a sensor.
pub struct SensorSpec {
    /// Unique name.
    pub name: String,
    /// Driver registry tag.
    pub driver: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Whether the scheduler runs this sensor.
    pub enabled: bool,
    /// Seconds between reads, at least one.
    pub update_interval_secs: u64,
    /// Driver-specific configuration.
    #[serde(default)]
    pub config: serde_json::Value,
    /// Initial calibration points.
    #[serde(default)]
    pub calibration: Calibration,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
/// The payload creating or atomically replacing a controller.
pub struct ControllerSpec {
    /// Unique name.
    pub name: String,
    /// Controller registry tag.
    pub controller_type: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Whether the scheduler runs this controller.
    pub enabled: bool,
    /// Seconds between process steps, at least one.
    pub update_interval_secs: u64,
    /// Controller-specific configuration.
    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(Clone, Debug, Serialize)]
/// One FAILED task diagnostic in the system status.
pub struct FailedTask {
    /// The entity's name.
    pub name: String,
    /// Why it is suppressed.
    pub reason: String,
}

#[derive(Clone, Debug, Serialize)]
/// The system status block.
pub struct RuntimeStatus {
    /// Whether the scheduler loop is running.
    pub running: bool,
    /// When the scheduler last completed a tick.
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub last_tick: Option<DateTime<Utc>>,
    /// How many ticks have completed since start.
    pub ticks: u64,
    /// Number of configured sensors.
    pub sensors: usize,
    /// Number of configured controllers.
    pub controllers: usize,
    /// Whether the output arbiter is latched off.
    pub panicked: bool,
    /// Tasks suppressed on a configuration fault.
    pub failed: Vec<FailedTask>,
}

/// The shared core behind the [`Runtime`] façade and the scheduler.
pub(crate) struct Core {
    pub config: RuntimeConfig,
    pub clock: Arc<dyn Clock>,
    pub platform: Mutex<Box<dyn Platform>>,
    pub arbiter: OutputArbiter,
    pub store: Arc<MeasurementStore>,
    pub actions: ActionLog,
    pub data: Arc<DataDir>,
    pub sensors: RwLock<BTreeMap<SensorId, Arc<Mutex<SensorState>>>>,
    pub controllers: RwLock<BTreeMap<ControllerId, Arc<Mutex<ControllerState>>>>,
    pub bindings: RwLock<Vec<(ControllerId, SensorId)>>,
    next_sensor_id: AtomicU32,
    next_controller_id: AtomicU32,
}

/// The single-node control runtime.
pub struct Runtime {
    core: Arc<Core>,
    scheduler: Mutex<Option<Scheduler>>,
}

impl Runtime {
    /// Bring the runtime up: claim the output pool, open the data directory,
    /// load the entity registry and replay the durable measurement window.
    ///
    /// # Errors
    ///
    /// Returns hardware errors from claiming pins, [`Error::Storage`] from
    /// the data directory, and [`Error::Corrupt`] if the registry cannot be
    /// parsed (the runtime refuses to start on corrupted state).
    pub fn new(
        config: RuntimeConfig,
        mut platform: Box<dyn Platform>,
        clock: Arc<dyn Clock>,
    ) -> Result<Runtime, Error> {
        config.validate()?;
        let data = Arc::new(DataDir::open(config.data_dir.clone())?);
        let snapshot = data.load_registry()?.unwrap_or_default();

        let arbiter = OutputArbiter::new(
            platform.as_mut(),
            &config.output_pins,
            Arc::clone(&clock),
        )?;
        let store = Arc::new(MeasurementStore::with_sink(
            config.retention.clone(),
            Arc::clone(&clock),
            Arc::clone(&data) as Arc<dyn crate::store::MeasurementSink>,
        ));
        let actions = ActionLog::with_sink(
            config.retention.action_log_cap,
            Arc::clone(&data) as Arc<dyn crate::store::ActionSink>,
        );
        actions.preload(data.replay_actions(config.retention.action_log_cap)?)?;

        let durable_cutoff = clock.now_utc()
            - chrono::Duration::seconds(
                i64::try_from(config.retention.durable_age_secs).unwrap_or(i64::MAX),
            );

        let mut sensors = BTreeMap::new();
        for entity in snapshot.sensors {
            store.preload(entity.id, data.replay_measurements(entity.id, durable_cutoff)?)?;
            sensors.insert(
                entity.id,
                Arc::new(Mutex::new(SensorState {
                    entity,
                    driver: None,
                    health: Health::Ok,
                })),
            );
        }

        let mut controllers = BTreeMap::new();
        for entity in snapshot.controllers {
            controllers.insert(
                entity.id,
                Arc::new(Mutex::new(ControllerState {
                    entity,
                    logic: None,
                    roles: HashMap::new(),
                    health: Health::Ok,
                })),
            );
        }

        info!(
            "runtime loaded: {} sensors, {} controllers, {} outputs",
            sensors.len(),
            controllers.len(),
            config.output_pins.len()
        );

        Ok(Runtime {
            core: Arc::new(Core {
                config,
                clock,
                platform: Mutex::new(platform),
                arbiter,
                store,
                actions,
                data,
                sensors: RwLock::new(sensors),
                controllers: RwLock::new(controllers),
                bindings: RwLock::new(snapshot.bindings),
                next_sensor_id: AtomicU32::new(snapshot.next_sensor_id.max(1)),
                next_controller_id: AtomicU32::new(snapshot.next_controller_id.max(1)),
            }),
            scheduler: Mutex::new(None),
        })
    }

    // ------------------------------------------------------------------
    // sensors

    #[must_use]
    /// Every configured sensor, ordered by id.
    pub fn list_sensors(&self) -> Vec<Sensor> {
        let Ok(table) = self.core.sensors.read() else {
            return Vec::new();
        };
        table
            .values()
            .filter_map(|slot| slot.lock().ok().map(|s| s.entity.clone()))
            .collect()
    }

    /// Fetch one sensor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoSuchSensor`].
    pub fn get_sensor(&self, id: SensorId) -> Result<Sensor, Error> {
        let slot = self.core.sensor_slot(id)?;
        let state = slot.lock()?;
        Ok(state.entity.clone())
    }

    /// Create a sensor from a validated spec.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an unknown driver, a rejected driver
    /// config, a duplicate name, or a zero update interval.
    pub fn create_sensor(&self, spec: SensorSpec) -> Result<Sensor, Error> {
        self.core.validate_sensor_spec(&spec, None)?;
        let id = SensorId(self.core.next_sensor_id.fetch_add(1, Ordering::SeqCst));
        let entity = Sensor {
            id,
            name: spec.name,
            driver: spec.driver,
            description: spec.description,
            enabled: spec.enabled,
            update_interval_secs: spec.update_interval_secs,
            config: spec.config,
            calibration: spec.calibration,
            last_measurement_at: None,
        };
        self.core.sensors.write()?.insert(
            id,
            Arc::new(Mutex::new(SensorState {
                entity: entity.clone(),
                driver: None,
                health: Health::Ok,
            })),
        );
        self.core.persist_registry()?;
        self.wake();
        info!("created sensor {id} ({})", entity.name);
        Ok(entity)
    }

    /// Atomically replace a sensor's name, description, driver, config,
    /// calibration, interval and enabled flag.
    ///
    /// A spec that reproduces current state is a no-op; otherwise the open
    /// driver is closed (to be reopened with the new config at the next
    /// cycle) and a FAILED health mark is cleared.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoSuchSensor`] or [`Error::Config`].
    pub fn update_sensor(&self, id: SensorId, spec: SensorSpec) -> Result<Sensor, Error> {
        self.core.validate_sensor_spec(&spec, Some(id))?;
        let slot = self.core.sensor_slot(id)?;
        let mut state = slot.lock()?;

        let unchanged = state.entity.name == spec.name
            && state.entity.driver == spec.driver
            && state.entity.description == spec.description
            && state.entity.enabled == spec.enabled
            && state.entity.update_interval_secs == spec.update_interval_secs
            && state.entity.config == spec.config
            && state.entity.calibration == spec.calibration;
        if unchanged {
            return Ok(state.entity.clone());
        }

        state.entity.name = spec.name;
        state.entity.driver = spec.driver;
        state.entity.description = spec.description;
        state.entity.enabled = spec.enabled;
        state.entity.update_interval_secs = spec.update_interval_secs;
        state.entity.config = spec.config;
        state.entity.calibration = spec.calibration;
        if let Some(mut driver) = state.driver.take() {
            driver.close();
        }
        state.health = Health::Ok;
        let entity = state.entity.clone();
        drop(state);
        self.core.persist_registry()?;
        self.wake();
        Ok(entity)
    }

    /// Delete a sensor, purging its measurements and bindings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoSuchSensor`] or [`Error::Storage`].
    pub fn delete_sensor(&self, id: SensorId) -> Result<(), Error> {
        let slot = self.core.sensors.write()?.remove(&id).ok_or(Error::NoSuchSensor(id.0))?;
        if let Ok(mut state) = slot.lock() {
            if let Some(mut driver) = state.driver.take() {
                driver.close();
            }
        }
        self.core.bindings.write()?.retain(|(_, sid)| *sid != id);
        self.core.store.purge(id)?;
        self.core.persist_registry()?;
        self.wake();
        info!("deleted sensor {id} and purged its measurements");
        Ok(())
    }

    /// Measurements for one sensor over `[start, end]`, oldest first,
    /// optionally truncated to the most recent `limit`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoSuchSensor`].
    pub fn sensor_measurements(
        &self,
        id: SensorId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<Vec<Measurement>, Error> {
        self.core.sensor_slot(id)?;
        let mut rows = self.core.store.range(id, start, end);
        if let Some(limit) = limit {
            if rows.len() > limit {
                rows.drain(..rows.len() - limit);
            }
        }
        Ok(rows)
    }

    /// The latest measurement for one sensor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoSuchSensor`].
    pub fn latest_measurement(&self, id: SensorId) -> Result<Option<Measurement>, Error> {
        self.core.sensor_slot(id)?;
        Ok(self.core.store.latest(id))
    }

    // ------------------------------------------------------------------
    // calibration

    /// The sensor's current calibration points.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoSuchSensor`].
    pub fn calibration_points(&self, id: SensorId) -> Result<Vec<CalPoint>, Error> {
        let slot = self.core.sensor_slot(id)?;
        let state = slot.lock()?;
        Ok(state.entity.calibration.points().to_vec())
    }

    /// Add (or replace) one calibration point.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoSuchSensor`] or a storage error.
    pub fn add_calibration_point(&self, id: SensorId, raw: f64, real: f64) -> Result<(), Error> {
        let slot = self.core.sensor_slot(id)?;
        {
            let mut state = slot.lock()?;
            state.entity.calibration.add_point(raw, real);
        }
        self.core.persist_registry()
    }

    /// Remove every calibration point.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoSuchSensor`] or a storage error.
    pub fn clear_calibration(&self, id: SensorId) -> Result<(), Error> {
        let slot = self.core.sensor_slot(id)?;
        {
            let mut state = slot.lock()?;
            state.entity.calibration.clear();
        }
        self.core.persist_registry()
    }

    /// Read one uncalibrated value from the sensor's driver, opening it if
    /// needed. Nothing is persisted.
    ///
    /// # Errors
    ///
    /// Returns driver errors; transient faults can simply be retried.
    pub fn sample_raw(&self, id: SensorId) -> Result<f64, Error> {
        let slot = self.core.sensor_slot(id)?;
        let mut state = slot.lock()?;
        self.core.ensure_driver(&mut state)?;
        state
            .driver
            .as_mut()
            .expect("driver was just opened")
            .sample_raw()
    }

    // ------------------------------------------------------------------
    // controllers

    #[must_use]
    /// Every configured controller, ordered by id.
    pub fn list_controllers(&self) -> Vec<Controller> {
        let Ok(table) = self.core.controllers.read() else {
            return Vec::new();
        };
        table
            .values()
            .filter_map(|slot| slot.lock().ok().map(|s| s.entity.clone()))
            .collect()
    }

    /// Fetch one controller.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoSuchController`].
    pub fn get_controller(&self, id: ControllerId) -> Result<Controller, Error> {
        let slot = self.core.controller_slot(id)?;
        let state = slot.lock()?;
        Ok(state.entity.clone())
    }

    /// Create a controller from a validated spec.
    ///
    /// A controller requiring sensor roles must be created disabled, bound,
    /// and then enabled through an update.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an unknown tag, a rejected config, a
    /// duplicate name, or unfilled roles when `enabled` is set.
    pub fn create_controller(&self, spec: ControllerSpec) -> Result<Controller, Error> {
        self.core.validate_controller_spec(&spec, None)?;
        let id = ControllerId(self.core.next_controller_id.fetch_add(1, Ordering::SeqCst));
        if spec.enabled {
            // no bindings can exist yet, so required roles cannot be filled
            self.core.check_roles_fillable(id, &spec.controller_type)?;
        }
        let entity = Controller {
            id,
            name: spec.name,
            controller_type: spec.controller_type,
            description: spec.description,
            enabled: spec.enabled,
            update_interval_secs: spec.update_interval_secs,
            config: spec.config,
            last_run_at: None,
        };
        self.core.controllers.write()?.insert(
            id,
            Arc::new(Mutex::new(ControllerState {
                entity: entity.clone(),
                logic: None,
                roles: HashMap::new(),
                health: Health::Ok,
            })),
        );
        self.core.persist_registry()?;
        self.wake();
        info!("created controller {id} ({})", entity.name);
        Ok(entity)
    }

    /// Atomically replace a controller.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoSuchController`] or [`Error::Config`] (including
    /// unfilled roles when enabling).
    pub fn update_controller(
        &self,
        id: ControllerId,
        spec: ControllerSpec,
    ) -> Result<Controller, Error> {
        self.core.validate_controller_spec(&spec, Some(id))?;
        if spec.enabled {
            self.core.check_roles_fillable(id, &spec.controller_type)?;
        }
        let slot = self.core.controller_slot(id)?;
        let mut state = slot.lock()?;

        let unchanged = state.entity.name == spec.name
            && state.entity.controller_type == spec.controller_type
            && state.entity.description == spec.description
            && state.entity.enabled == spec.enabled
            && state.entity.update_interval_secs == spec.update_interval_secs
            && state.entity.config == spec.config;
        if unchanged {
            return Ok(state.entity.clone());
        }

        state.entity.name = spec.name;
        state.entity.controller_type = spec.controller_type;
        state.entity.description = spec.description;
        state.entity.enabled = spec.enabled;
        state.entity.update_interval_secs = spec.update_interval_secs;
        state.entity.config = spec.config;
        if let Some(mut logic) = state.logic.take() {
            logic.close();
        }
        state.roles.clear();
        state.health = Health::Ok;
        let entity = state.entity.clone();
        drop(state);
        self.core.persist_registry()?;
        self.wake();
        Ok(entity)
    }

    /// Delete a controller and its bindings. Its action log entries age out
    /// of the bounded log on their own.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoSuchController`].
    pub fn delete_controller(&self, id: ControllerId) -> Result<(), Error> {
        let slot = self
            .core
            .controllers
            .write()?
            .remove(&id)
            .ok_or(Error::NoSuchController(id.0))?;
        if let Ok(mut state) = slot.lock() {
            if let Some(mut logic) = state.logic.take() {
                logic.close();
            }
        }
        self.core.bindings.write()?.retain(|(cid, _)| *cid != id);
        self.core.persist_registry()?;
        self.wake();
        Ok(())
    }

    /// Bind a sensor to a controller.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoSuchController`] or [`Error::NoSuchSensor`].
    /// Binding the same pair again is a no-op.
    pub fn bind_sensor(&self, controller: ControllerId, sensor: SensorId) -> Result<(), Error> {
        self.core.controller_slot(controller)?;
        self.core.sensor_slot(sensor)?;
        {
            let mut bindings = self.core.bindings.write()?;
            if bindings.contains(&(controller, sensor)) {
                return Ok(());
            }
            bindings.push((controller, sensor));
        }
        self.core.reset_controller_logic(controller)?;
        self.core.persist_registry()
    }

    /// Remove a binding.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if removing it would leave an enabled
    /// controller with an unfilled role.
    pub fn unbind_sensor(&self, controller: ControllerId, sensor: SensorId) -> Result<(), Error> {
        let slot = self.core.controller_slot(controller)?;
        let (enabled, tag) = {
            let state = slot.lock()?;
            (state.entity.enabled, state.entity.controller_type.clone())
        };
        {
            let mut bindings = self.core.bindings.write()?;
            let before = bindings.len();
            bindings.retain(|b| *b != (controller, sensor));
            if bindings.len() == before {
                return Ok(());
            }
            if enabled {
                // the invariant holds while enabled: every role stays filled
                let remaining: Vec<SensorId> = bindings
                    .iter()
                    .filter(|(cid, _)| *cid == controller)
                    .map(|(_, sid)| *sid)
                    .collect();
                drop(bindings);
                if let Err(e) = self.core.roles_for(&tag, &remaining) {
                    // put the row back before rejecting
                    self.core.bindings.write()?.push((controller, sensor));
                    return Err(e);
                }
            }
        }
        self.core.reset_controller_logic(controller)?;
        self.core.persist_registry()
    }

    /// The sensors bound to a controller, in binding order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoSuchController`].
    pub fn bound_sensors(&self, controller: ControllerId) -> Result<Vec<SensorId>, Error> {
        self.core.controller_slot(controller)?;
        Ok(self
            .core
            .bindings
            .read()?
            .iter()
            .filter(|(cid, _)| *cid == controller)
            .map(|(_, sid)| *sid)
            .collect())
    }

    /// Force the controller's next process step to happen now.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoSuchController`], or cycle errors when the
    /// scheduler is stopped and the step runs inline.
    pub fn run_now(&self, id: ControllerId) -> Result<(), Error> {
        self.core.controller_slot(id)?;
        let guard = self.scheduler.lock()?;
        if let Some(scheduler) = guard.as_ref() {
            scheduler.run_now(TaskKey::Controller(id));
            Ok(())
        } else {
            drop(guard);
            self.core.run_controller_cycle(id)
        }
    }

    #[must_use]
    /// The most recent action log entries for one controller, newest first.
    pub fn recent_actions(&self, id: ControllerId, limit: usize) -> Vec<ControllerAction> {
        self.core.actions.recent(id, limit)
    }

    // ------------------------------------------------------------------
    // outputs

    #[must_use]
    /// A snapshot of every managed output pin.
    pub fn list_outputs(&self) -> Vec<PinSnapshot> {
        self.core.arbiter.list()
    }

    /// Drive an output permanently. Returns the previous level.
    ///
    /// # Errors
    ///
    /// Forwards arbiter errors (unknown pin, interlock, panic latch).
    pub fn set_output(&self, pin: u8, on: bool) -> Result<bool, Error> {
        self.core.arbiter.set(pin, on)
    }

    /// Pulse an output HIGH for a number of seconds.
    ///
    /// # Errors
    ///
    /// Forwards arbiter errors (unknown pin, interlock, panic latch).
    pub fn pulse_output(&self, pin: u8, seconds: u64) -> Result<PulseHandle, Error> {
        self.core.arbiter.pulse(pin, Duration::from_secs(seconds))
    }

    /// Drive every output LOW and latch further writes off.
    ///
    /// # Errors
    ///
    /// A failed panic-off is fatal.
    pub fn panic_off(&self) -> Result<(), Error> {
        self.core.arbiter.panic_off()
    }

    /// Lift the panic-off latch.
    pub fn clear_panic(&self) {
        self.core.arbiter.clear_panic();
    }

    // ------------------------------------------------------------------
    // catalogs & system

    #[must_use]
    /// Metadata for every compiled-in sensor driver.
    pub fn driver_catalog(&self) -> Vec<DriverDescriptor> {
        driver_catalog()
    }

    #[must_use]
    /// Metadata for every compiled-in controller type.
    pub fn controller_catalog(&self) -> Vec<ControllerDescriptor> {
        crate::controllers::controller_catalog()
    }

    /// Start the scheduler loop. Starting a running scheduler is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the thread cannot be spawned.
    pub fn start(&self) -> Result<(), Error> {
        let mut guard = self.scheduler.lock()?;
        if guard.is_some() {
            return Ok(());
        }
        *guard = Some(Scheduler::start(Arc::clone(&self.core))?);
        info!("scheduler started");
        Ok(())
    }

    /// Stop the scheduler: signal every task, wait up to five seconds, then
    /// panic-off the outputs.
    ///
    /// # Errors
    ///
    /// Returns the panic-off failure if the outputs could not be secured.
    pub fn stop(&self) -> Result<(), Error> {
        let scheduler = self.scheduler.lock()?.take();
        if let Some(scheduler) = scheduler {
            scheduler.stop();
        }
        // secure the outputs whether or not the loop confirmed in time
        let result = self.core.arbiter.panic_off();
        self.core.persist_registry()?;
        result
    }

    /// Block until the scheduler loop exits. Returns whether it exited on a
    /// fatal error.
    pub fn join(&self) -> bool {
        let done = self
            .scheduler
            .lock()
            .ok()
            .and_then(|g| g.as_ref().map(Scheduler::done_receiver));
        if let Some(done) = done {
            let _ = done.recv();
        }
        self.scheduler
            .lock()
            .ok()
            .and_then(|g| g.as_ref().map(Scheduler::was_fatal))
            .unwrap_or(false)
    }

    #[must_use]
    /// The system status block.
    pub fn status(&self) -> RuntimeStatus {
        let (running, last_tick, ticks) = self
            .scheduler
            .lock()
            .ok()
            .and_then(|g| g.as_ref().map(Scheduler::snapshot))
            .unwrap_or((false, None, 0));

        let mut failed = Vec::new();
        if let Ok(table) = self.core.sensors.read() {
            for slot in table.values() {
                if let Ok(state) = slot.lock() {
                    if let Health::Failed { reason } = &state.health {
                        failed.push(FailedTask {
                            name: state.entity.name.clone(),
                            reason: reason.clone(),
                        });
                    }
                }
            }
        }
        if let Ok(table) = self.core.controllers.read() {
            for slot in table.values() {
                if let Ok(state) = slot.lock() {
                    if let Health::Failed { reason } = &state.health {
                        failed.push(FailedTask {
                            name: state.entity.name.clone(),
                            reason: reason.clone(),
                        });
                    }
                }
            }
        }

        RuntimeStatus {
            running,
            last_tick,
            ticks,
            sensors: self.core.sensors.read().map(|t| t.len()).unwrap_or(0),
            controllers: self.core.controllers.read().map(|t| t.len()).unwrap_or(0),
            panicked: self.core.arbiter.is_panicked(),
            failed,
        }
    }

    #[must_use]
    /// Measurements across every sensor over the trailing `horizon_secs`.
    pub fn recent_measurements(&self, horizon_secs: u64) -> Vec<Measurement> {
        self.core.store.recent_all(chrono::Duration::seconds(
            i64::try_from(horizon_secs).unwrap_or(i64::MAX),
        ))
    }

    /// Nudge the scheduler to re-scan the task table.
    fn wake(&self) {
        if let Ok(guard) = self.scheduler.lock() {
            if let Some(scheduler) = guard.as_ref() {
                scheduler.wake();
            }
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

impl Core {
    pub(crate) fn sensor_slot(&self, id: SensorId) -> Result<Arc<Mutex<SensorState>>, Error> {
        self.sensors
            .read()?
            .get(&id)
            .cloned()
            .ok_or(Error::NoSuchSensor(id.0))
    }

    pub(crate) fn controller_slot(
        &self,
        id: ControllerId,
    ) -> Result<Arc<Mutex<ControllerState>>, Error> {
        self.controllers
            .read()?
            .get(&id)
            .cloned()
            .ok_or(Error::NoSuchController(id.0))
    }

    fn validate_sensor_spec(&self, spec: &SensorSpec, this: Option<SensorId>) -> Result<(), Error> {
        if spec.name.is_empty() {
            return Err(Error::Config(ConfigError::Invalid(
                "sensor name must not be empty".into(),
            )));
        }
        if spec.update_interval_secs == 0 {
            return Err(Error::Config(ConfigError::Invalid(
                "update_interval_secs must be at least 1".into(),
            )));
        }
        describe_driver(&spec.driver).ok_or_else(|| {
            Error::Config(ConfigError::Invalid(format!(
                "unknown driver tag {:?}",
                spec.driver
            )))
        })?;
        validate_driver_config(&spec.driver, &spec.config)?;
        let table = self.sensors.read()?;
        for (id, slot) in table.iter() {
            if Some(*id) == this {
                continue;
            }
            if slot.lock()?.entity.name == spec.name {
                return Err(Error::Config(ConfigError::Invalid(format!(
                    "sensor name {:?} is already in use",
                    spec.name
                ))));
            }
        }
        Ok(())
    }

    fn validate_controller_spec(
        &self,
        spec: &ControllerSpec,
        this: Option<ControllerId>,
    ) -> Result<(), Error> {
        if spec.name.is_empty() {
            return Err(Error::Config(ConfigError::Invalid(
                "controller name must not be empty".into(),
            )));
        }
        if spec.update_interval_secs == 0 {
            return Err(Error::Config(ConfigError::Invalid(
                "update_interval_secs must be at least 1".into(),
            )));
        }
        describe_controller(&spec.controller_type).ok_or_else(|| {
            Error::Config(ConfigError::Invalid(format!(
                "unknown controller tag {:?}",
                spec.controller_type
            )))
        })?;
        validate_controller_config(&spec.controller_type, &spec.config)?;
        // every actuator pin named by the config must be in the declared pool
        if let Ok(logic) = open_controller(&Controller {
            id: ControllerId(0),
            name: String::new(),
            controller_type: spec.controller_type.clone(),
            description: String::new(),
            enabled: false,
            update_interval_secs: spec.update_interval_secs.max(1),
            config: spec.config.clone(),
            last_run_at: None,
        }) {
            for pin in logic.actuator_pins() {
                if !self.config.is_declared_output(pin) {
                    return Err(Error::Config(ConfigError::UndeclaredPin(pin)));
                }
            }
        }
        let table = self.controllers.read()?;
        for (id, slot) in table.iter() {
            if Some(*id) == this {
                continue;
            }
            if slot.lock()?.entity.name == spec.name {
                return Err(Error::Config(ConfigError::Invalid(format!(
                    "controller name {:?} is already in use",
                    spec.name
                ))));
            }
        }
        Ok(())
    }

    /// Resolve a controller's roles against an explicit binding list.
    fn roles_for(
        &self,
        tag: &str,
        bound: &[SensorId],
    ) -> Result<HashMap<&'static str, SensorId>, Error> {
        let descriptor = describe_controller(tag).ok_or_else(|| {
            Error::Config(ConfigError::Invalid(format!("unknown controller tag {tag:?}")))
        })?;
        let mut pairs = Vec::new();
        for sid in bound {
            let slot = self.sensor_slot(*sid)?;
            let driver_tag = slot.lock()?.entity.driver.clone();
            if let Some(driver) = describe_driver(&driver_tag) {
                pairs.push((*sid, driver));
            }
        }
        resolve_roles(descriptor, &pairs)
    }

    fn check_roles_fillable(&self, id: ControllerId, tag: &str) -> Result<(), Error> {
        let bound: Vec<SensorId> = self
            .bindings
            .read()?
            .iter()
            .filter(|(cid, _)| *cid == id)
            .map(|(_, sid)| *sid)
            .collect();
        self.roles_for(tag, &bound).map(|_| ())
    }

    /// Drop a controller's opened logic so the next cycle reopens it with
    /// fresh bindings.
    fn reset_controller_logic(&self, id: ControllerId) -> Result<(), Error> {
        let slot = self.controller_slot(id)?;
        let mut state = slot.lock()?;
        if let Some(mut logic) = state.logic.take() {
            logic.close();
        }
        state.roles.clear();
        Ok(())
    }

    fn ensure_driver(&self, state: &mut SensorState) -> Result<(), Error> {
        if state.driver.is_some() {
            return Ok(());
        }
        let mut platform = self.platform.lock()?;
        let mut ctx = DriverContext {
            platform: &mut **platform,
            store: &self.store,
            clock: &self.clock,
            vref_mv: self.config.adc_vref_mv,
        };
        state.driver = Some(open_driver(&state.entity, &mut ctx)?);
        Ok(())
    }

    /// One scheduler tick for a sensor: read, calibrate, persist.
    pub(crate) fn run_sensor_cycle(&self, id: SensorId) -> Result<(), Error> {
        let slot = self.sensor_slot(id)?;
        let mut state = slot.lock()?;
        if !state.entity.enabled || matches!(state.health, Health::Failed { .. }) {
            return Ok(());
        }
        self.ensure_driver(&mut state)?;
        let readings = state
            .driver
            .as_mut()
            .expect("driver was just opened")
            .read()?;
        // the sensor may have been deleted while the read was in flight;
        // a persisted measurement must always reference a live sensor
        if !self.sensors.read()?.contains_key(&id) {
            return Ok(());
        }
        let now = self.clock.now_utc();
        for measurement in calibrate_readings(&state.entity, readings, now) {
            self.store.append(measurement)?;
        }
        state.entity.last_measurement_at = Some(now);
        Ok(())
    }

    /// One scheduler tick for a controller: gather role readings, process,
    /// apply actions through the arbiter.
    pub(crate) fn run_controller_cycle(&self, id: ControllerId) -> Result<(), Error> {
        let slot = self.controller_slot(id)?;
        let mut state = slot.lock()?;
        if !state.entity.enabled || matches!(state.health, Health::Failed { .. }) {
            return Ok(());
        }

        if state.logic.is_none() {
            let bound: Vec<SensorId> = self
                .bindings
                .read()?
                .iter()
                .filter(|(cid, _)| *cid == id)
                .map(|(_, sid)| *sid)
                .collect();
            state.roles = self.roles_for(&state.entity.controller_type, &bound)?;
            state.logic = Some(open_controller(&state.entity)?);
        }

        let descriptor = describe_controller(&state.entity.controller_type)
            .expect("logic opened from a registered tag");
        let now = self.clock.now_utc();
        let mut readings = HashMap::new();
        for role in descriptor.roles {
            if let Some(sid) = state.roles.get(role.role) {
                if let Some(m) = self.store.latest_of_kind(*sid, role.kind) {
                    readings.insert(role.role, m);
                }
            }
        }

        let logic = state.logic.as_mut().expect("logic was just opened");
        let actions = logic.process(&ProcessInput { now, readings })?;
        let declared = logic.actuator_pins();
        check_actions_declared(&actions, &declared)?;
        self.apply_actions(id, actions)?;
        state.entity.last_run_at = Some(now);
        Ok(())
    }

    fn apply_actions(&self, id: ControllerId, actions: Vec<ControlAction>) -> Result<(), Error> {
        let now = self.clock.now_utc();
        for action in actions {
            let result = match &action {
                ControlAction::Set { pin, on } => self.arbiter.set(*pin, *on).map(|_| ()),
                ControlAction::Pulse { pin, duration } => {
                    self.arbiter.pulse(*pin, *duration).map(|_| ())
                }
                ControlAction::Note { kind, details } => {
                    self.actions.append(ControllerAction {
                        controller: id,
                        at: now,
                        kind: *kind,
                        details: details.clone(),
                    })?;
                    continue;
                }
            };
            match result {
                Ok(()) => {}
                Err(e) if e.is_refusal() => {
                    warn!("controller {id}: output refused: {e}");
                    self.actions.append(ControllerAction {
                        controller: id,
                        at: now,
                        kind: crate::store::ActionKind::Refused,
                        details: serde_json::json!({ "error": e.to_string() }),
                    })?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// The enabled, healthy tasks the scheduler should be driving.
    pub(crate) fn task_intervals(&self) -> Vec<(TaskKey, Duration)> {
        let mut tasks = Vec::new();
        if let Ok(table) = self.sensors.read() {
            for (id, slot) in table.iter() {
                if let Ok(state) = slot.lock() {
                    if state.entity.enabled && state.health == Health::Ok {
                        tasks.push((TaskKey::Sensor(*id), state.entity.update_interval()));
                    }
                }
            }
        }
        if let Ok(table) = self.controllers.read() {
            for (id, slot) in table.iter() {
                if let Ok(state) = slot.lock() {
                    if state.entity.enabled && state.health == Health::Ok {
                        tasks.push((TaskKey::Controller(*id), state.entity.update_interval()));
                    }
                }
            }
        }
        tasks
    }

    /// Run one task to completion.
    pub(crate) fn run_task(&self, key: TaskKey) -> Result<(), Error> {
        match key {
            TaskKey::Sensor(id) => self.run_sensor_cycle(id),
            TaskKey::Controller(id) => self.run_controller_cycle(id),
        }
    }

    /// Mark a task FAILED after a configuration error. Its enabled flag is
    /// untouched; processing resumes once an update replaces the config.
    pub(crate) fn mark_failed(&self, key: TaskKey, reason: &str) {
        let health = Health::Failed {
            reason: reason.to_string(),
        };
        match key {
            TaskKey::Sensor(id) => {
                if let Ok(slot) = self.sensor_slot(id) {
                    if let Ok(mut state) = slot.lock() {
                        state.health = health;
                    }
                }
            }
            TaskKey::Controller(id) => {
                if let Ok(slot) = self.controller_slot(id) {
                    if let Ok(mut state) = slot.lock() {
                        state.health = health;
                    }
                }
            }
        }
    }

    pub(crate) fn persist_registry(&self) -> Result<(), Error> {
        let mut sensors = Vec::new();
        for slot in self.sensors.read()?.values() {
            sensors.push(slot.lock()?.entity.clone());
        }
        let mut controllers = Vec::new();
        for slot in self.controllers.read()?.values() {
            controllers.push(slot.lock()?.entity.clone());
        }
        let snapshot = RegistrySnapshot {
            sensors,
            controllers,
            bindings: self.bindings.read()?.clone(),
            next_sensor_id: self.next_sensor_id.load(Ordering::SeqCst),
            next_controller_id: self.next_controller_id.load(Ordering::SeqCst),
        };
        self.data.save_registry(&snapshot)
    }

    pub(crate) fn secure_outputs(&self) {
        if let Err(e) = self.arbiter.panic_off() {
            log::error!("panic-off failed while securing outputs: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use crate::{
        clock::ManualClock,
        hardware::Simulator,
        store::{ActionKind, MeasurementKind},
    };

    use super::*;

    fn manual_clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
        ))
    }

    fn test_runtime_with(clock: Arc<dyn Clock>) -> (Runtime, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = RuntimeConfig::simulated(dir.path().to_path_buf());
        let runtime = Runtime::new(config, Box::new(Simulator::new()), clock).unwrap();
        (runtime, dir)
    }

    fn test_runtime() -> (Runtime, tempfile::TempDir) {
        test_runtime_with(manual_clock())
    }

    fn temp_spec(name: &str) -> SensorSpec {
        SensorSpec {
            name: name.into(),
            driver: "ds18b20".into(),
            description: "tank probe".into(),
            enabled: true,
            update_interval_secs: 10,
            config: serde_json::json!({}),
            calibration: Calibration::new(),
        }
    }

    fn ph_sensor_spec(name: &str) -> SensorSpec {
        SensorSpec {
            name: name.into(),
            driver: "cs1237_ph".into(),
            description: String::new(),
            enabled: false,
            update_interval_secs: 10,
            config: serde_json::json!({ "sck": 5, "dout": 6, "din": 13 }),
            calibration: Calibration::from_points([(0.5, 7.0), (3.0, 4.0)]),
        }
    }

    fn dosing_spec(name: &str, enabled: bool) -> ControllerSpec {
        ControllerSpec {
            name: name.into(),
            controller_type: "ph_dosing".into(),
            description: String::new(),
            enabled,
            update_interval_secs: 10,
            config: serde_json::json!({
                "target": 6.0,
                "tolerance": 0.2,
                "dose_pump_pin_up": 27,
                "dose_pump_pin_down": 17,
                "dose_duration_ms": 500,
                "cooldown_seconds": 60
            }),
        }
    }

    #[test]
    fn sensor_crud_round_trip() {
        let (runtime, _dir) = test_runtime();
        let created = runtime.create_sensor(temp_spec("tank")).unwrap();
        assert_eq!(created.name, "tank");
        assert_eq!(runtime.list_sensors().len(), 1);
        assert_eq!(runtime.get_sensor(created.id).unwrap(), created);

        let mut spec = temp_spec("tank");
        spec.description = "sump probe".into();
        let updated = runtime.update_sensor(created.id, spec).unwrap();
        assert_eq!(updated.description, "sump probe");

        runtime.delete_sensor(created.id).unwrap();
        assert!(runtime.list_sensors().is_empty());
        assert!(matches!(
            runtime.get_sensor(created.id),
            Err(Error::NoSuchSensor(_))
        ));
    }

    #[test]
    fn duplicate_sensor_name_is_rejected() {
        let (runtime, _dir) = test_runtime();
        runtime.create_sensor(temp_spec("tank")).unwrap();
        let err = runtime.create_sensor(temp_spec("tank")).unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn unchanged_update_has_no_side_effect() {
        let (runtime, _dir) = test_runtime();
        let created = runtime.create_sensor(temp_spec("tank")).unwrap();
        // open the driver through a raw sample so we can tell a reset apart
        runtime.sample_raw(created.id).unwrap();
        runtime.update_sensor(created.id, temp_spec("tank")).unwrap();
        let slot = runtime.core.sensor_slot(created.id).unwrap();
        // the driver survived: the update was recognized as a no-op
        assert!(slot.lock().unwrap().driver.is_some());
    }

    #[test]
    fn changed_update_closes_the_driver() {
        let (runtime, _dir) = test_runtime();
        let created = runtime.create_sensor(temp_spec("tank")).unwrap();
        runtime.sample_raw(created.id).unwrap();
        let mut spec = temp_spec("tank");
        spec.update_interval_secs = 30;
        runtime.update_sensor(created.id, spec).unwrap();
        let slot = runtime.core.sensor_slot(created.id).unwrap();
        assert!(slot.lock().unwrap().driver.is_none());
    }

    #[test]
    fn deleting_a_sensor_purges_measurements() {
        let clock = manual_clock();
        let (runtime, _dir) = test_runtime_with(clock.clone());
        let created = runtime.create_sensor(temp_spec("tank")).unwrap();
        for i in 0..100 {
            runtime
                .core
                .store
                .append(Measurement {
                    sensor: created.id,
                    taken_at: clock.now_utc() + chrono::Duration::seconds(i),
                    kind: MeasurementKind::Temperature,
                    value: 20.0,
                    unit: "°C".into(),
                    raw: None,
                })
                .unwrap();
        }
        assert_eq!(runtime.core.store.count(created.id), 100);
        runtime.delete_sensor(created.id).unwrap();
        let start = clock.now_utc() - chrono::Duration::days(1);
        let end = clock.now_utc() + chrono::Duration::days(1);
        assert!(runtime.core.store.range(created.id, start, end).is_empty());
        assert!(runtime.core.store.latest(created.id).is_none());
    }

    #[test]
    fn two_point_ph_calibration_end_to_end() {
        let (runtime, _dir) = test_runtime();
        let sensor = runtime.create_sensor(ph_sensor_spec("ph_probe")).unwrap();
        // calibrate through the API: 0.5 V in pH 7, 3.0 V in pH 4
        runtime.clear_calibration(sensor.id).unwrap();
        runtime.add_calibration_point(sensor.id, 0.5, 7.0).unwrap();
        runtime.add_calibration_point(sensor.id, 3.0, 4.0).unwrap();
        assert_eq!(runtime.calibration_points(sensor.id).unwrap().len(), 2);

        let entity = runtime.get_sensor(sensor.id).unwrap();
        let out = crate::sensors::calibrate_readings(
            &entity,
            vec![crate::sensors::RawReading {
                kind: MeasurementKind::Ph,
                raw: 1.75,
                unit: "pH".into(),
            }],
            Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
        );
        assert!((out[0].value - 5.5).abs() < 1e-12);
        assert_eq!(out[0].unit, "pH");
    }

    #[test]
    fn controller_needs_bound_roles_to_enable() {
        let (runtime, _dir) = test_runtime();
        // enabling at creation must fail: nothing can be bound yet
        let err = runtime.create_controller(dosing_spec("ph hold", true)).unwrap_err();
        assert!(err.is_config());

        let controller = runtime.create_controller(dosing_spec("ph hold", false)).unwrap();
        let sensor = runtime.create_sensor(ph_sensor_spec("ph_probe")).unwrap();

        // still unfillable before the binding exists
        let err = runtime
            .update_controller(controller.id, dosing_spec("ph hold", true))
            .unwrap_err();
        assert!(err.is_config());

        runtime.bind_sensor(controller.id, sensor.id).unwrap();
        runtime
            .update_controller(controller.id, dosing_spec("ph hold", true))
            .unwrap();
        assert_eq!(runtime.bound_sensors(controller.id).unwrap(), vec![sensor.id]);

        // unbinding the only pH source would break the invariant
        let err = runtime.unbind_sensor(controller.id, sensor.id).unwrap_err();
        assert!(err.is_config());
        assert_eq!(runtime.bound_sensors(controller.id).unwrap(), vec![sensor.id]);
    }

    #[test]
    fn controller_with_undeclared_pin_is_rejected() {
        let (runtime, _dir) = test_runtime();
        let mut spec = dosing_spec("ph hold", false);
        spec.config["dose_pump_pin_up"] = serde_json::json!(9);
        let err = runtime.create_controller(spec).unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn dosing_cycle_pulses_the_base_pump() {
        let clock = manual_clock();
        let (runtime, _dir) = test_runtime_with(clock.clone());
        let sensor = runtime.create_sensor(ph_sensor_spec("ph_probe")).unwrap();
        let controller = runtime.create_controller(dosing_spec("ph hold", false)).unwrap();
        runtime.bind_sensor(controller.id, sensor.id).unwrap();
        runtime
            .update_controller(controller.id, dosing_spec("ph hold", true))
            .unwrap();

        // a fresh low reading
        runtime
            .core
            .store
            .append(Measurement {
                sensor: sensor.id,
                taken_at: clock.now_utc(),
                kind: MeasurementKind::Ph,
                value: 5.5,
                unit: "pH".into(),
                raw: Some(1.2),
            })
            .unwrap();

        // scheduler stopped: run_now executes the step inline
        runtime.run_now(controller.id).unwrap();

        let actions = runtime.recent_actions(controller.id, 10);
        assert!(actions.iter().any(|a| a.kind == ActionKind::DoseUp));
        // pin 27 (base pump) is pulsing
        let outputs = runtime.list_outputs();
        let base = outputs.iter().find(|p| p.pin == 27).unwrap();
        assert!(matches!(base.state, crate::outputs::PinState::Pulsing { .. }));
        assert!(runtime
            .get_controller(controller.id)
            .unwrap()
            .last_run_at
            .is_some());
    }

    #[test]
    fn registry_survives_a_restart() {
        let dir = tempfile::tempdir().unwrap();
        let clock = manual_clock();
        let config = RuntimeConfig::simulated(dir.path().to_path_buf());
        let (sensor_id, controller_id);
        {
            let runtime = Runtime::new(
                config.clone(),
                Box::new(Simulator::new()),
                clock.clone(),
            )
            .unwrap();
            let sensor = runtime.create_sensor(ph_sensor_spec("ph_probe")).unwrap();
            let controller = runtime
                .create_controller(dosing_spec("ph hold", false))
                .unwrap();
            runtime.bind_sensor(controller.id, sensor.id).unwrap();
            runtime
                .core
                .store
                .append(Measurement {
                    sensor: sensor.id,
                    taken_at: clock.now_utc(),
                    kind: MeasurementKind::Ph,
                    value: 6.1,
                    unit: "pH".into(),
                    raw: None,
                })
                .unwrap();
            sensor_id = sensor.id;
            controller_id = controller.id;
        }

        let runtime = Runtime::new(config, Box::new(Simulator::new()), clock).unwrap();
        assert_eq!(runtime.get_sensor(sensor_id).unwrap().name, "ph_probe");
        assert_eq!(runtime.get_controller(controller_id).unwrap().name, "ph hold");
        assert_eq!(
            runtime.bound_sensors(controller_id).unwrap(),
            vec![sensor_id]
        );
        // the durable measurement window was replayed
        let latest = runtime.latest_measurement(sensor_id).unwrap().unwrap();
        assert_eq!(latest.value, 6.1);
        // new entities keep getting fresh ids
        let other = runtime.create_sensor(temp_spec("tank")).unwrap();
        assert!(other.id > sensor_id);
    }

    #[test]
    fn outputs_are_exposed_through_the_runtime() {
        let (runtime, _dir) = test_runtime();
        assert_eq!(runtime.list_outputs().len(), 3);
        assert!(!runtime.set_output(22, true).unwrap());
        assert!(runtime.set_output(22, true).unwrap());
        runtime.panic_off().unwrap();
        assert!(matches!(
            runtime.set_output(22, true),
            Err(Error::PanicLatched)
        ));
        runtime.clear_panic();
        runtime.set_output(22, true).unwrap();
    }

    #[test]
    fn recent_measurements_span_sensors() {
        let clock = manual_clock();
        let (runtime, _dir) = test_runtime_with(clock.clone());
        let a = runtime.create_sensor(temp_spec("tank")).unwrap();
        let b = runtime.create_sensor(ph_sensor_spec("ph_probe")).unwrap();
        for (id, kind) in [(a.id, MeasurementKind::Temperature), (b.id, MeasurementKind::Ph)] {
            runtime
                .core
                .store
                .append(Measurement {
                    sensor: id,
                    taken_at: clock.now_utc(),
                    kind,
                    value: 1.0,
                    unit: String::new(),
                    raw: None,
                })
                .unwrap();
        }
        assert_eq!(runtime.recent_measurements(3600).len(), 2);
    }

    #[test]
    fn catalogs_are_exposed() {
        let (runtime, _dir) = test_runtime();
        assert_eq!(runtime.driver_catalog().len(), 6);
        assert_eq!(runtime.controller_catalog().len(), 4);
    }
}
