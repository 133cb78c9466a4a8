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

//! The controller entity and the closed-loop controller framework.
//!
//! A controller is selected by a string tag out of a compile-time registry,
//! binds sensors by role (a role names the measurement kind it needs), and
//! emits arbiter operations plus log notes from each `process` step. The
//! framework — not the controller — owns the hardware: controllers return
//! intents, and the runtime refuses any intent touching a pin the controller
//! did not declare.

pub mod dosing;
pub mod pump_timer;

use std::{collections::HashMap, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::Error,
    sensors::DriverDescriptor,
    store::{ActionKind, Measurement, MeasurementKind},
    ControllerId, SensorId,
};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
/// A configured controller.
pub struct Controller {
    /// Stable identity.
    pub id: ControllerId,
    /// Unique human-readable name.
    pub name: String,
    /// Registry tag of the control logic.
    pub controller_type: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Whether the scheduler runs this controller.
    pub enabled: bool,
    /// Seconds between process steps; at least one.
    pub update_interval_secs: u64,
    /// Controller-specific configuration.
    #[serde(default)]
    pub config: serde_json::Value,
    /// When the controller last ran.
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub last_run_at: Option<DateTime<Utc>>,
}

impl Controller {
    #[must_use]
    /// The configured process interval.
    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs.max(1))
    }
}

#[derive(Clone, Copy, Debug, Serialize)]
/// One sensor role a controller requires.
pub struct RoleSpec {
    /// The role name, referenced by [`ProcessInput::reading`].
    pub role: &'static str,
    /// The measurement kind a bound sensor must produce to fill the role.
    pub kind: MeasurementKind,
}

#[derive(Clone, Copy, Debug, Serialize)]
/// Registry metadata describing a controller variant.
pub struct ControllerDescriptor {
    /// The registry tag.
    pub tag: &'static str,
    /// One-line description for the API catalog.
    pub summary: &'static str,
    /// The sensor roles that must be filled before the controller may be
    /// enabled.
    pub roles: &'static [RoleSpec],
}

#[derive(Clone, Debug, PartialEq)]
/// One intent returned from a process step.
pub enum ControlAction {
    /// Drive a pin permanently HIGH or LOW.
    Set {
        /// The target pin.
        pin: u8,
        /// The level to drive.
        on: bool,
    },
    /// Pulse a pin HIGH for a duration.
    Pulse {
        /// The target pin.
        pin: u8,
        /// How long the pin stays HIGH.
        duration: Duration,
    },
    /// Append an action log entry without touching hardware.
    Note {
        /// What happened.
        kind: ActionKind,
        /// Free-form structured detail.
        details: serde_json::Value,
    },
}

/// What a process step sees: the wall clock and the freshest measurement for
/// each filled role.
pub struct ProcessInput {
    /// The current time.
    pub now: DateTime<Utc>,
    /// Latest measurement per role name.
    pub readings: HashMap<&'static str, Measurement>,
}

impl ProcessInput {
    #[must_use]
    /// The latest measurement filling `role`, if the bound sensor has ever
    /// produced one.
    pub fn reading(&self, role: &str) -> Option<&Measurement> {
        self.readings.get(role)
    }
}

/// Opened control logic.
pub trait ControlLogic: Send {
    /// The pins this instance may operate. Enforced by the framework on
    /// every returned action.
    fn actuator_pins(&self) -> Vec<u8>;

    /// Run one control step over the given readings.
    ///
    /// # Errors
    ///
    /// Configuration errors fault the controller; everything else is logged
    /// and retried at the next tick.
    fn process(&mut self, input: &ProcessInput) -> Result<Vec<ControlAction>, Error>;

    /// Release any held state. Called before the logic is dropped.
    fn close(&mut self) {}
}

/// One compile-time registry row.
pub struct ControllerSpec {
    /// The controller's metadata.
    pub descriptor: ControllerDescriptor,
    validate: fn(&serde_json::Value) -> Result<(), Error>,
    open: fn(&Controller) -> Result<Box<dyn ControlLogic>, Error>,
}

static CONTROLLERS: &[ControllerSpec] = &[
    ControllerSpec {
        descriptor: ControllerDescriptor {
            tag: "ph_dosing",
            summary: "holds pH at a target with acid and base dosing pumps",
            roles: &[RoleSpec {
                role: "ph",
                kind: MeasurementKind::Ph,
            }],
        },
        validate: dosing::validate,
        open: dosing::open_ph,
    },
    ControllerSpec {
        descriptor: ControllerDescriptor {
            tag: "orp_dosing",
            summary: "holds ORP at a target with oxidizer dosing",
            roles: &[RoleSpec {
                role: "orp",
                kind: MeasurementKind::Orp,
            }],
        },
        validate: dosing::validate,
        open: dosing::open_orp,
    },
    ControllerSpec {
        descriptor: ControllerDescriptor {
            tag: "ec_dosing",
            summary: "holds EC at a target with nutrient and top-up pumps",
            roles: &[RoleSpec {
                role: "ec",
                kind: MeasurementKind::Ec,
            }],
        },
        validate: dosing::validate,
        open: dosing::open_ec,
    },
    ControllerSpec {
        descriptor: ControllerDescriptor {
            tag: "pump_timer",
            summary: "temperature-aware daily circulation pump schedule",
            roles: &[RoleSpec {
                role: "water_temperature",
                kind: MeasurementKind::Temperature,
            }],
        },
        validate: pump_timer::validate,
        open: pump_timer::open,
    },
];

#[must_use]
/// Every registered controller's metadata.
pub fn controller_catalog() -> Vec<ControllerDescriptor> {
    CONTROLLERS.iter().map(|c| c.descriptor).collect()
}

#[must_use]
/// Look up one controller's metadata by tag.
pub fn describe_controller(tag: &str) -> Option<&'static ControllerDescriptor> {
    CONTROLLERS
        .iter()
        .find(|c| c.descriptor.tag == tag)
        .map(|c| &c.descriptor)
}

/// Check a controller config payload against its schema.
///
/// # Errors
///
/// Returns [`Error::Config`] naming the violation, or an unknown-tag error.
pub fn validate_controller_config(tag: &str, config: &serde_json::Value) -> Result<(), Error> {
    let spec = CONTROLLERS
        .iter()
        .find(|c| c.descriptor.tag == tag)
        .ok_or_else(|| {
            Error::Config(crate::config::ConfigError::Invalid(format!(
                "unknown controller tag {tag:?}"
            )))
        })?;
    (spec.validate)(config)
}

/// Open the control logic a controller names.
///
/// # Errors
///
/// Returns [`Error::Config`] for an unknown tag or rejected config.
pub fn open_controller(controller: &Controller) -> Result<Box<dyn ControlLogic>, Error> {
    let spec = CONTROLLERS
        .iter()
        .find(|c| c.descriptor.tag == controller.controller_type)
        .ok_or_else(|| {
            Error::Config(crate::config::ConfigError::Invalid(format!(
                "unknown controller tag {:?}",
                controller.controller_type
            )))
        })?;
    (spec.validate)(&controller.config)?;
    (spec.open)(controller)
}

/// Resolve each required role onto one of the bound sensors.
///
/// A role is filled by the first bound sensor whose driver produces the
/// role's measurement kind.
///
/// # Errors
///
/// Returns [`Error::Config`] with the first unfilled role.
pub fn resolve_roles(
    descriptor: &ControllerDescriptor,
    bound: &[(SensorId, &DriverDescriptor)],
) -> Result<HashMap<&'static str, SensorId>, Error> {
    let mut filled = HashMap::new();
    for role in descriptor.roles {
        let sensor = bound
            .iter()
            .find(|(_, driver)| driver.kinds.contains(&role.kind))
            .map(|(id, _)| *id)
            .ok_or(Error::Config(crate::config::ConfigError::UnfilledRole {
                role: role.role,
                kind: role.kind.as_str(),
            }))?;
        filled.insert(role.role, sensor);
    }
    Ok(filled)
}

/// Deserialize a typed controller config, mapping serde failures onto a
/// structured configuration error. Rejects unknown fields.
pub(crate) fn typed_controller_config<T: serde::de::DeserializeOwned>(
    tag: &str,
    config: &serde_json::Value,
) -> Result<T, Error> {
    serde_json::from_value(config.clone()).map_err(|e| {
        Error::Config(crate::config::ConfigError::Invalid(format!(
            "{tag} config: {e}"
        )))
    })
}

/// Reject any action touching a pin the logic did not declare.
///
/// # Errors
///
/// Returns [`Error::Config`] naming the undeclared pin.
pub fn check_actions_declared(actions: &[ControlAction], declared: &[u8]) -> Result<(), Error> {
    for action in actions {
        let pin = match action {
            ControlAction::Set { pin, .. } | ControlAction::Pulse { pin, .. } => *pin,
            ControlAction::Note { .. } => continue,
        };
        if !declared.contains(&pin) {
            return Err(Error::Config(
                crate::config::ConfigError::UndeclaredPin(pin),
            ));
        }
    }
    Ok(())
}
