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

//! The dosing controllers for pH, ORP and EC.
//!
//! Each direction runs a three-state machine — idle, dosing, cooldown — per
//! process step: a reading outside the tolerance band pulses the matching
//! pump for a fixed duration, then the direction sits in cooldown long
//! enough for the chemistry to mix before the next dose. Consecutive doses
//! in one direction are counted against an optional daily limit; tripping it
//! suspends the direction for a day, because a reading that refuses to move
//! after that many doses means an empty canister or a dead probe, not a need
//! for more chemicals.
//!
//! For pH, "up" is the base pump and "down" the acid pump; for EC, "up" is
//! nutrient and "down" the fresh-water top-up.

use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;

use crate::{error::Error, store::ActionKind};

use super::{typed_controller_config, ControlAction, Controller, ControlLogic, ProcessInput};

/// A reading older than this many update intervals is treated as missing.
const STALE_INTERVALS: i64 = 3;

/// How long a saturated direction stays suspended.
const SATURATION_HOURS: i64 = 24;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct DosingConfig {
    /// The value to hold.
    target: f64,
    /// Half-width of the acceptance band around the target.
    tolerance: f64,
    /// Pump pulsed when the reading is below the band.
    #[serde(default)]
    dose_pump_pin_up: Option<u8>,
    /// Pump pulsed when the reading is above the band.
    #[serde(default)]
    dose_pump_pin_down: Option<u8>,
    /// Length of one dose pulse.
    dose_duration_ms: u64,
    /// Enforced wait between two doses in the same direction.
    cooldown_seconds: u64,
    /// Consecutive doses in one direction before it is suspended for a day.
    #[serde(default)]
    daily_max_doses: Option<u32>,
}

/// Check a dosing config payload.
///
/// # Errors
///
/// Returns [`Error::Config`] naming the violation.
pub fn validate(config: &serde_json::Value) -> Result<(), Error> {
    let config: DosingConfig = typed_controller_config("dosing", config)?;
    if config.tolerance < 0.0 || !config.tolerance.is_finite() {
        return Err(invalid("tolerance must be non-negative"));
    }
    if config.dose_duration_ms == 0 {
        return Err(invalid("dose_duration_ms must be nonzero"));
    }
    if config.dose_pump_pin_up.is_none() && config.dose_pump_pin_down.is_none() {
        return Err(invalid("at least one dose pump pin is required"));
    }
    Ok(())
}

fn invalid(msg: &str) -> Error {
    Error::Config(crate::config::ConfigError::Invalid(format!(
        "dosing config: {msg}"
    )))
}

/// Open pH dosing logic over the `ph` role.
///
/// # Errors
///
/// Returns [`Error::Config`] for a rejected config.
pub fn open_ph(controller: &Controller) -> Result<Box<dyn ControlLogic>, Error> {
    open(controller, "ph")
}

/// Open ORP dosing logic over the `orp` role.
///
/// # Errors
///
/// Returns [`Error::Config`] for a rejected config.
pub fn open_orp(controller: &Controller) -> Result<Box<dyn ControlLogic>, Error> {
    open(controller, "orp")
}

/// Open EC dosing logic over the `ec` role.
///
/// # Errors
///
/// Returns [`Error::Config`] for a rejected config.
pub fn open_ec(controller: &Controller) -> Result<Box<dyn ControlLogic>, Error> {
    open(controller, "ec")
}

fn open(controller: &Controller, role: &'static str) -> Result<Box<dyn ControlLogic>, Error> {
    validate(&controller.config)?;
    let config: DosingConfig = typed_controller_config("dosing", &controller.config)?;
    let interval = i64::try_from(controller.update_interval().as_secs()).unwrap_or(i64::MAX);
    Ok(Box::new(DosingController {
        role,
        stale_after: ChronoDuration::seconds(interval.saturating_mul(STALE_INTERVALS)),
        config,
        up: DirectionState::default(),
        down: DirectionState::default(),
    }))
}

#[derive(Debug, Default)]
struct DirectionState {
    cooldown_until: Option<DateTime<Utc>>,
    consecutive: u32,
    saturated_until: Option<DateTime<Utc>>,
}

impl DirectionState {
    fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.is_some_and(|t| now < t)
    }

    fn saturated(&self, now: DateTime<Utc>) -> bool {
        self.saturated_until.is_some_and(|t| now < t)
    }

    fn reset(&mut self) {
        self.consecutive = 0;
        self.saturated_until = None;
    }
}

struct DosingController {
    role: &'static str,
    config: DosingConfig,
    stale_after: ChronoDuration,
    up: DirectionState,
    down: DirectionState,
}

impl ControlLogic for DosingController {
    fn actuator_pins(&self) -> Vec<u8> {
        self.config
            .dose_pump_pin_up
            .into_iter()
            .chain(self.config.dose_pump_pin_down)
            .collect()
    }

    fn process(&mut self, input: &ProcessInput) -> Result<Vec<ControlAction>, Error> {
        let Some(reading) = input.reading(self.role) else {
            return Ok(vec![ControlAction::Note {
                kind: ActionKind::StaleReading,
                details: serde_json::json!({ "role": self.role, "reason": "no reading" }),
            }]);
        };
        let age = input.now - reading.taken_at;
        if age > self.stale_after {
            return Ok(vec![ControlAction::Note {
                kind: ActionKind::StaleReading,
                details: serde_json::json!({
                    "role": self.role,
                    "age_secs": age.num_seconds(),
                }),
            }]);
        }

        let value = reading.value;
        let low_edge = self.config.target - self.config.tolerance;
        let high_edge = self.config.target + self.config.tolerance;

        if value >= low_edge && value <= high_edge {
            // back in the band: both streaks end and saturation lifts
            self.up.reset();
            self.down.reset();
            return Ok(Vec::new());
        }

        let (direction, pin, kind) = if value < low_edge {
            self.down.consecutive = 0;
            (
                &mut self.up,
                self.config.dose_pump_pin_up,
                ActionKind::DoseUp,
            )
        } else {
            self.up.consecutive = 0;
            (
                &mut self.down,
                self.config.dose_pump_pin_down,
                ActionKind::DoseDown,
            )
        };

        if direction.saturated(input.now) || direction.in_cooldown(input.now) {
            return Ok(Vec::new());
        }
        let Some(pin) = pin else {
            // this direction has no pump; nothing to do
            return Ok(Vec::new());
        };

        direction.cooldown_until = Some(
            input.now
                + ChronoDuration::seconds(
                    i64::try_from(self.config.cooldown_seconds).unwrap_or(i64::MAX),
                ),
        );
        direction.consecutive += 1;

        let mut actions = vec![
            ControlAction::Pulse {
                pin,
                duration: Duration::from_millis(self.config.dose_duration_ms),
            },
            ControlAction::Note {
                kind,
                details: serde_json::json!({
                    "value": value,
                    "target": self.config.target,
                    "pin": pin,
                    "dose_ms": self.config.dose_duration_ms,
                }),
            },
        ];

        if let Some(max) = self.config.daily_max_doses {
            if direction.consecutive >= max {
                direction.saturated_until =
                    Some(input.now + ChronoDuration::hours(SATURATION_HOURS));
                actions.push(ControlAction::Note {
                    kind: ActionKind::DoseSaturation,
                    details: serde_json::json!({
                        "doses": direction.consecutive,
                        "suspended_hours": SATURATION_HOURS,
                    }),
                });
            }
        }

        Ok(actions)
    }
}
