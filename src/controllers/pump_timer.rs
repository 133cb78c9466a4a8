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

//! The temperature-driven circulation pump timer.
//!
//! Warm water needs more circulation: the controller derives a daily runtime
//! target from the water temperature via a threshold table, then fills that
//! target inside a daily window with runs bounded by a minimum and maximum
//! length. A few minutes into each run the temperature is re-sampled and the
//! target re-derived, so a morning reading taken through cold glass does not
//! dictate the whole day. An operator can force the pump on until a given
//! time regardless of the window; forced minutes do not count against the
//! daily target.
//!
//! Window hours are interpreted in UTC. `end_hour` below `start_hour` means
//! the window wraps across midnight.

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Timelike, Utc};
use serde::Deserialize;

use crate::{error::Error, store::ActionKind};

use super::{typed_controller_config, ControlAction, Controller, ControlLogic, ProcessInput};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct PumpTimerConfig {
    /// The circulation pump's pin.
    pump_pin: u8,
    /// First hour of the daily window, 0..=23.
    start_hour: u8,
    /// Hour the window closes, 0..=23. May be below `start_hour` to wrap
    /// across midnight; equal hours mean a closed window.
    end_hour: u8,
    /// Temperature floors mapping to required daily runtime.
    temp_thresholds: Vec<TempThreshold>,
    /// Minimum length of one run, minutes.
    min_run_time: u32,
    /// Maximum length of one run, minutes.
    max_run_time: u32,
    /// Minutes into a run after which the temperature is re-sampled and the
    /// target re-derived.
    temp_check_delay_minutes: u32,
    /// Keep the pump on until this instant, ignoring the window.
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    force_run_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
struct TempThreshold {
    /// The temperature floor in °C.
    floor_c: f64,
    /// Required daily runtime in minutes when this floor is the largest one
    /// at or below the measured temperature.
    run_minutes: u32,
}

/// Check a pump timer config payload.
///
/// # Errors
///
/// Returns [`Error::Config`] naming the violation.
pub fn validate(config: &serde_json::Value) -> Result<(), Error> {
    let config: PumpTimerConfig = typed_controller_config("pump_timer", config)?;
    if config.start_hour > 23 || config.end_hour > 23 {
        return Err(invalid("window hours must be within 0..=23"));
    }
    if config.min_run_time == 0 {
        return Err(invalid("min_run_time must be nonzero"));
    }
    if config.max_run_time < config.min_run_time {
        return Err(invalid("max_run_time must be at least min_run_time"));
    }
    Ok(())
}

fn invalid(msg: &str) -> Error {
    Error::Config(crate::config::ConfigError::Invalid(format!(
        "pump_timer config: {msg}"
    )))
}

/// Open the pump timer over the `water_temperature` role.
///
/// # Errors
///
/// Returns [`Error::Config`] for a rejected config.
pub fn open(controller: &Controller) -> Result<Box<dyn ControlLogic>, Error> {
    build(controller).map(|timer| Box::new(timer) as Box<dyn ControlLogic>)
}

fn build(controller: &Controller) -> Result<PumpTimer, Error> {
    validate(&controller.config)?;
    let mut config: PumpTimerConfig = typed_controller_config("pump_timer", &controller.config)?;
    config
        .temp_thresholds
        .sort_by(|a, b| a.floor_c.total_cmp(&b.floor_c));
    Ok(PumpTimer {
        config,
        today: None,
        target_minutes: None,
        ran_minutes: 0.0,
        run_started: None,
        stop_at_min_boundary: false,
        rest_until: None,
        forced: false,
        pump_on: false,
    })
}

struct PumpTimer {
    config: PumpTimerConfig,
    /// The day the per-day state belongs to.
    today: Option<NaiveDate>,
    /// Derived once per day, re-derived mid-run after the check delay.
    target_minutes: Option<u32>,
    /// Minutes accumulated by closed runs today.
    ran_minutes: f64,
    run_started: Option<DateTime<Utc>>,
    stop_at_min_boundary: bool,
    /// No new run starts before this instant.
    rest_until: Option<DateTime<Utc>>,
    forced: bool,
    /// What we last asked the arbiter for, to note transitions.
    pump_on: bool,
}

impl PumpTimer {
    fn in_window(&self, now: DateTime<Utc>) -> bool {
        let hour = u8::try_from(now.hour()).unwrap_or(0);
        let (start, end) = (self.config.start_hour, self.config.end_hour);
        if start == end {
            return false;
        }
        if end > start {
            hour >= start && hour < end
        } else {
            hour >= start || hour < end
        }
    }

    /// Pick the runtime for the largest threshold floor at or below the
    /// temperature, clamped to the run-length bounds. No usable temperature
    /// or no matching floor clamps up from zero to the minimum.
    fn derive_target(&self, temperature: Option<f64>) -> u32 {
        let raw = temperature
            .and_then(|t| {
                self.config
                    .temp_thresholds
                    .iter()
                    .rev()
                    .find(|th| th.floor_c <= t)
                    .map(|th| th.run_minutes)
            })
            .unwrap_or(0);
        raw.clamp(self.config.min_run_time, self.config.max_run_time.max(self.config.min_run_time))
    }

    fn run_minutes(&self, now: DateTime<Utc>) -> f64 {
        self.run_started
            .map(|start| (now - start).num_seconds() as f64 / 60.0)
            .unwrap_or(0.0)
    }

    fn drive(&mut self, on: bool, now: DateTime<Utc>, actions: &mut Vec<ControlAction>) {
        actions.push(ControlAction::Set {
            pin: self.config.pump_pin,
            on,
        });
        if on != self.pump_on {
            self.pump_on = on;
            actions.push(ControlAction::Note {
                kind: if on {
                    ActionKind::PumpStart
                } else {
                    ActionKind::PumpStop
                },
                details: serde_json::json!({
                    "at": now.timestamp_millis(),
                    "ran_today_minutes": self.ran_minutes + self.run_minutes(now),
                }),
            });
        }
    }

    fn close_run(&mut self, now: DateTime<Utc>) {
        if let Some(start) = self.run_started.take() {
            self.ran_minutes += (now - start).num_seconds() as f64 / 60.0;
            self.stop_at_min_boundary = false;
            self.rest_until =
                Some(now + ChronoDuration::minutes(i64::from(self.config.min_run_time)));
        }
    }

    fn roll_day(&mut self, now: DateTime<Utc>) {
        let date = now.date_naive();
        if self.today != Some(date) {
            self.today = Some(date);
            self.ran_minutes = 0.0;
            self.target_minutes = None;
            self.stop_at_min_boundary = false;
            self.rest_until = None;
            // a run crossing midnight keeps going but bills the new day
            if self.run_started.is_some() {
                self.run_started = Some(
                    date.and_hms_opt(0, 0, 0)
                        .map(|t| t.and_utc())
                        .unwrap_or(now),
                );
            }
        }
    }
}

impl ControlLogic for PumpTimer {
    fn actuator_pins(&self) -> Vec<u8> {
        vec![self.config.pump_pin]
    }

    #[allow(clippy::too_many_lines)]
    fn process(&mut self, input: &ProcessInput) -> Result<Vec<ControlAction>, Error> {
        let now = input.now;
        let mut actions = Vec::new();
        self.roll_day(now);

        let temperature = input.reading("water_temperature").map(|m| m.value);

        // manual override outranks everything else
        if let Some(until) = self.config.force_run_until {
            if now < until {
                self.close_run(now);
                self.forced = true;
                self.drive(true, now, &mut actions);
                return Ok(actions);
            }
        }
        if self.forced {
            self.forced = false;
            self.drive(false, now, &mut actions);
        }

        if !self.in_window(now) {
            self.close_run(now);
            self.drive(false, now, &mut actions);
            return Ok(actions);
        }

        let target = match self.target_minutes {
            Some(t) => t,
            None => {
                let t = self.derive_target(temperature);
                self.target_minutes = Some(t);
                t
            }
        };

        if self.run_started.is_some() {
            let run_len = self.run_minutes(now);

            // past the check delay, the temperature keeps steering the
            // target: a morning reading must not dictate the whole day
            if run_len >= f64::from(self.config.temp_check_delay_minutes) {
                let fresh = self.derive_target(temperature);
                if fresh != target {
                    actions.push(ControlAction::Note {
                        kind: ActionKind::Retarget,
                        details: serde_json::json!({
                            "old_minutes": target,
                            "new_minutes": fresh,
                        }),
                    });
                    self.target_minutes = Some(fresh);
                    if f64::from(fresh) < self.ran_minutes + run_len {
                        self.stop_at_min_boundary = true;
                    } else {
                        self.stop_at_min_boundary = false;
                    }
                }
            }
            let target = self.target_minutes.unwrap_or(target);

            let total = self.ran_minutes + run_len;
            let past_min = run_len >= f64::from(self.config.min_run_time);
            let past_max = run_len >= f64::from(self.config.max_run_time);
            if past_max || (past_min && (total >= f64::from(target) || self.stop_at_min_boundary))
            {
                self.close_run(now);
                self.drive(false, now, &mut actions);
            } else {
                self.drive(true, now, &mut actions);
            }
        } else {
            let resting = self.rest_until.is_some_and(|r| now < r);
            if self.ran_minutes < f64::from(target) && !resting {
                self.run_started = Some(now);
                self.drive(true, now, &mut actions);
            } else {
                self.drive(false, now, &mut actions);
            }
        }

        Ok(actions)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::TimeZone;

    use crate::store::{Measurement, MeasurementKind};
    use crate::{ControllerId, SensorId};

    use super::*;

    fn controller(config: serde_json::Value) -> Controller {
        Controller {
            id: ControllerId(3),
            name: "circulation".into(),
            controller_type: "pump_timer".into(),
            description: String::new(),
            enabled: true,
            update_interval_secs: 60,
            config,
            last_run_at: None,
        }
    }

    fn timer_config() -> serde_json::Value {
        serde_json::json!({
            "pump_pin": 22,
            "start_hour": 8,
            "end_hour": 20,
            "temp_thresholds": [
                { "floor_c": 20.0, "run_minutes": 30 },
                { "floor_c": 25.0, "run_minutes": 60 },
                { "floor_c": 30.0, "run_minutes": 90 }
            ],
            "min_run_time": 15,
            "max_run_time": 120,
            "temp_check_delay_minutes": 5
        })
    }

    fn input(now: DateTime<Utc>, temp: Option<f64>) -> ProcessInput {
        let mut readings = HashMap::new();
        if let Some(t) = temp {
            readings.insert(
                "water_temperature",
                Measurement {
                    sensor: SensorId(4),
                    taken_at: now,
                    kind: MeasurementKind::Temperature,
                    value: t,
                    unit: "°C".into(),
                    raw: None,
                },
            );
        }
        ProcessInput { now, readings }
    }

    fn pump_level(actions: &[ControlAction]) -> Option<bool> {
        actions.iter().rev().find_map(|a| match a {
            ControlAction::Set { pin: 22, on } => Some(*on),
            _ => None,
        })
    }

    /// Drive the timer minute-by-minute through a day and return total
    /// minutes the pump was commanded on.
    fn simulate_day(
        logic: &mut Box<dyn ControlLogic>,
        day: NaiveDate,
        temp_at: impl Fn(u32) -> Option<f64>,
    ) -> f64 {
        let mut on_minutes = 0.0;
        for minute in 0..(24 * 60) {
            let now = day
                .and_hms_opt(minute / 60, minute % 60, 0)
                .unwrap()
                .and_utc();
            let actions = logic.process(&input(now, temp_at(minute))).unwrap();
            if pump_level(&actions) == Some(true) {
                on_minutes += 1.0;
            }
        }
        on_minutes
    }

    #[test]
    fn derives_target_from_thresholds() {
        let timer = build(&controller(timer_config())).unwrap();
        assert_eq!(timer.derive_target(Some(22.0)), 30);
        assert_eq!(timer.derive_target(Some(26.0)), 60);
        assert_eq!(timer.derive_target(Some(31.0)), 90);
        // below every floor or unknown: clamped up to min_run_time
        assert_eq!(timer.derive_target(Some(10.0)), 15);
        assert_eq!(timer.derive_target(None), 15);
    }

    #[test]
    fn window_wraps_across_midnight() {
        let mut config = timer_config();
        config["start_hour"] = serde_json::json!(22);
        config["end_hour"] = serde_json::json!(6);
        let timer = build(&controller(config)).unwrap();
        let at = |h| Utc.with_ymd_and_hms(2024, 6, 1, h, 30, 0).unwrap();
        assert!(timer.in_window(at(23)));
        assert!(timer.in_window(at(2)));
        assert!(!timer.in_window(at(12)));
    }

    #[test]
    fn runs_fill_the_daily_target() {
        let mut logic = open(&controller(timer_config())).unwrap();
        let day = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        // constant 22 C: target 30 minutes
        let on_minutes = simulate_day(&mut logic, day, |_| Some(22.0));
        assert!(
            (on_minutes - 30.0).abs() <= 16.0,
            "ran {on_minutes} min for a 30 min target"
        );
    }

    #[test]
    fn mid_run_retarget_extends_the_day() {
        let mut logic = open(&controller(timer_config())).unwrap();
        let day = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        // 22 C at window open (target 30), rising to 26 C ten minutes into
        // the first run: past the check delay the target becomes 60
        let on_minutes = simulate_day(&mut logic, day, |minute| {
            if minute < 8 * 60 + 10 {
                Some(22.0)
            } else {
                Some(26.0)
            }
        });
        assert!(
            (45.0..=75.0).contains(&on_minutes),
            "ran {on_minutes} min, expected between 45 and 75"
        );
    }

    #[test]
    fn pump_stays_low_outside_window() {
        let mut logic = open(&controller(timer_config())).unwrap();
        let night = Utc.with_ymd_and_hms(2024, 6, 1, 3, 0, 0).unwrap();
        let actions = logic.process(&input(night, Some(30.0))).unwrap();
        assert_eq!(pump_level(&actions), Some(false));
    }

    #[test]
    fn force_run_overrides_window_and_expires() {
        let mut config = timer_config();
        let t0 = Utc.with_ymd_and_hms(2024, 6, 1, 21, 30, 0).unwrap();
        let until = t0 + ChronoDuration::minutes(10);
        config["force_run_until"] = serde_json::json!(until.timestamp_millis());
        let mut logic = open(&controller(config)).unwrap();

        // 21:30 is outside the 8..20 window, but the override wins
        let actions = logic.process(&input(t0, None)).unwrap();
        assert_eq!(pump_level(&actions), Some(true));

        // still forced just before expiry
        let actions = logic
            .process(&input(until - ChronoDuration::seconds(30), None))
            .unwrap();
        assert_eq!(pump_level(&actions), Some(true));

        // one tick past the deadline the pin falls
        let actions = logic
            .process(&input(until + ChronoDuration::seconds(30), None))
            .unwrap();
        assert_eq!(pump_level(&actions), Some(false));
    }

    #[test]
    fn midnight_resets_the_daily_total() {
        let mut logic = open(&controller(timer_config())).unwrap();
        let day1 = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let ran1 = simulate_day(&mut logic, day1, |_| Some(22.0));
        assert!(ran1 > 0.0);
        // the next day fills its own target from zero
        let day2 = day1.succ_opt().unwrap();
        let ran2 = simulate_day(&mut logic, day2, |_| Some(22.0));
        assert!(
            (ran2 - 30.0).abs() <= 16.0,
            "second day ran {ran2} min for a 30 min target"
        );
    }

    #[test]
    fn runs_respect_max_length() {
        let mut config = timer_config();
        config["max_run_time"] = serde_json::json!(20);
        let mut logic = open(&controller(config)).unwrap();
        let day = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        // hot water wants 90 minutes but each run caps at 20
        let mut longest = 0u32;
        let mut current = 0u32;
        for minute in 0..(24 * 60) {
            let now = day
                .and_hms_opt(minute / 60, minute % 60, 0)
                .unwrap()
                .and_utc();
            let actions = logic.process(&input(now, Some(31.0))).unwrap();
            if pump_level(&actions) == Some(true) {
                current += 1;
                longest = longest.max(current);
            } else {
                current = 0;
            }
        }
        assert!(longest <= 21, "longest run was {longest} min");
    }

    #[test]
    fn config_validation() {
        assert!(validate(&timer_config()).is_ok());
        let mut bad = timer_config();
        bad["start_hour"] = serde_json::json!(24);
        assert!(validate(&bad).is_err());
        let mut bad = timer_config();
        bad["min_run_time"] = serde_json::json!(0);
        assert!(validate(&bad).is_err());
        let mut bad = timer_config();
        bad["max_run_time"] = serde_json::json!(5);
        assert!(validate(&bad).is_err());
    }
}
