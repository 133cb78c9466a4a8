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

//! The measurement store and the controller action log.
//!
//! Measurements are kept per sensor in an append-only bounded window (24
//! hours or 100 000 points by default, whichever trips first) plus a
//! single-slot latest cache that survives trimming. Writers take the
//! sensor's exclusive lock for the duration of one append — including the
//! durable write — and readers take shared snapshots. Nothing here knows how
//! rows reach disk; the sinks are small traits that persistence implements.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, RwLock},
};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    clock::Clock,
    config::RetentionConfig,
    error::Error,
    ControllerId, SensorId,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// What physical quantity a measurement describes.
pub enum MeasurementKind {
    /// Temperature in degrees Celsius.
    Temperature,
    /// Relative humidity in percent.
    Humidity,
    /// Acidity, pH units.
    Ph,
    /// Oxidation-reduction potential in millivolts.
    Orp,
    /// Electrical conductivity in microsiemens per centimeter.
    Ec,
    /// Pressure in hectopascals.
    Pressure,
    /// Water level in percent of the probe range.
    WaterLevel,
    /// A user-defined analog quantity; the unit comes from driver config.
    Generic,
}

impl MeasurementKind {
    #[must_use]
    /// The kind's wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            MeasurementKind::Temperature => "temperature",
            MeasurementKind::Humidity => "humidity",
            MeasurementKind::Ph => "ph",
            MeasurementKind::Orp => "orp",
            MeasurementKind::Ec => "ec",
            MeasurementKind::Pressure => "pressure",
            MeasurementKind::WaterLevel => "water_level",
            MeasurementKind::Generic => "generic",
        }
    }
}

impl std::fmt::Display for MeasurementKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
/// One immutable calibrated reading.
pub struct Measurement {
    /// The sensor that produced this reading.
    pub sensor: SensorId,
    /// When the reading was taken, UTC with millisecond precision.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub taken_at: DateTime<Utc>,
    /// The physical quantity measured.
    pub kind: MeasurementKind,
    /// The calibrated value.
    pub value: f64,
    /// The unit of the calibrated value.
    pub unit: String,
    /// The uncalibrated reading, when the driver exposes one.
    pub raw: Option<f64>,
}

/// Where durable measurement rows go. Implemented by persistence; absent in
/// purely in-memory deployments and most tests.
pub trait MeasurementSink: Send + Sync {
    /// Append one row durably.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the write fails; storage failures are
    /// fatal to the runtime.
    fn append(&self, measurement: &Measurement) -> Result<(), Error>;

    /// Drop every durable row for a sensor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the removal fails.
    fn purge(&self, sensor: SensorId) -> Result<(), Error>;
}

struct Series {
    points: VecDeque<Measurement>,
    latest: Option<Measurement>,
}

/// The per-sensor measurement window plus the latest-value cache.
pub struct MeasurementStore {
    retention: RetentionConfig,
    series: RwLock<HashMap<SensorId, Arc<RwLock<Series>>>>,
    sink: Option<Arc<dyn MeasurementSink>>,
    clock: Arc<dyn Clock>,
}

impl MeasurementStore {
    #[must_use]
    /// An in-memory store with the given retention limits.
    pub fn new(retention: RetentionConfig, clock: Arc<dyn Clock>) -> MeasurementStore {
        MeasurementStore {
            retention,
            series: RwLock::new(HashMap::new()),
            sink: None,
            clock,
        }
    }

    #[must_use]
    /// A store that mirrors every append into `sink`.
    pub fn with_sink(
        retention: RetentionConfig,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn MeasurementSink>,
    ) -> MeasurementStore {
        MeasurementStore {
            retention,
            series: RwLock::new(HashMap::new()),
            sink: Some(sink),
            clock,
        }
    }

    fn series_for(&self, sensor: SensorId) -> Result<Arc<RwLock<Series>>, Error> {
        if let Some(series) = self.series.read()?.get(&sensor) {
            return Ok(Arc::clone(series));
        }
        let mut table = self.series.write()?;
        let series = table.entry(sensor).or_insert_with(|| {
            Arc::new(RwLock::new(Series {
                points: VecDeque::new(),
                latest: None,
            }))
        });
        Ok(Arc::clone(series))
    }

    /// Append one measurement, trimming the window to the retention limits.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the durable sink rejects the row.
    pub fn append(&self, measurement: Measurement) -> Result<(), Error> {
        let series = self.series_for(measurement.sensor)?;
        let mut guard = series.write()?;
        if let Some(sink) = &self.sink {
            sink.append(&measurement)?;
        }
        guard.latest = Some(measurement.clone());
        guard.points.push_back(measurement);
        self.trim(&mut guard);
        Ok(())
    }

    /// Replay rows loaded from durable storage without re-persisting them.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Poison`] if a lock is poisoned.
    pub fn preload(&self, sensor: SensorId, rows: Vec<Measurement>) -> Result<(), Error> {
        let series = self.series_for(sensor)?;
        let mut guard = series.write()?;
        for row in rows {
            guard.latest = Some(row.clone());
            guard.points.push_back(row);
        }
        self.trim(&mut guard);
        Ok(())
    }

    fn trim(&self, series: &mut Series) {
        let cutoff = self.clock.now_utc()
            - Duration::seconds(i64::try_from(self.retention.max_age_secs).unwrap_or(i64::MAX));
        while series.points.len() > self.retention.max_points
            || series
                .points
                .front()
                .is_some_and(|m| m.taken_at < cutoff)
        {
            series.points.pop_front();
        }
    }

    #[must_use]
    /// The most recent measurement for a sensor, if any.
    pub fn latest(&self, sensor: SensorId) -> Option<Measurement> {
        let series = self.series.read().ok()?.get(&sensor).cloned()?;
        let guard = series.read().ok()?;
        guard.latest.clone()
    }

    #[must_use]
    /// The most recent measurement of one kind for a sensor. Multi-output
    /// sensors interleave kinds in their window, so the plain latest cache
    /// is not enough when a controller role needs a specific quantity.
    pub fn latest_of_kind(
        &self,
        sensor: SensorId,
        kind: MeasurementKind,
    ) -> Option<Measurement> {
        let series = self.series.read().ok()?.get(&sensor).cloned()?;
        let guard = series.read().ok()?;
        if let Some(latest) = &guard.latest {
            if latest.kind == kind {
                return Some(latest.clone());
            }
        }
        guard.points.iter().rev().find(|m| m.kind == kind).cloned()
    }

    #[must_use]
    /// Every measurement for `sensor` in `[start, end]`, oldest first.
    pub fn range(
        &self,
        sensor: SensorId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<Measurement> {
        let Some(series) = self.series.read().ok().and_then(|t| t.get(&sensor).cloned()) else {
            return Vec::new();
        };
        let Ok(guard) = series.read() else {
            return Vec::new();
        };
        guard
            .points
            .iter()
            .filter(|m| m.taken_at >= start && m.taken_at <= end)
            .cloned()
            .collect()
    }

    #[must_use]
    /// Measurements across every sensor not older than `horizon`, oldest
    /// first within each sensor.
    pub fn recent_all(&self, horizon: Duration) -> Vec<Measurement> {
        let cutoff = self.clock.now_utc() - horizon;
        let Ok(table) = self.series.read() else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for series in table.values() {
            if let Ok(guard) = series.read() {
                out.extend(
                    guard
                        .points
                        .iter()
                        .filter(|m| m.taken_at >= cutoff)
                        .cloned(),
                );
            }
        }
        out
    }

    #[must_use]
    /// How many points are currently retained for a sensor.
    pub fn count(&self, sensor: SensorId) -> usize {
        self.series
            .read()
            .ok()
            .and_then(|t| t.get(&sensor).cloned())
            .and_then(|s| s.read().ok().map(|g| g.points.len()))
            .unwrap_or(0)
    }

    /// Drop every measurement for a sensor, in memory and durably.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the durable purge fails.
    pub fn purge(&self, sensor: SensorId) -> Result<(), Error> {
        self.series.write()?.remove(&sensor);
        if let Some(sink) = &self.sink {
            sink.purge(sensor)?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// What a controller action log entry records.
pub enum ActionKind {
    /// A dose towards higher values was pulsed.
    DoseUp,
    /// A dose towards lower values was pulsed.
    DoseDown,
    /// A direction hit its daily dose limit and was suspended.
    DoseSaturation,
    /// The bound reading was too old to act on.
    StaleReading,
    /// The arbiter refused an output operation.
    Refused,
    /// The circulation pump was started.
    PumpStart,
    /// The circulation pump was stopped.
    PumpStop,
    /// The pump's daily runtime target was re-derived mid-run.
    Retarget,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
/// One append-only controller action log entry.
pub struct ControllerAction {
    /// The controller that acted.
    pub controller: ControllerId,
    /// When the action happened, UTC with millisecond precision.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub at: DateTime<Utc>,
    /// What happened.
    pub kind: ActionKind,
    /// Free-form structured detail (pin, value, target, ...).
    pub details: serde_json::Value,
}

/// Where durable action rows go.
pub trait ActionSink: Send + Sync {
    /// Append one row durably.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the write fails.
    fn append(&self, action: &ControllerAction) -> Result<(), Error>;
}

/// Bounded append-only log of controller actions.
pub struct ActionLog {
    cap: usize,
    entries: RwLock<VecDeque<ControllerAction>>,
    sink: Option<Arc<dyn ActionSink>>,
}

impl ActionLog {
    #[must_use]
    /// An in-memory log retaining at most `cap` entries.
    pub fn new(cap: usize) -> ActionLog {
        ActionLog {
            cap,
            entries: RwLock::new(VecDeque::new()),
            sink: None,
        }
    }

    #[must_use]
    /// A log that mirrors every append into `sink`.
    pub fn with_sink(cap: usize, sink: Arc<dyn ActionSink>) -> ActionLog {
        ActionLog {
            cap,
            entries: RwLock::new(VecDeque::new()),
            sink: Some(sink),
        }
    }

    /// Append one entry, evicting the oldest past the cap.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the durable sink rejects the row.
    pub fn append(&self, action: ControllerAction) -> Result<(), Error> {
        if let Some(sink) = &self.sink {
            sink.append(&action)?;
        }
        let mut entries = self.entries.write()?;
        entries.push_back(action);
        while entries.len() > self.cap {
            entries.pop_front();
        }
        Ok(())
    }

    /// Replay entries loaded from durable storage.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Poison`] if the lock is poisoned.
    pub fn preload(&self, rows: Vec<ControllerAction>) -> Result<(), Error> {
        let mut entries = self.entries.write()?;
        for row in rows {
            entries.push_back(row);
        }
        while entries.len() > self.cap {
            entries.pop_front();
        }
        Ok(())
    }

    #[must_use]
    /// The most recent entries for one controller, newest first.
    pub fn recent(&self, controller: ControllerId, limit: usize) -> Vec<ControllerAction> {
        let Ok(entries) = self.entries.read() else {
            return Vec::new();
        };
        entries
            .iter()
            .rev()
            .filter(|a| a.controller == controller)
            .take(limit)
            .cloned()
            .collect()
    }

    #[must_use]
    /// The most recent entries across all controllers, newest first.
    pub fn recent_all(&self, limit: usize) -> Vec<ControllerAction> {
        let Ok(entries) = self.entries.read() else {
            return Vec::new();
        };
        entries.iter().rev().take(limit).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use crate::clock::ManualClock;

    use super::*;

    fn test_clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
        ))
    }

    fn reading(sensor: SensorId, at: DateTime<Utc>, value: f64) -> Measurement {
        Measurement {
            sensor,
            taken_at: at,
            kind: MeasurementKind::Ph,
            value,
            unit: "pH".into(),
            raw: Some(value / 2.0),
        }
    }

    fn small_retention() -> RetentionConfig {
        RetentionConfig {
            max_age_secs: 3600,
            max_points: 5,
            durable_age_secs: 3600,
            action_log_cap: 3,
        }
    }

    #[test]
    fn append_and_latest() {
        let clock = test_clock();
        let store = MeasurementStore::new(small_retention(), clock.clone());
        let id = SensorId(1);
        store.append(reading(id, clock.now_utc(), 6.1)).unwrap();
        store.append(reading(id, clock.now_utc(), 6.2)).unwrap();
        let latest = store.latest(id).unwrap();
        assert_eq!(latest.value, 6.2);
        assert_eq!(store.count(id), 2);
    }

    #[test]
    fn trims_by_point_count() {
        let clock = test_clock();
        let store = MeasurementStore::new(small_retention(), clock.clone());
        let id = SensorId(1);
        for i in 0..8 {
            store
                .append(reading(id, clock.now_utc(), f64::from(i)))
                .unwrap();
        }
        assert_eq!(store.count(id), 5);
        // the oldest three readings fell off; the latest cache tracks the tip
        assert_eq!(store.latest(id).unwrap().value, 7.0);
    }

    #[test]
    fn trims_by_age_but_keeps_latest_cache() {
        let clock = test_clock();
        let store = MeasurementStore::new(small_retention(), clock.clone());
        let id = SensorId(1);
        store.append(reading(id, clock.now_utc(), 1.0)).unwrap();
        clock.advance(Duration::seconds(7200));
        // appending now trims the hour-old point away
        store.append(reading(id, clock.now_utc(), 2.0)).unwrap();
        assert_eq!(store.count(id), 1);
        assert_eq!(store.latest(id).unwrap().value, 2.0);
    }

    #[test]
    fn range_is_inclusive() {
        let clock = test_clock();
        let store = MeasurementStore::new(small_retention(), clock.clone());
        let id = SensorId(1);
        let t0 = clock.now_utc();
        for i in 0..3 {
            store
                .append(reading(id, t0 + Duration::seconds(i * 10), i as f64))
                .unwrap();
        }
        let hits = store.range(id, t0, t0 + Duration::seconds(10));
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].value, 0.0);
        assert_eq!(hits[1].value, 1.0);
    }

    #[test]
    fn purge_forgets_everything() {
        let clock = test_clock();
        let store = MeasurementStore::new(small_retention(), clock.clone());
        let id = SensorId(9);
        for _ in 0..3 {
            store.append(reading(id, clock.now_utc(), 1.0)).unwrap();
        }
        store.purge(id).unwrap();
        assert_eq!(store.count(id), 0);
        assert!(store.latest(id).is_none());
        assert!(store
            .range(id, clock.now_utc() - Duration::days(1), clock.now_utc())
            .is_empty());
    }

    #[test]
    fn latest_of_kind_skips_other_quantities() {
        let clock = test_clock();
        let store = MeasurementStore::new(small_retention(), clock.clone());
        let id = SensorId(8);
        let mut temp = reading(id, clock.now_utc(), 21.5);
        temp.kind = MeasurementKind::Temperature;
        store.append(temp).unwrap();
        let mut hum = reading(id, clock.now_utc(), 55.0);
        hum.kind = MeasurementKind::Humidity;
        store.append(hum).unwrap();

        // the plain latest cache holds the humidity row
        assert_eq!(store.latest(id).unwrap().kind, MeasurementKind::Humidity);
        let t = store
            .latest_of_kind(id, MeasurementKind::Temperature)
            .unwrap();
        assert_eq!(t.value, 21.5);
        assert!(store.latest_of_kind(id, MeasurementKind::Ec).is_none());
    }

    #[test]
    fn recent_all_spans_sensors() {
        let clock = test_clock();
        let store = MeasurementStore::new(small_retention(), clock.clone());
        store
            .append(reading(SensorId(1), clock.now_utc(), 1.0))
            .unwrap();
        store
            .append(reading(SensorId(2), clock.now_utc(), 2.0))
            .unwrap();
        let all = store.recent_all(Duration::minutes(5));
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn action_log_caps_and_filters() {
        let log = ActionLog::new(3);
        for i in 0..5 {
            log.append(ControllerAction {
                controller: ControllerId(u32::from(i % 2 == 0)),
                at: Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, i as u32).unwrap(),
                kind: ActionKind::DoseUp,
                details: serde_json::json!({ "i": i }),
            })
            .unwrap();
        }
        assert_eq!(log.recent_all(10).len(), 3);
        let ones = log.recent(ControllerId(1), 10);
        assert!(ones.iter().all(|a| a.controller == ControllerId(1)));
        // newest first
        let all = log.recent_all(10);
        assert!(all[0].at >= all[1].at);
    }

    #[test]
    fn measurement_timestamps_serialize_as_milliseconds() {
        let m = reading(
            SensorId(3),
            Utc.timestamp_millis_opt(1_717_243_200_123).unwrap(),
            6.0,
        );
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json["taken_at"], serde_json::json!(1_717_243_200_123i64));
        let back: Measurement = serde_json::from_value(json).unwrap();
        assert_eq!(back, m);
    }
}
