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

//! Durable state under the data directory.
//!
//! Layout:
//!
//! ```text
//! <data_dir>/registry.json          entities, bindings, id counters
//! <data_dir>/measurements/<id>.jsonl   one measurement per line
//! <data_dir>/actions.jsonl          one controller action per line
//! ```
//!
//! The registry is written atomically (temp file, then rename). Measurement
//! and action rows append as JSON lines; at startup the runtime replays the
//! durable window and compacts the files down to it. A corrupt registry is
//! fatal — the runtime refuses to start on it — while a corrupt row in a log
//! file is skipped with a warning, because losing one sample beats losing
//! the installation.

use std::{
    collections::HashMap,
    fs::{self, File, OpenOptions},
    io::{BufRead, BufReader, Write},
    path::PathBuf,
    sync::Mutex,
};

use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::{
    controllers::Controller,
    error::Error,
    sensors::Sensor,
    store::{ActionSink, ControllerAction, Measurement, MeasurementSink},
    ControllerId, SensorId,
};

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
/// Everything the entity registry persists between restarts.
pub struct RegistrySnapshot {
    /// Every configured sensor.
    #[serde(default)]
    pub sensors: Vec<Sensor>,
    /// Every configured controller.
    #[serde(default)]
    pub controllers: Vec<Controller>,
    /// The controller-to-sensor binding rows.
    #[serde(default)]
    pub bindings: Vec<(ControllerId, SensorId)>,
    /// The next unassigned sensor id.
    #[serde(default)]
    pub next_sensor_id: u32,
    /// The next unassigned controller id.
    #[serde(default)]
    pub next_controller_id: u32,
}

/// A handle on the data directory.
pub struct DataDir {
    root: PathBuf,
    measurement_files: Mutex<HashMap<SensorId, File>>,
    actions_file: Mutex<Option<File>>,
}

impl DataDir {
    /// Open (creating if needed) the data directory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the directories cannot be created.
    pub fn open(root: PathBuf) -> Result<DataDir, Error> {
        fs::create_dir_all(&root)?;
        fs::create_dir_all(root.join("measurements"))?;
        Ok(DataDir {
            root,
            measurement_files: Mutex::new(HashMap::new()),
            actions_file: Mutex::new(None),
        })
    }

    fn registry_path(&self) -> PathBuf {
        self.root.join("registry.json")
    }

    fn measurement_path(&self, sensor: SensorId) -> PathBuf {
        self.root.join("measurements").join(format!("{}.jsonl", sensor.0))
    }

    fn actions_path(&self) -> PathBuf {
        self.root.join("actions.jsonl")
    }

    /// Load the registry snapshot, or `None` on first start.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupt`] if the file exists but cannot be parsed;
    /// a corrupt registry is fatal.
    pub fn load_registry(&self) -> Result<Option<RegistrySnapshot>, Error> {
        let path = self.registry_path();
        if !path.exists() {
            return Ok(None);
        }
        let file = File::open(path)?;
        let snapshot = serde_json::from_reader(BufReader::new(file))?;
        Ok(Some(snapshot))
    }

    /// Replace the registry snapshot atomically.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the write or rename fails.
    pub fn save_registry(&self, snapshot: &RegistrySnapshot) -> Result<(), Error> {
        let tmp = self.root.join("registry.json.tmp");
        {
            let mut file = File::create(&tmp)?;
            serde_json::to_writer_pretty(&mut file, snapshot)?;
            file.sync_all()?;
        }
        fs::rename(tmp, self.registry_path())?;
        Ok(())
    }

    /// Replay a sensor's durable rows not older than `cutoff`, then compact
    /// the file down to exactly what was replayed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] on I/O failure. Unparseable rows are
    /// skipped with a warning.
    pub fn replay_measurements(
        &self,
        sensor: SensorId,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Measurement>, Error> {
        let path = self.measurement_path(sensor);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut rows: Vec<Measurement> = Vec::new();
        for line in BufReader::new(File::open(&path)?).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Measurement>(&line) {
                Ok(m) if m.taken_at >= cutoff => rows.push(m),
                Ok(_) => {}
                Err(e) => warn!("skipping corrupt measurement row for sensor {sensor}: {e}"),
            }
        }
        rows.sort_by_key(|m| m.taken_at);

        // compact: rewrite only the surviving window
        let tmp = path.with_extension("jsonl.tmp");
        {
            let mut file = File::create(&tmp)?;
            for row in &rows {
                writeln!(file, "{}", serde_json::to_string(row)?)?;
            }
        }
        // drop any cached appender before swapping the file underneath it
        self.measurement_files.lock().map_err(|_| Error::Poison)?.remove(&sensor);
        fs::rename(tmp, path)?;
        Ok(rows)
    }

    /// Replay the most recent `limit` controller actions.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] on I/O failure.
    pub fn replay_actions(&self, limit: usize) -> Result<Vec<ControllerAction>, Error> {
        let path = self.actions_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut rows: Vec<ControllerAction> = Vec::new();
        for line in BufReader::new(File::open(path)?).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(action) => rows.push(action),
                Err(e) => warn!("skipping corrupt action row: {e}"),
            }
        }
        if rows.len() > limit {
            rows.drain(..rows.len() - limit);
        }
        Ok(rows)
    }
}

impl MeasurementSink for DataDir {
    fn append(&self, measurement: &Measurement) -> Result<(), Error> {
        let mut files = self.measurement_files.lock().map_err(|_| Error::Poison)?;
        let file = match files.entry(measurement.sensor) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(e) => e.insert(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(self.measurement_path(measurement.sensor))?,
            ),
        };
        writeln!(file, "{}", serde_json::to_string(measurement)?)?;
        Ok(())
    }

    fn purge(&self, sensor: SensorId) -> Result<(), Error> {
        self.measurement_files
            .lock()
            .map_err(|_| Error::Poison)?
            .remove(&sensor);
        let path = self.measurement_path(sensor);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

impl ActionSink for DataDir {
    fn append(&self, action: &ControllerAction) -> Result<(), Error> {
        let mut guard = self.actions_file.lock().map_err(|_| Error::Poison)?;
        if guard.is_none() {
            *guard = Some(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(self.actions_path())?,
            );
        }
        let file = guard.as_mut().expect("appender was just created");
        writeln!(file, "{}", serde_json::to_string(action)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use crate::store::{ActionKind, MeasurementKind};

    use super::*;

    fn measurement(sensor: SensorId, at: DateTime<Utc>, value: f64) -> Measurement {
        Measurement {
            sensor,
            taken_at: at,
            kind: MeasurementKind::Ec,
            value,
            unit: "µS/cm".into(),
            raw: None,
        }
    }

    #[test]
    fn registry_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let data = DataDir::open(dir.path().to_path_buf()).unwrap();
        assert!(data.load_registry().unwrap().is_none());

        let snapshot = RegistrySnapshot {
            sensors: Vec::new(),
            controllers: Vec::new(),
            bindings: vec![(ControllerId(1), SensorId(2))],
            next_sensor_id: 3,
            next_controller_id: 2,
        };
        data.save_registry(&snapshot).unwrap();
        assert_eq!(data.load_registry().unwrap().unwrap(), snapshot);
    }

    #[test]
    fn corrupt_registry_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let data = DataDir::open(dir.path().to_path_buf()).unwrap();
        fs::write(dir.path().join("registry.json"), b"{ not json").unwrap();
        let err = data.load_registry().unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn measurements_replay_within_cutoff_and_compact() {
        let dir = tempfile::tempdir().unwrap();
        let data = DataDir::open(dir.path().to_path_buf()).unwrap();
        let id = SensorId(5);
        let t0 = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();

        for i in 0..4 {
            MeasurementSink::append(&data, &measurement(id, t0 + Duration::hours(i), i as f64))
                .unwrap();
        }

        // keep only the last two hours
        let rows = data.replay_measurements(id, t0 + Duration::hours(2)).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].value, 2.0);

        // the file was compacted to the surviving window
        let contents = fs::read_to_string(data.measurement_path(id)).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[test]
    fn corrupt_measurement_rows_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let data = DataDir::open(dir.path().to_path_buf()).unwrap();
        let id = SensorId(6);
        let t0 = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        MeasurementSink::append(&data, &measurement(id, t0, 1.0)).unwrap();
        {
            let mut file = OpenOptions::new()
                .append(true)
                .open(data.measurement_path(id))
                .unwrap();
            writeln!(file, "this is not a measurement").unwrap();
        }
        MeasurementSink::append(&data, &measurement(id, t0 + Duration::seconds(1), 2.0)).unwrap();
        let rows = data
            .replay_measurements(id, t0 - Duration::hours(1))
            .unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn purge_removes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let data = DataDir::open(dir.path().to_path_buf()).unwrap();
        let id = SensorId(7);
        let t0 = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        MeasurementSink::append(&data, &measurement(id, t0, 1.0)).unwrap();
        assert!(data.measurement_path(id).exists());
        MeasurementSink::purge(&data, id).unwrap();
        assert!(!data.measurement_path(id).exists());
        assert!(data
            .replay_measurements(id, t0 - Duration::hours(1))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn actions_replay_tail() {
        let dir = tempfile::tempdir().unwrap();
        let data = DataDir::open(dir.path().to_path_buf()).unwrap();
        let t0 = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        for i in 0..5 {
            ActionSink::append(
                &data,
                &ControllerAction {
                    controller: ControllerId(1),
                    at: t0 + Duration::seconds(i),
                    kind: ActionKind::DoseUp,
                    details: serde_json::json!({ "i": i }),
                },
            )
            .unwrap();
        }
        let rows = data.replay_actions(3).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].details["i"], 2);
    }
}
