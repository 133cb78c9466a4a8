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

#![warn(clippy::pedantic)]

//! hydroctl is a single-node environmental control runtime for hydroponic
//! and pool installations: it cyclically samples chemistry and climate
//! sensors, persists calibrated measurements, and runs closed-loop dosing
//! controllers and a temperature-aware circulation pump timer against
//! MOSFET-driven outputs on a small single-board computer.

pub mod calibration;
pub mod clock;
pub mod config;
pub mod controllers;
pub mod error;
pub mod hardware;
pub mod outputs;
pub mod persist;
pub mod runtime;
pub mod scheduler;
pub mod sensors;
pub mod store;

pub use error::Error;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
/// The stable identity of a sensor.
pub struct SensorId(pub u32);

impl std::fmt::Display for SensorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
/// The stable identity of a controller.
pub struct ControllerId(pub u32);

impl std::fmt::Display for ControllerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
