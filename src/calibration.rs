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

//! Mapping raw sensor output onto real-world values.
//!
//! A calibration is a set of `(raw, real)` reference points. Evaluation is
//! piecewise-linear between sorted raw values, extrapolating the endpoint
//! slopes outside the hull; one point degenerates to a pure offset and zero
//! points to the identity. A two-point pH calibration is just the two-point
//! case with voltages for raw values, so every driver style evaluates through
//! the same function.
//!
//! `Calibration` is a plain value: the read pipeline clones it under the
//! sensor mutex and evaluates the clone, so a concurrent calibration update
//! can never tear an in-flight read.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
/// One reference point relating a raw reading to a real value.
pub struct CalPoint {
    /// The uncalibrated reading (counts, volts, millivolts — whatever the
    /// driver produces).
    pub raw: f64,
    /// The real value the raw reading corresponds to.
    pub real: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
/// An ordered set of calibration points with unique raw values.
pub struct Calibration {
    points: Vec<CalPoint>,
}

impl Calibration {
    #[must_use]
    /// An empty calibration: evaluation is the identity.
    pub fn new() -> Calibration {
        Calibration::default()
    }

    #[must_use]
    /// Build a calibration from arbitrary points. Later duplicates of a raw
    /// value replace earlier ones.
    pub fn from_points(points: impl IntoIterator<Item = (f64, f64)>) -> Calibration {
        let mut cal = Calibration::new();
        for (raw, real) in points {
            cal.add_point(raw, real);
        }
        cal
    }

    /// Add a reference point, replacing any existing point with the same raw
    /// value.
    pub fn add_point(&mut self, raw: f64, real: f64) {
        if let Some(existing) = self.points.iter_mut().find(|p| p.raw == raw) {
            existing.real = real;
            return;
        }
        let insert_at = self
            .points
            .iter()
            .position(|p| p.raw > raw)
            .unwrap_or(self.points.len());
        self.points.insert(insert_at, CalPoint { raw, real });
    }

    /// Remove every reference point.
    pub fn clear(&mut self) {
        self.points.clear();
    }

    #[must_use]
    /// The reference points, sorted by raw value.
    pub fn points(&self) -> &[CalPoint] {
        &self.points
    }

    #[must_use]
    /// The number of reference points.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[must_use]
    /// Whether the calibration has no points.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    #[must_use]
    /// Map a raw reading onto the calibrated value.
    ///
    /// * no points: `raw` unchanged;
    /// * one point `(r, v)`: `raw + (v - r)`;
    /// * two or more: linear interpolation in the interval containing `raw`,
    ///   with the first/last interval's slope extrapolated outside the hull.
    pub fn evaluate(&self, raw: f64) -> f64 {
        match self.points.as_slice() {
            [] => raw,
            [only] => raw + (only.real - only.raw),
            points => {
                // pick the interval whose segment covers `raw`; clamp to the
                // end segments so their slope extrapolates
                let last = points.len() - 2;
                let idx = points
                    .windows(2)
                    .position(|w| raw <= w[1].raw)
                    .unwrap_or(last)
                    .min(last);
                let (a, b) = (&points[idx], &points[idx + 1]);
                let slope = (b.real - a.real) / (b.raw - a.raw);
                a.real + (raw - a.raw) * slope
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// How a driver expects its calibration to be populated. Purely descriptive:
/// the API uses it to render the right calibration form, while evaluation is
/// always [`Calibration::evaluate`].
pub enum CalibrationStyle {
    /// The driver's output is already in final units.
    None,
    /// Two buffer solutions mapping measured volts to pH.
    TwoPointPh,
    /// A single millivolt offset against a reference solution.
    OffsetOrp,
    /// A cell-constant factor applied inside the driver config.
    FactorEc,
    /// Arbitrary user-provided points.
    Piecewise,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_is_identity() {
        let cal = Calibration::new();
        assert_eq!(cal.evaluate(42.5), 42.5);
        assert_eq!(cal.evaluate(-3.0), -3.0);
    }

    #[test]
    fn single_point_is_offset() {
        let cal = Calibration::from_points([(100.0, 103.5)]);
        assert_eq!(cal.evaluate(100.0), 103.5);
        assert_eq!(cal.evaluate(0.0), 3.5);
        assert_eq!(cal.evaluate(-10.0), -6.5);
    }

    #[test]
    fn two_point_ph_scenario() {
        // 0.5 V in pH 7 buffer, 3.0 V in pH 4 buffer
        let cal = Calibration::from_points([(0.5, 7.0), (3.0, 4.0)]);
        let ph = cal.evaluate(1.75);
        assert!((ph - 5.5).abs() < 1e-12);
    }

    #[test]
    fn evaluation_reproduces_every_stored_point() {
        let cal = Calibration::from_points([(0.0, 1.0), (2.0, 5.0), (7.0, 4.0), (9.0, 9.0)]);
        for point in cal.points() {
            assert_eq!(cal.evaluate(point.raw), point.real);
        }
    }

    #[test]
    fn extrapolates_endpoint_slopes() {
        let cal = Calibration::from_points([(0.0, 0.0), (1.0, 10.0), (2.0, 12.0)]);
        // below the hull: first interval slope 10
        assert!((cal.evaluate(-1.0) - (-10.0)).abs() < 1e-12);
        // above the hull: last interval slope 2
        assert!((cal.evaluate(3.0) - 14.0).abs() < 1e-12);
    }

    #[test]
    fn continuous_at_interior_points() {
        let cal = Calibration::from_points([(0.0, 0.0), (1.0, 10.0), (2.0, 12.0)]);
        let eps = 1e-9;
        let below = cal.evaluate(1.0 - eps);
        let above = cal.evaluate(1.0 + eps);
        assert!((below - above).abs() < 1e-6);
    }

    #[test]
    fn add_point_replaces_same_raw() {
        let mut cal = Calibration::from_points([(1.0, 5.0), (2.0, 6.0)]);
        cal.add_point(1.0, 4.0);
        assert_eq!(cal.len(), 2);
        assert_eq!(cal.evaluate(1.0), 4.0);
    }

    #[test]
    fn points_stay_sorted() {
        let cal = Calibration::from_points([(5.0, 1.0), (1.0, 2.0), (3.0, 3.0)]);
        let raws: Vec<f64> = cal.points().iter().map(|p| p.raw).collect();
        assert_eq!(raws, vec![1.0, 3.0, 5.0]);
    }

    #[test]
    fn clear_returns_to_identity() {
        let mut cal = Calibration::from_points([(1.0, 2.0)]);
        cal.clear();
        assert!(cal.is_empty());
        assert_eq!(cal.evaluate(7.0), 7.0);
    }

    #[test]
    fn survives_serde_round_trip() {
        let cal = Calibration::from_points([(0.5, 7.0), (3.0, 4.0)]);
        let json = serde_json::to_string(&cal).unwrap();
        let back: Calibration = serde_json::from_str(&json).unwrap();
        assert_eq!(cal, back);
    }
}
