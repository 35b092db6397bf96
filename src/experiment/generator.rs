//! Combinatorial row generation.
//!
//! Rows are generated from four independent ranges nested X (outermost), Y,
//! angle, Z (innermost). When a rotation calibration is present, every angle
//! after the first rotates the lateral X and the Z start about the calibrated
//! origin so the same region of the sample stays in view.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::experiment::range::AxisRange;
use crate::experiment::row::RowSpec;

/// Inclusive `(start, step, end)` range for a lateral axis or the angle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RangeSpec {
    /// First value
    pub start: f64,
    /// Step between values (sign is ignored)
    pub step: f64,
    /// Last value
    pub end: f64,
}

impl RangeSpec {
    /// New inclusive range.
    pub fn new(start: f64, step: f64, end: f64) -> Self {
        Self { start, step, end }
    }

    /// Range holding one value.
    pub fn fixed(value: f64) -> Self {
        Self::new(value, 0.0, value)
    }

    /// Values in order.
    pub fn values(&self) -> Vec<f64> {
        AxisRange::stepped(self.start, self.step, self.end).positions()
    }
}

/// Calibrated rotation axis, parallel to Y, through `(origin_x, origin_z)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RotationCalibration {
    /// X coordinate of the rotation axis
    pub origin_x: f64,
    /// Z coordinate of the rotation axis
    pub origin_z: f64,
    /// Positive angles turn the sample clockwise when seen from +Y
    #[serde(default)]
    pub clockwise: bool,
}

impl RotationCalibration {
    /// Rotate the point `(x, z)` by `delta_degrees` about the axis.
    pub fn rotate(&self, x: f64, z: f64, delta_degrees: f64) -> (f64, f64) {
        let delta = if self.clockwise {
            -delta_degrees
        } else {
            delta_degrees
        }
        .to_radians();
        let (sin, cos) = delta.sin_cos();
        let rx = x - self.origin_x;
        let rz = z - self.origin_z;
        (
            self.origin_x + rx * cos - rz * sin,
            self.origin_z + rx * sin + rz * cos,
        )
    }
}

/// Generates the row list for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowGenerator {
    /// X positions
    pub x: RangeSpec,
    /// Y positions
    pub y: RangeSpec,
    /// Angles in degrees
    pub angle: RangeSpec,
    /// Z coverage of each stack
    pub z: AxisRange,
    /// Rotation calibration; identity transform when absent
    #[serde(default)]
    pub rotation: Option<RotationCalibration>,
}

impl RowGenerator {
    /// New generator without rotation calibration.
    pub fn new(x: RangeSpec, y: RangeSpec, angle: RangeSpec, z: AxisRange) -> Self {
        Self {
            x,
            y,
            angle,
            z,
            rotation: None,
        }
    }

    /// Apply a rotation calibration to angles after the first.
    pub fn with_rotation(mut self, rotation: Option<RotationCalibration>) -> Self {
        self.rotation = rotation;
        self
    }

    /// Number of rows `generate` will produce.
    pub fn row_count(&self) -> usize {
        self.x.values().len() * self.y.values().len() * self.angle.values().len()
    }

    /// Build rows in X, Y, angle order.
    pub fn generate(&self) -> Vec<RowSpec> {
        let xs = self.x.values();
        let ys = self.y.values();
        let angles = self.angle.values();
        let first_angle = angles.first().copied().unwrap_or(0.0);

        let mut rows = Vec::with_capacity(self.row_count());
        for &x in &xs {
            for &y in &ys {
                for &angle in &angles {
                    let (x, z) = match self.rotation {
                        Some(rotation) if angle != first_angle => {
                            let z0 = self.z.start();
                            let (rx, rz) = rotation.rotate(x, z0, angle - first_angle);
                            (rx, self.z.shifted(rz - z0))
                        }
                        _ => (x, self.z),
                    };
                    rows.push(RowSpec::new(x, y, angle, z));
                }
            }
        }

        debug!(rows = rows.len(), "Generated acquisition rows");
        rows
    }
}
