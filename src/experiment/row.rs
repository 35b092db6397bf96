//! One planned stack.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::DaqError;
use crate::experiment::range::AxisRange;
use crate::hardware::Axis;

/// Index of a row within a run plan.
///
/// Drift state is keyed by this identity, so each row keeps its own reference
/// stack for the whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowId(pub usize);

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "row {}", self.0)
    }
}

/// Immutable description of one acquisition unit.
///
/// Text form is `x,y,angle,z` where `z` uses the [`AxisRange`] encoding, e.g.
/// `"100,-20.5,90,0:0.5:40"`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RowSpec {
    /// Lateral X position
    pub x: f64,
    /// Lateral Y position
    pub y: f64,
    /// Rotation angle in degrees
    pub angle: f64,
    /// Z coverage
    pub z: AxisRange,
}

impl RowSpec {
    /// Create a row.
    pub fn new(x: f64, y: f64, angle: f64, z: AxisRange) -> Self {
        Self { x, y, angle, z }
    }

    /// Synchronous slice count, `None` for sweeps.
    pub fn depth(&self) -> Option<usize> {
        self.z.depth()
    }

    /// Whether this row is captured by a continuous sweep.
    pub fn is_sweep(&self) -> bool {
        self.z.is_sweep()
    }

    /// Stage position for lateral axes and the rotation.
    pub fn lateral(&self, axis: Axis) -> Option<f64> {
        match axis {
            Axis::X => Some(self.x),
            Axis::Y => Some(self.y),
            Axis::Theta => Some(self.angle),
            Axis::Z => None,
        }
    }
}

impl fmt::Display for RowSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{},{}", self.x, self.y, self.angle, self.z)
    }
}

impl FromStr for RowSpec {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split(',').collect();
        if fields.len() != 4 {
            return Err(DaqError::invalid_range(
                s,
                format!("row needs 4 comma-separated fields, found {}", fields.len()),
            ));
        }

        let lateral = |field: &str, what: &str| -> Result<f64, DaqError> {
            match field.trim().parse::<AxisRange>()? {
                AxisRange::Single { position } => Ok(position),
                _ => Err(DaqError::invalid_range(
                    s,
                    format!("{what} must be a single position"),
                )),
            }
        };

        Ok(RowSpec {
            x: lateral(fields[0], "x")?,
            y: lateral(fields[1], "y")?,
            angle: lateral(fields[2], "angle")?,
            z: fields[3].parse()?,
        })
    }
}

/// Stack description handed to `OutputSink::begin_stack`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StackAxis {
    /// Row being captured
    pub row: RowId,
    /// Time point index
    pub timepoint: u32,
    /// Axis the stack is taken along
    pub axis: Axis,
    /// Coverage along that axis, after drift correction
    pub range: AxisRange,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_text_round_trip() {
        let row = RowSpec::new(100.0, -20.5, 90.0, AxisRange::stepped(0.0, 0.5, 40.0));
        let text = row.to_string();
        assert_eq!(text, "100,-20.5,90,0:0.5:40");
        assert_eq!(text.parse::<RowSpec>().unwrap(), row);

        let sweep = RowSpec::new(0.1, 0.2, 0.3, AxisRange::sweep(-5.0, 5.0, 2.0));
        assert_eq!(sweep.to_string().parse::<RowSpec>().unwrap(), sweep);
    }

    #[test]
    fn row_rejects_ranges_on_lateral_axes() {
        assert!("0:1:2,0,0,5".parse::<RowSpec>().is_err());
        assert!("0,0,0".parse::<RowSpec>().is_err());
        assert!("0,0,0,nope".parse::<RowSpec>().is_err());
    }

    #[test]
    fn row_json_round_trip() {
        let row = RowSpec::new(1.0, 2.0, 45.0, AxisRange::sweep(0.0, 10.0, 1.0));
        let json = serde_json::to_string(&row).unwrap();
        assert_eq!(serde_json::from_str::<RowSpec>(&json).unwrap(), row);
    }
}
