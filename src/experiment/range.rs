//! Z-axis ranges and their textual encoding.
//!
//! | Text | Range |
//! |---|---|
//! | `"5"` | single position |
//! | `"0:0.5:10"` | stepped, inclusive of both ends |
//! | `"0-100@25"` | continuous sweep from 0 to 100 at 25 units/s |
//!
//! Numbers print with Rust's shortest round-trip `f64` formatting, so
//! `text.parse::<AxisRange>()?.to_string()` reproduces the same three numbers
//! bit for bit.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::DaqError;

/// Most slices a stepped range may describe.
pub const MAX_STACK_DEPTH: usize = 100_000;

/// `round(|end - start| / step) + 1`, `None` when the count is not finite or
/// exceeds [`MAX_STACK_DEPTH`].
fn stepped_count(start: f64, step: f64, end: f64) -> Option<usize> {
    if step == 0.0 || start == end {
        return Some(1);
    }
    let intervals = ((end - start) / step).abs().round();
    if !intervals.is_finite() || intervals >= MAX_STACK_DEPTH as f64 {
        return None;
    }
    (intervals as usize).checked_add(1)
}

/// How the stage covers Z for one stack.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AxisRange {
    /// One fixed position
    Single {
        /// Position
        position: f64,
    },
    /// Synchronous steps from `start` to `end` inclusive
    Stepped {
        /// First position
        start: f64,
        /// Step between positions (sign is ignored)
        step: f64,
        /// Last position
        end: f64,
    },
    /// One continuous move captured by free-running streaming
    Sweep {
        /// Start position
        start: f64,
        /// End position
        end: f64,
        /// Stage velocity during the sweep
        velocity: f64,
    },
}

impl AxisRange {
    /// Single position.
    pub fn single(position: f64) -> Self {
        AxisRange::Single { position }
    }

    /// Inclusive stepped range.
    pub fn stepped(start: f64, step: f64, end: f64) -> Self {
        AxisRange::Stepped { start, step, end }
    }

    /// Continuous sweep.
    pub fn sweep(start: f64, end: f64, velocity: f64) -> Self {
        AxisRange::Sweep {
            start,
            end,
            velocity,
        }
    }

    /// First position visited.
    pub fn start(&self) -> f64 {
        match *self {
            AxisRange::Single { position } => position,
            AxisRange::Stepped { start, .. } | AxisRange::Sweep { start, .. } => start,
        }
    }

    /// Last position visited.
    pub fn end(&self) -> f64 {
        match *self {
            AxisRange::Single { position } => position,
            AxisRange::Stepped { end, .. } | AxisRange::Sweep { end, .. } => end,
        }
    }

    /// Number of synchronous positions, `None` for hardware-timed sweeps.
    ///
    /// `round((end - start) / step) + 1` for stepped ranges; a zero step or
    /// `start == end` yields one position. Counts beyond [`MAX_STACK_DEPTH`]
    /// saturate there; [`AxisRange::validate`] rejects them.
    pub fn depth(&self) -> Option<usize> {
        match *self {
            AxisRange::Single { .. } => Some(1),
            AxisRange::Stepped { start, step, end } => {
                Some(stepped_count(start, step, end).unwrap_or(MAX_STACK_DEPTH))
            }
            AxisRange::Sweep { .. } => None,
        }
    }

    /// Check a range built in code or deserialized, with the same rules the
    /// text parser applies.
    pub fn validate(&self) -> Result<(), DaqError> {
        let invalid = |reason: String| -> Result<(), DaqError> {
            Err(DaqError::invalid_range(&self.to_string(), reason))
        };
        match *self {
            AxisRange::Single { position } if !position.is_finite() => {
                invalid("position is not finite".into())
            }
            AxisRange::Single { .. } => Ok(()),
            AxisRange::Stepped { start, step, end } => {
                if !(start.is_finite() && step.is_finite() && end.is_finite()) {
                    return invalid("stepped range has a non-finite bound or step".into());
                }
                match stepped_count(start, step, end) {
                    Some(_) => Ok(()),
                    None => invalid(format!(
                        "step {step} gives more than {MAX_STACK_DEPTH} slices"
                    )),
                }
            }
            AxisRange::Sweep {
                start,
                end,
                velocity,
            } => {
                if !(start.is_finite() && end.is_finite()) {
                    return invalid("sweep endpoints must be finite".into());
                }
                if !(velocity.is_finite() && velocity > 0.0) {
                    return invalid("sweep velocity must be positive".into());
                }
                Ok(())
            }
        }
    }

    /// Positions visited synchronously, in order. Empty for sweeps.
    ///
    /// Each value is computed as `start + i * step` so error does not accumulate;
    /// a value within rounding distance of `end` is reported as `end` exactly.
    pub fn positions(&self) -> Vec<f64> {
        match *self {
            AxisRange::Single { position } => vec![position],
            AxisRange::Stepped { start, step, end } => {
                let depth = self.depth().unwrap_or(1);
                if depth == 1 {
                    return vec![start];
                }
                let signed = step.abs() * (end - start).signum();
                let tolerance = step.abs() * 1e-6;
                (0..depth)
                    .map(|i| {
                        let z = start + i as f64 * signed;
                        if (z - end).abs() <= tolerance {
                            end
                        } else {
                            z
                        }
                    })
                    .collect()
            }
            AxisRange::Sweep { .. } => Vec::new(),
        }
    }

    /// Whether this range is a continuous sweep.
    pub fn is_sweep(&self) -> bool {
        matches!(self, AxisRange::Sweep { .. })
    }

    /// Same range moved by `delta`.
    pub fn shifted(&self, delta: f64) -> Self {
        match *self {
            AxisRange::Single { position } => AxisRange::Single {
                position: position + delta,
            },
            AxisRange::Stepped { start, step, end } => AxisRange::Stepped {
                start: start + delta,
                step,
                end: end + delta,
            },
            AxisRange::Sweep {
                start,
                end,
                velocity,
            } => AxisRange::Sweep {
                start: start + delta,
                end: end + delta,
                velocity,
            },
        }
    }
}

impl fmt::Display for AxisRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            AxisRange::Single { position } => write!(f, "{}", position),
            AxisRange::Stepped { start, step, end } => write!(f, "{}:{}:{}", start, step, end),
            AxisRange::Sweep {
                start,
                end,
                velocity,
            } => write!(f, "{}-{}@{}", start, end, velocity),
        }
    }
}

fn parse_number(input: &str, part: &str, what: &str) -> Result<f64, DaqError> {
    let part = part.trim();
    let value: f64 = part
        .parse()
        .map_err(|_| DaqError::invalid_range(input, format!("{what} '{part}' is not a number")))?;
    if !value.is_finite() {
        return Err(DaqError::invalid_range(
            input,
            format!("{what} '{part}' is not finite"),
        ));
    }
    Ok(value)
}

/// Byte index of the `-` separating the sweep endpoints.
///
/// A leading `-` or one following an exponent marker belongs to a number; the
/// separator is the first `-` after a digit or a decimal point.
fn sweep_separator(text: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    (1..bytes.len()).find(|&i| {
        bytes[i] == b'-' && (bytes[i - 1].is_ascii_digit() || bytes[i - 1] == b'.')
    })
}

impl FromStr for AxisRange {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim();
        if text.is_empty() {
            return Err(DaqError::invalid_range(s, "empty range"));
        }

        if let Some((span, velocity)) = text.split_once('@') {
            let sep = sweep_separator(span.trim())
                .ok_or_else(|| DaqError::invalid_range(s, "sweep needs 'start-end@velocity'"))?;
            let span = span.trim();
            let start = parse_number(s, &span[..sep], "sweep start")?;
            let end = parse_number(s, &span[sep + 1..], "sweep end")?;
            let velocity = parse_number(s, velocity, "sweep velocity")?;
            if velocity <= 0.0 {
                return Err(DaqError::invalid_range(s, "sweep velocity must be positive"));
            }
            return Ok(AxisRange::Sweep {
                start,
                end,
                velocity,
            });
        }

        if text.contains(':') {
            let parts: Vec<&str> = text.split(':').collect();
            if parts.len() != 3 {
                return Err(DaqError::invalid_range(
                    s,
                    format!("stepped range needs 3 fields, found {}", parts.len()),
                ));
            }
            let start = parse_number(s, parts[0], "start")?;
            let step = parse_number(s, parts[1], "step")?;
            let end = parse_number(s, parts[2], "end")?;
            if stepped_count(start, step, end).is_none() {
                return Err(DaqError::invalid_range(
                    s,
                    format!("step {step} gives more than {MAX_STACK_DEPTH} slices"),
                ));
            }
            return Ok(AxisRange::Stepped { start, step, end });
        }

        Ok(AxisRange::Single {
            position: parse_number(s, text, "position")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_each_form() {
        assert_eq!("5".parse::<AxisRange>().unwrap(), AxisRange::single(5.0));
        assert_eq!(
            "0:0.5:10".parse::<AxisRange>().unwrap(),
            AxisRange::stepped(0.0, 0.5, 10.0)
        );
        assert_eq!(
            "0-100@25".parse::<AxisRange>().unwrap(),
            AxisRange::sweep(0.0, 100.0, 25.0)
        );
    }

    #[test]
    fn sweep_with_negative_and_exponent_endpoints() {
        assert_eq!(
            "-10--2.5@3".parse::<AxisRange>().unwrap(),
            AxisRange::sweep(-10.0, -2.5, 3.0)
        );
        assert_eq!(
            "1e-3-2e-3@1".parse::<AxisRange>().unwrap(),
            AxisRange::sweep(1e-3, 2e-3, 1.0)
        );
    }

    #[test]
    fn text_round_trip_is_exact() {
        for range in [
            AxisRange::stepped(0.1, 0.2, 0.30000000000000004),
            AxisRange::stepped(-1.0 / 3.0, 0.1, 1234.5678901234),
            AxisRange::sweep(-0.0001, 1.0e10, 0.333),
            AxisRange::single(std::f64::consts::PI),
        ] {
            let parsed: AxisRange = range.to_string().parse().unwrap();
            assert_eq!(parsed, range);
        }
    }

    #[test]
    fn malformed_text_is_rejected() {
        for bad in ["", "abc", "1:2", "1:2:3:4", "1-@2", "5@2", "0-1@0", "1:x:3", "inf"] {
            assert!(
                matches!(bad.parse::<AxisRange>(), Err(DaqError::InvalidRange { .. })),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn depth_and_positions() {
        let range = AxisRange::stepped(0.0, 2.5, 10.0);
        assert_eq!(range.depth(), Some(5));
        assert_eq!(range.positions(), vec![0.0, 2.5, 5.0, 7.5, 10.0]);

        let down = AxisRange::stepped(10.0, 5.0, 0.0);
        assert_eq!(down.positions(), vec![10.0, 5.0, 0.0]);

        assert_eq!(AxisRange::stepped(3.0, 0.0, 9.0).depth(), Some(1));
        assert_eq!(AxisRange::sweep(0.0, 1.0, 1.0).depth(), None);
        assert!(AxisRange::sweep(0.0, 1.0, 1.0).positions().is_empty());
    }

    #[test]
    fn oversized_stacks_are_rejected() {
        for bad in ["0:1e-300:10", "0:1e-9:10", "0:0.0001:10.5"] {
            assert!(
                matches!(bad.parse::<AxisRange>(), Err(DaqError::InvalidRange { .. })),
                "{bad:?} should be rejected"
            );
        }
        assert!("0:0.001:10".parse::<AxisRange>().is_ok());

        let tiny = AxisRange::stepped(0.0, 1e-300, 10.0);
        assert_eq!(tiny.depth(), Some(MAX_STACK_DEPTH));
        assert!(matches!(tiny.validate(), Err(DaqError::InvalidRange { .. })));
    }

    #[test]
    fn validate_checks_ranges_built_in_code() {
        assert!(AxisRange::stepped(0.0, 1.0, 10.0).validate().is_ok());
        assert!(AxisRange::sweep(0.0, 10.0, 5.0).validate().is_ok());
        for bad in [
            AxisRange::sweep(0.0, 10.0, 0.0),
            AxisRange::sweep(0.0, 10.0, -1.0),
            AxisRange::sweep(0.0, 10.0, f64::NAN),
            AxisRange::sweep(0.0, 10.0, f64::INFINITY),
            AxisRange::single(f64::NAN),
            AxisRange::stepped(0.0, f64::INFINITY, 1.0),
        ] {
            assert!(bad.validate().is_err(), "{bad:?}");
        }
    }
}
