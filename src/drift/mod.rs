//! Per-row drift compensation
//!
//! A `DriftEstimator` watches every slice of a row's stack and, when the stack
//! finishes, produces the 3-D offset the sequencer adds to that row's start
//! position before the next stack. Three strategies share one interface:
//!
//! - `Centroid` - intensity-weighted centroid of thresholded pixels
//! - `Projection` - phase correlation of XY/XZ/ZY projections against the reference stack
//! - `Manual` - a human picks the region of interest on a max-intensity view
//!
//! Every estimate is a sample position in stage coordinates. The first stack of a
//! row becomes the reference and the offset is always `mean - reference`, so a
//! row is never corrected against a neighbouring row.
//!
//! # Blending
//!
//! ```text
//! new_mean = previous * (w / 2) + raw * (1 - w / 2)     w = ema_weight
//! ```
//!
//! If `|raw - reference|` exceeds `reset_magnitude`, the new mean is the midpoint
//! of reference and raw instead.
//!
//! Estimator state is only ever touched by the control thread.

pub mod centroid;
pub mod manual;
pub mod phase;
pub mod projection;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Mul, Neg, Sub};
use tracing::{debug, warn};

use crate::config::{DriftConfig, ThresholdMode, XyProjection};
use crate::data::Frame;

pub use centroid::CentroidEstimator;
pub use manual::{ChannelPicker, ManualEstimator, PickJob, PickRequest, RoiPick, RoiPicker};
pub use phase::{phase_correlate, PhaseShift};
pub use projection::{
    DiffPreview, NudgeKey, NudgeSession, OffsetReviewer, ProjectionEstimator, Projections,
    ReviewDecision, ScriptedReviewer,
};

/// Point or displacement in stage coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vector3 {
    /// X component
    pub x: f64,
    /// Y component
    pub y: f64,
    /// Z component
    pub z: f64,
}

impl Vector3 {
    /// The zero vector.
    pub const ZERO: Vector3 = Vector3 {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    /// New vector.
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Euclidean length.
    pub fn norm(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    /// Point halfway between `self` and `other`.
    pub fn midpoint(&self, other: Vector3) -> Vector3 {
        (*self + other) * 0.5
    }

    /// Whether every component is finite.
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

impl Add for Vector3 {
    type Output = Vector3;
    fn add(self, rhs: Vector3) -> Vector3 {
        Vector3::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl AddAssign for Vector3 {
    fn add_assign(&mut self, rhs: Vector3) {
        *self = *self + rhs;
    }
}

impl Sub for Vector3 {
    type Output = Vector3;
    fn sub(self, rhs: Vector3) -> Vector3 {
        Vector3::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl Mul<f64> for Vector3 {
    type Output = Vector3;
    fn mul(self, rhs: f64) -> Vector3 {
        Vector3::new(self.x * rhs, self.y * rhs, self.z * rhs)
    }
}

impl Neg for Vector3 {
    type Output = Vector3;
    fn neg(self) -> Vector3 {
        Vector3::new(-self.x, -self.y, -self.z)
    }
}

impl fmt::Display for Vector3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.3}, {:.3}, {:.3})", self.x, self.y, self.z)
    }
}

/// Estimator tuning resolved from [`DriftConfig`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriftTuning {
    /// Weight of the previous estimate (0..1)
    pub ema_weight: f64,
    /// Distance from the reference beyond which estimates are halved (0 disables)
    pub reset_magnitude: f64,
    /// Minimum fraction of pixels passing the threshold
    pub min_counted_ratio: f64,
    /// Centroid threshold policy
    pub threshold: ThresholdMode,
    /// Lateral stage units per pixel
    pub pixel_size: f64,
    /// Projection estimator XY view
    pub xy_projection: XyProjection,
}

impl Default for DriftTuning {
    fn default() -> Self {
        DriftTuning::from(&DriftConfig::default())
    }
}

impl From<&DriftConfig> for DriftTuning {
    fn from(config: &DriftConfig) -> Self {
        Self {
            ema_weight: config.ema_weight,
            reset_magnitude: config.reset_magnitude,
            min_counted_ratio: config.min_counted_ratio,
            threshold: config.threshold,
            pixel_size: config.pixel_size_um,
            xy_projection: config.xy_projection,
        }
    }
}

/// Running sums over the current stack. Cleared by `start_new_stack`.
#[derive(Debug, Clone, Default)]
pub struct StackAccumulator {
    /// Σ position·weight over counted pixels
    pub weighted_position: Vector3,
    /// Σ weight over counted pixels
    pub intensity_sum: f64,
    /// Pixels that passed the threshold
    pub counted_pixels: u64,
    /// Pixels seen
    pub total_pixels: u64,
    /// Lowest intensity seen, if any slice was tallied
    pub min_seen: Option<f64>,
    /// Highest intensity seen, if any slice was tallied
    pub max_seen: Option<f64>,
    /// Center of every tallied slice, in capture order
    pub slice_centers: Vec<Vector3>,
}

impl StackAccumulator {
    /// Slices tallied so far.
    pub fn depth(&self) -> usize {
        self.slice_centers.len()
    }

    /// Fraction of seen pixels that passed the threshold.
    pub fn counted_ratio(&self) -> f64 {
        if self.total_pixels == 0 {
            0.0
        } else {
            self.counted_pixels as f64 / self.total_pixels as f64
        }
    }

    /// Intensity-weighted centroid, `None` when nothing was counted.
    pub fn centroid(&self) -> Option<Vector3> {
        if self.intensity_sum > 0.0 {
            Some(self.weighted_position * (1.0 / self.intensity_sum))
        } else {
            None
        }
    }

    /// Mean of the slice centers, `None` for an empty stack.
    pub fn center(&self) -> Option<Vector3> {
        if self.slice_centers.is_empty() {
            return None;
        }
        let sum = self
            .slice_centers
            .iter()
            .fold(Vector3::ZERO, |acc, c| acc + *c);
        Some(sum * (1.0 / self.slice_centers.len() as f64))
    }

    /// Signed distance between consecutive slices along Z, 0 for single-slice stacks.
    pub fn z_step(&self) -> f64 {
        match self.slice_centers.as_slice() {
            [first, second, ..] => second.z - first.z,
            _ => 0.0,
        }
    }

    fn observe_range(&mut self, lo: f64, hi: f64) {
        self.min_seen = Some(self.min_seen.map_or(lo, |m| m.min(lo)));
        self.max_seen = Some(self.max_seen.map_or(hi, |m| m.max(hi)));
    }
}

/// Per-row drift state.
///
/// `reference` is fixed by the first stack; `mean` is the blended estimate that
/// persists across stacks for the lifetime of the run.
#[derive(Debug, Clone, Default)]
pub struct DriftState {
    /// Sums for the stack in progress
    pub stack: StackAccumulator,
    /// Estimate from the first stack
    pub reference: Option<Vector3>,
    /// Exponentially blended estimate
    pub mean: Option<Vector3>,
    /// Unblended estimate from the last completed stack
    pub last_raw: Option<Vector3>,
    /// Completed stacks
    pub stacks_completed: usize,
}

impl DriftState {
    /// Clear the stack accumulators.
    pub fn start_new_stack(&mut self) {
        self.stack = StackAccumulator::default();
    }

    /// Record the slice center and the frame's intensity range.
    pub fn note_slice(&mut self, center: Vector3, frame: &Frame) {
        self.stack.slice_centers.push(center);
        if let Some((lo, hi)) = frame.min_max() {
            self.stack.observe_range(lo, hi);
        }
    }

    /// Whether a reference has been recorded.
    pub fn has_reference(&self) -> bool {
        self.reference.is_some()
    }

    /// Current correction, `mean - reference`.
    pub fn offset(&self) -> Vector3 {
        match (self.mean, self.reference) {
            (Some(mean), Some(reference)) => mean - reference,
            _ => Vector3::ZERO,
        }
    }

    /// Fix the reference from the first stack. The offset becomes zero.
    pub fn set_reference(&mut self, estimate: Vector3) {
        debug!(reference = %estimate, "Drift reference recorded");
        self.reference = Some(estimate);
        self.mean = Some(estimate);
        self.last_raw = Some(estimate);
        self.stacks_completed += 1;
    }

    /// Complete a stack without changing the estimate.
    pub fn hold(&mut self) -> Vector3 {
        self.stacks_completed += 1;
        self.offset()
    }

    /// Complete a stack and drop any accumulated correction.
    pub fn reset_to_reference(&mut self) -> Vector3 {
        self.mean = self.reference;
        self.stacks_completed += 1;
        Vector3::ZERO
    }

    /// Blend a new raw estimate into the mean and return the new offset.
    pub fn update(&mut self, raw: Vector3, tuning: &DriftTuning) -> Vector3 {
        let Some(reference) = self.reference else {
            self.set_reference(raw);
            return Vector3::ZERO;
        };
        let previous = self.mean.unwrap_or(reference);
        let (mean, clamped) = blend(previous, raw, reference, tuning);
        if clamped {
            warn!(
                raw = %raw,
                reference = %reference,
                limit = tuning.reset_magnitude,
                "Drift estimate exceeds reset magnitude; using midpoint"
            );
        }
        self.mean = Some(mean);
        self.last_raw = Some(raw);
        self.stacks_completed += 1;
        mean - reference
    }
}

/// Blend `raw` with `previous`. Returns the new mean and whether the reset clamp fired.
///
/// The previous weight is halved before use. The halving is kept as found; its
/// rationale is undocumented.
pub fn blend(
    previous: Vector3,
    raw: Vector3,
    reference: Vector3,
    tuning: &DriftTuning,
) -> (Vector3, bool) {
    if tuning.reset_magnitude > 0.0 && (raw - reference).norm() > tuning.reset_magnitude {
        return (reference.midpoint(raw), true);
    }
    let w = tuning.ema_weight / 2.0;
    (previous * w + raw * (1.0 - w), false)
}

/// Which strategy an estimator uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftKind {
    /// Human ROI pick
    Manual,
    /// Intensity centroid
    Centroid,
    /// Projection phase correlation
    Projection,
}

impl fmt::Display for DriftKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriftKind::Manual => write!(f, "manual"),
            DriftKind::Centroid => write!(f, "centroid"),
            DriftKind::Projection => write!(f, "projection"),
        }
    }
}

/// Drift estimator for one row.
pub enum DriftEstimator {
    /// Human picks the region of interest
    Manual(ManualEstimator),
    /// Intensity-weighted centroid
    Centroid(CentroidEstimator),
    /// Phase correlation of projections
    Projection(ProjectionEstimator),
}

impl DriftEstimator {
    /// Intensity-centroid estimator.
    pub fn centroid(tuning: DriftTuning) -> Self {
        DriftEstimator::Centroid(CentroidEstimator::new(tuning))
    }

    /// Projection-correlation estimator without interactive review.
    pub fn projection(tuning: DriftTuning) -> Self {
        DriftEstimator::Projection(ProjectionEstimator::new(tuning))
    }

    /// Manual estimator answering through `picker`.
    pub fn manual(tuning: DriftTuning, picker: Box<dyn RoiPicker>) -> Self {
        DriftEstimator::Manual(ManualEstimator::new(tuning, picker))
    }

    /// Strategy of this estimator.
    pub fn kind(&self) -> DriftKind {
        match self {
            DriftEstimator::Manual(_) => DriftKind::Manual,
            DriftEstimator::Centroid(_) => DriftKind::Centroid,
            DriftEstimator::Projection(_) => DriftKind::Projection,
        }
    }

    /// Shared per-row state.
    pub fn state(&self) -> &DriftState {
        match self {
            DriftEstimator::Manual(e) => &e.state,
            DriftEstimator::Centroid(e) => &e.state,
            DriftEstimator::Projection(e) => &e.state,
        }
    }

    /// Reset the stack accumulators.
    pub fn start_new_stack(&mut self) {
        match self {
            DriftEstimator::Manual(e) => e.start_new_stack(),
            DriftEstimator::Centroid(e) => e.start_new_stack(),
            DriftEstimator::Projection(e) => e.start_new_stack(),
        }
    }

    /// Feed one slice captured with its center at `center`.
    pub fn tally_slice(&mut self, center: Vector3, frame: &Frame) {
        match self {
            DriftEstimator::Manual(e) => e.tally_slice(center, frame),
            DriftEstimator::Centroid(e) => e.tally_slice(center, frame),
            DriftEstimator::Projection(e) => e.tally_slice(center, frame),
        }
    }

    /// Close the stack and return the updated offset.
    ///
    /// A stack finished before any reference exists is treated as initial.
    /// Stacks without slices leave the estimate untouched.
    pub fn finish_stack(&mut self, initial: bool) -> Vector3 {
        let initial = initial || !self.state().has_reference();
        if self.state().stack.depth() == 0 {
            warn!(kind = %self.kind(), "Stack finished without slices; drift estimate unchanged");
            return self.state().offset();
        }
        let offset = match self {
            DriftEstimator::Manual(e) => e.finish_stack(initial),
            DriftEstimator::Centroid(e) => e.finish_stack(initial),
            DriftEstimator::Projection(e) => e.finish_stack(initial),
        };
        debug!(kind = %self.kind(), initial, offset = %offset, "Stack drift estimate");
        offset
    }

    /// Current correction relative to the row's first stack.
    pub fn offset(&self) -> Vector3 {
        self.state().offset()
    }
}

impl fmt::Debug for DriftEstimator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriftEstimator")
            .field("kind", &self.kind())
            .field("state", self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuning(ema_weight: f64, reset_magnitude: f64) -> DriftTuning {
        DriftTuning {
            ema_weight,
            reset_magnitude,
            ..Default::default()
        }
    }

    #[test]
    fn blend_halves_previous_weight() {
        let previous = Vector3::new(10.0, 0.0, 0.0);
        let raw = Vector3::new(20.0, 0.0, 0.0);
        let (mean, clamped) = blend(previous, raw, Vector3::ZERO, &tuning(0.5, 0.0));
        assert!(!clamped);
        // 10 * 0.25 + 20 * 0.75
        assert!((mean.x - 17.5).abs() < 1e-12);
    }

    #[test]
    fn zero_weight_takes_raw() {
        let raw = Vector3::new(1.0, 2.0, 3.0);
        let (mean, _) = blend(Vector3::ZERO, raw, Vector3::ZERO, &tuning(0.0, 0.0));
        assert_eq!(mean, raw);
    }

    #[test]
    fn reset_clamp_uses_midpoint() {
        let reference = Vector3::new(1.0, 1.0, 1.0);
        let raw = Vector3::new(1.0, 1.0, 31.0);
        let (mean, clamped) = blend(reference, raw, reference, &tuning(0.8, 10.0));
        assert!(clamped);
        assert_eq!(mean, Vector3::new(1.0, 1.0, 16.0));
    }

    #[test]
    fn state_offset_is_relative_to_reference() {
        let mut state = DriftState::default();
        state.set_reference(Vector3::new(5.0, 5.0, 5.0));
        assert_eq!(state.offset(), Vector3::ZERO);

        let offset = state.update(Vector3::new(7.0, 5.0, 4.0), &tuning(0.0, 0.0));
        assert_eq!(offset, Vector3::new(2.0, 0.0, -1.0));
        assert_eq!(state.stacks_completed, 2);

        assert_eq!(state.reset_to_reference(), Vector3::ZERO);
        assert_eq!(state.offset(), Vector3::ZERO);
    }

    #[test]
    fn vector_arithmetic() {
        let a = Vector3::new(1.0, 2.0, 3.0);
        let b = Vector3::new(3.0, 2.0, 1.0);
        assert_eq!(a + b, Vector3::new(4.0, 4.0, 4.0));
        assert_eq!(a - b, Vector3::new(-2.0, 0.0, 2.0));
        assert_eq!(a.midpoint(b), Vector3::new(2.0, 2.0, 2.0));
        assert_eq!(-a, Vector3::new(-1.0, -2.0, -3.0));
        assert!((Vector3::new(3.0, 4.0, 0.0).norm() - 5.0).abs() < 1e-12);
    }
}
