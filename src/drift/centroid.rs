//! Intensity-centroid drift estimator.
//!
//! Every pixel inside the threshold window contributes its stage position
//! weighted by its intensity. A pixel at `(px, py)` in a slice centered at `c`
//! sits at
//!
//! ```text
//! c + ((px - w/2) * pixel_size, (py - h/2) * pixel_size, 0)
//! ```
//!
//! so the centroid of a stack is a sample position in stage coordinates.

use tracing::warn;

use crate::config::ThresholdMode;
use crate::data::Frame;
use crate::drift::{DriftState, DriftTuning, Vector3};

/// Inclusive intensity window for one frame, `None` when every pixel counts.
pub fn threshold_window(mode: ThresholdMode, frame: &Frame) -> Option<(f64, f64)> {
    match mode {
        ThresholdMode::None => None,
        ThresholdMode::Absolute { low, high } => Some((low, high)),
        ThresholdMode::Auto { low, high } => {
            let (min, max) = frame.min_max()?;
            let span = max - min;
            Some((min + low * span, min + high * span))
        }
    }
}

/// Centroid estimator state for one row.
#[derive(Debug, Clone)]
pub struct CentroidEstimator {
    pub(crate) tuning: DriftTuning,
    pub(crate) state: DriftState,
}

impl CentroidEstimator {
    /// New estimator with no reference.
    pub fn new(tuning: DriftTuning) -> Self {
        Self {
            tuning,
            state: DriftState::default(),
        }
    }

    /// Shared drift state.
    pub fn state(&self) -> &DriftState {
        &self.state
    }

    pub(crate) fn start_new_stack(&mut self) {
        self.state.start_new_stack();
    }

    pub(crate) fn tally_slice(&mut self, center: Vector3, frame: &Frame) {
        self.state.note_slice(center, frame);

        let window = threshold_window(self.tuning.threshold, frame);
        let width = frame.width.max(1) as usize;
        let half_w = frame.width as f64 / 2.0;
        let half_h = frame.height as f64 / 2.0;
        let pixel = self.tuning.pixel_size;

        let acc = &mut self.state.stack;
        for (index, value) in frame.pixels().enumerate() {
            acc.total_pixels += 1;
            if let Some((lo, hi)) = window {
                if value < lo || value > hi {
                    continue;
                }
            }
            acc.counted_pixels += 1;
            if value <= 0.0 {
                continue;
            }
            let px = (index % width) as f64;
            let py = (index / width) as f64;
            let position = center
                + Vector3::new((px - half_w) * pixel, (py - half_h) * pixel, 0.0);
            acc.weighted_position += position * value;
            acc.intensity_sum += value;
        }
    }

    pub(crate) fn finish_stack(&mut self, initial: bool) -> Vector3 {
        let ratio = self.state.stack.counted_ratio();
        let centroid = self.state.stack.centroid();

        if initial {
            let reference = centroid
                .or_else(|| self.state.stack.center())
                .unwrap_or(Vector3::ZERO);
            self.state.set_reference(reference);
            return Vector3::ZERO;
        }

        match centroid {
            Some(raw) if ratio >= self.tuning.min_counted_ratio => {
                self.state.update(raw, &self.tuning)
            }
            _ => {
                warn!(
                    counted_ratio = ratio,
                    min_ratio = self.tuning.min_counted_ratio,
                    "Too few pixels passed the threshold; using reference position"
                );
                self.state.reset_to_reference()
            }
        }
    }
}
