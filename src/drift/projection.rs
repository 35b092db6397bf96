//! Projection-correlation drift estimator.
//!
//! Three projections are built incrementally while slices arrive:
//!
//! | View | Shape | Per slice |
//! |---|---|---|
//! | XY | `h x w` | running max (or sum for the average view) |
//! | XZ | `depth x w` | one appended row of column sums |
//! | ZY | `depth x h` | one appended row of row sums |
//!
//! Memory grows by one row per slice, never by a full frame. When a stack
//! finishes, each view is phase-correlated against the reference stack's view.
//! Every axis is seen by two views and the two estimates are averaged.
//!
//! A reviewer may nudge the suggested shift before it is accepted; without one
//! the suggestion is used directly.

use ndarray::{Array1, Array2, Axis as NdAxis};
use std::fmt;
use tracing::{info, warn};

use crate::config::XyProjection;
use crate::data::Frame;
use crate::drift::phase::phase_correlate;
use crate::drift::{DriftState, DriftTuning, Vector3};
use crate::error::AppResult;

/// Completed projections of one stack.
#[derive(Debug, Clone, PartialEq)]
pub struct Projections {
    /// XY view, `h x w`
    pub xy: Array2<f64>,
    /// XZ view, `depth x w`
    pub xz: Array2<f64>,
    /// ZY view, `depth x h`
    pub zy: Array2<f64>,
    /// Center of the first slice
    pub origin: Vector3,
    /// Signed Z distance between slices
    pub z_step: f64,
}

impl Projections {
    /// Shift of `self` relative to `reference` in pixels (x, y) and slices (z).
    pub fn measure_against(&self, reference: &Projections) -> AppResult<Vector3> {
        let xy = phase_correlate(&reference.xy, &self.xy)?;
        let xz = phase_correlate(&reference.xz, &self.xz)?;
        let zy = phase_correlate(&reference.zy, &self.zy)?;

        Ok(Vector3::new(
            (xy.col + xz.col) / 2.0,
            (xy.row + zy.col) / 2.0,
            (xz.row + zy.row) / 2.0,
        ))
    }

    /// Convert a pixel/slice shift to stage units.
    pub fn to_physical(&self, shift: Vector3, pixel_size: f64) -> Vector3 {
        Vector3::new(shift.x * pixel_size, shift.y * pixel_size, shift.z * self.z_step)
    }
}

#[derive(Debug, Clone, Default)]
struct ProjectionBuilder {
    xy: Option<Array2<f64>>,
    xz_rows: Vec<f64>,
    zy_rows: Vec<f64>,
    width: usize,
    height: usize,
    slices: usize,
}

impl ProjectionBuilder {
    fn push(&mut self, frame: &Frame, mode: XyProjection) {
        let image = frame.to_array();
        let (h, w) = image.dim();
        if self.slices > 0 && (h, w) != (self.height, self.width) {
            warn!(
                expected = ?(self.height, self.width),
                got = ?(h, w),
                "Frame size changed mid-stack; slice ignored by projection estimator"
            );
            return;
        }
        self.height = h;
        self.width = w;

        let column_sums: Array1<f64> = image.sum_axis(NdAxis(0));
        let row_sums: Array1<f64> = image.sum_axis(NdAxis(1));
        self.xz_rows.extend(column_sums.iter());
        self.zy_rows.extend(row_sums.iter());

        self.xy = Some(match self.xy.take() {
            None => image,
            Some(mut acc) => {
                match mode {
                    XyProjection::Max => acc.zip_mut_with(&image, |a, &b| *a = f64::max(*a, b)),
                    XyProjection::Average => acc += &image,
                }
                acc
            }
        });
        self.slices += 1;
    }

    fn finish(self, mode: XyProjection, origin: Vector3, z_step: f64) -> Option<Projections> {
        let mut xy = self.xy?;
        if mode == XyProjection::Average && self.slices > 0 {
            xy /= self.slices as f64;
        }
        let xz = Array2::from_shape_vec((self.slices, self.width), self.xz_rows).ok()?;
        let zy = Array2::from_shape_vec((self.slices, self.height), self.zy_rows).ok()?;
        Some(Projections {
            xy,
            xz,
            zy,
            origin,
            z_step,
        })
    }
}

/// Keys accepted by a [`NudgeSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NudgeKey {
    /// x - 1 pixel
    Left,
    /// x + 1 pixel
    Right,
    /// y - 1 pixel
    Up,
    /// y + 1 pixel
    Down,
    /// z - 1 slice
    Shallower,
    /// z + 1 slice
    Deeper,
    /// Back to the automatic suggestion
    Reset,
}

/// Residual of the current stack against the reference under a candidate shift.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffPreview {
    /// `|current(shifted) - reference|` over the XY view
    pub xy: Array2<f64>,
    /// Same over the XZ view
    pub xz: Array2<f64>,
    /// Same over the ZY view
    pub zy: Array2<f64>,
}

impl DiffPreview {
    /// Sum of all residuals.
    pub fn total(&self) -> f64 {
        self.xy.sum() + self.xz.sum() + self.zy.sum()
    }
}

fn shifted_difference(reference: &Array2<f64>, current: &Array2<f64>, dr: i64, dc: i64) -> Array2<f64> {
    let (rows, cols) = reference.dim();
    let (cur_rows, cur_cols) = current.dim();
    Array2::from_shape_fn((rows, cols), |(r, c)| {
        let sr = r as i64 + dr;
        let sc = c as i64 + dc;
        if sr < 0 || sc < 0 || sr >= cur_rows as i64 || sc >= cur_cols as i64 {
            0.0
        } else {
            (current[[sr as usize, sc as usize]] - reference[[r, c]]).abs()
        }
    })
}

/// Interactive adjustment of a suggested shift.
///
/// Shifts are in pixels (x, y) and slices (z).
pub struct NudgeSession<'a> {
    reference: &'a Projections,
    current: &'a Projections,
    suggested: Vector3,
    shift: Vector3,
}

impl<'a> NudgeSession<'a> {
    /// Start at the automatic suggestion.
    pub fn new(reference: &'a Projections, current: &'a Projections, suggested: Vector3) -> Self {
        Self {
            reference,
            current,
            suggested,
            shift: suggested,
        }
    }

    /// Automatically computed shift.
    pub fn suggested(&self) -> Vector3 {
        self.suggested
    }

    /// Shift after nudging.
    pub fn shift(&self) -> Vector3 {
        self.shift
    }

    /// Apply one key and return the new shift.
    pub fn apply(&mut self, key: NudgeKey) -> Vector3 {
        let delta = match key {
            NudgeKey::Left => Vector3::new(-1.0, 0.0, 0.0),
            NudgeKey::Right => Vector3::new(1.0, 0.0, 0.0),
            NudgeKey::Up => Vector3::new(0.0, -1.0, 0.0),
            NudgeKey::Down => Vector3::new(0.0, 1.0, 0.0),
            NudgeKey::Shallower => Vector3::new(0.0, 0.0, -1.0),
            NudgeKey::Deeper => Vector3::new(0.0, 0.0, 1.0),
            NudgeKey::Reset => {
                self.shift = self.suggested;
                return self.shift;
            }
        };
        self.shift += delta;
        self.shift
    }

    /// Residuals with the current stack moved back by the rounded shift.
    pub fn preview(&self) -> DiffPreview {
        let dx = self.shift.x.round() as i64;
        let dy = self.shift.y.round() as i64;
        let dz = self.shift.z.round() as i64;
        DiffPreview {
            xy: shifted_difference(&self.reference.xy, &self.current.xy, dy, dx),
            xz: shifted_difference(&self.reference.xz, &self.current.xz, dz, dx),
            zy: shifted_difference(&self.reference.zy, &self.current.zy, dz, dy),
        }
    }
}

/// Outcome of a review.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewDecision {
    /// Use the session's (possibly nudged) shift
    Accept,
    /// Discard this stack's estimate
    Discard,
}

/// Human or scripted reviewer of suggested shifts.
pub trait OffsetReviewer: Send {
    /// Inspect and optionally nudge the suggestion.
    fn review(&mut self, session: &mut NudgeSession<'_>) -> ReviewDecision;
}

/// Reviewer that replays a fixed key sequence, then accepts.
#[derive(Debug, Clone, Default)]
pub struct ScriptedReviewer {
    keys: Vec<NudgeKey>,
}

impl ScriptedReviewer {
    /// Replay `keys` on every review.
    pub fn new(keys: Vec<NudgeKey>) -> Self {
        Self { keys }
    }
}

impl OffsetReviewer for ScriptedReviewer {
    fn review(&mut self, session: &mut NudgeSession<'_>) -> ReviewDecision {
        for key in &self.keys {
            session.apply(*key);
        }
        ReviewDecision::Accept
    }
}

/// Projection-correlation estimator state for one row.
pub struct ProjectionEstimator {
    pub(crate) tuning: DriftTuning,
    pub(crate) state: DriftState,
    builder: ProjectionBuilder,
    reference: Option<Projections>,
    reviewer: Option<Box<dyn OffsetReviewer>>,
}

impl ProjectionEstimator {
    /// New estimator using the automatic suggestion as-is.
    pub fn new(tuning: DriftTuning) -> Self {
        Self {
            tuning,
            state: DriftState::default(),
            builder: ProjectionBuilder::default(),
            reference: None,
            reviewer: None,
        }
    }

    /// Route every suggestion through `reviewer` before it is accepted.
    pub fn with_reviewer(mut self, reviewer: Box<dyn OffsetReviewer>) -> Self {
        self.reviewer = Some(reviewer);
        self
    }

    /// Shared drift state.
    pub fn state(&self) -> &DriftState {
        &self.state
    }

    /// Projections of the row's first stack.
    pub fn reference(&self) -> Option<&Projections> {
        self.reference.as_ref()
    }

    pub(crate) fn start_new_stack(&mut self) {
        self.state.start_new_stack();
        self.builder = ProjectionBuilder::default();
    }

    pub(crate) fn tally_slice(&mut self, center: Vector3, frame: &Frame) {
        self.state.note_slice(center, frame);
        self.builder.push(frame, self.tuning.xy_projection);
    }

    pub(crate) fn finish_stack(&mut self, initial: bool) -> Vector3 {
        let origin = self
            .state
            .stack
            .slice_centers
            .first()
            .copied()
            .unwrap_or(Vector3::ZERO);
        let z_step = self.state.stack.z_step();
        let builder = std::mem::take(&mut self.builder);

        let Some(current) = builder.finish(self.tuning.xy_projection, origin, z_step) else {
            warn!("Projection estimator has no usable slices; drift correction skipped");
            return if initial {
                self.state.set_reference(origin);
                Vector3::ZERO
            } else {
                self.state.reset_to_reference()
            };
        };

        if initial || self.reference.is_none() {
            self.state.set_reference(origin);
            self.reference = Some(current);
            return Vector3::ZERO;
        }
        let Some(reference) = self.reference.as_ref() else {
            return self.state.hold();
        };

        let suggested = match current.measure_against(reference) {
            Ok(shift) if shift.is_finite() => shift,
            Ok(_) | Err(_) => {
                warn!(
                    origin = %origin,
                    "Phase correlation did not converge; using zero drift offset"
                );
                return self.state.reset_to_reference();
            }
        };

        let shift = match self.reviewer.as_mut() {
            None => suggested,
            Some(reviewer) => {
                let mut session = NudgeSession::new(reference, &current, suggested);
                match reviewer.review(&mut session) {
                    ReviewDecision::Accept => {
                        if session.shift() != suggested {
                            info!(suggested = %suggested, accepted = %session.shift(), "Drift shift nudged");
                        }
                        session.shift()
                    }
                    ReviewDecision::Discard => {
                        info!("Drift suggestion discarded by reviewer");
                        return self.state.hold();
                    }
                }
            }
        };

        let raw = origin + current.to_physical(shift, self.tuning.pixel_size);
        self.state.update(raw, &self.tuning)
    }
}

impl fmt::Debug for ProjectionEstimator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProjectionEstimator")
            .field("tuning", &self.tuning)
            .field("state", &self.state)
            .field("has_reference", &self.reference.is_some())
            .field("has_reviewer", &self.reviewer.is_some())
            .finish()
    }
}
