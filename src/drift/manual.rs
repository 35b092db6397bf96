//! Manual drift estimator.
//!
//! The stack is kept in memory. When it finishes, a max-intensity view is handed
//! to a [`RoiPicker`] and the control thread blocks until the pick comes back.
//! The picked pixel and slice index map to a stage position exactly like a
//! centroid pixel does.
//!
//! [`ChannelPicker`] is the rendezvous used with an external UI: each request is
//! sent over a tokio channel together with a oneshot reply slot. It must be used
//! from a plain thread, never from inside an async runtime.

use ndarray::Array2;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::data::Frame;
use crate::drift::{DriftState, DriftTuning, Vector3};
use crate::error::{AppResult, DaqError};

/// What the picker is asked to look at.
#[derive(Debug, Clone)]
pub struct PickRequest {
    /// Max-intensity projection of the stack, `h x w`
    pub mip: Array2<f64>,
    /// Slices in the stack
    pub depth: usize,
    /// First stack of the row
    pub initial: bool,
}

/// Selected region center.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoiPick {
    /// Column of the ROI center, pixels
    pub x: f64,
    /// Row of the ROI center, pixels
    pub y: f64,
    /// Slice holding the region
    pub slice: usize,
}

/// External pick operation.
///
/// `Ok(None)` means the user declined to pick; the previous estimate is kept.
pub trait RoiPicker: Send {
    /// Block until a region is selected.
    fn pick(&mut self, request: PickRequest) -> AppResult<Option<RoiPick>>;
}

/// A pending pick delivered to the UI side of a [`ChannelPicker`].
#[derive(Debug)]
pub struct PickJob {
    /// Stack to pick on
    pub request: PickRequest,
    /// Answer slot
    pub reply: oneshot::Sender<Option<RoiPick>>,
}

/// Picker forwarding requests to whoever holds the job receiver.
#[derive(Debug, Clone)]
pub struct ChannelPicker {
    jobs: mpsc::Sender<PickJob>,
}

impl ChannelPicker {
    /// Create a picker and the receiver its jobs arrive on.
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<PickJob>) {
        let (jobs, rx) = mpsc::channel(buffer.max(1));
        (Self { jobs }, rx)
    }
}

impl RoiPicker for ChannelPicker {
    fn pick(&mut self, request: PickRequest) -> AppResult<Option<RoiPick>> {
        let (reply, answer) = oneshot::channel();
        self.jobs
            .blocking_send(PickJob { request, reply })
            .map_err(|_| DaqError::PickCancelled)?;
        answer.blocking_recv().map_err(|_| DaqError::PickCancelled)
    }
}

/// Manual estimator state for one row.
pub struct ManualEstimator {
    pub(crate) tuning: DriftTuning,
    pub(crate) state: DriftState,
    frames: Vec<Frame>,
    picker: Box<dyn RoiPicker>,
}

impl ManualEstimator {
    /// New estimator asking `picker` at the end of every stack.
    pub fn new(tuning: DriftTuning, picker: Box<dyn RoiPicker>) -> Self {
        Self {
            tuning,
            state: DriftState::default(),
            frames: Vec::new(),
            picker,
        }
    }

    /// Shared drift state.
    pub fn state(&self) -> &DriftState {
        &self.state
    }

    pub(crate) fn start_new_stack(&mut self) {
        self.state.start_new_stack();
        self.frames.clear();
    }

    pub(crate) fn tally_slice(&mut self, center: Vector3, frame: &Frame) {
        self.state.note_slice(center, frame);
        self.frames.push(frame.clone());
    }

    fn max_projection(&self) -> Array2<f64> {
        let mut frames = self.frames.iter();
        let Some(first) = frames.next() else {
            return Array2::zeros((0, 0));
        };
        let mut mip = first.to_array();
        for frame in frames {
            let image = frame.to_array();
            if image.dim() == mip.dim() {
                mip.zip_mut_with(&image, |a, &b| *a = f64::max(*a, b));
            }
        }
        mip
    }

    /// Stage position of a picked region.
    fn locate(&self, pick: RoiPick) -> Option<Vector3> {
        let centers = &self.state.stack.slice_centers;
        let center = centers.get(pick.slice.min(centers.len().checked_sub(1)?))?;
        let first = self.frames.first()?;
        let half_w = first.width as f64 / 2.0;
        let half_h = first.height as f64 / 2.0;
        let pixel = self.tuning.pixel_size;
        Some(*center + Vector3::new((pick.x - half_w) * pixel, (pick.y - half_h) * pixel, 0.0))
    }

    pub(crate) fn finish_stack(&mut self, initial: bool) -> Vector3 {
        let request = PickRequest {
            mip: self.max_projection(),
            depth: self.frames.len(),
            initial,
        };

        let picked = match self.picker.pick(request) {
            Ok(pick) => pick.and_then(|p| self.locate(p)),
            Err(e) => {
                warn!(error = %e, "Region pick failed; keeping previous drift estimate");
                None
            }
        };
        self.frames.clear();

        match (picked, initial) {
            (Some(position), true) => {
                info!(reference = %position, "Manual drift reference picked");
                self.state.set_reference(position);
                Vector3::ZERO
            }
            (None, true) => {
                let center = self.state.stack.center().unwrap_or(Vector3::ZERO);
                self.state.set_reference(center);
                Vector3::ZERO
            }
            (Some(position), false) => self.state.update(position, &self.tuning),
            (None, false) => self.state.hold(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drift::DriftEstimator;

    struct FixedPicker(Vec<Option<RoiPick>>);

    impl RoiPicker for FixedPicker {
        fn pick(&mut self, request: PickRequest) -> AppResult<Option<RoiPick>> {
            assert!(request.depth > 0);
            Ok(if self.0.is_empty() { None } else { self.0.remove(0) })
        }
    }

    fn stack(estimator: &mut DriftEstimator, initial: bool) -> Vector3 {
        estimator.start_new_stack();
        for z in 0..4 {
            estimator.tally_slice(
                Vector3::new(0.0, 0.0, z as f64 * 5.0),
                &Frame::from_u16(10, 10, &vec![1; 100]),
            );
        }
        estimator.finish_stack(initial)
    }

    #[test]
    fn pick_maps_pixel_and_slice_to_stage() {
        let tuning = DriftTuning {
            pixel_size: 2.0,
            ..Default::default()
        };
        let picks = vec![
            Some(RoiPick { x: 5.0, y: 5.0, slice: 1 }),
            Some(RoiPick { x: 7.0, y: 4.0, slice: 3 }),
        ];
        let mut estimator = DriftEstimator::manual(tuning, Box::new(FixedPicker(picks)));
        assert_eq!(stack(&mut estimator, true), Vector3::ZERO);
        assert_eq!(estimator.state().reference, Some(Vector3::new(0.0, 0.0, 5.0)));

        let offset = stack(&mut estimator, false);
        assert_eq!(offset, Vector3::new(4.0, -2.0, 10.0));
    }

    #[test]
    fn declined_pick_keeps_estimate() {
        let picks = vec![Some(RoiPick { x: 5.0, y: 5.0, slice: 0 }), None];
        let mut estimator =
            DriftEstimator::manual(DriftTuning::default(), Box::new(FixedPicker(picks)));
        stack(&mut estimator, true);
        assert_eq!(stack(&mut estimator, false), Vector3::ZERO);
        assert_eq!(estimator.state().stacks_completed, 2);
    }

    #[test]
    fn channel_picker_rendezvous() {
        let (picker, mut jobs) = ChannelPicker::channel(1);
        let ui = std::thread::spawn(move || {
            let job = jobs.blocking_recv().unwrap();
            assert_eq!(job.request.depth, 4);
            job.reply
                .send(Some(RoiPick { x: 6.0, y: 5.0, slice: 0 }))
                .unwrap();
            let job = jobs.blocking_recv().unwrap();
            job.reply.send(Some(RoiPick { x: 8.0, y: 5.0, slice: 0 })).unwrap();
        });

        let mut estimator = DriftEstimator::manual(DriftTuning::default(), Box::new(picker));
        stack(&mut estimator, true);
        let offset = stack(&mut estimator, false);
        ui.join().unwrap();
        assert_eq!(offset, Vector3::new(2.0, 0.0, 0.0));
    }

    #[test]
    fn dropped_ui_cancels_pick() {
        let (mut picker, jobs) = ChannelPicker::channel(1);
        drop(jobs);
        let request = PickRequest {
            mip: Array2::zeros((1, 1)),
            depth: 1,
            initial: true,
        };
        assert!(matches!(picker.pick(request), Err(DaqError::PickCancelled)));
    }
}
