//! Acquisition planning and execution.
//!
//! Rows describe what to acquire, `RunParameters` describe how, and the
//! `AcquisitionSequencer` executes them against a `Microscope`.

pub mod generator;
pub mod motion;
pub mod params;
pub mod pump;
pub mod range;
pub mod row;
pub mod sequencer;
pub mod state;

pub use generator::{RangeSpec, RotationCalibration, RowGenerator};
pub use motion::{GoalOutcome, GoalWait};
pub use params::{
    centroid_factory, projection_factory, DriftEstimatorFactory, PreviewCallback,
    ProgressCallback, ProgressUpdate, RunParameters, RunParametersBuilder, RunPlan,
};
pub use pump::{ContinuousPump, PosePublisher, PumpedFrame};
pub use range::AxisRange;
pub use row::{RowId, RowSpec, StackAxis};
pub use sequencer::AcquisitionSequencer;
pub use state::{CancelToken, RunReport, RunStatus, SequencerState, StateHandle};
