//! Run parameters.
//!
//! `RunParameters` is built once per run by the caller and consumed by
//! `AcquisitionSequencer::run`. Nothing in it changes while the run executes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::config::AcquisitionConfig;
use crate::data::Frame;
use crate::drift::{DriftEstimator, DriftTuning};
use crate::error::{AppResult, DaqError};
use crate::experiment::generator::RowGenerator;
use crate::experiment::range::AxisRange;
use crate::experiment::row::{RowId, RowSpec};
use crate::sink::{OutputSink, SliceTags};

/// Where the rows of a run come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunPlan {
    /// Rows given one by one
    Explicit {
        /// The rows
        rows: Vec<RowSpec>,
    },
    /// Rows generated from four ranges
    Generated(RowGenerator),
}

impl RunPlan {
    /// Resolve the plan into its row list.
    pub fn rows(&self) -> Vec<RowSpec> {
        match self {
            RunPlan::Explicit { rows } => rows.clone(),
            RunPlan::Generated(generator) => generator.generate(),
        }
    }
}

/// One progress notification.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressUpdate {
    /// Time point index
    pub timepoint: u32,
    /// Row index within the time point
    pub row: usize,
    /// Overall fraction in `[0, 1]`, non-decreasing over a run
    pub fraction: f64,
}

/// Receives progress on the control thread.
pub type ProgressCallback = Box<dyn FnMut(ProgressUpdate) + Send>;

/// Receives every continuously streamed frame on the pump thread.
pub type PreviewCallback = Arc<dyn Fn(&Frame, &SliceTags) + Send + Sync>;

/// Creates the drift estimator of a row on its first use.
pub trait DriftEstimatorFactory: Send {
    /// Build the estimator for `row`.
    fn create(&mut self, config: &AcquisitionConfig, row: RowId, spec: &RowSpec) -> DriftEstimator;
}

impl<F> DriftEstimatorFactory for F
where
    F: FnMut(&AcquisitionConfig, RowId, &RowSpec) -> DriftEstimator + Send,
{
    fn create(&mut self, config: &AcquisitionConfig, row: RowId, spec: &RowSpec) -> DriftEstimator {
        self(config, row, spec)
    }
}

/// Factory giving every row an intensity-centroid estimator.
pub fn centroid_factory() -> Box<dyn DriftEstimatorFactory> {
    Box::new(|config: &AcquisitionConfig, _row: RowId, _spec: &RowSpec| {
        DriftEstimator::centroid(DriftTuning::from(&config.drift))
    })
}

/// Factory giving every row a projection-correlation estimator.
pub fn projection_factory() -> Box<dyn DriftEstimatorFactory> {
    Box::new(|config: &AcquisitionConfig, _row: RowId, _spec: &RowSpec| {
        DriftEstimator::projection(DriftTuning::from(&config.drift))
    })
}

/// Full description of one run.
pub struct RunParameters {
    /// Rows, in acquisition order
    pub rows: Vec<RowSpec>,
    /// Number of time points
    pub time_seq_count: u32,
    /// Seconds between time point starts
    pub time_step_seconds: f64,
    /// Capture from free-running streaming instead of synchronous snaps
    pub continuous: bool,
    /// Fixed wait after each Z move, milliseconds
    pub settle_delay_ms: u32,
    /// Keep the shutter open for the whole stack
    pub illuminate_full_stack: bool,
    /// Drift estimator factory; no drift correction when absent
    pub drift_factory: Option<Box<dyn DriftEstimatorFactory>>,
    /// Output sink
    pub sink: Box<dyn OutputSink>,
    /// Progress callback
    pub progress: Option<ProgressCallback>,
    /// Live preview of streamed frames
    pub preview: Option<PreviewCallback>,
}

impl RunParameters {
    /// Start building parameters that write to `sink`.
    pub fn builder(sink: Box<dyn OutputSink>) -> RunParametersBuilder {
        RunParametersBuilder {
            params: RunParameters {
                rows: Vec::new(),
                time_seq_count: 1,
                time_step_seconds: 0.0,
                continuous: false,
                settle_delay_ms: 0,
                illuminate_full_stack: false,
                drift_factory: None,
                sink,
                progress: None,
                preview: None,
            },
        }
    }

    /// Planned stacks, `rows × time points`.
    pub fn total_units(&self) -> usize {
        self.rows.len() * self.time_seq_count as usize
    }

    fn validate(&self) -> AppResult<()> {
        if self.rows.is_empty() {
            return Err(DaqError::Configuration("run has no rows".into()));
        }
        if self.time_seq_count == 0 {
            return Err(DaqError::Configuration(
                "time_seq_count must be at least 1".into(),
            ));
        }
        if !self.time_step_seconds.is_finite() || self.time_step_seconds < 0.0 {
            return Err(DaqError::Configuration(format!(
                "invalid time step {}",
                self.time_step_seconds
            )));
        }
        for (i, row) in self.rows.iter().enumerate() {
            if let AxisRange::Sweep { velocity, .. } = row.z {
                if !(velocity.is_finite() && velocity > 0.0) {
                    return Err(DaqError::Configuration(format!(
                        "row {i} sweeps at velocity {velocity}; it must be positive and finite"
                    )));
                }
            }
            row.z.validate()?;
            if !(row.x.is_finite() && row.y.is_finite() && row.angle.is_finite()) {
                return Err(DaqError::Configuration(format!(
                    "row {i} has a non-finite stage position"
                )));
            }
        }
        if !self.continuous {
            if let Some((i, _)) = self.rows.iter().enumerate().find(|(_, r)| r.is_sweep()) {
                return Err(DaqError::Configuration(format!(
                    "row {i} is a sweep, which requires continuous mode"
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for RunParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunParameters")
            .field("rows", &self.rows.len())
            .field("time_seq_count", &self.time_seq_count)
            .field("time_step_seconds", &self.time_step_seconds)
            .field("continuous", &self.continuous)
            .field("settle_delay_ms", &self.settle_delay_ms)
            .field("illuminate_full_stack", &self.illuminate_full_stack)
            .field("drift", &self.drift_factory.is_some())
            .finish()
    }
}

/// Builder for [`RunParameters`].
pub struct RunParametersBuilder {
    params: RunParameters,
}

impl RunParametersBuilder {
    /// Use an explicit row list.
    pub fn rows(mut self, rows: Vec<RowSpec>) -> Self {
        self.params.rows = rows;
        self
    }

    /// Resolve rows from a plan.
    pub fn plan(mut self, plan: &RunPlan) -> Self {
        self.params.rows = plan.rows();
        self
    }

    /// Time series of `count` points, `step_seconds` apart.
    pub fn time_series(mut self, count: u32, step_seconds: f64) -> Self {
        self.params.time_seq_count = count;
        self.params.time_step_seconds = step_seconds;
        self
    }

    /// Capture through continuous streaming.
    pub fn continuous(mut self, enabled: bool) -> Self {
        self.params.continuous = enabled;
        self
    }

    /// Fixed wait after each Z move.
    pub fn settle_delay_ms(mut self, delay: u32) -> Self {
        self.params.settle_delay_ms = delay;
        self
    }

    /// Keep the shutter open for whole stacks.
    pub fn illuminate_full_stack(mut self, enabled: bool) -> Self {
        self.params.illuminate_full_stack = enabled;
        self
    }

    /// Enable drift correction.
    pub fn drift(mut self, factory: Box<dyn DriftEstimatorFactory>) -> Self {
        self.params.drift_factory = Some(factory);
        self
    }

    /// Report progress.
    pub fn on_progress(mut self, callback: ProgressCallback) -> Self {
        self.params.progress = Some(callback);
        self
    }

    /// Preview streamed frames.
    pub fn on_preview(mut self, callback: PreviewCallback) -> Self {
        self.params.preview = Some(callback);
        self
    }

    /// Validate and finish.
    pub fn build(self) -> AppResult<RunParameters> {
        self.params.validate()?;
        Ok(self.params)
    }
}
