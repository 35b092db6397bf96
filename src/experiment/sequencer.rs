//! Acquisition sequencer.
//!
//! The `AcquisitionSequencer` drives one microscope through every row of every
//! time point on the calling thread. It owns the device for the lifetime of a
//! run and reports the outcome as a [`RunReport`]; no error escapes `run`.
//!
//! # Architecture
//!
//! ```text
//!  control thread ──moves/snaps──> Microscope
//!       │                              │ ring buffer (continuous mode)
//!       │ begin/slice/finish           ▼
//!       └──────────> AsyncSinkWrapper <── ContinuousPump ("continuous-pump")
//!                          │
//!                          ▼ "sink-writer"
//!                      OutputSink
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use lightsheet_daq::prelude::*;
//!
//! let (sink, handle) = MemorySink::new();
//! let params = RunParameters::builder(Box::new(sink))
//!     .rows(vec!["0,0,0,0:1:10".parse()?])
//!     .time_series(3, 60.0)
//!     .drift(centroid_factory())
//!     .build()?;
//!
//! let mut sequencer = AcquisitionSequencer::new(MockMicroscope::new(64, 64), config);
//! let report = sequencer.run(params);
//! println!("{}: {} slices", report.status, report.slices_captured);
//! ```

use anyhow::anyhow;
use chrono::Utc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::config::AcquisitionConfig;
use crate::data::Frame;
use crate::drift::{DriftEstimator, Vector3};
use crate::error::{AppResult, DaqError, HardwareResultExt};
use crate::experiment::motion::{
    cancellable_sleep, creep_relocate, move_at_velocity, travel_time, GoalOutcome, GoalWait,
};
use crate::experiment::params::{
    DriftEstimatorFactory, ProgressCallback, ProgressUpdate, RunParameters,
};
use crate::experiment::pump::{ContinuousPump, PosePublisher, PumpedFrame};
use crate::experiment::range::AxisRange;
use crate::experiment::row::{RowId, RowSpec, StackAxis};
use crate::experiment::state::{
    CancelToken, RunReport, RunStatus, SequencerState, StateHandle,
};
use crate::hardware::{Axis, Microscope};
use crate::sink::{AsyncSinkWrapper, OutputSink, SinkProducer, SliceTags};

/// Multi-dimensional acquisition sequencer with per-row drift correction.
pub struct AcquisitionSequencer<M: Microscope> {
    device: M,
    config: AcquisitionConfig,
    cancel: CancelToken,
    state: StateHandle,
}

impl<M: Microscope> AcquisitionSequencer<M> {
    /// Take ownership of `device`.
    pub fn new(device: M, config: AcquisitionConfig) -> Self {
        Self {
            device,
            config,
            cancel: CancelToken::new(),
            state: StateHandle::default(),
        }
    }

    /// Token that cancels the current run from any thread.
    ///
    /// The token is cleared when a run begins.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Observer handle for the sequencer state.
    pub fn state_handle(&self) -> StateHandle {
        self.state.clone()
    }

    /// Current state.
    pub fn state(&self) -> SequencerState {
        self.state.get()
    }

    /// Run configuration.
    pub fn config(&self) -> &AcquisitionConfig {
        &self.config
    }

    /// The driven device.
    pub fn device(&self) -> &M {
        &self.device
    }

    /// Give the device back.
    pub fn into_device(self) -> M {
        self.device
    }

    /// Execute a full run and report how it ended.
    pub fn run(&mut self, params: RunParameters) -> RunReport {
        let run_uid = Uuid::new_v4();
        let span = info_span!("acquisition", run = %run_uid);
        let _enter = span.enter();

        self.cancel.reset();
        let started_at = Utc::now();
        let clock = Instant::now();
        info!(
            rows = params.rows.len(),
            timepoints = params.time_seq_count,
            continuous = params.continuous,
            "Acquisition starting"
        );

        let prepared = Run::prepare(
            &self.device,
            &self.config,
            &self.cancel,
            &self.state,
            params,
            clock,
        );
        let mut run = match prepared {
            Ok(run) => run,
            Err(e) => {
                error!(error = %e, "Acquisition could not start");
                self.state.set(SequencerState::Aborted);
                return RunReport {
                    run_uid,
                    status: RunStatus::Failed(e),
                    started_at,
                    elapsed: clock.elapsed(),
                    slices_captured: 0,
                    stacks_completed: 0,
                    sink: Default::default(),
                    drift_offsets: Vec::new(),
                };
            }
        };

        let outcome = run.execute();
        let status = run.teardown(outcome);

        match &status {
            RunStatus::Completed => info!(
                slices = run.slices,
                stacks = run.stacks,
                elapsed_s = clock.elapsed().as_secs_f64(),
                "Acquisition completed"
            ),
            RunStatus::Cancelled => warn!(slices = run.slices, "Acquisition cancelled"),
            RunStatus::Failed(e) => error!(error = %e, "Acquisition failed"),
        }

        RunReport {
            run_uid,
            status,
            started_at,
            elapsed: clock.elapsed(),
            slices_captured: run.slices,
            stacks_completed: run.stacks,
            sink: run.sink.result(),
            drift_offsets: run.drift_offsets(),
        }
    }
}

/// Continuous-mode plumbing alive for one run.
struct PumpLink {
    pump: ContinuousPump,
    pose: PosePublisher,
    tap: Option<UnboundedReceiver<PumpedFrame>>,
}

/// How one stack ended.
enum StackEnd {
    Complete,
    Cancelled,
}

/// Per-run working state on the control thread.
struct Run<'a, M: Microscope> {
    device: &'a M,
    config: &'a AcquisitionConfig,
    cancel: &'a CancelToken,
    state: &'a StateHandle,
    clock: Instant,

    rows: Vec<RowSpec>,
    time_seq_count: u32,
    time_step: Duration,
    settle_delay: Duration,
    hold_shutter: bool,
    factory: Option<Box<dyn DriftEstimatorFactory>>,
    progress: Option<ProgressCallback>,

    sink: Box<dyn OutputSink>,
    pump: Option<PumpLink>,
    estimators: Vec<Option<DriftEstimator>>,
    poll: Duration,

    auto_shutter_before: Option<bool>,
    streaming: bool,
    last_fraction: f64,
    last_position: (u32, usize),
    slices: usize,
    stacks: usize,
}

impl<'a, M: Microscope> Run<'a, M> {
    fn prepare(
        device: &'a M,
        config: &'a AcquisitionConfig,
        cancel: &'a CancelToken,
        state: &'a StateHandle,
        params: RunParameters,
        clock: Instant,
    ) -> AppResult<Self> {
        let RunParameters {
            rows,
            time_seq_count,
            time_step_seconds,
            continuous,
            settle_delay_ms,
            illuminate_full_stack,
            drift_factory,
            sink,
            progress,
            preview,
        } = params;

        let mut sink = sink;
        let mut pump = None;
        if config.pipeline.enabled || continuous {
            let (width, height) = device.resolution();
            let bytes_per_pixel = device.bit_depth().div_ceil(8).max(1) as usize;
            let frame_bytes = width as usize * height as usize * bytes_per_pixel;
            let wrapper = AsyncSinkWrapper::with_memory_budget(sink, frame_bytes, &config.pipeline)?;
            if continuous {
                pump = Some(start_pump(
                    device,
                    config,
                    wrapper.producer(),
                    preview,
                    drift_factory.is_some(),
                    clock,
                )?);
            }
            sink = Box::new(wrapper);
        }

        Ok(Self {
            device,
            config,
            cancel,
            state,
            clock,
            estimators: rows.iter().map(|_| None).collect(),
            rows,
            time_seq_count,
            time_step: Duration::from_secs_f64(time_step_seconds),
            settle_delay: Duration::from_millis(u64::from(settle_delay_ms)),
            hold_shutter: illuminate_full_stack || continuous,
            factory: drift_factory,
            progress,
            sink,
            pump,
            poll: Duration::from_millis(config.motion.poll_interval_ms.max(1)),
            auto_shutter_before: None,
            streaming: false,
            last_fraction: 0.0,
            last_position: (0, 0),
            slices: 0,
            stacks: 0,
        })
    }

    fn transition(&self, next: SequencerState) {
        let from = self.state.get();
        if !self.state.set(next) {
            warn!(%from, to = %next, "Unexpected sequencer transition");
        }
    }

    fn total_units(&self) -> f64 {
        (self.rows.len() * self.time_seq_count as usize).max(1) as f64
    }

    fn report_progress(&mut self, timepoint: u32, row: usize, units: f64) {
        let fraction = (units / self.total_units()).clamp(0.0, 1.0).max(self.last_fraction);
        self.last_fraction = fraction;
        self.last_position = (timepoint, row);
        if let Some(callback) = self.progress.as_mut() {
            callback(ProgressUpdate {
                timepoint,
                row,
                fraction,
            });
        }
    }

    /// `Ok(true)` when every stack ran, `Ok(false)` when cancelled.
    fn execute(&mut self) -> AppResult<bool> {
        let rows = self.rows.len();
        for timepoint in 0..self.time_seq_count {
            self.transition(SequencerState::ForTimepoint);
            let due = self.time_step * timepoint;
            if let Some(wait) = due.checked_sub(self.clock.elapsed()) {
                debug!(timepoint, wait_s = wait.as_secs_f64(), "Waiting for time point");
                if !cancellable_sleep(wait, self.cancel, self.poll) {
                    return Ok(false);
                }
            }
            info!(timepoint, "Time point started");

            for row in 0..rows {
                if self.cancel.is_cancelled() {
                    return Ok(false);
                }
                self.transition(SequencerState::ForRow);
                let end = self.acquire_row(timepoint, row)?;
                self.check_pump()?;
                if let StackEnd::Cancelled = end {
                    return Ok(false);
                }
                let done = (timepoint as usize * rows + row + 1) as f64;
                self.report_progress(timepoint, row, done);
            }
            self.transition(SequencerState::NextTimepoint);
        }
        Ok(true)
    }

    fn check_pump(&self) -> AppResult<()> {
        match &self.pump {
            Some(link) if !link.pump.is_alive() => Err(DaqError::PumpFailed(
                link.pump
                    .failure()
                    .unwrap_or_else(|| "continuous pump exited".into()),
            )),
            _ => Ok(()),
        }
    }

    fn estimator_for(&mut self, row: usize) -> Option<&mut DriftEstimator> {
        if self.estimators[row].is_none() {
            if let Some(factory) = self.factory.as_mut() {
                let estimator = factory.create(self.config, RowId(row), &self.rows[row]);
                debug!(row, kind = %estimator.kind(), "Drift estimator created");
                self.estimators[row] = Some(estimator);
            }
        }
        self.estimators[row].as_mut()
    }

    fn acquire_row(&mut self, timepoint: u32, row: usize) -> AppResult<StackEnd> {
        let spec = self.rows[row];
        let offset = match self.estimator_for(row) {
            Some(estimator) if estimator.state().has_reference() => Some(estimator.offset()),
            _ => None,
        };
        let correction = offset.unwrap_or(Vector3::ZERO);
        let x = spec.x + correction.x;
        let y = spec.y + correction.y;
        let range = spec.z.shifted(correction.z);

        if let GoalOutcome::Cancelled = self.position_row(&spec, offset)? {
            return Ok(StackEnd::Cancelled);
        }
        if let Some(estimator) = self.estimator_for(row) {
            estimator.start_new_stack();
        }

        let axis = StackAxis {
            row: RowId(row),
            timepoint,
            axis: Axis::Z,
            range,
        };
        debug!(row, timepoint, range = %range, "Stack starting");
        self.sink.begin_stack(&axis)?;

        if self.hold_shutter {
            if self.auto_shutter_before.is_none() {
                self.auto_shutter_before = Some(self.device.auto_shutter().hw("auto_shutter")?);
            }
            self.device
                .set_auto_shutter(false)
                .hw("set_auto_shutter")?;
            self.device
                .set_shutter_open(true)
                .hw("set_shutter_open")?;
        }

        let stream_base = self.begin_stream(x, y, spec.angle)?;

        let mut captured = 0;
        let end = match range {
            AxisRange::Single { position } => {
                self.transition(SequencerState::SinglePos);
                self.capture_at(row, x, y, spec.angle, position, &mut captured)?
            }
            AxisRange::Stepped { .. } => {
                self.transition(SequencerState::SteppedZLoop);
                let positions = range.positions();
                let depth = positions.len().max(1) as f64;
                let done = (timepoint as usize * self.rows.len() + row) as f64;
                let mut end = StackEnd::Complete;
                for (k, z) in positions.into_iter().enumerate() {
                    if self.cancel.is_cancelled() {
                        end = StackEnd::Cancelled;
                        break;
                    }
                    if let StackEnd::Cancelled =
                        self.capture_at(row, x, y, spec.angle, z, &mut captured)?
                    {
                        end = StackEnd::Cancelled;
                        break;
                    }
                    self.report_progress(timepoint, row, done + (k + 1) as f64 / depth);
                }
                end
            }
            AxisRange::Sweep {
                start,
                end,
                velocity,
            } => {
                self.transition(SequencerState::SweepZ);
                self.sweep(start, end, velocity)?
            }
        };

        if let Some(base) = stream_base {
            captured += self.end_stream(row, base)?;
        }
        if self.hold_shutter {
            self.device
                .set_shutter_open(false)
                .hw("set_shutter_open")?;
        }

        self.transition(SequencerState::FinalizeStack);
        self.sink.finalize_stack(captured)?;
        self.stacks += 1;
        debug!(row, timepoint, depth = captured, "Stack finalized");

        match end {
            StackEnd::Complete => {
                if let Some(estimator) = self.estimator_for(row) {
                    let offset = estimator.finish_stack(timepoint == 0);
                    info!(row, timepoint, offset = %offset, "Drift offset updated");
                }
            }
            StackEnd::Cancelled => {
                debug!(row, depth = captured, "Partial stack kept; drift estimate unchanged");
            }
        }
        Ok(end)
    }

    /// Move to the row's start pose, creeping the corrected axes into place.
    fn position_row(&self, spec: &RowSpec, offset: Option<Vector3>) -> AppResult<GoalOutcome> {
        let device = self.device;
        device.move_abs(Axis::Theta, spec.angle).hw("move_abs(Theta)")?;
        device.wait_settled(Axis::Theta).hw("wait_settled(Theta)")?;

        let moves = [
            (Axis::X, spec.x, offset.map(|o| o.x)),
            (Axis::Y, spec.y, offset.map(|o| o.y)),
            (Axis::Z, spec.z.start(), offset.map(|o| o.z)),
        ];
        for (axis, base, correction) in moves {
            match correction {
                Some(delta) => {
                    let outcome =
                        creep_relocate(device, axis, base, delta, &self.config.motion, self.cancel)
                            .hw(&format!("creep_relocate({axis})"))?;
                    match outcome {
                        GoalOutcome::Reached => {}
                        GoalOutcome::Cancelled => return Ok(GoalOutcome::Cancelled),
                        GoalOutcome::TimedOut => {
                            return Err(DaqError::hardware(
                                format!("creep_relocate({axis})"),
                                anyhow!("{axis} did not reach {} in time", base + delta),
                            ))
                        }
                    }
                }
                None => {
                    device.move_abs(axis, base).hw(&format!("move_abs({axis})"))?;
                    device
                        .wait_settled(axis)
                        .hw(&format!("wait_settled({axis})"))?;
                }
            }
        }
        Ok(GoalOutcome::Reached)
    }

    /// Move Z, settle, and capture one slice (or let the pump capture it).
    fn capture_at(
        &mut self,
        row: usize,
        x: f64,
        y: f64,
        angle: f64,
        z: f64,
        captured: &mut usize,
    ) -> AppResult<StackEnd> {
        self.device.move_abs(Axis::Z, z).hw("move_abs(Z)")?;
        self.device.wait_settled(Axis::Z).hw("wait_settled(Z)")?;
        if !self.settle_delay.is_zero()
            && !cancellable_sleep(self.settle_delay, self.cancel, self.poll)
        {
            return Ok(StackEnd::Cancelled);
        }

        if let Some(link) = &self.pump {
            link.pose.set_z(z);
            return Ok(StackEnd::Complete);
        }

        let frame = self.device.snap_frame().hw("snap_frame")?;
        let tags = SliceTags {
            x,
            y,
            z,
            angle,
            elapsed_s: self.clock.elapsed().as_secs_f64(),
        };
        self.tally(row, Vector3::new(x, y, z), &frame);
        self.sink.process_slice(frame, tags)?;
        *captured += 1;
        self.slices += 1;
        Ok(StackEnd::Complete)
    }

    fn tally(&mut self, row: usize, center: Vector3, frame: &Frame) {
        if let Some(estimator) = self.estimators[row].as_mut() {
            estimator.tally_slice(center, frame);
        }
    }

    /// Sweep Z from `start` to `end`; frames come from the pump.
    fn sweep(&mut self, start: f64, end: f64, velocity: f64) -> AppResult<StackEnd> {
        let travel = travel_time(end - start, velocity).ok_or_else(|| {
            DaqError::Configuration(format!(
                "sweep {start}-{end} at velocity {velocity} has no finite duration"
            ))
        })?;
        if let Some(link) = &self.pump {
            link.pose.begin_sweep(start, end, velocity);
        }
        let wait = GoalWait::from(&self.config.motion);
        let outcome = move_at_velocity(
            self.device,
            Axis::Z,
            &[end],
            Some(velocity),
            &wait,
            self.cancel,
        )
        .hw("sweep(Z)")?;
        if let Some(link) = &self.pump {
            link.pose.set_z(end);
        }
        match outcome {
            GoalOutcome::Reached => Ok(StackEnd::Complete),
            GoalOutcome::Cancelled => {
                if let Err(e) = self.device.stop(Axis::Z) {
                    debug!(error = %e, "Z stop unsupported after cancelled sweep");
                }
                Ok(StackEnd::Cancelled)
            }
            GoalOutcome::TimedOut => Err(DaqError::hardware(
                "sweep(Z)",
                anyhow!(
                    "sweep to {end} did not finish within {:?}",
                    wait.timeout.saturating_add(travel)
                ),
            )),
        }
    }

    /// Start streaming for the stack. Returns the pump's forwarded count.
    fn begin_stream(&mut self, x: f64, y: f64, angle: f64) -> AppResult<Option<usize>> {
        let Some(link) = &self.pump else {
            return Ok(None);
        };
        link.pose.set_lateral(x, y, angle);
        let base = link.pump.frames_forwarded();
        self.device.start_stream().hw("start_stream")?;
        self.streaming = true;
        Ok(Some(base))
    }

    /// Stop streaming, wait for the pump to drain, and tally what it sent.
    fn end_stream(&mut self, row: usize, base: usize) -> AppResult<usize> {
        self.device.stop_stream().hw("stop_stream")?;
        self.streaming = false;
        let timeout = Duration::from_millis(self.config.pipeline.stall_timeout_ms);
        let Some(link) = self.pump.as_mut() else {
            return Ok(0);
        };
        link.pump.sync(timeout)?;
        let depth = link.pump.frames_forwarded().saturating_sub(base);

        let mut pumped = Vec::new();
        if let Some(tap) = link.tap.as_mut() {
            while let Ok(item) = tap.try_recv() {
                pumped.push(item);
            }
        }
        for item in pumped {
            let center = Vector3::new(item.tags.x, item.tags.y, item.tags.z);
            self.tally(row, center, &item.frame);
        }
        self.slices += depth;
        Ok(depth)
    }

    /// Clean shutdown after success, cancellation or failure.
    fn teardown(&mut self, outcome: AppResult<bool>) -> RunStatus {
        let mut status = match outcome {
            Ok(true) => RunStatus::Completed,
            Ok(false) => RunStatus::Cancelled,
            Err(e) => {
                error!(error = %e, "Acquisition interrupted by fault");
                RunStatus::Failed(e)
            }
        };

        if self.streaming {
            if let Err(e) = self.device.stop_stream() {
                warn!(error = %e, "Failed to stop streaming during teardown");
            }
            self.streaming = false;
        }
        if let Some(mut link) = self.pump.take() {
            if let Err(e) = link.pump.stop() {
                if status.is_success() {
                    status = RunStatus::Failed(e);
                } else {
                    warn!(error = %e, "Pump error during teardown");
                }
            }
        }

        if let Err(e) = self.sink.finalize_acquisition() {
            if status.is_success() {
                status = RunStatus::Failed(e);
            } else {
                warn!(error = %e, "Sink finalization failed during teardown");
            }
        }

        if self.hold_shutter {
            if let Err(e) = self.device.set_shutter_open(false) {
                warn!(error = %e, "Failed to close shutter");
            }
        }
        if let Some(auto) = self.auto_shutter_before.take() {
            if let Err(e) = self.device.set_auto_shutter(auto) {
                warn!(error = %e, "Failed to restore auto-shutter");
            }
        }

        let (timepoint, row) = self.last_position;
        self.last_fraction = 1.0;
        if let Some(callback) = self.progress.as_mut() {
            callback(ProgressUpdate {
                timepoint,
                row,
                fraction: 1.0,
            });
        }

        match status {
            RunStatus::Completed => self.transition(SequencerState::Completed),
            _ => self.transition(SequencerState::Aborted),
        }
        status
    }

    fn drift_offsets(&self) -> Vec<(RowId, Vector3)> {
        self.estimators
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.as_ref().map(|e| (RowId(i), e.offset())))
            .collect()
    }
}

fn start_pump<M: Microscope>(
    device: &M,
    config: &AcquisitionConfig,
    producer: SinkProducer,
    preview: Option<crate::experiment::params::PreviewCallback>,
    tap_frames: bool,
    clock: Instant,
) -> AppResult<PumpLink> {
    let queue = device
        .frame_queue()
        .ok_or_else(|| DaqError::Configuration("device cannot stream frames".into()))?;
    let pose = PosePublisher::new(clock);
    let (tx, rx) = if tap_frames {
        let (tx, rx) = mpsc::unbounded_channel();
        (Some(tx), Some(rx))
    } else {
        (None, None)
    };
    let pump = ContinuousPump::start(
        queue,
        producer,
        pose.clone(),
        preview,
        tx,
        Duration::from_millis(config.motion.poll_interval_ms.max(1)),
    )?;
    Ok(PumpLink { pump, pose, tap: rx })
}
