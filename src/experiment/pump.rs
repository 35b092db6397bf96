//! Continuous-mode frame pump.
//!
//! While the camera free-runs, a dedicated thread (`continuous-pump`) pops the
//! device ring buffer, tags each frame from the pose the control thread
//! publishes, and forwards it to the output pipeline through a
//! [`SinkProducer`]. The control thread keeps driving motion meanwhile.
//!
//! When drift correction is active the pump also sends a copy of each frame
//! back to the control thread over an unbounded channel, so estimator state
//! is never touched from the pump thread.
//!
//! ## Synchronisation
//!
//! The pump advances an idle epoch every time it finds the ring buffer empty.
//! After the control thread stops the stream, [`ContinuousPump::sync`] waits
//! for two further idle polls: every frame buffered before the stop has then
//! been forwarded.

use parking_lot::{Condvar, Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, Span};

use crate::data::Frame;
use crate::error::{AppResult, DaqError};
use crate::experiment::params::PreviewCallback;
use crate::hardware::FrameQueue;
use crate::sink::{SinkProducer, SliceTags};

#[derive(Debug, Clone, Copy)]
enum ZPose {
    Fixed(f64),
    Sweep {
        start: f64,
        end: f64,
        velocity: f64,
        started: Instant,
    },
}

impl ZPose {
    fn at(&self, now: Instant) -> f64 {
        match *self {
            ZPose::Fixed(z) => z,
            ZPose::Sweep {
                start,
                end,
                velocity,
                started,
            } => {
                let travelled = velocity * now.saturating_duration_since(started).as_secs_f64();
                let span = end - start;
                if travelled >= span.abs() {
                    end
                } else {
                    start + travelled * span.signum()
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Pose {
    x: f64,
    y: f64,
    angle: f64,
    z: ZPose,
}

/// Stage pose shared from the control thread to the pump for tagging.
///
/// During a sweep the Z tag is extrapolated from the sweep start time at the
/// commanded velocity.
#[derive(Debug, Clone)]
pub struct PosePublisher {
    pose: Arc<RwLock<Pose>>,
    run_start: Instant,
}

impl PosePublisher {
    /// Pose at the origin, with elapsed time measured from `run_start`.
    pub fn new(run_start: Instant) -> Self {
        Self {
            pose: Arc::new(RwLock::new(Pose {
                x: 0.0,
                y: 0.0,
                angle: 0.0,
                z: ZPose::Fixed(0.0),
            })),
            run_start,
        }
    }

    /// Publish the lateral position and angle of the current row.
    pub fn set_lateral(&self, x: f64, y: f64, angle: f64) {
        let mut pose = self.pose.write();
        pose.x = x;
        pose.y = y;
        pose.angle = angle;
    }

    /// Publish a resting Z position.
    pub fn set_z(&self, z: f64) {
        self.pose.write().z = ZPose::Fixed(z);
    }

    /// Publish a sweep starting now.
    pub fn begin_sweep(&self, start: f64, end: f64, velocity: f64) {
        self.pose.write().z = ZPose::Sweep {
            start,
            end,
            velocity: velocity.abs(),
            started: Instant::now(),
        };
    }

    /// Tags for a frame captured at `now`.
    pub fn tags_at(&self, now: Instant) -> SliceTags {
        let pose = *self.pose.read();
        SliceTags {
            x: pose.x,
            y: pose.y,
            z: pose.z.at(now),
            angle: pose.angle,
            elapsed_s: now.saturating_duration_since(self.run_start).as_secs_f64(),
        }
    }
}

/// Frame copy returned to the control thread for drift estimation.
#[derive(Debug, Clone)]
pub struct PumpedFrame {
    /// Pixel data
    pub frame: Frame,
    /// Tags the frame was stored with
    pub tags: SliceTags,
}

#[derive(Default)]
struct PumpShared {
    running: AtomicBool,
    alive: AtomicBool,
    forwarded: AtomicUsize,
    failure: Mutex<Option<String>>,
    idle_epoch: Mutex<u64>,
    idle_changed: Condvar,
}

impl PumpShared {
    fn fail(&self, message: String) {
        error!(error = %message, "Continuous pump stopped");
        self.failure.lock().get_or_insert(message);
        self.alive.store(false, Ordering::SeqCst);
        let _epoch = self.idle_epoch.lock();
        self.idle_changed.notify_all();
    }

    fn mark_idle(&self) {
        let mut epoch = self.idle_epoch.lock();
        *epoch += 1;
        self.idle_changed.notify_all();
    }
}

struct PumpWorker {
    queue: Arc<dyn FrameQueue>,
    sink: SinkProducer,
    pose: PosePublisher,
    preview: Option<PreviewCallback>,
    tap: Option<UnboundedSender<PumpedFrame>>,
    idle: Duration,
    shared: Arc<PumpShared>,
}

impl PumpWorker {
    /// Pop and forward one frame. `Ok(false)` when the buffer was empty.
    fn pump_one(&self) -> AppResult<bool> {
        let frame = self
            .queue
            .pop_next_frame()
            .map_err(|e| DaqError::PumpFailed(format!("ring buffer pop failed: {e:#}")))?;
        let Some(frame) = frame else {
            return Ok(false);
        };
        let tags = self.pose.tags_at(Instant::now());
        if let Some(preview) = &self.preview {
            preview(&frame, &tags);
        }
        if let Some(tap) = &self.tap {
            // Receiver gone means the run is tearing down.
            let _ = tap.send(PumpedFrame {
                frame: frame.clone(),
                tags,
            });
        }
        self.sink
            .process_slice(frame, tags)
            .map_err(|e| DaqError::PumpFailed(format!("forwarding to sink failed: {e}")))?;
        self.shared.forwarded.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    fn run(self) {
        debug!("Continuous pump started");
        while self.shared.running.load(Ordering::SeqCst) {
            match self.pump_one() {
                Ok(true) => {}
                Ok(false) => {
                    self.shared.mark_idle();
                    thread::sleep(self.idle);
                }
                Err(e) => {
                    self.shared.fail(e.to_string());
                    return;
                }
            }
        }
        // Frames still buffered after the stop request.
        loop {
            match self.pump_one() {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    self.shared.fail(e.to_string());
                    return;
                }
            }
        }
        self.shared.alive.store(false, Ordering::SeqCst);
        self.shared.mark_idle();
        debug!(
            forwarded = self.shared.forwarded.load(Ordering::SeqCst),
            "Continuous pump exiting"
        );
    }
}

/// Background ring-buffer drain for continuous mode.
pub struct ContinuousPump {
    shared: Arc<PumpShared>,
    handle: Option<JoinHandle<()>>,
}

impl ContinuousPump {
    /// Spawn the pump thread.
    ///
    /// `tap` receives a copy of every forwarded frame; `preview` sees each frame
    /// on the pump thread before it is stored.
    pub fn start(
        queue: Arc<dyn FrameQueue>,
        sink: SinkProducer,
        pose: PosePublisher,
        preview: Option<PreviewCallback>,
        tap: Option<UnboundedSender<PumpedFrame>>,
        idle: Duration,
    ) -> AppResult<Self> {
        let shared = Arc::new(PumpShared::default());
        shared.running.store(true, Ordering::SeqCst);
        shared.alive.store(true, Ordering::SeqCst);

        let worker = PumpWorker {
            queue,
            sink,
            pose,
            preview,
            tap,
            idle: idle.max(Duration::from_micros(100)),
            shared: Arc::clone(&shared),
        };
        let span = Span::current();
        let handle = thread::Builder::new()
            .name("continuous-pump".into())
            .spawn(move || span.in_scope(|| worker.run()))?;

        info!("Continuous pump running");
        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    /// Frames forwarded to the sink so far.
    pub fn frames_forwarded(&self) -> usize {
        self.shared.forwarded.load(Ordering::SeqCst)
    }

    /// Whether the pump thread is still working.
    pub fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::SeqCst)
    }

    /// Why the pump stopped, if it failed.
    pub fn failure(&self) -> Option<String> {
        self.shared.failure.lock().clone()
    }

    fn failure_error(&self) -> DaqError {
        DaqError::PumpFailed(
            self.failure()
                .unwrap_or_else(|| "continuous pump is not running".into()),
        )
    }

    /// Wait until every frame buffered before this call has been forwarded.
    pub fn sync(&self, timeout: Duration) -> AppResult<()> {
        let deadline = Instant::now() + timeout;
        let mut epoch = self.shared.idle_epoch.lock();
        let target = *epoch + 2;
        while *epoch < target {
            if !self.is_alive() {
                return Err(self.failure_error());
            }
            if self
                .shared
                .idle_changed
                .wait_until(&mut epoch, deadline)
                .timed_out()
            {
                return Err(DaqError::PumpFailed(format!(
                    "ring buffer not drained within {:?}",
                    timeout
                )));
            }
        }
        Ok(())
    }

    /// Stop the thread after it drains what is buffered, and join it.
    pub fn stop(&mut self) -> AppResult<()> {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            handle
                .join()
                .map_err(|_| DaqError::PumpFailed("pump thread panicked".into()))?;
        }
        match self.failure() {
            Some(message) => Err(DaqError::PumpFailed(message)),
            None => Ok(()),
        }
    }
}

impl Drop for ContinuousPump {
    fn drop(&mut self) {
        if self.handle.is_some() {
            if let Err(e) = self.stop() {
                error!(error = %e, "Continuous pump did not shut down cleanly");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::experiment::range::AxisRange;
    use crate::experiment::row::{RowId, StackAxis};
    use crate::hardware::{Axis, FrameProducer, MockMicroscope};
    use crate::sink::{AsyncSinkWrapper, MemorySink, OutputSink};
    use tokio::sync::mpsc;

    #[test]
    fn sweep_pose_is_extrapolated_and_clamped() {
        let pose = PosePublisher::new(Instant::now());
        pose.set_lateral(1.0, 2.0, 90.0);
        pose.begin_sweep(10.0, 0.0, 100.0);
        let now = Instant::now();
        let tags = pose.tags_at(now + Duration::from_millis(50));
        assert!(tags.z < 10.0 && tags.z >= 0.0);
        assert_eq!(tags.x, 1.0);
        assert_eq!(tags.angle, 90.0);
        assert_eq!(pose.tags_at(now + Duration::from_secs(1)).z, 0.0);
    }

    #[test]
    fn pumps_stream_into_sink_and_tap() {
        let scope = MockMicroscope::new(8, 8);
        let (sink, handle) = MemorySink::new();
        let mut wrapper =
            AsyncSinkWrapper::new(Box::new(sink), 16, &PipelineConfig::default()).unwrap();
        wrapper
            .begin_stack(&StackAxis {
                row: RowId(0),
                timepoint: 0,
                axis: Axis::Z,
                range: AxisRange::sweep(0.0, 1.0, 1.0),
            })
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut pump = ContinuousPump::start(
            scope.frame_queue().unwrap(),
            wrapper.producer(),
            PosePublisher::new(Instant::now()),
            None,
            Some(tx),
            Duration::from_millis(1),
        )
        .unwrap();

        scope.start_stream().unwrap();
        thread::sleep(Duration::from_millis(30));
        scope.stop_stream().unwrap();
        pump.sync(Duration::from_secs(2)).unwrap();

        let forwarded = pump.frames_forwarded();
        assert!(forwarded > 0);
        let mut tapped = 0;
        while rx.try_recv().is_ok() {
            tapped += 1;
        }
        assert_eq!(tapped, forwarded);

        pump.stop().unwrap();
        wrapper.finalize_stack(forwarded).unwrap();
        wrapper.finalize_acquisition().unwrap();
        assert_eq!(handle.result().slices, forwarded);
    }

    #[test]
    fn ring_buffer_fault_kills_pump() {
        let scope = MockMicroscope::new(4, 4).fail_stream_after(2);
        let (sink, _handle) = MemorySink::new();
        let wrapper =
            AsyncSinkWrapper::new(Box::new(sink), 16, &PipelineConfig::default()).unwrap();
        let mut pump = ContinuousPump::start(
            scope.frame_queue().unwrap(),
            wrapper.producer(),
            PosePublisher::new(Instant::now()),
            None,
            None,
            Duration::from_millis(1),
        )
        .unwrap();
        scope.start_stream().unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while pump.is_alive() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(!pump.is_alive());
        assert!(matches!(
            pump.sync(Duration::from_millis(10)),
            Err(DaqError::PumpFailed(_))
        ));
        assert!(pump.stop().is_err());
    }
}
