//! Mock Hardware Implementations
//!
//! Provides a simulated light-sheet microscope for testing without physical hardware.
//!
//! # Available Mocks
//!
//! - `MockMicroscope` - Stage (X/Y/Z/Theta), shutter, and camera in one device
//! - `MockFrameQueue` - Ring buffer filled while the mock camera is streaming
//!
//! The camera renders a Gaussian bead at a configurable sample position, so a
//! drift estimator looking at its frames recovers that position in stage units.
//! Motion is simulated with constant velocity; the default velocity is high
//! enough that moves are effectively instantaneous.

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::data::Frame;
use crate::drift::Vector3;
use crate::hardware::capabilities::{
    Axis, ExposureControl, FrameProducer, FrameQueue, Movable, ShutterControl,
};

/// One commanded move, as recorded by the mock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MoveRecord {
    /// Axis that moved
    pub axis: Axis,
    /// Commanded target
    pub target: f64,
    /// Velocity setting at the time of the command
    pub velocity: f64,
}

/// Bead rendered by the mock camera.
#[derive(Debug, Clone)]
pub struct MockScene {
    /// Bead position in stage coordinates
    pub sample: Vector3,
    /// Lateral Gaussian width in pixels
    pub sigma_px: f64,
    /// Axial Gaussian width in stage units
    pub sigma_z: f64,
    /// Peak intensity above background
    pub peak: f64,
    /// Constant background level
    pub background: f64,
    /// Stage units per pixel
    pub pixel_size: f64,
    /// Uniform noise amplitude (0 = deterministic frames)
    pub noise: f64,
    /// Bead displacement applied every `drift_every` frames
    pub drift_step: Vector3,
    /// Frames between drift steps (0 = no drift)
    pub drift_every: usize,
}

impl Default for MockScene {
    fn default() -> Self {
        Self {
            sample: Vector3::ZERO,
            sigma_px: 2.0,
            sigma_z: 3.0,
            peak: 4000.0,
            background: 100.0,
            pixel_size: 1.0,
            noise: 0.0,
            drift_step: Vector3::ZERO,
            drift_every: 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct AxisMotion {
    from: f64,
    to: f64,
    started: Instant,
    velocity: f64,
}

impl AxisMotion {
    fn at_rest(position: f64) -> Self {
        Self {
            from: position,
            to: position,
            started: Instant::now(),
            velocity: f64::INFINITY,
        }
    }

    fn position_at(&self, now: Instant) -> f64 {
        let distance = self.to - self.from;
        if distance == 0.0 || !self.velocity.is_finite() {
            return self.to;
        }
        let travelled = self.velocity * now.duration_since(self.started).as_secs_f64();
        if travelled >= distance.abs() {
            self.to
        } else {
            self.from + travelled * distance.signum()
        }
    }

    fn remaining(&self, now: Instant) -> Duration {
        let left = (self.to - self.position_at(now)).abs();
        if left == 0.0 || !self.velocity.is_finite() {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(left / self.velocity)
        }
    }
}

struct MockState {
    axes: [AxisMotion; 4],
    velocities: [f64; 4],
    allowed_velocities: Vec<f64>,
    shutter_open: bool,
    auto_shutter: bool,
    exposure_s: f64,
    width: u32,
    height: u32,
    scene: MockScene,
    rng: StdRng,
    frames_rendered: usize,
    snaps: usize,
    streaming: bool,
    last_stream_frame: Option<Instant>,
    fail_snap_after: Option<usize>,
    fail_stream_after: Option<usize>,
    fail_axis: Option<Axis>,
    moves: Vec<MoveRecord>,
}

impl MockState {
    fn pose(&self, now: Instant) -> [f64; 4] {
        let mut pose = [0.0; 4];
        for axis in Axis::ALL {
            pose[axis.index()] = self.axes[axis.index()].position_at(now);
        }
        pose
    }

    fn sample_position(&self) -> Vector3 {
        if self.scene.drift_every == 0 {
            return self.scene.sample;
        }
        let steps = (self.frames_rendered / self.scene.drift_every) as f64;
        self.scene.sample + self.scene.drift_step * steps
    }

    fn render(&mut self, now: Instant) -> Frame {
        let pose = self.pose(now);
        let sample = self.sample_position();
        let scene = self.scene.clone();
        let (w, h) = (self.width, self.height);

        let cx = w as f64 / 2.0 + (sample.x - pose[Axis::X.index()]) / scene.pixel_size;
        let cy = h as f64 / 2.0 + (sample.y - pose[Axis::Y.index()]) / scene.pixel_size;
        let dz = sample.z - pose[Axis::Z.index()];
        let axial = (-(dz * dz) / (2.0 * scene.sigma_z * scene.sigma_z)).exp();
        let two_sigma_sq = 2.0 * scene.sigma_px * scene.sigma_px;

        let mut pixels = Vec::with_capacity(w as usize * h as usize);
        for py in 0..h {
            for px in 0..w {
                let rx = px as f64 - cx;
                let ry = py as f64 - cy;
                let mut value =
                    scene.background + scene.peak * axial * (-(rx * rx + ry * ry) / two_sigma_sq).exp();
                if scene.noise > 0.0 {
                    value += self.rng.gen_range(-scene.noise..scene.noise);
                }
                pixels.push(value.clamp(0.0, u16::MAX as f64) as u16);
            }
        }

        self.frames_rendered += 1;
        Frame::from_u16(w, h, &pixels)
    }
}

/// Mock microscope with a simulated stage, shutter and camera
///
/// Cloning yields another handle to the same simulated device, so tests can keep
/// one for inspection after handing the other to the sequencer.
///
/// # Example
///
/// ```rust,ignore
/// let scope = MockMicroscope::new(64, 64);
/// scope.move_abs(Axis::Z, 10.0)?;
/// scope.wait_settled(Axis::Z)?;
/// let frame = scope.snap_frame()?;
/// ```
#[derive(Clone)]
pub struct MockMicroscope {
    state: Arc<Mutex<MockState>>,
}

impl MockMicroscope {
    /// Create a mock with the given sensor size and a bead at the origin
    pub fn new(width: u32, height: u32) -> Self {
        let state = MockState {
            axes: [AxisMotion::at_rest(0.0); 4],
            velocities: [1.0e6; 4],
            allowed_velocities: vec![1.0, 10.0, 100.0, 1.0e6],
            shutter_open: false,
            auto_shutter: true,
            exposure_s: 0.001,
            width,
            height,
            scene: MockScene::default(),
            rng: StdRng::seed_from_u64(0x5EED),
            frames_rendered: 0,
            snaps: 0,
            streaming: false,
            last_stream_frame: None,
            fail_snap_after: None,
            fail_stream_after: None,
            fail_axis: None,
            moves: Vec::new(),
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Replace the rendered scene
    pub fn with_scene(self, scene: MockScene) -> Self {
        self.state.lock().scene = scene;
        self
    }

    /// Set the velocities reported by `allowed_velocities`
    pub fn with_allowed_velocities(self, velocities: Vec<f64>) -> Self {
        self.state.lock().allowed_velocities = velocities;
        self
    }

    /// Set the initial velocity of every axis
    pub fn with_velocity(self, velocity: f64) -> Self {
        self.state.lock().velocities = [velocity; 4];
        self
    }

    /// Fail every `snap_frame` after `count` successful snaps
    pub fn fail_snap_after(self, count: usize) -> Self {
        self.state.lock().fail_snap_after = Some(count);
        self
    }

    /// Fail the ring-buffer pop after `count` streamed frames
    pub fn fail_stream_after(self, count: usize) -> Self {
        self.state.lock().fail_stream_after = Some(count);
        self
    }

    /// Fail every move of `axis`
    pub fn fail_moves_on(self, axis: Axis) -> Self {
        self.state.lock().fail_axis = Some(axis);
        self
    }

    /// Moves commanded so far
    pub fn moves(&self) -> Vec<MoveRecord> {
        self.state.lock().moves.clone()
    }

    /// Number of successful synchronous snaps
    pub fn snap_count(&self) -> usize {
        self.state.lock().snaps
    }

    /// Whether the camera is streaming
    pub fn is_streaming(&self) -> bool {
        self.state.lock().streaming
    }

    /// Current bead position including accumulated drift
    pub fn sample_position(&self) -> Vector3 {
        self.state.lock().sample_position()
    }
}

impl Movable for MockMicroscope {
    fn move_abs(&self, axis: Axis, position: f64) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_axis == Some(axis) {
            return Err(anyhow!("MockMicroscope: {} axis controller not responding", axis));
        }
        let now = Instant::now();
        let velocity = state.velocities[axis.index()];
        let current = state.axes[axis.index()].position_at(now);
        state.axes[axis.index()] = AxisMotion {
            from: current,
            to: position,
            started: now,
            velocity,
        };
        state.moves.push(MoveRecord {
            axis,
            target: position,
            velocity,
        });
        Ok(())
    }

    fn position(&self, axis: Axis) -> Result<f64> {
        Ok(self.state.lock().axes[axis.index()].position_at(Instant::now()))
    }

    fn wait_settled(&self, axis: Axis) -> Result<()> {
        let remaining = self.state.lock().axes[axis.index()].remaining(Instant::now());
        if remaining > Duration::from_secs(5) {
            return Err(anyhow!("MockMicroscope: {} axis settle timeout", axis));
        }
        std::thread::sleep(remaining);
        Ok(())
    }

    fn is_moving(&self, axis: Axis) -> Result<bool> {
        Ok(!self.state.lock().axes[axis.index()]
            .remaining(Instant::now())
            .is_zero())
    }

    fn velocity(&self, axis: Axis) -> Result<f64> {
        Ok(self.state.lock().velocities[axis.index()])
    }

    fn allowed_velocities(&self, _axis: Axis) -> Result<Vec<f64>> {
        Ok(self.state.lock().allowed_velocities.clone())
    }

    fn set_velocity(&self, axis: Axis, velocity: f64) -> Result<()> {
        if velocity <= 0.0 {
            return Err(anyhow!("MockMicroscope: velocity must be positive"));
        }
        self.state.lock().velocities[axis.index()] = velocity;
        Ok(())
    }

    fn stop(&self, axis: Axis) -> Result<()> {
        let mut state = self.state.lock();
        let here = state.axes[axis.index()].position_at(Instant::now());
        state.axes[axis.index()] = AxisMotion::at_rest(here);
        Ok(())
    }
}

impl ShutterControl for MockMicroscope {
    fn set_shutter_open(&self, open: bool) -> Result<()> {
        self.state.lock().shutter_open = open;
        Ok(())
    }

    fn is_shutter_open(&self) -> Result<bool> {
        Ok(self.state.lock().shutter_open)
    }

    fn auto_shutter(&self) -> Result<bool> {
        Ok(self.state.lock().auto_shutter)
    }

    fn set_auto_shutter(&self, enabled: bool) -> Result<()> {
        self.state.lock().auto_shutter = enabled;
        Ok(())
    }
}

impl ExposureControl for MockMicroscope {
    fn set_exposure(&self, seconds: f64) -> Result<()> {
        if seconds <= 0.0 {
            return Err(anyhow!("MockMicroscope: exposure must be positive"));
        }
        self.state.lock().exposure_s = seconds;
        Ok(())
    }

    fn get_exposure(&self) -> Result<f64> {
        Ok(self.state.lock().exposure_s)
    }
}

impl FrameProducer for MockMicroscope {
    fn snap_frame(&self) -> Result<Frame> {
        let mut state = self.state.lock();
        if let Some(limit) = state.fail_snap_after {
            if state.snaps >= limit {
                return Err(anyhow!("MockMicroscope: camera readout failed"));
            }
        }
        state.snaps += 1;
        Ok(state.render(Instant::now()))
    }

    fn start_stream(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.streaming {
            return Err(anyhow!("MockMicroscope: already streaming"));
        }
        state.streaming = true;
        state.last_stream_frame = None;
        Ok(())
    }

    fn stop_stream(&self) -> Result<()> {
        self.state.lock().streaming = false;
        Ok(())
    }

    fn resolution(&self) -> (u32, u32) {
        let state = self.state.lock();
        (state.width, state.height)
    }

    fn frame_queue(&self) -> Option<Arc<dyn FrameQueue>> {
        Some(Arc::new(MockFrameQueue {
            state: Arc::clone(&self.state),
            popped: Mutex::new(0),
        }))
    }
}

/// Ring buffer of the mock camera
///
/// Produces one frame per exposure period while streaming.
pub struct MockFrameQueue {
    state: Arc<Mutex<MockState>>,
    popped: Mutex<usize>,
}

impl FrameQueue for MockFrameQueue {
    fn pop_next_frame(&self) -> Result<Option<Frame>> {
        let mut state = self.state.lock();
        if !state.streaming {
            return Ok(None);
        }

        let now = Instant::now();
        let period = Duration::from_secs_f64(state.exposure_s);
        if let Some(last) = state.last_stream_frame {
            if now.duration_since(last) < period {
                return Ok(None);
            }
        }

        let mut popped = self.popped.lock();
        if let Some(limit) = state.fail_stream_after {
            if *popped >= limit {
                return Err(anyhow!("MockMicroscope: ring buffer overrun"));
            }
        }

        state.last_stream_frame = Some(now);
        *popped += 1;
        Ok(Some(state.render(now)))
    }

    fn is_streaming(&self) -> bool {
        self.state.lock().streaming
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn moves_are_recorded_with_velocity() {
        let scope = MockMicroscope::new(8, 8);
        scope.set_velocity(Axis::X, 10.0).unwrap();
        scope.move_abs(Axis::X, 0.0).unwrap();
        let moves = scope.moves();
        assert_eq!(moves.len(), 1);
        assert_eq!(moves[0].velocity, 10.0);
    }

    #[test]
    fn slow_moves_take_time() {
        let scope = MockMicroscope::new(8, 8).with_velocity(100.0);
        scope.move_abs(Axis::Z, 5.0).unwrap();
        assert!(scope.is_moving(Axis::Z).unwrap());
        scope.wait_settled(Axis::Z).unwrap();
        assert_eq!(scope.position(Axis::Z).unwrap(), 5.0);
        assert!(!scope.is_moving(Axis::Z).unwrap());
    }

    #[test]
    fn bead_is_brightest_at_its_position() {
        let scene = MockScene {
            sample: Vector3::new(4.0, -2.0, 0.0),
            ..Default::default()
        };
        let scope = MockMicroscope::new(32, 32).with_scene(scene);
        let frame = scope.snap_frame().unwrap();
        // 16 + 4 px, 16 - 2 px
        let peak = frame.get(20, 14).unwrap();
        assert!(peak > frame.get(16, 16).unwrap());
        assert!(peak > 4000);
    }

    #[test]
    fn snap_failure_injection() {
        let scope = MockMicroscope::new(4, 4).fail_snap_after(1);
        assert!(scope.snap_frame().is_ok());
        assert!(scope.snap_frame().is_err());
    }

    #[test]
    fn queue_is_empty_unless_streaming() {
        let scope = MockMicroscope::new(4, 4);
        let queue = scope.frame_queue().unwrap();
        assert!(queue.pop_next_frame().unwrap().is_none());
        scope.start_stream().unwrap();
        assert!(queue.pop_next_frame().unwrap().is_some());
        scope.stop_stream().unwrap();
        assert!(!queue.is_streaming());
    }
}
