//! Atomic Hardware Capabilities
//!
//! Fine-grained capability traits for the microscope devices the sequencer drives.
//! Instead of one monolithic device trait, drivers implement the capabilities they
//! actually support:
//!
//! - A stage implements: `Movable`
//! - A camera implements: `ExposureControl + FrameProducer`
//! - A light path implements: `ShutterControl`
//!
//! The sequencer needs all four and takes a `Microscope`, which every type
//! implementing the individual traits gets through a blanket impl.
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is blocking: the sequencer owns the device on a single control thread
//! - Uses anyhow::Result for errors
//! - Focuses on ONE thing
//!
//! The only capability shared across threads is `FrameQueue`, the ring-buffer pop
//! API used by the continuous pump. It is `Sync` and must not contend with motion
//! calls.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::data::Frame;

/// Stage axes driven by the sequencer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    /// Lateral X
    X,
    /// Lateral Y (the rotation axis direction)
    Y,
    /// Detection axis
    Z,
    /// Sample rotation
    Theta,
}

impl Axis {
    /// All axes in a fixed order.
    pub const ALL: [Axis; 4] = [Axis::X, Axis::Y, Axis::Z, Axis::Theta];

    /// Stable index for array-backed per-axis storage.
    pub fn index(self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
            Axis::Theta => 3,
        }
    }
}

impl std::fmt::Display for Axis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Axis::X => write!(f, "X"),
            Axis::Y => write!(f, "Y"),
            Axis::Z => write!(f, "Z"),
            Axis::Theta => write!(f, "Theta"),
        }
    }
}

/// Capability: Motion Control
///
/// # Contract
/// - Positions are in device-native units (µm for linear axes, degrees for Theta)
/// - `move_abs` initiates motion and may return before completion
/// - `wait_settled` blocks until the axis reports motion complete
/// - `position` may be approximate while moving
pub trait Movable: Send {
    /// Move an axis to an absolute position
    fn move_abs(&self, axis: Axis, position: f64) -> Result<()>;

    /// Current position of an axis
    fn position(&self, axis: Axis) -> Result<f64>;

    /// Block until the axis stops moving
    ///
    /// Should have an internal timeout to prevent infinite blocking.
    fn wait_settled(&self, axis: Axis) -> Result<()>;

    /// Whether the axis is still in motion
    ///
    /// # Default Implementation
    /// Reports not moving, so goal-seeking falls back to plain position checks.
    fn is_moving(&self, _axis: Axis) -> Result<bool> {
        Ok(false)
    }

    /// Current velocity setting of an axis
    fn velocity(&self, axis: Axis) -> Result<f64>;

    /// Velocities the controller accepts, ascending
    fn allowed_velocities(&self, axis: Axis) -> Result<Vec<f64>>;

    /// Change the velocity setting of an axis
    fn set_velocity(&self, axis: Axis, velocity: f64) -> Result<()>;

    /// Stop motion immediately
    ///
    /// # Default Implementation
    /// Returns an error indicating stop is not supported.
    fn stop(&self, _axis: Axis) -> Result<()> {
        anyhow::bail!("Stop not supported by this device")
    }
}

/// Capability: Illumination Shutter
///
/// When auto-shutter is enabled the device opens the shutter around every snap
/// on its own; the sequencer disables it to keep the sheet on for a whole stack.
pub trait ShutterControl: Send {
    /// Open or close the shutter
    fn set_shutter_open(&self, open: bool) -> Result<()>;

    /// Whether the shutter is currently open
    fn is_shutter_open(&self) -> Result<bool>;

    /// Whether auto-shutter is enabled
    fn auto_shutter(&self) -> Result<bool>;

    /// Enable or disable auto-shutter
    fn set_auto_shutter(&self, enabled: bool) -> Result<()>;
}

/// Capability: Exposure Time Control
///
/// # Contract
/// - Exposure is in seconds (not milliseconds)
/// - Setting exposure does not start acquisition
pub trait ExposureControl: Send {
    /// Set exposure/integration time
    fn set_exposure(&self, seconds: f64) -> Result<()>;

    /// Get current exposure setting
    fn get_exposure(&self) -> Result<f64>;
}

/// Capability: Frame/Image Production
///
/// # Contract
/// - `snap_frame()` performs one synchronous exposure and readout
/// - `start_stream()` begins free-running acquisition into the device ring buffer
/// - Streamed frames are popped through `frame_queue()`, never through `snap_frame()`
pub trait FrameProducer: Send {
    /// Acquire a single frame synchronously
    fn snap_frame(&self) -> Result<Frame>;

    /// Start continuous frame acquisition
    fn start_stream(&self) -> Result<()>;

    /// Stop continuous frame acquisition
    fn stop_stream(&self) -> Result<()>;

    /// Get frame resolution (width, height)
    fn resolution(&self) -> (u32, u32);

    /// Bits per pixel of produced frames
    fn bit_depth(&self) -> u32 {
        16
    }

    /// Handle to the ring buffer filled while streaming
    ///
    /// # Default Implementation
    /// Returns None (device cannot stream).
    fn frame_queue(&self) -> Option<Arc<dyn FrameQueue>> {
        None
    }
}

/// Capability: Ring-buffer frame pop
///
/// Used from the continuous pump thread while the control thread keeps issuing
/// motion calls on the device itself.
pub trait FrameQueue: Send + Sync {
    /// Pop the oldest buffered frame, `Ok(None)` when the buffer is empty
    fn pop_next_frame(&self) -> Result<Option<Frame>>;

    /// Whether the device is still streaming into the buffer
    fn is_streaming(&self) -> bool;
}

/// Combined trait for everything the sequencer drives
///
/// Implement the individual capabilities and get this automatically via the
/// blanket impl.
pub trait Microscope: Movable + ShutterControl + ExposureControl + FrameProducer {}

impl<T: Movable + ShutterControl + ExposureControl + FrameProducer> Microscope for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct MockStage {
        position: Mutex<[f64; 4]>,
    }

    impl Movable for MockStage {
        fn move_abs(&self, axis: Axis, position: f64) -> Result<()> {
            self.position.lock()[axis.index()] = position;
            Ok(())
        }

        fn position(&self, axis: Axis) -> Result<f64> {
            Ok(self.position.lock()[axis.index()])
        }

        fn wait_settled(&self, _axis: Axis) -> Result<()> {
            Ok(())
        }

        fn velocity(&self, _axis: Axis) -> Result<f64> {
            Ok(1.0)
        }

        fn allowed_velocities(&self, _axis: Axis) -> Result<Vec<f64>> {
            Ok(vec![1.0])
        }

        fn set_velocity(&self, _axis: Axis, _velocity: f64) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_movable_trait() {
        let stage = MockStage {
            position: Mutex::new([0.0; 4]),
        };

        stage.move_abs(Axis::Z, 10.0).unwrap();
        assert_eq!(stage.position(Axis::Z).unwrap(), 10.0);
        assert_eq!(stage.position(Axis::X).unwrap(), 0.0);
        assert!(!stage.is_moving(Axis::Z).unwrap());
        assert!(stage.stop(Axis::Z).is_err());
    }

    #[test]
    fn axis_indices_are_distinct() {
        let mut seen = [false; 4];
        for axis in Axis::ALL {
            assert!(!seen[axis.index()]);
            seen[axis.index()] = true;
        }
    }
}
