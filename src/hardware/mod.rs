//! Hardware abstractions
//!
//! Capability traits the sequencer drives, plus a simulated microscope for tests
//! and demos.

pub mod capabilities;
pub mod mock;

pub use capabilities::{
    Axis, ExposureControl, FrameProducer, FrameQueue, Microscope, Movable, ShutterControl,
};
pub use mock::{MockFrameQueue, MockMicroscope, MockScene, MoveRecord};
