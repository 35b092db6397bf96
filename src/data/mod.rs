//! Frame containers shared by the hardware, drift and sink layers.
pub mod frame;

pub use frame::Frame;
