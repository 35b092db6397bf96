//! Output sinks
//!
//! The persistence boundary of the sequencer. A sink receives stacks as
//! `begin_stack`, one `process_slice` per frame in capture order, then
//! `finalize_stack`. `finalize_acquisition` closes the run and `result` reports
//! what was actually written, including after a cancelled run.
//!
//! Sinks are driven from a single thread at a time. Wrap one in
//! [`AsyncSinkWrapper`] to move the writes onto a dedicated writer thread.

pub mod async_wrapper;
pub mod memory;
pub mod raw;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::data::Frame;
use crate::error::AppResult;
use crate::experiment::row::StackAxis;

pub use async_wrapper::{AsyncSinkWrapper, QueueEntry, QueueSizing, SinkProducer};
pub use memory::{MemorySink, MemorySinkHandle, RecordedStack};
pub use raw::{RawStackWriter, SliceRecord};

/// Position and time tags of one slice.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SliceTags {
    /// Stage X
    pub x: f64,
    /// Stage Y
    pub y: f64,
    /// Stage Z
    pub z: f64,
    /// Rotation angle, degrees
    pub angle: f64,
    /// Seconds since the run started
    pub elapsed_s: f64,
}

/// Summary a sink reports at any time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SinkResult {
    /// Stacks begun
    pub stacks: usize,
    /// Slices written
    pub slices: usize,
    /// Pixel bytes written
    pub bytes: u64,
    /// Where the data went, for file-backed sinks
    pub location: Option<PathBuf>,
    /// Whether `finalize_acquisition` completed
    pub finalized: bool,
}

/// Persistence contract driven by the sequencer.
pub trait OutputSink: Send {
    /// Open a new stack.
    fn begin_stack(&mut self, axis: &StackAxis) -> AppResult<()>;

    /// Store one slice. Ownership of the frame transfers to the sink.
    fn process_slice(&mut self, frame: Frame, tags: SliceTags) -> AppResult<()>;

    /// Close the current stack after `depth` slices.
    fn finalize_stack(&mut self, depth: usize) -> AppResult<()>;

    /// Close the acquisition. Must succeed after a partial run.
    fn finalize_acquisition(&mut self) -> AppResult<()>;

    /// What has been written so far.
    fn result(&self) -> SinkResult;
}

impl OutputSink for Box<dyn OutputSink> {
    fn begin_stack(&mut self, axis: &StackAxis) -> AppResult<()> {
        (**self).begin_stack(axis)
    }

    fn process_slice(&mut self, frame: Frame, tags: SliceTags) -> AppResult<()> {
        (**self).process_slice(frame, tags)
    }

    fn finalize_stack(&mut self, depth: usize) -> AppResult<()> {
        (**self).finalize_stack(depth)
    }

    fn finalize_acquisition(&mut self) -> AppResult<()> {
        (**self).finalize_acquisition()
    }

    fn result(&self) -> SinkResult {
        (**self).result()
    }
}
