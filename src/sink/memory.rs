//! In-memory sink.
//!
//! Keeps every stack in a shared buffer so the caller can inspect the output
//! after the sink itself has been moved into the sequencer or the async wrapper.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use crate::data::Frame;
use crate::error::{AppResult, DaqError};
use crate::experiment::row::StackAxis;
use crate::sink::{OutputSink, SinkResult, SliceTags};

/// One stack as received.
#[derive(Debug, Clone)]
pub struct RecordedStack {
    /// Axis passed to `begin_stack`
    pub axis: StackAxis,
    /// Slice tags in arrival order
    pub tags: Vec<SliceTags>,
    /// Frames in arrival order, when retained
    pub frames: Vec<Frame>,
    /// Depth passed to `finalize_stack`
    pub finalized_depth: Option<usize>,
}

#[derive(Debug, Default)]
struct Recording {
    stacks: Vec<RecordedStack>,
    result: SinkResult,
    slices_without_stack: usize,
}

/// Read access to what a [`MemorySink`] received.
#[derive(Debug, Clone)]
pub struct MemorySinkHandle {
    inner: Arc<Mutex<Recording>>,
}

impl MemorySinkHandle {
    /// Copy of every stack.
    pub fn stacks(&self) -> Vec<RecordedStack> {
        self.inner.lock().stacks.clone()
    }

    /// Tags of every slice across all stacks, in arrival order.
    pub fn all_tags(&self) -> Vec<SliceTags> {
        self.inner
            .lock()
            .stacks
            .iter()
            .flat_map(|s| s.tags.iter().copied())
            .collect()
    }

    /// Current summary.
    pub fn result(&self) -> SinkResult {
        self.inner.lock().result.clone()
    }

    /// Slices that arrived outside any stack.
    pub fn orphan_slices(&self) -> usize {
        self.inner.lock().slices_without_stack
    }
}

/// Sink that records into memory.
#[derive(Debug)]
pub struct MemorySink {
    inner: Arc<Mutex<Recording>>,
    keep_frames: bool,
    write_delay: Duration,
    fail_after: Option<usize>,
}

impl MemorySink {
    /// New sink that keeps tags only, and its inspection handle.
    pub fn new() -> (Self, MemorySinkHandle) {
        let inner = Arc::new(Mutex::new(Recording::default()));
        let handle = MemorySinkHandle {
            inner: Arc::clone(&inner),
        };
        (
            Self {
                inner,
                keep_frames: false,
                write_delay: Duration::ZERO,
                fail_after: None,
            },
            handle,
        )
    }

    /// Retain frame data as well as tags.
    pub fn keep_frames(mut self) -> Self {
        self.keep_frames = true;
        self
    }

    /// Sleep this long in every `process_slice`, simulating slow storage.
    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = delay;
        self
    }

    /// Fail `process_slice` once `count` slices have been stored.
    pub fn fail_after(mut self, count: usize) -> Self {
        self.fail_after = Some(count);
        self
    }
}

impl OutputSink for MemorySink {
    fn begin_stack(&mut self, axis: &StackAxis) -> AppResult<()> {
        let mut rec = self.inner.lock();
        rec.stacks.push(RecordedStack {
            axis: *axis,
            tags: Vec::new(),
            frames: Vec::new(),
            finalized_depth: None,
        });
        rec.result.stacks += 1;
        Ok(())
    }

    fn process_slice(&mut self, frame: Frame, tags: SliceTags) -> AppResult<()> {
        if !self.write_delay.is_zero() {
            std::thread::sleep(self.write_delay);
        }
        let mut rec = self.inner.lock();
        if let Some(limit) = self.fail_after {
            if rec.result.slices >= limit {
                return Err(DaqError::Storage("memory sink full".into()));
            }
        }
        rec.result.slices += 1;
        rec.result.bytes += frame.byte_len() as u64;
        let keep = self.keep_frames;
        match rec.stacks.last_mut() {
            Some(stack) => {
                stack.tags.push(tags);
                if keep {
                    stack.frames.push(frame);
                }
            }
            None => rec.slices_without_stack += 1,
        }
        Ok(())
    }

    fn finalize_stack(&mut self, depth: usize) -> AppResult<()> {
        if let Some(stack) = self.inner.lock().stacks.last_mut() {
            stack.finalized_depth = Some(depth);
        }
        Ok(())
    }

    fn finalize_acquisition(&mut self) -> AppResult<()> {
        self.inner.lock().result.finalized = true;
        Ok(())
    }

    fn result(&self) -> SinkResult {
        self.inner.lock().result.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::range::AxisRange;
    use crate::experiment::row::RowId;
    use crate::hardware::Axis;

    fn axis() -> StackAxis {
        StackAxis {
            row: RowId(0),
            timepoint: 0,
            axis: Axis::Z,
            range: AxisRange::stepped(0.0, 1.0, 2.0),
        }
    }

    fn tags(z: f64) -> SliceTags {
        SliceTags {
            x: 0.0,
            y: 0.0,
            z,
            angle: 0.0,
            elapsed_s: 0.0,
        }
    }

    #[test]
    fn records_stacks_in_order() {
        let (mut sink, handle) = MemorySink::new();
        sink.begin_stack(&axis()).unwrap();
        for z in 0..3 {
            sink.process_slice(Frame::from_u8(2, 2, vec![0; 4]), tags(z as f64))
                .unwrap();
        }
        sink.finalize_stack(3).unwrap();
        sink.finalize_acquisition().unwrap();

        let stacks = handle.stacks();
        assert_eq!(stacks.len(), 1);
        assert_eq!(stacks[0].finalized_depth, Some(3));
        assert!(stacks[0].frames.is_empty());
        let zs: Vec<f64> = handle.all_tags().iter().map(|t| t.z).collect();
        assert_eq!(zs, vec![0.0, 1.0, 2.0]);

        let result = handle.result();
        assert_eq!(result.slices, 3);
        assert_eq!(result.bytes, 12);
        assert!(result.finalized);
    }

    #[test]
    fn failure_injection() {
        let (sink, _handle) = MemorySink::new();
        let mut sink = sink.fail_after(1);
        sink.begin_stack(&axis()).unwrap();
        assert!(sink.process_slice(Frame::from_u8(1, 1, vec![0]), tags(0.0)).is_ok());
        assert!(matches!(
            sink.process_slice(Frame::from_u8(1, 1, vec![0]), tags(1.0)),
            Err(DaqError::Storage(_))
        ));
    }
}
