//! Asynchronous sink decorator.
//!
//! `AsyncSinkWrapper` puts a bounded FIFO queue and one dedicated writer thread
//! (`sink-writer`) in front of any [`OutputSink`], so the control thread never
//! waits on disk I/O except under backpressure.
//!
//! # Ordering
//!
//! Stack boundaries travel through the same queue as slices. Every pop and the
//! write that follows it happen while holding the sink lock, so the wrapped sink
//! sees items in enqueue order no matter which thread performs the write.
//! Locks are always taken sink first, queue second.
//!
//! # Backpressure
//!
//! When the queue is full the producer drains exactly one item into the sink
//! itself and then retries. If the queue is still full it blocks, and reports
//! `ResourceExhausted` after the configured stall timeout.
//!
//! # Shutdown
//!
//! `finalize_acquisition` drains every remaining item synchronously, interrupts
//! and joins the writer, then finalizes the wrapped sink. Dropping the wrapper
//! also interrupts and joins the writer.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use sysinfo::{MemoryRefreshKind, RefreshKind, System};
use tracing::{debug, error, info, warn, Span};

use crate::config::PipelineConfig;
use crate::data::Frame;
use crate::error::{AppResult, DaqError};
use crate::experiment::row::StackAxis;
use crate::sink::{OutputSink, SinkResult, SliceTags};

/// One decoded frame with its tags, owned by the queue until written.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    /// Pixel data
    pub frame: Frame,
    /// Position and time tags
    pub tags: SliceTags,
}

#[derive(Debug)]
enum PipelineItem {
    BeginStack(StackAxis),
    Slice(QueueEntry),
    FinishStack(usize),
}

/// Queue capacity derived from a memory budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSizing {
    /// Bytes per buffered frame
    pub frame_bytes: usize,
    /// Caller-supplied ceiling on buffered bytes
    pub ceiling_bytes: u64,
    /// Memory currently available to the process, when known
    pub available_bytes: Option<u64>,
}

impl QueueSizing {
    /// Sizing against a fixed ceiling only.
    pub fn new(frame_bytes: usize, ceiling_bytes: u64) -> Self {
        Self {
            frame_bytes,
            ceiling_bytes,
            available_bytes: None,
        }
    }

    /// Sizing against the ceiling and the memory the OS reports available.
    pub fn from_system(frame_bytes: usize, ceiling_bytes: u64) -> Self {
        let system = System::new_with_specifics(
            RefreshKind::nothing().with_memory(MemoryRefreshKind::everything()),
        );
        let available = system.available_memory();
        Self {
            frame_bytes,
            ceiling_bytes,
            available_bytes: (available > 0).then_some(available),
        }
    }

    /// Number of frames that fit, at least one.
    pub fn capacity(&self) -> usize {
        let budget = match self.available_bytes {
            Some(available) => self.ceiling_bytes.min(available),
            None => self.ceiling_bytes,
        };
        let frames = budget / self.frame_bytes.max(1) as u64;
        usize::try_from(frames).unwrap_or(usize::MAX).max(1)
    }
}

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<PipelineItem>,
    interrupted: bool,
    error: Option<DaqError>,
    enqueued: usize,
    written: usize,
    producer_drains: usize,
}

struct Shared {
    queue: Mutex<QueueState>,
    not_empty: Condvar,
    not_full: Condvar,
    sink: Mutex<Box<dyn OutputSink>>,
    capacity: usize,
    stall_timeout: Duration,
}

impl Shared {
    /// Pop and write one item. `Ok(false)` when the queue was empty.
    fn drain_one(&self) -> AppResult<bool> {
        let mut sink = self.sink.lock();
        let item = {
            let mut queue = self.queue.lock();
            let item = queue.items.pop_front();
            if item.is_some() {
                queue.written += 1;
            }
            item
        };
        let Some(item) = item else {
            return Ok(false);
        };
        self.not_full.notify_one();

        match item {
            PipelineItem::BeginStack(axis) => sink.begin_stack(&axis)?,
            PipelineItem::Slice(entry) => sink.process_slice(entry.frame, entry.tags)?,
            PipelineItem::FinishStack(depth) => sink.finalize_stack(depth)?,
        }
        Ok(true)
    }

    fn record_error(&self, err: DaqError) {
        let mut queue = self.queue.lock();
        if queue.error.is_none() {
            queue.error = Some(err);
        }
    }

    fn enqueue(&self, item: PipelineItem) -> AppResult<()> {
        let mut drained = false;
        loop {
            {
                let mut queue = self.queue.lock();
                if let Some(err) = queue.error.take() {
                    return Err(err);
                }
                if queue.interrupted {
                    return Err(DaqError::Storage("output pipeline already finalized".into()));
                }
                if queue.items.len() < self.capacity {
                    queue.items.push_back(item);
                    queue.enqueued += 1;
                    drop(queue);
                    self.not_empty.notify_one();
                    return Ok(());
                }
                if drained {
                    let deadline = Instant::now() + self.stall_timeout;
                    while queue.items.len() >= self.capacity && !queue.interrupted {
                        if self.not_full.wait_until(&mut queue, deadline).timed_out() {
                            return Err(DaqError::ResourceExhausted(format!(
                                "writer queue full ({} frames) for {:?}",
                                self.capacity, self.stall_timeout
                            )));
                        }
                    }
                    continue;
                }
                queue.producer_drains += 1;
            }

            debug!(capacity = self.capacity, "Writer queue full; producer draining one entry");
            self.drain_one()?;
            drained = true;
        }
    }
}

fn writer_loop(shared: Arc<Shared>, poll: Duration) {
    debug!("Writer thread started");
    loop {
        {
            let mut queue = shared.queue.lock();
            while queue.items.is_empty() {
                if queue.interrupted {
                    debug!(written = queue.written, "Writer thread exiting");
                    return;
                }
                shared.not_empty.wait_for(&mut queue, poll);
            }
        }
        if let Err(e) = shared.drain_one() {
            error!(error = %e, "Writer thread failed to store queued item");
            shared.record_error(e);
        }
    }
}

/// Cloneable enqueue handle for other producer threads.
///
/// Slices enqueued through a producer are ordered with the wrapper's own items
/// by the order in which the enqueue calls complete.
#[derive(Clone)]
pub struct SinkProducer {
    shared: Arc<Shared>,
}

impl SinkProducer {
    /// Enqueue one slice, applying the same backpressure as the wrapper.
    pub fn process_slice(&self, frame: Frame, tags: SliceTags) -> AppResult<()> {
        self.shared
            .enqueue(PipelineItem::Slice(QueueEntry { frame, tags }))
    }
}

/// Bounded-queue, single-writer decorator around an [`OutputSink`].
pub struct AsyncSinkWrapper {
    shared: Arc<Shared>,
    writer: Option<JoinHandle<()>>,
}

impl AsyncSinkWrapper {
    /// Wrap `sink` with a queue of `capacity` items and start the writer thread.
    pub fn new(sink: Box<dyn OutputSink>, capacity: usize, config: &PipelineConfig) -> AppResult<Self> {
        let capacity = capacity.max(1);
        let mut items = VecDeque::new();
        items.try_reserve(capacity).map_err(|e| {
            DaqError::ResourceExhausted(format!("cannot allocate writer queue of {capacity}: {e}"))
        })?;

        let shared = Arc::new(Shared {
            queue: Mutex::new(QueueState {
                items,
                ..Default::default()
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            sink: Mutex::new(sink),
            capacity,
            stall_timeout: Duration::from_millis(config.stall_timeout_ms),
        });

        let poll = Duration::from_millis(config.writer_poll_ms.max(1));
        let thread_shared = Arc::clone(&shared);
        // Writer events stay inside the caller's run span.
        let span = Span::current();
        let writer = thread::Builder::new()
            .name("sink-writer".into())
            .spawn(move || span.in_scope(|| writer_loop(thread_shared, poll)))?;

        info!(capacity, "Asynchronous output pipeline started");
        Ok(Self {
            shared,
            writer: Some(writer),
        })
    }

    /// Wrap `sink` with a queue sized from memory for frames of `frame_bytes`.
    pub fn with_memory_budget(
        sink: Box<dyn OutputSink>,
        frame_bytes: usize,
        config: &PipelineConfig,
    ) -> AppResult<Self> {
        let sizing = QueueSizing::from_system(frame_bytes, config.memory_ceiling_bytes);
        debug!(?sizing, "Writer queue sized from memory budget");
        Self::new(sink, sizing.capacity(), config)
    }

    /// Queue capacity in items.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Items currently waiting.
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().items.len()
    }

    /// Times the producer had to drain an item itself.
    pub fn producer_drains(&self) -> usize {
        self.shared.queue.lock().producer_drains
    }

    /// Handle for enqueueing from another thread.
    pub fn producer(&self) -> SinkProducer {
        SinkProducer {
            shared: Arc::clone(&self.shared),
        }
    }

    fn stop_writer(&mut self) -> AppResult<()> {
        {
            let mut queue = self.shared.queue.lock();
            queue.interrupted = true;
        }
        self.shared.not_empty.notify_all();
        self.shared.not_full.notify_all();

        if let Some(handle) = self.writer.take() {
            handle
                .join()
                .map_err(|_| DaqError::Storage("writer thread panicked".into()))?;
        }
        Ok(())
    }
}

impl OutputSink for AsyncSinkWrapper {
    fn begin_stack(&mut self, axis: &StackAxis) -> AppResult<()> {
        self.shared.enqueue(PipelineItem::BeginStack(*axis))
    }

    fn process_slice(&mut self, frame: Frame, tags: SliceTags) -> AppResult<()> {
        self.shared
            .enqueue(PipelineItem::Slice(QueueEntry { frame, tags }))
    }

    fn finalize_stack(&mut self, depth: usize) -> AppResult<()> {
        self.shared.enqueue(PipelineItem::FinishStack(depth))
    }

    fn finalize_acquisition(&mut self) -> AppResult<()> {
        let mut first_error = None;
        loop {
            match self.shared.drain_one() {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    warn!(error = %e, "Queued item lost during final flush");
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Err(e) = self.stop_writer() {
            first_error.get_or_insert(e);
        }

        let finalized = self.shared.sink.lock().finalize_acquisition();

        let (enqueued, written) = {
            let mut queue = self.shared.queue.lock();
            if let Some(e) = queue.error.take() {
                first_error.get_or_insert(e);
            }
            (queue.enqueued, queue.written)
        };
        info!(enqueued, written, "Asynchronous output pipeline finalized");

        finalized?;
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn result(&self) -> SinkResult {
        self.shared.sink.lock().result()
    }
}

impl Drop for AsyncSinkWrapper {
    fn drop(&mut self) {
        if self.writer.is_some() {
            if let Err(e) = self.stop_writer() {
                error!(error = %e, "Writer thread did not shut down cleanly");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::range::AxisRange;
    use crate::experiment::row::RowId;
    use crate::hardware::Axis;
    use crate::sink::MemorySink;

    fn axis() -> StackAxis {
        StackAxis {
            row: RowId(0),
            timepoint: 0,
            axis: Axis::Z,
            range: AxisRange::stepped(0.0, 1.0, 9.0),
        }
    }

    fn tags(i: usize) -> SliceTags {
        SliceTags {
            x: 0.0,
            y: 0.0,
            z: i as f64,
            angle: 0.0,
            elapsed_s: 0.0,
        }
    }

    #[test]
    fn sizing_respects_ceiling_and_available_memory() {
        assert_eq!(QueueSizing::new(1000, 10_000).capacity(), 10);
        assert_eq!(QueueSizing::new(1000, 10).capacity(), 1);
        let sizing = QueueSizing {
            frame_bytes: 100,
            ceiling_bytes: 10_000,
            available_bytes: Some(500),
        };
        assert_eq!(sizing.capacity(), 5);
        assert!(QueueSizing::from_system(4096, 1 << 20).capacity() >= 1);
    }

    #[test]
    fn fifo_under_backpressure() {
        let (sink, handle) = MemorySink::new();
        let sink = sink.with_write_delay(Duration::from_millis(1));
        let mut wrapper =
            AsyncSinkWrapper::new(Box::new(sink), 2, &PipelineConfig::default()).unwrap();

        wrapper.begin_stack(&axis()).unwrap();
        for i in 0..20 {
            wrapper.process_slice(Frame::from_u8(1, 1, vec![i as u8]), tags(i)).unwrap();
        }
        wrapper.finalize_stack(20).unwrap();
        wrapper.finalize_acquisition().unwrap();

        let zs: Vec<f64> = handle.all_tags().iter().map(|t| t.z).collect();
        assert_eq!(zs, (0..20).map(|i| i as f64).collect::<Vec<_>>());
        assert_eq!(handle.stacks()[0].finalized_depth, Some(20));
        assert!(handle.result().finalized);
        assert_eq!(handle.orphan_slices(), 0);
    }

    #[test]
    fn writer_error_surfaces_later() {
        let (sink, _handle) = MemorySink::new();
        let sink = sink.fail_after(1);
        let mut wrapper =
            AsyncSinkWrapper::new(Box::new(sink), 64, &PipelineConfig::default()).unwrap();
        wrapper.begin_stack(&axis()).unwrap();
        wrapper.process_slice(Frame::from_u8(1, 1, vec![0]), tags(0)).unwrap();
        wrapper.process_slice(Frame::from_u8(1, 1, vec![0]), tags(1)).unwrap();
        assert!(matches!(
            wrapper.finalize_acquisition(),
            Err(DaqError::Storage(_))
        ));
        assert_eq!(wrapper.result().slices, 1);
        assert!(wrapper.result().finalized);
    }

    #[test]
    fn producer_handle_shares_queue() {
        let (sink, handle) = MemorySink::new();
        let mut wrapper =
            AsyncSinkWrapper::new(Box::new(sink), 4, &PipelineConfig::default()).unwrap();
        wrapper.begin_stack(&axis()).unwrap();
        let producer = wrapper.producer();
        let worker = std::thread::spawn(move || {
            for i in 0..10 {
                producer.process_slice(Frame::from_u8(1, 1, vec![0]), tags(i)).unwrap();
            }
        });
        worker.join().unwrap();
        wrapper.finalize_stack(10).unwrap();
        wrapper.finalize_acquisition().unwrap();
        assert_eq!(handle.result().slices, 10);
    }

    #[test]
    fn enqueue_after_finalize_is_rejected() {
        let (sink, _handle) = MemorySink::new();
        let mut wrapper =
            AsyncSinkWrapper::new(Box::new(sink), 4, &PipelineConfig::default()).unwrap();
        wrapper.finalize_acquisition().unwrap();
        assert!(wrapper.begin_stack(&axis()).is_err());
    }
}
