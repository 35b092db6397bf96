//! Raw stack writer.
//!
//! Directory layout:
//!
//! ```text
//! <dir>/stack_0000.raw      concatenated little-endian pixel data
//! <dir>/stack_0001.raw
//! <dir>/slices.jsonl        one SliceRecord per line, capture order
//! <dir>/acquisition.json    summary written by finalize_acquisition
//! <dir>/config.toml         optional configuration snapshot
//! ```
//!
//! Tags are written with shortest round-trip float formatting and read back
//! bit-exact.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::config::AcquisitionConfig;
use crate::data::Frame;
use crate::error::{AppResult, DaqError};
use crate::experiment::row::StackAxis;
use crate::sink::{OutputSink, SinkResult, SliceTags};

/// Per-slice metadata line in `slices.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SliceRecord {
    /// Stack file index
    pub stack: usize,
    /// Slice index within the stack
    pub slice: usize,
    /// Byte offset of the slice in its stack file
    pub offset: u64,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Bits per pixel
    pub bit_depth: u32,
    /// Position and time tags
    pub tags: SliceTags,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StackSummary {
    index: usize,
    axis: StackAxis,
    depth: Option<usize>,
    slices_written: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AcquisitionSummary {
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    stacks: Vec<StackSummary>,
    slices: usize,
    bytes: u64,
}

struct OpenStack {
    writer: BufWriter<File>,
    written: u64,
    slices: usize,
}

/// Sink writing raw pixel stacks and JSON-lines metadata.
pub struct RawStackWriter {
    dir: PathBuf,
    started_at: DateTime<Utc>,
    current: Option<OpenStack>,
    metadata: BufWriter<File>,
    stacks: Vec<StackSummary>,
    result: SinkResult,
}

impl RawStackWriter {
    /// Create `dir` if needed and open `slices.jsonl`.
    pub fn create<P: AsRef<Path>>(dir: P) -> AppResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let metadata = BufWriter::new(File::create(dir.join("slices.jsonl"))?);
        info!(dir = %dir.display(), "Raw stack writer opened");
        Ok(Self {
            result: SinkResult {
                location: Some(dir.clone()),
                ..Default::default()
            },
            dir,
            started_at: Utc::now(),
            current: None,
            metadata,
            stacks: Vec::new(),
        })
    }

    /// Write the run configuration next to the data.
    pub fn write_config_snapshot(&self, config: &AcquisitionConfig) -> AppResult<()> {
        let text = toml::to_string_pretty(config)
            .map_err(|e| DaqError::Storage(format!("config snapshot: {e}")))?;
        fs::write(self.dir.join("config.toml"), text)?;
        Ok(())
    }

    /// Path of stack file `index`.
    pub fn stack_path(&self, index: usize) -> PathBuf {
        self.dir.join(format!("stack_{:04}.raw", index))
    }

    /// Read back `slices.jsonl` from a finished acquisition directory.
    pub fn read_records<P: AsRef<Path>>(dir: P) -> AppResult<Vec<SliceRecord>> {
        let file = File::open(dir.as_ref().join("slices.jsonl"))?;
        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line)?);
        }
        Ok(records)
    }

    fn close_current(&mut self, depth: Option<usize>) -> AppResult<()> {
        if let Some(mut open) = self.current.take() {
            open.writer.flush()?;
            if let Some(summary) = self.stacks.last_mut() {
                summary.depth = depth;
                summary.slices_written = open.slices;
            }
            debug!(slices = open.slices, bytes = open.written, "Stack file closed");
        }
        Ok(())
    }
}

impl OutputSink for RawStackWriter {
    fn begin_stack(&mut self, axis: &StackAxis) -> AppResult<()> {
        self.close_current(None)?;
        let index = self.stacks.len();
        let writer = BufWriter::new(File::create(self.stack_path(index))?);
        self.current = Some(OpenStack {
            writer,
            written: 0,
            slices: 0,
        });
        self.stacks.push(StackSummary {
            index,
            axis: *axis,
            depth: None,
            slices_written: 0,
        });
        self.result.stacks += 1;
        Ok(())
    }

    fn process_slice(&mut self, frame: Frame, tags: SliceTags) -> AppResult<()> {
        let stack = self.stacks.len().saturating_sub(1);
        let open = self
            .current
            .as_mut()
            .ok_or_else(|| DaqError::Storage("slice received outside a stack".into()))?;

        open.writer.write_all(&frame.data)?;
        let record = SliceRecord {
            stack,
            slice: open.slices,
            offset: open.written,
            width: frame.width,
            height: frame.height,
            bit_depth: frame.bit_depth,
            tags,
        };
        open.written += frame.data.len() as u64;
        open.slices += 1;

        serde_json::to_writer(&mut self.metadata, &record)?;
        self.metadata.write_all(b"\n")?;

        self.result.slices += 1;
        self.result.bytes += frame.data.len() as u64;
        Ok(())
    }

    fn finalize_stack(&mut self, depth: usize) -> AppResult<()> {
        self.close_current(Some(depth))?;
        self.metadata.flush()?;
        Ok(())
    }

    fn finalize_acquisition(&mut self) -> AppResult<()> {
        self.close_current(None)?;
        self.metadata.flush()?;

        let summary = AcquisitionSummary {
            started_at: self.started_at,
            finished_at: Utc::now(),
            stacks: self.stacks.clone(),
            slices: self.result.slices,
            bytes: self.result.bytes,
        };
        let file = File::create(self.dir.join("acquisition.json"))?;
        serde_json::to_writer_pretty(BufWriter::new(file), &summary)?;

        self.result.finalized = true;
        info!(
            stacks = self.result.stacks,
            slices = self.result.slices,
            "Raw acquisition finalized"
        );
        Ok(())
    }

    fn result(&self) -> SinkResult {
        self.result.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::range::AxisRange;
    use crate::experiment::row::RowId;
    use crate::hardware::Axis;

    fn axis(row: usize) -> StackAxis {
        StackAxis {
            row: RowId(row),
            timepoint: 0,
            axis: Axis::Z,
            range: AxisRange::stepped(0.0, 0.1, 0.2),
        }
    }

    #[test]
    fn writes_stacks_and_exact_tags() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = RawStackWriter::create(dir.path()).unwrap();

        let tricky = SliceTags {
            x: 0.1 + 0.2,
            y: -1.0 / 3.0,
            z: 1e-300,
            angle: 359.99999999999994,
            elapsed_s: 12.345678901234567,
        };

        writer.begin_stack(&axis(0)).unwrap();
        writer
            .process_slice(Frame::from_u16(2, 2, &[1, 2, 3, 4]), tricky)
            .unwrap();
        writer
            .process_slice(Frame::from_u16(2, 2, &[5, 6, 7, 8]), tricky)
            .unwrap();
        writer.finalize_stack(2).unwrap();
        writer.begin_stack(&axis(1)).unwrap();
        writer.finalize_acquisition().unwrap();

        assert_eq!(fs::read(writer.stack_path(0)).unwrap().len(), 16);
        assert!(writer.stack_path(1).exists());
        assert!(dir.path().join("acquisition.json").exists());

        let records = RawStackWriter::read_records(dir.path()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].offset, 8);
        assert_eq!(records[1].slice, 1);
        assert_eq!(records[0].tags, tricky);

        let result = writer.result();
        assert_eq!(result.stacks, 2);
        assert_eq!(result.slices, 2);
        assert!(result.finalized);
    }

    #[test]
    fn slice_outside_stack_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = RawStackWriter::create(dir.path()).unwrap();
        let tags = SliceTags {
            x: 0.0,
            y: 0.0,
            z: 0.0,
            angle: 0.0,
            elapsed_s: 0.0,
        };
        assert!(matches!(
            writer.process_slice(Frame::from_u8(1, 1, vec![0]), tags),
            Err(DaqError::Storage(_))
        ));
    }

    #[test]
    fn config_snapshot_is_toml() {
        let dir = tempfile::tempdir().unwrap();
        let writer = RawStackWriter::create(dir.path()).unwrap();
        writer
            .write_config_snapshot(&AcquisitionConfig::default())
            .unwrap();
        let text = fs::read_to_string(dir.path().join("config.toml")).unwrap();
        assert!(text.contains("[drift]"));
    }
}
