//! # Light-Sheet DAQ Core Library
//!
//! Acquisition sequencing for a light-sheet microscope: a programmed set of
//! stage positions, angles and Z-stacks, repeated over a time series, with
//! per-row drift compensation between stacks and disk I/O decoupled from the
//! hardware loop.
//!
//! ## Crate Structure
//!
//! - **`config`**: Figment-backed configuration (`AcquisitionConfig`) loaded from
//!   TOML and `LIGHTSHEET_` environment variables.
//! - **`data`**: The `Frame` container shared by every layer.
//! - **`drift`**: Drift estimators (manual pick, intensity centroid, projection
//!   phase correlation) and the blended per-row drift state.
//! - **`error`**: The `DaqError` enum for centralized error handling.
//! - **`experiment`**: Rows and ranges, run parameters, the
//!   `AcquisitionSequencer`, and the continuous-mode frame pump.
//! - **`hardware`**: Capability traits (`Movable`, `ShutterControl`,
//!   `ExposureControl`, `FrameProducer`) and a mock microscope.
//! - **`sink`**: The `OutputSink` contract, in-memory and raw-file sinks, and
//!   the asynchronous writer pipeline.
//! - **`tracing_setup`**: Structured logging initialization.

pub mod config;
pub mod data;
pub mod drift;
pub mod error;
pub mod experiment;
pub mod hardware;
pub mod sink;
pub mod tracing_setup;

/// Common imports for driving an acquisition.
pub mod prelude {
    pub use crate::config::AcquisitionConfig;
    pub use crate::data::Frame;
    pub use crate::drift::{DriftEstimator, DriftTuning, Vector3};
    pub use crate::error::{AppResult, DaqError};
    pub use crate::experiment::{
        centroid_factory, projection_factory, AcquisitionSequencer, AxisRange, CancelToken,
        RowGenerator, RowSpec, RunParameters, RunReport, RunStatus,
    };
    pub use crate::hardware::{Axis, Microscope, MockMicroscope};
    pub use crate::sink::{AsyncSinkWrapper, MemorySink, OutputSink, RawStackWriter};
}
