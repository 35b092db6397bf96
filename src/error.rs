//! Custom error types for the acquisition core.
//!
//! This module defines the primary error type, `DaqError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different kinds of errors that can occur while sequencing an acquisition.
//!
//! ## Error Hierarchy
//!
//! Errors fall into two propagation tiers:
//!
//! 1. **Run-terminal** - `Hardware`, `PumpFailed`, `ResourceExhausted`, `Storage`, `Io`
//!    - Abort the current run through the clean-abort path
//!    - Reported to the caller inside the final `RunReport`
//!
//! 2. **Locally recovered** - `DegenerateCorrelation`, `PickCancelled`
//!    - Never leave the drift module; the estimate degrades to a no-op
//!
//! Parse and configuration errors (`InvalidRange`, `Configuration`, `Config`) are
//! raised before a run starts and are never silently coerced.
//!
//! By using `#[from]`, `DaqError` can be created from underlying error types,
//! simplifying error handling with the `?` operator.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Primary error type for the acquisition core.
#[derive(Error, Debug)]
pub enum DaqError {
    /// A device call failed. `operation` names the capability that was invoked.
    #[error("Hardware fault during {operation}: {source}")]
    Hardware {
        /// Operation that failed (e.g. "move_abs(Z)")
        operation: String,
        /// Error reported by the device driver
        #[source]
        source: anyhow::Error,
    },

    /// The continuous pump thread stopped while the run still needed it.
    #[error("Continuous pump failed: {0}")]
    PumpFailed(String),

    /// The output pipeline could not keep up or could not allocate.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Output sink reported an error.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O error from the operating system.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Metadata could not be serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A textual range or row encoding could not be parsed.
    #[error("Invalid range '{input}': {reason}")]
    InvalidRange {
        /// The rejected input
        input: String,
        /// Why it was rejected
        reason: String,
    },

    /// Semantic configuration error caught during validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Configuration file could not be loaded or extracted.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Phase correlation produced no usable peak.
    #[error("Degenerate correlation: {0}")]
    DegenerateCorrelation(String),

    /// The manual picker went away before answering.
    #[error("Region pick was cancelled")]
    PickCancelled,
}

impl DaqError {
    /// Wrap a driver error with the operation that produced it.
    pub fn hardware(operation: impl Into<String>, source: anyhow::Error) -> Self {
        DaqError::Hardware {
            operation: operation.into(),
            source,
        }
    }

    /// Build an `InvalidRange` error.
    pub fn invalid_range(input: &str, reason: impl Into<String>) -> Self {
        DaqError::InvalidRange {
            input: input.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether this error is recovered inside the drift module instead of ending the run.
    pub fn is_locally_recoverable(&self) -> bool {
        matches!(
            self,
            DaqError::DegenerateCorrelation(_) | DaqError::PickCancelled
        )
    }
}

impl From<figment::Error> for DaqError {
    fn from(value: figment::Error) -> Self {
        DaqError::Config(Box::new(value))
    }
}

/// Extension for attaching an operation name to driver results.
pub trait HardwareResultExt<T> {
    /// Convert an `anyhow::Result` from a capability call into `AppResult`.
    fn hw(self, operation: &str) -> AppResult<T>;
}

impl<T> HardwareResultExt<T> for anyhow::Result<T> {
    fn hw(self, operation: &str) -> AppResult<T> {
        self.map_err(|source| DaqError::hardware(operation, source))
    }
}
