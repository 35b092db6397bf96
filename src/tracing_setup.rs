//! Log output for acquisition runs.
//!
//! Three threads emit events while a run is in progress. The control thread
//! drives the stage and camera, `sink-writer` drains the slice queue into the
//! output sink, and `continuous-pump` forwards streamed frames during Z
//! sweeps. Both worker threads enter the `acquisition` span of the run that
//! started them, so their lines carry the same `run` uid as the sequencer's.
//! Thread names are printed by default; that is how a stalled writer or a
//! failed pump shows up in a log.
//!
//! `RUST_LOG` takes precedence over `application.log_level`.
//!
//! # Example
//! ```no_run
//! use lightsheet_daq::{config::AcquisitionConfig, tracing_setup};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AcquisitionConfig::load()?;
//! tracing_setup::init_from_config(&config)?;
//! tracing::info!("Sequencer ready");
//! # Ok(())
//! # }
//! ```

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::config::AcquisitionConfig;
use crate::error::{AppResult, DaqError};

/// Line format of the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Multi-line and colored, for watching a run at the bench
    Pretty,
    /// One line per event, for unattended time series
    #[default]
    Compact,
    /// One JSON object per event, span fields included
    Json,
}

/// Subscriber settings for a sequencer process.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Most verbose level shown when `RUST_LOG` is unset
    pub level: Level,
    /// Line format
    pub format: OutputFormat,
    /// Log each `acquisition` span as it closes, with its busy and idle time
    pub span_close_events: bool,
    /// Source file and line of each event
    pub with_file_and_line: bool,
    /// Thread names (`sink-writer`, `continuous-pump`, control thread)
    pub with_thread_names: bool,
    /// Colors, honored by [`OutputFormat::Pretty`] only
    pub with_ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self::new(Level::INFO)
    }
}

impl TracingConfig {
    /// Settings at `level` with thread names on.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            format: OutputFormat::default(),
            span_close_events: false,
            with_file_and_line: false,
            with_thread_names: true,
            with_ansi: true,
        }
    }

    /// Settings for `application.log_level`.
    pub fn from_config(config: &AcquisitionConfig) -> AppResult<Self> {
        let raw = config.application.log_level.trim();
        let level = raw.parse::<Level>().map_err(|_| {
            DaqError::Configuration(format!(
                "Invalid log_level '{raw}'. Must be one of: trace, debug, info, warn, error"
            ))
        })?;
        Ok(Self::new(level))
    }

    /// Use another line format.
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Log span close events.
    pub fn with_span_close_events(mut self, enabled: bool) -> Self {
        self.span_close_events = enabled;
        self
    }

    /// Enable or disable colors.
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.level.as_str().to_ascii_lowercase()))
    }
}

/// Install the subscriber described by `application.log_level`.
pub fn init_from_config(config: &AcquisitionConfig) -> AppResult<()> {
    init(TracingConfig::from_config(config)?)
}

/// Install a global subscriber.
///
/// Returns `Ok(())` without changes when a subscriber is already installed,
/// as happens under test harnesses and in embedding applications.
pub fn init(config: TracingConfig) -> AppResult<()> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }

    let span_events = if config.span_close_events {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };
    let filter = config.filter();
    let base = fmt::layer()
        .with_span_events(span_events)
        .with_file(config.with_file_and_line)
        .with_line_number(config.with_file_and_line)
        .with_thread_names(config.with_thread_names);
    let layer = match config.format {
        OutputFormat::Pretty => base
            .pretty()
            .with_ansi(config.with_ansi)
            .with_filter(filter)
            .boxed(),
        OutputFormat::Compact => base.compact().with_ansi(false).with_filter(filter).boxed(),
        OutputFormat::Json => base.json().with_filter(filter).boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .map_err(|e| DaqError::Configuration(format!("Failed to install log subscriber: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_level(level: &str) -> AcquisitionConfig {
        let mut config = AcquisitionConfig::default();
        config.application.log_level = level.to_string();
        config
    }

    #[test]
    fn log_level_is_read_from_the_application_section() {
        let config = TracingConfig::from_config(&with_level("Debug")).unwrap();
        assert_eq!(config.level, Level::DEBUG);
        assert_eq!(config.format, OutputFormat::Compact);
        assert!(config.with_thread_names);

        assert!(matches!(
            TracingConfig::from_config(&with_level("chatty")),
            Err(DaqError::Configuration(_))
        ));
    }

    #[test]
    fn init_twice_keeps_the_first_subscriber() {
        let config = TracingConfig::new(Level::WARN).with_ansi(false);
        assert!(init(config.clone()).is_ok());
        assert!(init(config.with_format(OutputFormat::Json)).is_ok());
    }
}
