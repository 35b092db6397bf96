//! Acquisition configuration using Figment
//!
//! `AcquisitionConfig` is the explicit context handed to the sequencer and to drift
//! estimator factories at construction. Configuration is loaded from:
//! 1. Built-in defaults
//! 2. config/lightsheet.toml (optional)
//! 3. Environment variables (prefixed with LIGHTSHEET_, nested keys split on `__`)
//!
//! # Example
//! ```no_run
//! use lightsheet_daq::config::AcquisitionConfig;
//!
//! let config = AcquisitionConfig::load()?;
//! config.validate()?;
//! println!("EMA weight: {}", config.drift.ema_weight);
//! # Ok::<(), lightsheet_daq::error::DaqError>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{AppResult, DaqError};
use crate::experiment::generator::RotationCalibration;

/// Top-level acquisition configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Drift compensation tuning
    #[serde(default)]
    pub drift: DriftConfig,
    /// Motion behaviour
    #[serde(default)]
    pub motion: MotionConfig,
    /// Output pipeline sizing
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// Stage calibration
    #[serde(default)]
    pub calibration: CalibrationConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "Light-sheet acquisition".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Pixel threshold applied by the intensity-centroid estimator
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ThresholdMode {
    /// Every pixel counts
    None,
    /// `[low, high]` as fractions of each frame's dynamic range
    Auto {
        /// Lower fraction (0..1)
        low: f64,
        /// Upper fraction (0..1)
        high: f64,
    },
    /// Absolute intensity window
    Absolute {
        /// Lowest counted intensity
        low: f64,
        /// Highest counted intensity
        high: f64,
    },
}

/// How the projection estimator builds its XY view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum XyProjection {
    /// Maximum-intensity projection
    Max,
    /// Mean-intensity projection
    Average,
}

/// Drift compensation tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftConfig {
    /// Weight of the previous estimate in the exponential blend (0..1)
    #[serde(default = "default_ema_weight")]
    pub ema_weight: f64,
    /// Estimates further than this from the reference are halved (0 disables)
    #[serde(default = "default_reset_magnitude")]
    pub reset_magnitude: f64,
    /// Minimum fraction of pixels that must pass the threshold
    #[serde(default = "default_min_counted_ratio")]
    pub min_counted_ratio: f64,
    /// Threshold policy for the centroid estimator
    #[serde(default = "default_threshold")]
    pub threshold: ThresholdMode,
    /// Lateral pixel size in stage units
    #[serde(default = "default_pixel_size")]
    pub pixel_size_um: f64,
    /// XY projection kind for the correlation estimator
    #[serde(default = "default_xy_projection")]
    pub xy_projection: XyProjection,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            ema_weight: default_ema_weight(),
            reset_magnitude: default_reset_magnitude(),
            min_counted_ratio: default_min_counted_ratio(),
            threshold: default_threshold(),
            pixel_size_um: default_pixel_size(),
            xy_projection: default_xy_projection(),
        }
    }
}

/// Motion behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MotionConfig {
    /// Velocity used for drift relocation (None = slowest allowed velocity)
    #[serde(default)]
    pub creep_velocity: Option<f64>,
    /// Multiple of the offset used for the overshoot-avoiding waypoint
    #[serde(default = "default_waypoint_factor")]
    pub waypoint_factor: f64,
    /// Distance below which a goal position counts as reached
    #[serde(default = "default_goal_tolerance")]
    pub goal_tolerance: f64,
    /// Give up waiting for a goal after this long
    #[serde(default = "default_goal_timeout")]
    pub goal_timeout_ms: u64,
    /// Poll interval while goal-seeking or sleeping cancellably
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            creep_velocity: None,
            waypoint_factor: default_waypoint_factor(),
            goal_tolerance: default_goal_tolerance(),
            goal_timeout_ms: default_goal_timeout(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

/// Output pipeline sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Route slices through the asynchronous writer
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Ceiling on bytes buffered in the writer queue
    #[serde(default = "default_memory_ceiling")]
    pub memory_ceiling_bytes: u64,
    /// Writer thread queue-pop timeout
    #[serde(default = "default_writer_poll")]
    pub writer_poll_ms: u64,
    /// A producer blocked on a full queue longer than this reports exhaustion
    #[serde(default = "default_stall_timeout")]
    pub stall_timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            memory_ceiling_bytes: default_memory_ceiling(),
            writer_poll_ms: default_writer_poll(),
            stall_timeout_ms: default_stall_timeout(),
        }
    }
}

/// Stage calibration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CalibrationConfig {
    /// Rotation axis calibration; identity transform when absent
    #[serde(default)]
    pub rotation: Option<RotationCalibration>,
}

// Default value functions
fn default_ema_weight() -> f64 {
    0.0
}

fn default_reset_magnitude() -> f64 {
    0.0
}

fn default_min_counted_ratio() -> f64 {
    0.001
}

fn default_threshold() -> ThresholdMode {
    ThresholdMode::Auto {
        low: 0.5,
        high: 1.0,
    }
}

fn default_pixel_size() -> f64 {
    1.0
}

fn default_xy_projection() -> XyProjection {
    XyProjection::Max
}

fn default_waypoint_factor() -> f64 {
    1.5
}

fn default_goal_tolerance() -> f64 {
    0.05
}

fn default_goal_timeout() -> u64 {
    30_000
}

fn default_poll_interval() -> u64 {
    5
}

fn default_enabled() -> bool {
    true
}

fn default_memory_ceiling() -> u64 {
    512 * 1024 * 1024
}

fn default_writer_poll() -> u64 {
    50
}

fn default_stall_timeout() -> u64 {
    10_000
}

impl AcquisitionConfig {
    /// Load configuration from config/lightsheet.toml and environment variables
    ///
    /// Environment variables override the file with prefix LIGHTSHEET_
    /// Example: LIGHTSHEET_DRIFT__EMA_WEIGHT=0.5
    pub fn load() -> AppResult<Self> {
        Self::load_from("config/lightsheet.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config = Figment::new()
            .merge(Serialized::defaults(AcquisitionConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("LIGHTSHEET_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let drift = &self.drift;
        if !(0.0..=1.0).contains(&drift.ema_weight) {
            return Err(DaqError::Configuration(format!(
                "Invalid ema_weight {}. Must be within 0..1",
                drift.ema_weight
            )));
        }
        if drift.reset_magnitude < 0.0 {
            return Err(DaqError::Configuration(format!(
                "Invalid reset_magnitude {}. Must not be negative",
                drift.reset_magnitude
            )));
        }
        if !(0.0..=1.0).contains(&drift.min_counted_ratio) {
            return Err(DaqError::Configuration(format!(
                "Invalid min_counted_ratio {}. Must be within 0..1",
                drift.min_counted_ratio
            )));
        }
        if drift.pixel_size_um <= 0.0 {
            return Err(DaqError::Configuration(format!(
                "Invalid pixel_size_um {}. Must be positive",
                drift.pixel_size_um
            )));
        }
        match drift.threshold {
            ThresholdMode::Auto { low, high } if !(0.0..=1.0).contains(&low) || high < low => {
                return Err(DaqError::Configuration(format!(
                    "Invalid auto threshold [{low}, {high}]"
                )));
            }
            ThresholdMode::Absolute { low, high } if high < low => {
                return Err(DaqError::Configuration(format!(
                    "Invalid absolute threshold [{low}, {high}]"
                )));
            }
            _ => {}
        }

        if self.motion.waypoint_factor < 1.0 {
            return Err(DaqError::Configuration(format!(
                "Invalid waypoint_factor {}. Must be at least 1",
                self.motion.waypoint_factor
            )));
        }
        if matches!(self.motion.creep_velocity, Some(v) if v <= 0.0) {
            return Err(DaqError::Configuration(
                "creep_velocity must be positive".to_string(),
            ));
        }

        if self.pipeline.writer_poll_ms == 0 || self.pipeline.stall_timeout_ms == 0 {
            return Err(DaqError::Configuration(
                "writer_poll_ms and stall_timeout_ms must be positive".to_string(),
            ));
        }
        if self.pipeline.memory_ceiling_bytes == 0 {
            return Err(DaqError::Configuration(
                "memory_ceiling_bytes must be positive".to_string(),
            ));
        }

        Ok(())
    }
}
