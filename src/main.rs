//! CLI Entry Point for lightsheet-daq
//!
//! Provides command-line interface for:
//! - Running an acquisition against the simulated microscope
//! - Validating a configuration file
//!
//! # Usage
//!
//! Run three time points of one stepped stack with centroid drift correction:
//! ```bash
//! lightsheet-daq run --row "0,0,0,0:1:20" --timepoints 3 --drift centroid --output /tmp/run1
//! ```
//!
//! Check a configuration file:
//! ```bash
//! lightsheet-daq check-config config/lightsheet.toml
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use lightsheet_daq::config::AcquisitionConfig;
use lightsheet_daq::drift::Vector3;
use lightsheet_daq::experiment::{
    centroid_factory, projection_factory, AcquisitionSequencer, RowSpec, RunParameters,
};
use lightsheet_daq::hardware::{MockMicroscope, MockScene};
use lightsheet_daq::sink::RawStackWriter;
use lightsheet_daq::tracing_setup;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "lightsheet-daq")]
#[command(about = "Light-sheet acquisition sequencer", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum DriftChoice {
    None,
    Centroid,
    Projection,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an acquisition on the simulated microscope
    Run {
        /// Row as "x,y,angle,z" where z is "p", "start:step:end" or "start-end@velocity"
        #[arg(long = "row", required = true)]
        rows: Vec<RowSpec>,

        /// Number of time points
        #[arg(long, default_value = "1")]
        timepoints: u32,

        /// Seconds between time points
        #[arg(long, default_value = "0")]
        interval: f64,

        /// Drift correction strategy
        #[arg(long, value_enum, default_value = "none")]
        drift: DriftChoice,

        /// Capture by continuous streaming
        #[arg(long)]
        continuous: bool,

        /// Output directory
        #[arg(long)]
        output: PathBuf,

        /// Optional configuration file
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Load and validate a configuration file
    CheckConfig {
        /// Path to the TOML file
        path: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            rows,
            timepoints,
            interval,
            drift,
            continuous,
            output,
            config,
        } => run_acquisition(rows, timepoints, interval, drift, continuous, output, config),
        Commands::CheckConfig { path } => check_config(path),
    }
}

fn load_config(path: Option<PathBuf>) -> Result<AcquisitionConfig> {
    let config = match path {
        Some(path) => AcquisitionConfig::load_from(&path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => AcquisitionConfig::load()?,
    };
    config.validate()?;
    Ok(config)
}

fn run_acquisition(
    rows: Vec<RowSpec>,
    timepoints: u32,
    interval: f64,
    drift: DriftChoice,
    continuous: bool,
    output: PathBuf,
    config: Option<PathBuf>,
) -> Result<()> {
    let config = load_config(config)?;
    tracing_setup::init_from_config(&config)?;

    println!("🔬 lightsheet-daq - {} row(s) x {} time point(s)", rows.len(), timepoints);

    let writer = RawStackWriter::create(&output)?;
    writer.write_config_snapshot(&config)?;

    let mut builder = RunParameters::builder(Box::new(writer))
        .rows(rows)
        .time_series(timepoints, interval)
        .continuous(continuous);
    builder = match drift {
        DriftChoice::None => builder,
        DriftChoice::Centroid => builder.drift(centroid_factory()),
        DriftChoice::Projection => builder.drift(projection_factory()),
    };
    let params = builder.build()?;

    println!("🔧 Initializing simulated microscope...");
    let scene = MockScene {
        sample: Vector3::new(0.0, 0.0, 10.0),
        pixel_size: config.drift.pixel_size_um,
        noise: 20.0,
        ..Default::default()
    };
    let scope = MockMicroscope::new(128, 128).with_scene(scene);

    println!("▶️  Acquiring into {}", output.display());
    let mut sequencer = AcquisitionSequencer::new(scope, config);
    let report = sequencer.run(params);

    println!();
    println!("Run {}: {}", report.run_uid, report.status);
    println!(
        "   {} slices in {} stacks, {:.2} s",
        report.slices_captured,
        report.stacks_completed,
        report.elapsed.as_secs_f64()
    );
    for (row, offset) in &report.drift_offsets {
        println!("   {row}: drift offset {offset}");
    }

    if report.status.is_success() {
        println!("✅ Done");
        Ok(())
    } else {
        eprintln!("❌ Acquisition did not complete");
        Err(anyhow::anyhow!("{}", report.status))
    }
}

fn check_config(path: PathBuf) -> Result<()> {
    let config = load_config(Some(path.clone()))?;
    println!("✅ {} is valid", path.display());
    println!();
    print!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}
