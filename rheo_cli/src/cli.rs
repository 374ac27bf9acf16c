//! CLI argument definitions and shared statics.

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::OnceLock;

pub static FILE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();
/// Whether the user asked for JSON output (controls structured error output).
pub static JSON_MODE: OnceLock<bool> = OnceLock::new();

#[derive(Parser, Debug)]
#[command(name = "rheo", version, about = "Squeeze-flow rheometer CLI")]
pub struct Cli {
    /// Path to session config TOML (typed)
    #[arg(long, value_name = "FILE", default_value = "etc/rheo_config.toml")]
    pub config: PathBuf,

    /// Path to the persisted load-cell record (tare, calibration, units, gap)
    #[arg(long, value_name = "FILE", default_value = "etc/load_cell.json")]
    pub cell: PathBuf,

    /// Log as JSON lines instead of pretty
    #[arg(long, action = ArgAction::SetTrue)]
    pub json: bool,

    /// Console log level (error|warn|info|debug|trace)
    #[arg(long = "log-level", value_name = "LEVEL", default_value = "info")]
    pub log_level: String,

    /// Command to execute
    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a force-tracking squeeze-flow test
    Run {
        /// Override config: strictly increasing force targets, comma-separated
        #[arg(long, value_delimiter = ',', value_name = "FORCE,...")]
        targets: Option<Vec<f64>>,
        /// Override config: starting gap in mm
        #[arg(long, value_name = "MM")]
        gap_mm: Option<f64>,
        /// Override config: sample volume in mL
        #[arg(long, value_name = "ML")]
        volume_ml: Option<f64>,
        /// Override config: sample identifier used in the output filename
        #[arg(long, value_name = "NAME")]
        sample: Option<String>,
        /// Override config: per-step hold duration in seconds
        #[arg(long, value_name = "SECS")]
        step_duration_s: Option<f64>,
        /// Override config: max-force safety cutoff
        #[arg(long, value_name = "FORCE")]
        max_force: Option<f64>,
        /// Directory for the output record stream (default from config)
        #[arg(long, value_name = "DIR")]
        data_dir: Option<PathBuf>,
        /// Re-tare automatically when the load cell reads out of tare at start
        #[arg(long, action = ArgAction::SetTrue)]
        auto_tare: bool,
        /// Drive the simulated rig instead of real hardware
        #[arg(long, action = ArgAction::SetTrue)]
        simulate: bool,
    },
    /// Tare the load cell and persist the new baseline
    Tare {
        /// Number of readings to average
        #[arg(long, default_value_t = 200)]
        samples: usize,
        /// Tare the simulated rig instead of real hardware
        #[arg(long, action = ArgAction::SetTrue)]
        simulate: bool,
    },
    /// Fit a calibration CSV (strict 'raw,force' header) and persist it
    Calibrate {
        /// Calibration CSV recorded with known weights
        #[arg(long, value_name = "FILE")]
        csv: PathBuf,
    },
    /// Quick health check: a short run over the simulated rig
    SelfCheck,
}
