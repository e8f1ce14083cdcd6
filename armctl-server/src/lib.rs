//! # armctl Server
//!
//! Controller for SO-100/SO-101 class robot arms on a Feetech serial bus.
//!
//! This crate ties the platform-independent model of [`armctl_core`] to real
//! hardware and files:
//! - Talks to the servos over a serial port (or an in-memory emulator)
//! - Arbitrates write access between manual jog, homing, calibration and playback
//! - Runs the timed auto-calibration sweep
//! - Records and replays motion sequences
//! - Persists calibration, settings and recordings
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    armctl-server                        │
//! │  ┌─────────────┐  ┌─────────────┐  ┌──────────────────┐ │
//! │  │ CLI (clap)  │  │ storage /   │  │ recording        │ │
//! │  │ commands    │  │ config      │  │ manager / files  │ │
//! │  └──────┬──────┘  └─────────────┘  └──────────────────┘ │
//! │         │                                               │
//! │         ▼                                               │
//! │  ┌─────────────────────────────────────────────────────┐│
//! │  │              MotionEngine                           ││
//! │  │  - Session slot (idle / recording / playing)        ││
//! │  │  - Recorder and playback driver tasks               ││
//! │  │  - Auto sweep                                       ││
//! │  └─────────────────────────────────────────────────────┘│
//! │         │                                               │
//! │         ▼                                               │
//! │  ┌─────────────────────────────────────────────────────┐│
//! │  │              Arbiter                                ││
//! │  │  - Per-actuator bus claims and torque state         ││
//! │  │  - Percentage → raw conversion via calibration      ││
//! │  └─────────────────────────────────────────────────────┘│
//! │         │                                               │
//! │         ▼                                               │
//! │  ┌─────────────────────────────────────────────────────┐│
//! │  │  FeetechTransport / EmulatorTransport               ││
//! │  │  - Implements armctl_core::Transport                ││
//! │  └─────────────────────────────────────────────────────┘│
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example: Running a Command
//!
//! ```rust,no_run
//! use clap::Parser;
//! use armctl_server::Cli;
//! use tokio_graceful_shutdown::{SubsystemBuilder, Toplevel};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let cli = Cli::parse_from(["armctl", "--emulator", "status"]);
//!
//!     Toplevel::new(|s| async move {
//!         s.start(SubsystemBuilder::new("armctl", |subsys| {
//!             armctl_server::commands::run(cli, subsys)
//!         }));
//!     })
//!     .catch_signals()
//!     .handle_shutdown_requests(Duration::from_secs(2))
//!     .await
//!     .unwrap();
//! }
//! ```
//!
//! ## Command-Line Interface
//!
//! See [`Cli`] and [`Command`] for all options. Key options:
//!
//! - `--port` - Serial port of the servo bus (stored in settings when omitted)
//! - `--emulator` - Use the in-memory bus instead of hardware
//! - `--calibration` - Calibration file (default: config directory)
//! - `-v` - Increase verbosity (use multiple times)

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use thiserror::Error;

use armctl_core::{ArmError, PointKind, TransportError};

pub mod arbiter;
pub mod calibration;
pub mod commands;
pub mod config;
pub mod engine;
pub mod recording;
pub mod storage;
pub mod transport;

pub use engine::MotionEngine;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Clone, Debug)]
#[command(name = "armctl", version, about)]
pub struct Cli {
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>,

    /// Serial port of the servo bus, e.g. /dev/ttyACM0 or COM3
    #[arg(short, long, global = true)]
    pub port: Option<String>,

    /// Baud rate of the servo bus
    #[arg(short, long, global = true)]
    pub baud: Option<u32>,

    /// Use an emulated bus instead of hardware
    #[arg(long, default_value_t = false, global = true)]
    pub emulator: bool,

    /// Calibration file to load and update
    #[arg(long, global = true)]
    pub calibration: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Command {
    /// List serial ports
    Ports,

    /// Print calibration, bus and session status as JSON
    Status,

    /// Auto-calibrate: release each joint in turn and record its travel
    Calibrate {
        /// Actuators to sweep (default: all)
        actuators: Vec<String>,
        /// Milliseconds between samples
        #[arg(long)]
        sample_interval_ms: Option<u64>,
        /// Samples per actuator
        #[arg(long)]
        samples: Option<u32>,
    },

    /// Store the present position of one actuator as a reference point
    Capture {
        actuator: String,
        #[arg(value_parser = parse_point)]
        point: PointKind,
    },

    /// Forget the calibration of one actuator
    Reset { actuator: String },

    /// Move to the calibrated center and hold
    Home { actuators: Vec<String> },

    /// Hold the present position with torque on
    Lock { actuators: Vec<String> },

    /// Turn torque off so the arm can be moved by hand
    Release { actuators: Vec<String> },

    /// Move one actuator to a percentage of its calibrated range
    Jog { actuator: String, percentage: f64 },

    /// Record motion until interrupted (Ctrl-C) or for a fixed time
    Record {
        /// Sample interval in milliseconds
        #[arg(short, long)]
        interval_ms: Option<u64>,
        /// Stop after this many seconds
        #[arg(short, long)]
        duration_s: Option<u64>,
        /// File name in the recordings directory (default: timestamped)
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Replay a recording (name in the recordings directory, or a path)
    Play { recording: String },

    /// List saved recordings, newest first
    Recordings,

    /// Delete a saved recording
    Delete { recording: String },

    /// Convert a recording from the earlier Python controller
    Import {
        file: PathBuf,
        /// File name in the recordings directory (default: imported_<timestamp>)
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Show effective settings
    Config {
        /// Store the effective settings (including --port/--baud) as defaults
        #[arg(long, default_value_t = false)]
        save: bool,
    },
}

fn parse_point(s: &str) -> Result<PointKind, String> {
    s.to_ascii_lowercase()
        .parse()
        .map_err(|_| format!("expected left, center or right, got '{}'", s))
}

/// Errors a command can end with
#[derive(Error, Debug)]
pub enum CommandError {
    #[error(transparent)]
    Arm(#[from] ArmError),

    #[error(transparent)]
    Storage(#[from] storage::StorageError),

    #[error("Playback failed: {0}")]
    Playback(String),

    #[error("{failed} of {total} actuator(s) failed")]
    Partial { failed: usize, total: usize },
}

impl From<TransportError> for CommandError {
    fn from(e: TransportError) -> Self {
        CommandError::Arm(e.into())
    }
}
