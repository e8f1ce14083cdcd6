//! Calibration runners that need the async runtime.
//!
//! The profile model and manual capture live in [`armctl_core::calibration`];
//! this module adds the timed auto sweep.

pub mod sweep;

pub use sweep::{run_auto_sweep, SweepOptions, SweepOutcome, SweepProgress, SweepReport};
