//! # armctl Core
//!
//! Platform-independent motion model for serial-bus robot arms
//! (SO-100 / SO-101 class, Feetech STS servos).
//!
//! This crate contains the pure calibration, normalization and recording
//! logic with **zero I/O dependencies**. Everything that touches hardware is
//! abstracted through the [`Transport`] trait, so the same code drives a real
//! serial bus or an emulator.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  armctl-core (platform-independent, no tokio/async deps)   │
//! │  ├── actuator/     (registry of named servos)              │
//! │  ├── calibration/  (left/center/right reference points)    │
//! │  ├── normalize/    (raw tick <-> percentage)               │
//! │  ├── recording/    (frames, persisted format, validation)  │
//! │  ├── state/        (status snapshots for polling UIs)      │
//! │  └── Transport     (abstracts servo reads/writes/torque)   │
//! └─────────────────────────────────────────────────────────────┘
//!                              ▲
//!                 ┌────────────┴────────────┐
//!                 │  armctl-server          │
//!                 │  (arbiter, sweep,       │
//!                 │   recorder, player)     │
//!                 └─────────────────────────┘
//! ```
//!
//! ## Example: Normalizing a Reading
//!
//! ```rust
//! use armctl_core::{ActuatorRegistry, CalibrationProfile, CalibrationStore};
//!
//! let mut store = CalibrationStore::new(ActuatorRegistry::so101());
//! store
//!     .replace("gripper", CalibrationProfile::new(2000, None, 2400))
//!     .unwrap();
//!
//! assert_eq!(store.to_percentage("gripper", 2100).unwrap(), 25.0);
//! assert_eq!(store.to_raw("gripper", 75.0).unwrap(), 2300);
//!
//! // Actuators without both bounds refuse to normalize
//! assert!(store.to_percentage("elbow_flex", 2100).is_err());
//! ```

pub mod actuator;
pub mod calibration;
pub mod command;
pub mod error;
pub mod io;
pub mod normalize;
pub mod recording;
pub mod state;

// Re-export commonly used types
pub use actuator::{Actuator, ActuatorRegistry, RAW_FULL_SCALE};
pub use calibration::{CalibrationProfile, CalibrationStore, LoadReport, PointKind, SweepTracker};
pub use command::{ActuatorCommand, CommandSource};
pub use error::ArmError;
pub use io::{PortInfo, Transport, TransportError};
pub use recording::{Frame, Recording, ValidatedRecording};
pub use state::{
    BusStatus, CalibrationStatus, PlaybackOutcome, PlaybackSummary, SessionKind, SessionStatus,
    StatusSnapshot, TorqueState,
};
