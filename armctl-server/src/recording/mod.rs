//! Motion recording and playback.
//!
//! This module provides functionality to:
//! - Sample calibrated actuators into frames ([`recorder`])
//! - Drive claimed actuators through a recording ([`player`])
//! - Manage recording files (list, save, load, delete) ([`manager`])
//! - Read, write and import recording files ([`file_format`])
//!
//! Only one session runs at a time; [`crate::engine::MotionEngine`] owns the
//! slot. Both the sampler and the playback driver schedule against the
//! session start (`start + offset`), so timing errors do not accumulate.

pub mod file_format;
pub mod manager;
pub mod player;
pub mod recorder;

pub use file_format::{import_legacy, read_recording, write_recording, LegacyImport};
pub use manager::{recordings_dir, RecordingInfo, RecordingManager};
pub use player::{start_playback, ActivePlayback, SummarySlot};
pub use recorder::{start_recording, ActiveRecording};
