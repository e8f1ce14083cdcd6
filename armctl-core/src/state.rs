//! Status snapshots
//!
//! Read-only views of the engine, sufficient for a polling UI to render the
//! current session, calibration completeness and bus ownership without the
//! engine pushing events. All types serialize to camelCase JSON.

use serde::{Deserialize, Serialize};
use strum::Display;

use crate::calibration::CalibrationProfile;
use crate::command::CommandSource;

/// Which session currently owns the recording/playback slot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SessionKind {
    #[default]
    Idle,
    Recording,
    Playing,
}

/// `100 * current_index / total`, 0 for an empty total
pub fn progress_percent(current_index: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        100.0 * current_index as f64 / total as f64
    }
}

/// Current session kind plus progress
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub kind: SessionKind,
    /// Milliseconds since the session started
    pub elapsed_ms: u64,
    /// Frames captured so far (recording only)
    pub frames_captured: usize,
    /// Index of the last applied frame; equals `total_frames` once finished
    pub current_index: usize,
    pub total_frames: usize,
    pub progress: f64,
    /// Set when a recording sampler stopped on an error
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SessionStatus {
    pub fn idle() -> Self {
        Self::default()
    }
}

/// How a playback session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PlaybackOutcome {
    /// Every frame was applied
    Completed,
    /// `stop_playback` was called
    Stopped,
    /// Torque was released under the running playback
    Released,
    /// A command failed; see [`PlaybackSummary::error`]
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackSummary {
    pub outcome: PlaybackOutcome,
    pub current_index: usize,
    pub total_frames: usize,
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Calibration completeness of one actuator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationStatus {
    pub actuator: String,
    pub complete: bool,
    pub profile: CalibrationProfile,
}

/// Torque state as last commanded by the arbiter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TorqueState {
    /// Nothing commanded yet since start-up
    #[default]
    Unknown,
    Locked,
    Released,
}

/// Ownership of one actuator's bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusStatus {
    pub actuator: String,
    pub torque: TorqueState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub holder: Option<CommandSource>,
    /// Last raw tick written to this actuator
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_raw: Option<i32>,
}

/// Everything a status poll returns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub session: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_playback: Option<PlaybackSummary>,
    pub calibration: Vec<CalibrationStatus>,
    pub bus: Vec<BusStatus>,
}

impl StatusSnapshot {
    /// Names of actuators whose calibration is not complete
    pub fn uncalibrated(&self) -> Vec<&str> {
        self.calibration
            .iter()
            .filter(|c| !c.complete)
            .map(|c| c.actuator.as_str())
            .collect()
    }
}
