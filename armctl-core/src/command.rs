//! Write intents submitted to the control arbiter

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Who is asking to move an actuator.
///
/// The order of precedence is enforced by the arbiter, not by this type:
/// `playback` is never preempted, `homing` and `calibration` preempt
/// `manual`, and `manual` never preempts anything.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CommandSource {
    Manual,
    Homing,
    Calibration,
    Playback,
}

/// A single move request, consumed once by the arbiter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActuatorCommand {
    pub actuator: String,
    /// Target position, always within 0..=100
    pub percentage: f64,
    pub source: CommandSource,
}

impl ActuatorCommand {
    /// Build a command; the percentage is clamped to 0..=100 (NaN becomes 0).
    pub fn new(actuator: &str, percentage: f64, source: CommandSource) -> Self {
        let percentage = if percentage.is_nan() {
            0.0
        } else {
            percentage.clamp(0.0, 100.0)
        };
        Self {
            actuator: actuator.to_string(),
            percentage,
            source,
        }
    }

    pub fn manual(actuator: &str, percentage: f64) -> Self {
        Self::new(actuator, percentage, CommandSource::Manual)
    }
}
