//! Error types for calibration, normalization and arbitration

use thiserror::Error;

use crate::command::CommandSource;
use crate::io::TransportError;

/// Errors returned by every fallible operation of the motion core.
///
/// These are always handed back to the caller; nothing in the core retries
/// an operation or swallows a failure.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ArmError {
    /// Talking to the hardware failed
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Normalization needs both calibration bounds, and they must differ
    #[error("Calibration incomplete for actuator '{actuator}'")]
    CalibrationIncomplete { actuator: String },

    /// Bad interval, empty recording, malformed persisted data
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Another control source holds the actuator bus
    #[error("Actuator '{actuator}' is held by {holder}")]
    BusConflict {
        actuator: String,
        holder: CommandSource,
    },

    /// Name not present in the actuator registry
    #[error("Unknown actuator: {0}")]
    UnknownActuator(String),
}

impl ArmError {
    pub fn incomplete(actuator: &str) -> Self {
        ArmError::CalibrationIncomplete {
            actuator: actuator.to_string(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        ArmError::InvalidArgument(message.into())
    }

    pub fn conflict(actuator: &str, holder: CommandSource) -> Self {
        ArmError::BusConflict {
            actuator: actuator.to_string(),
            holder,
        }
    }

    /// True for failures caused by the hardware link rather than by the caller
    pub fn is_transport(&self) -> bool {
        matches!(self, ArmError::Transport(_))
    }
}

impl From<serde_json::Error> for ArmError {
    fn from(e: serde_json::Error) -> Self {
        ArmError::InvalidArgument(format!("malformed JSON: {}", e))
    }
}
