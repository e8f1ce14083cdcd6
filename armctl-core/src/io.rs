//! Transport abstraction for platform-independent motion code.
//!
//! This module defines the trait that abstracts the physical read/write of
//! raw servo positions and torque state, allowing the same calibration,
//! arbitration and playback logic to run against a real serial bus or an
//! in-memory emulator.
//!
//! # Design
//!
//! The trait is **synchronous** and takes `&self`:
//! - a serial bus transaction is a short request/response exchange
//! - implementations serialize access internally (a mutex around the port),
//!   so one transport can be shared between the arbiter, the sampler and the
//!   calibration sweep
//!
//! Every call either succeeds or returns a [`TransportError`]. Implementations
//! must not retry: retry policy belongs to the caller.
//!
//! # Example
//!
//! ```rust,ignore
//! use armctl_core::io::Transport;
//!
//! fn hold<T: Transport>(io: &T, actuator: &Actuator) -> Result<(), TransportError> {
//!     let raw = io.read_raw_position(actuator)?;
//!     io.write_raw_position(actuator, raw)?;
//!     io.set_torque(actuator, true)
//! }
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::actuator::Actuator;

// =============================================================================
// Error Types
// =============================================================================

/// I/O error talking to the actuator bus.
///
/// Kept minimal so that any transport (serial, emulator, FFI) can produce it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} (code {code})")]
pub struct TransportError {
    /// Error code (negative values, specific meaning varies by transport)
    pub code: i32,
    /// Human-readable error message
    pub message: String,
}

impl TransportError {
    /// Create a new transport error with a code and message.
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// The servo did not answer in time.
    pub fn timeout(servo_id: u8) -> Self {
        Self::new(-110, format!("Timeout waiting for servo {}", servo_id))
    }

    /// The port is not open.
    pub fn not_connected() -> Self {
        Self::new(-1, "Not connected")
    }

    /// A status packet failed framing or checksum validation.
    pub fn corrupt(servo_id: u8, detail: impl Into<String>) -> Self {
        Self::new(
            -74,
            format!("Corrupt reply from servo {}: {}", servo_id, detail.into()),
        )
    }

    /// The servo reported an error flag in its status packet.
    pub fn servo_fault(servo_id: u8, flags: u8) -> Self {
        Self::new(-5, format!("Servo {} reported error {:#04X}", servo_id, flags))
    }

    /// Check if this is a timeout.
    pub fn is_timeout(&self) -> bool {
        self.code == -110
    }
}

// =============================================================================
// Port descriptors
// =============================================================================

/// A serial port candidate, as returned by [`Transport::list_ports`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortInfo {
    /// OS device name, e.g. `/dev/ttyACM0` or `COM3`
    pub name: String,
    /// Human readable description (USB product string when known)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

// =============================================================================
// Transport Trait
// =============================================================================

/// Platform-independent actuator transport.
///
/// Implementations exist for:
/// - **Feetech STS serial bus**: `armctl_server::transport::FeetechTransport`
/// - **Emulator**: `armctl_server::transport::EmulatorTransport`
pub trait Transport: Send + Sync {
    /// Read the present position of an actuator, in raw ticks.
    fn read_raw_position(&self, actuator: &Actuator) -> Result<i32, TransportError>;

    /// Set the goal position of an actuator, in raw ticks.
    fn write_raw_position(&self, actuator: &Actuator, raw: i32) -> Result<(), TransportError>;

    /// Engage (`true`) or disengage (`false`) holding torque.
    fn set_torque(&self, actuator: &Actuator, engaged: bool) -> Result<(), TransportError>;

    /// Enumerate candidate ports. Only setup flows use this.
    ///
    /// Default implementation reports nothing.
    fn list_ports(&self) -> Vec<PortInfo> {
        Vec::new()
    }
}

impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    fn read_raw_position(&self, actuator: &Actuator) -> Result<i32, TransportError> {
        (**self).read_raw_position(actuator)
    }

    fn write_raw_position(&self, actuator: &Actuator, raw: i32) -> Result<(), TransportError> {
        (**self).write_raw_position(actuator, raw)
    }

    fn set_torque(&self, actuator: &Actuator, engaged: bool) -> Result<(), TransportError> {
        (**self).set_torque(actuator, engaged)
    }

    fn list_ports(&self) -> Vec<PortInfo> {
        (**self).list_ports()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert!(TransportError::timeout(4).is_timeout());
        assert!(!TransportError::not_connected().is_timeout());
        assert_eq!(
            TransportError::servo_fault(2, 0x20).to_string(),
            "Servo 2 reported error 0x20 (code -5)"
        );
    }
}
