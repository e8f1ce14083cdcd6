//! Transport implementations for the motion core.
//!
//! - [`FeetechTransport`]: Feetech STS/SCS serial bus (real hardware)
//! - [`EmulatorTransport`]: in-memory bus for dry runs and tests
//!
//! Both implement [`armctl_core::Transport`] and are shared behind an `Arc`.

pub mod emulator;
pub mod feetech;

use std::sync::Arc;
use std::time::Duration;

use armctl_core::{ActuatorRegistry, Transport, TransportError};

pub use emulator::{BusEvent, EmulatorTransport};
pub use feetech::{available_ports, FeetechTransport, DEFAULT_BAUD};

/// Shared handle used by the arbiter, the sampler and the sweep
pub type SharedTransport = Arc<dyn Transport>;

/// Serial read timeout for one status packet
pub const SERIAL_TIMEOUT: Duration = Duration::from_millis(50);

/// Open the transport selected on the command line
pub fn open(
    port: Option<&str>,
    baud: u32,
    emulator: bool,
    registry: &ActuatorRegistry,
) -> Result<SharedTransport, TransportError> {
    if emulator {
        log::info!("Using emulated servo bus");
        return Ok(Arc::new(EmulatorTransport::new(registry)));
    }
    match port {
        Some(port) => Ok(Arc::new(FeetechTransport::open(port, baud, SERIAL_TIMEOUT)?)),
        None => Err(TransportError::new(
            -19,
            "No serial port configured; pass --port or --emulator",
        )),
    }
}
