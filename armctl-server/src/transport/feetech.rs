//! Feetech STS/SCS serial bus transport.
//!
//! Half-duplex request/response protocol used by the STS3215 servos of the
//! SO-100/SO-101 arms:
//!
//! ```text
//! request:  FF FF <id> <len> <instr> <params…> <checksum>
//! status:   FF FF <id> <len> <error> <params…> <checksum>
//!
//! len      = params + 2
//! checksum = !(id + len + instr/error + Σ params)   (wrapping u8)
//! ```
//!
//! Only the three registers the motion core needs are touched:
//! `Torque_Enable`, `Goal_Position` and `Present_Position`.
//!
//! Every reply is validated (header, id, length, checksum, servo error
//! byte). A lost or corrupted byte surfaces as a [`TransportError`]; the
//! input buffer is flushed before each transaction so the next one starts
//! clean. Nothing is retried here.

use log::{debug, info, trace};
use serialport::{ClearBuffer, SerialPort, SerialPortType};
use std::io::{self, Read, Write};
use std::sync::Mutex;
use std::time::Duration;

use armctl_core::io::{PortInfo, Transport, TransportError};
use armctl_core::Actuator;

const HEADER: [u8; 2] = [0xFF, 0xFF];

const INSTR_READ: u8 = 0x02;
const INSTR_WRITE: u8 = 0x03;

const ADDR_TORQUE_ENABLE: u8 = 0x28;
const ADDR_GOAL_POSITION: u8 = 0x2A;
const ADDR_PRESENT_POSITION: u8 = 0x38;

/// Default baud rate of STS3215 servos
pub const DEFAULT_BAUD: u32 = 1_000_000;

fn checksum(data: &[u8]) -> u8 {
    let mut s: u8 = 0;
    for &b in data {
        s = s.wrapping_add(b);
    }
    !s
}

/// Build a request packet
pub(crate) fn encode_packet(id: u8, instr: u8, params: &[u8]) -> Vec<u8> {
    let length = (params.len() + 2) as u8;
    let mut pkt = Vec::with_capacity(6 + params.len());
    pkt.extend_from_slice(&HEADER);
    pkt.push(id);
    pkt.push(length);
    pkt.push(instr);
    pkt.extend_from_slice(params);
    pkt.push(checksum(&pkt[2..]));
    pkt
}

fn io_error(id: u8, e: io::Error) -> TransportError {
    match e.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::UnexpectedEof => TransportError::timeout(id),
        _ => TransportError::new(-5, format!("Serial I/O error on servo {}: {}", id, e)),
    }
}

/// Read and validate one status packet, returning its parameters
pub(crate) fn read_status<R: Read>(reader: &mut R, id: u8) -> Result<Vec<u8>, TransportError> {
    let mut hdr = [0u8; 4];
    reader.read_exact(&mut hdr).map_err(|e| io_error(id, e))?;
    if hdr[0..2] != HEADER {
        return Err(TransportError::corrupt(
            id,
            format!("bad header {:02X?}", &hdr[0..2]),
        ));
    }
    if hdr[2] != id {
        return Err(TransportError::corrupt(
            id,
            format!("reply from id {}", hdr[2]),
        ));
    }
    let len = hdr[3] as usize;
    if len < 2 {
        return Err(TransportError::corrupt(id, format!("length {}", len)));
    }

    // error byte, params, checksum
    let mut rest = vec![0u8; len];
    reader.read_exact(&mut rest).map_err(|e| io_error(id, e))?;

    let (body, sum) = rest.split_at(len - 1);
    let mut covered = vec![hdr[2], hdr[3]];
    covered.extend_from_slice(body);
    if checksum(&covered) != sum[0] {
        return Err(TransportError::corrupt(id, "checksum mismatch"));
    }

    let error = body[0];
    if error != 0 {
        return Err(TransportError::servo_fault(id, error));
    }
    Ok(body[1..].to_vec())
}

/// Serial connection to one Feetech bus
pub struct FeetechTransport {
    port_name: String,
    port: Mutex<Box<dyn SerialPort>>,
}

impl FeetechTransport {
    pub fn open(port_name: &str, baud: u32, timeout: Duration) -> Result<Self, TransportError> {
        info!("Opening servo bus {} at {} bps", port_name, baud);
        let port = serialport::new(port_name, baud)
            .timeout(timeout)
            .open()
            .map_err(|e| TransportError::new(-19, format!("Cannot open {}: {}", port_name, e)))?;
        Ok(Self {
            port_name: port_name.to_string(),
            port: Mutex::new(port),
        })
    }

    /// One request/response exchange. The port stays locked for both halves.
    fn transact(&self, id: u8, instr: u8, params: &[u8]) -> Result<Vec<u8>, TransportError> {
        let mut port = self
            .port
            .lock()
            .map_err(|_| TransportError::not_connected())?;

        if let Err(e) = port.clear(ClearBuffer::Input) {
            debug!("{}: cannot flush input: {}", self.port_name, e);
        }

        let pkt = encode_packet(id, instr, params);
        trace!("{} -> {:02X?}", self.port_name, pkt);
        port.write_all(&pkt).map_err(|e| io_error(id, e))?;
        port.flush().map_err(|e| io_error(id, e))?;

        let reply = read_status(&mut *port, id);
        trace!("{} <- {:?}", self.port_name, reply);
        reply
    }

    fn write_register(&self, id: u8, address: u8, data: &[u8]) -> Result<(), TransportError> {
        let mut params = Vec::with_capacity(1 + data.len());
        params.push(address);
        params.extend_from_slice(data);
        self.transact(id, INSTR_WRITE, &params).map(|_| ())
    }
}

/// Enumerate serial ports the OS knows about
pub fn available_ports() -> Vec<PortInfo> {
    match serialport::available_ports() {
        Ok(ports) => ports
            .into_iter()
            .map(|p| PortInfo {
                description: match p.port_type {
                    SerialPortType::UsbPort(usb) => Some(
                        usb.product
                            .unwrap_or_else(|| format!("USB {:04x}:{:04x}", usb.vid, usb.pid)),
                    ),
                    SerialPortType::BluetoothPort => Some("Bluetooth".to_string()),
                    _ => None,
                },
                name: p.port_name,
            })
            .collect(),
        Err(e) => {
            debug!("Cannot enumerate serial ports: {}", e);
            Vec::new()
        }
    }
}

impl Transport for FeetechTransport {
    fn read_raw_position(&self, actuator: &Actuator) -> Result<i32, TransportError> {
        let data = self.transact(actuator.id, INSTR_READ, &[ADDR_PRESENT_POSITION, 2])?;
        if data.len() < 2 {
            return Err(TransportError::corrupt(actuator.id, "short position reply"));
        }
        Ok(i32::from(u16::from_le_bytes([data[0], data[1]])))
    }

    fn write_raw_position(&self, actuator: &Actuator, raw: i32) -> Result<(), TransportError> {
        let raw = actuator.clamp_raw(raw) as u16;
        self.write_register(actuator.id, ADDR_GOAL_POSITION, &raw.to_le_bytes())
    }

    fn set_torque(&self, actuator: &Actuator, engaged: bool) -> Result<(), TransportError> {
        self.write_register(actuator.id, ADDR_TORQUE_ENABLE, &[u8::from(engaged)])
    }

    fn list_ports(&self) -> Vec<PortInfo> {
        available_ports()
    }
}
