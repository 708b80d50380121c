//! Common types shared by the daemon core
//!
//! Client identities, device addresses, power modes and the status codes
//! reported back to clients.

use std::fmt;
use thiserror::Error;

/// Opaque identity of a client connection.
///
/// Assigned by the transport when a client connects. The core never looks
/// inside it; it is only compared, hashed and copied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientId(pub u32);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client#{}", self.0)
    }
}

/// Controller-level (ACL) connection handle
pub type ConnectionHandle = u16;

/// Bluetooth device address, stored most significant byte first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BdAddr {
    pub bytes: [u8; 6],
}

impl BdAddr {
    pub fn new(bytes: [u8; 6]) -> Self {
        Self { bytes }
    }

    /// Build an address from its over-the-air (little endian) byte order
    pub fn from_wire(slice: &[u8]) -> Option<Self> {
        if slice.len() < 6 {
            return None;
        }
        let mut bytes = [0u8; 6];
        for (i, b) in slice[..6].iter().rev().enumerate() {
            bytes[i] = *b;
        }
        Some(Self { bytes })
    }

    /// Address in over-the-air (little endian) byte order
    pub fn to_wire(&self) -> [u8; 6] {
        let mut wire = self.bytes;
        wire.reverse();
        wire
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.bytes[0], self.bytes[1], self.bytes[2], self.bytes[3], self.bytes[4], self.bytes[5]
        )
    }
}

/// Power mode requested by a client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PowerMode {
    #[default]
    Off = 0,
    On = 1,
    Sleep = 2,
}

impl PowerMode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(PowerMode::Off),
            1 => Some(PowerMode::On),
            2 => Some(PowerMode::Sleep),
            _ => None,
        }
    }
}

impl fmt::Display for PowerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PowerMode::Off => write!(f, "off"),
            PowerMode::On => write!(f, "on"),
            PowerMode::Sleep => write!(f, "sleep"),
        }
    }
}

/// Status byte reported by the protocol stack and forwarded to clients.
///
/// Zero is success; the non-zero values mix HCI error codes with the
/// daemon's own codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[error("status 0x{0:02x}")]
pub struct StatusCode(pub u8);

impl StatusCode {
    pub const SUCCESS: StatusCode = StatusCode(0x00);
    pub const UNKNOWN_HCI_COMMAND: StatusCode = StatusCode(0x01);
    pub const UNKNOWN_CONNECTION_IDENTIFIER: StatusCode = StatusCode(0x02);
    pub const PAGE_TIMEOUT: StatusCode = StatusCode(0x04);
    pub const COMMAND_DISALLOWED: StatusCode = StatusCode(0x0C);
    pub const INVALID_PARAMETERS: StatusCode = StatusCode(0x12);
    pub const UNSPECIFIED_ERROR: StatusCode = StatusCode(0x1F);
    pub const MEMORY_ALLOC_FAILED: StatusCode = StatusCode(0x56);
    pub const SERVICE_ALREADY_REGISTERED: StatusCode = StatusCode(0x69);
    pub const SERVICE_DOES_NOT_EXIST: StatusCode = StatusCode(0x6A);
    pub const RFCOMM_CHANNEL_ALREADY_REGISTERED: StatusCode = StatusCode(0x73);
    pub const NOT_CONNECTED: StatusCode = StatusCode(0x7E);
    pub const BUSY: StatusCode = StatusCode(0x7F);

    pub fn is_success(&self) -> bool {
        self.0 == 0
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}
