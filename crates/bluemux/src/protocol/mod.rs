//! Client wire protocol
//!
//! Framing of the client socket, decoding of daemon commands and encoding of
//! the events the daemon sends back.

pub mod command;
pub mod constants;
pub mod event;
pub mod frame;


use thiserror::Error;

pub use command::{Command, CommandHeader, GattRequest};
pub use frame::{FrameDecoder, Packet};

/// Errors decoding client input
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Frame too short: {0} bytes")]
    FrameTooShort(usize),

    #[error("Frame length mismatch: declared {declared}, got {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("Payload too long for one frame: {0} bytes")]
    PayloadTooLong(usize),

    #[error("Command 0x{opcode:04x} truncated: needs {needed} parameter bytes, got {actual}")]
    Truncated {
        opcode: u16,
        needed: usize,
        actual: usize,
    },

    #[error("Unknown command opcode 0x{0:04x}")]
    UnknownCommand(u16),

    #[error("Invalid {field}: 0x{value:x}")]
    InvalidValue { field: &'static str, value: u32 },
}
