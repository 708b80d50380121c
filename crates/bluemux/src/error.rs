//! Error types for the bluemux daemon core
//!
//! Every failure is eventually reported to a client as a status byte, so each
//! error maps to a [`StatusCode`].

use thiserror::Error;

use crate::ledger::ResourceKind;
use crate::protocol::ProtocolError;
use crate::types::{ClientId, ConnectionHandle, StatusCode};

/// Errors raised by the daemon core
#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("No open link for connection handle 0x{0:04x}")]
    NotConnected(ConnectionHandle),

    #[error("GATT query already in progress on connection handle 0x{0:04x}")]
    Busy(ConnectionHandle),

    #[error("Allocation failed: {0}")]
    AllocationFailed(String),

    #[error("Unknown {kind} 0x{value:04x}")]
    UnknownResource { kind: ResourceKind, value: u32 },

    #[error("{kind} 0x{value:04x} already owned by {owner}")]
    OwnershipConflict {
        kind: ResourceKind,
        value: u32,
        owner: ClientId,
    },

    #[error("Unknown client {0}")]
    UnknownClient(ClientId),

    #[error("Session for {0} already exists")]
    DuplicateSession(ClientId),

    #[error("{client} still holds {count} resources")]
    ResourcesOutstanding { client: ClientId, count: usize },

    #[error("Long attribute fragment exceeds buffer ({0} bytes)")]
    AttributeTooLong(usize),

    #[error("Malformed command: {0}")]
    MalformedCommand(#[from] ProtocolError),

    #[error("Unknown command opcode 0x{0:04x}")]
    UnknownCommand(u16),

    #[error("Stack rejected request: {0}")]
    Stack(#[from] StatusCode),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DaemonError {
    /// Status byte reported to the client for this error
    pub fn status(&self) -> StatusCode {
        match self {
            DaemonError::NotConnected(_) => StatusCode::NOT_CONNECTED,
            DaemonError::Busy(_) => StatusCode::BUSY,
            DaemonError::AllocationFailed(_) => StatusCode::MEMORY_ALLOC_FAILED,
            DaemonError::UnknownResource { .. } => StatusCode::UNKNOWN_CONNECTION_IDENTIFIER,
            DaemonError::OwnershipConflict { .. } => StatusCode::COMMAND_DISALLOWED,
            DaemonError::UnknownClient(_) | DaemonError::DuplicateSession(_) => {
                StatusCode::COMMAND_DISALLOWED
            }
            DaemonError::ResourcesOutstanding { .. } => StatusCode::COMMAND_DISALLOWED,
            DaemonError::AttributeTooLong(_) => StatusCode::MEMORY_ALLOC_FAILED,
            DaemonError::MalformedCommand(_) => StatusCode::INVALID_PARAMETERS,
            DaemonError::UnknownCommand(_) => StatusCode::UNKNOWN_HCI_COMMAND,
            DaemonError::Stack(status) => *status,
            DaemonError::Io(_) => StatusCode::UNSPECIFIED_ERROR,
        }
    }
}

/// Result type for daemon core operations
pub type DaemonResult<T> = Result<T, DaemonError>;
