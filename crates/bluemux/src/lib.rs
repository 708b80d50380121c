//! bluemux - shared-controller bookkeeping for a multiplexing Bluetooth daemon
//!
//! Several local client processes talk to one Bluetooth controller through the
//! daemon. This library tracks which client owns which protocol resource
//! (L2CAP channels and services, RFCOMM channels and services, SDP records,
//! GATT client connections), routes asynchronous stack events back to the
//! owning client, reclaims everything a client held when it goes away, and
//! merges the clients' power and discoverability requests into a single
//! controller state.
//!
//! The protocol engines and the client transport are collaborators reached
//! through the traits in [`stack`] and [`transport`].

pub mod config;
pub mod daemon;
pub mod dump;
pub mod error;
pub mod gatt;
pub mod ledger;
pub mod power;
pub mod protocol;
pub mod session;
pub mod stack;
pub mod transport;
pub mod types;

// Re-export common types for convenience
pub use config::{ConfigError, DaemonConfig};
pub use daemon::Daemon;
pub use error::{DaemonError, DaemonResult};
pub use gatt::{GattClientHelper, GattHelperRegistry, LongAttributeKind};
pub use ledger::{Acquired, ResourceKind, ResourceLedger, ResourceSet};
pub use power::{BluetoothStatus, ControllerState, IdleOutcome, PowerArbiter};
pub use protocol::{Command, Packet, ProtocolError};
pub use session::{ClientSession, SessionTable};
pub use stack::{ProtocolStack, StackEvent, StackResult};
pub use transport::ClientTransport;
pub use types::{BdAddr, ClientId, ConnectionHandle, PowerMode, StatusCode};
