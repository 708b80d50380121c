//! Protocol engine interface
//!
//! The daemon core drives the Bluetooth protocol layers through these traits
//! and receives their asynchronous results as [`StackEvent`]s. Calls are
//! fire-and-forget: an `Ok` only means the request was accepted.

use crate::gatt::LongAttributeKind;
use crate::power::ControllerState;
use crate::protocol::command::GattRequest;
use crate::types::{BdAddr, ConnectionHandle, PowerMode, StatusCode};

/// Result of an engine call
pub type StackResult<T> = Result<T, StatusCode>;

/// Controller and GAP level operations
pub trait HciControl {
    fn set_power(&mut self, mode: PowerMode) -> StackResult<()>;
    fn set_discoverable(&mut self, discoverable: bool) -> StackResult<()>;
    /// Whether an open ACL link exists for `handle`
    fn is_link_open(&self, handle: ConnectionHandle) -> bool;
    fn disconnect(&mut self, handle: ConnectionHandle) -> StackResult<()>;
    fn disconnect_all(&mut self) -> StackResult<()>;
    /// Forward a raw HCI command (`opcode | len | params`)
    fn send_hci_command(&mut self, command: &[u8]) -> StackResult<()>;
    fn le_scan(&mut self, enable: bool) -> StackResult<()>;
    fn le_set_scan_parameters(&mut self, scan_type: u8, interval: u16, window: u16)
        -> StackResult<()>;
    fn le_connect(&mut self, addr_type: u8, addr: BdAddr) -> StackResult<()>;
    fn le_connect_cancel(&mut self) -> StackResult<()>;
}

pub trait L2capService {
    /// Start an outgoing channel, returns the local CID
    fn l2cap_create_channel(&mut self, addr: BdAddr, psm: u16, mtu: u16) -> StackResult<u16>;
    fn l2cap_disconnect(&mut self, cid: u16, reason: u8) -> StackResult<()>;
    fn l2cap_register_service(&mut self, psm: u16, mtu: u16) -> StackResult<()>;
    fn l2cap_unregister_service(&mut self, psm: u16) -> StackResult<()>;
    fn l2cap_accept_connection(&mut self, cid: u16) -> StackResult<()>;
    fn l2cap_decline_connection(&mut self, cid: u16, reason: u8) -> StackResult<()>;
    fn l2cap_send(&mut self, cid: u16, data: &[u8]) -> StackResult<()>;
}

pub trait RfcommService {
    /// Start an outgoing channel, returns the local CID
    fn rfcomm_create_channel(
        &mut self,
        addr: BdAddr,
        server_channel: u8,
        initial_credits: Option<u8>,
    ) -> StackResult<u16>;
    fn rfcomm_disconnect(&mut self, cid: u16) -> StackResult<()>;
    fn rfcomm_register_service(
        &mut self,
        server_channel: u8,
        mtu: u16,
        initial_credits: Option<u8>,
    ) -> StackResult<()>;
    fn rfcomm_unregister_service(&mut self, server_channel: u8) -> StackResult<()>;
    fn rfcomm_accept_connection(&mut self, cid: u16) -> StackResult<()>;
    fn rfcomm_decline_connection(&mut self, cid: u16) -> StackResult<()>;
    fn rfcomm_grant_credits(&mut self, cid: u16, credits: u8) -> StackResult<()>;
    fn rfcomm_send(&mut self, cid: u16, data: &[u8]) -> StackResult<()>;
    /// Server channel persistently assigned to a service name
    fn rfcomm_persistent_channel(&mut self, service_name: &str) -> StackResult<u8>;
}

pub trait SdpService {
    /// Register a service record, returns its handle
    fn sdp_register_service(&mut self, record: &[u8]) -> StackResult<u32>;
    fn sdp_unregister_service(&mut self, handle: u32) -> StackResult<()>;
    fn sdp_query_rfcomm_services(&mut self, addr: BdAddr, search_pattern: &[u8])
        -> StackResult<()>;
    fn sdp_query_services(
        &mut self,
        addr: BdAddr,
        search_pattern: &[u8],
        attribute_ids: &[u8],
    ) -> StackResult<()>;
}

pub trait GattClientService {
    fn gatt_request(&mut self, handle: ConnectionHandle, request: &GattRequest)
        -> StackResult<()>;
    fn gatt_mtu(&self, handle: ConnectionHandle) -> StackResult<u16>;
}

/// Everything the daemon needs from the protocol layers
pub trait ProtocolStack:
    HciControl + L2capService + RfcommService + SdpService + GattClientService
{
}

impl<T> ProtocolStack for T where
    T: HciControl + L2capService + RfcommService + SdpService + GattClientService
{
}

/// Parameters of an L2CAP channel-opened notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct L2capChannelInfo {
    pub status: StatusCode,
    pub addr: BdAddr,
    pub handle: ConnectionHandle,
    pub psm: u16,
    pub local_cid: u16,
    pub remote_cid: u16,
    pub local_mtu: u16,
    pub remote_mtu: u16,
}

/// Parameters of an RFCOMM open-complete notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RfcommChannelInfo {
    pub status: StatusCode,
    pub addr: BdAddr,
    pub handle: ConnectionHandle,
    pub server_channel: u8,
    pub cid: u16,
    pub max_frame_size: u16,
}

/// GATT query result kinds delivered to the active owner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattResultKind {
    Service,
    IncludedService,
    Characteristic,
    CharacteristicValue,
    CharacteristicDescriptor,
    AllCharacteristicDescriptors,
}

/// Asynchronous output of the protocol layers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackEvent {
    /// Controller state changed
    StateChanged(ControllerState),
    /// Number of ACL connections changed
    ConnectionCountChanged(u16),
    /// Controller accepted more outgoing data
    AclBuffersFreed,
    /// ACL link closed
    LinkDisconnected {
        status: StatusCode,
        handle: ConnectionHandle,
        reason: u8,
    },

    L2capChannelOpened(L2capChannelInfo),
    L2capChannelClosed {
        cid: u16,
    },
    L2capIncomingConnection {
        addr: BdAddr,
        handle: ConnectionHandle,
        psm: u16,
        local_cid: u16,
        remote_cid: u16,
    },
    L2capCredits {
        cid: u16,
        credits: u8,
    },
    L2capData {
        cid: u16,
        data: Vec<u8>,
    },

    RfcommChannelOpened(RfcommChannelInfo),
    RfcommChannelClosed {
        cid: u16,
    },
    RfcommIncomingConnection {
        addr: BdAddr,
        server_channel: u8,
        cid: u16,
    },
    RfcommCredits {
        cid: u16,
        credits: u8,
    },
    RfcommData {
        cid: u16,
        data: Vec<u8>,
    },

    /// One RFCOMM service found by an SDP query
    SdpRfcommService {
        server_channel: u8,
        name: String,
    },
    /// One byte of an attribute value found by an SDP query
    SdpAttributeValue {
        record_id: u16,
        attribute_id: u16,
        attribute_length: u16,
        data_offset: u16,
        data: u8,
    },
    SdpQueryComplete {
        status: StatusCode,
    },

    /// A GATT query result, `body` is everything after the connection handle
    GattResult {
        handle: ConnectionHandle,
        kind: GattResultKind,
        body: Vec<u8>,
    },
    /// One fragment of a long read
    GattLongFragment {
        handle: ConnectionHandle,
        kind: LongAttributeKind,
        attribute_handle: u16,
        offset: u16,
        data: Vec<u8>,
    },
    GattNotification {
        handle: ConnectionHandle,
        indication: bool,
        attribute_handle: u16,
        data: Vec<u8>,
    },
    GattQueryComplete {
        handle: ConnectionHandle,
        status: StatusCode,
    },

    /// Any other HCI event, forwarded to every client
    HciEvent(Vec<u8>),
}
