//! Encoders for events sent to clients
//!
//! Events are HCI event packets: `code u8 | len u8 | body`, multi-byte
//! fields little endian. The SDP attribute value event travels in its own
//! packet type and has no length byte.

use byteorder::{LittleEndian, WriteBytesExt};

use super::constants::*;
use super::frame::Packet;
use crate::gatt::LongAttributeKind;
use crate::power::ControllerState;
use crate::stack::{GattResultKind, L2capChannelInfo, RfcommChannelInfo};
use crate::types::{BdAddr, ConnectionHandle, StatusCode};

/// Little helper around a byte vector. Writes into a Vec cannot fail.
struct EventWriter {
    body: Vec<u8>,
}

impl EventWriter {
    fn new() -> Self {
        Self { body: Vec::new() }
    }

    fn u8(mut self, value: u8) -> Self {
        self.body.push(value);
        self
    }

    fn u16(mut self, value: u16) -> Self {
        let _ = self.body.write_u16::<LittleEndian>(value);
        self
    }

    fn u32(mut self, value: u32) -> Self {
        let _ = self.body.write_u32::<LittleEndian>(value);
        self
    }

    fn addr(mut self, addr: &BdAddr) -> Self {
        self.body.extend_from_slice(&addr.to_wire());
        self
    }

    fn bytes(mut self, data: &[u8]) -> Self {
        self.body.extend_from_slice(data);
        self
    }

    fn into_event(self, code: u8) -> Packet {
        let mut payload = Vec::with_capacity(2 + self.body.len());
        payload.push(code);
        // Long attribute values overflow the length byte; clients use the frame length
        payload.push(u8::try_from(self.body.len()).unwrap_or(u8::MAX));
        payload.extend_from_slice(&self.body);
        Packet::event(payload)
    }
}

pub fn state(state: ControllerState) -> Packet {
    EventWriter::new().u8(state as u8).into_event(EVT_DAEMON_STATE)
}

pub fn version() -> Packet {
    EventWriter::new()
        .u8(DAEMON_VERSION_MAJOR)
        .u8(DAEMON_VERSION_MINOR)
        .u16(DAEMON_VERSION_REVISION)
        .into_event(EVT_DAEMON_VERSION)
}

pub fn system_bluetooth_enabled(enabled: bool) -> Packet {
    EventWriter::new()
        .u8(enabled as u8)
        .into_event(EVT_SYSTEM_BLUETOOTH_ENABLED)
}

pub fn discoverable_enabled(enabled: bool) -> Packet {
    EventWriter::new()
        .u8(enabled as u8)
        .into_event(EVT_DISCOVERABLE_ENABLED)
}

/// HCI command status, used to reject commands
pub fn command_status(status: StatusCode, opcode: u16) -> Packet {
    EventWriter::new()
        .u8(status.value())
        .u8(1)
        .u16(opcode)
        .into_event(EVT_COMMAND_STATUS)
}

pub fn disconnection_complete(status: StatusCode, handle: ConnectionHandle, reason: u8) -> Packet {
    EventWriter::new()
        .u8(status.value())
        .u16(handle)
        .u8(reason)
        .into_event(EVT_DISCONNECTION_COMPLETE)
}

pub fn l2cap_channel_opened(info: &L2capChannelInfo) -> Packet {
    EventWriter::new()
        .u8(info.status.value())
        .addr(&info.addr)
        .u16(info.handle)
        .u16(info.psm)
        .u16(info.local_cid)
        .u16(info.remote_cid)
        .u16(info.local_mtu)
        .u16(info.remote_mtu)
        .u16(0)
        .into_event(EVT_L2CAP_CHANNEL_OPENED)
}

/// Channel-opened event for a create request the engine refused
pub fn l2cap_open_failed(addr: BdAddr, psm: u16, status: StatusCode) -> Packet {
    l2cap_channel_opened(&L2capChannelInfo {
        status,
        addr,
        handle: 0,
        psm,
        local_cid: 0,
        remote_cid: 0,
        local_mtu: 0,
        remote_mtu: 0,
    })
}

pub fn l2cap_channel_closed(cid: u16) -> Packet {
    EventWriter::new().u16(cid).into_event(EVT_L2CAP_CHANNEL_CLOSED)
}

pub fn l2cap_incoming_connection(
    addr: BdAddr,
    handle: ConnectionHandle,
    psm: u16,
    local_cid: u16,
    remote_cid: u16,
) -> Packet {
    EventWriter::new()
        .addr(&addr)
        .u16(handle)
        .u16(psm)
        .u16(local_cid)
        .u16(remote_cid)
        .into_event(EVT_L2CAP_INCOMING_CONNECTION)
}

pub fn l2cap_credits(cid: u16, credits: u8) -> Packet {
    EventWriter::new()
        .u16(cid)
        .u8(credits)
        .into_event(EVT_L2CAP_CREDITS)
}

pub fn l2cap_service_registered(status: StatusCode, psm: u16) -> Packet {
    EventWriter::new()
        .u8(status.value())
        .u16(psm)
        .into_event(EVT_L2CAP_SERVICE_REGISTERED)
}

pub fn rfcomm_open_complete(info: &RfcommChannelInfo) -> Packet {
    EventWriter::new()
        .u8(info.status.value())
        .addr(&info.addr)
        .u16(info.handle)
        .u8(info.server_channel)
        .u16(info.cid)
        .u16(info.max_frame_size)
        .into_event(EVT_RFCOMM_OPEN_CHANNEL_COMPLETE)
}

/// Open-complete event for a create request the engine refused
pub fn rfcomm_open_failed(addr: BdAddr, server_channel: u8, status: StatusCode) -> Packet {
    rfcomm_open_complete(&RfcommChannelInfo {
        status,
        addr,
        handle: 0,
        server_channel,
        cid: 0,
        max_frame_size: 0,
    })
}

pub fn rfcomm_channel_closed(cid: u16) -> Packet {
    EventWriter::new().u16(cid).into_event(EVT_RFCOMM_CHANNEL_CLOSED)
}

pub fn rfcomm_incoming_connection(addr: BdAddr, server_channel: u8, cid: u16) -> Packet {
    EventWriter::new()
        .addr(&addr)
        .u8(server_channel)
        .u16(cid)
        .into_event(EVT_RFCOMM_INCOMING_CONNECTION)
}

pub fn rfcomm_credits(cid: u16, credits: u8) -> Packet {
    EventWriter::new()
        .u16(cid)
        .u8(credits)
        .into_event(EVT_RFCOMM_CREDITS)
}

pub fn rfcomm_service_registered(status: StatusCode, server_channel: u8) -> Packet {
    EventWriter::new()
        .u8(status.value())
        .u8(server_channel)
        .into_event(EVT_RFCOMM_SERVICE_REGISTERED)
}

pub fn rfcomm_persistent_channel(status: StatusCode, server_channel: u8) -> Packet {
    EventWriter::new()
        .u8(status.value())
        .u8(server_channel)
        .into_event(EVT_RFCOMM_PERSISTENT_CHANNEL)
}

pub fn sdp_service_registered(status: StatusCode, record_handle: u32) -> Packet {
    EventWriter::new()
        .u8(status.value())
        .u32(record_handle)
        .into_event(EVT_SDP_SERVICE_REGISTERED)
}

pub fn sdp_query_complete(status: StatusCode) -> Packet {
    EventWriter::new()
        .u8(status.value())
        .into_event(EVT_SDP_QUERY_COMPLETE)
}

pub fn sdp_rfcomm_service(server_channel: u8, name: &str) -> Packet {
    EventWriter::new()
        .u8(server_channel)
        .bytes(name.as_bytes())
        .into_event(EVT_SDP_QUERY_RFCOMM_SERVICE)
}

/// Complete SDP attribute value, sent as an SDP client packet
pub fn sdp_attribute_value(record_id: u16, attribute_id: u16, value: &[u8]) -> Packet {
    let mut payload = Vec::with_capacity(7 + value.len());
    payload.push(EVT_SDP_QUERY_ATTRIBUTE_VALUE);
    let _ = payload.write_u16::<LittleEndian>(record_id);
    let _ = payload.write_u16::<LittleEndian>(attribute_id);
    let _ = payload.write_u16::<LittleEndian>(value.len() as u16);
    payload.extend_from_slice(value);
    Packet::new(SDP_CLIENT_PACKET, 0, payload)
}

pub fn gatt_query_complete(handle: ConnectionHandle, status: StatusCode) -> Packet {
    EventWriter::new()
        .u16(handle)
        .u8(status.value())
        .into_event(EVT_GATT_QUERY_COMPLETE)
}

pub fn gatt_result_code(kind: GattResultKind) -> u8 {
    match kind {
        GattResultKind::Service => EVT_GATT_SERVICE_QUERY_RESULT,
        GattResultKind::IncludedService => EVT_GATT_INCLUDED_SERVICE_QUERY_RESULT,
        GattResultKind::Characteristic => EVT_GATT_CHARACTERISTIC_QUERY_RESULT,
        GattResultKind::CharacteristicValue => EVT_GATT_CHARACTERISTIC_VALUE_QUERY_RESULT,
        GattResultKind::CharacteristicDescriptor => EVT_GATT_CHARACTERISTIC_DESCRIPTOR_QUERY_RESULT,
        GattResultKind::AllCharacteristicDescriptors => {
            EVT_GATT_ALL_CHARACTERISTIC_DESCRIPTORS_QUERY_RESULT
        }
    }
}

pub fn gatt_long_code(kind: LongAttributeKind) -> u8 {
    match kind {
        LongAttributeKind::CharacteristicValue => EVT_GATT_LONG_CHARACTERISTIC_VALUE_QUERY_RESULT,
        LongAttributeKind::Descriptor => EVT_GATT_LONG_CHARACTERISTIC_DESCRIPTOR_QUERY_RESULT,
    }
}

pub fn gatt_result(kind: GattResultKind, handle: ConnectionHandle, body: &[u8]) -> Packet {
    EventWriter::new()
        .u16(handle)
        .bytes(body)
        .into_event(gatt_result_code(kind))
}

/// Long read result: handle, attribute handle, offset, length, value
pub fn gatt_long_value(
    kind: LongAttributeKind,
    handle: ConnectionHandle,
    attribute_handle: u16,
    offset: u16,
    value: &[u8],
) -> Packet {
    EventWriter::new()
        .u16(handle)
        .u16(attribute_handle)
        .u16(offset)
        .u16(value.len() as u16)
        .bytes(value)
        .into_event(gatt_long_code(kind))
}

pub fn gatt_notification(
    indication: bool,
    handle: ConnectionHandle,
    attribute_handle: u16,
    value: &[u8],
) -> Packet {
    let code = if indication {
        EVT_GATT_INDICATION
    } else {
        EVT_GATT_NOTIFICATION
    };
    EventWriter::new()
        .u16(handle)
        .u16(attribute_handle)
        .u16(value.len() as u16)
        .bytes(value)
        .into_event(code)
}

pub fn gatt_mtu(handle: ConnectionHandle, mtu: u16) -> Packet {
    EventWriter::new()
        .u16(handle)
        .u16(mtu)
        .into_event(EVT_GATT_MTU)
}
