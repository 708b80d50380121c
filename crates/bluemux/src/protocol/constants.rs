//! Client protocol constants
//!
//! Packet types, command opcodes and event codes exchanged with clients.

// Packet types
pub const HCI_COMMAND_DATA_PACKET: u16 = 0x01;
pub const HCI_ACL_DATA_PACKET: u16 = 0x02;
pub const HCI_EVENT_PACKET: u16 = 0x04;
pub const DAEMON_EVENT_PACKET: u16 = 0x05;
pub const L2CAP_DATA_PACKET: u16 = 0x06;
pub const RFCOMM_DATA_PACKET: u16 = 0x07;
pub const SDP_CLIENT_PACKET: u16 = 0x08;

/// Frame header: packet type, channel, length
pub const FRAME_HEADER_LEN: usize = 6;

/// Command header: opcode, parameter length
pub const COMMAND_HEADER_LEN: usize = 3;

// Daemon opcode group
pub const OGF_DAEMON: u8 = 0x3D;

// Daemon control (OGF: 0x3D)
pub const OCF_GET_STATE: u16 = 0x01;
pub const OCF_SET_POWER_MODE: u16 = 0x02;
pub const OCF_GET_VERSION: u16 = 0x04;
pub const OCF_GET_SYSTEM_BLUETOOTH_ENABLED: u16 = 0x05;
pub const OCF_SET_SYSTEM_BLUETOOTH_ENABLED: u16 = 0x06;
pub const OCF_SET_DISCOVERABLE: u16 = 0x07;
pub const OCF_SET_BLUETOOTH_ENABLED: u16 = 0x08;

// L2CAP
pub const OCF_L2CAP_CREATE_CHANNEL: u16 = 0x20;
pub const OCF_L2CAP_DISCONNECT: u16 = 0x21;
pub const OCF_L2CAP_REGISTER_SERVICE: u16 = 0x22;
pub const OCF_L2CAP_UNREGISTER_SERVICE: u16 = 0x23;
pub const OCF_L2CAP_ACCEPT_CONNECTION: u16 = 0x24;
pub const OCF_L2CAP_DECLINE_CONNECTION: u16 = 0x25;
pub const OCF_L2CAP_CREATE_CHANNEL_MTU: u16 = 0x26;

// SDP
pub const OCF_SDP_REGISTER_SERVICE_RECORD: u16 = 0x30;
pub const OCF_SDP_UNREGISTER_SERVICE_RECORD: u16 = 0x31;
pub const OCF_SDP_CLIENT_QUERY_RFCOMM_SERVICES: u16 = 0x32;
pub const OCF_SDP_CLIENT_QUERY_SERVICES: u16 = 0x33;

// RFCOMM
pub const OCF_RFCOMM_CREATE_CHANNEL: u16 = 0x40;
pub const OCF_RFCOMM_DISCONNECT: u16 = 0x41;
pub const OCF_RFCOMM_REGISTER_SERVICE: u16 = 0x42;
pub const OCF_RFCOMM_UNREGISTER_SERVICE: u16 = 0x43;
pub const OCF_RFCOMM_ACCEPT_CONNECTION: u16 = 0x44;
pub const OCF_RFCOMM_DECLINE_CONNECTION: u16 = 0x45;
pub const OCF_RFCOMM_PERSISTENT_CHANNEL: u16 = 0x46;
pub const OCF_RFCOMM_CREATE_CHANNEL_WITH_CREDITS: u16 = 0x47;
pub const OCF_RFCOMM_REGISTER_SERVICE_WITH_CREDITS: u16 = 0x48;
pub const OCF_RFCOMM_GRANT_CREDITS: u16 = 0x49;

// GAP
pub const OCF_GAP_DISCONNECT: u16 = 0x50;
pub const OCF_GAP_LE_SCAN_START: u16 = 0x60;
pub const OCF_GAP_LE_SCAN_STOP: u16 = 0x61;
pub const OCF_GAP_LE_SET_SCAN_PARAMETERS: u16 = 0x62;
pub const OCF_GAP_LE_CONNECT: u16 = 0x63;
pub const OCF_GAP_LE_CONNECT_CANCEL: u16 = 0x64;

// GATT client
pub const OCF_GATT_DISCOVER_ALL_PRIMARY_SERVICES: u16 = 0x70;
pub const OCF_GATT_DISCOVER_PRIMARY_SERVICES_BY_UUID16: u16 = 0x71;
pub const OCF_GATT_DISCOVER_PRIMARY_SERVICES_BY_UUID128: u16 = 0x72;
pub const OCF_GATT_FIND_INCLUDED_SERVICES_FOR_SERVICE: u16 = 0x73;
pub const OCF_GATT_DISCOVER_CHARACTERISTICS_FOR_SERVICE: u16 = 0x74;
pub const OCF_GATT_DISCOVER_CHARACTERISTICS_FOR_SERVICE_BY_UUID128: u16 = 0x75;
pub const OCF_GATT_DISCOVER_CHARACTERISTIC_DESCRIPTORS: u16 = 0x76;
pub const OCF_GATT_READ_VALUE_OF_CHARACTERISTIC: u16 = 0x77;
pub const OCF_GATT_READ_LONG_VALUE_OF_CHARACTERISTIC: u16 = 0x78;
pub const OCF_GATT_WRITE_VALUE_OF_CHARACTERISTIC_WITHOUT_RESPONSE: u16 = 0x79;
pub const OCF_GATT_WRITE_VALUE_OF_CHARACTERISTIC: u16 = 0x7A;
pub const OCF_GATT_WRITE_LONG_VALUE_OF_CHARACTERISTIC: u16 = 0x7B;
pub const OCF_GATT_RELIABLE_WRITE_LONG_VALUE_OF_CHARACTERISTIC: u16 = 0x7C;
pub const OCF_GATT_READ_CHARACTERISTIC_DESCRIPTOR: u16 = 0x7D;
pub const OCF_GATT_READ_LONG_CHARACTERISTIC_DESCRIPTOR: u16 = 0x7E;
pub const OCF_GATT_WRITE_CHARACTERISTIC_DESCRIPTOR: u16 = 0x7F;
pub const OCF_GATT_WRITE_LONG_CHARACTERISTIC_DESCRIPTOR: u16 = 0x80;
pub const OCF_GATT_WRITE_CLIENT_CHARACTERISTIC_CONFIGURATION: u16 = 0x81;
pub const OCF_GATT_GET_MTU: u16 = 0x82;

// HCI events
pub const EVT_DISCONNECTION_COMPLETE: u8 = 0x05;
pub const EVT_COMMAND_STATUS: u8 = 0x0F;

// Daemon events
pub const EVT_DAEMON_STATE: u8 = 0x60;
pub const EVT_DAEMON_VERSION: u8 = 0x63;
pub const EVT_SYSTEM_BLUETOOTH_ENABLED: u8 = 0x64;
pub const EVT_DISCOVERABLE_ENABLED: u8 = 0x66;

// L2CAP events
pub const EVT_L2CAP_CHANNEL_OPENED: u8 = 0x70;
pub const EVT_L2CAP_CHANNEL_CLOSED: u8 = 0x71;
pub const EVT_L2CAP_INCOMING_CONNECTION: u8 = 0x72;
pub const EVT_L2CAP_CREDITS: u8 = 0x74;
pub const EVT_L2CAP_SERVICE_REGISTERED: u8 = 0x75;

// RFCOMM events
pub const EVT_RFCOMM_OPEN_CHANNEL_COMPLETE: u8 = 0x80;
pub const EVT_RFCOMM_CHANNEL_CLOSED: u8 = 0x81;
pub const EVT_RFCOMM_INCOMING_CONNECTION: u8 = 0x82;
pub const EVT_RFCOMM_CREDITS: u8 = 0x84;
pub const EVT_RFCOMM_SERVICE_REGISTERED: u8 = 0x85;
pub const EVT_RFCOMM_PERSISTENT_CHANNEL: u8 = 0x86;

// SDP events
pub const EVT_SDP_SERVICE_REGISTERED: u8 = 0x90;
pub const EVT_SDP_QUERY_COMPLETE: u8 = 0x91;
pub const EVT_SDP_QUERY_RFCOMM_SERVICE: u8 = 0x92;
pub const EVT_SDP_QUERY_ATTRIBUTE_VALUE: u8 = 0x93;

// GATT client events
pub const EVT_GATT_QUERY_COMPLETE: u8 = 0xA0;
pub const EVT_GATT_SERVICE_QUERY_RESULT: u8 = 0xA1;
pub const EVT_GATT_CHARACTERISTIC_QUERY_RESULT: u8 = 0xA2;
pub const EVT_GATT_INCLUDED_SERVICE_QUERY_RESULT: u8 = 0xA3;
pub const EVT_GATT_ALL_CHARACTERISTIC_DESCRIPTORS_QUERY_RESULT: u8 = 0xA4;
pub const EVT_GATT_CHARACTERISTIC_VALUE_QUERY_RESULT: u8 = 0xA5;
pub const EVT_GATT_LONG_CHARACTERISTIC_VALUE_QUERY_RESULT: u8 = 0xA6;
pub const EVT_GATT_NOTIFICATION: u8 = 0xA7;
pub const EVT_GATT_INDICATION: u8 = 0xA8;
pub const EVT_GATT_CHARACTERISTIC_DESCRIPTOR_QUERY_RESULT: u8 = 0xA9;
pub const EVT_GATT_LONG_CHARACTERISTIC_DESCRIPTOR_QUERY_RESULT: u8 = 0xAA;
pub const EVT_GATT_MTU: u8 = 0xAB;

// Daemon version reported by GET_VERSION
pub const DAEMON_VERSION_MAJOR: u8 = 0;
pub const DAEMON_VERSION_MINOR: u8 = 1;
pub const DAEMON_VERSION_REVISION: u16 = 0;

/// MTU used by the plain L2CAP create channel command
pub const L2CAP_DEFAULT_MTU: u16 = 150;

/// Longest service name accepted by the persistent channel lookup
pub const RFCOMM_MAX_SERVICE_NAME_LEN: usize = 248;

/// Size of the SDP attribute value reassembly buffer
pub const SDP_ATTRIBUTE_BUFFER_SIZE: usize = 1000;

/// Build a 16-bit opcode from group and command fields
pub const fn opcode(ogf: u8, ocf: u16) -> u16 {
    ((ogf as u16) << 10) | (ocf & 0x03ff)
}

/// Opcode group field
pub const fn opcode_ogf(opcode: u16) -> u8 {
    (opcode >> 10) as u8
}

/// Opcode command field
pub const fn opcode_ocf(opcode: u16) -> u16 {
    opcode & 0x03ff
}
