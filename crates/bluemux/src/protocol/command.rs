//! Client command decoding
//!
//! A command is `opcode u16 | param_len u8 | params`. Opcodes in the daemon
//! group are parsed into [`Command`]; everything else is an HCI command
//! forwarded to the controller untouched.

use std::io::{Cursor, Read};

use bitflags::bitflags;
use byteorder::{LittleEndian, ReadBytesExt};

use super::constants::*;
use super::ProtocolError;
use crate::gatt::ATT_MAX_LONG_ATTRIBUTE_SIZE;
use crate::types::{BdAddr, ConnectionHandle, PowerMode};

bitflags! {
    /// GATT characteristic properties
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CharacteristicProperties: u16 {
        const BROADCAST = 0x0001;
        const READ = 0x0002;
        const WRITE_WITHOUT_RESPONSE = 0x0004;
        const WRITE = 0x0008;
        const NOTIFY = 0x0010;
        const INDICATE = 0x0020;
        const AUTHENTICATED_SIGNED_WRITES = 0x0040;
        const EXTENDED_PROPERTIES = 0x0080;
    }
}

bitflags! {
    /// Client characteristic configuration value
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ClientConfiguration: u16 {
        const NOTIFICATION = 0x0001;
        const INDICATION = 0x0002;
    }
}

/// Wire size of a serialized service
pub const GATT_SERVICE_LEN: usize = 20;
/// Wire size of a serialized characteristic
pub const GATT_CHARACTERISTIC_LEN: usize = 24;
/// Wire size of a serialized descriptor
pub const GATT_DESCRIPTOR_LEN: usize = 18;

/// 128-bit UUID, most significant byte first
pub type Uuid128 = [u8; 16];

/// Primary or included service range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattService {
    pub start_group_handle: u16,
    pub end_group_handle: u16,
    pub uuid128: Uuid128,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattCharacteristic {
    pub start_handle: u16,
    pub value_handle: u16,
    pub end_handle: u16,
    pub properties: CharacteristicProperties,
    pub uuid128: Uuid128,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattDescriptor {
    pub handle: u16,
    pub uuid128: Uuid128,
}

/// A GATT client operation on one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattRequest {
    DiscoverAllPrimaryServices,
    DiscoverPrimaryServicesByUuid16(u16),
    DiscoverPrimaryServicesByUuid128(Uuid128),
    FindIncludedServices(GattService),
    DiscoverCharacteristics(GattService),
    DiscoverCharacteristicsByUuid128 {
        service: GattService,
        uuid128: Uuid128,
    },
    DiscoverDescriptors(GattCharacteristic),
    ReadValue(GattCharacteristic),
    ReadLongValue(GattCharacteristic),
    WriteValueWithoutResponse {
        characteristic: GattCharacteristic,
        data: Vec<u8>,
    },
    WriteValue {
        characteristic: GattCharacteristic,
        data: Vec<u8>,
    },
    WriteLongValue {
        characteristic: GattCharacteristic,
        data: Vec<u8>,
    },
    ReliableWriteLongValue {
        characteristic: GattCharacteristic,
        data: Vec<u8>,
    },
    ReadDescriptor(GattDescriptor),
    ReadLongDescriptor(GattDescriptor),
    WriteDescriptor {
        descriptor: GattDescriptor,
        data: Vec<u8>,
    },
    WriteLongDescriptor {
        descriptor: GattDescriptor,
        data: Vec<u8>,
    },
    WriteClientConfiguration {
        characteristic: GattCharacteristic,
        configuration: ClientConfiguration,
    },
}

impl GattRequest {
    /// Whether the request produces results that must reach the caller.
    ///
    /// Only such requests make the caller the active owner of the link.
    pub fn tracks_active(&self) -> bool {
        !matches!(self, GattRequest::WriteValueWithoutResponse { .. })
    }
}

/// A decoded daemon command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    GetState,
    SetPowerMode(PowerMode),
    GetVersion,
    GetSystemBluetoothEnabled,
    SetSystemBluetoothEnabled(bool),
    SetDiscoverable(bool),
    SetBluetoothEnabled(bool),

    L2capCreateChannel {
        addr: BdAddr,
        psm: u16,
        mtu: u16,
    },
    L2capDisconnect {
        cid: u16,
        reason: u8,
    },
    L2capRegisterService {
        psm: u16,
        mtu: u16,
    },
    L2capUnregisterService {
        psm: u16,
    },
    L2capAcceptConnection {
        cid: u16,
    },
    L2capDeclineConnection {
        cid: u16,
        reason: u8,
    },

    SdpRegisterServiceRecord {
        record: Vec<u8>,
    },
    SdpUnregisterServiceRecord {
        handle: u32,
    },
    SdpQueryRfcommServices {
        addr: BdAddr,
        search_pattern: Vec<u8>,
    },
    SdpQueryServices {
        addr: BdAddr,
        search_pattern: Vec<u8>,
        attribute_ids: Vec<u8>,
    },

    RfcommCreateChannel {
        addr: BdAddr,
        server_channel: u8,
        initial_credits: Option<u8>,
    },
    RfcommDisconnect {
        cid: u16,
        reason: u8,
    },
    RfcommRegisterService {
        server_channel: u8,
        mtu: u16,
        initial_credits: Option<u8>,
    },
    RfcommUnregisterService {
        server_channel: u8,
    },
    RfcommAcceptConnection {
        cid: u16,
    },
    RfcommDeclineConnection {
        cid: u16,
        reason: u8,
    },
    RfcommPersistentChannel {
        service_name: String,
    },
    RfcommGrantCredits {
        cid: u16,
        credits: u8,
    },

    GapDisconnect {
        handle: ConnectionHandle,
    },
    LeScanStart,
    LeScanStop,
    LeSetScanParameters {
        scan_type: u8,
        interval: u16,
        window: u16,
    },
    LeConnect {
        addr_type: u8,
        addr: BdAddr,
    },
    LeConnectCancel,

    Gatt {
        handle: ConnectionHandle,
        request: GattRequest,
    },
    GattGetMtu {
        handle: ConnectionHandle,
    },
}

/// A client command packet split into header and parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandHeader {
    pub opcode: u16,
    pub param_len: u8,
}

impl CommandHeader {
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() < COMMAND_HEADER_LEN {
            return Err(ProtocolError::FrameTooShort(payload.len()));
        }
        Ok(Self {
            opcode: u16::from_le_bytes([payload[0], payload[1]]),
            param_len: payload[2],
        })
    }

    pub fn is_daemon_command(&self) -> bool {
        opcode_ogf(self.opcode) == OGF_DAEMON
    }

    pub fn ocf(&self) -> u16 {
        opcode_ocf(self.opcode)
    }
}

impl Command {
    /// Decode a daemon command packet payload.
    ///
    /// The declared parameter length is not trusted: SDP records routinely
    /// exceed 255 bytes, so parameters run to the end of the payload.
    pub fn parse(payload: &[u8]) -> Result<Command, ProtocolError> {
        let header = CommandHeader::parse(payload)?;
        let params = &payload[COMMAND_HEADER_LEN..];
        let mut r = ParamReader::new(header.opcode, params);

        let command = match header.ocf() {
            OCF_GET_STATE => Command::GetState,
            OCF_SET_POWER_MODE => {
                let mode = r.u8()?;
                let mode = PowerMode::from_u8(mode).ok_or(ProtocolError::InvalidValue {
                    field: "power mode",
                    value: u32::from(mode),
                })?;
                Command::SetPowerMode(mode)
            }
            OCF_GET_VERSION => Command::GetVersion,
            OCF_GET_SYSTEM_BLUETOOTH_ENABLED => Command::GetSystemBluetoothEnabled,
            OCF_SET_SYSTEM_BLUETOOTH_ENABLED => Command::SetSystemBluetoothEnabled(r.u8()? != 0),
            OCF_SET_DISCOVERABLE => Command::SetDiscoverable(r.u8()? != 0),
            OCF_SET_BLUETOOTH_ENABLED => Command::SetBluetoothEnabled(r.u8()? != 0),

            OCF_L2CAP_CREATE_CHANNEL => Command::L2capCreateChannel {
                addr: r.addr()?,
                psm: r.u16()?,
                mtu: L2CAP_DEFAULT_MTU,
            },
            OCF_L2CAP_CREATE_CHANNEL_MTU => Command::L2capCreateChannel {
                addr: r.addr()?,
                psm: r.u16()?,
                mtu: r.u16()?,
            },
            OCF_L2CAP_DISCONNECT => Command::L2capDisconnect {
                cid: r.u16()?,
                reason: r.u8()?,
            },
            OCF_L2CAP_REGISTER_SERVICE => Command::L2capRegisterService {
                psm: r.u16()?,
                mtu: r.u16()?,
            },
            OCF_L2CAP_UNREGISTER_SERVICE => Command::L2capUnregisterService { psm: r.u16()? },
            OCF_L2CAP_ACCEPT_CONNECTION => Command::L2capAcceptConnection { cid: r.u16()? },
            OCF_L2CAP_DECLINE_CONNECTION => {
                let cid = r.u16()?;
                r.skip(2)?;
                Command::L2capDeclineConnection {
                    cid,
                    reason: r.u8()?,
                }
            }

            OCF_SDP_REGISTER_SERVICE_RECORD => {
                let len = r.data_element_len()?;
                Command::SdpRegisterServiceRecord {
                    record: r.bytes(len)?,
                }
            }
            OCF_SDP_UNREGISTER_SERVICE_RECORD => Command::SdpUnregisterServiceRecord {
                handle: r.u32()?,
            },
            OCF_SDP_CLIENT_QUERY_RFCOMM_SERVICES => {
                let addr = r.addr()?;
                let len = r.data_element_len()?;
                Command::SdpQueryRfcommServices {
                    addr,
                    search_pattern: r.bytes(len)?,
                }
            }
            OCF_SDP_CLIENT_QUERY_SERVICES => {
                let addr = r.addr()?;
                let len = r.data_element_len()?;
                let search_pattern = r.bytes(len)?;
                let len = r.data_element_len()?;
                Command::SdpQueryServices {
                    addr,
                    search_pattern,
                    attribute_ids: r.bytes(len)?,
                }
            }

            OCF_RFCOMM_CREATE_CHANNEL => Command::RfcommCreateChannel {
                addr: r.addr()?,
                server_channel: r.u8()?,
                initial_credits: None,
            },
            OCF_RFCOMM_CREATE_CHANNEL_WITH_CREDITS => Command::RfcommCreateChannel {
                addr: r.addr()?,
                server_channel: r.u8()?,
                initial_credits: Some(r.u8()?),
            },
            OCF_RFCOMM_DISCONNECT => Command::RfcommDisconnect {
                cid: r.u16()?,
                reason: r.u8()?,
            },
            OCF_RFCOMM_REGISTER_SERVICE => Command::RfcommRegisterService {
                server_channel: r.u8()?,
                mtu: r.u16()?,
                initial_credits: None,
            },
            OCF_RFCOMM_REGISTER_SERVICE_WITH_CREDITS => Command::RfcommRegisterService {
                server_channel: r.u8()?,
                mtu: r.u16()?,
                initial_credits: Some(r.u8()?),
            },
            OCF_RFCOMM_UNREGISTER_SERVICE => {
                let channel = r.u16()?;
                let server_channel =
                    u8::try_from(channel).map_err(|_| ProtocolError::InvalidValue {
                        field: "server channel",
                        value: u32::from(channel),
                    })?;
                Command::RfcommUnregisterService { server_channel }
            }
            OCF_RFCOMM_ACCEPT_CONNECTION => Command::RfcommAcceptConnection { cid: r.u16()? },
            OCF_RFCOMM_DECLINE_CONNECTION => {
                let cid = r.u16()?;
                r.skip(2)?;
                Command::RfcommDeclineConnection {
                    cid,
                    reason: r.u8()?,
                }
            }
            OCF_RFCOMM_PERSISTENT_CHANNEL => Command::RfcommPersistentChannel {
                service_name: r.c_string(RFCOMM_MAX_SERVICE_NAME_LEN),
            },
            OCF_RFCOMM_GRANT_CREDITS => Command::RfcommGrantCredits {
                cid: r.u16()?,
                credits: r.u8()?,
            },

            OCF_GAP_DISCONNECT => Command::GapDisconnect { handle: r.u16()? },
            OCF_GAP_LE_SCAN_START => Command::LeScanStart,
            OCF_GAP_LE_SCAN_STOP => Command::LeScanStop,
            OCF_GAP_LE_SET_SCAN_PARAMETERS => Command::LeSetScanParameters {
                scan_type: r.u8()?,
                interval: r.u16()?,
                window: r.u16()?,
            },
            OCF_GAP_LE_CONNECT => Command::LeConnect {
                addr_type: r.u8()?,
                addr: r.addr()?,
            },
            OCF_GAP_LE_CONNECT_CANCEL => Command::LeConnectCancel,

            OCF_GATT_GET_MTU => Command::GattGetMtu { handle: r.u16()? },
            ocf @ OCF_GATT_DISCOVER_ALL_PRIMARY_SERVICES
                ..=OCF_GATT_WRITE_CLIENT_CHARACTERISTIC_CONFIGURATION => {
                let handle = r.u16()?;
                Command::Gatt {
                    handle,
                    request: parse_gatt_request(ocf, &mut r)?,
                }
            }

            _ => return Err(ProtocolError::UnknownCommand(header.opcode)),
        };
        Ok(command)
    }
}

fn parse_gatt_request(ocf: u16, r: &mut ParamReader<'_>) -> Result<GattRequest, ProtocolError> {
    let request = match ocf {
        OCF_GATT_DISCOVER_ALL_PRIMARY_SERVICES => GattRequest::DiscoverAllPrimaryServices,
        OCF_GATT_DISCOVER_PRIMARY_SERVICES_BY_UUID16 => {
            GattRequest::DiscoverPrimaryServicesByUuid16(r.u16()?)
        }
        OCF_GATT_DISCOVER_PRIMARY_SERVICES_BY_UUID128 => {
            GattRequest::DiscoverPrimaryServicesByUuid128(r.uuid128()?)
        }
        OCF_GATT_FIND_INCLUDED_SERVICES_FOR_SERVICE => GattRequest::FindIncludedServices(r.service()?),
        OCF_GATT_DISCOVER_CHARACTERISTICS_FOR_SERVICE => {
            GattRequest::DiscoverCharacteristics(r.service()?)
        }
        OCF_GATT_DISCOVER_CHARACTERISTICS_FOR_SERVICE_BY_UUID128 => {
            GattRequest::DiscoverCharacteristicsByUuid128 {
                service: r.service()?,
                uuid128: r.uuid128()?,
            }
        }
        OCF_GATT_DISCOVER_CHARACTERISTIC_DESCRIPTORS => {
            GattRequest::DiscoverDescriptors(r.characteristic()?)
        }
        OCF_GATT_READ_VALUE_OF_CHARACTERISTIC => GattRequest::ReadValue(r.characteristic()?),
        OCF_GATT_READ_LONG_VALUE_OF_CHARACTERISTIC => GattRequest::ReadLongValue(r.characteristic()?),
        OCF_GATT_WRITE_VALUE_OF_CHARACTERISTIC_WITHOUT_RESPONSE => {
            GattRequest::WriteValueWithoutResponse {
                characteristic: r.characteristic()?,
                data: r.attribute_value()?,
            }
        }
        OCF_GATT_WRITE_VALUE_OF_CHARACTERISTIC => GattRequest::WriteValue {
            characteristic: r.characteristic()?,
            data: r.attribute_value()?,
        },
        OCF_GATT_WRITE_LONG_VALUE_OF_CHARACTERISTIC => GattRequest::WriteLongValue {
            characteristic: r.characteristic()?,
            data: r.attribute_value()?,
        },
        OCF_GATT_RELIABLE_WRITE_LONG_VALUE_OF_CHARACTERISTIC => {
            GattRequest::ReliableWriteLongValue {
                characteristic: r.characteristic()?,
                data: r.attribute_value()?,
            }
        }
        OCF_GATT_READ_CHARACTERISTIC_DESCRIPTOR => GattRequest::ReadDescriptor(r.descriptor()?),
        OCF_GATT_READ_LONG_CHARACTERISTIC_DESCRIPTOR => {
            GattRequest::ReadLongDescriptor(r.descriptor()?)
        }
        OCF_GATT_WRITE_CHARACTERISTIC_DESCRIPTOR => GattRequest::WriteDescriptor {
            descriptor: r.descriptor()?,
            data: r.attribute_value()?,
        },
        OCF_GATT_WRITE_LONG_CHARACTERISTIC_DESCRIPTOR => GattRequest::WriteLongDescriptor {
            descriptor: r.descriptor()?,
            data: r.attribute_value()?,
        },
        OCF_GATT_WRITE_CLIENT_CHARACTERISTIC_CONFIGURATION => {
            let characteristic = r.characteristic()?;
            let raw = r.u16()?;
            let configuration =
                ClientConfiguration::from_bits(raw).ok_or(ProtocolError::InvalidValue {
                    field: "client characteristic configuration",
                    value: u32::from(raw),
                })?;
            GattRequest::WriteClientConfiguration {
                characteristic,
                configuration,
            }
        }
        _ => return Err(ProtocolError::UnknownCommand(r.opcode)),
    };
    Ok(request)
}

/// Total length (header included) of the SDP data element at the start of `data`
pub fn data_element_len(data: &[u8]) -> Option<usize> {
    let header = *data.first()?;
    let element_type = header >> 3;
    let size_index = header & 0x07;
    let len = match size_index {
        // Nil carries no data regardless of the size index
        0 if element_type == 0 => 1,
        0 => 2,
        1 => 3,
        2 => 5,
        3 => 9,
        4 => 17,
        5 => 2 + usize::from(*data.get(1)?),
        6 => 3 + usize::from(u16::from_be_bytes([*data.get(1)?, *data.get(2)?])),
        _ => {
            let bytes = [*data.get(1)?, *data.get(2)?, *data.get(3)?, *data.get(4)?];
            5 + usize::try_from(u32::from_be_bytes(bytes)).ok()?
        }
    };
    Some(len)
}

/// Cursor over command parameters that reports short reads
struct ParamReader<'a> {
    opcode: u16,
    cursor: Cursor<&'a [u8]>,
}

impl<'a> ParamReader<'a> {
    fn new(opcode: u16, params: &'a [u8]) -> Self {
        Self {
            opcode,
            cursor: Cursor::new(params),
        }
    }

    fn len(&self) -> usize {
        self.cursor.get_ref().len()
    }

    fn position(&self) -> usize {
        // Position never exceeds the slice length
        self.cursor.position() as usize
    }

    fn truncated(&self, wanted: usize) -> ProtocolError {
        ProtocolError::Truncated {
            opcode: self.opcode,
            needed: self.position() + wanted,
            actual: self.len(),
        }
    }

    fn u8(&mut self) -> Result<u8, ProtocolError> {
        self.cursor.read_u8().map_err(|_| self.truncated(1))
    }

    fn u16(&mut self) -> Result<u16, ProtocolError> {
        if self.len() - self.position() < 2 {
            return Err(self.truncated(2));
        }
        self.cursor
            .read_u16::<LittleEndian>()
            .map_err(|_| self.truncated(2))
    }

    fn u32(&mut self) -> Result<u32, ProtocolError> {
        if self.len() - self.position() < 4 {
            return Err(self.truncated(4));
        }
        self.cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| self.truncated(4))
    }

    fn bytes(&mut self, count: usize) -> Result<Vec<u8>, ProtocolError> {
        if self.len() - self.position() < count {
            return Err(self.truncated(count));
        }
        let mut buf = vec![0u8; count];
        self.cursor
            .read_exact(&mut buf)
            .map_err(|_| self.truncated(count))?;
        Ok(buf)
    }

    fn skip(&mut self, count: usize) -> Result<(), ProtocolError> {
        self.bytes(count).map(|_| ())
    }

    fn addr(&mut self) -> Result<BdAddr, ProtocolError> {
        let wire = self.bytes(6)?;
        BdAddr::from_wire(&wire).ok_or_else(|| self.truncated(6))
    }

    /// 128-bit UUID sent little endian on the wire
    fn uuid128(&mut self) -> Result<Uuid128, ProtocolError> {
        let wire = self.bytes(16)?;
        let mut uuid = [0u8; 16];
        for (i, b) in wire.iter().rev().enumerate() {
            uuid[i] = *b;
        }
        Ok(uuid)
    }

    fn service(&mut self) -> Result<GattService, ProtocolError> {
        Ok(GattService {
            start_group_handle: self.u16()?,
            end_group_handle: self.u16()?,
            uuid128: self.uuid128()?,
        })
    }

    fn characteristic(&mut self) -> Result<GattCharacteristic, ProtocolError> {
        Ok(GattCharacteristic {
            start_handle: self.u16()?,
            value_handle: self.u16()?,
            end_handle: self.u16()?,
            properties: CharacteristicProperties::from_bits_truncate(self.u16()?),
            uuid128: self.uuid128()?,
        })
    }

    fn descriptor(&mut self) -> Result<GattDescriptor, ProtocolError> {
        Ok(GattDescriptor {
            handle: self.u16()?,
            uuid128: self.uuid128()?,
        })
    }

    /// Length-prefixed attribute value
    fn attribute_value(&mut self) -> Result<Vec<u8>, ProtocolError> {
        let len = usize::from(self.u16()?);
        if len > ATT_MAX_LONG_ATTRIBUTE_SIZE {
            return Err(ProtocolError::InvalidValue {
                field: "attribute value length",
                value: len as u32,
            });
        }
        self.bytes(len)
    }

    /// Length of the data element at the current position
    fn data_element_len(&mut self) -> Result<usize, ProtocolError> {
        let rest = &self.cursor.get_ref()[self.position()..];
        data_element_len(rest).ok_or_else(|| self.truncated(1))
    }

    /// NUL-terminated string of at most `max` bytes, ending at the payload end
    fn c_string(&mut self, max: usize) -> String {
        let rest = &self.cursor.get_ref()[self.position()..];
        let limited = &rest[..rest.len().min(max)];
        let end = limited
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(limited.len());
        String::from_utf8_lossy(&limited[..end]).into_owned()
    }
}
