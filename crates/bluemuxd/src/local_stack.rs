//! In-process protocol engine without a radio
//!
//! Keeps the controller-side registries (L2CAP services, RFCOMM server
//! channels, SDP records, persistent channel assignments) and reports state
//! changes as [`StackEvent`]s. No remote device is ever reachable, so
//! outgoing connections and SDP queries complete with "no link".

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use bluemux::protocol::command::{data_element_len, GattRequest};
use bluemux::stack::{
    GattClientService, HciControl, L2capChannelInfo, L2capService, RfcommChannelInfo,
    RfcommService, SdpService, StackResult,
};
use bluemux::{BdAddr, ConnectionHandle, ControllerState, PowerMode, StackEvent, StatusCode};
use log::{debug, info, warn};

/// First dynamically allocated channel identifier
const FIRST_DYNAMIC_CID: u16 = 0x0040;
/// First SDP record handle handed to clients
const FIRST_RECORD_HANDLE: u32 = 0x0001_0000;
/// RFCOMM server channels are 1..=30
const RFCOMM_MAX_SERVER_CHANNEL: u8 = 30;
/// ATT MTU before any exchange
const ATT_DEFAULT_MTU: u16 = 23;
/// Connection terminated by local host
const REASON_LOCAL_HOST_TERMINATED: u8 = 0x16;

// SDP data element headers
const DE_UINT16: u8 = 0x09;
const DE_UINT32: u8 = 0x0A;
const DE_SEQUENCE_8: u8 = 0x35;
const DE_SEQUENCE_16: u8 = 0x36;
const DE_SEQUENCE_32: u8 = 0x37;
const SDP_SERVICE_RECORD_HANDLE: u16 = 0x0000;

#[derive(Debug)]
pub struct LocalStack {
    name: String,
    state: ControllerState,
    discoverable: bool,
    events: VecDeque<StackEvent>,
    links: HashSet<ConnectionHandle>,
    next_cid: u16,
    l2cap_services: HashMap<u16, u16>,
    l2cap_channels: HashSet<u16>,
    rfcomm_services: HashMap<u8, u16>,
    rfcomm_channels: HashSet<u16>,
    persistent_channels: HashMap<String, u8>,
    sdp_records: BTreeMap<u32, Vec<u8>>,
    next_record_handle: u32,
}

impl LocalStack {
    pub fn new(name: Option<String>) -> Self {
        Self {
            name: name.unwrap_or_else(|| "bluemux".to_string()),
            state: ControllerState::Off,
            discoverable: false,
            events: VecDeque::new(),
            links: HashSet::new(),
            next_cid: FIRST_DYNAMIC_CID,
            l2cap_services: HashMap::new(),
            l2cap_channels: HashSet::new(),
            rfcomm_services: HashMap::new(),
            rfcomm_channels: HashSet::new(),
            persistent_channels: HashMap::new(),
            sdp_records: BTreeMap::new(),
            next_record_handle: FIRST_RECORD_HANDLE,
        }
    }

    /// Next queued event
    pub fn poll_event(&mut self) -> Option<StackEvent> {
        self.events.pop_front()
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn discoverable(&self) -> bool {
        self.discoverable
    }

    /// Stored record, service record handle attribute included
    pub fn service_record(&self, handle: u32) -> Option<&[u8]> {
        self.sdp_records.get(&handle).map(Vec::as_slice)
    }

    fn transition(&mut self, states: &[ControllerState]) {
        for state in states {
            self.state = *state;
            self.events.push_back(StackEvent::StateChanged(*state));
        }
    }

    fn require_working(&self) -> StackResult<()> {
        if self.state == ControllerState::Working {
            Ok(())
        } else {
            Err(StatusCode::COMMAND_DISALLOWED)
        }
    }

    fn alloc_cid(&mut self) -> StackResult<u16> {
        let start = self.next_cid;
        loop {
            let cid = self.next_cid;
            self.next_cid = match self.next_cid.checked_add(1) {
                Some(next) => next,
                None => FIRST_DYNAMIC_CID,
            };
            if !self.l2cap_channels.contains(&cid) && !self.rfcomm_channels.contains(&cid) {
                return Ok(cid);
            }
            if self.next_cid == start {
                return Err(StatusCode::MEMORY_ALLOC_FAILED);
            }
        }
    }

    fn close_link(&mut self, handle: ConnectionHandle) {
        self.events.push_back(StackEvent::LinkDisconnected {
            status: StatusCode::SUCCESS,
            handle,
            reason: REASON_LOCAL_HOST_TERMINATED,
        });
    }
}

impl HciControl for LocalStack {
    fn set_power(&mut self, mode: PowerMode) -> StackResult<()> {
        match mode {
            PowerMode::On => {
                if self.state != ControllerState::Working {
                    info!("Controller {} powering on", self.name);
                    self.transition(&[ControllerState::Initializing, ControllerState::Working]);
                }
            }
            PowerMode::Off => {
                if self.state != ControllerState::Off {
                    info!("Controller {} powering off", self.name);
                    let handles: Vec<_> = self.links.drain().collect();
                    if !handles.is_empty() {
                        for handle in handles {
                            self.close_link(handle);
                        }
                        self.events.push_back(StackEvent::ConnectionCountChanged(0));
                    }
                    self.l2cap_channels.clear();
                    self.rfcomm_channels.clear();
                    self.transition(&[ControllerState::Halting, ControllerState::Off]);
                }
            }
            PowerMode::Sleep => {
                if self.state == ControllerState::Working {
                    info!("Controller {} going to sleep", self.name);
                    self.transition(&[ControllerState::FallingAsleep, ControllerState::Sleeping]);
                }
            }
        }
        Ok(())
    }

    fn set_discoverable(&mut self, discoverable: bool) -> StackResult<()> {
        if self.discoverable != discoverable {
            debug!("Discoverable {}", discoverable);
        }
        self.discoverable = discoverable;
        Ok(())
    }

    fn is_link_open(&self, handle: ConnectionHandle) -> bool {
        self.links.contains(&handle)
    }

    fn disconnect(&mut self, handle: ConnectionHandle) -> StackResult<()> {
        if !self.links.remove(&handle) {
            return Err(StatusCode::UNKNOWN_CONNECTION_IDENTIFIER);
        }
        self.close_link(handle);
        let count = self.links.len() as u16;
        self.events
            .push_back(StackEvent::ConnectionCountChanged(count));
        Ok(())
    }

    fn disconnect_all(&mut self) -> StackResult<()> {
        let handles: Vec<_> = self.links.drain().collect();
        if handles.is_empty() {
            return Ok(());
        }
        for handle in handles {
            self.close_link(handle);
        }
        self.events.push_back(StackEvent::ConnectionCountChanged(0));
        Ok(())
    }

    fn send_hci_command(&mut self, command: &[u8]) -> StackResult<()> {
        if command.len() < 3 {
            return Err(StatusCode::INVALID_PARAMETERS);
        }
        self.require_working()?;
        // Command complete: one packet allowed, opcode, status
        self.events.push_back(StackEvent::HciEvent(vec![
            0x0E,
            4,
            1,
            command[0],
            command[1],
            StatusCode::SUCCESS.value(),
        ]));
        Ok(())
    }

    fn le_scan(&mut self, enable: bool) -> StackResult<()> {
        self.require_working()?;
        debug!("LE scan {}", if enable { "started" } else { "stopped" });
        Ok(())
    }

    fn le_set_scan_parameters(
        &mut self,
        scan_type: u8,
        interval: u16,
        window: u16,
    ) -> StackResult<()> {
        if window > interval {
            return Err(StatusCode::INVALID_PARAMETERS);
        }
        debug!(
            "LE scan parameters: type {} interval {} window {}",
            scan_type, interval, window
        );
        Ok(())
    }

    fn le_connect(&mut self, _addr_type: u8, addr: BdAddr) -> StackResult<()> {
        self.require_working()?;
        debug!("LE connection to {} pending", addr);
        Ok(())
    }

    fn le_connect_cancel(&mut self) -> StackResult<()> {
        Ok(())
    }
}

impl L2capService for LocalStack {
    fn l2cap_create_channel(&mut self, addr: BdAddr, psm: u16, mtu: u16) -> StackResult<u16> {
        self.require_working()?;
        let cid = self.alloc_cid()?;
        debug!("L2CAP channel 0x{:04x} to {} psm 0x{:04x}: no link", cid, addr, psm);
        self.events
            .push_back(StackEvent::L2capChannelOpened(L2capChannelInfo {
                status: StatusCode::UNKNOWN_CONNECTION_IDENTIFIER,
                addr,
                handle: 0,
                psm,
                local_cid: cid,
                remote_cid: 0,
                local_mtu: mtu,
                remote_mtu: 0,
            }));
        Ok(cid)
    }

    fn l2cap_disconnect(&mut self, cid: u16, _reason: u8) -> StackResult<()> {
        if !self.l2cap_channels.remove(&cid) {
            return Err(StatusCode::UNKNOWN_CONNECTION_IDENTIFIER);
        }
        self.events
            .push_back(StackEvent::L2capChannelClosed { cid });
        Ok(())
    }

    fn l2cap_register_service(&mut self, psm: u16, mtu: u16) -> StackResult<()> {
        if self.l2cap_services.contains_key(&psm) {
            return Err(StatusCode::SERVICE_ALREADY_REGISTERED);
        }
        self.l2cap_services.insert(psm, mtu);
        Ok(())
    }

    fn l2cap_unregister_service(&mut self, psm: u16) -> StackResult<()> {
        self.l2cap_services
            .remove(&psm)
            .map(|_| ())
            .ok_or(StatusCode::SERVICE_DOES_NOT_EXIST)
    }

    fn l2cap_accept_connection(&mut self, cid: u16) -> StackResult<()> {
        if self.l2cap_channels.contains(&cid) {
            Ok(())
        } else {
            Err(StatusCode::UNKNOWN_CONNECTION_IDENTIFIER)
        }
    }

    fn l2cap_decline_connection(&mut self, cid: u16, _reason: u8) -> StackResult<()> {
        if self.l2cap_channels.remove(&cid) {
            Ok(())
        } else {
            Err(StatusCode::UNKNOWN_CONNECTION_IDENTIFIER)
        }
    }

    fn l2cap_send(&mut self, cid: u16, _data: &[u8]) -> StackResult<()> {
        if self.l2cap_channels.contains(&cid) {
            Ok(())
        } else {
            Err(StatusCode::UNKNOWN_CONNECTION_IDENTIFIER)
        }
    }
}

impl RfcommService for LocalStack {
    fn rfcomm_create_channel(
        &mut self,
        addr: BdAddr,
        server_channel: u8,
        _initial_credits: Option<u8>,
    ) -> StackResult<u16> {
        self.require_working()?;
        let cid = self.alloc_cid()?;
        debug!("RFCOMM channel 0x{:04x} to {} channel {}: no link", cid, addr, server_channel);
        self.events
            .push_back(StackEvent::RfcommChannelOpened(RfcommChannelInfo {
                status: StatusCode::UNKNOWN_CONNECTION_IDENTIFIER,
                addr,
                handle: 0,
                server_channel,
                cid,
                max_frame_size: 0,
            }));
        Ok(cid)
    }

    fn rfcomm_disconnect(&mut self, cid: u16) -> StackResult<()> {
        if !self.rfcomm_channels.remove(&cid) {
            return Err(StatusCode::UNKNOWN_CONNECTION_IDENTIFIER);
        }
        self.events
            .push_back(StackEvent::RfcommChannelClosed { cid });
        Ok(())
    }

    fn rfcomm_register_service(
        &mut self,
        server_channel: u8,
        mtu: u16,
        _initial_credits: Option<u8>,
    ) -> StackResult<()> {
        if server_channel == 0 || server_channel > RFCOMM_MAX_SERVER_CHANNEL {
            return Err(StatusCode::INVALID_PARAMETERS);
        }
        if self.rfcomm_services.contains_key(&server_channel) {
            return Err(StatusCode::RFCOMM_CHANNEL_ALREADY_REGISTERED);
        }
        self.rfcomm_services.insert(server_channel, mtu);
        Ok(())
    }

    fn rfcomm_unregister_service(&mut self, server_channel: u8) -> StackResult<()> {
        self.rfcomm_services
            .remove(&server_channel)
            .map(|_| ())
            .ok_or(StatusCode::SERVICE_DOES_NOT_EXIST)
    }

    fn rfcomm_accept_connection(&mut self, cid: u16) -> StackResult<()> {
        if self.rfcomm_channels.contains(&cid) {
            Ok(())
        } else {
            Err(StatusCode::UNKNOWN_CONNECTION_IDENTIFIER)
        }
    }

    fn rfcomm_decline_connection(&mut self, cid: u16) -> StackResult<()> {
        if self.rfcomm_channels.remove(&cid) {
            Ok(())
        } else {
            Err(StatusCode::UNKNOWN_CONNECTION_IDENTIFIER)
        }
    }

    fn rfcomm_grant_credits(&mut self, cid: u16, _credits: u8) -> StackResult<()> {
        if self.rfcomm_channels.contains(&cid) {
            Ok(())
        } else {
            Err(StatusCode::UNKNOWN_CONNECTION_IDENTIFIER)
        }
    }

    fn rfcomm_send(&mut self, cid: u16, _data: &[u8]) -> StackResult<()> {
        if self.rfcomm_channels.contains(&cid) {
            Ok(())
        } else {
            Err(StatusCode::UNKNOWN_CONNECTION_IDENTIFIER)
        }
    }

    fn rfcomm_persistent_channel(&mut self, service_name: &str) -> StackResult<u8> {
        if let Some(channel) = self.persistent_channels.get(service_name) {
            return Ok(*channel);
        }
        let taken: HashSet<u8> = self.persistent_channels.values().copied().collect();
        let channel = (1..=RFCOMM_MAX_SERVER_CHANNEL)
            .find(|channel| !taken.contains(channel))
            .ok_or(StatusCode::MEMORY_ALLOC_FAILED)?;
        info!("Assigned RFCOMM channel {} to {:?}", channel, service_name);
        self.persistent_channels
            .insert(service_name.to_string(), channel);
        Ok(channel)
    }
}

impl SdpService for LocalStack {
    fn sdp_register_service(&mut self, record: &[u8]) -> StackResult<u32> {
        let body = sequence_body(record).ok_or(StatusCode::INVALID_PARAMETERS)?;
        let handle = self.next_record_handle;
        if self.sdp_records.contains_key(&handle) {
            warn!("SDP record handle 0x{:08x} already in use", handle);
            return Err(StatusCode::MEMORY_ALLOC_FAILED);
        }
        self.next_record_handle = handle
            .checked_add(1)
            .ok_or(StatusCode::MEMORY_ALLOC_FAILED)?;

        let mut contents = Vec::with_capacity(8 + body.len());
        contents.push(DE_UINT16);
        contents.extend_from_slice(&SDP_SERVICE_RECORD_HANDLE.to_be_bytes());
        contents.push(DE_UINT32);
        contents.extend_from_slice(&handle.to_be_bytes());
        contents.extend_from_slice(body);

        self.sdp_records.insert(handle, encode_sequence(&contents));
        debug!("Stored SDP record 0x{:08x}", handle);
        Ok(handle)
    }

    fn sdp_unregister_service(&mut self, handle: u32) -> StackResult<()> {
        self.sdp_records
            .remove(&handle)
            .map(|_| ())
            .ok_or(StatusCode::SERVICE_DOES_NOT_EXIST)
    }

    fn sdp_query_rfcomm_services(
        &mut self,
        addr: BdAddr,
        _search_pattern: &[u8],
    ) -> StackResult<()> {
        self.require_working()?;
        debug!("SDP query to {}: no link", addr);
        self.events.push_back(StackEvent::SdpQueryComplete {
            status: StatusCode::UNKNOWN_CONNECTION_IDENTIFIER,
        });
        Ok(())
    }

    fn sdp_query_services(
        &mut self,
        addr: BdAddr,
        search_pattern: &[u8],
        _attribute_ids: &[u8],
    ) -> StackResult<()> {
        self.sdp_query_rfcomm_services(addr, search_pattern)
    }
}

impl GattClientService for LocalStack {
    fn gatt_request(
        &mut self,
        handle: ConnectionHandle,
        request: &GattRequest,
    ) -> StackResult<()> {
        if !self.links.contains(&handle) {
            return Err(StatusCode::NOT_CONNECTED);
        }
        debug!("GATT request on 0x{:04x}: {:?}", handle, request);
        Ok(())
    }

    fn gatt_mtu(&self, handle: ConnectionHandle) -> StackResult<u16> {
        if self.links.contains(&handle) {
            Ok(ATT_DEFAULT_MTU)
        } else {
            Err(StatusCode::UNKNOWN_CONNECTION_IDENTIFIER)
        }
    }
}

/// Contents of a data element sequence spanning all of `record`
fn sequence_body(record: &[u8]) -> Option<&[u8]> {
    let header_len = match *record.first()? {
        DE_SEQUENCE_8 => 2,
        DE_SEQUENCE_16 => 3,
        DE_SEQUENCE_32 => 5,
        _ => return None,
    };
    if data_element_len(record)? != record.len() {
        return None;
    }
    record.get(header_len..)
}

/// Wrap `contents` in the shortest sequence header
fn encode_sequence(contents: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + contents.len());
    if let Ok(len) = u8::try_from(contents.len()) {
        out.push(DE_SEQUENCE_8);
        out.push(len);
    } else if let Ok(len) = u16::try_from(contents.len()) {
        out.push(DE_SEQUENCE_16);
        out.extend_from_slice(&len.to_be_bytes());
    } else {
        out.push(DE_SEQUENCE_32);
        out.extend_from_slice(&(contents.len() as u32).to_be_bytes());
    }
    out.extend_from_slice(contents);
    out
}
