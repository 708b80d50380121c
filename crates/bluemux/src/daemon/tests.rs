//! Tests for the daemon core

use std::collections::HashSet;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::*;
use crate::gatt::LongAttributeKind;
use crate::power::{BluetoothStatus, ControllerState, IdleOutcome};
use crate::protocol::command::GattRequest;
use crate::protocol::constants::*;
use crate::stack::*;
use crate::types::{BdAddr, ConnectionHandle, StatusCode};

const C1: ClientId = ClientId(1);
const C2: ClientId = ClientId(2);
const LINK: ConnectionHandle = 0x0040;

/// Protocol engine double that records every call
#[derive(Default)]
struct RecordingStack {
    calls: Vec<String>,
    links: HashSet<ConnectionHandle>,
    next_cid: u16,
    next_record: u32,
    fail_hci: Option<StatusCode>,
    fail_sdp_register: bool,
    fail_gatt: Option<StatusCode>,
}

impl RecordingStack {
    fn called(&self, call: &str) -> bool {
        self.calls.iter().any(|c| c == call)
    }

    fn position(&self, call: &str) -> Option<usize> {
        self.calls.iter().position(|c| c == call)
    }

    fn alloc_cid(&mut self) -> u16 {
        self.next_cid += 1;
        0x0040 + self.next_cid
    }
}

impl HciControl for RecordingStack {
    fn set_power(&mut self, mode: PowerMode) -> StackResult<()> {
        self.calls.push(format!("set_power({:?})", mode));
        Ok(())
    }

    fn set_discoverable(&mut self, discoverable: bool) -> StackResult<()> {
        self.calls.push(format!("set_discoverable({})", discoverable));
        Ok(())
    }

    fn is_link_open(&self, handle: ConnectionHandle) -> bool {
        self.links.contains(&handle)
    }

    fn disconnect(&mut self, handle: ConnectionHandle) -> StackResult<()> {
        self.calls.push(format!("disconnect({})", handle));
        self.links.remove(&handle);
        Ok(())
    }

    fn disconnect_all(&mut self) -> StackResult<()> {
        self.calls.push("disconnect_all".to_string());
        Ok(())
    }

    fn send_hci_command(&mut self, command: &[u8]) -> StackResult<()> {
        self.calls.push(format!("hci({})", hex::encode(command)));
        match self.fail_hci {
            Some(status) => Err(status),
            None => Ok(()),
        }
    }

    fn le_scan(&mut self, enable: bool) -> StackResult<()> {
        self.calls.push(format!("le_scan({})", enable));
        Ok(())
    }

    fn le_set_scan_parameters(&mut self, scan_type: u8, interval: u16, window: u16) -> StackResult<()> {
        self.calls
            .push(format!("le_set_scan_parameters({}, {}, {})", scan_type, interval, window));
        Ok(())
    }

    fn le_connect(&mut self, addr_type: u8, addr: BdAddr) -> StackResult<()> {
        self.calls.push(format!("le_connect({}, {})", addr_type, addr));
        Ok(())
    }

    fn le_connect_cancel(&mut self) -> StackResult<()> {
        self.calls.push("le_connect_cancel".to_string());
        Ok(())
    }
}

impl L2capService for RecordingStack {
    fn l2cap_create_channel(&mut self, _addr: BdAddr, psm: u16, mtu: u16) -> StackResult<u16> {
        self.calls.push(format!("l2cap_create_channel({}, {})", psm, mtu));
        Ok(self.alloc_cid())
    }

    fn l2cap_disconnect(&mut self, cid: u16, _reason: u8) -> StackResult<()> {
        self.calls.push(format!("l2cap_disconnect({})", cid));
        Ok(())
    }

    fn l2cap_register_service(&mut self, psm: u16, _mtu: u16) -> StackResult<()> {
        self.calls.push(format!("l2cap_register_service({})", psm));
        Ok(())
    }

    fn l2cap_unregister_service(&mut self, psm: u16) -> StackResult<()> {
        self.calls.push(format!("l2cap_unregister_service({})", psm));
        Ok(())
    }

    fn l2cap_accept_connection(&mut self, cid: u16) -> StackResult<()> {
        self.calls.push(format!("l2cap_accept_connection({})", cid));
        Ok(())
    }

    fn l2cap_decline_connection(&mut self, cid: u16, _reason: u8) -> StackResult<()> {
        self.calls.push(format!("l2cap_decline_connection({})", cid));
        Ok(())
    }

    fn l2cap_send(&mut self, cid: u16, data: &[u8]) -> StackResult<()> {
        self.calls.push(format!("l2cap_send({}, {})", cid, hex::encode(data)));
        Ok(())
    }
}

impl RfcommService for RecordingStack {
    fn rfcomm_create_channel(
        &mut self,
        _addr: BdAddr,
        server_channel: u8,
        _initial_credits: Option<u8>,
    ) -> StackResult<u16> {
        self.calls
            .push(format!("rfcomm_create_channel({})", server_channel));
        Ok(self.alloc_cid())
    }

    fn rfcomm_disconnect(&mut self, cid: u16) -> StackResult<()> {
        self.calls.push(format!("rfcomm_disconnect({})", cid));
        Ok(())
    }

    fn rfcomm_register_service(
        &mut self,
        server_channel: u8,
        _mtu: u16,
        _initial_credits: Option<u8>,
    ) -> StackResult<()> {
        self.calls
            .push(format!("rfcomm_register_service({})", server_channel));
        Ok(())
    }

    fn rfcomm_unregister_service(&mut self, server_channel: u8) -> StackResult<()> {
        self.calls
            .push(format!("rfcomm_unregister_service({})", server_channel));
        Ok(())
    }

    fn rfcomm_accept_connection(&mut self, cid: u16) -> StackResult<()> {
        self.calls.push(format!("rfcomm_accept_connection({})", cid));
        Ok(())
    }

    fn rfcomm_decline_connection(&mut self, cid: u16) -> StackResult<()> {
        self.calls.push(format!("rfcomm_decline_connection({})", cid));
        Ok(())
    }

    fn rfcomm_grant_credits(&mut self, cid: u16, credits: u8) -> StackResult<()> {
        self.calls
            .push(format!("rfcomm_grant_credits({}, {})", cid, credits));
        Ok(())
    }

    fn rfcomm_send(&mut self, cid: u16, data: &[u8]) -> StackResult<()> {
        self.calls.push(format!("rfcomm_send({}, {})", cid, hex::encode(data)));
        Ok(())
    }

    fn rfcomm_persistent_channel(&mut self, service_name: &str) -> StackResult<u8> {
        self.calls
            .push(format!("rfcomm_persistent_channel({})", service_name));
        Ok(5)
    }
}

impl SdpService for RecordingStack {
    fn sdp_register_service(&mut self, record: &[u8]) -> StackResult<u32> {
        self.calls
            .push(format!("sdp_register_service({})", hex::encode(record)));
        if self.fail_sdp_register {
            return Err(StatusCode::MEMORY_ALLOC_FAILED);
        }
        self.next_record += 1;
        Ok(0x0001_0000 + self.next_record)
    }

    fn sdp_unregister_service(&mut self, handle: u32) -> StackResult<()> {
        self.calls
            .push(format!("sdp_unregister_service({:#x})", handle));
        Ok(())
    }

    fn sdp_query_rfcomm_services(&mut self, addr: BdAddr, _search_pattern: &[u8]) -> StackResult<()> {
        self.calls.push(format!("sdp_query_rfcomm_services({})", addr));
        Ok(())
    }

    fn sdp_query_services(
        &mut self,
        addr: BdAddr,
        _search_pattern: &[u8],
        _attribute_ids: &[u8],
    ) -> StackResult<()> {
        self.calls.push(format!("sdp_query_services({})", addr));
        Ok(())
    }
}

impl GattClientService for RecordingStack {
    fn gatt_request(&mut self, handle: ConnectionHandle, request: &GattRequest) -> StackResult<()> {
        self.calls
            .push(format!("gatt_request({}, {:?})", handle, request));
        match self.fail_gatt {
            Some(status) => Err(status),
            None => Ok(()),
        }
    }

    fn gatt_mtu(&self, handle: ConnectionHandle) -> StackResult<u16> {
        if self.links.contains(&handle) {
            Ok(23)
        } else {
            Err(StatusCode::UNKNOWN_CONNECTION_IDENTIFIER)
        }
    }
}

/// Transport double that keeps every packet it was given
#[derive(Default)]
struct RecordingTransport {
    sent: Vec<(Option<ClientId>, Packet)>,
    retries: usize,
}

impl RecordingTransport {
    /// Payloads delivered to `client`, broadcasts included
    fn received(&self, client: ClientId) -> Vec<&Packet> {
        self.sent
            .iter()
            .filter(|(to, _)| to.map_or(true, |to| to == client))
            .map(|(_, packet)| packet)
            .collect()
    }

    fn unicast(&self, client: ClientId) -> Vec<&Packet> {
        self.sent
            .iter()
            .filter(|(to, _)| *to == Some(client))
            .map(|(_, packet)| packet)
            .collect()
    }

    fn broadcasts(&self) -> Vec<&Packet> {
        self.sent
            .iter()
            .filter(|(to, _)| to.is_none())
            .map(|(_, packet)| packet)
            .collect()
    }
}

impl ClientTransport for RecordingTransport {
    fn send(&mut self, client: ClientId, packet: &Packet) -> io::Result<()> {
        self.sent.push((Some(client), packet.clone()));
        Ok(())
    }

    fn broadcast(&mut self, packet: &Packet) -> io::Result<()> {
        self.sent.push((None, packet.clone()));
        Ok(())
    }

    fn retry_parked(&mut self) {
        self.retries += 1;
    }
}

type TestDaemon = Daemon<RecordingStack, RecordingTransport>;

fn daemon_with_clients(clients: &[ClientId], now: Instant) -> TestDaemon {
    let mut daemon = Daemon::new(
        RecordingStack::default(),
        RecordingTransport::default(),
        Duration::from_secs(10),
    );
    for client in clients {
        daemon.client_connected(*client, now).unwrap();
    }
    daemon
}

fn command(ocf: u16, params: &[u8]) -> Packet {
    let op = opcode(OGF_DAEMON, ocf);
    let mut payload = op.to_le_bytes().to_vec();
    payload.push(params.len() as u8);
    payload.extend_from_slice(params);
    Packet::new(HCI_COMMAND_DATA_PACKET, 0, payload)
}

fn characteristic_params(handle: ConnectionHandle, value_handle: u16) -> Vec<u8> {
    let mut params = handle.to_le_bytes().to_vec();
    params.extend_from_slice(&(value_handle - 1).to_le_bytes());
    params.extend_from_slice(&value_handle.to_le_bytes());
    params.extend_from_slice(&(value_handle + 1).to_le_bytes());
    params.extend_from_slice(&0x0002u16.to_le_bytes());
    params.extend_from_slice(&[0u8; 16]);
    params
}

fn remote_addr() -> BdAddr {
    BdAddr::new([0x00, 0x1B, 0xDC, 0x01, 0x02, 0x03])
}

#[test]
fn test_disconnect_unregisters_rfcomm_service() {
    let now = Instant::now();
    let mut daemon = daemon_with_clients(&[C1], now);

    daemon
        .handle_client_packet(C1, &command(OCF_RFCOMM_REGISTER_SERVICE, &[3, 0x00, 0x01]), now)
        .unwrap();
    assert!(daemon.stack().called("rfcomm_register_service(3)"));
    assert_eq!(
        daemon.transport().unicast(C1).last().unwrap().payload,
        vec![EVT_RFCOMM_SERVICE_REGISTERED, 2, 0x00, 3]
    );
    assert_eq!(
        daemon
            .sessions()
            .ledger()
            .owner_of(ResourceKind::RfcommService, 3),
        Some(C1)
    );

    daemon.client_disconnected(C1, now).unwrap();

    assert!(daemon.stack().called("rfcomm_unregister_service(3)"));
    assert_eq!(
        daemon
            .sessions()
            .ledger()
            .owner_of(ResourceKind::RfcommService, 3),
        None
    );
    assert!(daemon.sessions().is_empty());
}

#[test]
fn test_teardown_order_on_disconnect() {
    let now = Instant::now();
    let mut daemon = daemon_with_clients(&[C1], now);
    daemon.stack_mut().links.insert(LINK);

    daemon
        .handle_client_packet(C1, &command(OCF_GATT_DISCOVER_ALL_PRIMARY_SERVICES, &LINK.to_le_bytes()), now)
        .unwrap();
    daemon
        .handle_client_packet(C1, &command(OCF_L2CAP_REGISTER_SERVICE, &[0x01, 0x10, 0x00, 0x01]), now)
        .unwrap();
    daemon
        .handle_client_packet(C1, &command(OCF_RFCOMM_REGISTER_SERVICE, &[7, 0x00, 0x01]), now)
        .unwrap();
    daemon
        .handle_client_packet(C1, &command(OCF_SDP_REGISTER_SERVICE_RECORD, &[0x35, 0x00]), now)
        .unwrap();

    daemon.client_disconnected(C1, now).unwrap();

    let stack = daemon.stack();
    let sdp = stack.position("sdp_unregister_service(0x10001)").unwrap();
    let rfcomm = stack.position("rfcomm_unregister_service(7)").unwrap();
    let l2cap = stack.position("l2cap_unregister_service(4097)").unwrap();
    let gatt = stack.position(&format!("disconnect({})", LINK)).unwrap();
    let all = stack.position("disconnect_all").unwrap();
    assert!(sdp < rfcomm && rfcomm < l2cap && l2cap < gatt && gatt < all);
}

#[test]
fn test_idle_power_off_after_last_powered_client_leaves() {
    let t0 = Instant::now();
    let mut daemon = daemon_with_clients(&[C1, C2], t0);

    daemon
        .handle_client_packet(C1, &command(OCF_SET_POWER_MODE, &[PowerMode::On as u8]), t0)
        .unwrap();
    assert!(daemon.stack().called("set_power(On)"));
    assert_eq!(daemon.idle_deadline(), None);

    let t1 = t0 + Duration::from_secs(1);
    daemon.client_disconnected(C1, t1).unwrap();
    assert_eq!(daemon.idle_deadline(), Some(t1 + Duration::from_secs(10)));

    assert_eq!(daemon.on_idle_timer(t1 + Duration::from_secs(5)), IdleOutcome::NotDue);
    assert!(!daemon.stack().called("set_power(Off)"));

    assert_eq!(daemon.on_idle_timer(t1 + Duration::from_secs(10)), IdleOutcome::PowerOff);
    assert_eq!(daemon.stack().calls.last().unwrap(), "set_power(Off)");
    assert_eq!(daemon.idle_deadline(), None);
}

#[test]
fn test_bluetooth_enabled_disarms_idle_timer() {
    let t0 = Instant::now();
    let mut daemon = daemon_with_clients(&[C1], t0);
    assert!(daemon.idle_deadline().is_some());

    daemon.handle_stack_event(StackEvent::StateChanged(ControllerState::Working), t0);
    daemon
        .handle_client_packet(C1, &command(OCF_SET_BLUETOOTH_ENABLED, &[1]), t0)
        .unwrap();
    assert_eq!(daemon.idle_deadline(), None);
    assert!(daemon.power().global_enable());
}

#[test]
fn test_bluetooth_disabled_clears_power_requests() {
    let now = Instant::now();
    let mut daemon = daemon_with_clients(&[C1, C2], now);

    daemon
        .handle_client_packet(C1, &command(OCF_SET_POWER_MODE, &[1]), now)
        .unwrap();
    daemon
        .handle_client_packet(C2, &command(OCF_SET_POWER_MODE, &[1]), now)
        .unwrap();
    assert!(daemon.sessions().any_power_on());

    daemon
        .handle_client_packet(C2, &command(OCF_SET_BLUETOOTH_ENABLED, &[0]), now)
        .unwrap();

    assert!(!daemon.sessions().any_power_on());
    assert!(!daemon.power().global_enable());
    assert_eq!(daemon.stack().calls.last().unwrap(), "set_power(Off)");
    assert!(daemon.idle_deadline().is_some());
}

#[test]
fn test_gatt_busy_rejects_second_client() {
    let now = Instant::now();
    let mut daemon = daemon_with_clients(&[C1, C2], now);
    daemon.stack_mut().links.insert(LINK);
    let discover = command(OCF_GATT_DISCOVER_ALL_PRIMARY_SERVICES, &LINK.to_le_bytes());

    daemon.handle_client_packet(C1, &discover, now).unwrap();
    let result = daemon.handle_client_packet(C2, &discover, now);

    assert!(matches!(result, Err(DaemonError::Busy(LINK))));
    assert_eq!(
        daemon.transport().unicast(C2).last().unwrap().payload,
        vec![EVT_GATT_QUERY_COMPLETE, 3, 0x40, 0x00, StatusCode::BUSY.value()]
    );
    assert_eq!(daemon.gatt().active_owner(LINK), Some(C1));
}

#[test]
fn test_gatt_without_link_reports_not_connected() {
    let now = Instant::now();
    let mut daemon = daemon_with_clients(&[C1], now);

    let result = daemon.handle_client_packet(
        C1,
        &command(OCF_GATT_DISCOVER_ALL_PRIMARY_SERVICES, &LINK.to_le_bytes()),
        now,
    );

    assert!(matches!(result, Err(DaemonError::NotConnected(LINK))));
    assert_eq!(
        daemon.transport().unicast(C1).last().unwrap().payload,
        vec![EVT_GATT_QUERY_COMPLETE, 3, 0x40, 0x00, StatusCode::NOT_CONNECTED.value()]
    );
    assert!(daemon.gatt().is_empty());
}

#[test]
fn test_gatt_long_read_delivered_before_completion() {
    let now = Instant::now();
    let mut daemon = daemon_with_clients(&[C1, C2], now);
    daemon.stack_mut().links.insert(LINK);

    daemon
        .handle_client_packet(
            C1,
            &command(OCF_GATT_READ_LONG_VALUE_OF_CHARACTERISTIC, &characteristic_params(LINK, 0x0021)),
            now,
        )
        .unwrap();

    for (offset, data) in [(0u16, vec![1, 2, 3, 4]), (4, vec![5, 6, 7, 8])] {
        daemon.handle_stack_event(
            StackEvent::GattLongFragment {
                handle: LINK,
                kind: LongAttributeKind::CharacteristicValue,
                attribute_handle: 0x0021,
                offset,
                data,
            },
            now,
        );
    }
    daemon.handle_stack_event(
        StackEvent::GattQueryComplete {
            handle: LINK,
            status: StatusCode::SUCCESS,
        },
        now,
    );

    let received = daemon.transport().unicast(C1);
    assert_eq!(received.len(), 2);
    assert_eq!(
        received[0].payload,
        vec![
            EVT_GATT_LONG_CHARACTERISTIC_VALUE_QUERY_RESULT,
            16,
            0x40, 0x00, // connection handle
            0x21, 0x00, // attribute handle
            0x00, 0x00, // offset
            0x08, 0x00, // length
            1, 2, 3, 4, 5, 6, 7, 8,
        ]
    );
    assert_eq!(
        received[1].payload,
        vec![EVT_GATT_QUERY_COMPLETE, 3, 0x40, 0x00, 0x00]
    );
    assert!(daemon.transport().unicast(C2).is_empty());
    assert_eq!(daemon.gatt().active_owner(LINK), None);
}

#[test]
fn test_gatt_oversized_long_fragment_dropped() {
    let now = Instant::now();
    let mut daemon = daemon_with_clients(&[C1], now);
    daemon.stack_mut().links.insert(LINK);

    daemon
        .handle_client_packet(
            C1,
            &command(OCF_GATT_READ_LONG_VALUE_OF_CHARACTERISTIC, &characteristic_params(LINK, 0x0021)),
            now,
        )
        .unwrap();

    for (offset, data) in [(0u16, vec![1, 2]), (510, vec![9, 9, 9, 9])] {
        daemon.handle_stack_event(
            StackEvent::GattLongFragment {
                handle: LINK,
                kind: LongAttributeKind::CharacteristicValue,
                attribute_handle: 0x0021,
                offset,
                data,
            },
            now,
        );
    }
    daemon.handle_stack_event(
        StackEvent::GattQueryComplete {
            handle: LINK,
            status: StatusCode::SUCCESS,
        },
        now,
    );

    let received = daemon.transport().unicast(C1);
    assert_eq!(received.len(), 2);
    assert_eq!(&received[0].payload[8..], &[0x02, 0x00, 1, 2]);
    assert_eq!(received[1].payload[0], EVT_GATT_QUERY_COMPLETE);
}

#[test]
fn test_gatt_write_without_response_does_not_block() {
    let now = Instant::now();
    let mut daemon = daemon_with_clients(&[C1, C2], now);
    daemon.stack_mut().links.insert(LINK);

    daemon
        .handle_client_packet(C1, &command(OCF_GATT_DISCOVER_ALL_PRIMARY_SERVICES, &LINK.to_le_bytes()), now)
        .unwrap();

    let mut params = characteristic_params(LINK, 0x0021);
    params.extend_from_slice(&[0x02, 0x00, 0xAA, 0xBB]);
    daemon
        .handle_client_packet(
            C2,
            &command(OCF_GATT_WRITE_VALUE_OF_CHARACTERISTIC_WITHOUT_RESPONSE, &params),
            now,
        )
        .unwrap();

    assert_eq!(daemon.gatt().active_owner(LINK), Some(C1));
    assert!(daemon.gatt().get(LINK).unwrap().has_user(C2));
}

#[test]
fn test_gatt_result_needs_active_owner() {
    let now = Instant::now();
    let mut daemon = daemon_with_clients(&[C1], now);
    daemon.stack_mut().links.insert(LINK);
    daemon
        .handle_client_packet(C1, &command(OCF_GATT_DISCOVER_ALL_PRIMARY_SERVICES, &LINK.to_le_bytes()), now)
        .unwrap();

    let result = StackEvent::GattResult {
        handle: LINK,
        kind: GattResultKind::Service,
        body: vec![0x01, 0x00, 0x05, 0x00],
    };
    daemon.handle_stack_event(result.clone(), now);
    assert_eq!(
        daemon.transport().unicast(C1).last().unwrap().payload,
        vec![EVT_GATT_SERVICE_QUERY_RESULT, 6, 0x40, 0x00, 0x01, 0x00, 0x05, 0x00]
    );

    daemon.handle_stack_event(
        StackEvent::GattQueryComplete {
            handle: LINK,
            status: StatusCode::SUCCESS,
        },
        now,
    );
    let before = daemon.transport().sent.len();
    daemon.handle_stack_event(result, now);
    assert_eq!(daemon.transport().sent.len(), before);
}

#[test]
fn test_gatt_request_failure_clears_owner() {
    let now = Instant::now();
    let mut daemon = daemon_with_clients(&[C1], now);
    daemon.stack_mut().links.insert(LINK);
    daemon.stack_mut().fail_gatt = Some(StatusCode::BUSY);

    let result = daemon.handle_client_packet(
        C1,
        &command(OCF_GATT_DISCOVER_ALL_PRIMARY_SERVICES, &LINK.to_le_bytes()),
        now,
    );

    assert!(result.is_err());
    assert_eq!(daemon.gatt().active_owner(LINK), None);
    assert_eq!(
        daemon.transport().unicast(C1).last().unwrap().payload,
        vec![EVT_GATT_QUERY_COMPLETE, 3, 0x40, 0x00, StatusCode::BUSY.value()]
    );
}

#[test]
fn test_notification_broadcast_only_with_helper() {
    let now = Instant::now();
    let mut daemon = daemon_with_clients(&[C1, C2], now);
    let notification = StackEvent::GattNotification {
        handle: LINK,
        indication: false,
        attribute_handle: 0x0021,
        data: vec![0x42],
    };

    daemon.handle_stack_event(notification.clone(), now);
    assert!(daemon.transport().broadcasts().is_empty());

    daemon.stack_mut().links.insert(LINK);
    daemon
        .handle_client_packet(C1, &command(OCF_GATT_DISCOVER_ALL_PRIMARY_SERVICES, &LINK.to_le_bytes()), now)
        .unwrap();
    daemon.handle_stack_event(notification, now);

    let broadcasts = daemon.transport().broadcasts();
    assert_eq!(broadcasts.len(), 1);
    assert_eq!(
        broadcasts[0].payload,
        vec![EVT_GATT_NOTIFICATION, 7, 0x40, 0x00, 0x21, 0x00, 0x01, 0x00, 0x42]
    );
}

#[test]
fn test_last_gatt_user_disconnects_link() {
    let now = Instant::now();
    let mut daemon = daemon_with_clients(&[C1, C2], now);
    daemon.stack_mut().links.insert(LINK);
    let discover = command(OCF_GATT_DISCOVER_ALL_PRIMARY_SERVICES, &LINK.to_le_bytes());

    daemon.handle_client_packet(C1, &discover, now).unwrap();
    daemon.handle_stack_event(
        StackEvent::GattQueryComplete {
            handle: LINK,
            status: StatusCode::SUCCESS,
        },
        now,
    );
    daemon.handle_client_packet(C2, &discover, now).unwrap();

    daemon.client_disconnected(C1, now).unwrap();
    assert!(!daemon.stack().called(&format!("disconnect({})", LINK)));
    assert!(!daemon.stack().called("disconnect_all"));

    daemon.client_disconnected(C2, now).unwrap();
    assert!(daemon.stack().called(&format!("disconnect({})", LINK)));
    assert!(daemon.stack().called("disconnect_all"));
}

#[test]
fn test_link_disconnected_removes_handle_everywhere() {
    let now = Instant::now();
    let mut daemon = daemon_with_clients(&[C1, C2], now);
    daemon.stack_mut().links.insert(LINK);

    daemon
        .handle_client_packet(C1, &command(OCF_GATT_DISCOVER_ALL_PRIMARY_SERVICES, &LINK.to_le_bytes()), now)
        .unwrap();
    let mut params = characteristic_params(LINK, 0x0021);
    params.extend_from_slice(&[0x01, 0x00, 0xAA]);
    daemon
        .handle_client_packet(
            C2,
            &command(OCF_GATT_WRITE_VALUE_OF_CHARACTERISTIC_WITHOUT_RESPONSE, &params),
            now,
        )
        .unwrap();

    daemon.handle_stack_event(
        StackEvent::LinkDisconnected {
            status: StatusCode::SUCCESS,
            handle: LINK,
            reason: 0x13,
        },
        now,
    );

    let ledger = daemon.sessions().ledger();
    assert!(!ledger.holds(C1, ResourceKind::GattConnection, LINK.into()));
    assert!(!ledger.holds(C2, ResourceKind::GattConnection, LINK.into()));
    assert!(!daemon.gatt().contains(LINK));
    assert_eq!(
        daemon.transport().broadcasts().last().unwrap().payload,
        vec![EVT_DISCONNECTION_COMPLETE, 4, 0x00, 0x40, 0x00, 0x13]
    );
}

#[test]
fn test_register_conflict_between_clients() {
    let now = Instant::now();
    let mut daemon = daemon_with_clients(&[C1, C2], now);
    let register = command(OCF_L2CAP_REGISTER_SERVICE, &[0x01, 0x10, 0x00, 0x01]);

    daemon.handle_client_packet(C1, &register, now).unwrap();
    let result = daemon.handle_client_packet(C2, &register, now);

    assert!(result.is_err());
    assert_eq!(
        daemon.transport().unicast(C2).last().unwrap().payload,
        vec![
            EVT_L2CAP_SERVICE_REGISTERED,
            3,
            StatusCode::SERVICE_ALREADY_REGISTERED.value(),
            0x01,
            0x10
        ]
    );
    let registrations = daemon
        .stack()
        .calls
        .iter()
        .filter(|c| c.starts_with("l2cap_register_service"))
        .count();
    assert_eq!(registrations, 1);
    assert_eq!(
        daemon
            .sessions()
            .ledger()
            .owner_of(ResourceKind::L2capService, 0x1001),
        Some(C1)
    );
}

#[test]
fn test_rfcomm_register_conflict_status() {
    let now = Instant::now();
    let mut daemon = daemon_with_clients(&[C1, C2], now);
    let register = command(OCF_RFCOMM_REGISTER_SERVICE, &[9, 0x00, 0x01]);

    daemon.handle_client_packet(C1, &register, now).unwrap();
    assert!(daemon.handle_client_packet(C2, &register, now).is_err());

    assert_eq!(
        daemon.transport().unicast(C2).last().unwrap().payload,
        vec![
            EVT_RFCOMM_SERVICE_REGISTERED,
            2,
            StatusCode::RFCOMM_CHANNEL_ALREADY_REGISTERED.value(),
            9
        ]
    );
}

#[test]
fn test_incoming_connection_routed_to_service_owner() {
    let now = Instant::now();
    let mut daemon = daemon_with_clients(&[C1, C2], now);
    daemon
        .handle_client_packet(C2, &command(OCF_RFCOMM_REGISTER_SERVICE, &[4, 0x00, 0x01]), now)
        .unwrap();

    daemon.handle_stack_event(
        StackEvent::RfcommIncomingConnection {
            addr: remote_addr(),
            server_channel: 4,
            cid: 0x0050,
        },
        now,
    );

    assert!(daemon.transport().unicast(C1).is_empty());
    let incoming = daemon.transport().unicast(C2);
    assert_eq!(incoming.last().unwrap().payload[0], EVT_RFCOMM_INCOMING_CONNECTION);
    assert_eq!(
        daemon
            .sessions()
            .ledger()
            .owner_of(ResourceKind::RfcommChannel, 0x0050),
        Some(C2)
    );

    daemon
        .handle_client_packet(C2, &command(OCF_RFCOMM_ACCEPT_CONNECTION, &[0x50, 0x00]), now)
        .unwrap();
    assert!(daemon.stack().called("rfcomm_accept_connection(80)"));
}

#[test]
fn test_incoming_connection_without_owner_is_dropped() {
    let now = Instant::now();
    let mut daemon = daemon_with_clients(&[C1], now);

    daemon.handle_stack_event(
        StackEvent::L2capIncomingConnection {
            addr: remote_addr(),
            handle: LINK,
            psm: 0x1001,
            local_cid: 0x0050,
            remote_cid: 0x0060,
        },
        now,
    );

    assert!(daemon.transport().sent.is_empty());
    assert_eq!(
        daemon
            .sessions()
            .ledger()
            .owner_of(ResourceKind::L2capChannel, 0x0050),
        None
    );
}

#[test]
fn test_channel_lifecycle_and_data_routing() {
    let now = Instant::now();
    let mut daemon = daemon_with_clients(&[C1, C2], now);
    let mut params = remote_addr().to_wire().to_vec();
    params.extend_from_slice(&0x1001u16.to_le_bytes());

    daemon
        .handle_client_packet(C1, &command(OCF_L2CAP_CREATE_CHANNEL, &params), now)
        .unwrap();
    assert!(daemon.stack().called("l2cap_create_channel(4097, 150)"));
    let cid: u16 = 0x0041;
    assert_eq!(
        daemon
            .sessions()
            .ledger()
            .owner_of(ResourceKind::L2capChannel, cid.into()),
        Some(C1)
    );

    daemon.handle_stack_event(
        StackEvent::L2capData {
            cid,
            data: vec![0xDE, 0xAD],
        },
        now,
    );
    let data = daemon.transport().unicast(C1);
    assert_eq!(data.last().unwrap().packet_type, L2CAP_DATA_PACKET);
    assert_eq!(data.last().unwrap().channel, cid);
    assert!(daemon.transport().unicast(C2).is_empty());

    daemon
        .handle_client_packet(C1, &Packet::new(L2CAP_DATA_PACKET, cid, vec![0x01]), now)
        .unwrap();
    assert!(daemon.stack().called("l2cap_send(65, 01)"));

    let stolen = daemon.handle_client_packet(C2, &Packet::new(L2CAP_DATA_PACKET, cid, vec![0x02]), now);
    assert!(matches!(stolen, Err(DaemonError::OwnershipConflict { .. })));
    assert!(!daemon.stack().called("l2cap_send(65, 02)"));

    daemon.handle_stack_event(StackEvent::L2capChannelClosed { cid }, now);
    assert_eq!(
        daemon.transport().unicast(C1).last().unwrap().payload,
        vec![EVT_L2CAP_CHANNEL_CLOSED, 2, 0x41, 0x00]
    );
    assert_eq!(
        daemon
            .sessions()
            .ledger()
            .owner_of(ResourceKind::L2capChannel, cid.into()),
        None
    );
}

#[test]
fn test_failed_open_releases_channel() {
    let now = Instant::now();
    let mut daemon = daemon_with_clients(&[C1], now);
    let mut params = remote_addr().to_wire().to_vec();
    params.push(3);

    daemon
        .handle_client_packet(C1, &command(OCF_RFCOMM_CREATE_CHANNEL, &params), now)
        .unwrap();
    let cid: u16 = 0x0041;

    daemon.handle_stack_event(
        StackEvent::RfcommChannelOpened(RfcommChannelInfo {
            status: StatusCode::PAGE_TIMEOUT,
            addr: remote_addr(),
            handle: 0,
            server_channel: 3,
            cid,
            max_frame_size: 0,
        }),
        now,
    );

    let opened = daemon.transport().unicast(C1);
    assert_eq!(opened.last().unwrap().payload[0], EVT_RFCOMM_OPEN_CHANNEL_COMPLETE);
    assert_eq!(opened.last().unwrap().payload[2], StatusCode::PAGE_TIMEOUT.value());
    assert!(!daemon
        .sessions()
        .ledger()
        .holds(C1, ResourceKind::RfcommChannel, cid.into()));
}

#[test]
fn test_create_closes_channel_already_claimed() {
    let now = Instant::now();
    let mut daemon = daemon_with_clients(&[C1, C2], now);
    let cid: u16 = 0x0041;
    daemon
        .sessions
        .ledger_mut()
        .acquire(C2, ResourceKind::L2capChannel, cid.into())
        .unwrap();
    let mut params = remote_addr().to_wire().to_vec();
    params.extend_from_slice(&0x1001u16.to_le_bytes());

    let result = daemon.handle_client_packet(C1, &command(OCF_L2CAP_CREATE_CHANNEL, &params), now);

    assert!(matches!(result, Err(DaemonError::OwnershipConflict { .. })));
    assert!(daemon.stack().called("l2cap_disconnect(65)"));
    let replies = daemon.transport().unicast(C1);
    assert_eq!(replies.last().unwrap().payload[0], EVT_L2CAP_CHANNEL_OPENED);
    assert_eq!(replies.last().unwrap().payload[2], StatusCode::COMMAND_DISALLOWED.value());
    assert_eq!(
        daemon.sessions().ledger().owner_of(ResourceKind::L2capChannel, cid.into()),
        Some(C2)
    );
}

#[test]
fn test_rfcomm_create_closes_channel_already_claimed() {
    let now = Instant::now();
    let mut daemon = daemon_with_clients(&[C1, C2], now);
    let cid: u16 = 0x0041;
    daemon
        .sessions
        .ledger_mut()
        .acquire(C2, ResourceKind::RfcommChannel, cid.into())
        .unwrap();
    let mut params = remote_addr().to_wire().to_vec();
    params.push(3);

    let result = daemon.handle_client_packet(C1, &command(OCF_RFCOMM_CREATE_CHANNEL, &params), now);

    assert!(result.is_err());
    assert!(daemon.stack().called("rfcomm_disconnect(65)"));
    let replies = daemon.transport().unicast(C1);
    assert_eq!(replies.last().unwrap().payload[0], EVT_RFCOMM_OPEN_CHANNEL_COMPLETE);
    assert_eq!(replies.last().unwrap().payload[2], StatusCode::COMMAND_DISALLOWED.value());
    assert!(!daemon
        .sessions()
        .ledger()
        .holds(C1, ResourceKind::RfcommChannel, cid.into()));
}

#[test]
fn test_sdp_record_already_claimed_is_withdrawn() {
    let now = Instant::now();
    let mut daemon = daemon_with_clients(&[C1, C2], now);
    daemon
        .sessions
        .ledger_mut()
        .acquire(C2, ResourceKind::SdpRecord, 0x0001_0001)
        .unwrap();

    let result =
        daemon.handle_client_packet(C1, &command(OCF_SDP_REGISTER_SERVICE_RECORD, &[0x35, 0x00]), now);

    assert!(matches!(result, Err(DaemonError::OwnershipConflict { .. })));
    assert!(daemon.stack().called("sdp_unregister_service(0x10001)"));
    assert_eq!(
        daemon.transport().unicast(C1).last().unwrap().payload,
        vec![
            EVT_SDP_SERVICE_REGISTERED,
            5,
            StatusCode::COMMAND_DISALLOWED.value(),
            0,
            0,
            0,
            0
        ]
    );
}

#[test]
fn test_disconnect_of_foreign_channel_rejected() {
    let now = Instant::now();
    let mut daemon = daemon_with_clients(&[C1, C2], now);
    let mut params = remote_addr().to_wire().to_vec();
    params.push(3);
    daemon
        .handle_client_packet(C1, &command(OCF_RFCOMM_CREATE_CHANNEL, &params), now)
        .unwrap();

    let result =
        daemon.handle_client_packet(C2, &command(OCF_RFCOMM_DISCONNECT, &[0x41, 0x00, 0x00]), now);

    assert!(result.is_err());
    assert!(!daemon.stack().called("rfcomm_disconnect(65)"));
    let op = opcode(OGF_DAEMON, OCF_RFCOMM_DISCONNECT).to_le_bytes();
    assert_eq!(
        daemon.transport().unicast(C2).last().unwrap().payload,
        vec![
            EVT_COMMAND_STATUS,
            4,
            StatusCode::COMMAND_DISALLOWED.value(),
            1,
            op[0],
            op[1]
        ]
    );
}

#[test]
fn test_credits_retry_parked_output() {
    let now = Instant::now();
    let mut daemon = daemon_with_clients(&[C1], now);

    daemon.handle_stack_event(StackEvent::AclBuffersFreed, now);
    daemon.handle_stack_event(StackEvent::RfcommCredits { cid: 0x0041, credits: 2 }, now);

    assert_eq!(daemon.transport().retries, 2);
}

#[test]
fn test_sdp_query_busy_and_attribute_reassembly() {
    let now = Instant::now();
    let mut daemon = daemon_with_clients(&[C1, C2], now);
    let mut params = remote_addr().to_wire().to_vec();
    params.extend_from_slice(&[0x35, 0x03, 0x19, 0x11, 0x01]);
    params.extend_from_slice(&[0x35, 0x05, 0x0A, 0x00, 0x00, 0xFF, 0xFF]);
    let query = command(OCF_SDP_CLIENT_QUERY_SERVICES, &params);

    daemon.handle_client_packet(C1, &query, now).unwrap();
    assert_eq!(daemon.sdp_query_owner(), Some(C1));

    assert!(daemon.handle_client_packet(C2, &query, now).is_err());
    assert_eq!(
        daemon.transport().unicast(C2).last().unwrap().payload,
        vec![EVT_SDP_QUERY_COMPLETE, 1, StatusCode::BUSY.value()]
    );

    for (offset, byte) in [0xAAu8, 0xBB, 0xCC].iter().enumerate() {
        daemon.handle_stack_event(
            StackEvent::SdpAttributeValue {
                record_id: 1,
                attribute_id: 0x0100,
                attribute_length: 3,
                data_offset: offset as u16,
                data: *byte,
            },
            now,
        );
    }

    let value = daemon.transport().unicast(C1);
    assert_eq!(value.len(), 1);
    assert_eq!(value[0].packet_type, SDP_CLIENT_PACKET);
    assert_eq!(
        value[0].payload,
        vec![EVT_SDP_QUERY_ATTRIBUTE_VALUE, 0x01, 0x00, 0x00, 0x01, 0x03, 0x00, 0xAA, 0xBB, 0xCC]
    );

    daemon.handle_stack_event(
        StackEvent::SdpQueryComplete {
            status: StatusCode::SUCCESS,
        },
        now,
    );
    assert_eq!(
        daemon.transport().unicast(C1).last().unwrap().payload,
        vec![EVT_SDP_QUERY_COMPLETE, 1, 0x00]
    );
    assert_eq!(daemon.sdp_query_owner(), None);
}

#[test]
fn test_sdp_attribute_too_long_dropped() {
    let now = Instant::now();
    let mut daemon = daemon_with_clients(&[C1], now);
    let mut params = remote_addr().to_wire().to_vec();
    params.extend_from_slice(&[0x35, 0x03, 0x19, 0x11, 0x01]);
    daemon
        .handle_client_packet(C1, &command(OCF_SDP_CLIENT_QUERY_RFCOMM_SERVICES, &params), now)
        .unwrap();

    daemon.handle_stack_event(
        StackEvent::SdpAttributeValue {
            record_id: 1,
            attribute_id: 0x0100,
            attribute_length: 1001,
            data_offset: 1000,
            data: 0x00,
        },
        now,
    );

    assert!(daemon.transport().unicast(C1).is_empty());
}

#[test]
fn test_sdp_record_registration() {
    let now = Instant::now();
    let mut daemon = daemon_with_clients(&[C1], now);

    daemon
        .handle_client_packet(C1, &command(OCF_SDP_REGISTER_SERVICE_RECORD, &[0x35, 0x00]), now)
        .unwrap();
    assert_eq!(
        daemon.transport().unicast(C1).last().unwrap().payload,
        vec![EVT_SDP_SERVICE_REGISTERED, 5, 0x00, 0x01, 0x00, 0x01, 0x00]
    );

    daemon.stack_mut().fail_sdp_register = true;
    let result =
        daemon.handle_client_packet(C1, &command(OCF_SDP_REGISTER_SERVICE_RECORD, &[0x35, 0x00]), now);
    assert!(matches!(result, Err(DaemonError::AllocationFailed(_))));
    assert_eq!(
        daemon.transport().unicast(C1).last().unwrap().payload,
        vec![
            EVT_SDP_SERVICE_REGISTERED,
            5,
            StatusCode::MEMORY_ALLOC_FAILED.value(),
            0,
            0,
            0,
            0
        ]
    );
}

#[test]
fn test_unknown_command_reports_status() {
    let now = Instant::now();
    let mut daemon = daemon_with_clients(&[C1], now);

    let result = daemon.handle_client_packet(C1, &command(0x3FF, &[]), now);

    assert!(matches!(result, Err(DaemonError::UnknownCommand(_))));
    let op = opcode(OGF_DAEMON, 0x3FF).to_le_bytes();
    assert_eq!(
        daemon.transport().unicast(C1).last().unwrap().payload,
        vec![
            EVT_COMMAND_STATUS,
            4,
            StatusCode::UNKNOWN_HCI_COMMAND.value(),
            1,
            op[0],
            op[1]
        ]
    );
}

#[test]
fn test_truncated_command_reports_invalid_parameters() {
    let now = Instant::now();
    let mut daemon = daemon_with_clients(&[C1], now);

    let result = daemon.handle_client_packet(C1, &command(OCF_L2CAP_CREATE_CHANNEL, &[0x01, 0x02]), now);

    assert!(matches!(result, Err(DaemonError::MalformedCommand(_))));
    assert_eq!(
        daemon.transport().unicast(C1).last().unwrap().payload[2],
        StatusCode::INVALID_PARAMETERS.value()
    );
    assert!(!daemon.stack().calls.iter().any(|c| c.starts_with("l2cap_create_channel")));
}

#[test]
fn test_raw_hci_command_forwarded() {
    let now = Instant::now();
    let mut daemon = daemon_with_clients(&[C1], now);
    // HCI Reset
    let reset = Packet::new(HCI_COMMAND_DATA_PACKET, 0, vec![0x03, 0x0C, 0x00]);

    daemon.handle_client_packet(C1, &reset, now).unwrap();
    assert!(daemon.stack().called("hci(030c00)"));
    assert!(daemon.transport().unicast(C1).is_empty());

    daemon.stack_mut().fail_hci = Some(StatusCode::COMMAND_DISALLOWED);
    assert!(daemon.handle_client_packet(C1, &reset, now).is_err());
    assert_eq!(
        daemon.transport().unicast(C1).last().unwrap().payload,
        vec![EVT_COMMAND_STATUS, 4, 0x0C, 1, 0x03, 0x0C]
    );
}

#[test]
fn test_state_version_and_system_queries() {
    let now = Instant::now();
    let mut daemon = daemon_with_clients(&[C1], now);

    daemon
        .handle_client_packet(C1, &command(OCF_GET_STATE, &[]), now)
        .unwrap();
    daemon
        .handle_client_packet(C1, &command(OCF_GET_VERSION, &[]), now)
        .unwrap();
    daemon
        .handle_client_packet(C1, &command(OCF_GET_SYSTEM_BLUETOOTH_ENABLED, &[]), now)
        .unwrap();

    let replies: Vec<Vec<u8>> = daemon
        .transport()
        .unicast(C1)
        .iter()
        .map(|p| p.payload.clone())
        .collect();
    assert_eq!(
        replies,
        vec![
            vec![EVT_DAEMON_STATE, 1, ControllerState::Off as u8],
            vec![EVT_DAEMON_VERSION, 4, 0, 1, 0, 0],
            vec![EVT_SYSTEM_BLUETOOTH_ENABLED, 1, 0],
        ]
    );
}

#[test]
fn test_discoverable_merged_and_broadcast_on_change() {
    let now = Instant::now();
    let mut daemon = daemon_with_clients(&[C1, C2], now);

    daemon
        .handle_client_packet(C1, &command(OCF_SET_DISCOVERABLE, &[1]), now)
        .unwrap();
    daemon
        .handle_client_packet(C2, &command(OCF_SET_DISCOVERABLE, &[1]), now)
        .unwrap();
    assert_eq!(daemon.transport().broadcasts().len(), 1);

    daemon.client_disconnected(C1, now).unwrap();
    assert!(daemon.power().discoverable());
    assert_eq!(daemon.transport().broadcasts().len(), 1);

    daemon.client_disconnected(C2, now).unwrap();
    assert!(!daemon.power().discoverable());
    assert!(daemon.stack().called("set_discoverable(false)"));
    assert_eq!(
        daemon.transport().broadcasts().last().unwrap().payload,
        vec![EVT_DISCOVERABLE_ENABLED, 1, 0]
    );
}

#[test]
fn test_status_callback_follows_state_and_connections() {
    let now = Instant::now();
    let mut daemon = daemon_with_clients(&[C1], now);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    daemon.set_status_callback(Box::new(move |status| sink.lock().unwrap().push(status)));

    daemon.handle_stack_event(StackEvent::StateChanged(ControllerState::Working), now);
    daemon.handle_stack_event(StackEvent::ConnectionCountChanged(1), now);
    daemon.handle_stack_event(StackEvent::ConnectionCountChanged(0), now);
    daemon.handle_stack_event(StackEvent::StateChanged(ControllerState::Off), now);

    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            BluetoothStatus::On,
            BluetoothStatus::Active,
            BluetoothStatus::On,
            BluetoothStatus::Off
        ]
    );
    assert_eq!(
        daemon.transport().received(C1).first().unwrap().payload,
        vec![EVT_DAEMON_STATE, 1, ControllerState::Working as u8]
    );
}

#[test]
fn test_system_sleep_and_wake() {
    let now = Instant::now();
    let mut daemon = daemon_with_clients(&[C1], now);
    daemon
        .handle_client_packet(C1, &command(OCF_SET_POWER_MODE, &[1]), now)
        .unwrap();

    daemon.system_will_sleep();
    assert_eq!(daemon.stack().calls.last().unwrap(), "set_power(Sleep)");

    // Power requests while asleep do not wake the controller
    daemon
        .handle_client_packet(C1, &command(OCF_SET_POWER_MODE, &[1]), now)
        .unwrap();
    assert_eq!(daemon.stack().calls.last().unwrap(), "set_power(Sleep)");

    daemon.system_did_wake();
    assert_eq!(daemon.stack().calls.last().unwrap(), "set_power(On)");
}

#[test]
fn test_packets_from_unknown_client_rejected() {
    let now = Instant::now();
    let mut daemon = daemon_with_clients(&[C1], now);

    let result = daemon.handle_client_packet(C2, &command(OCF_GET_STATE, &[]), now);

    assert!(matches!(result, Err(DaemonError::UnknownClient(C2))));
    assert!(daemon.transport().sent.is_empty());
}
