//! Client command dispatch

use std::time::Instant;

use log::{debug, error, info, warn};

use super::Daemon;
use crate::dump::Direction;
use crate::error::{DaemonError, DaemonResult};
use crate::ledger::ResourceKind;
use crate::protocol::command::{CommandHeader, GattRequest};
use crate::protocol::constants::*;
use crate::protocol::{event, Command, Packet, ProtocolError};
use crate::stack::{ProtocolStack, StackResult};
use crate::transport::ClientTransport;
use crate::types::{ClientId, ConnectionHandle, PowerMode, StatusCode};

impl<S: ProtocolStack, T: ClientTransport> Daemon<S, T> {
    /// Handle one packet from a client.
    ///
    /// Rejections have already been reported to the client when this
    /// returns an error.
    pub fn handle_client_packet(
        &mut self,
        client: ClientId,
        packet: &Packet,
        now: Instant,
    ) -> DaemonResult<()> {
        self.record(Direction::Inbound, packet);

        if !self.sessions.contains(client) {
            warn!("Packet from unknown {}", client);
            return Err(DaemonError::UnknownClient(client));
        }

        match packet.packet_type {
            HCI_COMMAND_DATA_PACKET => self.handle_command(client, &packet.payload, now),
            L2CAP_DATA_PACKET => {
                self.send_channel_data(client, ResourceKind::L2capChannel, packet.channel, &packet.payload)
            }
            RFCOMM_DATA_PACKET => {
                self.send_channel_data(client, ResourceKind::RfcommChannel, packet.channel, &packet.payload)
            }
            other => {
                debug!("Ignoring packet type 0x{:02x} from {}", other, client);
                Ok(())
            }
        }
    }

    fn handle_command(&mut self, client: ClientId, payload: &[u8], now: Instant) -> DaemonResult<()> {
        let header = match CommandHeader::parse(payload) {
            Ok(header) => header,
            Err(err) => {
                warn!("Malformed command from {}: {}", client, err);
                return Err(err.into());
            }
        };

        if !header.is_daemon_command() {
            // Raw HCI command for the controller
            if let Err(status) = self.stack.send_hci_command(payload) {
                warn!("HCI command 0x{:04x} from {} failed: {}", header.opcode, client, status);
                self.send(client, event::command_status(status, header.opcode));
                return Err(status.into());
            }
            return Ok(());
        }

        let command = match Command::parse(payload) {
            Ok(command) => command,
            Err(ProtocolError::UnknownCommand(opcode)) => {
                error!("Command 0x{:04x} from {} not implemented", opcode, client);
                self.send(client, event::command_status(StatusCode::UNKNOWN_HCI_COMMAND, opcode));
                return Err(DaemonError::UnknownCommand(opcode));
            }
            Err(err) => {
                warn!("Malformed command from {}: {}", client, err);
                self.send(client, event::command_status(StatusCode::INVALID_PARAMETERS, header.opcode));
                return Err(err.into());
            }
        };

        debug!("{} -> {:?}", client, command);
        self.execute(client, header.opcode, command, now)
    }

    fn execute(
        &mut self,
        client: ClientId,
        opcode: u16,
        command: Command,
        now: Instant,
    ) -> DaemonResult<()> {
        match command {
            Command::GetState => {
                let state = self.power.controller_state();
                self.send(client, event::state(state));
                Ok(())
            }
            Command::SetPowerMode(mode) => {
                info!("{} requests power {}", client, mode);
                self.sessions.set_power_mode(client, mode)?;
                self.reevaluate_power(now);
                Ok(())
            }
            Command::GetVersion => {
                self.send(client, event::version());
                Ok(())
            }
            Command::GetSystemBluetoothEnabled | Command::SetSystemBluetoothEnabled(_) => {
                self.send(client, event::system_bluetooth_enabled(false));
                Ok(())
            }
            Command::SetDiscoverable(discoverable) => {
                info!("{} requests discoverable {}", client, discoverable);
                self.sessions.set_discoverable(client, discoverable)?;
                self.push_discoverable();
                Ok(())
            }
            Command::SetBluetoothEnabled(enabled) => {
                info!("{} sets bluetooth enabled {}", client, enabled);
                self.power.set_global_enable(enabled);
                if enabled {
                    self.set_controller_power(PowerMode::On);
                } else {
                    self.clear_all_power_requests(now);
                    self.set_controller_power(PowerMode::Off);
                }
                Ok(())
            }

            Command::L2capCreateChannel { addr, psm, mtu } => {
                let result = self.stack.l2cap_create_channel(addr, psm, mtu);
                self.created_channel(
                    client,
                    ResourceKind::L2capChannel,
                    result,
                    |stack, cid| stack.l2cap_disconnect(cid, 0),
                    |status| event::l2cap_open_failed(addr, psm, status),
                )
            }
            Command::L2capDisconnect { cid, reason } => {
                self.owned_call(client, opcode, ResourceKind::L2capChannel, cid.into(), false, |stack| {
                    stack.l2cap_disconnect(cid, reason)
                })
            }
            Command::L2capRegisterService { psm, mtu } => {
                let status = if self.claimed_by_other(client, ResourceKind::L2capService, psm.into()) {
                    StatusCode::SERVICE_ALREADY_REGISTERED
                } else {
                    self.register_service(client, ResourceKind::L2capService, psm.into(), |stack| {
                        stack.l2cap_register_service(psm, mtu)
                    })
                };
                self.send(client, event::l2cap_service_registered(status, psm));
                status_result(status)
            }
            Command::L2capUnregisterService { psm } => {
                self.owned_call(client, opcode, ResourceKind::L2capService, psm.into(), true, |stack| {
                    stack.l2cap_unregister_service(psm)
                })
            }
            Command::L2capAcceptConnection { cid } => {
                self.owned_call(client, opcode, ResourceKind::L2capChannel, cid.into(), false, |stack| {
                    stack.l2cap_accept_connection(cid)
                })
            }
            Command::L2capDeclineConnection { cid, reason } => {
                self.owned_call(client, opcode, ResourceKind::L2capChannel, cid.into(), true, |stack| {
                    stack.l2cap_decline_connection(cid, reason)
                })
            }

            Command::SdpRegisterServiceRecord { record } => {
                match self.stack.sdp_register_service(&record) {
                    Ok(handle) => {
                        if let Err(err) = self.sessions.ledger_mut().acquire(
                            client,
                            ResourceKind::SdpRecord,
                            handle,
                        ) {
                            if let Err(status) = self.stack.sdp_unregister_service(handle) {
                                warn!("Cannot withdraw SDP record 0x{:08x}: {}", handle, status);
                            }
                            self.send(client, event::sdp_service_registered(err.status(), 0));
                            return Err(err);
                        }
                        info!("{} registered SDP record 0x{:08x}", client, handle);
                        self.send(client, event::sdp_service_registered(StatusCode::SUCCESS, handle));
                        Ok(())
                    }
                    Err(status) => {
                        warn!("SDP record registration for {} failed: {}", client, status);
                        self.send(
                            client,
                            event::sdp_service_registered(StatusCode::MEMORY_ALLOC_FAILED, 0),
                        );
                        Err(DaemonError::AllocationFailed(format!(
                            "SDP service record ({})",
                            status
                        )))
                    }
                }
            }
            Command::SdpUnregisterServiceRecord { handle } => {
                self.owned_call(client, opcode, ResourceKind::SdpRecord, handle, true, |stack| {
                    stack.sdp_unregister_service(handle)
                })
            }
            Command::SdpQueryRfcommServices {
                addr,
                search_pattern,
            } => self.start_sdp_query(client, |stack| {
                stack.sdp_query_rfcomm_services(addr, &search_pattern)
            }),
            Command::SdpQueryServices {
                addr,
                search_pattern,
                attribute_ids,
            } => self.start_sdp_query(client, |stack| {
                stack.sdp_query_services(addr, &search_pattern, &attribute_ids)
            }),

            Command::RfcommCreateChannel {
                addr,
                server_channel,
                initial_credits,
            } => {
                let result = self
                    .stack
                    .rfcomm_create_channel(addr, server_channel, initial_credits);
                self.created_channel(
                    client,
                    ResourceKind::RfcommChannel,
                    result,
                    |stack, cid| stack.rfcomm_disconnect(cid),
                    |status| event::rfcomm_open_failed(addr, server_channel, status),
                )
            }
            Command::RfcommDisconnect { cid, .. } => {
                self.owned_call(client, opcode, ResourceKind::RfcommChannel, cid.into(), false, |stack| {
                    stack.rfcomm_disconnect(cid)
                })
            }
            Command::RfcommRegisterService {
                server_channel,
                mtu,
                initial_credits,
            } => {
                let kind = ResourceKind::RfcommService;
                let status = if self.claimed_by_other(client, kind, server_channel.into()) {
                    StatusCode::RFCOMM_CHANNEL_ALREADY_REGISTERED
                } else {
                    self.register_service(client, kind, server_channel.into(), |stack| {
                        stack.rfcomm_register_service(server_channel, mtu, initial_credits)
                    })
                };
                self.send(client, event::rfcomm_service_registered(status, server_channel));
                status_result(status)
            }
            Command::RfcommUnregisterService { server_channel } => self.owned_call(
                client,
                opcode,
                ResourceKind::RfcommService,
                server_channel.into(),
                true,
                |stack| stack.rfcomm_unregister_service(server_channel),
            ),
            Command::RfcommAcceptConnection { cid } => {
                self.owned_call(client, opcode, ResourceKind::RfcommChannel, cid.into(), false, |stack| {
                    stack.rfcomm_accept_connection(cid)
                })
            }
            Command::RfcommDeclineConnection { cid, .. } => {
                self.owned_call(client, opcode, ResourceKind::RfcommChannel, cid.into(), true, |stack| {
                    stack.rfcomm_decline_connection(cid)
                })
            }
            Command::RfcommPersistentChannel { service_name } => {
                let (status, channel) = match self.stack.rfcomm_persistent_channel(&service_name) {
                    Ok(channel) => (StatusCode::SUCCESS, channel),
                    Err(status) => (status, 0),
                };
                info!("Persistent channel for {:?}: {}", service_name, channel);
                self.send(client, event::rfcomm_persistent_channel(status, channel));
                status_result(status)
            }
            Command::RfcommGrantCredits { cid, credits } => {
                self.owned_call(client, opcode, ResourceKind::RfcommChannel, cid.into(), false, |stack| {
                    stack.rfcomm_grant_credits(cid, credits)
                })
            }

            Command::GapDisconnect { handle } => {
                self.reported_call(client, opcode, |stack| stack.disconnect(handle))
            }
            Command::LeScanStart => self.reported_call(client, opcode, |stack| stack.le_scan(true)),
            Command::LeScanStop => self.reported_call(client, opcode, |stack| stack.le_scan(false)),
            Command::LeSetScanParameters {
                scan_type,
                interval,
                window,
            } => self.reported_call(client, opcode, |stack| {
                stack.le_set_scan_parameters(scan_type, interval, window)
            }),
            Command::LeConnect { addr_type, addr } => {
                self.reported_call(client, opcode, |stack| stack.le_connect(addr_type, addr))
            }
            Command::LeConnectCancel => {
                self.reported_call(client, opcode, |stack| stack.le_connect_cancel())
            }

            Command::Gatt { handle, request } => self.gatt_request(client, handle, request),
            Command::GattGetMtu { handle } => {
                match self.stack.gatt_mtu(handle) {
                    Ok(mtu) => {
                        self.send(client, event::gatt_mtu(handle, mtu));
                        Ok(())
                    }
                    Err(status) => {
                        self.send(client, event::gatt_query_complete(handle, status));
                        Err(status.into())
                    }
                }
            }
        }
    }

    /// Forward channel data if the client owns the channel
    fn send_channel_data(
        &mut self,
        client: ClientId,
        kind: ResourceKind,
        cid: u16,
        data: &[u8],
    ) -> DaemonResult<()> {
        self.check_owner(client, kind, cid.into())?;
        let result = match kind {
            ResourceKind::RfcommChannel => self.stack.rfcomm_send(cid, data),
            _ => self.stack.l2cap_send(cid, data),
        };
        result.map_err(|status| {
            debug!("Send on {} 0x{:04x} failed: {}", kind, cid, status);
            DaemonError::from(status)
        })
    }

    /// Fail unless `client` owns the exclusive resource
    fn check_owner(&self, client: ClientId, kind: ResourceKind, value: u32) -> DaemonResult<()> {
        match self.sessions.ledger().owner_of(kind, value) {
            Some(owner) if owner == client => Ok(()),
            Some(owner) => {
                warn!("{} tried to use {} 0x{:04x} owned by {}", client, kind, value, owner);
                Err(DaemonError::OwnershipConflict { kind, value, owner })
            }
            None => {
                warn!("{} tried to use unknown {} 0x{:04x}", client, kind, value);
                Err(DaemonError::UnknownResource { kind, value })
            }
        }
    }

    fn claimed_by_other(&self, client: ClientId, kind: ResourceKind, value: u32) -> bool {
        matches!(self.sessions.ledger().owner_of(kind, value), Some(owner) if owner != client)
    }

    /// Engine call on a resource the client must own.
    ///
    /// With `release` the resource is forgotten once ownership is confirmed,
    /// whatever the engine answers. Failures are reported with a command
    /// status event.
    fn owned_call<F>(
        &mut self,
        client: ClientId,
        opcode: u16,
        kind: ResourceKind,
        value: u32,
        release: bool,
        call: F,
    ) -> DaemonResult<()>
    where
        F: FnOnce(&mut S) -> StackResult<()>,
    {
        if let Err(err) = self.check_owner(client, kind, value) {
            self.send(client, event::command_status(err.status(), opcode));
            return Err(err);
        }
        if release {
            self.sessions.ledger_mut().release(client, kind, value);
        }
        self.reported_call(client, opcode, call)
    }

    /// Engine call whose failure is reported with a command status event
    fn reported_call<F>(&mut self, client: ClientId, opcode: u16, call: F) -> DaemonResult<()>
    where
        F: FnOnce(&mut S) -> StackResult<()>,
    {
        if let Err(status) = call(&mut self.stack) {
            debug!("Command 0x{:04x} from {} failed: {}", opcode, client, status);
            self.send(client, event::command_status(status, opcode));
            return Err(status.into());
        }
        Ok(())
    }

    /// Register a service with the engine and record ownership on success
    fn register_service<F>(
        &mut self,
        client: ClientId,
        kind: ResourceKind,
        value: u32,
        call: F,
    ) -> StatusCode
    where
        F: FnOnce(&mut S) -> StackResult<()>,
    {
        match call(&mut self.stack) {
            Ok(()) => match self.sessions.ledger_mut().acquire(client, kind, value) {
                Ok(_) => {
                    info!("{} registered {} 0x{:04x}", client, kind, value);
                    StatusCode::SUCCESS
                }
                Err(err) => err.status(),
            },
            Err(status) => {
                debug!("{} 0x{:04x} registration failed: {}", kind, value, status);
                status
            }
        }
    }

    /// Record a channel created by the engine, or report the failure
    fn created_channel<U, F>(
        &mut self,
        client: ClientId,
        kind: ResourceKind,
        result: StackResult<u16>,
        undo: U,
        open_failed: F,
    ) -> DaemonResult<()>
    where
        U: FnOnce(&mut S, u16) -> StackResult<()>,
        F: FnOnce(StatusCode) -> Packet,
    {
        match result {
            Ok(cid) => {
                if let Err(err) = self.sessions.ledger_mut().acquire(client, kind, cid.into()) {
                    if let Err(status) = undo(&mut self.stack, cid) {
                        warn!("Cannot close unowned {} 0x{:04x}: {}", kind, cid, status);
                    }
                    self.send(client, open_failed(err.status()));
                    return Err(err);
                }
                debug!("{} creating {} 0x{:04x}", client, kind, cid);
                Ok(())
            }
            Err(status) => {
                debug!("{} create failed for {}: {}", kind, client, status);
                self.send(client, open_failed(status));
                Err(status.into())
            }
        }
    }

    fn start_sdp_query<F>(&mut self, client: ClientId, call: F) -> DaemonResult<()>
    where
        F: FnOnce(&mut S) -> StackResult<()>,
    {
        if let Some(owner) = self.sdp_query.owner {
            if owner != client {
                debug!("SDP query from {} while {} is querying", client, owner);
                self.send(client, event::sdp_query_complete(StatusCode::BUSY));
                return Err(DaemonError::Stack(StatusCode::BUSY));
            }
        }

        self.sdp_query.owner = Some(client);
        self.sdp_query.attribute_value.clear();
        if let Err(status) = call(&mut self.stack) {
            self.sdp_query.owner = None;
            self.send(client, event::sdp_query_complete(status));
            return Err(status.into());
        }
        Ok(())
    }

    fn gatt_request(
        &mut self,
        client: ClientId,
        handle: ConnectionHandle,
        request: GattRequest,
    ) -> DaemonResult<()> {
        let track_active = request.tracks_active();
        let link_open = self.stack.is_link_open(handle);

        if let Err(err) = self
            .gatt
            .setup_request(client, handle, track_active, link_open)
        {
            self.send(client, event::gatt_query_complete(handle, err.status()));
            return Err(err);
        }
        self.sessions
            .ledger_mut()
            .acquire(client, ResourceKind::GattConnection, handle.into())?;

        if let Err(status) = self.stack.gatt_request(handle, &request) {
            debug!("GATT request from {} on 0x{:04x} failed: {}", client, handle, status);
            if track_active {
                self.gatt.complete_active(handle);
            }
            self.send(client, event::gatt_query_complete(handle, status));
            return Err(status.into());
        }
        Ok(())
    }
}

fn status_result(status: StatusCode) -> DaemonResult<()> {
    if status.is_success() {
        Ok(())
    } else {
        Err(DaemonError::Stack(status))
    }
}
