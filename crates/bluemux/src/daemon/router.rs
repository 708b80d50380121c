//! Routing of protocol-layer events to clients

use std::time::Instant;

use log::{debug, error, info, trace, warn};

use super::Daemon;
use crate::ledger::ResourceKind;
use crate::protocol::constants::{L2CAP_DATA_PACKET, RFCOMM_DATA_PACKET, SDP_ATTRIBUTE_BUFFER_SIZE};
use crate::protocol::{event, Packet};
use crate::stack::{ProtocolStack, StackEvent};
use crate::transport::ClientTransport;
use crate::types::{ClientId, ConnectionHandle, StatusCode};

impl<S: ProtocolStack, T: ClientTransport> Daemon<S, T> {
    /// Route one asynchronous event from the protocol layers
    pub fn handle_stack_event(&mut self, stack_event: StackEvent, _now: Instant) {
        trace!("Stack event {:?}", stack_event);

        match stack_event {
            StackEvent::StateChanged(state) => {
                info!("Controller state {:?}", state);
                let status = self.power.update_controller_state(state);
                self.notify_status(status);
                self.broadcast(event::state(state));
            }
            StackEvent::ConnectionCountChanged(count) => {
                debug!("{} ACL connections", count);
                let status = self.power.update_connection_count(count);
                self.notify_status(status);
            }
            StackEvent::AclBuffersFreed => self.flush_parked(),
            StackEvent::LinkDisconnected {
                status,
                handle,
                reason,
            } => self.link_disconnected(status, handle, reason),

            StackEvent::L2capChannelOpened(info) => {
                let packet = event::l2cap_channel_opened(&info);
                self.channel_opened(
                    ResourceKind::L2capChannel,
                    info.local_cid,
                    info.status,
                    packet,
                );
            }
            StackEvent::L2capChannelClosed { cid } => {
                self.channel_closed(ResourceKind::L2capChannel, cid, event::l2cap_channel_closed(cid));
            }
            StackEvent::L2capIncomingConnection {
                addr,
                handle,
                psm,
                local_cid,
                remote_cid,
            } => {
                let packet =
                    event::l2cap_incoming_connection(addr, handle, psm, local_cid, remote_cid);
                self.incoming_connection(
                    ResourceKind::L2capService,
                    psm.into(),
                    ResourceKind::L2capChannel,
                    local_cid,
                    packet,
                );
            }
            StackEvent::L2capCredits { cid, credits } => {
                self.route_to_owner(ResourceKind::L2capChannel, cid, event::l2cap_credits(cid, credits));
                self.flush_parked();
            }
            StackEvent::L2capData { cid, data } => {
                let packet = Packet::new(L2CAP_DATA_PACKET, cid, data);
                self.route_to_owner(ResourceKind::L2capChannel, cid, packet);
            }

            StackEvent::RfcommChannelOpened(info) => {
                let packet = event::rfcomm_open_complete(&info);
                self.channel_opened(ResourceKind::RfcommChannel, info.cid, info.status, packet);
            }
            StackEvent::RfcommChannelClosed { cid } => {
                self.channel_closed(
                    ResourceKind::RfcommChannel,
                    cid,
                    event::rfcomm_channel_closed(cid),
                );
            }
            StackEvent::RfcommIncomingConnection {
                addr,
                server_channel,
                cid,
            } => {
                let packet = event::rfcomm_incoming_connection(addr, server_channel, cid);
                self.incoming_connection(
                    ResourceKind::RfcommService,
                    server_channel.into(),
                    ResourceKind::RfcommChannel,
                    cid,
                    packet,
                );
            }
            StackEvent::RfcommCredits { cid, credits } => {
                self.route_to_owner(
                    ResourceKind::RfcommChannel,
                    cid,
                    event::rfcomm_credits(cid, credits),
                );
                self.flush_parked();
            }
            StackEvent::RfcommData { cid, data } => {
                let packet = Packet::new(RFCOMM_DATA_PACKET, cid, data);
                self.route_to_owner(ResourceKind::RfcommChannel, cid, packet);
            }

            StackEvent::SdpRfcommService {
                server_channel,
                name,
            } => {
                if let Some(owner) = self.sdp_query.owner {
                    self.send(owner, event::sdp_rfcomm_service(server_channel, &name));
                }
            }
            StackEvent::SdpAttributeValue {
                record_id,
                attribute_id,
                attribute_length,
                data_offset,
                data,
            } => self.sdp_attribute_byte(record_id, attribute_id, attribute_length, data_offset, data),
            StackEvent::SdpQueryComplete { status } => match self.sdp_query.owner.take() {
                Some(owner) => {
                    self.sdp_query.attribute_value.clear();
                    self.send(owner, event::sdp_query_complete(status));
                }
                None => debug!("SDP query complete without a requester"),
            },

            StackEvent::GattResult { handle, kind, body } => {
                match self.gatt.active_owner(handle) {
                    Some(owner) => self.send(owner, event::gatt_result(kind, handle, &body)),
                    None => debug!("GATT result on 0x{:04x} without an active query", handle),
                }
            }
            StackEvent::GattLongFragment {
                handle,
                kind,
                attribute_handle,
                offset,
                data,
            } => {
                if self.gatt.active_owner(handle).is_none() {
                    debug!("Long fragment on 0x{:04x} without an active query", handle);
                    return;
                }
                if let Err(err) =
                    self.gatt
                        .append_long_fragment(handle, kind, attribute_handle, offset, &data)
                {
                    debug!("Dropping long fragment on 0x{:04x}: {}", handle, err);
                }
            }
            StackEvent::GattNotification {
                handle,
                indication,
                attribute_handle,
                data,
            } => {
                if self.gatt.contains(handle) {
                    self.broadcast(event::gatt_notification(
                        indication,
                        handle,
                        attribute_handle,
                        &data,
                    ));
                } else {
                    debug!("Notification on 0x{:04x} without GATT clients", handle);
                }
            }
            StackEvent::GattQueryComplete { handle, status } => {
                self.gatt_query_complete(handle, status)
            }

            StackEvent::HciEvent(payload) => self.broadcast(Packet::event(payload)),
        }
    }

    fn link_disconnected(&mut self, status: StatusCode, handle: ConnectionHandle, reason: u8) {
        info!("Link 0x{:04x} disconnected, reason 0x{:02x}", handle, reason);
        self.gatt.teardown(handle);
        let holders = self
            .sessions
            .ledger_mut()
            .release_everywhere(ResourceKind::GattConnection, handle.into());
        if !holders.is_empty() {
            debug!("Dropped GATT handle 0x{:04x} from {} clients", handle, holders.len());
        }
        self.broadcast(event::disconnection_complete(status, handle, reason));
    }

    /// Deliver `packet` to the owner of an exclusive resource, drop it otherwise
    fn route_to_owner(&mut self, kind: ResourceKind, value: u16, packet: Packet) -> Option<ClientId> {
        match self.sessions.ledger().owner_of(kind, value.into()) {
            Some(owner) => {
                self.send(owner, packet);
                Some(owner)
            }
            None => {
                debug!("No owner for {} 0x{:04x}, dropping event", kind, value);
                None
            }
        }
    }

    fn channel_opened(&mut self, kind: ResourceKind, cid: u16, status: StatusCode, packet: Packet) {
        if let Some(owner) = self.route_to_owner(kind, cid, packet) {
            if !status.is_success() {
                debug!("{} 0x{:04x} for {} failed to open: {}", kind, cid, owner, status);
                self.sessions.ledger_mut().release(owner, kind, cid.into());
            }
        }
    }

    fn channel_closed(&mut self, kind: ResourceKind, cid: u16, packet: Packet) {
        if let Some(owner) = self.route_to_owner(kind, cid, packet) {
            self.sessions.ledger_mut().release(owner, kind, cid.into());
        }
    }

    /// Hand an incoming channel to the client owning the service it targets
    fn incoming_connection(
        &mut self,
        service_kind: ResourceKind,
        service: u32,
        channel_kind: ResourceKind,
        cid: u16,
        packet: Packet,
    ) {
        let owner = match self.sessions.ledger().owner_of(service_kind, service) {
            Some(owner) => owner,
            None => {
                warn!("Incoming connection for unregistered {} 0x{:04x}", service_kind, service);
                return;
            }
        };
        if let Err(err) = self
            .sessions
            .ledger_mut()
            .acquire(owner, channel_kind, cid.into())
        {
            warn!("Incoming {} 0x{:04x} not delivered: {}", channel_kind, cid, err);
            return;
        }
        self.send(owner, packet);
    }

    /// Accumulate one byte of an SDP attribute value, forward it once complete
    fn sdp_attribute_byte(
        &mut self,
        record_id: u16,
        attribute_id: u16,
        attribute_length: u16,
        data_offset: u16,
        data: u8,
    ) {
        let length = usize::from(attribute_length);
        let offset = usize::from(data_offset);
        if length > SDP_ATTRIBUTE_BUFFER_SIZE {
            error!(
                "SDP attribute 0x{:04x} of {} bytes exceeds {} byte buffer",
                attribute_id, length, SDP_ATTRIBUTE_BUFFER_SIZE
            );
            return;
        }
        if offset >= length {
            error!("SDP attribute byte at {} outside length {}", offset, length);
            return;
        }

        let value = &mut self.sdp_query.attribute_value;
        if offset == 0 {
            value.clear();
        }
        if value.len() < length {
            value.resize(length, 0);
        }
        value[offset] = data;

        if offset + 1 == length {
            let packet = event::sdp_attribute_value(record_id, attribute_id, &value[..length]);
            value.clear();
            match self.sdp_query.owner {
                Some(owner) => self.send(owner, packet),
                None => debug!("SDP attribute value without a requester"),
            }
        }
    }

    fn gatt_query_complete(&mut self, handle: ConnectionHandle, status: StatusCode) {
        if !self.gatt.contains(handle) {
            debug!("GATT query complete on 0x{:04x} without a helper", handle);
            return;
        }

        let owner = self.gatt.complete_active(handle);
        let long_value = self.gatt.take_long_value(handle);
        match owner {
            Some(owner) => {
                if let Some(value) = long_value {
                    self.send(
                        owner,
                        event::gatt_long_value(
                            value.kind,
                            handle,
                            value.attribute_handle,
                            0,
                            &value.data,
                        ),
                    );
                }
                self.send(owner, event::gatt_query_complete(handle, status));
            }
            None => {
                if long_value.is_some() {
                    debug!("Discarding long value on 0x{:04x} without an owner", handle);
                }
            }
        }
    }
}
