//! The daemon core
//!
//! [`Daemon`] owns all shared state: client sessions and their resources,
//! GATT helpers, the power arbiter and the SDP query owner. It is driven from
//! one event loop through four entry points:
//!
//! - [`Daemon::client_connected`] / [`Daemon::client_disconnected`]
//! - [`Daemon::handle_client_packet`] for commands and data from a client
//! - [`Daemon::handle_stack_event`] for asynchronous protocol output
//! - [`Daemon::on_idle_timer`] when the idle deadline passes
//!
//! Every entry point runs to completion before the next one starts, so no
//! locking is needed.

mod dispatch;
mod router;

#[cfg(test)]
mod tests;

use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::dump::{Direction, PacketDump};
use crate::error::{DaemonError, DaemonResult};
use crate::gatt::GattHelperRegistry;
use crate::ledger::ResourceKind;
use crate::power::{BluetoothStatus, IdleOutcome, PowerAction, PowerArbiter};
use crate::protocol::{event, Packet};
use crate::session::SessionTable;
use crate::stack::{ProtocolStack, StackResult};
use crate::transport::{ClientTransport, FlushGuard};
use crate::types::{ClientId, PowerMode};

/// Receives OFF / ON / ACTIVE whenever the controller status changes
pub type StatusCallback = Box<dyn FnMut(BluetoothStatus) + Send>;

/// Client running the current SDP query and the attribute value being reassembled
#[derive(Debug, Default)]
struct SdpQueryState {
    owner: Option<ClientId>,
    attribute_value: Vec<u8>,
}

pub struct Daemon<S: ProtocolStack, T: ClientTransport> {
    stack: S,
    transport: T,
    sessions: SessionTable,
    gatt: GattHelperRegistry,
    power: PowerArbiter,
    sdp_query: SdpQueryState,
    flush_guard: FlushGuard,
    dump: Option<Box<dyn PacketDump + Send>>,
    status_callback: Option<StatusCallback>,
}

impl<S: ProtocolStack, T: ClientTransport> Daemon<S, T> {
    pub fn new(stack: S, transport: T, idle_timeout: Duration) -> Self {
        Self {
            stack,
            transport,
            sessions: SessionTable::new(),
            gatt: GattHelperRegistry::new(),
            power: PowerArbiter::new(idle_timeout),
            sdp_query: SdpQueryState::default(),
            flush_guard: FlushGuard::new(),
            dump: None,
            status_callback: None,
        }
    }

    /// Record every packet exchanged with clients
    pub fn set_packet_dump(&mut self, dump: Box<dyn PacketDump + Send>) {
        self.dump = Some(dump);
    }

    pub fn set_status_callback(&mut self, callback: StatusCallback) {
        self.status_callback = Some(callback);
    }

    /// A client connected
    pub fn client_connected(&mut self, client: ClientId, now: Instant) -> DaemonResult<()> {
        self.sessions.open(client)?;
        self.reevaluate_power(now);
        Ok(())
    }

    /// A client went away: release everything it held.
    ///
    /// Teardown is best effort; engine failures are logged and the resources
    /// are forgotten regardless.
    pub fn client_disconnected(&mut self, client: ClientId, now: Instant) -> DaemonResult<()> {
        if !self.sessions.contains(client) {
            return Err(DaemonError::UnknownClient(client));
        }

        let stack = &mut self.stack;
        let gatt = &mut self.gatt;
        let released = self
            .sessions
            .ledger_mut()
            .release_all(client, |kind, value| {
                teardown_resource(&mut *stack, &mut *gatt, client, kind, value)
            });
        if released > 0 {
            info!("Released {} resources held by {}", released, client);
        }

        if self.sdp_query.owner == Some(client) {
            self.sdp_query.owner = None;
        }

        self.sessions.close(client)?;

        if self.sessions.is_empty() {
            debug!("Last client left, disconnecting all links");
            if let Err(status) = self.stack.disconnect_all() {
                warn!("Failed to disconnect links: {}", status);
            }
        }

        self.push_discoverable();
        self.reevaluate_power(now);
        Ok(())
    }

    /// Called when the idle deadline may have passed
    pub fn on_idle_timer(&mut self, now: Instant) -> IdleOutcome {
        let outcome = self.power.on_timer(self.sessions.any_power_on(), now);
        if outcome == IdleOutcome::PowerOff {
            self.set_controller_power(PowerMode::Off);
        }
        outcome
    }

    /// The host is about to sleep
    pub fn system_will_sleep(&mut self) {
        info!("System going to sleep");
        self.power.system_will_sleep();
        self.set_controller_power(PowerMode::Sleep);
    }

    /// The host woke up
    pub fn system_did_wake(&mut self) {
        info!("System woke up");
        if self.power.system_did_wake(self.sessions.any_power_on()) {
            self.set_controller_power(PowerMode::On);
        }
    }

    /// Power the controller down before exit
    pub fn shutdown(&mut self) {
        info!("Shutting down, powering controller off");
        self.set_controller_power(PowerMode::Off);
        if let Some(dump) = self.dump.as_mut() {
            if let Err(err) = dump.flush() {
                warn!("Failed to flush packet dump: {}", err);
            }
        }
    }

    /// Deadline of the armed idle timer
    pub fn idle_deadline(&self) -> Option<Instant> {
        self.power.idle_deadline()
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn gatt(&self) -> &GattHelperRegistry {
        &self.gatt
    }

    pub fn power(&self) -> &PowerArbiter {
        &self.power
    }

    pub fn sdp_query_owner(&self) -> Option<ClientId> {
        self.sdp_query.owner
    }

    pub fn stack(&self) -> &S {
        &self.stack
    }

    pub fn stack_mut(&mut self) -> &mut S {
        &mut self.stack
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    fn record(&mut self, direction: Direction, packet: &Packet) {
        if let Some(dump) = self.dump.as_mut() {
            if let Err(err) = dump.record(direction, packet) {
                warn!("Packet dump failed: {}", err);
            }
        }
    }

    /// Send a packet to one client
    fn send(&mut self, client: ClientId, packet: Packet) {
        self.record(Direction::Outbound, &packet);
        if let Err(err) = self.transport.send(client, &packet) {
            warn!("Failed to send to {}: {}", client, err);
        }
    }

    /// Send a packet to every client
    fn broadcast(&mut self, packet: Packet) {
        self.record(Direction::Outbound, &packet);
        if let Err(err) = self.transport.broadcast(&packet) {
            warn!("Failed to broadcast: {}", err);
        }
    }

    /// Flush parked output unless a flush is already running
    fn flush_parked(&mut self) {
        let _token = match self.flush_guard.enter() {
            Some(token) => token,
            None => {
                debug!("Parked output flush already running");
                return;
            }
        };
        self.transport.retry_parked();
    }

    fn set_controller_power(&mut self, mode: PowerMode) {
        debug!("Controller power {}", mode);
        if let Err(status) = self.stack.set_power(mode) {
            error!("Failed to set controller power {}: {}", mode, status);
        }
    }

    /// Re-merge the clients' power requests
    fn reevaluate_power(&mut self, now: Instant) {
        match self.power.evaluate(self.sessions.any_power_on(), now) {
            PowerAction::PowerOn => self.set_controller_power(PowerMode::On),
            PowerAction::ArmedIdleTimer | PowerAction::None => {}
        }
    }

    /// Every session OFF, then re-evaluate
    fn clear_all_power_requests(&mut self, now: Instant) {
        self.sessions.clear_power_requests();
        self.reevaluate_power(now);
    }

    /// Push the merged discoverability to the controller
    fn push_discoverable(&mut self) {
        let discoverable = self.sessions.any_discoverable();
        if let Err(status) = self.stack.set_discoverable(discoverable) {
            warn!("Failed to set discoverable {}: {}", discoverable, status);
            return;
        }
        if discoverable != self.power.discoverable() {
            self.power.set_discoverable(discoverable);
            self.broadcast(event::discoverable_enabled(discoverable));
        }
    }

    fn notify_status(&mut self, status: BluetoothStatus) {
        debug!("Bluetooth status {}", status);
        if let Some(callback) = self.status_callback.as_mut() {
            callback(status);
        }
    }
}

/// Engine call undoing one resource of a departing client
fn teardown_resource<S: ProtocolStack>(
    stack: &mut S,
    gatt: &mut GattHelperRegistry,
    client: ClientId,
    kind: ResourceKind,
    value: u32,
) {
    // Values were recorded from the engine's own 8/16-bit identifiers
    let result: StackResult<()> = match kind {
        ResourceKind::SdpRecord => stack.sdp_unregister_service(value),
        ResourceKind::RfcommService => stack.rfcomm_unregister_service(value as u8),
        ResourceKind::RfcommChannel => stack.rfcomm_disconnect(value as u16),
        ResourceKind::L2capService => stack.l2cap_unregister_service(value as u16),
        ResourceKind::L2capChannel => stack.l2cap_disconnect(value as u16, 0),
        ResourceKind::GattConnection => {
            let handle = value as u16;
            match gatt.release_client(client, handle) {
                Some(true) => {
                    debug!("{} was the last GATT user of 0x{:04x}", client, handle);
                    stack.disconnect(handle)
                }
                _ => Ok(()),
            }
        }
    };
    if let Err(status) = result {
        warn!(
            "Teardown of {} 0x{:04x} for {} failed: {}",
            kind, value, client, status
        );
    }
}
