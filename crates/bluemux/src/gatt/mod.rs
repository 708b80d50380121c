//! GATT client helper registry
//!
//! Tracks, per controller connection handle, which client has a GATT query in
//! flight and which clients have used the link. Long attribute reads arrive
//! in fragments and are reassembled here before the owner sees them.

mod helper;

#[cfg(test)]
mod tests;

use std::collections::HashMap;

use log::{debug, warn};

use crate::error::{DaemonError, DaemonResult};
use crate::ledger::ResourceKind;
use crate::types::{ClientId, ConnectionHandle};

pub use helper::{
    GattClientHelper, LongAttributeKind, LongValue, ReassemblyBuffer, ATT_MAX_LONG_ATTRIBUTE_SIZE,
};

/// GATT helpers keyed by connection handle
#[derive(Debug, Default)]
pub struct GattHelperRegistry {
    helpers: HashMap<ConnectionHandle, GattClientHelper>,
}

impl GattHelperRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepare a GATT request from `client` on `handle`.
    ///
    /// Fails with `NotConnected` if there is no open link, and with `Busy`
    /// if `track_active` is set while another query is in flight. On success
    /// the client is recorded as a user, and as the active owner when
    /// tracked.
    pub fn setup_request(
        &mut self,
        client: ClientId,
        handle: ConnectionHandle,
        track_active: bool,
        link_open: bool,
    ) -> DaemonResult<&mut GattClientHelper> {
        if !link_open {
            debug!("GATT request from {} on 0x{:04x}: no link", client, handle);
            return Err(DaemonError::NotConnected(handle));
        }

        let helper = self
            .helpers
            .entry(handle)
            .or_insert_with(|| GattClientHelper::new(handle));

        if track_active {
            if let Some(owner) = helper.active_owner() {
                debug!(
                    "GATT request from {} on 0x{:04x}: busy with {}",
                    client, handle, owner
                );
                return Err(DaemonError::Busy(handle));
            }
        }

        helper.add_user(client);
        if track_active {
            helper.set_active_owner(Some(client));
        }
        Ok(helper)
    }

    /// Clear the active owner, returns who it was
    pub fn complete_active(&mut self, handle: ConnectionHandle) -> Option<ClientId> {
        let helper = self.helpers.get_mut(&handle)?;
        let owner = helper.active_owner();
        helper.set_active_owner(None);
        owner
    }

    pub fn active_owner(&self, handle: ConnectionHandle) -> Option<ClientId> {
        self.helpers.get(&handle).and_then(GattClientHelper::active_owner)
    }

    /// Accumulate one fragment of a long read
    pub fn append_long_fragment(
        &mut self,
        handle: ConnectionHandle,
        kind: LongAttributeKind,
        attribute_handle: u16,
        offset: u16,
        data: &[u8],
    ) -> DaemonResult<()> {
        let helper = self
            .helpers
            .get_mut(&handle)
            .ok_or(DaemonError::UnknownResource {
                kind: ResourceKind::GattConnection,
                value: u32::from(handle),
            })?;
        helper
            .reassembly_mut()
            .append(kind, attribute_handle, usize::from(offset), data)
            .map_err(|err| {
                warn!("Dropping long attribute fragment on 0x{:04x}: {}", handle, err);
                err
            })
    }

    /// Take the reassembled long value, if any
    pub fn take_long_value(&mut self, handle: ConnectionHandle) -> Option<LongValue> {
        self.helpers
            .get_mut(&handle)
            .and_then(|helper| helper.reassembly_mut().take())
    }

    /// Remove `client` from the users of `handle`.
    ///
    /// Returns `None` without a helper, otherwise whether the client was the
    /// last user.
    pub fn release_client(&mut self, client: ClientId, handle: ConnectionHandle) -> Option<bool> {
        let helper = self.helpers.get_mut(&handle)?;
        Some(helper.remove_user(client))
    }

    /// Forget the helper for a link that went down
    pub fn teardown(&mut self, handle: ConnectionHandle) -> Option<GattClientHelper> {
        let helper = self.helpers.remove(&handle);
        if helper.is_some() {
            debug!("Removed GATT helper for 0x{:04x}", handle);
        }
        helper
    }

    pub fn get(&self, handle: ConnectionHandle) -> Option<&GattClientHelper> {
        self.helpers.get(&handle)
    }

    pub fn contains(&self, handle: ConnectionHandle) -> bool {
        self.helpers.contains_key(&handle)
    }

    pub fn len(&self) -> usize {
        self.helpers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.helpers.is_empty()
    }
}
