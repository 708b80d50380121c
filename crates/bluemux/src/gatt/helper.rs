//! Per-connection GATT client bookkeeping

use std::collections::BTreeSet;

use crate::error::{DaemonError, DaemonResult};
use crate::types::{ClientId, ConnectionHandle};

/// Largest attribute value the reassembly buffer will hold
pub const ATT_MAX_LONG_ATTRIBUTE_SIZE: usize = 512;

/// Which kind of long read a fragment belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LongAttributeKind {
    CharacteristicValue,
    Descriptor,
}

/// A fully reassembled long attribute value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LongValue {
    pub kind: LongAttributeKind,
    pub attribute_handle: u16,
    pub data: Vec<u8>,
}

/// Accumulates the fragments of a long read
#[derive(Debug, Clone)]
pub struct ReassemblyBuffer {
    kind: LongAttributeKind,
    attribute_handle: u16,
    buffer: Vec<u8>,
    length: usize,
}

impl Default for ReassemblyBuffer {
    fn default() -> Self {
        Self {
            kind: LongAttributeKind::CharacteristicValue,
            attribute_handle: 0,
            buffer: Vec::new(),
            length: 0,
        }
    }
}

impl ReassemblyBuffer {
    /// Copy `data` to `offset`. The running length becomes `offset + data.len()`.
    pub fn append(
        &mut self,
        kind: LongAttributeKind,
        attribute_handle: u16,
        offset: usize,
        data: &[u8],
    ) -> DaemonResult<()> {
        let end = offset + data.len();
        if end > ATT_MAX_LONG_ATTRIBUTE_SIZE {
            return Err(DaemonError::AttributeTooLong(end));
        }
        if self.buffer.len() < end {
            self.buffer.resize(end, 0);
        }
        self.buffer[offset..end].copy_from_slice(data);
        self.kind = kind;
        self.attribute_handle = attribute_handle;
        self.length = end;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Hand out the accumulated value and reset the length
    pub fn take(&mut self) -> Option<LongValue> {
        if self.length == 0 {
            return None;
        }
        let value = LongValue {
            kind: self.kind,
            attribute_handle: self.attribute_handle,
            data: self.buffer[..self.length].to_vec(),
        };
        self.length = 0;
        self.buffer.clear();
        Some(value)
    }
}

/// GATT client state for one controller connection
#[derive(Debug, Clone)]
pub struct GattClientHelper {
    handle: ConnectionHandle,
    active_owner: Option<ClientId>,
    users: BTreeSet<ClientId>,
    reassembly: ReassemblyBuffer,
}

impl GattClientHelper {
    pub fn new(handle: ConnectionHandle) -> Self {
        Self {
            handle,
            active_owner: None,
            users: BTreeSet::new(),
            reassembly: ReassemblyBuffer::default(),
        }
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle
    }

    /// Client whose query is in flight, if any
    pub fn active_owner(&self) -> Option<ClientId> {
        self.active_owner
    }

    pub fn users(&self) -> impl Iterator<Item = ClientId> + '_ {
        self.users.iter().copied()
    }

    pub fn has_user(&self, client: ClientId) -> bool {
        self.users.contains(&client)
    }

    pub fn reassembly(&self) -> &ReassemblyBuffer {
        &self.reassembly
    }

    pub(crate) fn add_user(&mut self, client: ClientId) {
        self.users.insert(client);
    }

    pub(crate) fn set_active_owner(&mut self, client: Option<ClientId>) {
        self.active_owner = client;
    }

    /// Drop a user, returns true if no users remain
    pub(crate) fn remove_user(&mut self, client: ClientId) -> bool {
        self.users.remove(&client);
        if self.active_owner == Some(client) {
            self.active_owner = None;
        }
        self.users.is_empty()
    }

    pub(crate) fn reassembly_mut(&mut self) -> &mut ReassemblyBuffer {
        &mut self.reassembly
    }
}
