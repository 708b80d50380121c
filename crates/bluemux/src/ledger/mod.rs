//! Resource ownership ledger
//!
//! Records which client owns which protocol-level resource. Exclusive kinds
//! (channels, services, SDP records) have at most one owner across all
//! clients; GATT connection handles are shared and only tracked per client.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use log::{debug, error};

use crate::error::{DaemonError, DaemonResult};
use crate::types::ClientId;


/// Kind of resource a client can own
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceKind {
    /// SDP service record handle
    SdpRecord,
    /// RFCOMM server channel
    RfcommService,
    /// RFCOMM channel identifier
    RfcommChannel,
    /// L2CAP PSM
    L2capService,
    /// L2CAP channel identifier
    L2capChannel,
    /// ACL handle used for GATT client queries
    GattConnection,
}

impl ResourceKind {
    /// All kinds, in the order they are torn down when a client leaves
    pub const ALL: [ResourceKind; 6] = [
        ResourceKind::SdpRecord,
        ResourceKind::RfcommService,
        ResourceKind::RfcommChannel,
        ResourceKind::L2capService,
        ResourceKind::L2capChannel,
        ResourceKind::GattConnection,
    ];

    /// Whether a value of this kind may be held by only one client
    pub fn is_exclusive(&self) -> bool {
        !matches!(self, ResourceKind::GattConnection)
    }

    fn index(&self) -> usize {
        match self {
            ResourceKind::SdpRecord => 0,
            ResourceKind::RfcommService => 1,
            ResourceKind::RfcommChannel => 2,
            ResourceKind::L2capService => 3,
            ResourceKind::L2capChannel => 4,
            ResourceKind::GattConnection => 5,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::SdpRecord => "SDP record",
            ResourceKind::RfcommService => "RFCOMM service",
            ResourceKind::RfcommChannel => "RFCOMM channel",
            ResourceKind::L2capService => "L2CAP service",
            ResourceKind::L2capChannel => "L2CAP channel",
            ResourceKind::GattConnection => "GATT connection",
        };
        f.write_str(name)
    }
}

/// Outcome of a successful acquire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquired {
    /// The value was newly recorded
    Inserted,
    /// The client already held the value
    AlreadyHeld,
}

/// Set of resource identifiers of one kind
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceSet {
    values: BTreeSet<u32>,
}

impl ResourceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, returns false if it was already present
    pub fn insert(&mut self, value: u32) -> bool {
        self.values.insert(value)
    }

    /// Remove a value, returns false if it was absent
    pub fn remove(&mut self, value: u32) -> bool {
        self.values.remove(&value)
    }

    pub fn contains(&self, value: u32) -> bool {
        self.values.contains(&value)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.values.iter().copied()
    }
}

/// Everything one client holds, one set per kind
#[derive(Debug, Clone, Default)]
pub struct Holdings {
    sets: [ResourceSet; 6],
}

impl Holdings {
    pub fn get(&self, kind: ResourceKind) -> &ResourceSet {
        &self.sets[kind.index()]
    }

    fn get_mut(&mut self, kind: ResourceKind) -> &mut ResourceSet {
        &mut self.sets[kind.index()]
    }

    pub fn contains(&self, kind: ResourceKind, value: u32) -> bool {
        self.get(kind).contains(value)
    }

    /// Total number of values across all kinds
    pub fn total(&self) -> usize {
        self.sets.iter().map(ResourceSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.iter().all(ResourceSet::is_empty)
    }
}

/// Per-client resource ownership with an owner index for exclusive kinds
#[derive(Debug, Default)]
pub struct ResourceLedger {
    holdings: BTreeMap<ClientId, Holdings>,
    owners: HashMap<(ResourceKind, u32), ClientId>,
}

impl ResourceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a client
    pub fn register(&mut self, client: ClientId) -> DaemonResult<()> {
        if self.holdings.contains_key(&client) {
            return Err(DaemonError::DuplicateSession(client));
        }
        self.holdings.insert(client, Holdings::default());
        Ok(())
    }

    /// Stop tracking a client. Its holdings must already be empty.
    pub fn unregister(&mut self, client: ClientId) -> DaemonResult<()> {
        let holdings = self
            .holdings
            .get(&client)
            .ok_or(DaemonError::UnknownClient(client))?;
        if !holdings.is_empty() {
            return Err(DaemonError::ResourcesOutstanding {
                client,
                count: holdings.total(),
            });
        }
        self.holdings.remove(&client);
        Ok(())
    }

    pub fn is_registered(&self, client: ClientId) -> bool {
        self.holdings.contains_key(&client)
    }

    /// Record that `client` owns `value`
    pub fn acquire(
        &mut self,
        client: ClientId,
        kind: ResourceKind,
        value: u32,
    ) -> DaemonResult<Acquired> {
        if !self.holdings.contains_key(&client) {
            return Err(DaemonError::UnknownClient(client));
        }

        if kind.is_exclusive() {
            if let Some(&owner) = self.owners.get(&(kind, value)) {
                if owner != client {
                    error!(
                        "{} refused {} 0x{:04x}: already owned by {}",
                        client, kind, value, owner
                    );
                    return Err(DaemonError::OwnershipConflict { kind, value, owner });
                }
            }
        }

        let holdings = self
            .holdings
            .get_mut(&client)
            .ok_or(DaemonError::UnknownClient(client))?;
        if !holdings.get_mut(kind).insert(value) {
            return Ok(Acquired::AlreadyHeld);
        }
        if kind.is_exclusive() {
            self.owners.insert((kind, value), client);
        }
        debug!("{} acquired {} 0x{:04x}", client, kind, value);
        Ok(Acquired::Inserted)
    }

    /// Forget that `client` owns `value`, returns whether it was held
    pub fn release(&mut self, client: ClientId, kind: ResourceKind, value: u32) -> bool {
        let removed = self
            .holdings
            .get_mut(&client)
            .map(|holdings| holdings.get_mut(kind).remove(value))
            .unwrap_or(false);
        if removed {
            if kind.is_exclusive() {
                self.owners.remove(&(kind, value));
            }
            debug!("{} released {} 0x{:04x}", client, kind, value);
        }
        removed
    }

    /// Owner of an exclusive resource
    pub fn owner_of(&self, kind: ResourceKind, value: u32) -> Option<ClientId> {
        self.owners.get(&(kind, value)).copied()
    }

    /// Every client holding `value`, for shared kinds
    pub fn holders_of(&self, kind: ResourceKind, value: u32) -> Vec<ClientId> {
        self.holdings
            .iter()
            .filter(|(_, holdings)| holdings.contains(kind, value))
            .map(|(client, _)| *client)
            .collect()
    }

    pub fn holds(&self, client: ClientId, kind: ResourceKind, value: u32) -> bool {
        self.holdings
            .get(&client)
            .map(|holdings| holdings.contains(kind, value))
            .unwrap_or(false)
    }

    pub fn holdings(&self, client: ClientId) -> Option<&Holdings> {
        self.holdings.get(&client)
    }

    /// Remove `value` from every client's set, returns the former holders
    pub fn release_everywhere(&mut self, kind: ResourceKind, value: u32) -> Vec<ClientId> {
        let mut released = Vec::new();
        for (client, holdings) in self.holdings.iter_mut() {
            if holdings.get_mut(kind).remove(value) {
                released.push(*client);
            }
        }
        if kind.is_exclusive() {
            self.owners.remove(&(kind, value));
        }
        released
    }

    /// Release everything `client` holds.
    ///
    /// `teardown` is called once per value, kind by kind in
    /// [`ResourceKind::ALL`] order, before the value is removed. The client
    /// stays registered with empty holdings. Returns the number of values
    /// released.
    pub fn release_all<F>(&mut self, client: ClientId, mut teardown: F) -> usize
    where
        F: FnMut(ResourceKind, u32),
    {
        let holdings = match self.holdings.get_mut(&client) {
            Some(holdings) => std::mem::take(holdings),
            None => return 0,
        };

        let mut count = 0;
        for kind in ResourceKind::ALL {
            for value in holdings.get(kind).iter() {
                teardown(kind, value);
                if kind.is_exclusive() {
                    self.owners.remove(&(kind, value));
                }
                count += 1;
            }
        }
        if count > 0 {
            debug!("{} released {} resources", client, count);
        }
        count
    }

    /// Registered clients in ascending id order
    pub fn clients(&self) -> impl Iterator<Item = ClientId> + '_ {
        self.holdings.keys().copied()
    }
}
