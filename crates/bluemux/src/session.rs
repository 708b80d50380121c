//! Client session table
//!
//! One session per connected client: the power mode and discoverability it
//! asked for, plus its entry in the resource ledger.

use std::collections::BTreeMap;

use log::info;

use crate::error::{DaemonError, DaemonResult};
use crate::ledger::ResourceLedger;
use crate::types::{ClientId, PowerMode};

/// Per-client request state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSession {
    pub id: ClientId,
    pub power_mode: PowerMode,
    pub discoverable: bool,
}

impl ClientSession {
    pub fn new(id: ClientId) -> Self {
        Self {
            id,
            power_mode: PowerMode::Off,
            discoverable: false,
        }
    }
}

/// All live sessions and the ledger of what they own
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: BTreeMap<ClientId, ClientSession>,
    ledger: ResourceLedger,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the session for a newly connected client
    pub fn open(&mut self, id: ClientId) -> DaemonResult<()> {
        if self.sessions.contains_key(&id) {
            return Err(DaemonError::DuplicateSession(id));
        }
        self.ledger.register(id)?;
        self.sessions.insert(id, ClientSession::new(id));
        info!("{} connected ({} sessions)", id, self.sessions.len());
        Ok(())
    }

    /// Remove a session. Its resources must have been released first.
    pub fn close(&mut self, id: ClientId) -> DaemonResult<ClientSession> {
        if !self.sessions.contains_key(&id) {
            return Err(DaemonError::UnknownClient(id));
        }
        self.ledger.unregister(id)?;
        let session = self
            .sessions
            .remove(&id)
            .ok_or(DaemonError::UnknownClient(id))?;
        info!("{} disconnected ({} sessions)", id, self.sessions.len());
        Ok(session)
    }

    pub fn get(&self, id: ClientId) -> Option<&ClientSession> {
        self.sessions.get(&id)
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.sessions.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn ids(&self) -> Vec<ClientId> {
        self.sessions.keys().copied().collect()
    }

    pub fn set_power_mode(&mut self, id: ClientId, mode: PowerMode) -> DaemonResult<()> {
        let session = self
            .sessions
            .get_mut(&id)
            .ok_or(DaemonError::UnknownClient(id))?;
        session.power_mode = mode;
        Ok(())
    }

    pub fn set_discoverable(&mut self, id: ClientId, discoverable: bool) -> DaemonResult<()> {
        let session = self
            .sessions
            .get_mut(&id)
            .ok_or(DaemonError::UnknownClient(id))?;
        session.discoverable = discoverable;
        Ok(())
    }

    /// Whether any session asked for the controller to be on
    pub fn any_power_on(&self) -> bool {
        self.sessions
            .values()
            .any(|session| session.power_mode == PowerMode::On)
    }

    /// Whether any session asked for discoverability
    pub fn any_discoverable(&self) -> bool {
        self.sessions.values().any(|session| session.discoverable)
    }

    /// Reset every session's power request to off
    pub fn clear_power_requests(&mut self) {
        for session in self.sessions.values_mut() {
            session.power_mode = PowerMode::Off;
        }
    }

    pub fn ledger(&self) -> &ResourceLedger {
        &self.ledger
    }

    pub fn ledger_mut(&mut self) -> &mut ResourceLedger {
        &mut self.ledger
    }
}
