//! Client transport interface

use std::cell::Cell;
use std::io;

use crate::protocol::Packet;
use crate::types::ClientId;

/// Delivers packets to connected clients
pub trait ClientTransport {
    /// Queue a packet for one client
    fn send(&mut self, client: ClientId, packet: &Packet) -> io::Result<()>;

    /// Queue a packet for every connected client
    fn broadcast(&mut self, packet: &Packet) -> io::Result<()>;

    /// Retry output parked while the controller had no buffers.
    ///
    /// Not reentrant; the daemon wraps calls in a [`FlushGuard`].
    fn retry_parked(&mut self);
}

/// Reentrancy flag for the parked-output flush
#[derive(Debug, Default)]
pub struct FlushGuard {
    busy: Cell<bool>,
}

/// Held while a flush runs, clears the flag on drop
pub struct FlushToken<'a> {
    guard: &'a FlushGuard,
}

impl FlushGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter the flush, `None` if one is already running
    pub fn enter(&self) -> Option<FlushToken<'_>> {
        if self.busy.replace(true) {
            return None;
        }
        Some(FlushToken { guard: self })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.get()
    }
}

impl Drop for FlushToken<'_> {
    fn drop(&mut self) {
        self.guard.busy.set(false);
    }
}
