//! Connection multiplexer.
//!
//! The VM picks an integer id for each connection it wants to open. The
//! multiplexer maps those ids to [`Transport`]s and relays transport events
//! back into the session's event loop, from where they reach the VM through
//! its `connection_open`, `connection_closed` and `connection_message`
//! exports.

mod address;
mod network;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::{BridgeError, ConnectionError, Result};
use crate::session::HostEvent;

pub use address::{parse_address, ConnectTarget};
pub use network::NetworkTransports;

/// A connection to a remote peer, owned by the multiplexer.
///
/// Events (open, message, close) flow the other way, through the
/// [`TransportEvents`] handed to the factory when the transport is opened.
pub trait Transport: Send {
    /// Queue bytes for sending. Silently dropped if the transport is closed.
    fn send(&mut self, data: Vec<u8>);

    /// Tear the transport down. No event is reported afterwards.
    fn close(&mut self);
}

/// Creates transports for connection targets.
pub trait TransportFactory: Send + Sync {
    /// Start opening a transport to `target`.
    ///
    /// Must not block: connection progress is reported through `events`.
    fn open(
        &self,
        target: &ConnectTarget,
        events: TransportEvents,
    ) -> std::result::Result<Box<dyn Transport>, ConnectionError>;
}

/// Something a transport reports about its connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Open,
    Message(Vec<u8>),
    Closed,
}

/// Reports events for one registered transport back to its session.
#[derive(Debug, Clone)]
pub struct TransportEvents {
    id: u32,
    token: u64,
    tx: mpsc::UnboundedSender<HostEvent>,
}

impl TransportEvents {
    pub(crate) fn new(id: u32, token: u64, tx: mpsc::UnboundedSender<HostEvent>) -> Self {
        Self { id, token, tx }
    }

    /// The VM-chosen connection id.
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn open(&self) {
        self.emit(TransportEvent::Open);
    }

    pub fn message(&self, data: Vec<u8>) {
        self.emit(TransportEvent::Message(data));
    }

    pub fn closed(&self) {
        self.emit(TransportEvent::Closed);
    }

    fn emit(&self, event: TransportEvent) {
        // The session is gone once the receiver is dropped; nothing to deliver to.
        let _ = self.tx.send(HostEvent::Connection {
            id: self.id,
            token: self.token,
            event,
        });
    }
}

struct Registered {
    token: u64,
    transport: Box<dyn Transport>,
}

/// Map from VM connection ids to open transports.
pub struct ConnectionTable {
    factory: Arc<dyn TransportFactory>,
    entries: HashMap<u32, Registered>,
    next_token: u64,
}

impl ConnectionTable {
    pub fn new(factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            factory,
            entries: HashMap::new(),
            next_token: 0,
        }
    }

    /// Open a transport for `addr` and register it under `id`.
    ///
    /// Unsupported addresses and unavailable transports are reported as a
    /// [`ConnectionError`] and leave the table untouched. Re-using an id that
    /// is still registered is a protocol violation.
    pub fn open(
        &mut self,
        id: u32,
        addr: &str,
        events: &mpsc::UnboundedSender<HostEvent>,
    ) -> Result<()> {
        if self.entries.contains_key(&id) {
            return Err(BridgeError::Internal(format!(
                "connection {} already allocated",
                id
            )));
        }

        let target = parse_address(addr)?;
        let token = self.next_token;
        let transport = self
            .factory
            .open(&target, TransportEvents::new(id, token, events.clone()))?;
        self.next_token += 1;

        tracing::debug!(id, target = %target, kind = target.kind(), "connection opened");
        self.entries.insert(id, Registered { token, transport });
        Ok(())
    }

    /// Close and unregister the transport for `id`.
    pub fn close(&mut self, id: u32) -> Result<()> {
        let mut entry = self.entries.remove(&id).ok_or_else(|| {
            BridgeError::Internal(format!("close of unknown connection {}", id))
        })?;
        entry.transport.close();
        tracing::debug!(id, "connection closed by VM");
        Ok(())
    }

    /// Queue bytes on the transport for `id`.
    pub fn send(&mut self, id: u32, data: Vec<u8>) -> Result<()> {
        let entry = self.entries.get_mut(&id).ok_or_else(|| {
            BridgeError::Internal(format!("send on unknown connection {}", id))
        })?;
        entry.transport.send(data);
        Ok(())
    }

    /// Whether an event stamped with `token` still belongs to the transport
    /// registered under `id`.
    pub fn is_current(&self, id: u32, token: u64) -> bool {
        self.entries
            .get(&id)
            .map(|entry| entry.token == token)
            .unwrap_or(false)
    }

    /// Close every transport.
    pub fn close_all(&mut self) {
        for (_, mut entry) in self.entries.drain() {
            entry.transport.close();
        }
    }

    pub fn contains(&self, id: u32) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
