//! The session event loop and the controller handle.
//!
//! A [`Session`] owns the wasmtime `Store` of one VM instance. It is the only
//! code that ever calls into the VM after `init`: timers and transports post
//! [`HostEvent`]s to its queue, and the session delivers them one at a time,
//! on the task that owns the instance.

use std::future::Future;

use tokio::sync::{mpsc, watch};
use tracing::Instrument;
use uuid::Uuid;
use wasmtime::{Instance, Memory, Store, TypedFunc};

use crate::connection::TransportEvent;
use crate::error::{BridgeError, Result};
use crate::host::{HostState, VmStatus};
use crate::memory;

/// Unique identifier for a VM session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Work queued for the session that owns a VM instance.
#[derive(Debug)]
pub enum HostEvent {
    /// A timer started through `start_timer` elapsed.
    TimerFinished(u32),

    /// A transport reported progress. `token` identifies the registration
    /// the transport was opened under.
    Connection {
        id: u32,
        token: u64,
        event: TransportEvent,
    },

    SetSyncingPaused(bool),

    JsonRpcRequest(String),

    /// Stop the session without a fault.
    Shutdown,
}

/// Recover the bridge error carried by a trap, if any.
pub(crate) fn vm_error(err: wasmtime::Error) -> BridgeError {
    match err.downcast_ref::<BridgeError>() {
        Some(bridge) => bridge.clone(),
        None => BridgeError::RuntimeFault(err.to_string()),
    }
}

/// The VM exports the host calls into.
pub(crate) struct VmExports {
    pub memory: Memory,
    pub alloc: TypedFunc<u32, u32>,
    pub init: TypedFunc<(u32, u32, u32, u32, u32), ()>,
    pub timer_finished: TypedFunc<u32, ()>,
    pub connection_open: TypedFunc<u32, ()>,
    pub connection_closed: TypedFunc<u32, ()>,
    pub connection_message: TypedFunc<(u32, u32, u32), ()>,
    pub set_syncing_paused: TypedFunc<u32, ()>,
    pub json_rpc_send: Option<TypedFunc<(u32, u32), ()>>,
}

impl VmExports {
    pub fn resolve(store: &mut Store<HostState>, instance: &Instance) -> Result<Self> {
        fn missing(name: &str, err: wasmtime::Error) -> BridgeError {
            BridgeError::wasm("exports", format!("{}: {}", name, err))
        }

        let memory = instance
            .get_memory(&mut *store, "memory")
            .ok_or_else(|| BridgeError::wasm("exports", "memory is not exported"))?;

        Ok(Self {
            memory,
            alloc: instance
                .get_typed_func(&mut *store, "alloc")
                .map_err(|e| missing("alloc", e))?,
            init: instance
                .get_typed_func(&mut *store, "init")
                .map_err(|e| missing("init", e))?,
            timer_finished: instance
                .get_typed_func(&mut *store, "timer_finished")
                .map_err(|e| missing("timer_finished", e))?,
            connection_open: instance
                .get_typed_func(&mut *store, "connection_open")
                .map_err(|e| missing("connection_open", e))?,
            connection_closed: instance
                .get_typed_func(&mut *store, "connection_closed")
                .map_err(|e| missing("connection_closed", e))?,
            connection_message: instance
                .get_typed_func(&mut *store, "connection_message")
                .map_err(|e| missing("connection_message", e))?,
            set_syncing_paused: instance
                .get_typed_func(&mut *store, "set_syncing_paused")
                .map_err(|e| missing("set_syncing_paused", e))?,
            json_rpc_send: instance
                .get_typed_func(&mut *store, "json_rpc_send")
                .ok(),
        })
    }
}

/// Owner of a running VM instance.
pub(crate) struct Session {
    store: Store<HostState>,
    exports: VmExports,
    events: mpsc::UnboundedReceiver<HostEvent>,
}

impl Session {
    pub fn new(
        store: Store<HostState>,
        exports: VmExports,
        events: mpsc::UnboundedReceiver<HostEvent>,
    ) -> Self {
        Self {
            store,
            exports,
            events,
        }
    }

    /// Deliver events until the instance terminates or is shut down.
    pub async fn run(mut self) -> Result<()> {
        let span = tracing::info_span!("session", id = %self.store.data().session);
        async move {
            while let Some(event) = self.events.recv().await {
                if !self.store.data().is_active() {
                    break;
                }
                match self.dispatch(event) {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(err) => {
                        self.store.data_mut().terminate(err.clone());
                        tracing::error!(error = %err, "VM instance terminated");
                        return Err(err);
                    }
                }
            }
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Deliver one event. Returns `false` once the session should stop.
    fn dispatch(&mut self, event: HostEvent) -> Result<bool> {
        match event {
            HostEvent::TimerFinished(id) => {
                self.exports
                    .timer_finished
                    .call(&mut self.store, id)
                    .map_err(vm_error)?;
            }
            HostEvent::Connection { id, token, event } => {
                if !self.store.data().connections.is_current(id, token) {
                    tracing::trace!(id, ?event, "dropping event of a closed connection");
                    return Ok(true);
                }
                self.deliver_connection_event(id, event)?;
            }
            HostEvent::SetSyncingPaused(paused) => {
                self.exports
                    .set_syncing_paused
                    .call(&mut self.store, paused as u32)
                    .map_err(vm_error)?;
            }
            HostEvent::JsonRpcRequest(request) => self.deliver_json_rpc(request)?,
            HostEvent::Shutdown => {
                tracing::info!("shutting down VM instance");
                self.store.data_mut().terminate(BridgeError::Terminated);
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn deliver_connection_event(&mut self, id: u32, event: TransportEvent) -> Result<()> {
        match event {
            TransportEvent::Open => self
                .exports
                .connection_open
                .call(&mut self.store, id)
                .map_err(vm_error),
            TransportEvent::Message(data) => {
                let (ptr, len) = memory::alloc_and_write(
                    &mut self.store,
                    &self.exports.memory,
                    &self.exports.alloc,
                    &data,
                )?;
                self.exports
                    .connection_message
                    .call(&mut self.store, (id, ptr, len))
                    .map_err(vm_error)
            }
            // The registration stays until the VM calls `connection_close`.
            TransportEvent::Closed => self
                .exports
                .connection_closed
                .call(&mut self.store, id)
                .map_err(vm_error),
        }
    }

    fn deliver_json_rpc(&mut self, request: String) -> Result<()> {
        let Some(json_rpc_send) = self.exports.json_rpc_send.clone() else {
            tracing::warn!("VM does not accept JSON-RPC requests; request dropped");
            return Ok(());
        };
        let (ptr, len) = memory::alloc_and_write(
            &mut self.store,
            &self.exports.memory,
            &self.exports.alloc,
            request.as_bytes(),
        )?;
        json_rpc_send
            .call(&mut self.store, (ptr, len))
            .map_err(vm_error)
    }
}

/// Handle to a running VM instance.
///
/// Every request is queued to the session that owns the instance; none of
/// them calls into the VM directly.
#[derive(Debug, Clone)]
pub struct Controller {
    session: SessionId,
    events: mpsc::UnboundedSender<HostEvent>,
    status: watch::Receiver<VmStatus>,
}

impl Controller {
    pub(crate) fn new(
        session: SessionId,
        events: mpsc::UnboundedSender<HostEvent>,
        status: watch::Receiver<VmStatus>,
    ) -> Self {
        Self {
            session,
            events,
            status,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session
    }

    pub fn status(&self) -> VmStatus {
        self.status.borrow().clone()
    }

    pub fn is_active(&self) -> bool {
        self.status.borrow().is_active()
    }

    /// Pause or resume chain syncing.
    ///
    /// Fails with [`BridgeError::Terminated`] once the instance has left
    /// `Active`.
    pub fn set_syncing_paused(&self, paused: bool) -> Result<()> {
        self.send(HostEvent::SetSyncingPaused(paused))
    }

    /// Hand a JSON-RPC request to the VM.
    pub fn send_json_rpc(&self, request: impl Into<String>) -> Result<()> {
        self.send(HostEvent::JsonRpcRequest(request.into()))
    }

    /// Close every connection and stop the session. No-op once terminated.
    pub fn shutdown(&self) {
        let _ = self.events.send(HostEvent::Shutdown);
    }

    /// Resolves with the terminal reason once the instance leaves `Active`.
    pub fn termination(&self) -> impl Future<Output = BridgeError> + Send + 'static {
        let mut status = self.status.clone();
        async move {
            loop {
                let current = status.borrow_and_update().clone();
                if let VmStatus::Terminated { reason } = current {
                    return reason;
                }
                if status.changed().await.is_err() {
                    // The instance is gone without publishing a reason.
                    return BridgeError::Terminated;
                }
            }
        }
    }

    fn send(&self, event: HostEvent) -> Result<()> {
        if !self.is_active() {
            return Err(BridgeError::Terminated);
        }
        self.events
            .send(event)
            .map_err(|_| BridgeError::Terminated)
    }
}
