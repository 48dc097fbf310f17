//! The message channel between a controller and one worker.
//!
//! This is the only path between the two threads. Messages are moved
//! through it by value; nothing the VM owns is shared with the controller.

use lightvm_host::{BridgeError, Result};
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;

use crate::message::{ControllerMessage, SpawnRequest, TerminateRequest, WorkerMessage};

/// Create a connected pair of channel ends.
///
/// Each end's sends arrive at the other end's `recv`.
pub fn pair() -> (ControllerEnd, WorkerEnd) {
    let (to_worker, from_controller) = mpsc::unbounded_channel();
    let (to_controller, from_worker) = mpsc::unbounded_channel();

    let controller = ControllerEnd {
        tx: to_worker,
        rx: from_worker,
    };
    let worker = WorkerEnd {
        poster: WorkerPoster { tx: to_controller },
        rx: from_controller,
    };
    (controller, worker)
}

/// The controller's side of the channel.
pub struct ControllerEnd {
    pub(crate) tx: mpsc::UnboundedSender<ControllerMessage>,
    pub(crate) rx: mpsc::UnboundedReceiver<WorkerMessage>,
}

impl ControllerEnd {
    pub fn send(&self, message: ControllerMessage) -> Result<()> {
        self.tx.send(message).map_err(|_| BridgeError::ChannelClosed)
    }

    /// Next message from the worker; `None` once the worker is gone.
    pub async fn recv(&mut self) -> Option<WorkerMessage> {
        self.rx.recv().await
    }
}

/// Posts messages to the controller. Cheap to clone into callbacks.
#[derive(Debug, Clone)]
pub struct WorkerPoster {
    tx: mpsc::UnboundedSender<WorkerMessage>,
}

impl WorkerPoster {
    pub fn post(&self, message: WorkerMessage) -> Result<()> {
        self.tx.send(message).map_err(|_| BridgeError::ChannelClosed)
    }

    /// Ask the controller to create nested worker `id` and hand it `handshake`.
    pub fn request_spawn(&self, id: u64, handshake: JsonValue) -> Result<()> {
        self.post(WorkerMessage::SpawnVmWorker {
            data: SpawnRequest {
                id,
                worker_message: handshake,
            },
        })
    }

    pub fn request_terminate(&self, id: u64) -> Result<()> {
        self.post(WorkerMessage::TerminateVmWorker {
            data: TerminateRequest { id },
        })
    }
}

/// The worker's side of the channel.
pub struct WorkerEnd {
    poster: WorkerPoster,
    rx: mpsc::UnboundedReceiver<ControllerMessage>,
}

impl WorkerEnd {
    pub fn poster(&self) -> WorkerPoster {
        self.poster.clone()
    }

    pub fn post(&self, message: WorkerMessage) -> Result<()> {
        self.poster.post(message)
    }

    /// Next message from the controller; `None` once the controller is gone.
    pub async fn recv(&mut self) -> Option<ControllerMessage> {
        self.rx.recv().await
    }
}
