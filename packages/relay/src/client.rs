//! The controller side of the relay.

use std::sync::Arc;

use lightvm_host::{
    BestBlockCallback, BridgeError, ClientConfig, JsonRpcCallback, Result, SaveSequencer,
    TransportFactory, VmBytecode,
};
use tokio::sync::{mpsc, oneshot};

use crate::channel::{pair, ControllerEnd};
use crate::message::{ControllerMessage, WorkerConfig, WorkerMessage};
use crate::supervisor::{RelayConfig, Supervisor};
use crate::worker::run_worker;

/// A VM instance running on its own worker thread.
///
/// The worker is configured from a [`ClientConfig`]; its callbacks run on
/// the controller's runtime, and persistence requests go through a
/// [`SaveSequencer`] before reaching the configured sink. Dropping the
/// client shuts the worker down.
pub struct RelayClient {
    requests: Option<mpsc::UnboundedSender<ControllerMessage>>,
    done: Option<oneshot::Receiver<Result<()>>>,
}

/// Where the controller routes worker messages.
struct Routes {
    best_block_update: Option<BestBlockCallback>,
    json_rpc: Option<JsonRpcCallback>,
    database: Option<SaveSequencer>,
}

impl RelayClient {
    /// Start a worker thread running `bytecode` with `config`.
    ///
    /// Must be called from within a tokio runtime, which runs the message
    /// dispatcher.
    pub fn start(bytecode: VmBytecode, config: ClientConfig, relay: RelayConfig) -> Result<Self> {
        config.validate()?;
        let worker_config = WorkerConfig::from_client_config(&config).ok_or_else(|| {
            BridgeError::Config("config must include a string chain_spec".into())
        })?;
        tokio::runtime::Handle::try_current().map_err(|_| {
            BridgeError::Config("relay clients must be started within a tokio runtime".into())
        })?;

        let (controller, worker) = pair();
        controller.send(ControllerMessage::Config(worker_config))?;

        let transports: Option<Arc<dyn TransportFactory>> = config.transports.clone();
        let (done_tx, done_rx) = oneshot::channel();
        std::thread::Builder::new()
            .name("lightvm-relay-worker".into())
            .spawn(move || {
                let result = run_worker(bytecode, worker, transports);
                if let Err(err) = &result {
                    tracing::error!(error = %err, "relay worker stopped");
                }
                let _ = done_tx.send(result);
            })
            .map_err(|e| BridgeError::Internal(format!("failed to spawn worker thread: {}", e)))?;

        let routes = Routes {
            best_block_update: config.best_block_update_callback.clone(),
            json_rpc: config.json_rpc_callback.clone(),
            database: config
                .database_save_callback
                .clone()
                .map(SaveSequencer::spawn),
        };
        let ControllerEnd { tx, rx } = controller;
        tokio::spawn(dispatch(rx, routes, Supervisor::new(relay)));

        Ok(Self {
            requests: Some(tx),
            done: Some(done_rx),
        })
    }

    pub fn set_syncing_paused(&self, paused: bool) -> Result<()> {
        self.send(ControllerMessage::Pause(paused))
    }

    pub fn send_json_rpc(&self, request: impl Into<String>) -> Result<()> {
        self.send(ControllerMessage::Request(request.into()))
    }

    /// Ask the worker to shut its instance down. Further requests fail.
    pub fn shutdown(&mut self) {
        self.requests = None;
    }

    /// Wait for the worker thread to finish, returning the reason its
    /// instance terminated. A shutdown is not an error.
    ///
    /// Cancel safe: dropping the future before it completes leaves the
    /// client waitable. Returns `Ok(())` once the outcome has been taken.
    pub async fn wait(&mut self) -> Result<()> {
        let Some(done) = self.done.as_mut() else {
            return Ok(());
        };
        let result = done
            .await
            .unwrap_or_else(|_| Err(BridgeError::Internal("worker thread panicked".into())));
        self.done = None;
        result
    }

    fn send(&self, message: ControllerMessage) -> Result<()> {
        let requests = self.requests.as_ref().ok_or(BridgeError::Terminated)?;
        requests
            .send(message)
            .map_err(|_| BridgeError::Terminated)
    }
}

async fn dispatch(
    mut messages: mpsc::UnboundedReceiver<WorkerMessage>,
    routes: Routes,
    mut supervisor: Supervisor,
) {
    while let Some(message) = messages.recv().await {
        match message {
            WorkerMessage::Jsonrpc { data } => {
                if let Some(callback) = &routes.json_rpc {
                    callback(data);
                }
            }
            WorkerMessage::Database { data } => {
                if let Some(sequencer) = &routes.database {
                    drop(sequencer.submit(data));
                }
            }
            WorkerMessage::BestBlockUpdate { num } => {
                if let Some(callback) = &routes.best_block_update {
                    callback(num);
                }
            }
            WorkerMessage::SpawnVmWorker { data } => {
                if let Err(err) = supervisor.spawn(data.id, data.worker_message) {
                    tracing::error!(id = data.id, error = %err, "failed to spawn nested worker");
                }
            }
            WorkerMessage::TerminateVmWorker { data } => {
                if let Err(err) = supervisor.terminate(data.id) {
                    tracing::warn!(id = data.id, error = %err, "failed to terminate nested worker");
                }
            }
        }
    }
    supervisor.terminate_all();
    tracing::debug!("relay worker channel closed");
}
