//! The worker side of the relay.
//!
//! A worker owns one VM instance. It runs its own single-threaded tokio
//! runtime so that the instance, its timers and its transports all live on
//! the worker thread.

use std::sync::Arc;

use lightvm_host::{BridgeError, ClientConfig, DatabaseSave, Result, TransportFactory, VmBytecode};

use crate::channel::{WorkerEnd, WorkerPoster};
use crate::message::{ControllerMessage, WorkerConfig, WorkerMessage};

/// Build the client configuration of a worker: every callback posts its
/// result to the controller.
pub fn client_config(config: WorkerConfig, poster: &WorkerPoster) -> ClientConfig {
    let mut client = ClientConfig::new(config.chain_spec)
        .with_max_log_level(config.max_log_level)
        .with_tcp(config.tcp_enabled);
    client.database_content = config.database_content;
    client.relay_chain_spec = config.relay_chain_spec;

    let best_block = poster.clone();
    let json_rpc = poster.clone();
    let database = poster.clone();
    client
        .with_best_block_callback(move |num| {
            let _ = best_block.post(WorkerMessage::BestBlockUpdate { num });
        })
        .with_json_rpc_callback(move |data| {
            let _ = json_rpc.post(WorkerMessage::Jsonrpc { data });
        })
        .with_database_sink(Arc::new(move |data: DatabaseSave| {
            database.post(WorkerMessage::Database { data })
        }))
}

/// Run a worker to completion on the current thread.
///
/// The first message received must be the configuration. Returns when the
/// instance terminates or the controller hangs up.
pub fn run_worker(
    bytecode: VmBytecode,
    end: WorkerEnd,
    transports: Option<Arc<dyn TransportFactory>>,
) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| BridgeError::Internal(format!("failed to build worker runtime: {}", e)))?;
    runtime.block_on(serve(bytecode, end, transports))
}

async fn serve(
    bytecode: VmBytecode,
    mut end: WorkerEnd,
    transports: Option<Arc<dyn TransportFactory>>,
) -> Result<()> {
    let config = match end.recv().await {
        Some(ControllerMessage::Config(config)) => config,
        Some(other) => {
            return Err(BridgeError::Internal(format!(
                "first message to a worker must be its configuration, got {:?}",
                other
            )))
        }
        None => return Err(BridgeError::ChannelClosed),
    };

    let mut client = client_config(config, &end.poster());
    client.transports = transports;

    let controller = lightvm_host::start(&bytecode, client).await?;
    let termination = controller.termination();
    tokio::pin!(termination);

    loop {
        tokio::select! {
            reason = &mut termination => return outcome(reason),
            message = end.recv() => {
                let result = match message {
                    Some(ControllerMessage::Request(request)) => controller.send_json_rpc(request),
                    Some(ControllerMessage::Pause(paused)) => controller.set_syncing_paused(paused),
                    Some(ControllerMessage::Config(_)) => {
                        tracing::warn!("worker already configured; configuration ignored");
                        Ok(())
                    }
                    None => {
                        tracing::debug!("controller hung up; shutting down worker");
                        controller.shutdown();
                        return outcome(termination.await);
                    }
                };
                // A terminated instance is reported by the termination branch.
                if let Err(err) = result {
                    tracing::debug!(error = %err, "request not delivered");
                }
            }
        }
    }
}

/// A clean shutdown is not an error.
fn outcome(reason: BridgeError) -> Result<()> {
    match reason {
        BridgeError::Terminated => Ok(()),
        reason => Err(reason),
    }
}
