//! Database-save sequencer.
//!
//! Persistence requests can outlive the VM call that produced them, so they
//! go through a FIFO queue drained by a single task. Request N+1 is not
//! handed to the sink until request N's save has finished, successfully or
//! not.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, oneshot};

use crate::error::{BridgeError, Result};

/// A persistence request emitted by the VM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseSave {
    /// Opaque chain state, fed back as `database_content` on the next start.
    pub chain: JsonValue,

    #[serde(default)]
    pub new_metadata: NewMetadata,

    #[serde(default)]
    pub blocks: Vec<BlockRecord>,
}

/// Metadata introduced by a save, either as a list of entries or as an
/// object keyed by runtime spec version (decimal string keys).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NewMetadata {
    Entries(Vec<MetadataEntry>),
    ByRuntimeSpec(BTreeMap<String, JsonValue>),
}

impl Default for NewMetadata {
    fn default() -> Self {
        NewMetadata::Entries(Vec::new())
    }
}

impl NewMetadata {
    /// Runtime spec versions with new metadata, in ascending order.
    pub fn runtime_specs(&self) -> Vec<u32> {
        let mut specs: Vec<u32> = match self {
            NewMetadata::Entries(entries) => entries.iter().map(|e| e.runtime_spec).collect(),
            NewMetadata::ByRuntimeSpec(map) => {
                map.keys().filter_map(|key| key.parse().ok()).collect()
            }
        };
        specs.sort_unstable();
        specs.dedup();
        specs
    }

    /// The metadata of `runtime_spec`, if this save carries it.
    pub fn get(&self, runtime_spec: u32) -> Option<&JsonValue> {
        match self {
            NewMetadata::Entries(entries) => entries
                .iter()
                .find(|e| e.runtime_spec == runtime_spec)
                .map(|e| &e.metadata),
            NewMetadata::ByRuntimeSpec(map) => map.get(&runtime_spec.to_string()),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            NewMetadata::Entries(entries) => entries.is_empty(),
            NewMetadata::ByRuntimeSpec(map) => map.is_empty(),
        }
    }
}

/// Chain metadata for one runtime version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataEntry {
    pub runtime_spec: u32,
    pub spec_name: String,
    pub metadata: JsonValue,
}

/// Events of one block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub number: u64,
    pub runtime_spec: u32,
    pub events: JsonValue,
}

impl DatabaseSave {
    /// Parse a payload read out of VM memory.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| BridgeError::Internal(format!("malformed database_save payload: {}", e)))
    }

    /// Highest block number carried by this payload.
    pub fn highest_block(&self) -> Option<u64> {
        self.blocks.iter().map(|b| b.number).max()
    }
}

/// Durable storage for persistence requests.
#[async_trait]
pub trait DatabaseSink: Send + Sync {
    /// Durably apply one payload. Called once per request, in order.
    async fn save(&self, payload: DatabaseSave) -> Result<()>;
}

#[async_trait]
impl<F> DatabaseSink for F
where
    F: Fn(DatabaseSave) -> Result<()> + Send + Sync,
{
    async fn save(&self, payload: DatabaseSave) -> Result<()> {
        (self)(payload)
    }
}

struct SaveRequest {
    payload: DatabaseSave,
    done: oneshot::Sender<Result<()>>,
}

/// Completion signal for one submitted request.
#[derive(Debug)]
pub struct SaveCompletion {
    rx: oneshot::Receiver<Result<()>>,
}

impl SaveCompletion {
    /// Wait for the request's durable-write step to finish.
    pub async fn wait(self) -> Result<()> {
        self.rx.await.unwrap_or(Err(BridgeError::ChannelClosed))
    }
}

/// FIFO queue in front of a [`DatabaseSink`].
///
/// Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct SaveSequencer {
    queue: mpsc::UnboundedSender<SaveRequest>,
}

impl SaveSequencer {
    /// Start the drain task on the current tokio runtime.
    pub fn spawn(sink: Arc<dyn DatabaseSink>) -> Self {
        let (queue, rx) = mpsc::unbounded_channel();
        tokio::spawn(drain(sink, rx));
        Self { queue }
    }

    /// Enqueue a payload behind every request submitted before it.
    pub fn submit(&self, payload: DatabaseSave) -> SaveCompletion {
        let (done, rx) = oneshot::channel();
        if let Err(mpsc::error::SendError(request)) = self.queue.send(SaveRequest { payload, done })
        {
            let _ = request.done.send(Err(BridgeError::ChannelClosed));
        }
        SaveCompletion { rx }
    }
}

async fn drain(sink: Arc<dyn DatabaseSink>, mut queue: mpsc::UnboundedReceiver<SaveRequest>) {
    while let Some(request) = queue.recv().await {
        let highest_block = request.payload.highest_block();
        let result = sink.save(request.payload).await;
        match &result {
            Ok(()) => tracing::trace!(?highest_block, "database save applied"),
            Err(err) => tracing::warn!(?highest_block, error = %err, "database save failed"),
        }
        // The submitter may not care about the outcome.
        let _ = request.done.send(result);
    }
}
