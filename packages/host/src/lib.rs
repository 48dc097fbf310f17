//! # lightvm host
//!
//! Hosts a light-client virtual machine compiled to WebAssembly. The VM does
//! all of the protocol work (networking logic, sync, storage format); this
//! crate provides the handful of primitives it cannot provide for itself and
//! routes its results back to the embedding application.
//!
//! ## Core Concepts
//!
//! ### Instances
//!
//! A **VM instance** owns a linear memory and a set of exports (`alloc`,
//! `init`, `timer_finished`, `connection_open`, ...). It starts `Active` and
//! moves to `Terminated` when it reports a fault, forces an exit or breaks
//! the host protocol. `Terminated` is absorbing: to retry, start a new
//! instance from the same [`VmLoader`].
//!
//! ### Host intrinsics
//!
//! The VM imports two namespaces: the light client's own intrinsics
//! (logging, clocks, timers, persistence, connections) and a small WASI
//! subset (stdout/stderr, secure randomness, environment, exit). They are
//! registered by [`imports::register_imports`] and implemented on
//! [`HostState`].
//!
//! ### Sessions
//!
//! Each instance is driven by exactly one tokio task, its **session**.
//! Timers and transports never call into the VM themselves; they post
//! events to the session, which delivers them one at a time. The embedding
//! application talks to the session through a [`Controller`].
//!
//! ### Persistence
//!
//! `database_save` payloads go through a [`SaveSequencer`], which hands
//! them to the configured [`DatabaseSink`] strictly one after the other, in
//! submission order.
//!
//! ## Example
//!
//! ```ignore
//! use lightvm_host::{start, ClientConfig, VmBytecode};
//!
//! let bytecode = VmBytecode::from_file("light_client.wasm")?;
//! let config = ClientConfig::new(chain_spec)
//!     .with_best_block_callback(|n| println!("best block #{}", n));
//!
//! let controller = start(&bytecode, config).await?;
//! controller.set_syncing_paused(false)?;
//! let reason = controller.termination().await;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  start(config)   ┌─────────────────────────────────────┐
//! │  application │ ───────────────▶ │ VmLoader                            │
//! │              │                  │   Store<HostState> + import table   │
//! │              │ ◀── Controller ─ │   alloc/init                        │
//! └──────┬───────┘                  └──────────────┬──────────────────────┘
//!        │ set_syncing_paused                      │ spawn
//!        ▼                                         ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │ Session (one tokio task per instance)                               │
//! │   HostEvent queue ◀── timers                                        │
//! │                   ◀── transports (WebSocket / TCP)                  │
//! │   VM exports ──▶ imports ──▶ ConnectionTable, SaveSequencer,        │
//! │                              callbacks, tracing                     │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod host;
pub mod imports;
pub mod loader;
pub mod memory;
pub mod sequencer;
pub mod session;
pub mod wasi;

pub use config::{
    BestBlockCallback, ClientConfig, JsonRpcCallback, DEFAULT_MAX_LOG_LEVEL, MAX_LOG_LEVEL,
    RELAY_DEFAULT_MAX_LOG_LEVEL,
};
pub use connection::{
    parse_address, ConnectTarget, ConnectionTable, NetworkTransports, Transport, TransportEvent,
    TransportEvents, TransportFactory,
};
pub use error::{BridgeError, ConnectionError, Result};
pub use host::{HostState, VmStatus};
pub use loader::{start, VmBytecode, VmLoader};
pub use sequencer::{
    BlockRecord, DatabaseSave, DatabaseSink, MetadataEntry, NewMetadata, SaveCompletion,
    SaveSequencer,
};
pub use session::{Controller, HostEvent, SessionId};
