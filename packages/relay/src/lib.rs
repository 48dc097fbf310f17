//! # lightvm relay
//!
//! Runs a lightvm instance on an isolated worker thread. The worker hosts
//! the VM loader and import table exactly as direct mode does; the
//! controller (the caller's runtime) only sees the messages the worker
//! posts back.
//!
//! ```text
//! ┌─────────────── controller ───────────────┐        ┌──────── worker thread ────────┐
//! │ RelayClient ── ControllerMessage ────────┼──────▶ │ run_worker                    │
//! │                (config, requests, pause) │        │   lightvm_host::start         │
//! │ dispatch ◀──── WorkerMessage ────────────┼─────── │   callbacks post messages     │
//! │   callbacks, SaveSequencer, Supervisor   │        └───────────────────────────────┘
//! └──────────────────────────────────────────┘
//! ```
//!
//! Nested workers are never spawned by a worker: it posts a
//! `spawn-vm-worker` message and the controller's [`Supervisor`] creates
//! the worker through a [`WorkerSpawner`].

pub mod channel;
pub mod client;
pub mod message;
pub mod supervisor;
pub mod worker;

pub use channel::{pair, ControllerEnd, WorkerEnd, WorkerPoster};
pub use client::RelayClient;
pub use message::{ControllerMessage, SpawnRequest, TerminateRequest, WorkerConfig, WorkerMessage};
pub use supervisor::{
    NestedWorker, RelayConfig, ShutdownSignal, Supervisor, ThreadSpawner, WorkerSpawner,
};
pub use worker::run_worker;
