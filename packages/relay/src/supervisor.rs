//! Supervision of nested workers.
//!
//! Workers never spawn workers themselves: they ask the controller, which
//! creates the nested worker through a [`WorkerSpawner`] and tracks it by the
//! id the requesting worker chose, so that it can be torn down later.

use std::collections::BTreeMap;
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::time::Duration;

use lightvm_host::{BridgeError, Result};
use serde_json::Value as JsonValue;

/// Limits for the relay.
#[derive(Clone)]
pub struct RelayConfig {
    /// Maximum number of nested workers alive at once.
    pub max_workers: usize,

    /// Creates nested workers. Spawn requests are refused when unset.
    pub spawner: Option<Arc<dyn WorkerSpawner>>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_workers: 64,
            spawner: None,
        }
    }
}

impl RelayConfig {
    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = Some(spawner);
        self
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }
}

impl std::fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConfig")
            .field("max_workers", &self.max_workers)
            .field("spawner", &self.spawner.is_some())
            .finish()
    }
}

/// A running nested worker.
pub trait NestedWorker: Send {
    /// Stop the worker. Must not block.
    fn terminate(&mut self);
}

/// Creates nested workers on behalf of the controller.
pub trait WorkerSpawner: Send + Sync {
    /// Start worker `id` and hand it the opaque `handshake` payload.
    fn spawn(&self, id: u64, handshake: JsonValue) -> Result<Box<dyn NestedWorker>>;
}

/// Tells a nested worker thread it has been terminated.
pub struct ShutdownSignal {
    rx: std_mpsc::Receiver<()>,
}

impl ShutdownSignal {
    /// Whether termination was requested (or the controller is gone).
    pub fn is_requested(&self) -> bool {
        !matches!(self.rx.try_recv(), Err(std_mpsc::TryRecvError::Empty))
    }

    /// Block until termination is requested.
    pub fn wait(&self) {
        let _ = self.rx.recv();
    }

    /// Block for at most `timeout`; returns whether termination was requested.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        !matches!(
            self.rx.recv_timeout(timeout),
            Err(std_mpsc::RecvTimeoutError::Timeout)
        )
    }
}

type WorkerEntry = dyn Fn(u64, JsonValue, ShutdownSignal) + Send + Sync;

/// Runs each nested worker on its own thread.
#[derive(Clone)]
pub struct ThreadSpawner {
    entry: Arc<WorkerEntry>,
}

impl ThreadSpawner {
    /// `entry` runs on the new thread with the worker id, the handshake
    /// payload and the signal to watch for termination.
    pub fn new(entry: impl Fn(u64, JsonValue, ShutdownSignal) + Send + Sync + 'static) -> Self {
        Self {
            entry: Arc::new(entry),
        }
    }
}

struct ThreadWorker {
    shutdown: Option<std_mpsc::Sender<()>>,
}

impl NestedWorker for ThreadWorker {
    fn terminate(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

impl WorkerSpawner for ThreadSpawner {
    fn spawn(&self, id: u64, handshake: JsonValue) -> Result<Box<dyn NestedWorker>> {
        let (tx, rx) = std_mpsc::channel();
        let entry = self.entry.clone();
        std::thread::Builder::new()
            .name(format!("lightvm-worker-{}", id))
            .spawn(move || entry(id, handshake, ShutdownSignal { rx }))
            .map_err(|e| BridgeError::Internal(format!("failed to spawn worker {}: {}", id, e)))?;
        Ok(Box::new(ThreadWorker { shutdown: Some(tx) }))
    }
}

/// The nested workers created on behalf of one relayed instance.
pub struct Supervisor {
    config: RelayConfig,
    workers: BTreeMap<u64, Box<dyn NestedWorker>>,
}

impl Supervisor {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            workers: BTreeMap::new(),
        }
    }

    /// Create nested worker `id`.
    pub fn spawn(&mut self, id: u64, handshake: JsonValue) -> Result<()> {
        let spawner = self
            .config
            .spawner
            .clone()
            .ok_or_else(|| BridgeError::Config("no worker spawner configured".into()))?;

        if self.workers.contains_key(&id) {
            return Err(BridgeError::Internal(format!(
                "nested worker {} already running",
                id
            )));
        }
        if self.workers.len() >= self.config.max_workers {
            return Err(BridgeError::Internal(format!(
                "maximum nested workers reached ({})",
                self.config.max_workers
            )));
        }

        let worker = spawner.spawn(id, handshake)?;
        self.workers.insert(id, worker);
        tracing::debug!(id, "nested worker spawned");
        Ok(())
    }

    /// Tear down nested worker `id`.
    pub fn terminate(&mut self, id: u64) -> Result<()> {
        let mut worker = self
            .workers
            .remove(&id)
            .ok_or_else(|| BridgeError::Internal(format!("unknown nested worker {}", id)))?;
        worker.terminate();
        tracing::debug!(id, "nested worker terminated");
        Ok(())
    }

    pub fn terminate_all(&mut self) {
        for (_, mut worker) in std::mem::take(&mut self.workers) {
            worker.terminate();
        }
    }

    pub fn workers(&self) -> impl Iterator<Item = u64> + '_ {
        self.workers.keys().copied()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;

    #[derive(Default)]
    struct FakeSpawner {
        log: Arc<Mutex<Vec<String>>>,
    }

    struct FakeWorker {
        id: u64,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl NestedWorker for FakeWorker {
        fn terminate(&mut self) {
            self.log.lock().unwrap().push(format!("terminate {}", self.id));
        }
    }

    impl WorkerSpawner for FakeSpawner {
        fn spawn(&self, id: u64, handshake: JsonValue) -> Result<Box<dyn NestedWorker>> {
            self.log
                .lock()
                .unwrap()
                .push(format!("spawn {} {}", id, handshake));
            Ok(Box::new(FakeWorker {
                id,
                log: self.log.clone(),
            }))
        }
    }

    fn supervisor(max_workers: usize) -> (Supervisor, Arc<Mutex<Vec<String>>>) {
        let spawner = FakeSpawner::default();
        let log = spawner.log.clone();
        let config = RelayConfig::default()
            .with_spawner(Arc::new(spawner))
            .with_max_workers(max_workers);
        (Supervisor::new(config), log)
    }

    #[test]
    fn spawn_then_terminate_by_id() {
        let (mut supervisor, log) = supervisor(4);
        supervisor.spawn(7, json!({"hello": 1})).unwrap();
        supervisor.spawn(8, json!(null)).unwrap();
        assert_eq!(supervisor.workers().collect::<Vec<_>>(), vec![7, 8]);

        supervisor.terminate(7).unwrap();
        assert_eq!(supervisor.worker_count(), 1);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["spawn 7 {\"hello\":1}", "spawn 8 null", "terminate 7"]
        );
    }

    #[test]
    fn terminate_unknown_worker() {
        let (mut supervisor, _log) = supervisor(4);
        assert!(matches!(
            supervisor.terminate(1),
            Err(BridgeError::Internal(_))
        ));
    }

    #[test]
    fn duplicate_ids_and_limit() {
        let (mut supervisor, _log) = supervisor(1);
        supervisor.spawn(1, json!(null)).unwrap();
        assert!(matches!(
            supervisor.spawn(1, json!(null)),
            Err(BridgeError::Internal(_))
        ));
        assert!(matches!(
            supervisor.spawn(2, json!(null)),
            Err(BridgeError::Internal(_))
        ));
        assert_eq!(supervisor.worker_count(), 1);
    }

    #[test]
    fn spawning_requires_a_spawner() {
        let mut supervisor = Supervisor::new(RelayConfig::default());
        assert!(matches!(
            supervisor.spawn(1, json!(null)),
            Err(BridgeError::Config(_))
        ));
    }

    #[test]
    fn terminate_all() {
        let (mut supervisor, log) = supervisor(4);
        supervisor.spawn(1, json!(null)).unwrap();
        supervisor.spawn(2, json!(null)).unwrap();
        supervisor.terminate_all();
        assert_eq!(supervisor.worker_count(), 0);
        assert!(log.lock().unwrap().ends_with(&[
            "terminate 1".to_string(),
            "terminate 2".to_string()
        ]));
    }

    #[test]
    fn thread_spawner_runs_entry_until_terminated() {
        let (done_tx, done_rx) = std_mpsc::channel();
        let spawner = ThreadSpawner::new(move |id, handshake, shutdown| {
            shutdown.wait();
            let _ = done_tx.send((id, handshake));
        });

        let mut worker = spawner.spawn(5, json!("handshake")).unwrap();
        worker.terminate();
        // Terminating twice is harmless.
        worker.terminate();

        let (id, handshake) = done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(id, 5);
        assert_eq!(handshake, json!("handshake"));
    }

    #[test]
    fn shutdown_signal_polling() {
        let (tx, rx) = std_mpsc::channel();
        let shutdown = ShutdownSignal { rx };
        assert!(!shutdown.is_requested());
        assert!(!shutdown.wait_timeout(Duration::from_millis(10)));

        tx.send(()).unwrap();
        assert!(shutdown.wait_timeout(Duration::from_millis(10)));

        // A dropped controller counts as a request.
        drop(tx);
        assert!(shutdown.is_requested());
        assert!(shutdown.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn thread_spawner_entry_can_poll_for_termination() {
        let (ticks_tx, ticks_rx) = std_mpsc::channel();
        let (done_tx, done_rx) = std_mpsc::channel();
        let spawner = ThreadSpawner::new(move |_, _, shutdown| {
            let mut ticks = 0u32;
            while !shutdown.wait_timeout(Duration::from_millis(5)) {
                ticks += 1;
                let _ = ticks_tx.send(ticks);
            }
            let _ = done_tx.send(ticks);
        });

        let mut worker = spawner.spawn(1, json!(null)).unwrap();
        // The entry keeps running until asked to stop.
        assert_eq!(ticks_rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
        worker.terminate();

        let ticks = done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(ticks >= 1);
    }
}
