//! Shared fixtures: a scriptable VM written in WebAssembly text and a
//! transport factory that records instead of touching the network.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use lightvm_host::{
    ConnectTarget, ConnectionError, Transport, TransportEvents, TransportFactory, VmBytecode,
};

const TEMPLATE: &str = r#"
(module
  (import "smoldot" "throw" (func $throw (param i32 i32)))
  (import "smoldot" "start_timer" (func $start_timer (param i32 f64)))
  (import "smoldot" "best_block_update" (func $best_block_update (param i32)))
  (import "smoldot" "database_save" (func $database_save (param i32 i32)))
  (import "smoldot" "connection_new" (func $connection_new (param i32 i32 i32) (result i32)))
  (import "smoldot" "connection_close" (func $connection_close (param i32)))
  (import "smoldot" "connection_send" (func $connection_send (param i32 i32 i32)))
  (import "smoldot" "json_rpc_respond" (func $json_rpc_respond (param i32 i32)))
  (import "wasi_snapshot_preview1" "fd_write" (func $fd_write (param i32 i32 i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))

  (memory (export "memory") 2)
  (global $heap (mut i32) (i32.const 4096))

  (data (i32.const 16) "/ip4/1.2.3.4/tcp/30333/ws")
  (data (i32.const 64) "connection refused")
  (data (i32.const 96) "init failed")

  (func (export "alloc") (param $len i32) (result i32)
    (local $ptr i32)
    (local.set $ptr (global.get $heap))
    (global.set $heap (i32.add (global.get $heap) (local.get $len)))
    (local.get $ptr))

  (func (export "init")
    (param $cs_ptr i32) (param $cs_len i32)
    (param $db_ptr i32) (param $db_len i32) (param $level i32)
    __INIT__)

  (func (export "timer_finished") (param $id i32)
    __TIMER__)

  (func (export "set_syncing_paused") (param $paused i32)
    (call $best_block_update (i32.add (i32.const 100) (local.get $paused))))

  (func (export "connection_open") (param $id i32)
    (call $connection_send (local.get $id) (i32.const 16) (i32.const 4)))

  (func (export "connection_message") (param $id i32) (param $ptr i32) (param $len i32)
    (call $connection_send (local.get $id) (local.get $ptr) (local.get $len)))

  (func (export "connection_closed") (param $id i32)
    __CLOSED__)

  (func (export "json_rpc_send") (param $ptr i32) (param $len i32)
    (call $json_rpc_respond (local.get $ptr) (local.get $len)))
)
"#;

/// Reports the chain spec length and log level as best blocks, persists the
/// database content, opens connection 0 and starts timer 1 with no delay.
pub const ECHO_INIT: &str = r#"
    (call $best_block_update (local.get $cs_len))
    (call $best_block_update (local.get $level))
    (if (local.get $db_len)
      (then (call $database_save (local.get $db_ptr) (local.get $db_len))))
    (if (call $connection_new (i32.const 0) (i32.const 16) (i32.const 25))
      (then (call $throw (i32.const 64) (i32.const 18))))
    (call $start_timer (i32.const 1) (f64.const 0))
"#;

/// Reports `1000 + id` as best block.
pub const ECHO_TIMER: &str = r#"
    (call $best_block_update (i32.add (i32.const 1000) (local.get $id)))
"#;

/// Reports the database pointer and length handed to `init`.
pub const DATABASE_PARAMS_INIT: &str = r#"
    (call $best_block_update (local.get $db_ptr))
    (call $best_block_update (local.get $db_len))
"#;

/// Answers a remote close by releasing the connection.
pub const CLOSE_ON_CLOSED: &str = r#"
    (call $connection_close (local.get $id))
"#;

/// Keeps the connection registered, writes to it anyway and reports 500.
pub const SEND_ON_CLOSED: &str = r#"
    (call $connection_send (local.get $id) (i32.const 16) (i32.const 4))
    (call $best_block_update (i32.const 500))
"#;

pub const FAULT_INIT: &str = r#"
    (call $throw (i32.const 96) (i32.const 11))
"#;

pub const EXIT_TIMER: &str = r#"
    (call $proc_exit (i32.const 7))
"#;

pub const TRAP_TIMER: &str = r#"
    unreachable
"#;

pub const BAD_FD_TIMER: &str = r#"
    (drop (call $fd_write (i32.const 3) (i32.const 0) (i32.const 0) (i32.const 128)))
"#;

/// Build a VM module from the template.
pub fn vm(init: &str, timer: &str) -> VmBytecode {
    vm_with_closed(init, timer, CLOSE_ON_CLOSED)
}

/// Like [`vm`], with a custom `connection_closed` body.
pub fn vm_with_closed(init: &str, timer: &str, closed: &str) -> VmBytecode {
    VmBytecode::from_bytes(
        TEMPLATE
            .replace("__INIT__", init)
            .replace("__TIMER__", timer)
            .replace("__CLOSED__", closed)
            .into_bytes(),
    )
}

pub fn echo_vm() -> VmBytecode {
    vm(ECHO_INIT, ECHO_TIMER)
}

/// Something the VM did to a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Activity {
    Opened(u32, ConnectTarget),
    Sent(u32, Vec<u8>),
    Closed(u32),
}

/// Transport factory that reports every call on a channel.
#[derive(Clone)]
pub struct RecordingTransports {
    activity: mpsc::UnboundedSender<Activity>,
    handles: Arc<Mutex<Vec<TransportEvents>>>,
}

impl RecordingTransports {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Activity>) {
        let (activity, rx) = mpsc::unbounded_channel();
        (
            Self {
                activity,
                handles: Arc::new(Mutex::new(Vec::new())),
            },
            rx,
        )
    }

    /// Event reporter of the `n`th transport opened.
    pub fn events(&self, n: usize) -> TransportEvents {
        self.handles.lock().unwrap()[n].clone()
    }
}

struct RecordingTransport {
    id: u32,
    activity: mpsc::UnboundedSender<Activity>,
}

impl Transport for RecordingTransport {
    fn send(&mut self, data: Vec<u8>) {
        let _ = self.activity.send(Activity::Sent(self.id, data));
    }

    fn close(&mut self) {
        let _ = self.activity.send(Activity::Closed(self.id));
    }
}

impl TransportFactory for RecordingTransports {
    fn open(
        &self,
        target: &ConnectTarget,
        events: TransportEvents,
    ) -> Result<Box<dyn Transport>, ConnectionError> {
        let id = events.id();
        let _ = self.activity.send(Activity::Opened(id, target.clone()));
        self.handles.lock().unwrap().push(events);
        Ok(Box::new(RecordingTransport {
            id,
            activity: self.activity.clone(),
        }))
    }
}

/// Receive the next item or fail the test after a few seconds.
pub async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for the VM")
        .expect("channel closed")
}

/// Sender/receiver pair usable from a `Fn` callback.
pub fn collector<T: Send + 'static>() -> (
    impl Fn(T) + Send + Sync + 'static,
    mpsc::UnboundedReceiver<T>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        move |value| {
            let _ = tx.send(value);
        },
        rx,
    )
}
