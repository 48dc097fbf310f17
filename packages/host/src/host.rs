//! Per-instance host state and the semantics of every host intrinsic.
//!
//! [`HostState`] is the data of the wasmtime `Store` that owns a VM
//! instance. The import closures registered in [`crate::imports`] only
//! marshal arguments; the behaviour lives here so it can be exercised
//! without a running VM.

use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tracing::Level;

use crate::config::{BestBlockCallback, ClientConfig, JsonRpcCallback};
use crate::connection::ConnectionTable;
use crate::error::{BridgeError, Result};
use crate::sequencer::{DatabaseSave, SaveSequencer};
use crate::session::{HostEvent, SessionId};
use crate::wasi::{self, LineBuffer};

/// Status codes returned by `connection_new`.
pub const CONNECTION_OK: u32 = 0;
pub const CONNECTION_FAILED: u32 = 1;

/// Longest delay a timer is scheduled for; later deadlines are clamped.
pub const MAX_TIMER_DELAY: Duration = Duration::from_secs(30 * 365 * 24 * 60 * 60);

/// Lifecycle of a VM instance. `Terminated` is absorbing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmStatus {
    Active,
    Terminated { reason: BridgeError },
}

impl VmStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, VmStatus::Active)
    }
}

/// State owned by the store of one VM instance.
pub struct HostState {
    pub(crate) session: SessionId,
    status: watch::Sender<VmStatus>,
    pub(crate) connections: ConnectionTable,
    events: mpsc::UnboundedSender<HostEvent>,
    stdout: LineBuffer,
    stderr: LineBuffer,
    max_log_level: u32,
    pub(crate) env_vars: Vec<String>,
    monotonic_origin: Instant,
    best_block_update: Option<BestBlockCallback>,
    json_rpc: Option<JsonRpcCallback>,
    database: Option<SaveSequencer>,
}

impl HostState {
    /// Build the state for a fresh, active instance.
    ///
    /// Must be called within a tokio runtime when a database sink is
    /// configured, since the save sequencer task is spawned here.
    pub(crate) fn new(
        session: SessionId,
        config: &ClientConfig,
        events: mpsc::UnboundedSender<HostEvent>,
        status: watch::Sender<VmStatus>,
    ) -> Self {
        Self {
            session,
            status,
            connections: ConnectionTable::new(config.transport_factory()),
            events,
            stdout: LineBuffer::new(),
            stderr: LineBuffer::new(),
            max_log_level: config.log_level(),
            env_vars: Vec::new(),
            monotonic_origin: Instant::now(),
            best_block_update: config.best_block_update_callback.clone(),
            json_rpc: config.json_rpc_callback.clone(),
            database: config
                .database_save_callback
                .clone()
                .map(SaveSequencer::spawn),
        }
    }

    pub fn status(&self) -> VmStatus {
        self.status.borrow().clone()
    }

    pub fn is_active(&self) -> bool {
        self.status.borrow().is_active()
    }

    /// Checked at the top of every import.
    pub fn ensure_active(&self) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(BridgeError::Terminated)
        }
    }

    /// Move to `Terminated`, force-closing every connection. Idempotent: the
    /// first reason wins.
    pub fn terminate(&mut self, reason: BridgeError) {
        if !self.is_active() {
            return;
        }
        self.connections.close_all();
        tracing::debug!(session = %self.session, %reason, "VM instance terminated");
        self.status.send_replace(VmStatus::Terminated { reason });
    }

    /// Terminate with `err` and hand it back, for use as an import's trap.
    pub(crate) fn fail(&mut self, err: BridgeError) -> BridgeError {
        self.terminate(err.clone());
        err
    }

    /// `throw`: the VM reports an unrecoverable fault.
    pub fn fault(&mut self, message: String) -> BridgeError {
        self.fail(BridgeError::RuntimeFault(message))
    }

    /// `proc_exit`: the VM forces its own termination.
    pub fn proc_exit(&mut self, code: u32) -> BridgeError {
        self.fail(BridgeError::FatalExit(code))
    }

    /// `log`: forward a VM log entry, honouring the maximum level.
    pub fn log(&self, level: u32, target: &str, message: &str) {
        if level == 0 || level > self.max_log_level {
            return;
        }
        match level_for(level) {
            Level::ERROR => {
                tracing::error!(target: "lightvm::vm", vm_target = target, "{}", message)
            }
            Level::WARN => {
                tracing::warn!(target: "lightvm::vm", vm_target = target, "{}", message)
            }
            Level::INFO => {
                tracing::info!(target: "lightvm::vm", vm_target = target, "{}", message)
            }
            Level::DEBUG => {
                tracing::debug!(target: "lightvm::vm", vm_target = target, "{}", message)
            }
            _ => tracing::trace!(target: "lightvm::vm", vm_target = target, "{}", message),
        }
    }

    /// `unix_time_ms`
    pub fn unix_time_ms(&self) -> f64 {
        Utc::now().timestamp_millis() as f64
    }

    /// `monotonic_clock_ms`: milliseconds since the instance was created.
    pub fn monotonic_clock_ms(&self) -> f64 {
        self.monotonic_origin.elapsed().as_secs_f64() * 1000.0
    }

    /// `start_timer`: schedule exactly one `timer_finished(id)`.
    ///
    /// The callback is always delivered through the session's event queue,
    /// so even a zero delay only fires after the current VM call returned.
    pub fn start_timer(&self, id: u32, ms: f64) -> Result<()> {
        self.ensure_active()?;
        let events = self.events.clone();
        let delay = timer_delay(ms);
        tokio::spawn(async move {
            if delay.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(delay).await;
            }
            let _ = events.send(HostEvent::TimerFinished(id));
        });
        Ok(())
    }

    /// `best_block_update`
    pub fn best_block_update(&self, number: u32) -> Result<()> {
        self.ensure_active()?;
        if let Some(callback) = &self.best_block_update {
            callback(number);
        }
        Ok(())
    }

    /// `database_save`: parse and hand over to the sequencer.
    pub fn database_save(&self, payload: &[u8]) -> Result<()> {
        self.ensure_active()?;
        if let Some(sequencer) = &self.database {
            let save = DatabaseSave::from_slice(payload)?;
            // Completion is observed by the sink owner, not by the VM.
            drop(sequencer.submit(save));
        }
        Ok(())
    }

    /// `json_rpc_respond`
    pub fn json_rpc_respond(&self, response: String) -> Result<()> {
        self.ensure_active()?;
        match &self.json_rpc {
            Some(callback) => callback(response),
            None => tracing::trace!(session = %self.session, "JSON-RPC response dropped"),
        }
        Ok(())
    }

    /// `connection_new`: returns [`CONNECTION_OK`] or [`CONNECTION_FAILED`].
    ///
    /// Refused addresses are not an error for the VM: it is expected to try
    /// another one.
    pub fn connection_new(&mut self, id: u32, addr: &str) -> Result<u32> {
        self.ensure_active()?;
        match self.connections.open(id, addr, &self.events) {
            Ok(()) => Ok(CONNECTION_OK),
            Err(BridgeError::Connection(err)) => {
                tracing::debug!(id, addr, error = %err, "connection refused");
                Ok(CONNECTION_FAILED)
            }
            Err(err) => Err(err),
        }
    }

    /// `connection_close`
    pub fn connection_close(&mut self, id: u32) -> Result<()> {
        self.ensure_active()?;
        self.connections.close(id)
    }

    /// `connection_send`
    pub fn connection_send(&mut self, id: u32, data: Vec<u8>) -> Result<()> {
        self.ensure_active()?;
        self.connections.send(id, data)
    }

    /// `fd_write`: gather the iovecs, line-buffer them, report the byte count.
    pub fn fd_write(
        &mut self,
        mem: &mut [u8],
        fd: u32,
        iovs: u32,
        count: u32,
        out_written: u32,
    ) -> Result<u32> {
        self.ensure_active()?;
        let buffer = match fd {
            wasi::STDOUT => &mut self.stdout,
            wasi::STDERR => &mut self.stderr,
            other => return Err(BridgeError::BadFileDescriptor(other)),
        };

        let data = wasi::gather_iovecs(mem, iovs, count)?;
        for line in buffer.push(&String::from_utf8_lossy(&data)) {
            if fd == wasi::STDOUT {
                tracing::info!(target: "lightvm::stdout", "{}", line);
            } else {
                tracing::warn!(target: "lightvm::stderr", "{}", line);
            }
        }

        crate::memory::write_u32(mem, out_written, data.len() as u32)?;
        Ok(wasi::ERRNO_SUCCESS)
    }

    /// Text written to stdout (fd 1) or stderr (fd 2) and not yet flushed.
    pub fn pending_output(&self, fd: u32) -> Option<&str> {
        match fd {
            wasi::STDOUT => Some(self.stdout.pending()),
            wasi::STDERR => Some(self.stderr.pending()),
            _ => None,
        }
    }

    /// `random_get`
    pub fn random_get(&self, mem: &mut [u8], ptr: u32, len: u32) -> Result<u32> {
        self.ensure_active()?;
        wasi::fill_random(mem, ptr, len)?;
        Ok(wasi::ERRNO_SUCCESS)
    }

    /// `environ_sizes_get`
    pub fn environ_sizes_get(&self, mem: &mut [u8], count_out: u32, size_out: u32) -> Result<u32> {
        self.ensure_active()?;
        let (count, size) = wasi::environ_sizes(&self.env_vars);
        crate::memory::write_u32(mem, count_out, count)?;
        crate::memory::write_u32(mem, size_out, size)?;
        Ok(wasi::ERRNO_SUCCESS)
    }

    /// `environ_get`
    pub fn environ_get(&self, mem: &mut [u8], argv: u32, argv_buf: u32) -> Result<u32> {
        self.ensure_active()?;
        wasi::write_environ(mem, &self.env_vars, argv, argv_buf)?;
        Ok(wasi::ERRNO_SUCCESS)
    }
}

/// Delay for a VM-supplied millisecond count. Negative and NaN delays fire
/// immediately; anything past [`MAX_TIMER_DELAY`] is clamped.
fn timer_delay(ms: f64) -> Duration {
    if ms.is_nan() || ms <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(ms / 1000.0)
        .unwrap_or(MAX_TIMER_DELAY)
        .min(MAX_TIMER_DELAY)
}

/// Map the VM's 1..=5 log levels onto tracing levels.
fn level_for(level: u32) -> Level {
    match level {
        0 | 1 => Level::ERROR,
        2 => Level::WARN,
        3 => Level::INFO,
        4 => Level::DEBUG,
        _ => Level::TRACE,
    }
}
