//! The import table: every host function the VM module links against.
//!
//! Two namespaces are registered:
//!
//! - [`HOST_MODULE`]: the light client's own intrinsics (faults, logging,
//!   clocks, timers, persistence, connections, JSON-RPC responses).
//! - [`WASI_MODULE`]: the subset of WASI the VM's standard library expects.
//!
//! The closures only marshal arguments in and out of linear memory and
//! delegate to [`HostState`]. A [`BridgeError`] returned by the state becomes
//! a trap; the instance is terminated first so that nothing can reach it
//! after its stack was unwound.

use wasmtime::{Caller, Extern, Linker, Memory};

use crate::error::{BridgeError, Result};
use crate::host::HostState;
use crate::memory;
use crate::wasi;

/// Namespace of the light client intrinsics.
pub const HOST_MODULE: &str = "smoldot";

/// Namespace of the WASI primitives.
pub const WASI_MODULE: &str = "wasi_snapshot_preview1";

/// Register every import on `linker`.
pub fn register_imports(linker: &mut Linker<HostState>) -> Result<()> {
    register_host_imports(linker)?;
    register_wasi_imports(linker)?;
    Ok(())
}

fn link_error(err: wasmtime::Error) -> BridgeError {
    BridgeError::wasm("link", err)
}

/// The VM's exported linear memory.
fn vm_memory(caller: &mut Caller<'_, HostState>) -> Result<Memory> {
    match caller.get_export("memory") {
        Some(Extern::Memory(memory)) => Ok(memory),
        _ => Err(BridgeError::Internal(
            "VM module does not export its memory".into(),
        )),
    }
}

/// Run `f` with the VM memory and the host state borrowed together.
fn with_memory<R>(
    caller: &mut Caller<'_, HostState>,
    f: impl FnOnce(&mut [u8], &mut HostState) -> Result<R>,
) -> Result<R> {
    let memory = vm_memory(caller)?;
    let (mem, state) = memory.data_and_store_mut(caller);
    f(mem, state)
}

/// Turn a bridge result into an import result, terminating on error.
fn trap<R>(caller: &mut Caller<'_, HostState>, result: Result<R>) -> wasmtime::Result<R> {
    result.map_err(|err| {
        caller.data_mut().terminate(err.clone());
        wasmtime::Error::new(err)
    })
}

fn register_host_imports(linker: &mut Linker<HostState>) -> Result<()> {
    linker
        .func_wrap(
            HOST_MODULE,
            "throw",
            |mut caller: Caller<'_, HostState>, ptr: u32, len: u32| -> wasmtime::Result<()> {
                let result = with_memory(&mut caller, |mem, state| {
                    let message = memory::read_str(mem, ptr, len)?;
                    Err(state.fault(message))
                });
                trap(&mut caller, result)
            },
        )
        .map_err(link_error)?;

    linker
        .func_wrap(
            HOST_MODULE,
            "log",
            |mut caller: Caller<'_, HostState>,
             level: u32,
             target_ptr: u32,
             target_len: u32,
             message_ptr: u32,
             message_len: u32|
             -> wasmtime::Result<()> {
                let result = with_memory(&mut caller, |mem, state| {
                    state.ensure_active()?;
                    let target = memory::read_str(mem, target_ptr, target_len)?;
                    let message = memory::read_str(mem, message_ptr, message_len)?;
                    state.log(level, &target, &message);
                    Ok(())
                });
                trap(&mut caller, result)
            },
        )
        .map_err(link_error)?;

    linker
        .func_wrap(HOST_MODULE, "unix_time_ms", |caller: Caller<'_, HostState>| {
            caller.data().unix_time_ms()
        })
        .map_err(link_error)?;

    linker
        .func_wrap(
            HOST_MODULE,
            "monotonic_clock_ms",
            |caller: Caller<'_, HostState>| caller.data().monotonic_clock_ms(),
        )
        .map_err(link_error)?;

    linker
        .func_wrap(
            HOST_MODULE,
            "start_timer",
            |mut caller: Caller<'_, HostState>, id: u32, ms: f64| -> wasmtime::Result<()> {
                let result = caller.data().start_timer(id, ms);
                trap(&mut caller, result)
            },
        )
        .map_err(link_error)?;

    linker
        .func_wrap(
            HOST_MODULE,
            "best_block_update",
            |mut caller: Caller<'_, HostState>, number: u32| -> wasmtime::Result<()> {
                let result = caller.data().best_block_update(number);
                trap(&mut caller, result)
            },
        )
        .map_err(link_error)?;

    linker
        .func_wrap(
            HOST_MODULE,
            "database_save",
            |mut caller: Caller<'_, HostState>, ptr: u32, len: u32| -> wasmtime::Result<()> {
                let result = with_memory(&mut caller, |mem, state| {
                    state.ensure_active()?;
                    state.database_save(memory::read_bytes(mem, ptr, len)?)
                });
                trap(&mut caller, result)
            },
        )
        .map_err(link_error)?;

    linker
        .func_wrap(
            HOST_MODULE,
            "json_rpc_respond",
            |mut caller: Caller<'_, HostState>, ptr: u32, len: u32| -> wasmtime::Result<()> {
                let result = with_memory(&mut caller, |mem, state| {
                    state.ensure_active()?;
                    state.json_rpc_respond(memory::read_str(mem, ptr, len)?)
                });
                trap(&mut caller, result)
            },
        )
        .map_err(link_error)?;

    linker
        .func_wrap(
            HOST_MODULE,
            "connection_new",
            |mut caller: Caller<'_, HostState>,
             id: u32,
             addr_ptr: u32,
             addr_len: u32|
             -> wasmtime::Result<u32> {
                let result = with_memory(&mut caller, |mem, state| {
                    state.ensure_active()?;
                    let addr = memory::read_str(mem, addr_ptr, addr_len)?;
                    state.connection_new(id, &addr)
                });
                trap(&mut caller, result)
            },
        )
        .map_err(link_error)?;

    linker
        .func_wrap(
            HOST_MODULE,
            "connection_close",
            |mut caller: Caller<'_, HostState>, id: u32| -> wasmtime::Result<()> {
                let result = caller.data_mut().connection_close(id);
                trap(&mut caller, result)
            },
        )
        .map_err(link_error)?;

    linker
        .func_wrap(
            HOST_MODULE,
            "connection_send",
            |mut caller: Caller<'_, HostState>,
             id: u32,
             ptr: u32,
             len: u32|
             -> wasmtime::Result<()> {
                let result = with_memory(&mut caller, |mem, state| {
                    state.ensure_active()?;
                    let data = memory::read_bytes(mem, ptr, len)?.to_vec();
                    state.connection_send(id, data)
                });
                trap(&mut caller, result)
            },
        )
        .map_err(link_error)?;

    Ok(())
}

fn register_wasi_imports(linker: &mut Linker<HostState>) -> Result<()> {
    linker
        .func_wrap(
            WASI_MODULE,
            "random_get",
            |mut caller: Caller<'_, HostState>, ptr: u32, len: u32| -> wasmtime::Result<u32> {
                let result = with_memory(&mut caller, |mem, state| state.random_get(mem, ptr, len));
                trap(&mut caller, result)
            },
        )
        .map_err(link_error)?;

    linker
        .func_wrap(
            WASI_MODULE,
            "fd_write",
            |mut caller: Caller<'_, HostState>,
             fd: u32,
             iovs: u32,
             count: u32,
             out_written: u32|
             -> wasmtime::Result<u32> {
                let result = with_memory(&mut caller, |mem, state| {
                    state.fd_write(mem, fd, iovs, count, out_written)
                });
                trap(&mut caller, result)
            },
        )
        .map_err(link_error)?;

    // Yielding has no meaning for a single-threaded instance.
    linker
        .func_wrap(WASI_MODULE, "sched_yield", |_: Caller<'_, HostState>| {
            wasi::ERRNO_SUCCESS
        })
        .map_err(link_error)?;

    linker
        .func_wrap(
            WASI_MODULE,
            "proc_exit",
            |mut caller: Caller<'_, HostState>, code: u32| -> wasmtime::Result<()> {
                let err = caller.data_mut().proc_exit(code);
                trap(&mut caller, Err(err))
            },
        )
        .map_err(link_error)?;

    linker
        .func_wrap(
            WASI_MODULE,
            "environ_sizes_get",
            |mut caller: Caller<'_, HostState>,
             count_out: u32,
             size_out: u32|
             -> wasmtime::Result<u32> {
                let result = with_memory(&mut caller, |mem, state| {
                    state.environ_sizes_get(mem, count_out, size_out)
                });
                trap(&mut caller, result)
            },
        )
        .map_err(link_error)?;

    linker
        .func_wrap(
            WASI_MODULE,
            "environ_get",
            |mut caller: Caller<'_, HostState>,
             argv: u32,
             argv_buf: u32|
             -> wasmtime::Result<u32> {
                let result = with_memory(&mut caller, |mem, state| {
                    state.environ_get(mem, argv, argv_buf)
                });
                trap(&mut caller, result)
            },
        )
        .map_err(link_error)?;

    Ok(())
}
