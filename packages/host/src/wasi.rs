//! The low-level I/O primitives a WASI-targeted VM expects from its host.
//!
//! Only what the light client actually uses is provided: writing lines to
//! stdout/stderr, secure randomness, environment variables, yielding and
//! process exit.

use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::{BridgeError, Result};
use crate::memory;

/// WASI errno for success.
pub const ERRNO_SUCCESS: u32 = 0;

pub const STDOUT: u32 = 1;
pub const STDERR: u32 = 2;

/// Accumulates text written to a stream and hands it out one line at a time.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: String,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `text` and return every line it completed, without the `\n`.
    pub fn push(&mut self, text: &str) -> Vec<String> {
        self.pending.push_str(text);
        let mut lines = Vec::new();
        while let Some(index) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=index).collect();
            lines.push(line[..line.len() - 1].to_string());
        }
        lines
    }

    /// Text written since the last completed line.
    pub fn pending(&self) -> &str {
        &self.pending
    }
}

/// Concatenate the buffers described by a `writev(2)`-style iovec array.
///
/// Each entry is a little-endian `(ptr: u32, len: u32)` pair.
pub fn gather_iovecs(mem: &[u8], iovs: u32, count: u32) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for i in 0..count {
        let entry = iovs
            .checked_add(i.checked_mul(8).ok_or_else(iovec_overflow)?)
            .ok_or_else(iovec_overflow)?;
        let ptr = memory::read_u32(mem, entry)?;
        let len = memory::read_u32(mem, entry.checked_add(4).ok_or_else(iovec_overflow)?)?;
        out.extend_from_slice(memory::read_bytes(mem, ptr, len)?);
    }
    Ok(out)
}

fn iovec_overflow() -> BridgeError {
    BridgeError::Internal("iovec array out of bounds".into())
}

/// Fill `len` bytes at `ptr` with cryptographically secure random data.
pub fn fill_random(mem: &mut [u8], ptr: u32, len: u32) -> Result<()> {
    // Validate the range before touching it.
    memory::read_bytes(mem, ptr, len)?;
    let start = ptr as usize;
    OsRng.fill_bytes(&mut mem[start..start + len as usize]);
    Ok(())
}

/// Number of variables and total buffer size (each entry NUL-terminated).
pub fn environ_sizes(env_vars: &[String]) -> (u32, u32) {
    let total: usize = env_vars.iter().map(|var| var.len() + 1).sum();
    (env_vars.len() as u32, total as u32)
}

/// Write the pointer table at `argv` and the NUL-terminated strings at `argv_buf`.
pub fn write_environ(mem: &mut [u8], env_vars: &[String], argv: u32, argv_buf: u32) -> Result<()> {
    let mut argv_pos = argv;
    let mut buf_pos = argv_buf;
    for var in env_vars {
        memory::write_u32(mem, argv_pos, buf_pos)?;
        argv_pos += 4;

        memory::write_bytes(mem, buf_pos, var.as_bytes())?;
        buf_pos += var.len() as u32;
        memory::write_bytes(mem, buf_pos, &[0])?;
        buf_pos += 1;
    }
    Ok(())
}
