//! Marshaling across the VM's linear memory.
//!
//! All data crossing the host/VM boundary is addressed by a pointer and a
//! length into the VM's linear memory. Inbound data is copied into a range
//! the VM allocated for us through its `alloc` export.

use wasmtime::{Memory, Store, TypedFunc};

use crate::error::{BridgeError, Result};

fn range(memory: &[u8], ptr: u32, len: u32) -> Result<std::ops::Range<usize>> {
    let start = ptr as usize;
    let end = start
        .checked_add(len as usize)
        .filter(|end| *end <= memory.len())
        .ok_or_else(|| {
            BridgeError::Internal(format!(
                "memory access out of bounds: ptr={} len={} size={}",
                ptr,
                len,
                memory.len()
            ))
        })?;
    Ok(start..end)
}

/// Borrow `len` bytes at `ptr`.
pub fn read_bytes(memory: &[u8], ptr: u32, len: u32) -> Result<&[u8]> {
    let range = range(memory, ptr, len)?;
    Ok(&memory[range])
}

/// Read `len` bytes at `ptr` as UTF-8 text. Invalid sequences are replaced.
pub fn read_str(memory: &[u8], ptr: u32, len: u32) -> Result<String> {
    Ok(String::from_utf8_lossy(read_bytes(memory, ptr, len)?).into_owned())
}

/// Copy `bytes` into memory starting at `ptr`.
pub fn write_bytes(memory: &mut [u8], ptr: u32, bytes: &[u8]) -> Result<()> {
    let range = range(memory, ptr, bytes.len() as u32)?;
    memory[range].copy_from_slice(bytes);
    Ok(())
}

/// Read a little-endian `u32` at `ptr`.
pub fn read_u32(memory: &[u8], ptr: u32) -> Result<u32> {
    let bytes = read_bytes(memory, ptr, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Write a little-endian `u32` at `ptr`.
pub fn write_u32(memory: &mut [u8], ptr: u32, value: u32) -> Result<()> {
    write_bytes(memory, ptr, &value.to_le_bytes())
}

/// Ask the VM to allocate room for `bytes`, then copy them in.
///
/// Returns the pointer and length to hand to the VM export that consumes
/// the data.
pub fn alloc_and_write<T: 'static>(
    store: &mut Store<T>,
    memory: &Memory,
    alloc: &TypedFunc<u32, u32>,
    bytes: &[u8],
) -> Result<(u32, u32)> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| BridgeError::Internal(format!("buffer too large: {}", bytes.len())))?;
    let ptr = alloc
        .call(&mut *store, len)
        .map_err(crate::session::vm_error)?;
    write_bytes(memory.data_mut(&mut *store), ptr, bytes)?;
    Ok((ptr, len))
}
