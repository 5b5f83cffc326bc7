//! # Target Memory Access
//!
//! Byte-exact reads and writes in the target's address space. A short
//! transfer is a failure: the breakpoint managers must never act on half a
//! read or leave half a write behind unnoticed.

use tracing::trace;

use crate::engine::Engine;
use crate::error::{DebuggerError, Result};
use crate::platform::DebugApi;
use crate::types::Address;

/// Fill `buffer` from `address` or fail.
pub(crate) fn read_exact<A: DebugApi>(
    api: &mut A,
    process: &A::ProcessHandle,
    address: Address,
    buffer: &mut [u8],
) -> Result<()>
{
    let read = api
        .read_process_memory(process, address, buffer)
        .map_err(|source| DebuggerError::MemoryReadFailed {
            address,
            reason: source.to_string(),
        })?;
    if read != buffer.len() {
        return Err(DebuggerError::MemoryReadFailed {
            address,
            reason: format!("short read: {read} of {} bytes", buffer.len()),
        });
    }
    trace!(%address, len = buffer.len(), "read target memory");
    Ok(())
}

/// Write all of `data` at `address` or fail.
pub(crate) fn write_all<A: DebugApi>(
    api: &mut A,
    process: &A::ProcessHandle,
    address: Address,
    data: &[u8],
) -> Result<()>
{
    let written = api
        .write_process_memory(process, address, data)
        .map_err(|source| DebuggerError::MemoryWriteFailed {
            address,
            reason: source.to_string(),
        })?;
    if written != data.len() {
        return Err(DebuggerError::MemoryWriteFailed {
            address,
            reason: format!("short write: {written} of {} bytes", data.len()),
        });
    }
    trace!(%address, len = data.len(), "wrote target memory");
    Ok(())
}

impl<A: DebugApi> Engine<A>
{
    /// Read exactly `length` bytes starting at `address`.
    ///
    /// ## Errors
    ///
    /// - `NotAttached` without a target
    /// - `MemoryReadFailed` if the OS call fails or reads fewer bytes
    pub fn read_bytes(&mut self, address: Address, length: usize) -> Result<Vec<u8>>
    {
        let target = self.target.as_ref().ok_or(DebuggerError::NotAttached)?;
        let mut buffer = vec![0u8; length];
        read_exact(&mut self.api, &target.handle, address, &mut buffer)?;
        Ok(buffer)
    }

    /// Write all of `data` starting at `address`.
    ///
    /// ## Errors
    ///
    /// - `NotAttached` without a target
    /// - `MemoryWriteFailed` if the OS call fails or writes fewer bytes
    pub fn write_bytes(&mut self, address: Address, data: &[u8]) -> Result<()>
    {
        let target = self.target.as_ref().ok_or(DebuggerError::NotAttached)?;
        write_all(&mut self.api, &target.handle, address, data)
    }
}
