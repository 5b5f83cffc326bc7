//! # Software Breakpoints
//!
//! A software breakpoint replaces one byte of code with `INT3` (`0xCC`) and
//! remembers the byte it replaced. While a record exists, the target holds
//! the trap opcode at that address, except for the single instruction during
//! which a thread steps over it.
//!
//! ## Step-over sequence
//!
//! 1. Breakpoint exception at `A`: write the original byte back, rewind the
//!    instruction pointer to `A`, set the trap flag.
//! 2. Next single-step exception on that thread: write `0xCC` at `A` again.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::error::{DebuggerError, Result};
use crate::events::EngineEvent;
use crate::memory::{read_exact, write_all};
use crate::platform::{ContinueStatus, DebugApi};
use crate::registers::RegisterContext;
use crate::session::PendingStep;
use crate::threads;
use crate::types::{Address, ThreadId};

/// x86 `INT3`
pub const TRAP_OPCODE: u8 = 0xCC;

/// An installed opcode patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SoftwareBreakpoint
{
    pub address: Address,
    /// Byte that `INT3` replaced
    pub original_byte: u8,
    pub hits: u64,
}

/// Software breakpoints by address.
#[derive(Debug, Default, Clone)]
pub struct SoftwareBreakpoints
{
    entries: BTreeMap<Address, SoftwareBreakpoint>,
}

impl SoftwareBreakpoints
{
    #[must_use]
    pub fn get(&self, address: Address) -> Option<&SoftwareBreakpoint>
    {
        self.entries.get(&address)
    }

    #[must_use]
    pub fn contains(&self, address: Address) -> bool
    {
        self.entries.contains_key(&address)
    }

    #[must_use]
    pub fn len(&self) -> usize
    {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool
    {
        self.entries.is_empty()
    }

    /// Breakpoints in address order.
    pub fn iter(&self) -> impl Iterator<Item = &SoftwareBreakpoint>
    {
        self.entries.values()
    }

    pub(crate) fn insert(&mut self, breakpoint: SoftwareBreakpoint)
    {
        self.entries.insert(breakpoint.address, breakpoint);
    }

    pub(crate) fn remove(&mut self, address: Address) -> Option<SoftwareBreakpoint>
    {
        self.entries.remove(&address)
    }

    pub(crate) fn record_hit(&mut self, address: Address) -> Option<u64>
    {
        self.entries.get_mut(&address).map(|bp| {
            bp.hits += 1;
            bp.hits
        })
    }

    pub(crate) fn clear(&mut self)
    {
        self.entries.clear();
    }
}

impl<A: DebugApi> Engine<A>
{
    /// Install an `INT3` at `address`.
    ///
    /// Setting the same address twice is a no-op. Nothing is recorded unless
    /// both the read of the original byte and the patch succeed.
    ///
    /// ## Errors
    ///
    /// - `NotAttached` without a target
    /// - `MemoryReadFailed` / `MemoryWriteFailed` from the patch
    pub fn set_software_breakpoint(&mut self, address: Address) -> Result<()>
    {
        let target = self.target.as_ref().ok_or(DebuggerError::NotAttached)?;
        if self.software.contains(address) {
            debug!(%address, "software breakpoint already installed");
            return Ok(());
        }

        let mut original = [0u8; 1];
        read_exact(&mut self.api, &target.handle, address, &mut original)?;
        write_all(&mut self.api, &target.handle, address, &[TRAP_OPCODE])?;
        if let Err(err) = self.api.flush_instruction_cache(&target.handle, address, 1) {
            warn!(%address, error = %err, "instruction cache flush failed");
        }

        self.software.insert(SoftwareBreakpoint {
            address,
            original_byte: original[0],
            hits: 0,
        });
        info!(%address, original = format_args!("0x{:02x}", original[0]), "software breakpoint installed");
        Ok(())
    }

    /// Put the original byte back and forget the breakpoint.
    ///
    /// ## Errors
    ///
    /// - `NotAttached` without a target
    /// - `NoBreakpoint` if nothing is installed at `address`
    /// - `MemoryWriteFailed` if the byte cannot be restored (the record is kept)
    pub fn remove_software_breakpoint(&mut self, address: Address) -> Result<()>
    {
        let target = self.target.as_ref().ok_or(DebuggerError::NotAttached)?;
        let breakpoint = *self
            .software
            .get(address)
            .ok_or(DebuggerError::NoBreakpoint(address))?;

        write_all(&mut self.api, &target.handle, address, &[breakpoint.original_byte])?;
        if let Err(err) = self.api.flush_instruction_cache(&target.handle, address, 1) {
            warn!(%address, error = %err, "instruction cache flush failed");
        }
        self.software.remove(address);
        info!(%address, "software breakpoint removed");
        Ok(())
    }

    /// Breakpoint exception at `address` on `thread`.
    ///
    /// Returns `None` when no software breakpoint is installed there.
    pub(crate) fn handle_software_breakpoint(
        &mut self,
        thread: ThreadId,
        address: Address,
    ) -> Option<(ContinueStatus, EngineEvent)>
    {
        let hits = self.software.record_hit(address)?;
        info!(%address, %thread, hits, "software breakpoint hit");

        if self.config.step_over_software_breakpoints {
            if let Err(err) = self.begin_software_step_over(thread, address) {
                warn!(%address, %thread, error = %err, "could not step over software breakpoint");
            }
        }

        Some((
            ContinueStatus::Continue,
            EngineEvent::SoftwareBreakpointHit {
                thread,
                address,
                hits,
            },
        ))
    }

    fn begin_software_step_over(&mut self, thread: ThreadId, address: Address) -> Result<()>
    {
        let target = self.target.as_ref().ok_or(DebuggerError::NotAttached)?;
        let original = self
            .software
            .get(address)
            .map(|bp| bp.original_byte)
            .ok_or(DebuggerError::NoBreakpoint(address))?;
        let mut context = match self.session.last_context() {
            Some(context) => context.clone(),
            None => threads::get_context(&mut self.api, thread)?,
        };

        write_all(&mut self.api, &target.handle, address, &[original])?;
        if let Err(err) = self.api.flush_instruction_cache(&target.handle, address, 1) {
            warn!(%address, error = %err, "instruction cache flush failed");
        }

        context.set_instruction_pointer(address.value());
        context.set_trap_flag();
        if let Err(err) = threads::set_context(&mut self.api, thread, &context) {
            // Without the rewind the thread would run from the middle of the
            // instruction; put the trap back so the next hit retries.
            if let Err(restore) = write_all(&mut self.api, &target.handle, address, &[TRAP_OPCODE]) {
                warn!(%address, error = %restore, "could not re-insert trap opcode");
            }
            return Err(err);
        }
        self.session.set_context(context);
        self.session.push_pending(thread, PendingStep::RearmSoftware(address));
        debug!(%address, %thread, "stepping over software breakpoint");
        Ok(())
    }

    /// Second half of a step-over: the thread has executed the original
    /// instruction, put the trap back if the breakpoint still exists.
    pub(crate) fn rearm_software_breakpoint(&mut self, address: Address)
    {
        if !self.software.contains(address) {
            debug!(%address, "breakpoint removed during step-over");
            return;
        }
        let Some(target) = self.target.as_ref() else {
            return;
        };
        match write_all(&mut self.api, &target.handle, address, &[TRAP_OPCODE]) {
            Ok(()) => {
                if let Err(err) = self.api.flush_instruction_cache(&target.handle, address, 1) {
                    warn!(%address, error = %err, "instruction cache flush failed");
                }
                debug!(%address, "software breakpoint re-armed");
            }
            Err(err) => {
                // The byte in memory is the original one now; keep the table honest.
                warn!(%address, error = %err, "could not re-arm software breakpoint, dropping it");
                self.software.remove(address);
            }
        }
    }

    /// Restore every patched byte. Used on detach.
    pub(crate) fn restore_software_breakpoints(&mut self)
    {
        let addresses: Vec<Address> = self.software.iter().map(|bp| bp.address).collect();
        for address in addresses {
            if let Err(err) = self.remove_software_breakpoint(address) {
                warn!(%address, error = %err, "failed to restore software breakpoint");
            }
        }
    }
}
