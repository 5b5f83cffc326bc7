//! # Windows Thread Context
//!
//! [`WindowsContext`] wraps the native `CONTEXT` record, always requested
//! with the full general-purpose and debug-register groups.
//!
//! The record layout depends on the host architecture: `Rip`/`Dr*` are
//! 64-bit on x86-64, `Eip`/`Dr*` 32-bit on x86.

use windows::Win32::System::Diagnostics::Debug::CONTEXT;
#[cfg(target_arch = "x86")]
use windows::Win32::System::Diagnostics::Debug::{CONTEXT_DEBUG_REGISTERS_X86, CONTEXT_FULL_X86};
#[cfg(target_arch = "x86_64")]
use windows::Win32::System::Diagnostics::Debug::{CONTEXT_DEBUG_REGISTERS_AMD64, CONTEXT_FULL_AMD64};
use windows::Win32::System::Diagnostics::Debug::CONTEXT_FLAGS;

use crate::registers::{DebugRegisters, RegisterContext};

/// `CONTEXT_FULL | CONTEXT_DEBUG_REGISTERS` for the host architecture.
#[cfg(target_arch = "x86_64")]
pub(crate) fn full_context_flags() -> CONTEXT_FLAGS
{
    CONTEXT_FULL_AMD64 | CONTEXT_DEBUG_REGISTERS_AMD64
}

#[cfg(target_arch = "x86")]
pub(crate) fn full_context_flags() -> CONTEXT_FLAGS
{
    CONTEXT_FULL_X86 | CONTEXT_DEBUG_REGISTERS_X86
}

/// Native register context of one thread.
#[derive(Clone, Copy)]
pub struct WindowsContext
{
    raw: CONTEXT,
}

impl WindowsContext
{
    /// Empty record with the flags `GetThreadContext` must fill in.
    #[must_use]
    pub fn request() -> Self
    {
        let mut raw = CONTEXT::default();
        raw.ContextFlags = full_context_flags();
        Self { raw }
    }

    #[must_use]
    pub fn raw(&self) -> &CONTEXT
    {
        &self.raw
    }

    pub fn raw_mut(&mut self) -> &mut CONTEXT
    {
        &mut self.raw
    }
}

impl std::fmt::Debug for WindowsContext
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        f.debug_struct("WindowsContext")
            .field("ip", &format_args!("0x{:x}", self.instruction_pointer()))
            .field("flags", &format_args!("0x{:x}", self.flags()))
            .field("debug", &self.debug_registers())
            .finish()
    }
}

#[cfg(target_arch = "x86_64")]
impl RegisterContext for WindowsContext
{
    fn instruction_pointer(&self) -> u64
    {
        self.raw.Rip
    }

    fn set_instruction_pointer(&mut self, value: u64)
    {
        self.raw.Rip = value;
    }

    fn flags(&self) -> u32
    {
        self.raw.EFlags
    }

    fn set_flags(&mut self, value: u32)
    {
        self.raw.EFlags = value;
    }

    fn debug_registers(&self) -> DebugRegisters
    {
        DebugRegisters {
            address: [self.raw.Dr0, self.raw.Dr1, self.raw.Dr2, self.raw.Dr3],
            status: self.raw.Dr6,
            control: self.raw.Dr7,
        }
    }

    fn set_debug_registers(&mut self, registers: &DebugRegisters)
    {
        self.raw.Dr0 = registers.address[0];
        self.raw.Dr1 = registers.address[1];
        self.raw.Dr2 = registers.address[2];
        self.raw.Dr3 = registers.address[3];
        self.raw.Dr6 = registers.status;
        self.raw.Dr7 = registers.control;
    }
}

#[cfg(target_arch = "x86")]
impl RegisterContext for WindowsContext
{
    fn instruction_pointer(&self) -> u64
    {
        u64::from(self.raw.Eip)
    }

    fn set_instruction_pointer(&mut self, value: u64)
    {
        self.raw.Eip = value as u32;
    }

    fn flags(&self) -> u32
    {
        self.raw.EFlags
    }

    fn set_flags(&mut self, value: u32)
    {
        self.raw.EFlags = value;
    }

    fn debug_registers(&self) -> DebugRegisters
    {
        DebugRegisters {
            address: [
                u64::from(self.raw.Dr0),
                u64::from(self.raw.Dr1),
                u64::from(self.raw.Dr2),
                u64::from(self.raw.Dr3),
            ],
            status: u64::from(self.raw.Dr6),
            control: u64::from(self.raw.Dr7),
        }
    }

    fn set_debug_registers(&mut self, registers: &DebugRegisters)
    {
        self.raw.Dr0 = registers.address[0] as u32;
        self.raw.Dr1 = registers.address[1] as u32;
        self.raw.Dr2 = registers.address[2] as u32;
        self.raw.Dr3 = registers.address[3] as u32;
        self.raw.Dr6 = registers.status as u32;
        self.raw.Dr7 = registers.control as u32;
    }
}
