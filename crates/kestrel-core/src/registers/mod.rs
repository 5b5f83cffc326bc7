//! # Thread Register Context
//!
//! Architecture-neutral view of the register state the engine needs from a
//! thread: instruction pointer, flags and the debug-register file.
//!
//! The platform backend wraps its native context record (`CONTEXT` on
//! Windows) and implements [`RegisterContext`] on it. The breakpoint managers
//! only ever talk to this trait, so they never touch native layouts.
//!
//! ## See Also
//!
//! - [`debug`] - DR0-DR7 encoding
//! - [`crate::platform::DebugApi`] - fetching and storing contexts

pub mod debug;

pub use debug::{DebugRegisters, HardwareCondition, HardwareLength, SLOT_COUNT};

/// EFLAGS trap flag (bit 8). Raises a single-step exception after the next instruction.
pub const TRAP_FLAG: u32 = 1 << 8;

/// EFLAGS resume flag (bit 16). Suppresses instruction breakpoints for one instruction.
pub const RESUME_FLAG: u32 = 1 << 16;

/// Register state of a single stopped thread.
///
/// Implementations are plain value types: reading a context snapshots the
/// thread, and nothing changes in the target until the context is written
/// back through [`crate::platform::DebugApi::set_thread_context`].
pub trait RegisterContext: Clone + std::fmt::Debug
{
    /// Current instruction pointer (RIP/EIP).
    fn instruction_pointer(&self) -> u64;

    /// Overwrite the instruction pointer.
    fn set_instruction_pointer(&mut self, value: u64);

    /// Current flags register (EFLAGS).
    fn flags(&self) -> u32;

    /// Overwrite the flags register.
    fn set_flags(&mut self, value: u32);

    /// Copy of DR0-DR3, DR6 and DR7.
    fn debug_registers(&self) -> DebugRegisters;

    /// Store DR0-DR3, DR6 and DR7.
    fn set_debug_registers(&mut self, registers: &DebugRegisters);

    /// Whether the trap flag is set.
    fn trap_flag(&self) -> bool
    {
        self.flags() & TRAP_FLAG != 0
    }

    /// Arm a single step: the thread traps after its next instruction.
    fn set_trap_flag(&mut self)
    {
        let flags = self.flags();
        self.set_flags(flags | TRAP_FLAG);
    }

    fn clear_trap_flag(&mut self)
    {
        let flags = self.flags();
        self.set_flags(flags & !TRAP_FLAG);
    }

    /// Let the current instruction execute once even if an execute
    /// breakpoint covers it.
    fn set_resume_flag(&mut self)
    {
        let flags = self.flags();
        self.set_flags(flags | RESUME_FLAG);
    }
}
