//! # Hardware Breakpoint Builder
//!
//! Fluent configuration of a hardware breakpoint before installation.
//!
//! ```rust,no_run
//! # #[cfg(windows)]
//! # fn demo() -> kestrel_core::error::Result<()> {
//! use kestrel_core::breakpoints::HardwareBreakpointBuilder;
//! use kestrel_core::platform::windows::WindowsApi;
//! use kestrel_core::types::{Address, ProcessId};
//! use kestrel_core::Engine;
//!
//! let mut engine = Engine::new(WindowsApi::new());
//! engine.attach(ProcessId::from(4242))?;
//! let slot = HardwareBreakpointBuilder::write(Address::from(0x7ff6_1000), 4)
//!     .one_shot(true)
//!     .install(&mut engine)?;
//! # let _ = slot;
//! # Ok(())
//! # }
//! ```

use crate::engine::Engine;
use crate::error::Result;
use crate::platform::DebugApi;
use crate::registers::{HardwareCondition, HardwareLength};
use crate::types::Address;

/// Builder for a hardware breakpoint.
///
/// The length is validated at [`HardwareBreakpointBuilder::install`], so an
/// unsupported length surfaces as `InvalidBreakpointLength` like any other
/// installation error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardwareBreakpointBuilder
{
    address: Address,
    length: usize,
    condition: HardwareCondition,
    one_shot: Option<bool>,
}

impl HardwareBreakpointBuilder
{
    /// Break when the instruction at `address` is about to execute.
    #[must_use]
    pub fn execute(address: Address) -> Self
    {
        Self {
            address,
            length: 1,
            condition: HardwareCondition::Execute,
            one_shot: None,
        }
    }

    /// Break after `length` bytes at `address` are written.
    #[must_use]
    pub fn write(address: Address, length: usize) -> Self
    {
        Self {
            address,
            length,
            condition: HardwareCondition::Write,
            one_shot: None,
        }
    }

    /// Break after `length` bytes at `address` are read or written.
    #[must_use]
    pub fn read_write(address: Address, length: usize) -> Self
    {
        Self {
            address,
            length,
            condition: HardwareCondition::ReadWrite,
            one_shot: None,
        }
    }

    #[must_use]
    pub fn with_length(mut self, length: usize) -> Self
    {
        self.length = length;
        self
    }

    /// Delete the breakpoint on its first hit. Without this the engine
    /// configuration decides.
    #[must_use]
    pub fn one_shot(mut self, one_shot: bool) -> Self
    {
        self.one_shot = Some(one_shot);
        self
    }

    #[must_use]
    pub fn address(&self) -> Address
    {
        self.address
    }

    #[must_use]
    pub fn condition(&self) -> HardwareCondition
    {
        self.condition
    }

    /// Install on `engine`, returning the slot.
    ///
    /// ## Errors
    ///
    /// Same as [`Engine::install_hardware_breakpoint`], plus
    /// `InvalidBreakpointLength`.
    pub fn install<A: DebugApi>(self, engine: &mut Engine<A>) -> Result<usize>
    {
        let length = HardwareLength::try_from(self.length)?;
        let one_shot = self.one_shot.unwrap_or(engine.config().hardware_one_shot);
        engine.install_hardware_breakpoint(self.address, length, self.condition, one_shot)
    }
}
