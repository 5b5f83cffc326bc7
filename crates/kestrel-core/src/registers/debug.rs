//! # x86 Debug Registers
//!
//! Encoding of hardware breakpoints into DR0-DR3, DR6 and DR7.
//!
//! ## DR7 layout (per slot `n` in 0..4)
//!
//! | Bits            | Meaning                                   |
//! |-----------------|-------------------------------------------|
//! | `2n`            | local enable                              |
//! | `16 + 4n ..+2`  | RW: 00 execute, 01 write, 11 read/write   |
//! | `18 + 4n ..+2`  | LEN: 00 one byte, 01 two, 11 four         |
//!
//! DR6 bits 0..3 report which slot triggered the last debug exception.

use crate::error::{DebuggerError, Result};

/// Number of hardware breakpoint slots (DR0-DR3).
pub const SLOT_COUNT: usize = 4;

const RW_SHIFT: u32 = 16;
const LEN_SHIFT: u32 = 18;
const SLOT_FIELD_MASK: u64 = 0b1111;

/// What access triggers a hardware breakpoint (DR7 RW field).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum HardwareCondition
{
    /// Instruction fetch
    Execute = 0,
    /// Data write
    Write = 1,
    /// Data read or write
    ReadWrite = 3,
}

impl HardwareCondition
{
    #[must_use]
    pub const fn bits(self) -> u64
    {
        self as u64
    }
}

impl TryFrom<u32> for HardwareCondition
{
    type Error = DebuggerError;

    fn try_from(value: u32) -> Result<Self>
    {
        match value {
            0 => Ok(Self::Execute),
            1 => Ok(Self::Write),
            3 => Ok(Self::ReadWrite),
            other => Err(DebuggerError::InvalidBreakpointCondition(other)),
        }
    }
}

impl std::fmt::Display for HardwareCondition
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        let name = match self {
            Self::Execute => "execute",
            Self::Write => "write",
            Self::ReadWrite => "read/write",
        };
        write!(f, "{name}")
    }
}

/// Size of the watched range (DR7 LEN field).
///
/// The 2-bit field only has four classes; `0b10` (eight bytes) is not used
/// by this engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum HardwareLength
{
    One = 0b00,
    Two = 0b01,
    Four = 0b11,
}

impl HardwareLength
{
    #[must_use]
    pub const fn bits(self) -> u64
    {
        self as u64
    }

    /// Length in bytes.
    #[must_use]
    pub const fn bytes(self) -> usize
    {
        match self {
            Self::One => 1,
            Self::Two => 2,
            Self::Four => 4,
        }
    }
}

impl TryFrom<usize> for HardwareLength
{
    type Error = DebuggerError;

    fn try_from(value: usize) -> Result<Self>
    {
        match value {
            1 => Ok(Self::One),
            2 => Ok(Self::Two),
            4 => Ok(Self::Four),
            other => Err(DebuggerError::InvalidBreakpointLength(other)),
        }
    }
}

/// Snapshot of one thread's debug registers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DebugRegisters
{
    /// DR0-DR3
    pub address: [u64; SLOT_COUNT],
    /// DR6
    pub status: u64,
    /// DR7
    pub control: u64,
}

impl DebugRegisters
{
    fn check_slot(slot: usize) -> Result<()>
    {
        if slot < SLOT_COUNT {
            Ok(())
        } else {
            Err(DebuggerError::InvalidArgument(format!(
                "hardware breakpoint slot {slot} out of range (0-{})",
                SLOT_COUNT - 1
            )))
        }
    }

    /// Program `slot` to watch `address`.
    ///
    /// Any previous condition/length bits of the slot are replaced; other
    /// slots are untouched.
    ///
    /// ## Errors
    ///
    /// `InvalidArgument` if `slot` is not in 0..4.
    pub fn enable_slot(
        &mut self,
        slot: usize,
        address: u64,
        condition: HardwareCondition,
        length: HardwareLength,
    ) -> Result<()>
    {
        Self::check_slot(slot)?;
        let shift = 4 * slot as u32;
        self.address[slot] = address;
        self.control &= !(SLOT_FIELD_MASK << (RW_SHIFT + shift));
        self.control |= condition.bits() << (RW_SHIFT + shift);
        self.control |= length.bits() << (LEN_SHIFT + shift);
        self.control |= 1 << (2 * slot);
        Ok(())
    }

    /// Disable `slot`: clear its enable bit, zero its address register and
    /// clear its condition and length bits.
    ///
    /// ## Errors
    ///
    /// `InvalidArgument` if `slot` is not in 0..4.
    pub fn clear_slot(&mut self, slot: usize) -> Result<()>
    {
        Self::check_slot(slot)?;
        let shift = 4 * slot as u32;
        self.address[slot] = 0;
        self.control &= !(1 << (2 * slot));
        self.control &= !(SLOT_FIELD_MASK << (RW_SHIFT + shift));
        Ok(())
    }

    #[must_use]
    pub fn is_slot_enabled(&self, slot: usize) -> bool
    {
        slot < SLOT_COUNT && self.control & (1 << (2 * slot)) != 0
    }

    /// Slots whose DR6 bit is set, lowest index first.
    pub fn triggered_slots(&self) -> impl Iterator<Item = usize> + '_
    {
        (0..SLOT_COUNT).filter(move |slot| self.status & (1 << slot) != 0)
    }

    /// DR6 is sticky; clear it so the next exception is not misattributed.
    pub fn clear_status(&mut self)
    {
        self.status = 0;
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn enable_slot_sets_expected_bits()
    {
        let mut regs = DebugRegisters::default();
        regs.enable_slot(0, 0x1000, HardwareCondition::Execute, HardwareLength::One)
            .unwrap();
        assert_eq!(regs.address[0], 0x1000);
        assert_eq!(regs.control, 0b1);

        regs.enable_slot(1, 0x2000, HardwareCondition::Write, HardwareLength::Four)
            .unwrap();
        // L1 at bit 2, RW1 = 01 at bits 20-21, LEN1 = 11 at bits 22-23
        assert_eq!(regs.control, 0b1 | 0b100 | (0b01 << 20) | (0b11 << 22));
    }

    #[test]
    fn slot_three_uses_top_fields()
    {
        let mut regs = DebugRegisters::default();
        regs.enable_slot(3, 0xdead, HardwareCondition::ReadWrite, HardwareLength::Two)
            .unwrap();
        assert_eq!(regs.control, (1 << 6) | (0b11 << 28) | (0b01 << 30));
        assert!(regs.is_slot_enabled(3));
        assert!(!regs.is_slot_enabled(0));
    }

    #[test]
    fn clear_slot_leaves_other_slots_alone()
    {
        let mut regs = DebugRegisters::default();
        regs.enable_slot(0, 0x1000, HardwareCondition::Write, HardwareLength::Two)
            .unwrap();
        regs.enable_slot(2, 0x3000, HardwareCondition::ReadWrite, HardwareLength::Four)
            .unwrap();
        let only_slot_two = {
            let mut r = DebugRegisters::default();
            r.enable_slot(2, 0x3000, HardwareCondition::ReadWrite, HardwareLength::Four)
                .unwrap();
            r
        };

        regs.clear_slot(0).unwrap();
        assert_eq!(regs, only_slot_two);

        regs.clear_slot(2).unwrap();
        assert_eq!(regs, DebugRegisters::default());
    }

    #[test]
    fn out_of_range_slot_is_rejected()
    {
        let mut regs = DebugRegisters::default();
        assert!(matches!(
            regs.enable_slot(4, 0, HardwareCondition::Execute, HardwareLength::One),
            Err(DebuggerError::InvalidArgument(_))
        ));
        assert!(regs.clear_slot(7).is_err());
        assert!(!regs.is_slot_enabled(9));
    }

    #[test]
    fn triggered_slots_in_index_order()
    {
        let regs = DebugRegisters {
            status: 0b0101 | (1 << 14),
            ..DebugRegisters::default()
        };
        let slots: Vec<_> = regs.triggered_slots().collect();
        assert_eq!(slots, vec![0, 2]);
    }

    #[test]
    fn length_conversion()
    {
        assert_eq!(HardwareLength::try_from(1).unwrap(), HardwareLength::One);
        assert_eq!(HardwareLength::try_from(2).unwrap(), HardwareLength::Two);
        assert_eq!(HardwareLength::try_from(4).unwrap(), HardwareLength::Four);
        assert_eq!(HardwareLength::Four.bits(), 3);
        assert!(matches!(
            HardwareLength::try_from(3),
            Err(DebuggerError::InvalidBreakpointLength(3))
        ));
        assert!(HardwareLength::try_from(8).is_err());
    }

    #[test]
    fn condition_conversion()
    {
        assert_eq!(HardwareCondition::try_from(0).unwrap(), HardwareCondition::Execute);
        assert_eq!(HardwareCondition::try_from(1).unwrap(), HardwareCondition::Write);
        assert_eq!(HardwareCondition::try_from(3).unwrap(), HardwareCondition::ReadWrite);
        assert!(matches!(
            HardwareCondition::try_from(2),
            Err(DebuggerError::InvalidBreakpointCondition(2))
        ));
        assert!(matches!(
            HardwareCondition::try_from(99),
            Err(DebuggerError::InvalidBreakpointCondition(99))
        ));
    }
}
