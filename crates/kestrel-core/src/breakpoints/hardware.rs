//! # Hardware Breakpoints
//!
//! Four process-wide breakpoints backed by DR0-DR3. Debug registers are
//! per-thread, so every change is mirrored into each thread of the target
//! (enumerated fresh for every operation) and into threads created later.
//!
//! Multi-thread updates are not atomic at the OS level. The
//! [`ApplyPolicy`] decides what a partial failure means:
//!
//! - `Atomic`: threads already updated get their previous debug registers
//!   back and the operation fails.
//! - `BestEffort`: failures are logged and collected in the [`ApplyReport`];
//!   the bookkeeping is updated anyway.

use tracing::{debug, info, warn};

use crate::config::ApplyPolicy;
use crate::engine::Engine;
use crate::error::{DebuggerError, Result};
use crate::events::EngineEvent;
use crate::platform::{ContinueStatus, DebugApi};
use crate::registers::{DebugRegisters, HardwareCondition, HardwareLength, RegisterContext, SLOT_COUNT};
use crate::threads;
use crate::types::{Address, ThreadId};

/// A programmed debug-register slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardwareBreakpoint
{
    pub slot: usize,
    pub address: Address,
    pub length: HardwareLength,
    pub condition: HardwareCondition,
    /// Deleted on its first hit instead of staying armed
    pub one_shot: bool,
    pub hits: u64,
}

/// Hardware breakpoints by slot.
#[derive(Debug, Default, Clone)]
pub struct HardwareBreakpoints
{
    slots: [Option<HardwareBreakpoint>; SLOT_COUNT],
}

impl HardwareBreakpoints
{
    #[must_use]
    pub fn get(&self, slot: usize) -> Option<&HardwareBreakpoint>
    {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    /// Lowest-numbered unused slot.
    #[must_use]
    pub fn free_slot(&self) -> Option<usize>
    {
        self.slots.iter().position(Option::is_none)
    }

    #[must_use]
    pub fn len(&self) -> usize
    {
        self.slots.iter().flatten().count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool
    {
        self.len() == 0
    }

    /// Breakpoints in slot order.
    pub fn iter(&self) -> impl Iterator<Item = &HardwareBreakpoint>
    {
        self.slots.iter().flatten()
    }

    /// Slot responsible for a debug exception: the first DR6 bit (0..3)
    /// whose slot has a recorded breakpoint.
    #[must_use]
    pub fn firing_slot(&self, registers: &DebugRegisters) -> Option<usize>
    {
        registers.triggered_slots().find(|slot| self.slots[*slot].is_some())
    }

    pub(crate) fn insert(&mut self, breakpoint: HardwareBreakpoint)
    {
        self.slots[breakpoint.slot] = Some(breakpoint);
    }

    pub(crate) fn remove(&mut self, slot: usize) -> Option<HardwareBreakpoint>
    {
        self.slots.get_mut(slot).and_then(Option::take)
    }

    pub(crate) fn record_hit(&mut self, slot: usize) -> Option<HardwareBreakpoint>
    {
        let breakpoint = self.slots.get_mut(slot)?.as_mut()?;
        breakpoint.hits += 1;
        Some(*breakpoint)
    }

    pub(crate) fn clear(&mut self)
    {
        self.slots = [None; SLOT_COUNT];
    }

    /// Program every recorded slot into `registers`.
    fn program(&self, registers: &mut DebugRegisters) -> Result<()>
    {
        for bp in self.iter() {
            registers.enable_slot(bp.slot, bp.address.value(), bp.condition, bp.length)?;
        }
        Ok(())
    }
}

/// Per-thread outcome of a debug-register update.
#[derive(Debug, Default)]
pub struct ApplyReport
{
    /// Threads whose registers now hold the change
    pub applied: Vec<ThreadId>,
    /// Threads that could not be updated
    pub failed: Vec<(ThreadId, DebuggerError)>,
}

impl ApplyReport
{
    #[must_use]
    pub fn is_complete(&self) -> bool
    {
        self.failed.is_empty()
    }
}

impl<A: DebugApi> Engine<A>
{
    /// Install a hardware breakpoint from raw parameters.
    ///
    /// `length` must be 1, 2 or 4 bytes; `condition` is the DR7 RW value
    /// (0 execute, 1 write, 3 read/write). Execute breakpoints always use
    /// a length of one byte, whatever `length` says. The lowest free slot is used.
    /// Whether it is one-shot follows [`crate::config::EngineConfig::hardware_one_shot`].
    ///
    /// ## Errors
    ///
    /// - `InvalidBreakpointLength`, `InvalidBreakpointCondition` before anything is touched
    /// - `NoFreeHardwareSlot` when DR0-DR3 are all taken
    /// - thread errors under [`ApplyPolicy::Atomic`]
    pub fn set_hardware_breakpoint(&mut self, address: Address, length: usize, condition: u32) -> Result<usize>
    {
        let length = HardwareLength::try_from(length)?;
        let condition = HardwareCondition::try_from(condition)?;
        let one_shot = self.config.hardware_one_shot;
        self.install_hardware_breakpoint(address, length, condition, one_shot)
    }

    /// Install a hardware breakpoint and return its slot.
    ///
    /// The CPU requires LEN=00 for instruction breakpoints, so `length` is
    /// replaced by [`HardwareLength::One`] when `condition` is execute.
    ///
    /// ## Errors
    ///
    /// See [`Engine::set_hardware_breakpoint`].
    pub fn install_hardware_breakpoint(
        &mut self,
        address: Address,
        length: HardwareLength,
        condition: HardwareCondition,
        one_shot: bool,
    ) -> Result<usize>
    {
        if self.target.is_none() {
            return Err(DebuggerError::NotAttached);
        }
        let slot = self.hardware.free_slot().ok_or(DebuggerError::NoFreeHardwareSlot)?;
        let length = if condition == HardwareCondition::Execute && length != HardwareLength::One {
            debug!(%address, bytes = length.bytes(), "execute breakpoint narrowed to one byte");
            HardwareLength::One
        } else {
            length
        };

        let report = self.update_debug_registers(|registers| {
            registers.enable_slot(slot, address.value(), condition, length)
        })?;
        if !report.is_complete() {
            warn!(
                slot,
                %address,
                failed = report.failed.len(),
                "hardware breakpoint not applied to every thread"
            );
        }
        self.last_apply_report = Some(report);

        self.hardware.insert(HardwareBreakpoint {
            slot,
            address,
            length,
            condition,
            one_shot,
            hits: 0,
        });
        info!(slot, %address, %condition, bytes = length.bytes(), one_shot, "hardware breakpoint installed");
        Ok(slot)
    }

    /// Clear `slot` in every thread and forget its breakpoint.
    ///
    /// ## Errors
    ///
    /// - `UnknownSlot` if the slot holds no breakpoint
    /// - thread errors under [`ApplyPolicy::Atomic`] (the record is kept)
    pub fn delete_hardware_breakpoint(&mut self, slot: usize) -> Result<()>
    {
        if self.hardware.get(slot).is_none() {
            return Err(DebuggerError::UnknownSlot(slot));
        }
        let report = self.update_debug_registers(|registers| registers.clear_slot(slot))?;
        if !report.is_complete() {
            warn!(slot, failed = report.failed.len(), "hardware breakpoint not cleared on every thread");
        }
        self.last_apply_report = Some(report);
        self.hardware.remove(slot);
        info!(slot, "hardware breakpoint deleted");
        Ok(())
    }

    /// Apply `edit` to the debug registers of every thread of the target.
    fn update_debug_registers<F>(&mut self, mut edit: F) -> Result<ApplyReport>
    where
        F: FnMut(&mut DebugRegisters) -> Result<()>,
    {
        let pid = self.target.as_ref().ok_or(DebuggerError::NotAttached)?.pid;
        let policy = self.config.apply_policy;
        let threads = threads::enumerate(&mut self.api, pid)?;

        let mut report = ApplyReport::default();
        let mut saved: Vec<(ThreadId, DebugRegisters)> = Vec::with_capacity(threads.len());
        for thread in threads {
            match self.edit_thread_registers(thread, &mut edit) {
                Ok(previous) => {
                    saved.push((thread, previous));
                    report.applied.push(thread);
                }
                Err(err) => {
                    warn!(%thread, error = %err, "debug register update failed");
                    report.failed.push((thread, err));
                    if policy == ApplyPolicy::Atomic {
                        break;
                    }
                }
            }
        }

        if policy == ApplyPolicy::Atomic && !report.failed.is_empty() {
            for (thread, previous) in saved.into_iter().rev() {
                if let Err(rollback) = self.edit_thread_registers(thread, &mut |registers| {
                    *registers = previous;
                    Ok(())
                }) {
                    warn!(%thread, error = %rollback, "debug register rollback failed");
                }
            }
            let (_, err) = report.failed.swap_remove(0);
            return Err(err);
        }
        Ok(report)
    }

    /// Read-modify-write one thread's debug registers; returns the previous value.
    fn edit_thread_registers<F>(&mut self, thread: ThreadId, edit: &mut F) -> Result<DebugRegisters>
    where
        F: FnMut(&mut DebugRegisters) -> Result<()>,
    {
        let mut context = threads::get_context(&mut self.api, thread)?;
        let previous = context.debug_registers();
        let mut registers = previous;
        edit(&mut registers)?;
        context.set_debug_registers(&registers);
        threads::set_context(&mut self.api, thread, &context)?;
        Ok(previous)
    }

    /// Single-step exception that may come from DR0-DR3.
    ///
    /// Returns `None` if no recorded slot fired.
    pub(crate) fn handle_hardware_breakpoint(&mut self, thread: ThreadId) -> Option<(ContinueStatus, EngineEvent)>
    {
        let mut context = self.session.last_context()?.clone();
        let mut registers = context.debug_registers();
        let slot = self.hardware.firing_slot(&registers)?;
        let breakpoint = self.hardware.record_hit(slot)?;
        info!(slot, address = %breakpoint.address, %thread, hits = breakpoint.hits, "hardware breakpoint hit");

        // DR6 is never cleared by the CPU.
        registers.clear_status();
        context.set_debug_registers(&registers);
        if !breakpoint.one_shot && breakpoint.condition == HardwareCondition::Execute {
            context.set_resume_flag();
        }
        match threads::set_context(&mut self.api, thread, &context) {
            Ok(()) => self.session.set_context(context),
            Err(err) => warn!(%thread, error = %err, "could not update faulting thread"),
        }

        let mut removed = false;
        if breakpoint.one_shot {
            match self.delete_hardware_breakpoint(slot) {
                Ok(()) => removed = true,
                Err(err) => warn!(slot, error = %err, "could not delete one-shot hardware breakpoint"),
            }
        }

        Some((
            ContinueStatus::Continue,
            EngineEvent::HardwareBreakpointHit {
                thread,
                slot,
                address: breakpoint.address,
                condition: breakpoint.condition,
                removed,
            },
        ))
    }

    /// Program every installed hardware breakpoint into a newly created thread.
    pub(crate) fn propagate_hardware_breakpoints(&mut self, thread: ThreadId)
    {
        if self.hardware.is_empty() {
            return;
        }
        let hardware = self.hardware.clone();
        match self.edit_thread_registers(thread, &mut |registers| hardware.program(registers)) {
            Ok(_) => debug!(%thread, count = hardware.len(), "hardware breakpoints copied to new thread"),
            Err(err) => warn!(%thread, error = %err, "could not program hardware breakpoints into new thread"),
        }
    }

    /// Clear every slot in every thread. Used on detach.
    pub(crate) fn restore_hardware_breakpoints(&mut self)
    {
        let slots: Vec<usize> = self.hardware.iter().map(|bp| bp.slot).collect();
        for slot in slots {
            if let Err(err) = self.delete_hardware_breakpoint(slot) {
                warn!(slot, error = %err, "failed to clear hardware breakpoint");
            }
        }
    }
}
