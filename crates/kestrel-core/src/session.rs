//! # Debug Session State
//!
//! Per-target state mutated once per processed debug event: whether the
//! loop is active, where the state machine is, the latest register snapshot
//! and exception, and the identifiers of the event still awaiting
//! `ContinueDebugEvent`.
//!
//! ```text
//! Inactive -> WaitingForEvent -> ClassifyingEvent -> Handling* / Unclassified
//!                  ^                                        |
//!                  +--------------- Resuming <--------------+
//! ```

use std::collections::HashMap;

use smallvec::SmallVec;

use crate::events::{EngineEvent, ExceptionKind};
use crate::platform::{ContinueStatus, RawDebugEvent};
use crate::types::{Address, ProcessId, ThreadId};

/// Position of the event loop in its state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopState
{
    #[default]
    Inactive,
    WaitingForEvent,
    ClassifyingEvent,
    HandlingBreakpoint,
    HandlingSingleStep,
    HandlingAccessViolation,
    HandlingGuardPage,
    Unclassified,
    Resuming,
}

/// Work to finish on a thread's next single-step exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingStep
{
    /// Write the trap opcode back at this software breakpoint.
    RearmSoftware(Address),
    /// Put `PAGE_GUARD` back on this page.
    RearmGuard(Address),
}

/// Exception of the most recent exception event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LastException
{
    pub kind: ExceptionKind,
    pub code: u32,
    pub address: Address,
}

/// Result of one event-loop iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventOutcome
{
    /// The event as delivered by the OS
    pub event: RawDebugEvent,
    /// Classification when the event was an exception
    pub exception: Option<ExceptionKind>,
    /// Disposition handed back with `ContinueDebugEvent`
    pub disposition: ContinueStatus,
    /// What the engine reported for this event
    pub reported: Option<EngineEvent>,
}

/// State of the single debug session owned by an engine.
#[derive(Debug, Clone)]
pub struct DebugSession<C>
{
    active: bool,
    state: LoopState,
    context: Option<C>,
    last_exception: Option<LastException>,
    outstanding: Option<(ProcessId, ThreadId)>,
    initial_breakpoint_seen: bool,
    pending: HashMap<ThreadId, SmallVec<[PendingStep; 2]>>,
}

impl<C> Default for DebugSession<C>
{
    fn default() -> Self
    {
        Self {
            active: false,
            state: LoopState::Inactive,
            context: None,
            last_exception: None,
            outstanding: None,
            initial_breakpoint_seen: false,
            pending: HashMap::new(),
        }
    }
}

impl<C> DebugSession<C>
{
    /// Whether the event loop keeps running.
    #[must_use]
    pub fn is_active(&self) -> bool
    {
        self.active
    }

    #[must_use]
    pub fn state(&self) -> LoopState
    {
        self.state
    }

    /// Register snapshot of the thread that raised the latest event.
    #[must_use]
    pub fn last_context(&self) -> Option<&C>
    {
        self.context.as_ref()
    }

    #[must_use]
    pub fn last_exception(&self) -> Option<LastException>
    {
        self.last_exception
    }

    /// Process and thread of the event awaiting continuation.
    #[must_use]
    pub fn outstanding_event(&self) -> Option<(ProcessId, ThreadId)>
    {
        self.outstanding
    }

    #[must_use]
    pub fn initial_breakpoint_seen(&self) -> bool
    {
        self.initial_breakpoint_seen
    }

    /// Threads with single-step work still queued.
    pub fn stepping_threads(&self) -> impl Iterator<Item = ThreadId> + '_
    {
        self.pending.keys().copied()
    }

    #[must_use]
    pub fn pending_steps(&self, thread: ThreadId) -> &[PendingStep]
    {
        self.pending.get(&thread).map(SmallVec::as_slice).unwrap_or_default()
    }

    pub(crate) fn activate(&mut self)
    {
        *self = Self {
            active: true,
            state: LoopState::WaitingForEvent,
            ..Self::default()
        };
    }

    /// Back to `Inactive`, dropping everything tied to the target.
    pub(crate) fn deactivate(&mut self)
    {
        *self = Self::default();
    }

    pub(crate) fn set_state(&mut self, state: LoopState)
    {
        self.state = state;
    }

    pub(crate) fn begin_event(&mut self, pid: ProcessId, tid: ThreadId, context: Option<C>)
    {
        self.outstanding = Some((pid, tid));
        self.context = context;
        self.state = LoopState::ClassifyingEvent;
    }

    pub(crate) fn take_outstanding(&mut self) -> Option<(ProcessId, ThreadId)>
    {
        self.outstanding.take()
    }

    pub(crate) fn set_context(&mut self, context: C)
    {
        self.context = Some(context);
    }

    pub(crate) fn record_exception(&mut self, kind: ExceptionKind, code: u32, address: Address)
    {
        self.last_exception = Some(LastException { kind, code, address });
    }

    /// Returns `true` the first time it is called for this session.
    pub(crate) fn claim_initial_breakpoint(&mut self) -> bool
    {
        !std::mem::replace(&mut self.initial_breakpoint_seen, true)
    }

    pub(crate) fn push_pending(&mut self, thread: ThreadId, step: PendingStep)
    {
        let steps = self.pending.entry(thread).or_default();
        if !steps.contains(&step) {
            steps.push(step);
        }
    }

    pub(crate) fn take_pending(&mut self, thread: ThreadId) -> SmallVec<[PendingStep; 2]>
    {
        self.pending.remove(&thread).unwrap_or_default()
    }

    pub(crate) fn drain_pending(&mut self) -> Vec<(ThreadId, SmallVec<[PendingStep; 2]>)>
    {
        self.pending.drain().collect()
    }
}
