//! # Debugger Engine
//!
//! [`Engine`] owns the single debugged process, the breakpoint tables and the
//! session state, and runs the debug event loop:
//!
//! 1. wait for the next debug event (blocking, no timeout)
//! 2. snapshot the event thread's registers, debug registers included
//! 3. classify the event and dispatch it
//! 4. hand the disposition back to the OS with `ContinueDebugEvent`
//!
//! The loop is single-threaded. While an event is outstanding every thread of
//! the target is stopped by the OS, which is what makes the multi-thread
//! debug-register updates race-free. The engine is not `Sync`; share it
//! behind a `Mutex` if it must cross threads.
//!
//! ## Lifecycle
//!
//! 1. `Engine::new(api)` / `Engine::with_config(api, config)`
//! 2. `launch(path)` or `attach(pid)`
//! 3. install breakpoints, then `run_loop()` or `process_next_event()`
//! 4. `detach()`, or the target exits

use std::path::Path;

use tracing::{debug, error, info, warn};

use crate::breakpoints::{ApplyReport, HardwareBreakpoints, MemoryBreakpoints, SoftwareBreakpoints};
use crate::config::EngineConfig;
use crate::error::{DebuggerError, Result};
use crate::events::{EngineEvent, EngineEventSender, ExceptionKind, STATUS_WX86_BREAKPOINT};
use crate::platform::{ContinueStatus, DebugApi, DebugEventKind, ExceptionRecord, RawDebugEvent};
use crate::registers::RegisterContext;
use crate::session::{DebugSession, EventOutcome, LoopState, PendingStep};
use crate::threads;
use crate::types::{Address, ProcessId, ThreadId};

/// The debugged process.
#[derive(Debug)]
pub(crate) struct Target<H>
{
    pub(crate) pid: ProcessId,
    pub(crate) handle: H,
    /// Queried once per target
    pub(crate) page_size: u64,
    pub(crate) image_base: Option<Address>,
    pub(crate) entry_point: Option<Address>,
}

/// User-mode debugger engine over a native [`DebugApi`].
pub struct Engine<A: DebugApi>
{
    pub(crate) api: A,
    pub(crate) config: EngineConfig,
    pub(crate) target: Option<Target<A::ProcessHandle>>,
    pub(crate) session: DebugSession<A::Context>,
    pub(crate) software: SoftwareBreakpoints,
    pub(crate) hardware: HardwareBreakpoints,
    pub(crate) memory: MemoryBreakpoints,
    pub(crate) last_apply_report: Option<ApplyReport>,
    events: Option<EngineEventSender>,
}

impl<A: DebugApi> std::fmt::Debug for Engine<A>
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        f.debug_struct("Engine")
            .field("pid", &self.process_id())
            .field("state", &self.session.state())
            .field("software", &self.software.len())
            .field("hardware", &self.hardware.len())
            .field("memory", &self.memory.len())
            .finish_non_exhaustive()
    }
}

impl<A: DebugApi> Engine<A>
{
    /// Engine with the default configuration.
    pub fn new(api: A) -> Self
    {
        Self::with_config(api, EngineConfig::default())
    }

    pub fn with_config(api: A, config: EngineConfig) -> Self
    {
        Self {
            api,
            config,
            target: None,
            session: DebugSession::default(),
            software: SoftwareBreakpoints::default(),
            hardware: HardwareBreakpoints::default(),
            memory: MemoryBreakpoints::default(),
            last_apply_report: None,
            events: None,
        }
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig
    {
        &self.config
    }

    /// Change the configuration. Affects breakpoints installed afterwards.
    pub fn set_config(&mut self, config: EngineConfig)
    {
        self.config = config;
    }

    /// Publish every reported [`EngineEvent`] on `sender`.
    pub fn set_event_sender(&mut self, sender: EngineEventSender)
    {
        self.events = Some(sender);
    }

    #[must_use]
    pub fn api(&self) -> &A
    {
        &self.api
    }

    pub fn api_mut(&mut self) -> &mut A
    {
        &mut self.api
    }

    #[must_use]
    pub fn session(&self) -> &DebugSession<A::Context>
    {
        &self.session
    }

    #[must_use]
    pub fn is_attached(&self) -> bool
    {
        self.target.is_some()
    }

    #[must_use]
    pub fn process_id(&self) -> Option<ProcessId>
    {
        self.target.as_ref().map(|target| target.pid)
    }

    #[must_use]
    pub fn page_size(&self) -> Option<u64>
    {
        self.target.as_ref().map(|target| target.page_size)
    }

    /// Entry point reported by the process-creation event.
    #[must_use]
    pub fn entry_point(&self) -> Option<Address>
    {
        self.target.as_ref().and_then(|target| target.entry_point)
    }

    #[must_use]
    pub fn image_base(&self) -> Option<Address>
    {
        self.target.as_ref().and_then(|target| target.image_base)
    }

    #[must_use]
    pub fn software_breakpoints(&self) -> &SoftwareBreakpoints
    {
        &self.software
    }

    #[must_use]
    pub fn hardware_breakpoints(&self) -> &HardwareBreakpoints
    {
        &self.hardware
    }

    #[must_use]
    pub fn memory_breakpoints(&self) -> &MemoryBreakpoints
    {
        &self.memory
    }

    /// Per-thread outcome of the latest hardware breakpoint set/delete.
    #[must_use]
    pub fn last_apply_report(&self) -> Option<&ApplyReport>
    {
        self.last_apply_report.as_ref()
    }

    /// Start `path` under the debugger.
    ///
    /// ## Errors
    ///
    /// - `AlreadyAttached` if a target is already being debugged
    /// - `LaunchFailed` if the process cannot be created or opened
    pub fn launch(&mut self, path: impl AsRef<Path>) -> Result<ProcessId>
    {
        let path = path.as_ref();
        self.ensure_detached()?;

        let launched = self
            .api
            .create_debugged_process(path)
            .map_err(|source| DebuggerError::LaunchFailed {
                path: path.display().to_string(),
                source,
            })?;
        let handle = self
            .api
            .open_process(launched.process_id)
            .map_err(|source| DebuggerError::LaunchFailed {
                path: path.display().to_string(),
                source,
            })?;

        self.begin_target(launched.process_id, handle);
        info!(pid = %launched.process_id, thread = %launched.thread_id, path = %path.display(), "launched process");
        Ok(launched.process_id)
    }

    /// Attach to the running process `pid`.
    ///
    /// ## Errors
    ///
    /// - `AlreadyAttached` if a target is already being debugged
    /// - `AttachFailed` if the process cannot be opened or debugged
    pub fn attach(&mut self, pid: ProcessId) -> Result<()>
    {
        self.ensure_detached()?;

        let handle = self
            .api
            .open_process(pid)
            .map_err(|source| DebuggerError::AttachFailed { pid, source })?;
        if let Err(source) = self.api.debug_active_process(pid) {
            self.api.close_process(handle);
            return Err(DebuggerError::AttachFailed { pid, source });
        }

        self.begin_target(pid, handle);
        info!(%pid, "attached to process");
        Ok(())
    }

    /// Stop debugging; the target keeps running.
    ///
    /// Installed breakpoints are removed first (failures are logged) and
    /// threads still stepping over a breakpoint lose their trap flag, so the
    /// target is left as it was found.
    ///
    /// ## Errors
    ///
    /// - `NotAttached` without a target
    /// - `ContinueFailed` if an outstanding event cannot be continued
    /// - `DetachFailed` if the OS refuses
    pub fn detach(&mut self) -> Result<()>
    {
        let pid = self.target.as_ref().ok_or(DebuggerError::NotAttached)?.pid;

        self.restore_software_breakpoints();
        self.restore_hardware_breakpoints();
        self.restore_memory_breakpoints();
        self.clear_pending_steps();

        if self.session.outstanding_event().is_some() {
            self.resume(ContinueStatus::Continue)?;
        }
        self.api
            .debug_active_process_stop(pid)
            .map_err(|source| DebuggerError::DetachFailed { pid, source })?;

        self.end_target();
        info!(%pid, "detached from process");
        Ok(())
    }

    /// Run the event loop until the session becomes inactive.
    ///
    /// ## Errors
    ///
    /// Wait and continue failures end the loop; anything a handler runs into
    /// is logged and the loop carries on.
    pub fn run_loop(&mut self) -> Result<()>
    {
        while self.session.is_active() {
            match self.process_next_event() {
                Ok(outcome) => {
                    debug!(disposition = %outcome.disposition, "event processed");
                }
                Err(err) if err.is_fatal_for_loop() => {
                    error!(error = %err, "debug event loop stopped");
                    return Err(err);
                }
                Err(err) => warn!(error = %err, "debug event failed"),
            }
        }
        info!("debug event loop finished");
        Ok(())
    }

    /// One loop iteration: wait, snapshot, classify, dispatch, resume.
    ///
    /// ## Errors
    ///
    /// - `NotAttached` when the session is inactive
    /// - `WaitFailed` / `ContinueFailed` from the OS handshake
    pub fn process_next_event(&mut self) -> Result<EventOutcome>
    {
        if !self.session.is_active() {
            return Err(DebuggerError::NotAttached);
        }

        self.session.set_state(LoopState::WaitingForEvent);
        let event = self.api.wait_for_debug_event().map_err(DebuggerError::WaitFailed)?;
        let context = match threads::get_context(&mut self.api, event.thread_id) {
            Ok(context) => Some(context),
            Err(err) => {
                debug!(thread = %event.thread_id, error = %err, "no context for event thread");
                None
            }
        };
        self.session.begin_event(event.process_id, event.thread_id, context);

        let (disposition, reported) = self.dispatch(&event);

        self.session.set_state(LoopState::Resuming);
        self.resume(disposition)?;

        if matches!(event.kind, DebugEventKind::ExitProcess { .. }) && self.is_target_process(event.process_id) {
            self.end_target();
        } else {
            self.session.set_state(LoopState::WaitingForEvent);
        }

        if let Some(reported) = &reported {
            self.emit(reported.clone());
        }
        let exception = match &event.kind {
            DebugEventKind::Exception { record, .. } => Some(ExceptionKind::from_code(record.code)),
            _ => None,
        };
        Ok(EventOutcome {
            event,
            exception,
            disposition,
            reported,
        })
    }

    /// Continue the outstanding event with `disposition`.
    ///
    /// ## Errors
    ///
    /// - `InvalidArgument` if no event is outstanding
    /// - `ContinueFailed` if the OS call fails
    pub fn resume(&mut self, disposition: ContinueStatus) -> Result<()>
    {
        let (pid, thread) = self
            .session
            .take_outstanding()
            .ok_or_else(|| DebuggerError::InvalidArgument("no debug event is awaiting continuation".into()))?;
        self.api
            .continue_debug_event(pid, thread, disposition)
            .map_err(|source| DebuggerError::ContinueFailed { thread, source })?;
        debug!(%pid, %thread, %disposition, "continued debug event");
        Ok(())
    }

    fn dispatch(&mut self, event: &RawDebugEvent) -> (ContinueStatus, Option<EngineEvent>)
    {
        let thread = event.thread_id;
        if !self.is_target_process(event.process_id) {
            debug!(pid = %event.process_id, "event from a process other than the target");
            let disposition = match event.kind {
                DebugEventKind::Exception { .. } => ContinueStatus::NotHandled,
                _ => ContinueStatus::Continue,
            };
            return (disposition, None);
        }

        match &event.kind {
            DebugEventKind::Exception { record, first_chance } => self.dispatch_exception(thread, record, *first_chance),
            DebugEventKind::CreateProcess {
                image_base,
                start_address,
            } => {
                if let Some(target) = self.target.as_mut() {
                    target.image_base = Some(*image_base);
                    target.entry_point = Some(*start_address);
                }
                info!(pid = %event.process_id, %image_base, entry = %start_address, "process created");
                (
                    ContinueStatus::Continue,
                    Some(EngineEvent::ProcessCreated {
                        pid: event.process_id,
                        image_base: *image_base,
                        entry_point: *start_address,
                    }),
                )
            }
            DebugEventKind::CreateThread { start_address } => {
                debug!(%thread, %start_address, "thread created");
                self.propagate_hardware_breakpoints(thread);
                (ContinueStatus::Continue, Some(EngineEvent::ThreadCreated { thread }))
            }
            DebugEventKind::ExitThread { exit_code } => {
                debug!(%thread, exit_code, "thread exited");
                self.session.take_pending(thread);
                (
                    ContinueStatus::Continue,
                    Some(EngineEvent::ThreadExited {
                        thread,
                        exit_code: *exit_code,
                    }),
                )
            }
            DebugEventKind::ExitProcess { exit_code } => {
                info!(pid = %event.process_id, exit_code, "process exited");
                (
                    ContinueStatus::Continue,
                    Some(EngineEvent::ProcessExited {
                        pid: event.process_id,
                        exit_code: *exit_code,
                    }),
                )
            }
            DebugEventKind::LoadDll { base } => {
                debug!(%base, "module loaded");
                (ContinueStatus::Continue, Some(EngineEvent::ModuleLoaded { base: *base }))
            }
            DebugEventKind::UnloadDll { base } => {
                debug!(%base, "module unloaded");
                (ContinueStatus::Continue, Some(EngineEvent::ModuleUnloaded { base: *base }))
            }
            DebugEventKind::OutputDebugString { address, length, .. } => (
                ContinueStatus::Continue,
                Some(EngineEvent::DebugString {
                    thread,
                    address: *address,
                    length: *length,
                }),
            ),
            DebugEventKind::Rip { error, .. } => {
                warn!(%thread, error, "RIP event");
                (ContinueStatus::Continue, Some(EngineEvent::Rip { thread, error: *error }))
            }
            DebugEventKind::Unknown(code) => {
                debug!(code, "unknown debug event");
                (ContinueStatus::Continue, None)
            }
        }
    }

    fn dispatch_exception(
        &mut self,
        thread: ThreadId,
        record: &ExceptionRecord,
        first_chance: bool,
    ) -> (ContinueStatus, Option<EngineEvent>)
    {
        let kind = ExceptionKind::from_code(record.code);
        self.session.record_exception(kind, record.code, record.address);
        debug!(%thread, %kind, address = %record.address, first_chance, "exception");

        match kind {
            ExceptionKind::Breakpoint => {
                self.session.set_state(LoopState::HandlingBreakpoint);
                let (disposition, reported) = self.handle_breakpoint(thread, record.address);
                (disposition, Some(reported))
            }
            ExceptionKind::SingleStep => {
                self.session.set_state(LoopState::HandlingSingleStep);
                self.handle_single_step(thread, record)
            }
            ExceptionKind::AccessViolation => {
                self.session.set_state(LoopState::HandlingAccessViolation);
                let accessed = record.accessed_address();
                warn!(%thread, address = %record.address, ?accessed, first_chance, "access violation");
                (
                    ContinueStatus::NotHandled,
                    Some(EngineEvent::AccessViolation {
                        thread,
                        address: record.address,
                        accessed,
                        first_chance,
                    }),
                )
            }
            ExceptionKind::GuardPage => {
                self.session.set_state(LoopState::HandlingGuardPage);
                let (disposition, reported) = self.handle_guard_page(thread, record);
                (disposition, Some(reported))
            }
            ExceptionKind::Wow64(code) => {
                self.session.set_state(LoopState::Unclassified);
                // The 32-bit instruction pointer is already past the INT3.
                let disposition = if code == STATUS_WX86_BREAKPOINT {
                    ContinueStatus::Continue
                } else {
                    ContinueStatus::NotHandled
                };
                if self.software.contains(record.address) {
                    warn!(%thread, address = %record.address, "software breakpoint hit in 32-bit code is not stepped over");
                }
                debug!(%thread, address = %record.address, %disposition, "WoW64 exception");
                (
                    disposition,
                    Some(EngineEvent::Wow64Exception {
                        thread,
                        code,
                        address: record.address,
                    }),
                )
            }
            ExceptionKind::Other(code) => {
                self.session.set_state(LoopState::Unclassified);
                (
                    ContinueStatus::NotHandled,
                    Some(EngineEvent::UnhandledException {
                        thread,
                        code,
                        address: record.address,
                    }),
                )
            }
        }
    }

    fn handle_breakpoint(&mut self, thread: ThreadId, address: Address) -> (ContinueStatus, EngineEvent)
    {
        if let Some(handled) = self.handle_software_breakpoint(thread, address) {
            return handled;
        }
        if self.session.claim_initial_breakpoint() {
            info!(%thread, %address, "initial breakpoint");
            return (ContinueStatus::Continue, EngineEvent::InitialBreakpoint { thread, address });
        }
        // The instruction pointer is already past the INT3.
        debug!(%thread, %address, "breakpoint instruction in target code");
        (ContinueStatus::Continue, EngineEvent::EmbeddedBreakpoint { thread, address })
    }

    /// Finishes queued step-overs, then looks for a hardware breakpoint.
    /// A single step that is neither belongs to the target.
    fn handle_single_step(&mut self, thread: ThreadId, record: &ExceptionRecord) -> (ContinueStatus, Option<EngineEvent>)
    {
        let pending = self.session.take_pending(thread);
        for step in &pending {
            match *step {
                PendingStep::RearmSoftware(address) => self.rearm_software_breakpoint(address),
                PendingStep::RearmGuard(page) => self.rearm_guard_page(page),
            }
        }

        if let Some((disposition, reported)) = self.handle_hardware_breakpoint(thread) {
            return (disposition, Some(reported));
        }

        if pending.is_empty() {
            debug!(%thread, address = %record.address, "single step not raised by this engine");
            (
                ContinueStatus::NotHandled,
                Some(EngineEvent::UnhandledException {
                    thread,
                    code: record.code,
                    address: record.address,
                }),
            )
        } else {
            (ContinueStatus::Continue, None)
        }
    }

    fn ensure_detached(&self) -> Result<()>
    {
        match &self.target {
            Some(target) => Err(DebuggerError::AlreadyAttached(target.pid)),
            None => Ok(()),
        }
    }

    fn is_target_process(&self, pid: ProcessId) -> bool
    {
        self.target.as_ref().is_some_and(|target| target.pid == pid)
    }

    fn begin_target(&mut self, pid: ProcessId, handle: A::ProcessHandle)
    {
        self.target = Some(Target {
            pid,
            handle,
            page_size: self.api.page_size(),
            image_base: None,
            entry_point: None,
        });
        self.session.activate();
    }

    /// Drop the target: close its handle, forget every breakpoint, deactivate.
    fn end_target(&mut self)
    {
        if let Some(target) = self.target.take() {
            self.api.close_process(target.handle);
        }
        self.software.clear();
        self.hardware.clear();
        self.memory.clear();
        self.last_apply_report = None;
        self.session.deactivate();
    }

    /// Clear the trap flag of threads still stepping over a breakpoint.
    fn clear_pending_steps(&mut self)
    {
        for (thread, _) in self.session.drain_pending() {
            let result = threads::get_context(&mut self.api, thread).and_then(|mut context| {
                context.clear_trap_flag();
                threads::set_context(&mut self.api, thread, &context)
            });
            if let Err(err) = result {
                warn!(%thread, error = %err, "could not clear trap flag");
            }
        }
    }

    fn emit(&mut self, event: EngineEvent)
    {
        if let Some(sender) = &self.events {
            if sender.send(event).is_err() {
                debug!("event receiver dropped");
                self.events = None;
            }
        }
    }
}
