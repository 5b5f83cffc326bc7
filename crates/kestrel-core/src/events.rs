//! Engine event types and helpers.
//!
//! The engine reports what happened in the target through `tracing` and,
//! when a sender is installed with `Engine::set_event_sender`, through a
//! channel of [`EngineEvent`] values. Front ends consume the channel instead of
//! scraping logs.

use std::sync::mpsc;

use crate::registers::HardwareCondition;
use crate::types::{Address, ProcessId, ThreadId};

/// `EXCEPTION_BREAKPOINT`
pub const EXCEPTION_BREAKPOINT: u32 = 0x8000_0003;
/// `EXCEPTION_SINGLE_STEP`
pub const EXCEPTION_SINGLE_STEP: u32 = 0x8000_0004;
/// `EXCEPTION_ACCESS_VIOLATION`
pub const EXCEPTION_ACCESS_VIOLATION: u32 = 0xC000_0005;
/// `EXCEPTION_GUARD_PAGE`
pub const EXCEPTION_GUARD_PAGE: u32 = 0x8000_0001;
/// `STATUS_WX86_BREAKPOINT` (32-bit target under WoW64)
pub const STATUS_WX86_BREAKPOINT: u32 = 0x4000_001F;
/// `STATUS_WX86_SINGLE_STEP` (32-bit target under WoW64)
pub const STATUS_WX86_SINGLE_STEP: u32 = 0x4000_001E;

/// Closed classification of an exception code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionKind
{
    Breakpoint,
    SingleStep,
    AccessViolation,
    GuardPage,
    /// `STATUS_WX86_*` raised by 32-bit code under WoW64. The native context
    /// the engine holds does not describe that code, so nothing is rewritten.
    Wow64(u32),
    /// Any other code, passed on to the target.
    Other(u32),
}

impl ExceptionKind
{
    #[must_use]
    pub const fn from_code(code: u32) -> Self
    {
        match code {
            EXCEPTION_BREAKPOINT => Self::Breakpoint,
            EXCEPTION_SINGLE_STEP => Self::SingleStep,
            STATUS_WX86_BREAKPOINT | STATUS_WX86_SINGLE_STEP => Self::Wow64(code),
            EXCEPTION_ACCESS_VIOLATION => Self::AccessViolation,
            EXCEPTION_GUARD_PAGE => Self::GuardPage,
            other => Self::Other(other),
        }
    }
}

impl std::fmt::Display for ExceptionKind
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        match self {
            Self::Breakpoint => write!(f, "breakpoint"),
            Self::SingleStep => write!(f, "single step"),
            Self::AccessViolation => write!(f, "access violation"),
            Self::GuardPage => write!(f, "guard page"),
            Self::Wow64(STATUS_WX86_BREAKPOINT) => write!(f, "WoW64 breakpoint"),
            Self::Wow64(_) => write!(f, "WoW64 single step"),
            Self::Other(code) => write!(f, "exception 0x{code:08x}"),
        }
    }
}

/// Event emitted by the engine while processing debug events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent
{
    ProcessCreated
    {
        pid: ProcessId,
        image_base: Address,
        entry_point: Address,
    },
    ProcessExited
    {
        pid: ProcessId,
        exit_code: u32,
    },
    ThreadCreated
    {
        thread: ThreadId,
    },
    ThreadExited
    {
        thread: ThreadId,
        exit_code: u32,
    },
    ModuleLoaded
    {
        base: Address,
    },
    ModuleUnloaded
    {
        base: Address,
    },
    DebugString
    {
        thread: ThreadId,
        address: Address,
        length: u16,
    },
    Rip
    {
        thread: ThreadId,
        error: u32,
    },
    /// The loader's breakpoint raised once the process is initialised.
    InitialBreakpoint
    {
        thread: ThreadId,
        address: Address,
    },
    /// `INT3` compiled into the target (e.g. `DebugBreak`), not one of ours.
    EmbeddedBreakpoint
    {
        thread: ThreadId,
        address: Address,
    },
    SoftwareBreakpointHit
    {
        thread: ThreadId,
        address: Address,
        /// Number of times this breakpoint has fired, this hit included
        hits: u64,
    },
    HardwareBreakpointHit
    {
        thread: ThreadId,
        slot: usize,
        address: Address,
        condition: HardwareCondition,
        /// The breakpoint was one-shot and has been deleted
        removed: bool,
    },
    MemoryBreakpointHit
    {
        thread: ThreadId,
        /// Start address of the struck memory breakpoint
        breakpoint: Address,
        /// Instruction that performed the access
        address: Address,
        /// Data address that was touched, when the OS reports it
        accessed: Option<Address>,
    },
    AccessViolation
    {
        thread: ThreadId,
        address: Address,
        accessed: Option<Address>,
        first_chance: bool,
    },
    /// Guard-page fault that no memory breakpoint claimed.
    GuardPage
    {
        thread: ThreadId,
        address: Address,
        accessed: Option<Address>,
    },
    /// Breakpoint or single step from 32-bit code under WoW64.
    Wow64Exception
    {
        thread: ThreadId,
        code: u32,
        address: Address,
    },
    UnhandledException
    {
        thread: ThreadId,
        code: u32,
        address: Address,
    },
}

impl EngineEvent
{
    /// Human-readable description of the event.
    #[must_use]
    pub fn describe(&self) -> String
    {
        match self {
            Self::ProcessCreated {
                pid,
                image_base,
                entry_point,
            } => format!("Process {pid} created (image base {image_base}, entry point {entry_point})"),
            Self::ProcessExited { pid, exit_code } => {
                format!("Process {pid} exited with code: {exit_code}")
            }
            Self::ThreadCreated { thread } => format!("Thread {thread} created"),
            Self::ThreadExited { thread, exit_code } => {
                format!("Thread {thread} exited with code: {exit_code}")
            }
            Self::ModuleLoaded { base } => format!("Module loaded at {base}"),
            Self::ModuleUnloaded { base } => format!("Module unloaded from {base}"),
            Self::DebugString {
                thread,
                address,
                length,
            } => format!("Debug string of {length} bytes at {address} (thread {thread})"),
            Self::Rip { thread, error } => format!("RIP event with error {error} (thread {thread})"),
            Self::InitialBreakpoint { thread, address } => {
                format!("Initial breakpoint at {address} (thread {thread})")
            }
            Self::EmbeddedBreakpoint { thread, address } => {
                format!("Breakpoint instruction in target code at {address} (thread {thread})")
            }
            Self::SoftwareBreakpointHit {
                thread,
                address,
                hits,
            } => format!("Hit breakpoint at {address} (thread {thread}, hit #{hits})"),
            Self::HardwareBreakpointHit {
                thread,
                slot,
                address,
                condition,
                removed,
            } => {
                let mut description =
                    format!("Hit hardware breakpoint {slot} ({condition}) at {address} (thread {thread})");
                if *removed {
                    description.push_str(", removed");
                }
                description
            }
            Self::MemoryBreakpointHit {
                thread,
                breakpoint,
                address,
                accessed,
            } => {
                let mut description =
                    format!("Hit memory breakpoint {breakpoint} from {address} (thread {thread})");
                if let Some(data) = accessed {
                    description.push_str(&format!(", accessed {data}"));
                }
                description
            }
            Self::AccessViolation {
                thread,
                address,
                accessed,
                first_chance,
            } => {
                let chance = if *first_chance { "first" } else { "second" };
                let mut description =
                    format!("Access violation at {address} ({chance} chance, thread {thread})");
                if let Some(data) = accessed {
                    description.push_str(&format!(", accessing {data}"));
                }
                description
            }
            Self::GuardPage {
                thread,
                address,
                accessed,
            } => {
                let mut description = format!("Guard page hit at {address} (thread {thread})");
                if let Some(data) = accessed {
                    description.push_str(&format!(", accessing {data}"));
                }
                description
            }
            Self::Wow64Exception {
                thread,
                code,
                address,
            } => format!(
                "{} at {address} in 32-bit code (thread {thread})",
                ExceptionKind::from_code(*code)
            ),
            Self::UnhandledException {
                thread,
                code,
                address,
            } => format!("Exception 0x{code:08x} at {address} not handled (thread {thread})"),
        }
    }
}

/// Sender side of the engine event channel.
pub type EngineEventSender = mpsc::Sender<EngineEvent>;
/// Receiver side of the engine event channel.
pub type EngineEventReceiver = mpsc::Receiver<EngineEvent>;

/// Create a new engine event channel.
#[must_use]
pub fn event_channel() -> (EngineEventSender, EngineEventReceiver)
{
    mpsc::channel()
}
