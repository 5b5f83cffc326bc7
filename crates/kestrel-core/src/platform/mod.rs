//! # Native Debugging Boundary
//!
//! The engine never calls the operating system directly. Everything it needs
//! from the OS debugging ABI is expressed by the [`DebugApi`] trait:
//!
//! - process creation in a debugged state, open/attach/detach
//! - the blocking wait-for-event / continue handshake
//! - thread handles and register contexts (including debug registers)
//! - target memory reads/writes and page protection
//! - thread enumeration through a system snapshot
//!
//! - **Windows**: [`windows::WindowsApi`] implements the trait with the Win32
//!   debug API (`WaitForDebugEvent`, `GetThreadContext`, `VirtualProtectEx`, ...)
//!   - See: [Debugging Functions](https://learn.microsoft.com/en-us/windows/win32/debug/debugging-functions)
//!
//! Tests drive the engine through an in-memory implementation of the same
//! trait, which is why the engine is generic over it.

mod error;

#[cfg(windows)]
pub mod windows;

use std::path::Path;

use smallvec::SmallVec;

pub use self::error::{
    OsError, ERROR_ACCESS_DENIED, ERROR_INVALID_HANDLE, ERROR_INVALID_PARAMETER, ERROR_NOACCESS,
    ERROR_PARTIAL_COPY,
};
use crate::registers::RegisterContext;
use crate::types::{Address, ProcessId, ThreadId};

/// `DBG_CONTINUE`
pub const DBG_CONTINUE: u32 = 0x0001_0002;
/// `DBG_EXCEPTION_NOT_HANDLED`
pub const DBG_EXCEPTION_NOT_HANDLED: u32 = 0x8001_0001;

/// `PAGE_GUARD` protection modifier
pub const PAGE_GUARD: u32 = 0x100;

/// Continuation disposition handed back to the OS with the outstanding event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContinueStatus
{
    /// The debugger dealt with the event; the target resumes normally.
    Continue,
    /// The exception is passed on to the target's own handlers / the OS.
    NotHandled,
}

impl ContinueStatus
{
    /// Native value for `ContinueDebugEvent`.
    #[must_use]
    pub const fn raw(self) -> u32
    {
        match self {
            Self::Continue => DBG_CONTINUE,
            Self::NotHandled => DBG_EXCEPTION_NOT_HANDLED,
        }
    }
}

impl std::fmt::Display for ContinueStatus
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        match self {
            Self::Continue => write!(f, "DBG_CONTINUE"),
            Self::NotHandled => write!(f, "DBG_EXCEPTION_NOT_HANDLED"),
        }
    }
}

/// Page protection value (`PAGE_*` constants).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Protection(pub u32);

impl Protection
{
    #[must_use]
    pub const fn raw(self) -> u32
    {
        self.0
    }

    /// Same protection with the guard modifier added.
    #[must_use]
    pub const fn with_guard(self) -> Self
    {
        Self(self.0 | PAGE_GUARD)
    }

    #[must_use]
    pub const fn without_guard(self) -> Self
    {
        Self(self.0 & !PAGE_GUARD)
    }

    #[must_use]
    pub const fn is_guarded(self) -> bool
    {
        self.0 & PAGE_GUARD != 0
    }
}

impl std::fmt::Display for Protection
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        write!(f, "0x{:x}", self.0)
    }
}

/// Result of a region query (`MEMORY_BASIC_INFORMATION` subset).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionInfo
{
    /// Page-aligned start of the region containing the queried address
    pub base_address: Address,
    /// Size of the region in bytes
    pub region_size: u64,
    /// Current protection of the region
    pub protection: Protection,
}

/// Identifiers of a freshly created debugged process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchedProcess
{
    pub process_id: ProcessId,
    pub thread_id: ThreadId,
}

/// Exception details of an exception debug event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionRecord
{
    /// `ExceptionCode`
    pub code: u32,
    /// `ExceptionAddress`: the instruction that raised the exception
    pub address: Address,
    /// `ExceptionInformation[..NumberParameters]`
    pub parameters: SmallVec<[u64; 4]>,
}

impl ExceptionRecord
{
    #[must_use]
    pub fn new(code: u32, address: Address) -> Self
    {
        Self {
            code,
            address,
            parameters: SmallVec::new(),
        }
    }

    /// Data address touched by an access-violation or guard-page fault
    /// (`ExceptionInformation[1]`).
    #[must_use]
    pub fn accessed_address(&self) -> Option<Address>
    {
        self.parameters.get(1).copied().map(Address::from)
    }
}

/// Kind-specific payload of a debug event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebugEventKind
{
    Exception
    {
        record: ExceptionRecord,
        first_chance: bool,
    },
    CreateThread
    {
        start_address: Address,
    },
    CreateProcess
    {
        image_base: Address,
        start_address: Address,
    },
    ExitThread
    {
        exit_code: u32,
    },
    ExitProcess
    {
        exit_code: u32,
    },
    LoadDll
    {
        base: Address,
    },
    UnloadDll
    {
        base: Address,
    },
    OutputDebugString
    {
        address: Address,
        length: u16,
        unicode: bool,
    },
    Rip
    {
        error: u32,
        kind: u32,
    },
    /// Event code this engine does not know.
    Unknown(u32),
}

/// A debug event as delivered by the OS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDebugEvent
{
    pub process_id: ProcessId,
    pub thread_id: ThreadId,
    pub kind: DebugEventKind,
}

/// Operating-system services the engine depends on.
///
/// Every method maps onto a single native primitive and reports failures as
/// [`OsError`]. Implementations perform no bookkeeping of their own; that is
/// the engine's job.
pub trait DebugApi
{
    /// Owned process handle (closed through [`DebugApi::close_process`]).
    type ProcessHandle;
    /// Owned thread handle (closed through [`DebugApi::close_thread`]).
    type ThreadHandle;
    /// Native register context.
    type Context: RegisterContext;

    /// Memory page size of the system.
    fn page_size(&self) -> u64;

    /// Create `path` as a new process under this debugger.
    fn create_debugged_process(&mut self, path: &Path) -> Result<LaunchedProcess, OsError>;

    /// Open a handle with full access rights.
    fn open_process(&mut self, pid: ProcessId) -> Result<Self::ProcessHandle, OsError>;

    fn close_process(&mut self, handle: Self::ProcessHandle);

    /// Attach to a running process as its debugger.
    fn debug_active_process(&mut self, pid: ProcessId) -> Result<(), OsError>;

    /// Stop debugging; the process keeps running.
    fn debug_active_process_stop(&mut self, pid: ProcessId) -> Result<(), OsError>;

    /// Block until the next debug event. No timeout.
    fn wait_for_debug_event(&mut self) -> Result<RawDebugEvent, OsError>;

    fn continue_debug_event(
        &mut self,
        pid: ProcessId,
        tid: ThreadId,
        status: ContinueStatus,
    ) -> Result<(), OsError>;

    /// Open a handle with full access rights.
    fn open_thread(&mut self, tid: ThreadId) -> Result<Self::ThreadHandle, OsError>;

    fn close_thread(&mut self, handle: Self::ThreadHandle);

    /// Full context, general-purpose and debug registers.
    fn get_thread_context(&mut self, thread: &Self::ThreadHandle)
        -> Result<Self::Context, OsError>;

    fn set_thread_context(
        &mut self,
        thread: &Self::ThreadHandle,
        context: &Self::Context,
    ) -> Result<(), OsError>;

    /// Read into `buffer`; returns the number of bytes actually read.
    fn read_process_memory(
        &mut self,
        process: &Self::ProcessHandle,
        address: Address,
        buffer: &mut [u8],
    ) -> Result<usize, OsError>;

    /// Write `data`; returns the number of bytes actually written.
    fn write_process_memory(
        &mut self,
        process: &Self::ProcessHandle,
        address: Address,
        data: &[u8],
    ) -> Result<usize, OsError>;

    /// Flush the instruction cache after patching code.
    fn flush_instruction_cache(
        &mut self,
        _process: &Self::ProcessHandle,
        _address: Address,
        _len: usize,
    ) -> Result<(), OsError>
    {
        Ok(())
    }

    /// Describe the region containing `address`.
    fn virtual_query(
        &mut self,
        process: &Self::ProcessHandle,
        address: Address,
    ) -> Result<RegionInfo, OsError>;

    /// Change protection of `[address, address + size)`; returns the
    /// previous protection.
    fn virtual_protect(
        &mut self,
        process: &Self::ProcessHandle,
        address: Address,
        size: u64,
        protection: Protection,
    ) -> Result<Protection, OsError>;

    /// Threads currently owned by `pid`, in snapshot order.
    fn enumerate_threads(&mut self, pid: ProcessId) -> Result<Vec<ThreadId>, OsError>;
}
