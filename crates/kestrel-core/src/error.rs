//! # Error Types
//!
//! Every fallible engine operation returns [`DebuggerError`]. Failures that
//! originate in the operating system keep the [`OsError`] as their source, so
//! the rendered message always carries the platform's last-error code.
//!
//! We use `thiserror` to derive `Error` and the display messages.

use thiserror::Error;

use crate::platform::OsError;
use crate::types::{Address, ProcessId, ThreadId};

/// Main error type for engine operations
///
/// ## Error Categories
///
/// 1. **Process control**: LaunchFailed, AttachFailed, DetachFailed, NotAttached, AlreadyAttached
/// 2. **Threads and contexts**: ThreadSnapshotFailed, NoThreads, ThreadHandleUnavailable,
///    ContextReadFailed, ContextWriteFailed
/// 3. **Memory**: MemoryReadFailed, MemoryWriteFailed, RegionQueryFailed, ProtectionChangeFailed
/// 4. **Breakpoints**: InvalidBreakpointLength, InvalidBreakpointCondition, NoFreeHardwareSlot,
///    UnknownSlot, NoBreakpoint
/// 5. **Event loop**: WaitFailed, ContinueFailed
#[derive(Error, Debug)]
pub enum DebuggerError
{
    /// Creating the debugged process, or opening its handle, failed.
    ///
    /// The session stays un-attached.
    #[error("Failed to launch {path}: {source}")]
    LaunchFailed
    {
        /// Executable that was requested
        path: String,
        /// Platform failure
        #[source]
        source: OsError,
    },

    /// Opening the process or the debug attach request failed.
    #[error("Failed to attach to process {pid}: {source}")]
    AttachFailed
    {
        /// Requested process
        pid: ProcessId,
        /// Platform failure
        #[source]
        source: OsError,
    },

    /// The OS refused to stop debugging the target.
    #[error("Failed to detach from process {pid}: {source}")]
    DetachFailed
    {
        /// Attached process
        pid: ProcessId,
        /// Platform failure
        #[source]
        source: OsError,
    },

    /// Operation needs an attached target.
    ///
    /// Call `launch()` or `attach()` first.
    #[error("Not attached to a process")]
    NotAttached,

    /// The engine manages a single target; detach before attaching again.
    #[error("Already debugging process {0}")]
    AlreadyAttached(ProcessId),

    /// The system thread snapshot could not be taken.
    ///
    /// Distinct from [`DebuggerError::NoThreads`]: here we know nothing about
    /// the thread list.
    #[error("Failed to snapshot threads of process {pid}: {source}")]
    ThreadSnapshotFailed
    {
        /// Process whose threads were requested
        pid: ProcessId,
        /// Platform failure
        #[source]
        source: OsError,
    },

    /// The snapshot succeeded but the process owns no threads.
    #[error("Process {0} has no threads")]
    NoThreads(ProcessId),

    /// `OpenThread` failed for the given thread.
    #[error("Could not obtain a handle to thread {thread}: {source}")]
    ThreadHandleUnavailable
    {
        /// Thread that was requested
        thread: ThreadId,
        /// Platform failure
        #[source]
        source: OsError,
    },

    /// Reading the register context of a thread failed.
    #[error("Failed to read context of thread {thread}: {source}")]
    ContextReadFailed
    {
        /// Thread that was read
        thread: ThreadId,
        /// Platform failure
        #[source]
        source: OsError,
    },

    /// Writing the register context of a thread failed.
    #[error("Failed to write context of thread {thread}: {source}")]
    ContextWriteFailed
    {
        /// Thread that was written
        thread: ThreadId,
        /// Platform failure
        #[source]
        source: OsError,
    },

    /// The read failed or returned fewer bytes than requested.
    #[error("Failed to read memory at {address}: {reason}")]
    MemoryReadFailed
    {
        /// Start of the requested range
        address: Address,
        /// Platform error or short-count description
        reason: String,
    },

    /// The write failed or stored fewer bytes than requested.
    #[error("Failed to write memory at {address}: {reason}")]
    MemoryWriteFailed
    {
        /// Start of the requested range
        address: Address,
        /// Platform error or short-count description
        reason: String,
    },

    /// Hardware breakpoints watch 1, 2 or 4 bytes.
    #[error("Invalid hardware breakpoint length {0} (expected 1, 2 or 4)")]
    InvalidBreakpointLength(usize),

    /// Hardware breakpoints trigger on execute (0), write (1) or read/write (3).
    #[error("Invalid hardware breakpoint condition {0} (expected 0, 1 or 3)")]
    InvalidBreakpointCondition(u32),

    /// All four debug address registers are in use.
    ///
    /// Delete a hardware breakpoint or fall back to a software breakpoint.
    #[error("No free hardware breakpoint slot (maximum 4)")]
    NoFreeHardwareSlot,

    /// Delete requested for a slot without a recorded breakpoint.
    #[error("No hardware breakpoint in slot {0}")]
    UnknownSlot(usize),

    /// No software or memory breakpoint at the address.
    #[error("No breakpoint at address {0}")]
    NoBreakpoint(Address),

    /// `VirtualQueryEx` failed or returned a truncated record.
    #[error("Failed to query memory region at {address}: {source}")]
    RegionQueryFailed
    {
        /// Queried address
        address: Address,
        /// Platform failure
        #[source]
        source: OsError,
    },

    /// `VirtualProtectEx` failed for a page.
    #[error("Failed to change protection at {address}: {source}")]
    ProtectionChangeFailed
    {
        /// Page whose protection was being changed
        address: Address,
        /// Platform failure
        #[source]
        source: OsError,
    },

    /// Waiting for the next debug event failed.
    #[error("Failed to wait for debug event: {0}")]
    WaitFailed(#[source] OsError),

    /// Handing the outstanding event back to the OS failed.
    #[error("Failed to continue thread {thread}: {source}")]
    ContinueFailed
    {
        /// Thread of the outstanding event
        thread: ThreadId,
        /// Platform failure
        #[source]
        source: OsError,
    },

    /// Invalid argument passed to an engine function
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl DebuggerError
{
    /// Whether the event loop must stop after this error.
    ///
    /// Only failures of the wait/continue handshake leave the session in a
    /// state the loop cannot recover from.
    #[must_use]
    pub fn is_fatal_for_loop(&self) -> bool
    {
        matches!(
            self,
            Self::WaitFailed(_) | Self::ContinueFailed { .. } | Self::NotAttached
        )
    }
}

/// Convenience type alias for `Result<T, DebuggerError>`
///
/// ```rust
/// use kestrel_core::error::Result;
/// fn foo() -> Result<()>
/// {
///     Ok(())
/// }
/// ```
pub type Result<T> = std::result::Result<T, DebuggerError>;
