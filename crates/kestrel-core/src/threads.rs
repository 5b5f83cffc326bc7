//! # Thread Context Layer
//!
//! Thread enumeration and register context access. Thread handles are opened
//! per call and closed before returning, whatever the outcome.

use tracing::trace;

use crate::engine::Engine;
use crate::error::{DebuggerError, Result};
use crate::platform::DebugApi;
use crate::types::{ProcessId, ThreadId};

/// Threads of `pid` from a fresh system snapshot.
///
/// A snapshot failure (`ThreadSnapshotFailed`) and an empty result
/// (`NoThreads`) are reported separately.
pub(crate) fn enumerate<A: DebugApi>(api: &mut A, pid: ProcessId) -> Result<Vec<ThreadId>>
{
    let threads = api
        .enumerate_threads(pid)
        .map_err(|source| DebuggerError::ThreadSnapshotFailed { pid, source })?;
    if threads.is_empty() {
        return Err(DebuggerError::NoThreads(pid));
    }
    trace!(%pid, count = threads.len(), "enumerated threads");
    Ok(threads)
}

pub(crate) fn get_context<A: DebugApi>(api: &mut A, thread: ThreadId) -> Result<A::Context>
{
    let handle = api
        .open_thread(thread)
        .map_err(|source| DebuggerError::ThreadHandleUnavailable { thread, source })?;
    let context = api
        .get_thread_context(&handle)
        .map_err(|source| DebuggerError::ContextReadFailed { thread, source });
    api.close_thread(handle);
    context
}

pub(crate) fn set_context<A: DebugApi>(api: &mut A, thread: ThreadId, context: &A::Context) -> Result<()>
{
    let handle = api
        .open_thread(thread)
        .map_err(|source| DebuggerError::ThreadHandleUnavailable { thread, source })?;
    let result = api
        .set_thread_context(&handle, context)
        .map_err(|source| DebuggerError::ContextWriteFailed { thread, source });
    api.close_thread(handle);
    result
}

impl<A: DebugApi> Engine<A>
{
    /// Threads currently owned by `pid`, in snapshot order.
    ///
    /// ## Errors
    ///
    /// - `ThreadSnapshotFailed` if the snapshot cannot be taken
    /// - `NoThreads` if the process owns no threads
    pub fn enumerate_threads(&mut self, pid: ProcessId) -> Result<Vec<ThreadId>>
    {
        enumerate(&mut self.api, pid)
    }

    /// Full register context of `thread`, debug registers included.
    ///
    /// ## Errors
    ///
    /// `ThreadHandleUnavailable` or `ContextReadFailed`.
    pub fn get_context(&mut self, thread: ThreadId) -> Result<A::Context>
    {
        get_context(&mut self.api, thread)
    }

    /// Write `context` back to `thread`.
    ///
    /// ## Errors
    ///
    /// `ThreadHandleUnavailable` or `ContextWriteFailed`.
    pub fn set_context(&mut self, thread: ThreadId, context: &A::Context) -> Result<()>
    {
        set_context(&mut self.api, thread, context)
    }
}
