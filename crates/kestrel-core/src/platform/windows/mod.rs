//! # Windows Debug API Backend
//!
//! [`WindowsApi`] implements [`DebugApi`] with the Win32 debugging functions.
//!
//! ## Win32 APIs Used
//!
//! - **CreateProcessW** (`DEBUG_ONLY_THIS_PROCESS`), **OpenProcess**,
//!   **DebugActiveProcess**, **DebugActiveProcessStop**
//! - **WaitForDebugEvent** (`INFINITE`), **ContinueDebugEvent**
//! - **OpenThread**, **GetThreadContext**, **SetThreadContext**
//! - **ReadProcessMemory**, **WriteProcessMemory**, **FlushInstructionCache**
//! - **VirtualQueryEx**, **VirtualProtectEx**
//! - **CreateToolhelp32Snapshot** + **Thread32First/Next**
//!
//! ## References
//!
//! - [Debugging Functions](https://learn.microsoft.com/en-us/windows/win32/debug/debugging-functions)
//! - [DEBUG_EVENT](https://learn.microsoft.com/en-us/windows/win32/api/minwinbase/ns-minwinbase-debug_event)

mod context;

use std::ffi::c_void;
use std::mem::size_of;
use std::os::windows::ffi::OsStrExt;
use std::path::Path;

use smallvec::SmallVec;
use tracing::trace;
use windows::core::{PCWSTR, PWSTR};
use windows::Win32::Foundation::{CloseHandle, BOOL, HANDLE, NTSTATUS};
use windows::Win32::System::Diagnostics::Debug::{
    ContinueDebugEvent, DebugActiveProcess, DebugActiveProcessStop, DebugSetProcessKillOnExit, FlushInstructionCache,
    GetThreadContext, ReadProcessMemory, SetThreadContext, WaitForDebugEvent, WriteProcessMemory, DEBUG_EVENT,
};
use windows::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, Thread32First, Thread32Next, TH32CS_SNAPTHREAD, THREADENTRY32,
};
use windows::Win32::System::Memory::{
    VirtualProtectEx, VirtualQueryEx, MEMORY_BASIC_INFORMATION, PAGE_PROTECTION_FLAGS,
};
use windows::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};
use windows::Win32::System::Threading::{
    CreateProcessW, OpenProcess, OpenThread, CREATE_NEW_CONSOLE, DEBUG_ONLY_THIS_PROCESS, INFINITE,
    PROCESS_ALL_ACCESS, PROCESS_INFORMATION, STARTUPINFOW, THREAD_ALL_ACCESS,
};

pub use self::context::WindowsContext;
use super::{
    ContinueStatus, DebugApi, DebugEventKind, ExceptionRecord, LaunchedProcess, OsError, Protection, RawDebugEvent,
    RegionInfo,
};
use crate::types::{Address, ProcessId, ThreadId};

const EXCEPTION_DEBUG_EVENT: u32 = 1;
const CREATE_THREAD_DEBUG_EVENT: u32 = 2;
const CREATE_PROCESS_DEBUG_EVENT: u32 = 3;
const EXIT_THREAD_DEBUG_EVENT: u32 = 4;
const EXIT_PROCESS_DEBUG_EVENT: u32 = 5;
const LOAD_DLL_DEBUG_EVENT: u32 = 6;
const UNLOAD_DLL_DEBUG_EVENT: u32 = 7;
const OUTPUT_DEBUG_STRING_EVENT: u32 = 8;
const RIP_EVENT: u32 = 9;

/// Convert a `windows` crate error into the last-error code it carries.
///
/// Win32 failures arrive as `HRESULT_FROM_WIN32(code)` (`0x8007xxxx`).
fn os_error(call: &'static str, err: &windows::core::Error) -> OsError
{
    let hresult = err.code().0 as u32;
    let code = if hresult & 0xFFFF_0000 == 0x8007_0000 {
        hresult & 0xFFFF
    } else {
        hresult
    };
    OsError::new(call, code)
}

fn close(handle: HANDLE)
{
    if handle.is_invalid() {
        return;
    }
    // SAFETY: the handle is owned by the caller and not used afterwards.
    if let Err(err) = unsafe { CloseHandle(handle) } {
        trace!(error = %err, "CloseHandle failed");
    }
}

/// Win32 implementation of [`DebugApi`].
#[derive(Debug)]
pub struct WindowsApi
{
    page_size: u64,
}

impl Default for WindowsApi
{
    fn default() -> Self
    {
        Self::new()
    }
}

impl WindowsApi
{
    /// Query the system page size once.
    #[must_use]
    pub fn new() -> Self
    {
        let mut info = SYSTEM_INFO::default();
        // SAFETY: `info` is a valid out-pointer for the duration of the call.
        unsafe { GetSystemInfo(&mut info) };
        Self {
            page_size: u64::from(info.dwPageSize),
        }
    }

    fn convert_event(event: &DEBUG_EVENT) -> RawDebugEvent
    {
        // SAFETY: each union arm is read only for the event code that selects it.
        let kind = unsafe {
            match event.dwDebugEventCode.0 {
                EXCEPTION_DEBUG_EVENT => {
                    let info = event.u.Exception;
                    let record = info.ExceptionRecord;
                    let count = (record.NumberParameters as usize).min(record.ExceptionInformation.len());
                    DebugEventKind::Exception {
                        record: ExceptionRecord {
                            code: record.ExceptionCode.0 as u32,
                            address: Address::from(record.ExceptionAddress as u64),
                            parameters: record.ExceptionInformation[..count]
                                .iter()
                                .map(|value| *value as u64)
                                .collect::<SmallVec<_>>(),
                        },
                        first_chance: info.dwFirstChance != 0,
                    }
                }
                CREATE_THREAD_DEBUG_EVENT => {
                    let info = event.u.CreateThread;
                    DebugEventKind::CreateThread {
                        start_address: Address::from(info.lpStartAddress.map_or(0, |f| f as usize as u64)),
                    }
                }
                CREATE_PROCESS_DEBUG_EVENT => {
                    let info = event.u.CreateProcessInfo;
                    // The image file handle belongs to the debugger.
                    close(info.hFile);
                    DebugEventKind::CreateProcess {
                        image_base: Address::from(info.lpBaseOfImage as u64),
                        start_address: Address::from(info.lpStartAddress.map_or(0, |f| f as usize as u64)),
                    }
                }
                EXIT_THREAD_DEBUG_EVENT => DebugEventKind::ExitThread {
                    exit_code: event.u.ExitThread.dwExitCode,
                },
                EXIT_PROCESS_DEBUG_EVENT => DebugEventKind::ExitProcess {
                    exit_code: event.u.ExitProcess.dwExitCode,
                },
                LOAD_DLL_DEBUG_EVENT => {
                    let info = event.u.LoadDll;
                    close(info.hFile);
                    DebugEventKind::LoadDll {
                        base: Address::from(info.lpBaseOfDll as u64),
                    }
                }
                UNLOAD_DLL_DEBUG_EVENT => DebugEventKind::UnloadDll {
                    base: Address::from(event.u.UnloadDll.lpBaseOfDll as u64),
                },
                OUTPUT_DEBUG_STRING_EVENT => {
                    let info = event.u.DebugString;
                    DebugEventKind::OutputDebugString {
                        address: Address::from(info.lpDebugStringData.0 as u64),
                        length: info.nDebugStringLength,
                        unicode: info.fUnicode != 0,
                    }
                }
                RIP_EVENT => {
                    let info = event.u.RipInfo;
                    DebugEventKind::Rip {
                        error: info.dwError,
                        kind: info.dwType.0,
                    }
                }
                other => DebugEventKind::Unknown(other),
            }
        };
        RawDebugEvent {
            process_id: ProcessId(event.dwProcessId),
            thread_id: ThreadId(event.dwThreadId),
            kind,
        }
    }
}

impl DebugApi for WindowsApi
{
    type Context = WindowsContext;
    type ProcessHandle = HANDLE;
    type ThreadHandle = HANDLE;

    fn page_size(&self) -> u64
    {
        self.page_size
    }

    fn create_debugged_process(&mut self, path: &Path) -> Result<LaunchedProcess, OsError>
    {
        let application: Vec<u16> = path.as_os_str().encode_wide().chain(std::iter::once(0)).collect();
        let startup = STARTUPINFOW {
            cb: size_of::<STARTUPINFOW>() as u32,
            ..Default::default()
        };
        let mut info = PROCESS_INFORMATION::default();

        // SAFETY: `application` is NUL-terminated and outlives the call; the
        // startup and process-information records are valid for the call.
        unsafe {
            CreateProcessW(
                PCWSTR(application.as_ptr()),
                PWSTR::null(),
                None,
                None,
                false,
                DEBUG_ONLY_THIS_PROCESS | CREATE_NEW_CONSOLE,
                None,
                PCWSTR::null(),
                &startup,
                &mut info,
            )
        }
        .map_err(|err| os_error("CreateProcessW", &err))?;

        // The engine opens its own handles by identifier.
        close(info.hThread);
        close(info.hProcess);
        Ok(LaunchedProcess {
            process_id: ProcessId(info.dwProcessId),
            thread_id: ThreadId(info.dwThreadId),
        })
    }

    fn open_process(&mut self, pid: ProcessId) -> Result<HANDLE, OsError>
    {
        // SAFETY: plain handle-returning call.
        unsafe { OpenProcess(PROCESS_ALL_ACCESS, false, pid.0) }.map_err(|err| os_error("OpenProcess", &err))
    }

    fn close_process(&mut self, handle: HANDLE)
    {
        close(handle);
    }

    fn debug_active_process(&mut self, pid: ProcessId) -> Result<(), OsError>
    {
        // SAFETY: no pointers involved.
        unsafe { DebugActiveProcess(pid.0) }.map_err(|err| os_error("DebugActiveProcess", &err))?;
        // Detaching must leave the target running.
        // SAFETY: no pointers involved.
        if let Err(err) = unsafe { DebugSetProcessKillOnExit(BOOL::from(false)) } {
            trace!(error = %err, "DebugSetProcessKillOnExit failed");
        }
        Ok(())
    }

    fn debug_active_process_stop(&mut self, pid: ProcessId) -> Result<(), OsError>
    {
        // SAFETY: no pointers involved.
        unsafe { DebugActiveProcessStop(pid.0) }.map_err(|err| os_error("DebugActiveProcessStop", &err))
    }

    fn wait_for_debug_event(&mut self) -> Result<RawDebugEvent, OsError>
    {
        let mut event = DEBUG_EVENT::default();
        // SAFETY: `event` is a valid out-pointer for the duration of the call.
        unsafe { WaitForDebugEvent(&mut event, INFINITE) }.map_err(|err| os_error("WaitForDebugEvent", &err))?;
        Ok(Self::convert_event(&event))
    }

    fn continue_debug_event(&mut self, pid: ProcessId, tid: ThreadId, status: ContinueStatus) -> Result<(), OsError>
    {
        let status = NTSTATUS(status.raw() as i32);
        // SAFETY: no pointers involved.
        unsafe { ContinueDebugEvent(pid.0, tid.0, status) }.map_err(|err| os_error("ContinueDebugEvent", &err))
    }

    fn open_thread(&mut self, tid: ThreadId) -> Result<HANDLE, OsError>
    {
        // SAFETY: plain handle-returning call.
        unsafe { OpenThread(THREAD_ALL_ACCESS, false, tid.0) }.map_err(|err| os_error("OpenThread", &err))
    }

    fn close_thread(&mut self, handle: HANDLE)
    {
        close(handle);
    }

    fn get_thread_context(&mut self, thread: &HANDLE) -> Result<WindowsContext, OsError>
    {
        let mut context = WindowsContext::request();
        // SAFETY: the record is properly aligned and has ContextFlags set.
        unsafe { GetThreadContext(*thread, context.raw_mut()) }.map_err(|err| os_error("GetThreadContext", &err))?;
        Ok(context)
    }

    fn set_thread_context(&mut self, thread: &HANDLE, context: &WindowsContext) -> Result<(), OsError>
    {
        // SAFETY: the record came from GetThreadContext with the same flags.
        unsafe { SetThreadContext(*thread, context.raw()) }.map_err(|err| os_error("SetThreadContext", &err))
    }

    fn read_process_memory(&mut self, process: &HANDLE, address: Address, buffer: &mut [u8]) -> Result<usize, OsError>
    {
        let mut read = 0usize;
        // SAFETY: `buffer` is valid for `buffer.len()` bytes of writes.
        unsafe {
            ReadProcessMemory(
                *process,
                address.value() as *const c_void,
                buffer.as_mut_ptr().cast(),
                buffer.len(),
                Some(&mut read),
            )
        }
        .map_err(|err| os_error("ReadProcessMemory", &err))?;
        Ok(read)
    }

    fn write_process_memory(&mut self, process: &HANDLE, address: Address, data: &[u8]) -> Result<usize, OsError>
    {
        let mut written = 0usize;
        // SAFETY: `data` is valid for `data.len()` bytes of reads.
        unsafe {
            WriteProcessMemory(
                *process,
                address.value() as *const c_void,
                data.as_ptr().cast(),
                data.len(),
                Some(&mut written),
            )
        }
        .map_err(|err| os_error("WriteProcessMemory", &err))?;
        Ok(written)
    }

    fn flush_instruction_cache(&mut self, process: &HANDLE, address: Address, len: usize) -> Result<(), OsError>
    {
        // SAFETY: the range is only used as an address hint by the kernel.
        unsafe { FlushInstructionCache(*process, Some(address.value() as *const c_void), len) }
            .map_err(|err| os_error("FlushInstructionCache", &err))
    }

    fn virtual_query(&mut self, process: &HANDLE, address: Address) -> Result<RegionInfo, OsError>
    {
        let mut info = MEMORY_BASIC_INFORMATION::default();
        let expected = size_of::<MEMORY_BASIC_INFORMATION>();
        // SAFETY: `info` is a valid out-pointer of `expected` bytes.
        let returned =
            unsafe { VirtualQueryEx(*process, Some(address.value() as *const c_void), &mut info, expected) };
        if returned < expected {
            let err = windows::core::Error::from_win32();
            return Err(os_error("VirtualQueryEx", &err));
        }
        Ok(RegionInfo {
            base_address: Address::from(info.BaseAddress as u64),
            region_size: info.RegionSize as u64,
            protection: Protection(info.Protect.0),
        })
    }

    fn virtual_protect(
        &mut self,
        process: &HANDLE,
        address: Address,
        size: u64,
        protection: Protection,
    ) -> Result<Protection, OsError>
    {
        let mut previous = PAGE_PROTECTION_FLAGS::default();
        // SAFETY: `previous` is a valid out-pointer for the duration of the call.
        unsafe {
            VirtualProtectEx(
                *process,
                address.value() as *const c_void,
                size as usize,
                PAGE_PROTECTION_FLAGS(protection.raw()),
                &mut previous,
            )
        }
        .map_err(|err| os_error("VirtualProtectEx", &err))?;
        Ok(Protection(previous.0))
    }

    fn enumerate_threads(&mut self, pid: ProcessId) -> Result<Vec<ThreadId>, OsError>
    {
        // SAFETY: plain handle-returning call; the snapshot is closed below.
        let snapshot = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPTHREAD, 0) }
            .map_err(|err| os_error("CreateToolhelp32Snapshot", &err))?;

        let mut entry = THREADENTRY32 {
            dwSize: size_of::<THREADENTRY32>() as u32,
            ..Default::default()
        };
        let mut threads = Vec::new();
        // SAFETY: `entry` has dwSize set and stays valid across the iteration.
        let mut next = unsafe { Thread32First(snapshot, &mut entry) };
        while next.is_ok() {
            if entry.th32OwnerProcessID == pid.0 {
                threads.push(ThreadId(entry.th32ThreadID));
            }
            // SAFETY: as above.
            next = unsafe { Thread32Next(snapshot, &mut entry) };
        }
        close(snapshot);
        trace!(%pid, count = threads.len(), "thread snapshot");
        Ok(threads)
    }
}
