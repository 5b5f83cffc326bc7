//! Scripted in-memory `DebugApi` used by the integration tests.
//!
//! `FakeApi` simulates one target process: sparse byte-addressed memory,
//! per-page protections, per-thread register contexts and a queue of debug
//! events. Failure injection fields make individual native calls fail.
//!
//! Delivering an event mimics what the CPU/OS would have done before the
//! debugger sees it: a breakpoint leaves the instruction pointer one past the
//! `INT3`, a single step clears the trap flag and a guard-page fault removes
//! `PAGE_GUARD` from the touched page.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::Path;

use kestrel_core::config::EngineConfig;
use kestrel_core::events::{EXCEPTION_BREAKPOINT, EXCEPTION_GUARD_PAGE, EXCEPTION_SINGLE_STEP};
use kestrel_core::platform::{
    ContinueStatus, DebugApi, DebugEventKind, ExceptionRecord, LaunchedProcess, OsError, Protection, RawDebugEvent,
    RegionInfo, ERROR_ACCESS_DENIED, ERROR_INVALID_PARAMETER, ERROR_NOACCESS,
};
use kestrel_core::registers::{DebugRegisters, RegisterContext};
use kestrel_core::types::{Address, ProcessId, ThreadId};
use kestrel_core::Engine;

pub const PID: ProcessId = ProcessId(1000);
pub const MAIN_THREAD: ThreadId = ThreadId(1001);
pub const PAGE_SIZE: u64 = 0x1000;
pub const IMAGE_BASE: u64 = 0x40_0000;
pub const ENTRY_POINT: u64 = 0x40_1000;
pub const LOADER_BREAKPOINT: u64 = 0x7ffa_0000_1234;

pub const PAGE_READWRITE: u32 = 0x04;
pub const PAGE_EXECUTE_READ: u32 = 0x20;

/// `ERROR_INVALID_ADDRESS`
const ERROR_INVALID_ADDRESS: u32 = 487;
/// `ERROR_SEM_TIMEOUT`, returned when the event script is exhausted
const ERROR_SEM_TIMEOUT: u32 = 121;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FakeContext
{
    pub ip: u64,
    pub flags: u32,
    pub debug: DebugRegisters,
}

impl RegisterContext for FakeContext
{
    fn instruction_pointer(&self) -> u64
    {
        self.ip
    }

    fn set_instruction_pointer(&mut self, value: u64)
    {
        self.ip = value;
    }

    fn flags(&self) -> u32
    {
        self.flags
    }

    fn set_flags(&mut self, value: u32)
    {
        self.flags = value;
    }

    fn debug_registers(&self) -> DebugRegisters
    {
        self.debug
    }

    fn set_debug_registers(&mut self, registers: &DebugRegisters)
    {
        self.debug = *registers;
    }
}

#[derive(Debug)]
pub struct FakeApi
{
    pub page_size: u64,
    pub memory: BTreeMap<u64, u8>,
    /// (base, size) of mapped regions
    pub regions: Vec<(u64, u64)>,
    pub protections: BTreeMap<u64, Protection>,
    pub threads: Vec<ThreadId>,
    pub contexts: BTreeMap<ThreadId, FakeContext>,
    pub events: VecDeque<RawDebugEvent>,

    pub continued: Vec<(ProcessId, ThreadId, ContinueStatus)>,
    pub protect_calls: Vec<(u64, Protection)>,
    pub context_writes: usize,
    pub flushes: usize,
    pub open_thread_handles: i64,
    pub open_process_handles: i64,
    pub attached: bool,
    pub detached: bool,

    pub fail_launch: bool,
    pub fail_open_process: bool,
    pub fail_attach: bool,
    pub fail_detach: bool,
    pub fail_snapshot: bool,
    pub fail_continue: bool,
    pub read_only: HashSet<u64>,
    pub fail_open_thread: HashSet<ThreadId>,
    pub fail_context_read: HashSet<ThreadId>,
    pub fail_context_write: HashSet<ThreadId>,
    pub fail_protect: HashSet<u64>,
    pub fail_query: HashSet<u64>,
}

impl Default for FakeApi
{
    fn default() -> Self
    {
        Self::new()
    }
}

impl FakeApi
{
    /// One process with a single main thread and nothing mapped.
    pub fn new() -> Self
    {
        let mut contexts = BTreeMap::new();
        contexts.insert(
            MAIN_THREAD,
            FakeContext {
                ip: ENTRY_POINT,
                flags: 0x246,
                debug: DebugRegisters::default(),
            },
        );
        Self {
            page_size: PAGE_SIZE,
            memory: BTreeMap::new(),
            regions: Vec::new(),
            protections: BTreeMap::new(),
            threads: vec![MAIN_THREAD],
            contexts,
            events: VecDeque::new(),
            continued: Vec::new(),
            protect_calls: Vec::new(),
            context_writes: 0,
            flushes: 0,
            open_thread_handles: 0,
            open_process_handles: 0,
            attached: false,
            detached: false,
            fail_launch: false,
            fail_open_process: false,
            fail_attach: false,
            fail_detach: false,
            fail_snapshot: false,
            fail_continue: false,
            read_only: HashSet::new(),
            fail_open_thread: HashSet::new(),
            fail_context_read: HashSet::new(),
            fail_context_write: HashSet::new(),
            fail_protect: HashSet::new(),
            fail_query: HashSet::new(),
        }
    }

    /// Map a region of `size` bytes at page-aligned `base`, zero-filled.
    pub fn map_region(&mut self, base: u64, size: u64, protection: u32)
    {
        self.regions.push((base, size));
        for offset in 0..size {
            self.memory.insert(base + offset, 0);
        }
        let mut page = base;
        while page < base + size {
            self.protections.insert(page, Protection(protection));
            page += self.page_size;
        }
    }

    pub fn poke(&mut self, address: u64, bytes: &[u8])
    {
        for (offset, byte) in bytes.iter().enumerate() {
            self.memory.insert(address + offset as u64, *byte);
        }
    }

    pub fn byte(&self, address: u64) -> u8
    {
        self.memory[&address]
    }

    pub fn protection(&self, page: u64) -> Protection
    {
        self.protections[&page]
    }

    pub fn add_thread(&mut self, thread: ThreadId)
    {
        self.threads.push(thread);
        self.contexts.insert(
            thread,
            FakeContext {
                ip: 0x40_2000,
                flags: 0x202,
                debug: DebugRegisters::default(),
            },
        );
    }

    pub fn context(&self, thread: ThreadId) -> &FakeContext
    {
        &self.contexts[&thread]
    }

    pub fn context_mut(&mut self, thread: ThreadId) -> &mut FakeContext
    {
        self.contexts.get_mut(&thread).expect("unknown thread")
    }

    pub fn push_event(&mut self, thread: ThreadId, kind: DebugEventKind)
    {
        self.events.push_back(RawDebugEvent {
            process_id: PID,
            thread_id: thread,
            kind,
        });
    }

    pub fn push_exception(&mut self, thread: ThreadId, code: u32, address: u64, parameters: &[u64])
    {
        let mut record = ExceptionRecord::new(code, Address::new(address));
        record.parameters.extend_from_slice(parameters);
        self.push_event(
            thread,
            DebugEventKind::Exception {
                record,
                first_chance: true,
            },
        );
    }

    pub fn push_breakpoint(&mut self, thread: ThreadId, address: u64)
    {
        self.push_exception(thread, EXCEPTION_BREAKPOINT, address, &[0]);
    }

    pub fn push_single_step(&mut self, thread: ThreadId, address: u64)
    {
        self.push_exception(thread, EXCEPTION_SINGLE_STEP, address, &[]);
    }

    /// Read (0) or write (1) access to `data` from the instruction at `address`.
    pub fn push_guard_page(&mut self, thread: ThreadId, address: u64, write: bool, data: u64)
    {
        self.push_exception(thread, EXCEPTION_GUARD_PAGE, address, &[u64::from(write), data]);
    }

    pub fn push_process_created(&mut self)
    {
        self.push_event(
            MAIN_THREAD,
            DebugEventKind::CreateProcess {
                image_base: Address::new(IMAGE_BASE),
                start_address: Address::new(ENTRY_POINT),
            },
        );
    }

    pub fn push_process_exit(&mut self, exit_code: u32)
    {
        self.push_event(MAIN_THREAD, DebugEventKind::ExitProcess { exit_code });
    }

    pub fn last_continue(&self) -> Option<(ProcessId, ThreadId, ContinueStatus)>
    {
        self.continued.last().copied()
    }

    fn page_of(&self, address: u64) -> u64
    {
        address - address % self.page_size
    }

    fn region_of(&self, address: u64) -> Option<(u64, u64)>
    {
        self.regions
            .iter()
            .copied()
            .find(|(base, size)| address >= *base && address < base + size)
    }

    /// Side effects the processor and kernel apply before reporting `event`.
    fn deliver(&mut self, event: &RawDebugEvent)
    {
        let DebugEventKind::Exception { record, .. } = &event.kind else {
            return;
        };
        let thread = event.thread_id;
        match record.code {
            EXCEPTION_BREAKPOINT => {
                if let Some(context) = self.contexts.get_mut(&thread) {
                    context.ip = record.address.value() + 1;
                }
            }
            EXCEPTION_SINGLE_STEP => {
                if let Some(context) = self.contexts.get_mut(&thread) {
                    context.clear_trap_flag();
                }
            }
            EXCEPTION_GUARD_PAGE => {
                if let Some(data) = record.accessed_address() {
                    let page = self.page_of(data.value());
                    if let Some(protection) = self.protections.get_mut(&page) {
                        *protection = protection.without_guard();
                    }
                }
            }
            _ => {}
        }
    }
}

impl DebugApi for FakeApi
{
    type Context = FakeContext;
    type ProcessHandle = ProcessId;
    type ThreadHandle = ThreadId;

    fn page_size(&self) -> u64
    {
        self.page_size
    }

    fn create_debugged_process(&mut self, _path: &Path) -> Result<LaunchedProcess, OsError>
    {
        if self.fail_launch {
            return Err(OsError::new("CreateProcessW", 2));
        }
        Ok(LaunchedProcess {
            process_id: PID,
            thread_id: MAIN_THREAD,
        })
    }

    fn open_process(&mut self, pid: ProcessId) -> Result<ProcessId, OsError>
    {
        if self.fail_open_process || pid != PID {
            return Err(OsError::new("OpenProcess", ERROR_INVALID_PARAMETER));
        }
        self.open_process_handles += 1;
        Ok(pid)
    }

    fn close_process(&mut self, _handle: ProcessId)
    {
        self.open_process_handles -= 1;
    }

    fn debug_active_process(&mut self, _pid: ProcessId) -> Result<(), OsError>
    {
        if self.fail_attach {
            return Err(OsError::new("DebugActiveProcess", ERROR_ACCESS_DENIED));
        }
        self.attached = true;
        Ok(())
    }

    fn debug_active_process_stop(&mut self, _pid: ProcessId) -> Result<(), OsError>
    {
        if self.fail_detach {
            return Err(OsError::new("DebugActiveProcessStop", ERROR_ACCESS_DENIED));
        }
        self.detached = true;
        Ok(())
    }

    fn wait_for_debug_event(&mut self) -> Result<RawDebugEvent, OsError>
    {
        let event = self
            .events
            .pop_front()
            .ok_or(OsError::new("WaitForDebugEvent", ERROR_SEM_TIMEOUT))?;
        self.deliver(&event);
        Ok(event)
    }

    fn continue_debug_event(&mut self, pid: ProcessId, tid: ThreadId, status: ContinueStatus) -> Result<(), OsError>
    {
        if self.fail_continue {
            return Err(OsError::new("ContinueDebugEvent", ERROR_INVALID_PARAMETER));
        }
        self.continued.push((pid, tid, status));
        Ok(())
    }

    fn open_thread(&mut self, tid: ThreadId) -> Result<ThreadId, OsError>
    {
        if self.fail_open_thread.contains(&tid) || !self.contexts.contains_key(&tid) {
            return Err(OsError::new("OpenThread", ERROR_INVALID_PARAMETER));
        }
        self.open_thread_handles += 1;
        Ok(tid)
    }

    fn close_thread(&mut self, _handle: ThreadId)
    {
        self.open_thread_handles -= 1;
    }

    fn get_thread_context(&mut self, thread: &ThreadId) -> Result<FakeContext, OsError>
    {
        if self.fail_context_read.contains(thread) {
            return Err(OsError::new("GetThreadContext", ERROR_ACCESS_DENIED));
        }
        self.contexts
            .get(thread)
            .cloned()
            .ok_or(OsError::new("GetThreadContext", ERROR_INVALID_PARAMETER))
    }

    fn set_thread_context(&mut self, thread: &ThreadId, context: &FakeContext) -> Result<(), OsError>
    {
        if self.fail_context_write.contains(thread) {
            return Err(OsError::new("SetThreadContext", ERROR_ACCESS_DENIED));
        }
        self.contexts.insert(*thread, context.clone());
        self.context_writes += 1;
        Ok(())
    }

    fn read_process_memory(&mut self, _process: &ProcessId, address: Address, buffer: &mut [u8]) -> Result<usize, OsError>
    {
        let mut read = 0;
        for (offset, slot) in buffer.iter_mut().enumerate() {
            match self.memory.get(&(address.value() + offset as u64)) {
                Some(byte) => {
                    *slot = *byte;
                    read += 1;
                }
                None => break,
            }
        }
        if read == 0 && !buffer.is_empty() {
            return Err(OsError::new("ReadProcessMemory", ERROR_NOACCESS));
        }
        Ok(read)
    }

    fn write_process_memory(&mut self, _process: &ProcessId, address: Address, data: &[u8]) -> Result<usize, OsError>
    {
        let mut written = 0;
        for (offset, byte) in data.iter().enumerate() {
            let target = address.value() + offset as u64;
            if self.read_only.contains(&target) || !self.memory.contains_key(&target) {
                break;
            }
            self.memory.insert(target, *byte);
            written += 1;
        }
        if written == 0 && !data.is_empty() {
            return Err(OsError::new("WriteProcessMemory", ERROR_NOACCESS));
        }
        Ok(written)
    }

    fn flush_instruction_cache(&mut self, _process: &ProcessId, _address: Address, _len: usize) -> Result<(), OsError>
    {
        self.flushes += 1;
        Ok(())
    }

    fn virtual_query(&mut self, _process: &ProcessId, address: Address) -> Result<RegionInfo, OsError>
    {
        let page = self.page_of(address.value());
        if self.fail_query.contains(&page) {
            return Err(OsError::new("VirtualQueryEx", ERROR_INVALID_ADDRESS));
        }
        let (base, size) = self
            .region_of(address.value())
            .ok_or(OsError::new("VirtualQueryEx", ERROR_INVALID_ADDRESS))?;
        Ok(RegionInfo {
            base_address: Address::new(base),
            region_size: size,
            protection: self.protections[&page],
        })
    }

    fn virtual_protect(
        &mut self,
        _process: &ProcessId,
        address: Address,
        size: u64,
        protection: Protection,
    ) -> Result<Protection, OsError>
    {
        let first = self.page_of(address.value());
        let mut page = first;
        while page < address.value() + size {
            if self.fail_protect.contains(&page) || !self.protections.contains_key(&page) {
                return Err(OsError::new("VirtualProtectEx", ERROR_INVALID_ADDRESS));
            }
            page += self.page_size;
        }

        let previous = self.protections[&first];
        let mut page = first;
        while page < address.value() + size {
            self.protections.insert(page, protection);
            page += self.page_size;
        }
        self.protect_calls.push((first, protection));
        Ok(previous)
    }

    fn enumerate_threads(&mut self, pid: ProcessId) -> Result<Vec<ThreadId>, OsError>
    {
        if self.fail_snapshot {
            return Err(OsError::new("CreateToolhelp32Snapshot", ERROR_ACCESS_DENIED));
        }
        if pid != PID {
            return Ok(Vec::new());
        }
        Ok(self.threads.clone())
    }
}

/// Route engine logs to the test harness output; repeated calls are fine.
pub fn init_test_logging()
{
    let _ = kestrel_utils::init_logging_with_level(kestrel_utils::LogLevel::Debug, kestrel_utils::LogFormat::Pretty);
}

/// Engine over `api`, launched and with the creation event processed.
pub fn launched_engine_with(api: FakeApi, config: EngineConfig) -> Engine<FakeApi>
{
    init_test_logging();
    let mut engine = Engine::with_config(api, config);
    engine.launch("C:\\target\\app.exe").expect("launch");
    engine.api_mut().push_process_created();
    engine.process_next_event().expect("process creation event");
    engine
}

/// Launched engine with a code page at the entry point and a data region.
pub fn launched_engine(config: EngineConfig) -> Engine<FakeApi>
{
    let mut api = FakeApi::new();
    api.map_region(IMAGE_BASE + 0x1000, 0x2000, PAGE_EXECUTE_READ);
    api.poke(ENTRY_POINT, &[0x55, 0x48, 0x89, 0xe5]);
    api.map_region(0x60_0000, 0x4000, PAGE_READWRITE);
    launched_engine_with(api, config)
}
