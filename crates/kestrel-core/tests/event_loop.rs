mod common;

use common::*;
use kestrel_core::breakpoints::TRAP_OPCODE;
use kestrel_core::events::{
    event_channel, EngineEvent, ExceptionKind, EXCEPTION_ACCESS_VIOLATION, STATUS_WX86_BREAKPOINT,
    STATUS_WX86_SINGLE_STEP,
};
use kestrel_core::platform::{ContinueStatus, DebugEventKind, RawDebugEvent};
use kestrel_core::registers::RegisterContext;
use kestrel_core::session::LoopState;
use kestrel_core::types::{Address, ProcessId, ThreadId};
use kestrel_core::{DebuggerError, Engine, EngineConfig};

#[test]
fn test_launch_and_break_at_entry_point()
{
    let mut api = FakeApi::new();
    api.map_region(IMAGE_BASE + 0x1000, 0x2000, PAGE_EXECUTE_READ);
    api.poke(ENTRY_POINT, &[0x55, 0x48, 0x89, 0xe5]);
    let mut engine = Engine::new(api);

    let pid = engine.launch("C:\\target\\app.exe").unwrap();
    assert_eq!(pid, PID);
    assert!(engine.session().is_active());

    engine.api_mut().push_process_created();
    let created = engine.process_next_event().unwrap();
    assert_eq!(
        created.reported,
        Some(EngineEvent::ProcessCreated {
            pid: PID,
            image_base: Address::new(IMAGE_BASE),
            entry_point: Address::new(ENTRY_POINT),
        })
    );
    assert_eq!(engine.entry_point(), Some(Address::new(ENTRY_POINT)));
    assert_eq!(engine.image_base(), Some(Address::new(IMAGE_BASE)));

    let entry = engine.entry_point().unwrap();
    engine.set_software_breakpoint(entry).unwrap();

    engine.api_mut().push_breakpoint(MAIN_THREAD, LOADER_BREAKPOINT);
    let initial = engine.process_next_event().unwrap();
    assert_eq!(initial.exception, Some(ExceptionKind::Breakpoint));
    assert_eq!(
        initial.reported,
        Some(EngineEvent::InitialBreakpoint {
            thread: MAIN_THREAD,
            address: Address::new(LOADER_BREAKPOINT),
        })
    );
    assert!(engine.session().initial_breakpoint_seen());

    engine.api_mut().push_breakpoint(MAIN_THREAD, ENTRY_POINT);
    let hit = engine.process_next_event().unwrap();
    assert!(matches!(hit.reported, Some(EngineEvent::SoftwareBreakpointHit { hits: 1, .. })));
    assert_eq!(hit.disposition, ContinueStatus::Continue);
    assert_eq!(engine.api().last_continue(), Some((PID, MAIN_THREAD, ContinueStatus::Continue)));
    assert_eq!(engine.session().state(), LoopState::WaitingForEvent);
    assert_eq!(engine.session().outstanding_event(), None);
    let last = engine.session().last_exception().unwrap();
    assert_eq!(last.kind, ExceptionKind::Breakpoint);
    assert_eq!(last.address, entry);
}

#[test]
fn test_launch_failure()
{
    let mut api = FakeApi::new();
    api.fail_launch = true;
    let mut engine = Engine::new(api);

    let result = engine.launch("C:\\missing.exe");

    match result {
        Err(DebuggerError::LaunchFailed { path, source }) => {
            assert_eq!(path, "C:\\missing.exe");
            assert_eq!(source.call, "CreateProcessW");
        }
        other => panic!("expected LaunchFailed, got {other:?}"),
    }
    assert!(!engine.is_attached());
    assert!(!engine.session().is_active());
}

#[test]
fn test_attach_and_detach()
{
    let mut engine = Engine::new(FakeApi::new());

    engine.attach(PID).unwrap();
    assert!(engine.api().attached);
    assert_eq!(engine.process_id(), Some(PID));
    assert_eq!(engine.page_size(), Some(PAGE_SIZE));

    engine.detach().unwrap();
    assert!(engine.api().detached);
    assert!(!engine.is_attached());
    assert!(!engine.session().is_active());
    assert_eq!(engine.api().open_process_handles, 0);
}

#[test]
fn test_attach_failures_release_handle()
{
    let mut api = FakeApi::new();
    api.fail_attach = true;
    let mut engine = Engine::new(api);

    let refused = engine.attach(PID);
    assert!(matches!(refused, Err(DebuggerError::AttachFailed { pid, .. }) if pid == PID));
    assert_eq!(engine.api().open_process_handles, 0);

    let unknown = engine.attach(ProcessId(4242));
    assert!(matches!(unknown, Err(DebuggerError::AttachFailed { .. })));
    assert!(!engine.is_attached());
}

#[test]
fn test_second_target_is_rejected()
{
    let mut engine = launched_engine(EngineConfig::default());

    let again = engine.attach(PID);
    let relaunch = engine.launch("C:\\other.exe");

    assert!(matches!(again, Err(DebuggerError::AlreadyAttached(pid)) if pid == PID));
    assert!(matches!(relaunch, Err(DebuggerError::AlreadyAttached(_))));
}

#[test]
fn test_detach_without_target()
{
    let mut engine = Engine::new(FakeApi::new());

    assert!(matches!(engine.detach(), Err(DebuggerError::NotAttached)));
    assert!(matches!(engine.process_next_event(), Err(DebuggerError::NotAttached)));
}

#[test]
fn test_detach_restores_target()
{
    let mut engine = launched_engine(EngineConfig::default());
    engine.api_mut().push_breakpoint(MAIN_THREAD, LOADER_BREAKPOINT);
    engine.process_next_event().unwrap();

    engine.set_software_breakpoint(Address::new(ENTRY_POINT)).unwrap();
    engine.set_software_breakpoint(Address::new(ENTRY_POINT + 2)).unwrap();
    engine.set_hardware_breakpoint(Address::new(0x60_0000), 4, 1).unwrap();
    engine.set_memory_breakpoint(Address::new(0x60_1000), 0x20).unwrap();
    // Leave the thread mid step-over.
    engine.api_mut().push_breakpoint(MAIN_THREAD, ENTRY_POINT + 2);
    engine.process_next_event().unwrap();
    assert!(engine.api().context(MAIN_THREAD).trap_flag());

    engine.detach().unwrap();

    assert_eq!(engine.api().byte(ENTRY_POINT), 0x55);
    assert_eq!(engine.api().byte(ENTRY_POINT + 2), 0x89);
    let context = engine.api().context(MAIN_THREAD);
    assert!(!context.trap_flag());
    assert_eq!(context.debug.control, 0);
    for page in [0x60_0000, 0x60_1000] {
        assert!(!engine.api().protection(page).is_guarded());
    }
    assert!(engine.software_breakpoints().is_empty());
    assert!(engine.hardware_breakpoints().is_empty());
    assert!(engine.memory_breakpoints().is_empty());
}

#[test]
fn test_access_violation_is_not_handled()
{
    let mut engine = launched_engine(EngineConfig::default());
    engine
        .api_mut()
        .push_exception(MAIN_THREAD, EXCEPTION_ACCESS_VIOLATION, ENTRY_POINT, &[1, 0]);

    let outcome = engine.process_next_event().unwrap();

    assert_eq!(outcome.exception, Some(ExceptionKind::AccessViolation));
    assert_eq!(outcome.disposition, ContinueStatus::NotHandled);
    assert_eq!(
        outcome.reported,
        Some(EngineEvent::AccessViolation {
            thread: MAIN_THREAD,
            address: Address::new(ENTRY_POINT),
            accessed: Some(Address::ZERO),
            first_chance: true,
        })
    );
    assert_eq!(engine.api().last_continue(), Some((PID, MAIN_THREAD, ContinueStatus::NotHandled)));
}

#[test]
fn test_unknown_exception_is_not_handled()
{
    let mut engine = launched_engine(EngineConfig::default());
    // STATUS_INTEGER_DIVIDE_BY_ZERO
    engine.api_mut().push_exception(MAIN_THREAD, 0xC000_0094, ENTRY_POINT, &[]);

    let outcome = engine.process_next_event().unwrap();

    assert_eq!(outcome.exception, Some(ExceptionKind::Other(0xC000_0094)));
    assert_eq!(outcome.disposition, ContinueStatus::NotHandled);
    assert!(matches!(
        outcome.reported,
        Some(EngineEvent::UnhandledException { code: 0xC000_0094, .. })
    ));
}

#[test]
fn test_wow64_breakpoint_leaves_context_alone()
{
    let mut engine = launched_engine(EngineConfig::default());
    engine.set_software_breakpoint(Address::new(ENTRY_POINT)).unwrap();
    let before = engine.api().context(MAIN_THREAD).clone();
    let writes = engine.api().context_writes;

    engine.api_mut().push_exception(MAIN_THREAD, STATUS_WX86_BREAKPOINT, ENTRY_POINT, &[]);
    let outcome = engine.process_next_event().unwrap();

    assert_eq!(outcome.exception, Some(ExceptionKind::Wow64(STATUS_WX86_BREAKPOINT)));
    assert_eq!(outcome.disposition, ContinueStatus::Continue);
    assert_eq!(
        outcome.reported,
        Some(EngineEvent::Wow64Exception {
            thread: MAIN_THREAD,
            code: STATUS_WX86_BREAKPOINT,
            address: Address::new(ENTRY_POINT),
        })
    );
    assert_eq!(engine.api().context(MAIN_THREAD), &before);
    assert_eq!(engine.api().context_writes, writes);
    assert_eq!(engine.api().byte(ENTRY_POINT), TRAP_OPCODE);
    assert!(engine.session().pending_steps(MAIN_THREAD).is_empty());
    assert_eq!(engine.software_breakpoints().get(Address::new(ENTRY_POINT)).unwrap().hits, 0);
}

#[test]
fn test_wow64_single_step_is_not_handled()
{
    let mut engine = launched_engine(EngineConfig::default());

    engine.api_mut().push_exception(MAIN_THREAD, STATUS_WX86_SINGLE_STEP, ENTRY_POINT, &[]);
    let outcome = engine.process_next_event().unwrap();

    assert_eq!(outcome.disposition, ContinueStatus::NotHandled);
    assert!(matches!(outcome.reported, Some(EngineEvent::Wow64Exception { .. })));
    assert!(outcome.reported.unwrap().describe().contains("WoW64 single step"));
}

#[test]
fn test_breakpoint_after_initial_one_is_embedded()
{
    let mut engine = launched_engine(EngineConfig::default());
    engine.api_mut().push_breakpoint(MAIN_THREAD, LOADER_BREAKPOINT);
    engine.process_next_event().unwrap();

    engine.api_mut().push_breakpoint(MAIN_THREAD, 0x40_1800);
    let outcome = engine.process_next_event().unwrap();

    assert_eq!(outcome.disposition, ContinueStatus::Continue);
    assert!(matches!(outcome.reported, Some(EngineEvent::EmbeddedBreakpoint { .. })));
}

#[test]
fn test_other_process_events_are_passed_through()
{
    let mut engine = launched_engine(EngineConfig::default());
    engine.api_mut().events.push_back(RawDebugEvent {
        process_id: ProcessId(2000),
        thread_id: ThreadId(2001),
        kind: DebugEventKind::LoadDll {
            base: Address::new(0x7ff0_0000),
        },
    });

    let outcome = engine.process_next_event().unwrap();

    assert_eq!(outcome.disposition, ContinueStatus::Continue);
    assert_eq!(outcome.reported, None);
    assert_eq!(
        engine.api().last_continue(),
        Some((ProcessId(2000), ThreadId(2001), ContinueStatus::Continue))
    );
}

#[test]
fn test_non_exception_events_are_reported()
{
    let mut engine = launched_engine(EngineConfig::default());
    let worker = ThreadId(1002);
    engine.api_mut().add_thread(worker);
    engine.api_mut().push_event(
        MAIN_THREAD,
        DebugEventKind::LoadDll {
            base: Address::new(0x7ffa_0000_0000),
        },
    );
    engine.api_mut().push_event(
        MAIN_THREAD,
        DebugEventKind::OutputDebugString {
            address: Address::new(0x60_0000),
            length: 12,
            unicode: false,
        },
    );
    engine.api_mut().push_event(worker, DebugEventKind::ExitThread { exit_code: 3 });
    engine.api_mut().push_event(MAIN_THREAD, DebugEventKind::Unknown(42));

    let reported: Vec<Option<EngineEvent>> = (0..4)
        .map(|_| engine.process_next_event().unwrap().reported)
        .collect();

    assert_eq!(
        reported,
        vec![
            Some(EngineEvent::ModuleLoaded {
                base: Address::new(0x7ffa_0000_0000)
            }),
            Some(EngineEvent::DebugString {
                thread: MAIN_THREAD,
                address: Address::new(0x60_0000),
                length: 12,
            }),
            Some(EngineEvent::ThreadExited {
                thread: worker,
                exit_code: 3
            }),
            None,
        ]
    );
}

#[test]
fn test_run_loop_ends_when_process_exits()
{
    let mut engine = launched_engine(EngineConfig::default());
    engine.set_software_breakpoint(Address::new(ENTRY_POINT)).unwrap();
    engine.api_mut().push_breakpoint(MAIN_THREAD, LOADER_BREAKPOINT);
    engine.api_mut().push_breakpoint(MAIN_THREAD, ENTRY_POINT);
    engine.api_mut().push_single_step(MAIN_THREAD, ENTRY_POINT + 1);
    engine.api_mut().push_process_exit(0);

    engine.run_loop().unwrap();

    assert!(!engine.session().is_active());
    assert_eq!(engine.session().state(), LoopState::Inactive);
    assert!(!engine.is_attached());
    assert!(engine.software_breakpoints().is_empty());
    assert_eq!(engine.api().open_process_handles, 0);
    assert_eq!(engine.api().continued.len(), 5);
    // Trap was re-armed before the process went away.
    assert_eq!(engine.api().byte(ENTRY_POINT), TRAP_OPCODE);
}

#[test]
fn test_run_loop_stops_on_wait_failure()
{
    let mut engine = launched_engine(EngineConfig::default());

    // The event script is empty, so the next wait fails.
    let result = engine.run_loop();

    assert!(matches!(result, Err(DebuggerError::WaitFailed(_))));
}

#[test]
fn test_continue_failure_is_fatal()
{
    let mut engine = launched_engine(EngineConfig::default());
    engine.api_mut().fail_continue = true;
    engine.api_mut().push_event(MAIN_THREAD, DebugEventKind::Unknown(42));

    let result = engine.run_loop();

    assert!(matches!(result, Err(DebuggerError::ContinueFailed { thread, .. }) if thread == MAIN_THREAD));
}

#[test]
fn test_resume_without_outstanding_event()
{
    let mut engine = launched_engine(EngineConfig::default());

    let result = engine.resume(ContinueStatus::Continue);

    assert!(matches!(result, Err(DebuggerError::InvalidArgument(_))));
}

#[test]
fn test_events_are_published_on_channel()
{
    let mut engine = launched_engine(EngineConfig::default());
    let (sender, receiver) = event_channel();
    engine.set_event_sender(sender);
    engine.api_mut().push_breakpoint(MAIN_THREAD, LOADER_BREAKPOINT);
    engine.api_mut().push_process_exit(7);

    engine.run_loop().unwrap();

    let events: Vec<EngineEvent> = receiver.try_iter().collect();
    assert_eq!(
        events,
        vec![
            EngineEvent::InitialBreakpoint {
                thread: MAIN_THREAD,
                address: Address::new(LOADER_BREAKPOINT),
            },
            EngineEvent::ProcessExited { pid: PID, exit_code: 7 },
        ]
    );
    assert_eq!(events[1].describe(), "Process 1000 exited with code: 7");
}

#[test]
fn test_context_access_through_engine()
{
    let mut engine = launched_engine(EngineConfig::default());

    let mut context = engine.get_context(MAIN_THREAD).unwrap();
    context.set_instruction_pointer(0x40_1004);
    engine.set_context(MAIN_THREAD, &context).unwrap();

    assert_eq!(engine.api().context(MAIN_THREAD).instruction_pointer(), 0x40_1004);
    assert_eq!(engine.enumerate_threads(PID).unwrap(), vec![MAIN_THREAD]);
    assert_eq!(engine.api().open_thread_handles, 0);

    engine.api_mut().fail_context_read.insert(MAIN_THREAD);
    assert!(matches!(
        engine.get_context(MAIN_THREAD),
        Err(DebuggerError::ContextReadFailed { .. })
    ));
    assert!(matches!(
        engine.get_context(ThreadId(9999)),
        Err(DebuggerError::ThreadHandleUnavailable { .. })
    ));
    assert_eq!(engine.api().open_thread_handles, 0);
}
