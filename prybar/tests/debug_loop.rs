//! End-to-end scenarios against the scripted platform: the test plays the
//! CPU by queueing the debug events real hardware would have produced.

use prybar::os::sim::SimPlatform;
use prybar::os::{
    CreatedProcess, DebugEvent, DebugEventKind, ExceptionCode, Protection, RawHandle, RegionKind,
    ThreadContext,
};
use prybar::{Debugger, Error, NoHooks, Process, Settings};
use std::sync::Arc;
use std::time::{Duration, Instant};

const PID: u32 = 42;
const TID: u32 = 1;
const CODE_BASE: u64 = 0x40_1000;

fn target() -> (Arc<SimPlatform>, Arc<Process>) {
    let sim = Arc::new(SimPlatform::new());
    sim.add_process(PID, "target.exe");
    sim.add_region(
        CODE_BASE,
        0x1000,
        Protection::READ | Protection::EXECUTE,
        RegionKind::Image,
    );
    sim.add_thread(TID, ThreadContext::default());
    let process = Arc::new(Process::new(sim.clone()));
    process.open_by_pid(PID).unwrap();
    (sim, process)
}

fn attach(process: &Arc<Process>) -> Debugger {
    Debugger::attach(Arc::clone(process), Settings::default(), Box::new(NoHooks)).unwrap()
}

fn deliver_initial_breakpoint(sim: &SimPlatform, dbg: &Debugger) {
    sim.queue_exception(PID, TID, ExceptionCode::Breakpoint, 0x7FF0_0000, true);
    assert!(dbg.wait_for_initial_breakpoint(Duration::from_secs(2)));
}

fn wait_resumed(dbg: &Debugger) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while dbg.is_paused() {
        assert!(Instant::now() < deadline, "loop never resumed");
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn wait_byte(sim: &SimPlatform, address: u64, expected: u8) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while sim.peek(address, 1)[0] != expected {
        assert!(
            Instant::now() < deadline,
            "byte at {address:#x} never became {expected:#04x}"
        );
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_soft_breakpoint_round_trip() {
    let (sim, process) = target();
    sim.poke(CODE_BASE, &[0x55, 0x8B, 0xEC, 0x83, 0xEC, 0x10]);
    let mut dbg = attach(&process);

    dbg.breakpoints().set_soft(CODE_BASE).unwrap();
    assert_eq!(sim.peek(CODE_BASE, 1), vec![0xCC]);

    deliver_initial_breakpoint(&sim, &dbg);

    // Execution reaches the breakpoint.
    sim.queue_exception(PID, TID, ExceptionCode::Breakpoint, CODE_BASE, true);
    assert!(dbg.wait_until_paused(Duration::from_secs(2)));

    // Parked: the original byte is back and the trap flag is armed for the
    // re-arm single step.
    assert_eq!(sim.peek(CODE_BASE, 1), vec![0x55]);
    let context = dbg.context().unwrap();
    assert_eq!(context.ip, CODE_BASE);
    assert!(context.trap_flag());

    dbg.resume().unwrap();
    wait_resumed(&dbg);

    // The restored instruction retires; the single step re-arms the trap
    // byte without parking.
    sim.set_ip(TID, CODE_BASE + 1);
    sim.queue_exception(PID, TID, ExceptionCode::SingleStep, CODE_BASE + 1, true);
    wait_byte(&sim, CODE_BASE, 0xCC);
    assert!(!dbg.is_paused());

    dbg.stop();
}

#[test]
fn test_initial_breakpoint_skips_registry() {
    let (sim, process) = target();
    sim.poke(CODE_BASE, &[0x55]);
    let mut dbg = attach(&process);

    dbg.breakpoints().set_soft(CODE_BASE).unwrap();

    // The OS-injected breakpoint lands exactly on a registered address; it
    // must still bypass the restore protocol.
    sim.queue_exception(PID, TID, ExceptionCode::Breakpoint, CODE_BASE, true);
    assert!(dbg.wait_for_initial_breakpoint(Duration::from_secs(2)));

    std::thread::sleep(Duration::from_millis(10));
    assert_eq!(sim.peek(CODE_BASE, 1), vec![0xCC]);
    assert_eq!(dbg.breakpoints().soft_count(), 1);
    assert!(!dbg.is_paused());

    dbg.stop();
}

#[test]
fn test_step_over_call() {
    let (sim, process) = target();
    // call 0x401500; mov ecx, eax
    sim.poke(0x40_1020, &[0xE8, 0xDB, 0x04, 0x00, 0x00, 0x8B, 0xC8]);
    sim.poke(0x40_1500, &[0x55, 0xC3]);
    let mut dbg = attach(&process);

    dbg.breakpoints().set_soft(0x40_1020).unwrap();
    deliver_initial_breakpoint(&sim, &dbg);

    sim.queue_exception(PID, TID, ExceptionCode::Breakpoint, 0x40_1020, true);
    assert!(dbg.wait_until_paused(Duration::from_secs(2)));
    assert_eq!(dbg.context().unwrap().ip, 0x40_1020);

    dbg.step_over().unwrap();
    wait_resumed(&dbg);

    // The landing breakpoint is armed on the fall-through.
    wait_byte(&sim, 0x40_1025, 0xCC);

    // The call executes one instruction under the still-set trap flag; that
    // single step only re-arms the original breakpoint.
    sim.set_ip(TID, 0x40_1500);
    sim.queue_exception(PID, TID, ExceptionCode::SingleStep, 0x40_1500, true);
    wait_byte(&sim, 0x40_1020, 0xCC);
    assert!(!dbg.is_paused());

    // The callee returns onto the landing breakpoint.
    sim.queue_exception(PID, TID, ExceptionCode::Breakpoint, 0x40_1025, true);
    assert!(dbg.wait_until_paused(Duration::from_secs(2)));

    // Parked at the fall-through, landing breakpoint removed.
    assert_eq!(dbg.context().unwrap().ip, 0x40_1025);
    assert_eq!(sim.peek(0x40_1025, 1), vec![0x8B]);
    assert!(!dbg.breakpoints().has_soft(0x40_1025));

    dbg.resume().unwrap();
    dbg.stop();
}

#[test]
fn test_step_into_parks_after_one_instruction() {
    let (sim, process) = target();
    sim.poke(CODE_BASE, &[0x55, 0x8B, 0xEC]);
    let mut dbg = attach(&process);

    dbg.breakpoints().set_soft(CODE_BASE).unwrap();
    deliver_initial_breakpoint(&sim, &dbg);

    sim.queue_exception(PID, TID, ExceptionCode::Breakpoint, CODE_BASE, true);
    assert!(dbg.wait_until_paused(Duration::from_secs(2)));

    dbg.step_into().unwrap();
    wait_resumed(&dbg);

    // One instruction retires.
    sim.set_ip(TID, CODE_BASE + 1);
    sim.queue_exception(PID, TID, ExceptionCode::SingleStep, CODE_BASE + 1, true);
    assert!(dbg.wait_until_paused(Duration::from_secs(2)));
    assert_eq!(dbg.context().unwrap().ip, CODE_BASE + 1);
    // The breakpoint re-armed on the way.
    assert_eq!(sim.peek(CODE_BASE, 1), vec![0xCC]);

    dbg.resume().unwrap();
    dbg.stop();
}

#[test]
fn test_break_in_parks_the_loop() {
    let (sim, process) = target();
    let mut dbg = attach(&process);
    deliver_initial_breakpoint(&sim, &dbg);

    dbg.pause().unwrap();
    assert!(dbg.wait_until_paused(Duration::from_secs(2)));
    assert!(dbg.is_paused());
    assert_eq!(dbg.paused_thread().unwrap(), TID);

    dbg.resume().unwrap();
    wait_resumed(&dbg);
    dbg.stop();
}

#[test]
fn test_client_context_mutation_reaches_thread() {
    let (sim, process) = target();
    let mut dbg = attach(&process);
    deliver_initial_breakpoint(&sim, &dbg);

    dbg.pause().unwrap();
    assert!(dbg.wait_until_paused(Duration::from_secs(2)));

    let mut context = dbg.context().unwrap();
    context.gp[0] = 0x1234_5678;
    dbg.set_context(context).unwrap();
    dbg.resume().unwrap();
    wait_resumed(&dbg);

    assert_eq!(sim.context_of(TID).gp[0], 0x1234_5678);
    dbg.stop();
}

#[test]
fn test_target_exit_ends_loop() {
    let (sim, process) = target();
    let mut dbg = attach(&process);
    deliver_initial_breakpoint(&sim, &dbg);

    sim.queue_event(DebugEvent {
        pid: PID,
        tid: TID,
        kind: DebugEventKind::ExitProcess { code: 7 },
    });

    let deadline = Instant::now() + Duration::from_secs(2);
    while !dbg.target_exited() {
        assert!(Instant::now() < deadline, "exit never observed");
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(matches!(dbg.pause(), Err(Error::Terminated)));
    dbg.stop();
}

#[test]
fn test_attach_requires_open_target() {
    let sim = Arc::new(SimPlatform::new());
    let process = Arc::new(Process::new(sim));
    assert!(matches!(
        Debugger::attach(process, Settings::default(), Box::new(NoHooks)),
        Err(Error::NotOpen)
    ));
}

#[test]
fn test_launch_arms_first_instruction_breakpoint() {
    let sim = Arc::new(SimPlatform::new());
    sim.add_thread(TID, ThreadContext::default());
    sim.add_region(CODE_BASE, 0x1000, Protection::READ | Protection::EXECUTE, RegionKind::Image);
    sim.add_module("spawned.exe", CODE_BASE, 0x1000);
    // Minimal PE chain resolving the entry point to CODE_BASE + 0x200.
    sim.poke(CODE_BASE, b"MZ");
    sim.poke(CODE_BASE + 0x3C, &0x80u32.to_le_bytes());
    sim.poke(CODE_BASE + 0x80, b"PE\0\0");
    sim.poke(CODE_BASE + 0x80 + 0x18, &0x10Bu16.to_le_bytes());
    sim.poke(CODE_BASE + 0x80 + 0x28, &0x200u32.to_le_bytes());
    sim.poke(CODE_BASE + 0x200, &[0x55]);
    sim.set_spawn(CreatedProcess {
        pid: PID,
        tid: TID,
        process: RawHandle(PID as usize),
        thread: RawHandle(TID as usize),
    });
    // The image is not writable straight away: the first arming attempts
    // come back as partial copies and must be retried.
    sim.fail_writes_at(CODE_BASE + 0x200, 3);

    let mut dbg = Debugger::launch(
        sim.clone(),
        "C:\\sim\\spawned.exe",
        "",
        true,
        Settings::default(),
        Box::new(NoHooks),
    )
    .unwrap();

    wait_byte(&sim, CODE_BASE + 0x200, 0xCC);
    assert!(dbg.breakpoints().has_soft(CODE_BASE + 0x200));
    dbg.stop();
}
