//! Settings and the typed event hooks.

use crate::os::{ContinueStatus, ExceptionCode, ExceptionInfo, Pid, Tid};

/// Pause switches keyed by exception class, plus loop tuning.
#[derive(Debug, Clone)]
pub struct Settings {
    pub pause_on_breakpoint: bool,
    pub pause_on_single_step: bool,
    pub pause_on_access_violation: bool,
    pub pause_on_guard_page: bool,
    pub pause_on_illegal_instruction: bool,
    pub pause_on_int_divide_by_zero: bool,
    pub pause_on_stack_overflow: bool,
    /// Park on any exception delivered a second time.
    pub pause_on_second_chance: bool,
    /// After the initial breakpoint, pass first-chance exceptions straight
    /// back to the target.
    pub ignore_first_chance: bool,
    /// Bounded wait per loop iteration.
    pub event_timeout_ms: u32,
    /// Kill the target when the debugger detaches.
    pub kill_on_exit: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            pause_on_breakpoint: true,
            pause_on_single_step: true,
            pause_on_access_violation: false,
            pause_on_guard_page: false,
            pause_on_illegal_instruction: false,
            pause_on_int_divide_by_zero: false,
            pause_on_stack_overflow: false,
            pause_on_second_chance: false,
            ignore_first_chance: false,
            event_timeout_ms: 1,
            kill_on_exit: false,
        }
    }
}

impl Settings {
    /// Whether this exception class is configured to park the loop.
    pub fn pause_for(&self, code: ExceptionCode) -> bool {
        match code {
            ExceptionCode::Breakpoint => self.pause_on_breakpoint,
            ExceptionCode::SingleStep => self.pause_on_single_step,
            ExceptionCode::AccessViolation => self.pause_on_access_violation,
            ExceptionCode::GuardPage => self.pause_on_guard_page,
            ExceptionCode::IllegalInstruction => self.pause_on_illegal_instruction,
            ExceptionCode::IntDivideByZero => self.pause_on_int_divide_by_zero,
            ExceptionCode::StackOverflow => self.pause_on_stack_overflow,
            _ => false,
        }
    }
}

/// Per-event hooks, all invoked on the loop thread.
///
/// Exception hooks default to letting the target's own handling run;
/// everything else defaults to continuing.
#[allow(unused_variables)]
pub trait EventHooks: Send {
    fn on_exception(&mut self, info: &ExceptionInfo) -> ContinueStatus {
        ContinueStatus::NotHandled
    }

    /// An engine-owned breakpoint was hit (after the transparent restore).
    fn on_breakpoint(&mut self, address: u64) {}

    /// A client-requested step completed.
    fn on_single_step(&mut self, address: u64) {}

    fn on_create_process(&mut self, pid: Pid, base: u64) -> ContinueStatus {
        ContinueStatus::Continue
    }

    fn on_exit_process(&mut self, code: u32) -> ContinueStatus {
        ContinueStatus::Continue
    }

    fn on_create_thread(&mut self, tid: Tid, start: u64) -> ContinueStatus {
        ContinueStatus::Continue
    }

    fn on_exit_thread(&mut self, tid: Tid, code: u32) -> ContinueStatus {
        ContinueStatus::Continue
    }

    fn on_load_dll(&mut self, base: u64, path: Option<&str>) -> ContinueStatus {
        ContinueStatus::Continue
    }

    fn on_unload_dll(&mut self, base: u64) -> ContinueStatus {
        ContinueStatus::Continue
    }

    fn on_output_debug_string(&mut self, message: &str) -> ContinueStatus {
        ContinueStatus::Continue
    }

    fn on_rip(&mut self, error: u32, kind: u32) -> ContinueStatus {
        ContinueStatus::Continue
    }
}

/// The do-nothing hook set.
pub struct NoHooks;

impl EventHooks for NoHooks {}

/// Hook set that narrates every event through the log facade.
pub struct EventLogger;

impl EventHooks for EventLogger {
    fn on_exception(&mut self, info: &ExceptionInfo) -> ContinueStatus {
        log::info!(
            "Exception {:?} at {:#x} ({} chance)",
            info.code,
            info.address,
            if info.first_chance { "first" } else { "second" }
        );
        ContinueStatus::NotHandled
    }

    fn on_breakpoint(&mut self, address: u64) {
        log::info!("Breakpoint hit at {address:#x}");
    }

    fn on_single_step(&mut self, address: u64) {
        log::info!("Step completed at {address:#x}");
    }

    fn on_create_process(&mut self, pid: Pid, base: u64) -> ContinueStatus {
        log::info!("Process {pid} created, image base {base:#x}");
        ContinueStatus::Continue
    }

    fn on_exit_process(&mut self, code: u32) -> ContinueStatus {
        log::info!("Process exited with code {code}");
        ContinueStatus::Continue
    }

    fn on_create_thread(&mut self, tid: Tid, start: u64) -> ContinueStatus {
        log::info!("Thread {tid} created, start {start:#x}");
        ContinueStatus::Continue
    }

    fn on_exit_thread(&mut self, tid: Tid, code: u32) -> ContinueStatus {
        log::info!("Thread {tid} exited with code {code}");
        ContinueStatus::Continue
    }

    fn on_load_dll(&mut self, base: u64, path: Option<&str>) -> ContinueStatus {
        log::info!("Module loaded at {base:#x} ({})", path.unwrap_or("?"));
        ContinueStatus::Continue
    }

    fn on_unload_dll(&mut self, base: u64) -> ContinueStatus {
        log::info!("Module unloaded at {base:#x}");
        ContinueStatus::Continue
    }

    fn on_output_debug_string(&mut self, message: &str) -> ContinueStatus {
        log::info!("Debug string: {message}");
        ContinueStatus::Continue
    }

    fn on_rip(&mut self, error: u32, kind: u32) -> ContinueStatus {
        log::info!("RIP event: error {error}, type {kind}");
        ContinueStatus::Continue
    }
}
