//! Debug event loop.
//!
//! One dedicated thread attaches to (or creates) the target and consumes
//! debug events. Breakpoint and single-step exceptions are routed through
//! the breakpoint engine's transparent-continue protocol; every other
//! event goes to the hook set. When a pause is warranted the loop snapshots
//! the faulting thread, publishes it as the current target state and parks
//! on a condvar gate until the client releases it.

pub mod events;
mod stepping;

pub use events::{EventHooks, EventLogger, NoHooks, Settings};

use crate::breakpoint::BreakpointEngine;
use crate::context::ContextEdit;
use crate::error::{Error, Result};
use crate::lock;
use crate::os::{
    ContinueStatus, DebugEvent, DebugEventKind, ExceptionCode, ExceptionInfo, Platform,
    ThreadContext, Tid,
};
use crate::patcher::Patcher;
use crate::process::Process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Snapshot of the paused thread, published while the loop is parked.
#[derive(Debug, Clone)]
pub struct TargetState {
    pub thread_id: Tid,
    pub context: ThreadContext,
    pub is_ready: bool,
}

#[derive(Default)]
struct SyncState {
    paused: bool,
    resume_requested: bool,
    initial_bp_seen: bool,
}

/// First-instruction breakpoint arming, retried across loop iterations
/// until the image is mapped and the write lands completely.
enum FirstInst {
    ResolveEntry,
    Arm(u64),
}

enum LaunchMode {
    Attach,
    Create {
        path: String,
        args: String,
        pause_on_first_inst: bool,
    },
}

struct Shared {
    platform: Arc<dyn Platform>,
    process: Arc<Process>,
    breakpoints: BreakpointEngine,
    patcher: Patcher,
    settings: Mutex<Settings>,
    hooks: Mutex<Box<dyn EventHooks>>,
    allowed_to_debug: AtomicBool,
    exited: AtomicBool,
    sync: Mutex<SyncState>,
    cond: Condvar,
    target_state: Mutex<Option<TargetState>>,
    step_request: AtomicBool,
    step_over_bp: Mutex<Option<u64>>,
    first_inst: Mutex<Option<FirstInst>>,
    break_in: AtomicBool,
}

pub struct Debugger {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl Debugger {
    /// Attaches to the already-open target of `process` and starts the loop.
    /// Returns once the loop reported whether the attach succeeded.
    pub fn attach(
        process: Arc<Process>,
        settings: Settings,
        hooks: Box<dyn EventHooks>,
    ) -> Result<Self> {
        if !process.is_open() {
            return Err(Error::NotOpen);
        }
        Self::start(process, settings, hooks, LaunchMode::Attach)
    }

    /// Creates `path` under debug control and starts the loop. With
    /// `pause_on_first_inst` a breakpoint is armed on the image entry point
    /// as soon as it becomes writable.
    pub fn launch(
        platform: Arc<dyn Platform>,
        path: &str,
        args: &str,
        pause_on_first_inst: bool,
        settings: Settings,
        hooks: Box<dyn EventHooks>,
    ) -> Result<Self> {
        let process = Arc::new(Process::new(platform));
        Self::start(
            process,
            settings,
            hooks,
            LaunchMode::Create {
                path: path.to_string(),
                args: args.to_string(),
                pause_on_first_inst,
            },
        )
    }

    fn start(
        process: Arc<Process>,
        settings: Settings,
        hooks: Box<dyn EventHooks>,
        mode: LaunchMode,
    ) -> Result<Self> {
        let platform = Arc::clone(process.platform());
        let shared = Arc::new(Shared {
            platform,
            breakpoints: BreakpointEngine::new(Arc::clone(&process)),
            patcher: Patcher::new(Arc::clone(&process)),
            process,
            settings: Mutex::new(settings),
            hooks: Mutex::new(hooks),
            allowed_to_debug: AtomicBool::new(true),
            exited: AtomicBool::new(false),
            sync: Mutex::new(SyncState::default()),
            cond: Condvar::new(),
            target_state: Mutex::new(None),
            step_request: AtomicBool::new(false),
            step_over_bp: Mutex::new(None),
            first_inst: Mutex::new(None),
            break_in: AtomicBool::new(false),
        });

        let (init_tx, init_rx) = mpsc::channel();
        let loop_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("prybar-debug-loop".to_string())
            .spawn(move || loop_shared.run(mode, init_tx))
            .map_err(|_| Error::Internal {
                reason: "failed to spawn the debug loop thread",
            })?;

        match init_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                shared,
                worker: Some(worker),
            }),
            Ok(Err(err)) => {
                let _ = worker.join();
                Err(err)
            }
            Err(_) => {
                let _ = worker.join();
                Err(Error::Internal {
                    reason: "debug loop died before reporting initialization",
                })
            }
        }
    }

    pub fn process(&self) -> &Arc<Process> {
        &self.shared.process
    }

    pub fn breakpoints(&self) -> &BreakpointEngine {
        &self.shared.breakpoints
    }

    pub fn patcher(&self) -> &Patcher {
        &self.shared.patcher
    }

    pub fn update_settings(&self, f: impl FnOnce(&mut Settings)) {
        f(&mut lock(&self.shared.settings));
    }

    pub fn is_paused(&self) -> bool {
        lock(&self.shared.sync).paused
    }

    pub fn target_exited(&self) -> bool {
        self.shared.exited.load(Ordering::SeqCst)
    }

    /// Blocks until the loop parks, the timeout passes, or the loop dies.
    pub fn wait_until_paused(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut sync = lock(&self.shared.sync);
        while !sync.paused {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return false;
            };
            let (guard, _) = self
                .shared
                .cond
                .wait_timeout(sync, remaining)
                .unwrap_or_else(PoisonError::into_inner);
            sync = guard;
            if self.target_exited() {
                return sync.paused;
            }
        }
        true
    }

    /// Blocks until the OS-injected attach breakpoint was observed.
    pub fn wait_for_initial_breakpoint(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut sync = lock(&self.shared.sync);
        while !sync.initial_bp_seen {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return false;
            };
            let (guard, _) = self
                .shared
                .cond
                .wait_timeout(sync, remaining)
                .unwrap_or_else(PoisonError::into_inner);
            sync = guard;
        }
        true
    }

    /// Requests a break-in. Returns once the request is issued; callers wait
    /// for the park with [`Debugger::wait_until_paused`].
    pub fn pause(&self) -> Result<()> {
        if self.target_exited() {
            return Err(Error::Terminated);
        }
        if self.is_paused() {
            return Ok(());
        }
        self.shared.break_in.store(true, Ordering::SeqCst);
        self.shared
            .platform
            .debug_break_process(self.shared.process.handle()?)
    }

    /// Releases a parked loop. The published context (with any client
    /// mutations) is written back before execution continues.
    pub fn resume(&self) -> Result<()> {
        let mut sync = lock(&self.shared.sync);
        if !sync.paused {
            return Err(Error::NotPaused);
        }
        sync.resume_requested = true;
        self.shared.cond.notify_all();
        Ok(())
    }

    /// Clone of the paused thread's published context.
    pub fn context(&self) -> Result<ThreadContext> {
        lock(&self.shared.target_state)
            .as_ref()
            .filter(|state| state.is_ready)
            .map(|state| state.context.clone())
            .ok_or(Error::NotPaused)
    }

    /// Replaces the published context; it reaches the thread on resume.
    pub fn set_context(&self, context: ThreadContext) -> Result<()> {
        match lock(&self.shared.target_state).as_mut() {
            Some(state) => {
                state.context = context;
                Ok(())
            }
            None => Err(Error::NotPaused),
        }
    }

    /// Thread the loop is parked on.
    pub fn paused_thread(&self) -> Result<Tid> {
        lock(&self.shared.target_state)
            .as_ref()
            .map(|state| state.thread_id)
            .ok_or(Error::NotPaused)
    }

    /// Stops the loop: clears the debug permission, releases any park, joins
    /// the worker. Detach from a still-running target happens on the loop
    /// thread on its way out.
    pub fn stop(&mut self) {
        self.shared.allowed_to_debug.store(false, Ordering::SeqCst);
        self.shared.cond.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for Debugger {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn run(self: Arc<Self>, mode: LaunchMode, init_tx: mpsc::Sender<Result<()>>) {
        let init = self.bind_target(&mode);
        let failed = init.is_err();
        let _ = init_tx.send(init);
        if failed {
            return;
        }

        self.event_loop();

        // Detach unless the target already went away.
        if !self.exited.load(Ordering::SeqCst) {
            if let Ok(pid) = self.process.pid() {
                if let Err(err) = self.platform.debug_active_process_stop(pid) {
                    log::warn!("Detach from pid {pid} failed: {err}");
                }
            }
        }
    }

    fn bind_target(&self, mode: &LaunchMode) -> Result<()> {
        match mode {
            LaunchMode::Attach => {
                let pid = self.process.pid()?;
                self.platform.debug_active_process(pid)?;
                log::info!("Attached to pid {pid}");
            }
            LaunchMode::Create {
                path,
                args,
                pause_on_first_inst,
            } => {
                self.process
                    .create_and_debug(path, args, *pause_on_first_inst)?;
                if *pause_on_first_inst {
                    *lock(&self.first_inst) = Some(FirstInst::ResolveEntry);
                }
                log::info!("Created {path} under debug control");
            }
        }
        self.platform
            .debug_set_kill_on_exit(lock(&self.settings).kill_on_exit);
        Ok(())
    }

    fn event_loop(&self) {
        log::info!("Debug loop running");
        while self.allowed_to_debug.load(Ordering::SeqCst) && !self.exited.load(Ordering::SeqCst)
        {
            self.try_arm_first_inst();

            let timeout = lock(&self.settings).event_timeout_ms;
            match self.platform.wait_for_debug_event(timeout) {
                // Timeouts are control flow: they give the first-instruction
                // arming its retry cadence.
                Ok(None) => {}
                Ok(Some(event)) => {
                    let status = self.dispatch(&event);
                    if let Err(err) =
                        self.platform.continue_debug_event(event.pid, event.tid, status)
                    {
                        log::error!("ContinueDebugEvent failed: {err}");
                    }
                }
                Err(err) => {
                    log::error!("Waiting for a debug event failed: {err}");
                }
            }
        }
        log::info!("Debug loop exited");
    }

    /// Arms the entry-point breakpoint for `pause_on_first_inst`. Partial
    /// copies are expected while the image is still being mapped; those and
    /// plain OS errors retry on the next iteration.
    fn try_arm_first_inst(&self) {
        let mut slot = lock(&self.first_inst);
        if matches!(&*slot, Some(FirstInst::ResolveEntry)) {
            match self.process.entry_point() {
                Ok(entry) => *slot = Some(FirstInst::Arm(entry)),
                Err(_) => return,
            }
        }
        let entry = match &*slot {
            Some(FirstInst::Arm(entry)) => *entry,
            _ => return,
        };
        match self.breakpoints.set_soft(entry) {
            Ok(()) => {
                log::info!("First-instruction breakpoint armed at {entry:#x}");
                *slot = None;
            }
            Err(Error::PartialTransfer { .. }) | Err(Error::Os { .. }) => {}
            Err(err) => {
                log::warn!("Giving up on the first-instruction breakpoint: {err}");
                *slot = None;
            }
        }
    }

    fn dispatch(&self, event: &DebugEvent) -> ContinueStatus {
        match &event.kind {
            DebugEventKind::Exception(info) => self.on_exception(event.tid, info),
            DebugEventKind::CreateProcess { base } => {
                lock(&self.hooks).on_create_process(event.pid, *base)
            }
            DebugEventKind::ExitProcess { code } => {
                self.exited.store(true, Ordering::SeqCst);
                self.cond.notify_all();
                lock(&self.hooks).on_exit_process(*code)
            }
            DebugEventKind::CreateThread { start } => {
                lock(&self.hooks).on_create_thread(event.tid, *start)
            }
            DebugEventKind::ExitThread { code } => {
                lock(&self.hooks).on_exit_thread(event.tid, *code)
            }
            DebugEventKind::LoadDll { base, path } => {
                lock(&self.hooks).on_load_dll(*base, path.as_deref())
            }
            DebugEventKind::UnloadDll { base } => lock(&self.hooks).on_unload_dll(*base),
            DebugEventKind::OutputDebugString {
                address,
                length,
                unicode,
            } => {
                let message = self.read_debug_string(*address, *length, *unicode);
                lock(&self.hooks).on_output_debug_string(&message)
            }
            DebugEventKind::Rip { error, kind } => lock(&self.hooks).on_rip(*error, *kind),
        }
    }

    fn on_exception(&self, tid: Tid, info: &ExceptionInfo) -> ContinueStatus {
        match info.code {
            ExceptionCode::Breakpoint => self.on_breakpoint_exception(tid, info),
            ExceptionCode::SingleStep => self.on_single_step_exception(tid, info),
            _ => self.on_other_exception(tid, info),
        }
    }

    fn on_breakpoint_exception(&self, tid: Tid, info: &ExceptionInfo) -> ContinueStatus {
        let address = info.address;

        // The OS-injected attach breakpoint: nothing to restore, nothing to
        // consult in the registry.
        if self.breakpoints.note_initial() {
            log::debug!("Initial breakpoint at {address:#x}");
            let mut sync = lock(&self.sync);
            sync.initial_bp_seen = true;
            self.cond.notify_all();
            return ContinueStatus::Continue;
        }

        // Landing breakpoint of a step-over: remove it and park with the
        // instruction pointer rewound onto it.
        if *lock(&self.step_over_bp) == Some(address) {
            self.cancel_step_over();
            lock(&self.hooks).on_breakpoint(address);
            self.edit_and_maybe_park(tid, true, |context| {
                context.ip = address;
                Ok(())
            });
            return ContinueStatus::Continue;
        }

        // One of ours: transparent restore-and-continue. A pending break-in
        // request is satisfied by this park as well.
        if self.breakpoints.has_soft(address) {
            // Any breakpoint arrival finishes an in-flight step-over.
            let step_over = self.cancel_step_over();
            let break_in = self.break_in.swap(false, Ordering::SeqCst);
            lock(&self.hooks).on_breakpoint(address);
            let pause = step_over || break_in || lock(&self.settings).pause_on_breakpoint;
            self.edit_and_maybe_park(tid, pause, |context| {
                self.breakpoints
                    .begin_transparent_continue(address, context)
                    .map(|_| ())
            });
            return ContinueStatus::Continue;
        }

        // Client-requested break-in (the injected breakpoint lives in the
        // system's break-in stub, never in the registry).
        if self.break_in.swap(false, Ordering::SeqCst) {
            self.edit_and_maybe_park(tid, true, |_| Ok(()));
            return ContinueStatus::Continue;
        }

        // A breakpoint the engine never placed (the target's own INT3).
        self.on_other_exception(tid, info)
    }

    fn on_single_step_exception(&self, tid: Tid, info: &ExceptionInfo) -> ContinueStatus {
        let rearmed = match self.breakpoints.complete_rearm() {
            Ok(rearmed) => rearmed,
            Err(err) => {
                log::error!("Breakpoint re-arm failed: {err}");
                true
            }
        };
        let step_requested = self.step_request.swap(false, Ordering::SeqCst);

        // The single-step that merely completed a transparent continue is
        // invisible to the client; an armed step-over stays armed.
        if rearmed && !step_requested {
            return ContinueStatus::Continue;
        }

        if lock(&self.step_over_bp).is_some() {
            self.cancel_step_over();
            lock(&self.hooks).on_single_step(info.address);
            self.edit_and_maybe_park(tid, true, |_| Ok(()));
            return ContinueStatus::Continue;
        }

        if step_requested {
            lock(&self.hooks).on_single_step(info.address);
            let pause = lock(&self.settings).pause_on_single_step;
            self.edit_and_maybe_park(tid, pause, |_| Ok(()));
            return ContinueStatus::Continue;
        }

        // A single step the engine did not cause (the target toggling its
        // own trap flag).
        self.on_other_exception(tid, info)
    }

    fn on_other_exception(&self, tid: Tid, info: &ExceptionInfo) -> ContinueStatus {
        let (ignore_first_chance, class_pause, second_chance_pause) = {
            let settings = lock(&self.settings);
            (
                settings.ignore_first_chance,
                settings.pause_for(info.code),
                settings.pause_on_second_chance && !info.first_chance,
            )
        };

        if ignore_first_chance && info.first_chance && self.breakpoints.initial_breakpoint_hit()
        {
            return ContinueStatus::NotHandled;
        }

        let status = lock(&self.hooks).on_exception(info);
        if class_pause || second_chance_pause {
            self.edit_and_maybe_park(tid, true, |_| Ok(()));
        }
        status
    }

    /// Removes the step-over landing breakpoint, if armed. Returns whether a
    /// step-over was in flight.
    fn cancel_step_over(&self) -> bool {
        let Some(address) = lock(&self.step_over_bp).take() else {
            return false;
        };
        if self.breakpoints.has_soft(address) {
            if let Err(err) = self.breakpoints.unset_soft(address) {
                log::warn!("Failed to remove the step-over breakpoint: {err}");
            }
        }
        true
    }

    /// Opens the faulting thread, applies `mutate` to its context, then
    /// either parks (publishing the context) or writes it straight back.
    fn edit_and_maybe_park(
        &self,
        tid: Tid,
        pause: bool,
        mutate: impl FnOnce(&mut ThreadContext) -> Result<()>,
    ) {
        let wow64 = self.process.wow64().unwrap_or(false);
        let mut edit = match ContextEdit::begin(Arc::clone(&self.platform), tid, wow64) {
            Ok(edit) => edit,
            Err(err) => {
                log::error!("Failed to acquire thread {tid}: {err}");
                return;
            }
        };
        if let Err(err) = mutate(&mut edit.context) {
            log::error!("Breakpoint bookkeeping on thread {tid} failed: {err}");
        }
        if pause {
            self.park(edit);
        } else if let Err(err) = edit.commit() {
            log::error!("Context write-back for thread {tid} failed: {err}");
        }
    }

    /// The pause gate. Publishes the snapshot, waits for the client to
    /// release, writes the (possibly mutated) context back.
    fn park(&self, mut edit: ContextEdit) {
        *lock(&self.target_state) = Some(TargetState {
            thread_id: edit.thread_id(),
            context: edit.context.clone(),
            is_ready: true,
        });

        {
            let mut sync = lock(&self.sync);
            sync.paused = true;
            sync.resume_requested = false;
            self.cond.notify_all();
            while !sync.resume_requested && self.allowed_to_debug.load(Ordering::SeqCst) {
                sync = self
                    .cond
                    .wait(sync)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            sync.paused = false;
        }

        if let Some(state) = lock(&self.target_state).take() {
            edit.context = state.context;
        }
        if let Err(err) = edit.commit() {
            log::error!("Context write-back failed: {err}");
        }
    }

    fn read_debug_string(&self, address: u64, length: usize, unicode: bool) -> String {
        let byte_len = if unicode { length * 2 } else { length };
        let mut buf = vec![0u8; byte_len.min(0x1000)];
        let transferred = self.process.read_available(address, &mut buf).unwrap_or(0);
        buf.truncate(transferred);
        let message = if unicode {
            let wide: Vec<u16> = buf
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .collect();
            String::from_utf16_lossy(&wide)
        } else {
            String::from_utf8_lossy(&buf).into_owned()
        };
        message.trim_end_matches('\0').to_string()
    }
}
