//! Scripted stand-in for the real debug API.
//!
//! Tests preload regions, threads and processes, then queue the debug events
//! the hardware would have produced. Events are released one at a time: the
//! next event is only handed out after the previous one was continued, which
//! mirrors the real wait/continue protocol.

use super::{
    ContinueStatus, CreatedProcess, DebugEvent, DebugEventKind, ExceptionCode, ExceptionInfo,
    ModuleInfo, Pid, Platform, ProcessEntry, Protection, RawHandle, RegionInfo, RegionKind,
    ThreadContext, Tid,
};
use crate::error::{Error, Result};
use fnv::FnvHashMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

const SIM_ALLOC_BASE: u64 = 0x7000_0000;

struct SimRegion {
    info: RegionInfo,
    data: Vec<u8>,
}

struct SimThread {
    context: ThreadContext,
    suspend_count: u32,
}

#[derive(Default)]
struct SimState {
    processes: Vec<ProcessEntry>,
    modules: Vec<ModuleInfo>,
    regions: Vec<SimRegion>,
    threads: FnvHashMap<Tid, SimThread>,
    events: VecDeque<DebugEvent>,
    awaiting_continue: bool,
    continued: Vec<(Pid, Tid, ContinueStatus)>,
    write_failures: FnvHashMap<u64, u32>,
    remote_threads: Vec<(u64, u64)>,
    next_alloc: u64,
    wow64: bool,
    pointer64: bool,
    loader_entry: u64,
    spawn: Option<CreatedProcess>,
}

/// In-memory target with scripted debug events.
pub struct SimPlatform {
    state: Mutex<SimState>,
}

impl Default for SimPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl SimPlatform {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState {
                next_alloc: SIM_ALLOC_BASE,
                pointer64: true,
                loader_entry: 0x7700_0000,
                ..SimState::default()
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn add_process(&self, pid: Pid, name: &str) {
        self.lock().processes.push(ProcessEntry {
            pid,
            name: name.to_string(),
        });
    }

    pub fn add_module(&self, name: &str, base: u64, size: u64) {
        self.lock().modules.push(ModuleInfo {
            name: name.to_string(),
            path: format!("C:\\sim\\{name}"),
            base,
            size,
        });
    }

    pub fn add_region(&self, base: u64, size: usize, protect: Protection, kind: RegionKind) {
        self.lock().regions.push(SimRegion {
            info: RegionInfo {
                base,
                size: size as u64,
                protect,
                kind,
            },
            data: vec![0u8; size],
        });
    }

    /// Pokes bytes straight into backing memory, bypassing the platform
    /// write path (the "external mutator" of the freeze tests).
    pub fn poke(&self, address: u64, bytes: &[u8]) {
        let mut state = self.lock();
        let region = state
            .regions
            .iter_mut()
            .find(|r| address >= r.info.base && address < r.info.base + r.info.size)
            .expect("poke outside any sim region");
        let offset = (address - region.info.base) as usize;
        region.data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn peek(&self, address: u64, len: usize) -> Vec<u8> {
        let state = self.lock();
        let region = state
            .regions
            .iter()
            .find(|r| address >= r.info.base && address < r.info.base + r.info.size)
            .expect("peek outside any sim region");
        let offset = (address - region.info.base) as usize;
        region.data[offset..offset + len].to_vec()
    }

    pub fn add_thread(&self, tid: Tid, context: ThreadContext) {
        self.lock().threads.insert(
            tid,
            SimThread {
                context,
                suspend_count: 0,
            },
        );
    }

    /// Moves a simulated thread's instruction pointer, the way retiring
    /// instructions would.
    pub fn set_ip(&self, tid: Tid, ip: u64) {
        self.lock()
            .threads
            .get_mut(&tid)
            .expect("set_ip on unknown sim thread")
            .context
            .ip = ip;
    }

    pub fn context_of(&self, tid: Tid) -> ThreadContext {
        self.lock().threads[&tid].context.clone()
    }

    pub fn suspend_count(&self, tid: Tid) -> u32 {
        self.lock().threads[&tid].suspend_count
    }

    pub fn queue_event(&self, event: DebugEvent) {
        self.lock().events.push_back(event);
    }

    pub fn queue_exception(
        &self,
        pid: Pid,
        tid: Tid,
        code: ExceptionCode,
        address: u64,
        first_chance: bool,
    ) {
        self.queue_event(DebugEvent {
            pid,
            tid,
            kind: DebugEventKind::Exception(ExceptionInfo {
                code,
                address,
                first_chance,
            }),
        });
    }

    /// Every write touching `address` fails with a zero-byte transfer for the
    /// next `count` attempts.
    pub fn fail_writes_at(&self, address: u64, count: u32) {
        self.lock().write_failures.insert(address, count);
    }

    pub fn continued(&self) -> Vec<(Pid, Tid, ContinueStatus)> {
        self.lock().continued.clone()
    }

    pub fn remote_threads(&self) -> Vec<(u64, u64)> {
        self.lock().remote_threads.clone()
    }

    pub fn set_wow64(&self, wow64: bool) {
        self.lock().wow64 = wow64;
    }

    pub fn set_spawn(&self, spawn: CreatedProcess) {
        self.lock().spawn = Some(spawn);
    }
}

impl Platform for SimPlatform {
    fn processes(&self) -> Result<Vec<ProcessEntry>> {
        Ok(self.lock().processes.clone())
    }

    fn open_process(&self, pid: Pid) -> Result<RawHandle> {
        let state = self.lock();
        if state.processes.iter().any(|p| p.pid == pid) {
            Ok(RawHandle(pid as usize))
        } else {
            Err(Error::from_os("OpenProcess", 87))
        }
    }

    fn close_handle(&self, _handle: RawHandle) {}

    fn create_process_debug(&self, path: &str, _args: &str) -> Result<CreatedProcess> {
        let mut state = self.lock();
        let spawn = state.spawn.ok_or(Error::Os {
            call: "CreateProcess",
            code: 2,
        })?;
        state.processes.push(ProcessEntry {
            pid: spawn.pid,
            name: path.to_string(),
        });
        Ok(spawn)
    }

    fn debug_active_process(&self, _pid: Pid) -> Result<()> {
        Ok(())
    }

    fn debug_active_process_stop(&self, _pid: Pid) -> Result<()> {
        Ok(())
    }

    fn debug_set_kill_on_exit(&self, _kill: bool) {}

    fn debug_break_process(&self, handle: RawHandle) -> Result<()> {
        let mut state = self.lock();
        let tid = state
            .threads
            .keys()
            .min()
            .copied()
            .ok_or(Error::Terminated)?;
        let address = state.threads[&tid].context.ip;
        let pid = handle.0 as Pid;
        state.events.push_back(DebugEvent {
            pid,
            tid,
            kind: DebugEventKind::Exception(ExceptionInfo {
                code: ExceptionCode::Breakpoint,
                address,
                first_chance: true,
            }),
        });
        Ok(())
    }

    fn is_wow64(&self, _handle: RawHandle) -> Result<bool> {
        Ok(self.lock().wow64)
    }

    fn pointer_width_64(&self) -> bool {
        self.lock().pointer64
    }

    fn threads(&self, _pid: Pid) -> Result<Vec<Tid>> {
        let mut tids: Vec<Tid> = self.lock().threads.keys().copied().collect();
        tids.sort_unstable();
        Ok(tids)
    }

    fn open_thread(&self, tid: Tid) -> Result<RawHandle> {
        if self.lock().threads.contains_key(&tid) {
            Ok(RawHandle(tid as usize))
        } else {
            Err(Error::from_os("OpenThread", 87))
        }
    }

    fn suspend_thread(&self, handle: RawHandle) -> Result<u32> {
        let mut state = self.lock();
        let thread = state
            .threads
            .get_mut(&(handle.0 as Tid))
            .ok_or(Error::Terminated)?;
        let previous = thread.suspend_count;
        thread.suspend_count += 1;
        Ok(previous)
    }

    fn resume_thread(&self, handle: RawHandle) -> Result<u32> {
        let mut state = self.lock();
        let thread = state
            .threads
            .get_mut(&(handle.0 as Tid))
            .ok_or(Error::Terminated)?;
        let previous = thread.suspend_count;
        thread.suspend_count = thread.suspend_count.saturating_sub(1);
        Ok(previous)
    }

    fn thread_context(&self, handle: RawHandle, _wow64: bool) -> Result<ThreadContext> {
        self.lock()
            .threads
            .get(&(handle.0 as Tid))
            .map(|t| t.context.clone())
            .ok_or(Error::Terminated)
    }

    fn set_thread_context(
        &self,
        handle: RawHandle,
        context: &ThreadContext,
        _wow64: bool,
    ) -> Result<()> {
        let mut state = self.lock();
        let thread = state
            .threads
            .get_mut(&(handle.0 as Tid))
            .ok_or(Error::Terminated)?;
        thread.context = context.clone();
        Ok(())
    }

    fn read_memory(&self, _handle: RawHandle, address: u64, buf: &mut [u8]) -> Result<usize> {
        let state = self.lock();
        let region = state
            .regions
            .iter()
            .find(|r| address >= r.info.base && address < r.info.base + r.info.size)
            .ok_or(Error::from_os("ReadProcessMemory", 998))?;
        let offset = (address - region.info.base) as usize;
        let available = region.data.len() - offset;
        let n = buf.len().min(available);
        buf[..n].copy_from_slice(&region.data[offset..offset + n]);
        Ok(n)
    }

    fn write_memory(&self, _handle: RawHandle, address: u64, bytes: &[u8]) -> Result<usize> {
        let mut state = self.lock();
        if let Some(remaining) = state.write_failures.get_mut(&address) {
            if *remaining > 0 {
                *remaining -= 1;
                return Ok(0);
            }
        }
        let region = state
            .regions
            .iter_mut()
            .find(|r| address >= r.info.base && address < r.info.base + r.info.size)
            .ok_or(Error::from_os("WriteProcessMemory", 998))?;
        let offset = (address - region.info.base) as usize;
        let available = region.data.len() - offset;
        let n = bytes.len().min(available);
        region.data[offset..offset + n].copy_from_slice(&bytes[..n]);
        Ok(n)
    }

    fn query_region(&self, _handle: RawHandle, address: u64) -> Option<RegionInfo> {
        let state = self.lock();
        // Exact hit first, then the next region above (a free gap is reported
        // as an unreadable filler so region walks can advance).
        if let Some(region) = state
            .regions
            .iter()
            .find(|r| address >= r.info.base && address < r.info.base + r.info.size)
        {
            return Some(region.info);
        }
        state
            .regions
            .iter()
            .filter(|r| r.info.base > address)
            .min_by_key(|r| r.info.base)
            .map(|r| RegionInfo {
                base: address,
                size: r.info.base - address,
                protect: Protection::NO_ACCESS,
                kind: RegionKind::Private,
            })
    }

    fn alloc_memory(&self, _handle: RawHandle, size: usize) -> Result<u64> {
        let mut state = self.lock();
        let base = state.next_alloc;
        state.next_alloc += ((size as u64 + 0xFFF) & !0xFFF).max(0x1000);
        state.regions.push(SimRegion {
            info: RegionInfo {
                base,
                size: size as u64,
                protect: Protection::READ | Protection::WRITE,
                kind: RegionKind::Private,
            },
            data: vec![0u8; size],
        });
        Ok(base)
    }

    fn wait_for_debug_event(&self, timeout_ms: u32) -> Result<Option<DebugEvent>> {
        {
            let mut state = self.lock();
            if !state.awaiting_continue {
                if let Some(event) = state.events.pop_front() {
                    state.awaiting_continue = true;
                    return Ok(Some(event));
                }
            }
        }
        std::thread::sleep(Duration::from_millis(u64::from(timeout_ms.min(1))));
        Ok(None)
    }

    fn continue_debug_event(&self, pid: Pid, tid: Tid, status: ContinueStatus) -> Result<()> {
        let mut state = self.lock();
        state.awaiting_continue = false;
        state.continued.push((pid, tid, status));
        Ok(())
    }

    fn modules(&self, _pid: Pid) -> Result<Vec<ModuleInfo>> {
        Ok(self.lock().modules.clone())
    }

    fn loader_entry(&self) -> Result<u64> {
        Ok(self.lock().loader_entry)
    }

    fn create_remote_thread(&self, _handle: RawHandle, start: u64, param: u64) -> Result<()> {
        self.lock().remote_threads.push((start, param));
        Ok(())
    }
}
