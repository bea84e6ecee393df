//! Platform binding layer.
//!
//! Every OS primitive the engine consumes is reachable only through the
//! [`Platform`] trait, so the core can run against the real debug API on
//! Windows or against the scripted simulator in tests. OS-specific struct
//! layouts never leave this module.

use crate::error::Result;
use bitflags::bitflags;

pub mod sim;

cfg_if::cfg_if! {
    if #[cfg(windows)] {
        pub mod windows;
        pub use windows::WindowsPlatform;
    }
}

pub type Pid = u32;
pub type Tid = u32;

/// Opaque process or thread handle owned by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawHandle(pub usize);

/// x86 trap flag in the flags register.
pub const TRAP_FLAG: u64 = 0x100;

/// One thread's register file at a suspension point.
///
/// The sixteen general-purpose slots follow the x86-64 encoding order
/// (rax, rcx, rdx, rbx, rsp, rbp, rsi, rdi, r8..r15); 32-bit targets use
/// the low eight. The instruction/stack pointers are carried separately so
/// the core never has to know which architectural register they map to.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThreadContext {
    pub ip: u64,
    pub sp: u64,
    pub flags: u64,
    pub gp: [u64; 16],
    pub dr: [u64; 4],
    pub dr6: u64,
    pub dr7: u64,
}

/// Register names for the `gp` slots, in slot order.
pub const GP_NAMES: [&str; 16] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12",
    "r13", "r14", "r15",
];

impl ThreadContext {
    pub fn trap_flag(&self) -> bool {
        self.flags & TRAP_FLAG != 0
    }

    pub fn set_trap_flag(&mut self, enabled: bool) {
        if enabled {
            self.flags |= TRAP_FLAG;
        } else {
            self.flags &= !TRAP_FLAG;
        }
    }
}

bitflags! {
    /// Platform-neutral page protection.
    pub struct Protection: u32 {
        const READ = 0b0000_0001;
        const WRITE = 0b0000_0010;
        const EXECUTE = 0b0000_0100;
        const WRITECOPY = 0b0000_1000;
        const GUARD = 0b0001_0000;
        const NO_ACCESS = 0b0010_0000;
    }
}

/// Backing kind of a committed region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Private,
    Mapped,
    Image,
}

/// One committed region of the target's address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionInfo {
    pub base: u64,
    pub size: u64,
    pub protect: Protection,
    pub kind: RegionKind,
}

impl RegionInfo {
    /// A region is readable iff its protection grants read (or write-copy)
    /// access without guard/no-access modifiers and it is not a mapped file
    /// view.
    pub fn is_readable(&self) -> bool {
        self.kind != RegionKind::Mapped
            && !self.protect.intersects(Protection::GUARD | Protection::NO_ACCESS)
            && self.protect.intersects(Protection::READ | Protection::WRITECOPY)
    }
}

#[derive(Debug, Clone)]
pub struct ModuleInfo {
    pub name: String,
    pub path: String,
    pub base: u64,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct ProcessEntry {
    pub pid: Pid,
    pub name: String,
}

/// Handles returned by process creation under debug control.
#[derive(Debug, Clone, Copy)]
pub struct CreatedProcess {
    pub pid: Pid,
    pub tid: Tid,
    pub process: RawHandle,
    pub thread: RawHandle,
}

/// Exception classes the loop distinguishes. Anything outside the table is
/// carried through as the raw OS code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionCode {
    Breakpoint,
    SingleStep,
    AccessViolation,
    GuardPage,
    IllegalInstruction,
    IntDivideByZero,
    StackOverflow,
    DatatypeMisalignment,
    PrivilegedInstruction,
    Other(u32),
}

#[derive(Debug, Clone)]
pub struct ExceptionInfo {
    pub code: ExceptionCode,
    pub address: u64,
    pub first_chance: bool,
}

#[derive(Debug, Clone)]
pub enum DebugEventKind {
    Exception(ExceptionInfo),
    CreateProcess { base: u64 },
    ExitProcess { code: u32 },
    CreateThread { start: u64 },
    ExitThread { code: u32 },
    LoadDll { base: u64, path: Option<String> },
    UnloadDll { base: u64 },
    OutputDebugString { address: u64, length: usize, unicode: bool },
    Rip { error: u32, kind: u32 },
}

#[derive(Debug, Clone)]
pub struct DebugEvent {
    pub pid: Pid,
    pub tid: Tid,
    pub kind: DebugEventKind,
}

/// How a consumed debug event is reported back to the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinueStatus {
    /// The event was handled by the debugger.
    Continue,
    /// Let the target's own exception handling run.
    NotHandled,
}

/// The OS primitives consumed by the engine.
///
/// Read/write return the number of bytes actually transferred; callers decide
/// whether a short transfer is an error. Context calls take `wow64` so a
/// 32-bit target emulated on a 64-bit host is edited through the emulation
/// layer's register file.
pub trait Platform: Send + Sync {
    // Process primitives.
    fn processes(&self) -> Result<Vec<ProcessEntry>>;
    fn open_process(&self, pid: Pid) -> Result<RawHandle>;
    fn close_handle(&self, handle: RawHandle);
    fn create_process_debug(&self, path: &str, args: &str) -> Result<CreatedProcess>;
    fn debug_active_process(&self, pid: Pid) -> Result<()>;
    fn debug_active_process_stop(&self, pid: Pid) -> Result<()>;
    fn debug_set_kill_on_exit(&self, kill: bool);
    fn debug_break_process(&self, handle: RawHandle) -> Result<()>;
    fn is_wow64(&self, handle: RawHandle) -> Result<bool>;
    fn pointer_width_64(&self) -> bool;

    // Thread primitives.
    fn threads(&self, pid: Pid) -> Result<Vec<Tid>>;
    fn open_thread(&self, tid: Tid) -> Result<RawHandle>;
    fn suspend_thread(&self, handle: RawHandle) -> Result<u32>;
    fn resume_thread(&self, handle: RawHandle) -> Result<u32>;
    fn thread_context(&self, handle: RawHandle, wow64: bool) -> Result<ThreadContext>;
    fn set_thread_context(
        &self,
        handle: RawHandle,
        context: &ThreadContext,
        wow64: bool,
    ) -> Result<()>;

    // Memory primitives.
    fn read_memory(&self, handle: RawHandle, address: u64, buf: &mut [u8]) -> Result<usize>;
    fn write_memory(&self, handle: RawHandle, address: u64, bytes: &[u8]) -> Result<usize>;
    fn query_region(&self, handle: RawHandle, address: u64) -> Option<RegionInfo>;
    fn alloc_memory(&self, handle: RawHandle, size: usize) -> Result<u64>;

    // Debug event primitives.
    fn wait_for_debug_event(&self, timeout_ms: u32) -> Result<Option<DebugEvent>>;
    fn continue_debug_event(&self, pid: Pid, tid: Tid, status: ContinueStatus) -> Result<()>;

    // Module / loader primitives.
    fn modules(&self, pid: Pid) -> Result<Vec<ModuleInfo>>;
    fn loader_entry(&self) -> Result<u64>;
    fn create_remote_thread(&self, handle: RawHandle, start: u64, param: u64) -> Result<()>;
}
