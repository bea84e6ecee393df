//! Real [`Platform`] implementation over the Windows debug API.
//!
//! Every OS struct layout (CONTEXT, DEBUG_EVENT, MEMORY_BASIC_INFORMATION,
//! the Toolhelp snapshots) stays inside this module.

use super::{
    ContinueStatus, CreatedProcess, DebugEvent, DebugEventKind, ExceptionCode, ExceptionInfo,
    ModuleInfo, Pid, Platform, ProcessEntry, Protection, RawHandle, RegionInfo, RegionKind,
    ThreadContext, Tid,
};
use crate::error::{Error, Result};
use std::mem::{size_of, MaybeUninit};
use widestring::U16CString;
use winapi::shared::minwindef::{DWORD, FALSE, LPCVOID, LPVOID, TRUE};
use winapi::shared::winerror::ERROR_SEM_TIMEOUT;
use winapi::um::debugapi::{
    ContinueDebugEvent, DebugActiveProcess, DebugActiveProcessStop, DebugBreakProcess,
    WaitForDebugEvent,
};
use winapi::um::errhandlingapi::GetLastError;
use winapi::um::handleapi::{CloseHandle, INVALID_HANDLE_VALUE};
use winapi::um::libloaderapi::{GetModuleHandleW, GetProcAddress};
use winapi::um::memoryapi::{ReadProcessMemory, VirtualAllocEx, VirtualQueryEx, WriteProcessMemory};
use winapi::um::minwinbase::{
    CREATE_PROCESS_DEBUG_EVENT, CREATE_THREAD_DEBUG_EVENT, EXCEPTION_DEBUG_EVENT,
    EXIT_PROCESS_DEBUG_EVENT, EXIT_THREAD_DEBUG_EVENT, LOAD_DLL_DEBUG_EVENT,
    OUTPUT_DEBUG_STRING_EVENT, RIP_EVENT, UNLOAD_DLL_DEBUG_EVENT,
};
use winapi::um::processthreadsapi::{
    CreateProcessW, CreateRemoteThread, FlushInstructionCache, GetThreadContext, OpenProcess,
    OpenThread, ResumeThread, SetThreadContext, SuspendThread, PROCESS_INFORMATION, STARTUPINFOW,
};
use winapi::um::tlhelp32::{
    CreateToolhelp32Snapshot, Module32FirstW, Module32NextW, Process32FirstW, Process32NextW,
    Thread32First, Thread32Next, MODULEENTRY32W, PROCESSENTRY32W, TH32CS_SNAPMODULE,
    TH32CS_SNAPMODULE32, TH32CS_SNAPPROCESS, TH32CS_SNAPTHREAD, THREADENTRY32,
};
use winapi::um::winbase::{DebugSetProcessKillOnExit, DEBUG_ONLY_THIS_PROCESS};
use winapi::um::winnt::{
    CONTEXT, DBG_CONTINUE, DBG_EXCEPTION_NOT_HANDLED, HANDLE, MEM_COMMIT, MEM_IMAGE, MEM_MAPPED,
    MEM_RESERVE, PAGE_EXECUTE, PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE, PAGE_EXECUTE_WRITECOPY,
    PAGE_GUARD, PAGE_READONLY, PAGE_READWRITE, PAGE_WRITECOPY, PROCESS_ALL_ACCESS,
    THREAD_GET_CONTEXT, THREAD_QUERY_INFORMATION, THREAD_SET_CONTEXT, THREAD_SUSPEND_RESUME,
};
use winapi::um::wow64apiset::IsWow64Process;

// Exception codes of interest; winapi scatters these across modules, the raw
// values are architectural anyway.
const EXCEPTION_BREAKPOINT: u32 = 0x8000_0003;
const EXCEPTION_SINGLE_STEP: u32 = 0x8000_0004;
const EXCEPTION_ACCESS_VIOLATION: u32 = 0xC000_0005;
const EXCEPTION_GUARD_PAGE: u32 = 0x8000_0001;
const EXCEPTION_ILLEGAL_INSTRUCTION: u32 = 0xC000_001D;
const EXCEPTION_INT_DIVIDE_BY_ZERO: u32 = 0xC000_0094;
const EXCEPTION_STACK_OVERFLOW: u32 = 0xC000_00FD;
const EXCEPTION_DATATYPE_MISALIGNMENT: u32 = 0x8000_0002;
const EXCEPTION_PRIV_INSTRUCTION: u32 = 0xC000_0096;
// Raised instead of EXCEPTION_BREAKPOINT by the 32-bit loader of a WoW64
// process.
const STATUS_WX86_BREAKPOINT: u32 = 0x4000_001F;

const CONTEXT_AMD64: u32 = 0x0010_0000;
const CONTEXT_I386: u32 = 0x0001_0000;
#[cfg(target_arch = "x86_64")]
const CONTEXT_FULL: u32 = CONTEXT_AMD64 | 0x0B;
#[cfg(target_arch = "x86")]
const CONTEXT_FULL: u32 = CONTEXT_I386 | 0x07;
#[cfg(target_arch = "x86_64")]
const CONTEXT_DEBUG_REGISTERS: u32 = CONTEXT_AMD64 | 0x10;
#[cfg(target_arch = "x86")]
const CONTEXT_DEBUG_REGISTERS: u32 = CONTEXT_I386 | 0x10;
const WOW64_CONTEXT_FULL: u32 = CONTEXT_I386 | 0x07;
const WOW64_CONTEXT_DEBUG_REGISTERS: u32 = CONTEXT_I386 | 0x10;

fn last_error(call: &'static str) -> Error {
    Error::from_os(call, unsafe { GetLastError() })
}

fn wide_to_string(buf: &[u16]) -> String {
    let len = buf.iter().position(|&c| c == 0).unwrap_or(buf.len());
    String::from_utf16_lossy(&buf[..len])
}

/// GetThreadContext requires 16-byte alignment for the AMD64 CONTEXT.
#[repr(align(16))]
struct AlignedContext(CONTEXT);

/// The debug API spoken through winapi.
pub struct WindowsPlatform;

impl WindowsPlatform {
    pub fn new() -> Self {
        Self
    }
}

impl Default for WindowsPlatform {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_arch = "x86_64")]
fn context_from_native(raw: &CONTEXT) -> ThreadContext {
    ThreadContext {
        ip: raw.Rip,
        sp: raw.Rsp,
        flags: u64::from(raw.EFlags),
        gp: [
            raw.Rax, raw.Rcx, raw.Rdx, raw.Rbx, raw.Rsp, raw.Rbp, raw.Rsi, raw.Rdi, raw.R8,
            raw.R9, raw.R10, raw.R11, raw.R12, raw.R13, raw.R14, raw.R15,
        ],
        dr: [raw.Dr0, raw.Dr1, raw.Dr2, raw.Dr3],
        dr6: raw.Dr6,
        dr7: raw.Dr7,
    }
}

#[cfg(target_arch = "x86_64")]
fn context_to_native(ctx: &ThreadContext, raw: &mut CONTEXT) {
    raw.Rip = ctx.ip;
    raw.Rsp = ctx.sp;
    raw.EFlags = ctx.flags as u32;
    raw.Rax = ctx.gp[0];
    raw.Rcx = ctx.gp[1];
    raw.Rdx = ctx.gp[2];
    raw.Rbx = ctx.gp[3];
    raw.Rsp = ctx.gp[4];
    raw.Rbp = ctx.gp[5];
    raw.Rsi = ctx.gp[6];
    raw.Rdi = ctx.gp[7];
    raw.R8 = ctx.gp[8];
    raw.R9 = ctx.gp[9];
    raw.R10 = ctx.gp[10];
    raw.R11 = ctx.gp[11];
    raw.R12 = ctx.gp[12];
    raw.R13 = ctx.gp[13];
    raw.R14 = ctx.gp[14];
    raw.R15 = ctx.gp[15];
    raw.Dr0 = ctx.dr[0];
    raw.Dr1 = ctx.dr[1];
    raw.Dr2 = ctx.dr[2];
    raw.Dr3 = ctx.dr[3];
    raw.Dr6 = ctx.dr6;
    raw.Dr7 = ctx.dr7;
}

#[cfg(target_arch = "x86")]
fn context_from_native(raw: &CONTEXT) -> ThreadContext {
    let mut gp = [0u64; 16];
    gp[0] = u64::from(raw.Eax);
    gp[1] = u64::from(raw.Ecx);
    gp[2] = u64::from(raw.Edx);
    gp[3] = u64::from(raw.Ebx);
    gp[4] = u64::from(raw.Esp);
    gp[5] = u64::from(raw.Ebp);
    gp[6] = u64::from(raw.Esi);
    gp[7] = u64::from(raw.Edi);
    ThreadContext {
        ip: u64::from(raw.Eip),
        sp: u64::from(raw.Esp),
        flags: u64::from(raw.EFlags),
        gp,
        dr: [
            u64::from(raw.Dr0),
            u64::from(raw.Dr1),
            u64::from(raw.Dr2),
            u64::from(raw.Dr3),
        ],
        dr6: u64::from(raw.Dr6),
        dr7: u64::from(raw.Dr7),
    }
}

#[cfg(target_arch = "x86")]
fn context_to_native(ctx: &ThreadContext, raw: &mut CONTEXT) {
    raw.Eip = ctx.ip as u32;
    raw.Esp = ctx.sp as u32;
    raw.EFlags = ctx.flags as u32;
    raw.Eax = ctx.gp[0] as u32;
    raw.Ecx = ctx.gp[1] as u32;
    raw.Edx = ctx.gp[2] as u32;
    raw.Ebx = ctx.gp[3] as u32;
    raw.Esp = ctx.gp[4] as u32;
    raw.Ebp = ctx.gp[5] as u32;
    raw.Esi = ctx.gp[6] as u32;
    raw.Edi = ctx.gp[7] as u32;
    raw.Dr0 = ctx.dr[0] as u32;
    raw.Dr1 = ctx.dr[1] as u32;
    raw.Dr2 = ctx.dr[2] as u32;
    raw.Dr3 = ctx.dr[3] as u32;
    raw.Dr6 = ctx.dr6 as u32;
    raw.Dr7 = ctx.dr7 as u32;
}

#[cfg(target_arch = "x86_64")]
mod wow64 {
    use super::*;
    use winapi::um::winbase::{Wow64GetThreadContext, Wow64SetThreadContext};
    use winapi::um::winnt::WOW64_CONTEXT;

    pub(super) fn get(handle: HANDLE) -> Result<ThreadContext> {
        let mut raw: WOW64_CONTEXT = unsafe { std::mem::zeroed() };
        raw.ContextFlags = WOW64_CONTEXT_FULL | WOW64_CONTEXT_DEBUG_REGISTERS;
        if unsafe { Wow64GetThreadContext(handle, &mut raw) } == FALSE {
            return Err(last_error("Wow64GetThreadContext"));
        }
        let mut gp = [0u64; 16];
        gp[0] = u64::from(raw.Eax);
        gp[1] = u64::from(raw.Ecx);
        gp[2] = u64::from(raw.Edx);
        gp[3] = u64::from(raw.Ebx);
        gp[4] = u64::from(raw.Esp);
        gp[5] = u64::from(raw.Ebp);
        gp[6] = u64::from(raw.Esi);
        gp[7] = u64::from(raw.Edi);
        Ok(ThreadContext {
            ip: u64::from(raw.Eip),
            sp: u64::from(raw.Esp),
            flags: u64::from(raw.EFlags),
            gp,
            dr: [
                u64::from(raw.Dr0),
                u64::from(raw.Dr1),
                u64::from(raw.Dr2),
                u64::from(raw.Dr3),
            ],
            dr6: u64::from(raw.Dr6),
            dr7: u64::from(raw.Dr7),
        })
    }

    pub(super) fn set(handle: HANDLE, ctx: &ThreadContext) -> Result<()> {
        let mut raw: WOW64_CONTEXT = unsafe { std::mem::zeroed() };
        raw.ContextFlags = WOW64_CONTEXT_FULL | WOW64_CONTEXT_DEBUG_REGISTERS;
        if unsafe { Wow64GetThreadContext(handle, &mut raw) } == FALSE {
            return Err(last_error("Wow64GetThreadContext"));
        }
        raw.Eip = ctx.ip as u32;
        raw.EFlags = ctx.flags as u32;
        raw.Eax = ctx.gp[0] as u32;
        raw.Ecx = ctx.gp[1] as u32;
        raw.Edx = ctx.gp[2] as u32;
        raw.Ebx = ctx.gp[3] as u32;
        raw.Esp = ctx.gp[4] as u32;
        raw.Ebp = ctx.gp[5] as u32;
        raw.Esi = ctx.gp[6] as u32;
        raw.Edi = ctx.gp[7] as u32;
        raw.Dr0 = ctx.dr[0] as u32;
        raw.Dr1 = ctx.dr[1] as u32;
        raw.Dr2 = ctx.dr[2] as u32;
        raw.Dr3 = ctx.dr[3] as u32;
        raw.Dr6 = ctx.dr6 as u32;
        raw.Dr7 = ctx.dr7 as u32;
        if unsafe { Wow64SetThreadContext(handle, &raw) } == FALSE {
            return Err(last_error("Wow64SetThreadContext"));
        }
        Ok(())
    }
}

fn protection_from_raw(state: DWORD, protect: DWORD) -> Protection {
    if state != MEM_COMMIT {
        return Protection::NO_ACCESS;
    }
    let mut p = match protect & 0xFF {
        PAGE_READONLY => Protection::READ,
        PAGE_READWRITE => Protection::READ | Protection::WRITE,
        PAGE_WRITECOPY => Protection::READ | Protection::WRITE | Protection::WRITECOPY,
        PAGE_EXECUTE => Protection::EXECUTE,
        PAGE_EXECUTE_READ => Protection::READ | Protection::EXECUTE,
        PAGE_EXECUTE_READWRITE => Protection::READ | Protection::WRITE | Protection::EXECUTE,
        PAGE_EXECUTE_WRITECOPY => {
            Protection::READ | Protection::WRITE | Protection::EXECUTE | Protection::WRITECOPY
        }
        _ => Protection::NO_ACCESS,
    };
    if protect & PAGE_GUARD != 0 {
        p |= Protection::GUARD;
    }
    p
}

fn exception_from_raw(code: u32) -> ExceptionCode {
    match code {
        EXCEPTION_BREAKPOINT | STATUS_WX86_BREAKPOINT => ExceptionCode::Breakpoint,
        EXCEPTION_SINGLE_STEP => ExceptionCode::SingleStep,
        EXCEPTION_ACCESS_VIOLATION => ExceptionCode::AccessViolation,
        EXCEPTION_GUARD_PAGE => ExceptionCode::GuardPage,
        EXCEPTION_ILLEGAL_INSTRUCTION => ExceptionCode::IllegalInstruction,
        EXCEPTION_INT_DIVIDE_BY_ZERO => ExceptionCode::IntDivideByZero,
        EXCEPTION_STACK_OVERFLOW => ExceptionCode::StackOverflow,
        EXCEPTION_DATATYPE_MISALIGNMENT => ExceptionCode::DatatypeMisalignment,
        EXCEPTION_PRIV_INSTRUCTION => ExceptionCode::PrivilegedInstruction,
        other => ExceptionCode::Other(other),
    }
}

impl Platform for WindowsPlatform {
    fn processes(&self) -> Result<Vec<ProcessEntry>> {
        let snapshot = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0) };
        if snapshot == INVALID_HANDLE_VALUE {
            return Err(last_error("CreateToolhelp32Snapshot"));
        }
        let mut entries = Vec::new();
        let mut entry: PROCESSENTRY32W = unsafe { std::mem::zeroed() };
        entry.dwSize = size_of::<PROCESSENTRY32W>() as DWORD;
        if unsafe { Process32FirstW(snapshot, &mut entry) } == TRUE {
            loop {
                entries.push(ProcessEntry {
                    pid: entry.th32ProcessID,
                    name: wide_to_string(&entry.szExeFile),
                });
                if unsafe { Process32NextW(snapshot, &mut entry) } == FALSE {
                    break;
                }
            }
        }
        unsafe { CloseHandle(snapshot) };
        Ok(entries)
    }

    fn open_process(&self, pid: Pid) -> Result<RawHandle> {
        let handle = unsafe { OpenProcess(PROCESS_ALL_ACCESS, FALSE, pid) };
        if handle.is_null() {
            Err(last_error("OpenProcess"))
        } else {
            Ok(RawHandle(handle as usize))
        }
    }

    fn close_handle(&self, handle: RawHandle) {
        unsafe { CloseHandle(handle.0 as HANDLE) };
    }

    fn create_process_debug(&self, path: &str, args: &str) -> Result<CreatedProcess> {
        let command_line = if args.is_empty() {
            format!("\"{path}\"")
        } else {
            format!("\"{path}\" {args}")
        };
        let mut wide_command = U16CString::from_str(&command_line)
            .map_err(|_| Error::Internal {
                reason: "command line contains an interior NUL",
            })?
            .into_vec_with_nul();

        let mut startup: STARTUPINFOW = unsafe { std::mem::zeroed() };
        startup.cb = size_of::<STARTUPINFOW>() as DWORD;
        let mut info: PROCESS_INFORMATION = unsafe { std::mem::zeroed() };

        let ok = unsafe {
            CreateProcessW(
                std::ptr::null(),
                wide_command.as_mut_ptr(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                FALSE,
                DEBUG_ONLY_THIS_PROCESS,
                std::ptr::null_mut(),
                std::ptr::null(),
                &mut startup,
                &mut info,
            )
        };
        if ok == FALSE {
            return Err(last_error("CreateProcessW"));
        }
        Ok(CreatedProcess {
            pid: info.dwProcessId,
            tid: info.dwThreadId,
            process: RawHandle(info.hProcess as usize),
            thread: RawHandle(info.hThread as usize),
        })
    }

    fn debug_active_process(&self, pid: Pid) -> Result<()> {
        if unsafe { DebugActiveProcess(pid) } == FALSE {
            Err(last_error("DebugActiveProcess"))
        } else {
            Ok(())
        }
    }

    fn debug_active_process_stop(&self, pid: Pid) -> Result<()> {
        if unsafe { DebugActiveProcessStop(pid) } == FALSE {
            Err(last_error("DebugActiveProcessStop"))
        } else {
            Ok(())
        }
    }

    fn debug_set_kill_on_exit(&self, kill: bool) {
        unsafe { DebugSetProcessKillOnExit(if kill { TRUE } else { FALSE }) };
    }

    fn debug_break_process(&self, handle: RawHandle) -> Result<()> {
        if unsafe { DebugBreakProcess(handle.0 as HANDLE) } == FALSE {
            Err(last_error("DebugBreakProcess"))
        } else {
            Ok(())
        }
    }

    fn is_wow64(&self, handle: RawHandle) -> Result<bool> {
        let mut wow64 = FALSE;
        if unsafe { IsWow64Process(handle.0 as HANDLE, &mut wow64) } == FALSE {
            return Err(last_error("IsWow64Process"));
        }
        Ok(wow64 == TRUE)
    }

    fn pointer_width_64(&self) -> bool {
        cfg!(target_pointer_width = "64")
    }

    fn threads(&self, pid: Pid) -> Result<Vec<Tid>> {
        let snapshot = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPTHREAD, 0) };
        if snapshot == INVALID_HANDLE_VALUE {
            return Err(last_error("CreateToolhelp32Snapshot"));
        }
        let mut tids = Vec::new();
        let mut entry: THREADENTRY32 = unsafe { std::mem::zeroed() };
        entry.dwSize = size_of::<THREADENTRY32>() as DWORD;
        if unsafe { Thread32First(snapshot, &mut entry) } == TRUE {
            loop {
                if entry.th32OwnerProcessID == pid {
                    tids.push(entry.th32ThreadID);
                }
                if unsafe { Thread32Next(snapshot, &mut entry) } == FALSE {
                    break;
                }
            }
        }
        unsafe { CloseHandle(snapshot) };
        Ok(tids)
    }

    fn open_thread(&self, tid: Tid) -> Result<RawHandle> {
        let rights = THREAD_GET_CONTEXT
            | THREAD_SET_CONTEXT
            | THREAD_SUSPEND_RESUME
            | THREAD_QUERY_INFORMATION;
        let handle = unsafe { OpenThread(rights, FALSE, tid) };
        if handle.is_null() {
            Err(last_error("OpenThread"))
        } else {
            Ok(RawHandle(handle as usize))
        }
    }

    fn suspend_thread(&self, handle: RawHandle) -> Result<u32> {
        let previous = unsafe { SuspendThread(handle.0 as HANDLE) };
        if previous == DWORD::MAX {
            Err(last_error("SuspendThread"))
        } else {
            Ok(previous)
        }
    }

    fn resume_thread(&self, handle: RawHandle) -> Result<u32> {
        let previous = unsafe { ResumeThread(handle.0 as HANDLE) };
        if previous == DWORD::MAX {
            Err(last_error("ResumeThread"))
        } else {
            Ok(previous)
        }
    }

    fn thread_context(&self, handle: RawHandle, wow64: bool) -> Result<ThreadContext> {
        #[cfg(target_arch = "x86_64")]
        if wow64 {
            return wow64::get(handle.0 as HANDLE);
        }
        #[cfg(target_arch = "x86")]
        let _ = wow64;

        let mut raw = AlignedContext(unsafe { std::mem::zeroed() });
        raw.0.ContextFlags = CONTEXT_FULL | CONTEXT_DEBUG_REGISTERS;
        if unsafe { GetThreadContext(handle.0 as HANDLE, &mut raw.0) } == FALSE {
            return Err(last_error("GetThreadContext"));
        }
        Ok(context_from_native(&raw.0))
    }

    fn set_thread_context(
        &self,
        handle: RawHandle,
        context: &ThreadContext,
        wow64: bool,
    ) -> Result<()> {
        #[cfg(target_arch = "x86_64")]
        if wow64 {
            return wow64::set(handle.0 as HANDLE, context);
        }
        #[cfg(target_arch = "x86")]
        let _ = wow64;

        // Fetch-modify-store so unrepresented register state survives.
        let mut raw = AlignedContext(unsafe { std::mem::zeroed() });
        raw.0.ContextFlags = CONTEXT_FULL | CONTEXT_DEBUG_REGISTERS;
        if unsafe { GetThreadContext(handle.0 as HANDLE, &mut raw.0) } == FALSE {
            return Err(last_error("GetThreadContext"));
        }
        context_to_native(context, &mut raw.0);
        if unsafe { SetThreadContext(handle.0 as HANDLE, &raw.0) } == FALSE {
            return Err(last_error("SetThreadContext"));
        }
        Ok(())
    }

    fn read_memory(&self, handle: RawHandle, address: u64, buf: &mut [u8]) -> Result<usize> {
        let mut transferred = 0usize;
        let ok = unsafe {
            ReadProcessMemory(
                handle.0 as HANDLE,
                address as LPCVOID,
                buf.as_mut_ptr() as LPVOID,
                buf.len(),
                &mut transferred,
            )
        };
        if ok == FALSE && transferred == 0 {
            Err(last_error("ReadProcessMemory"))
        } else {
            Ok(transferred)
        }
    }

    fn write_memory(&self, handle: RawHandle, address: u64, bytes: &[u8]) -> Result<usize> {
        let mut transferred = 0usize;
        let ok = unsafe {
            WriteProcessMemory(
                handle.0 as HANDLE,
                address as LPVOID,
                bytes.as_ptr() as LPCVOID,
                bytes.len(),
                &mut transferred,
            )
        };
        if ok == FALSE && transferred == 0 {
            return Err(last_error("WriteProcessMemory"));
        }
        unsafe {
            FlushInstructionCache(handle.0 as HANDLE, address as LPCVOID, transferred);
        }
        Ok(transferred)
    }

    fn query_region(&self, handle: RawHandle, address: u64) -> Option<RegionInfo> {
        let mut info = MaybeUninit::uninit();
        let len = unsafe {
            VirtualQueryEx(
                handle.0 as HANDLE,
                address as LPCVOID,
                info.as_mut_ptr(),
                size_of::<winapi::um::winnt::MEMORY_BASIC_INFORMATION>(),
            )
        };
        if len == 0 {
            return None;
        }
        let info = unsafe { info.assume_init() };
        let kind = match info.Type {
            MEM_IMAGE => RegionKind::Image,
            MEM_MAPPED => RegionKind::Mapped,
            _ => RegionKind::Private,
        };
        Some(RegionInfo {
            base: info.BaseAddress as u64,
            size: info.RegionSize as u64,
            protect: protection_from_raw(info.State, info.Protect),
            kind,
        })
    }

    fn alloc_memory(&self, handle: RawHandle, size: usize) -> Result<u64> {
        let base = unsafe {
            VirtualAllocEx(
                handle.0 as HANDLE,
                std::ptr::null_mut(),
                size,
                MEM_COMMIT | MEM_RESERVE,
                PAGE_READWRITE,
            )
        };
        if base.is_null() {
            Err(last_error("VirtualAllocEx"))
        } else {
            Ok(base as u64)
        }
    }

    fn wait_for_debug_event(&self, timeout_ms: u32) -> Result<Option<DebugEvent>> {
        let mut raw = MaybeUninit::uninit();
        if unsafe { WaitForDebugEvent(raw.as_mut_ptr(), timeout_ms) } == FALSE {
            let code = unsafe { GetLastError() };
            return if code == ERROR_SEM_TIMEOUT {
                Ok(None)
            } else {
                Err(Error::from_os("WaitForDebugEvent", code))
            };
        }
        let raw = unsafe { raw.assume_init() };
        let kind = match raw.dwDebugEventCode {
            EXCEPTION_DEBUG_EVENT => {
                let info = unsafe { raw.u.Exception() };
                DebugEventKind::Exception(ExceptionInfo {
                    code: exception_from_raw(info.ExceptionRecord.ExceptionCode),
                    address: info.ExceptionRecord.ExceptionAddress as u64,
                    first_chance: info.dwFirstChance != 0,
                })
            }
            CREATE_PROCESS_DEBUG_EVENT => {
                let info = unsafe { raw.u.CreateProcessInfo() };
                if !info.hFile.is_null() {
                    unsafe { CloseHandle(info.hFile) };
                }
                DebugEventKind::CreateProcess {
                    base: info.lpBaseOfImage as u64,
                }
            }
            EXIT_PROCESS_DEBUG_EVENT => DebugEventKind::ExitProcess {
                code: unsafe { raw.u.ExitProcess() }.dwExitCode,
            },
            CREATE_THREAD_DEBUG_EVENT => DebugEventKind::CreateThread {
                start: unsafe { raw.u.CreateThread() }.lpStartAddress.map_or(0, |f| f as u64),
            },
            EXIT_THREAD_DEBUG_EVENT => DebugEventKind::ExitThread {
                code: unsafe { raw.u.ExitThread() }.dwExitCode,
            },
            LOAD_DLL_DEBUG_EVENT => {
                let info = unsafe { raw.u.LoadDll() };
                if !info.hFile.is_null() {
                    unsafe { CloseHandle(info.hFile) };
                }
                DebugEventKind::LoadDll {
                    base: info.lpBaseOfDll as u64,
                    path: None,
                }
            }
            UNLOAD_DLL_DEBUG_EVENT => DebugEventKind::UnloadDll {
                base: unsafe { raw.u.UnloadDll() }.lpBaseOfDll as u64,
            },
            OUTPUT_DEBUG_STRING_EVENT => {
                let info = unsafe { raw.u.DebugString() };
                DebugEventKind::OutputDebugString {
                    address: info.lpDebugStringData as u64,
                    length: info.nDebugStringLength as usize,
                    unicode: info.fUnicode != 0,
                }
            }
            RIP_EVENT => {
                let info = unsafe { raw.u.RipInfo() };
                DebugEventKind::Rip {
                    error: info.dwError,
                    kind: info.dwType,
                }
            }
            other => {
                log::warn!("Unknown debug event code {other}");
                DebugEventKind::Rip {
                    error: 0,
                    kind: other,
                }
            }
        };
        Ok(Some(DebugEvent {
            pid: raw.dwProcessId,
            tid: raw.dwThreadId,
            kind,
        }))
    }

    fn continue_debug_event(&self, pid: Pid, tid: Tid, status: ContinueStatus) -> Result<()> {
        let raw_status = match status {
            ContinueStatus::Continue => DBG_CONTINUE,
            ContinueStatus::NotHandled => DBG_EXCEPTION_NOT_HANDLED,
        };
        if unsafe { ContinueDebugEvent(pid, tid, raw_status as DWORD) } == FALSE {
            Err(last_error("ContinueDebugEvent"))
        } else {
            Ok(())
        }
    }

    fn modules(&self, pid: Pid) -> Result<Vec<ModuleInfo>> {
        let snapshot =
            unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPMODULE | TH32CS_SNAPMODULE32, pid) };
        if snapshot == INVALID_HANDLE_VALUE {
            return Err(last_error("CreateToolhelp32Snapshot"));
        }
        let mut modules = Vec::new();
        let mut entry: MODULEENTRY32W = unsafe { std::mem::zeroed() };
        entry.dwSize = size_of::<MODULEENTRY32W>() as DWORD;
        if unsafe { Module32FirstW(snapshot, &mut entry) } == TRUE {
            loop {
                modules.push(ModuleInfo {
                    name: wide_to_string(&entry.szModule),
                    path: wide_to_string(&entry.szExePath),
                    base: entry.modBaseAddr as u64,
                    size: u64::from(entry.modBaseSize),
                });
                if unsafe { Module32NextW(snapshot, &mut entry) } == FALSE {
                    break;
                }
            }
        }
        unsafe { CloseHandle(snapshot) };
        Ok(modules)
    }

    fn loader_entry(&self) -> Result<u64> {
        let name = U16CString::from_str("kernel32.dll").map_err(|_| Error::Internal {
            reason: "static module name contains a NUL",
        })?;
        let module = unsafe { GetModuleHandleW(name.as_ptr()) };
        if module.is_null() {
            return Err(last_error("GetModuleHandleW"));
        }
        let proc = unsafe { GetProcAddress(module, b"LoadLibraryA\0".as_ptr().cast()) };
        if proc.is_null() {
            Err(last_error("GetProcAddress"))
        } else {
            Ok(proc as u64)
        }
    }

    fn create_remote_thread(&self, handle: RawHandle, start: u64, param: u64) -> Result<()> {
        let thread = unsafe {
            CreateRemoteThread(
                handle.0 as HANDLE,
                std::ptr::null_mut(),
                0,
                Some(std::mem::transmute(start as usize)),
                param as LPVOID,
                0,
                std::ptr::null_mut(),
            )
        };
        if thread.is_null() {
            Err(last_error("CreateRemoteThread"))
        } else {
            unsafe { CloseHandle(thread) };
            Ok(())
        }
    }
}
