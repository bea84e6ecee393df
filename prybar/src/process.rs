//! Target access.
//!
//! [`Process`] owns the OS handle to the target for its lifetime. Every
//! other subsystem holds an `Arc<Process>` and goes through it for reads,
//! writes and region queries, so the "no target bound" check lives in
//! exactly one place.

use crate::error::{Error, Result};
use crate::os::{ModuleInfo, Pid, Platform, RawHandle, RegionInfo, Tid};
use once_cell::sync::OnceCell;
use std::sync::{Arc, PoisonError, RwLock};

struct Bound {
    pid: Pid,
    handle: RawHandle,
    is_64bit: bool,
    first_inst_pause: bool,
    main_tid: OnceCell<Tid>,
    entry: OnceCell<u64>,
}

pub struct Process {
    platform: Arc<dyn Platform>,
    state: RwLock<Option<Bound>>,
}

impl Process {
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self {
            platform,
            state: RwLock::new(None),
        }
    }

    pub(crate) fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    fn with<R>(&self, f: impl FnOnce(&Bound) -> Result<R>) -> Result<R> {
        let guard = self
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(bound) => f(bound),
            None => Err(Error::NotOpen),
        }
    }

    fn bind(&self, pid: Pid, handle: RawHandle, first_inst_pause: bool) -> Result<()> {
        // Bitness is interrogated once and cached with the handle; a 32-bit
        // target emulated on a 64-bit host counts as 32-bit everywhere.
        let is_64bit = if self.platform.pointer_width_64() {
            !self.platform.is_wow64(handle)?
        } else {
            false
        };

        let mut guard = self
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = guard.take() {
            self.platform.close_handle(previous.handle);
        }
        *guard = Some(Bound {
            pid,
            handle,
            is_64bit,
            first_inst_pause,
            main_tid: OnceCell::new(),
            entry: OnceCell::new(),
        });
        log::info!("Bound target pid {pid} (64-bit: {is_64bit})");
        Ok(())
    }

    pub fn open_by_pid(&self, pid: Pid) -> Result<()> {
        let handle = self.platform.open_process(pid)?;
        self.bind(pid, handle, false)
    }

    pub fn open_by_name(&self, name: &str) -> Result<()> {
        let wanted = name.to_ascii_lowercase();
        let with_exe = format!("{wanted}.exe");
        let entry = self
            .platform
            .processes()?
            .into_iter()
            .find(|p| {
                let candidate = p.name.to_ascii_lowercase();
                candidate == wanted || candidate == with_exe
            })
            .ok_or_else(|| Error::ProcessNotFound {
                name: name.to_string(),
            })?;
        self.open_by_pid(entry.pid)
    }

    /// Creates a new target under debug control. The caller must be the
    /// thread that will consume the debug events.
    pub fn create_and_debug(
        &self,
        path: &str,
        args: &str,
        pause_on_first_inst: bool,
    ) -> Result<()> {
        let created = self.platform.create_process_debug(path, args)?;
        self.bind(created.pid, created.process, pause_on_first_inst)?;
        self.with(|bound| {
            let _ = bound.main_tid.set(created.tid);
            Ok(())
        })
    }

    pub fn close(&self) {
        let mut guard = self
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(bound) = guard.take() {
            self.platform.close_handle(bound.handle);
            log::info!("Released target pid {}", bound.pid);
        }
    }

    pub fn is_open(&self) -> bool {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn pid(&self) -> Result<Pid> {
        self.with(|b| Ok(b.pid))
    }

    pub fn handle(&self) -> Result<RawHandle> {
        self.with(|b| Ok(b.handle))
    }

    pub fn is_64bit(&self) -> Result<bool> {
        self.with(|b| Ok(b.is_64bit))
    }

    /// Decoder bitness for this target.
    pub fn bitness(&self) -> Result<u32> {
        Ok(if self.is_64bit()? { 64 } else { 32 })
    }

    /// Whether thread contexts must be edited through the emulation layer.
    pub fn wow64(&self) -> Result<bool> {
        Ok(self.platform.pointer_width_64() && !self.is_64bit()?)
    }

    pub(crate) fn first_inst_pause(&self) -> Result<bool> {
        self.with(|b| Ok(b.first_inst_pause))
    }

    pub fn main_thread_id(&self) -> Result<Tid> {
        self.with(|bound| {
            bound
                .main_tid
                .get_or_try_init(|| {
                    self.platform
                        .threads(bound.pid)?
                        .into_iter()
                        .min()
                        .ok_or(Error::Terminated)
                })
                .map(|&tid| tid)
        })
    }

    /// Reads exactly `buf.len()` bytes; a short transfer is an error.
    pub fn read(&self, address: u64, buf: &mut [u8]) -> Result<()> {
        self.with(|bound| {
            let transferred = self.platform.read_memory(bound.handle, address, buf)?;
            if transferred < buf.len() {
                return Err(Error::PartialTransfer {
                    address,
                    requested: buf.len(),
                    transferred,
                });
            }
            Ok(())
        })
    }

    /// Reads as much of `buf` as the target can provide.
    pub fn read_available(&self, address: u64, buf: &mut [u8]) -> Result<usize> {
        self.with(|bound| self.platform.read_memory(bound.handle, address, buf))
    }

    pub fn read_byte(&self, address: u64) -> Result<u8> {
        let mut byte = [0u8; 1];
        self.read(address, &mut byte)?;
        Ok(byte[0])
    }

    pub fn read_struct<T: bytemuck::AnyBitPattern>(&self, address: u64) -> Result<T> {
        let mut buf = vec![0u8; core::mem::size_of::<T>()];
        self.read(address, &mut buf)?;
        Ok(bytemuck::pod_read_unaligned(&buf))
    }

    /// Writes without touching any patch bookkeeping. A short transfer is an
    /// error; callers that retry (the first-instruction arming) match on it.
    pub fn write_raw(&self, address: u64, bytes: &[u8]) -> Result<()> {
        self.with(|bound| {
            let transferred = self.platform.write_memory(bound.handle, address, bytes)?;
            if transferred < bytes.len() {
                return Err(Error::PartialTransfer {
                    address,
                    requested: bytes.len(),
                    transferred,
                });
            }
            Ok(())
        })
    }

    /// Walks the address space from `min` to `max` by successive region
    /// queries, keeping the readable ones.
    pub fn readable_regions(&self, min: u64, max: u64) -> Result<Vec<RegionInfo>> {
        self.with(|bound| {
            let mut regions = Vec::new();
            let mut address = min;
            while address < max {
                let Some(region) = self.platform.query_region(bound.handle, address) else {
                    break;
                };
                if region.size == 0 {
                    break;
                }
                if region.is_readable() {
                    regions.push(region);
                }
                address = region.base + region.size;
            }
            Ok(regions)
        })
    }

    pub fn is_readable(&self, address: u64) -> bool {
        self.with(|bound| {
            Ok(self
                .platform
                .query_region(bound.handle, address)
                .map(|r| r.is_readable())
                .unwrap_or(false))
        })
        .unwrap_or(false)
    }

    pub fn modules(&self) -> Result<Vec<ModuleInfo>> {
        self.with(|bound| self.platform.modules(bound.pid))
    }

    pub fn module_by_name(&self, name: &str) -> Result<Option<ModuleInfo>> {
        Ok(self
            .modules()?
            .into_iter()
            .find(|m| m.name.eq_ignore_ascii_case(name)))
    }

    pub fn module_containing(&self, address: u64) -> Result<Option<ModuleInfo>> {
        Ok(self
            .modules()?
            .into_iter()
            .find(|m| address >= m.base && address < m.base + m.size))
    }

    /// Base of the main module.
    pub fn base_address(&self) -> Result<u64> {
        self.modules()?
            .first()
            .map(|m| m.base)
            .ok_or(Error::Terminated)
    }

    /// Entry point of the main module, resolved from its PE header.
    pub fn entry_point(&self) -> Result<u64> {
        let base = self.base_address()?;
        self.with(|bound| {
            bound
                .entry
                .get_or_try_init(|| self.parse_entry_point(base))
                .map(|&entry| entry)
        })
    }

    fn parse_entry_point(&self, base: u64) -> Result<u64> {
        let mut dos_magic = [0u8; 2];
        self.read(base, &mut dos_magic)?;
        if &dos_magic != b"MZ" {
            return Err(Error::BadImage { address: base });
        }
        let pe_offset = u64::from(self.read_struct::<u32>(base + 0x3C)?);
        let mut pe_magic = [0u8; 4];
        self.read(base + pe_offset, &mut pe_magic)?;
        if &pe_magic != b"PE\0\0" {
            return Err(Error::BadImage { address: base });
        }
        // Optional header magic distinguishes PE32 from PE32+; both keep
        // AddressOfEntryPoint at the same offset.
        let optional_magic = self.read_struct::<u16>(base + pe_offset + 0x18)?;
        if optional_magic != 0x10B && optional_magic != 0x20B {
            return Err(Error::BadImage { address: base });
        }
        let entry_rva = self.read_struct::<u32>(base + pe_offset + 0x28)?;
        Ok(base + u64::from(entry_rva))
    }

    pub fn alloc(&self, size: usize) -> Result<u64> {
        self.with(|bound| self.platform.alloc_memory(bound.handle, size))
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::sim::SimPlatform;
    use crate::os::{Protection, RegionKind};

    fn sim_process() -> (Arc<SimPlatform>, Process) {
        let sim = Arc::new(SimPlatform::new());
        sim.add_process(42, "target.exe");
        (sim.clone(), Process::new(sim))
    }

    #[test]
    fn test_not_open_fails_fast() {
        let (_sim, process) = sim_process();
        assert!(matches!(process.read_byte(0x1000), Err(Error::NotOpen)));
        assert!(matches!(
            process.write_raw(0x1000, &[0]),
            Err(Error::NotOpen)
        ));
        assert!(matches!(process.main_thread_id(), Err(Error::NotOpen)));
    }

    #[test]
    fn test_open_by_name_matches_without_extension() {
        let (_sim, process) = sim_process();
        process.open_by_name("TARGET").unwrap();
        assert_eq!(process.pid().unwrap(), 42);
    }

    #[test]
    fn test_open_by_name_unknown() {
        let (_sim, process) = sim_process();
        assert!(matches!(
            process.open_by_name("absent"),
            Err(Error::ProcessNotFound { .. })
        ));
    }

    #[test]
    fn test_readable_regions_skip_mapped_and_unreadable() {
        let (sim, process) = sim_process();
        sim.add_region(0x1000, 0x1000, Protection::READ, RegionKind::Private);
        sim.add_region(0x2000, 0x1000, Protection::READ, RegionKind::Mapped);
        sim.add_region(0x3000, 0x1000, Protection::NO_ACCESS, RegionKind::Private);
        sim.add_region(
            0x4000,
            0x1000,
            Protection::READ | Protection::EXECUTE,
            RegionKind::Image,
        );
        process.open_by_pid(42).unwrap();

        let regions = process.readable_regions(0x1000, 0x5000).unwrap();
        let bases: Vec<u64> = regions.iter().map(|r| r.base).collect();
        assert_eq!(bases, vec![0x1000, 0x4000]);
    }

    #[test]
    fn test_entry_point_from_pe_header() {
        let (sim, process) = sim_process();
        sim.add_region(0x40_0000, 0x1000, Protection::READ, RegionKind::Image);
        sim.add_module("target.exe", 0x40_0000, 0x1000);
        // Minimal header chain: MZ, e_lfanew = 0x80, PE signature, PE32
        // optional magic, AddressOfEntryPoint = 0x1234.
        sim.poke(0x40_0000, b"MZ");
        sim.poke(0x40_0000 + 0x3C, &0x80u32.to_le_bytes());
        sim.poke(0x40_0080, b"PE\0\0");
        sim.poke(0x40_0080 + 0x18, &0x10Bu16.to_le_bytes());
        sim.poke(0x40_0080 + 0x28, &0x1234u32.to_le_bytes());
        process.open_by_pid(42).unwrap();

        assert_eq!(process.entry_point().unwrap(), 0x40_1234);
    }

    #[test]
    fn test_partial_read_is_an_error() {
        let (sim, process) = sim_process();
        sim.add_region(0x1000, 0x10, Protection::READ, RegionKind::Private);
        process.open_by_pid(42).unwrap();

        let mut buf = [0u8; 32];
        assert!(matches!(
            process.read(0x1008, &mut buf),
            Err(Error::PartialTransfer {
                transferred: 8,
                ..
            })
        ));
        assert_eq!(process.read_available(0x1008, &mut buf).unwrap(), 8);
    }
}
