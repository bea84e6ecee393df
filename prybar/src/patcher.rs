//! Patch registry and freeze enforcement.
//!
//! Writes that save their old value (or freeze their new one) are recorded
//! by address. A background worker re-applies every frozen value on a
//! cadence; it is spawned when the registry becomes non-empty and exits on
//! its own once the registry drains.

use crate::disasm;
use crate::error::{Error, Result};
use crate::lock;
use crate::process::Process;
use bitflags::bitflags;
use fnv::FnvHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

pub const DEFAULT_FREEZE_FREQUENCY_MS: u64 = 100;

const NOP: u8 = 0x90;

bitflags! {
    /// Behaviour switches for [`Patcher::write`].
    pub struct WriteOptions: u32 {
        /// Record the bytes being replaced so they can be restored.
        const SAVE_OLD = 0b01;
        /// Keep rewriting the new bytes on the freeze cadence.
        const FREEZE = 0b10;
    }
}

#[derive(Debug, Clone)]
struct PatchRecord {
    address: u64,
    old_bytes: Vec<u8>,
    new_bytes: Vec<u8>,
    frozen: bool,
}

pub struct Patcher {
    process: Arc<Process>,
    records: Arc<Mutex<FnvHashMap<u64, PatchRecord>>>,
    freeze_ms: Arc<AtomicU64>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Patcher {
    pub fn new(process: Arc<Process>) -> Self {
        Self {
            process,
            records: Arc::new(Mutex::new(FnvHashMap::default())),
            freeze_ms: Arc::new(AtomicU64::new(DEFAULT_FREEZE_FREQUENCY_MS)),
            worker: Mutex::new(None),
        }
    }

    pub fn set_freeze_frequency(&self, milliseconds: u64) {
        self.freeze_ms.store(milliseconds.max(1), Ordering::Relaxed);
    }

    pub fn record_count(&self) -> usize {
        lock(&self.records).len()
    }

    pub fn is_frozen(&self, address: u64) -> bool {
        lock(&self.records)
            .get(&address)
            .map(|r| r.frozen)
            .unwrap_or(false)
    }

    /// Writes `bytes` at `address`. With `SAVE_OLD` the replaced bytes are
    /// read first and the write is aborted if that read fails; with either
    /// option the record is inserted (or updated) under its address. The
    /// original bytes of an existing record are kept so restore returns the
    /// pristine value, not an intermediate patch.
    pub fn write(&self, address: u64, bytes: &[u8], opts: WriteOptions) -> Result<()> {
        let keep_record = opts.intersects(WriteOptions::SAVE_OLD | WriteOptions::FREEZE);

        let old_bytes = if keep_record {
            let mut old = vec![0u8; bytes.len()];
            self.process.read(address, &mut old)?;
            old
        } else {
            Vec::new()
        };

        self.process.write_raw(address, bytes)?;

        if keep_record {
            let mut records = lock(&self.records);
            records
                .entry(address)
                .and_modify(|record| {
                    record.new_bytes = bytes.to_vec();
                    record.frozen |= opts.contains(WriteOptions::FREEZE);
                })
                .or_insert_with(|| PatchRecord {
                    address,
                    old_bytes,
                    new_bytes: bytes.to_vec(),
                    frozen: opts.contains(WriteOptions::FREEZE),
                });
            if !records.is_empty() {
                drop(records);
                self.ensure_worker();
            }
        }
        Ok(())
    }

    pub fn write_struct<T: bytemuck::NoUninit>(
        &self,
        address: u64,
        value: T,
        opts: WriteOptions,
    ) -> Result<()> {
        self.write(address, bytemuck::bytes_of(&value), opts)
    }

    /// Overwrites `count` bytes with NOPs, saving the old bytes.
    pub fn nop(&self, address: u64, count: usize) -> Result<()> {
        self.write(address, &vec![NOP; count], WriteOptions::SAVE_OLD)
    }

    /// NOPs exactly the instruction at `address`, whatever its length.
    pub fn nop_instruction(&self, address: u64) -> Result<()> {
        let mut buf = [0u8; 16];
        let available = self.process.read_available(address, &mut buf)?;
        let instruction = disasm::decode_one(&buf[..available], address, self.process.bitness()?)
            .ok_or(Error::DecodeFailure { address })?;
        self.nop(address, instruction.len)
    }

    /// Pins `new_bytes` at `address`: written now and re-written by the
    /// enforcer until unfrozen.
    pub fn freeze(&self, address: u64, new_bytes: &[u8]) -> Result<()> {
        self.write(
            address,
            new_bytes,
            WriteOptions::SAVE_OLD | WriteOptions::FREEZE,
        )
    }

    pub fn unfreeze(&self, address: u64, restore_value: bool, remove: bool) -> Result<()> {
        let mut records = lock(&self.records);
        let record = records
            .get_mut(&address)
            .ok_or(Error::NotFound { address })?;
        record.frozen = false;
        let old_bytes = record.old_bytes.clone();
        if remove {
            records.remove(&address);
        }
        drop(records);

        if restore_value {
            self.process.write_raw(address, &old_bytes)?;
        }
        Ok(())
    }

    /// Puts the saved bytes back.
    pub fn restore(&self, address: u64, remove: bool) -> Result<()> {
        let mut records = lock(&self.records);
        let record = records.get(&address).ok_or(Error::NotFound { address })?;
        let old_bytes = record.old_bytes.clone();
        if remove {
            records.remove(&address);
        }
        drop(records);

        self.process.write_raw(address, &old_bytes)
    }

    pub fn restore_all(&self, remove: bool) -> Result<()> {
        let addresses: Vec<u64> = lock(&self.records).keys().copied().collect();
        for address in addresses {
            if let Err(err) = self.restore(address, remove) {
                log::warn!("Failed to restore {address:#x}: {err}");
            }
        }
        Ok(())
    }

    /// Spawns the freeze enforcer unless one is already running.
    fn ensure_worker(&self) {
        let mut worker = lock(&self.worker);
        if let Some(handle) = worker.as_ref() {
            if !handle.is_finished() {
                return;
            }
        }

        let process = Arc::clone(&self.process);
        let records = Arc::clone(&self.records);
        let freeze_ms = Arc::clone(&self.freeze_ms);
        *worker = Some(std::thread::spawn(move || {
            log::trace!("Freeze enforcer started");
            loop {
                std::thread::sleep(Duration::from_millis(freeze_ms.load(Ordering::Relaxed)));
                let records = lock(&records);
                if records.is_empty() {
                    break;
                }
                for record in records.values().filter(|r| r.frozen) {
                    // Raw writes only: enforcement must never mint records.
                    if let Err(err) = process.write_raw(record.address, &record.new_bytes) {
                        log::warn!("Freeze write at {:#x} failed: {err}", record.address);
                    }
                }
            }
            log::trace!("Freeze enforcer exited");
        }));
    }
}

impl Drop for Patcher {
    fn drop(&mut self) {
        // Drain the registry so the enforcer exits, then wait it out.
        lock(&self.records).clear();
        if let Some(handle) = lock(&self.worker).take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::sim::SimPlatform;
    use crate::os::{Protection, RegionKind};
    use std::time::Instant;

    fn patched_target() -> (Arc<SimPlatform>, Patcher) {
        let sim = Arc::new(SimPlatform::new());
        sim.add_process(42, "target.exe");
        sim.add_region(0x50_0000, 0x1000, Protection::READ | Protection::WRITE, RegionKind::Private);
        let process = Arc::new(Process::new(sim.clone()));
        process.open_by_pid(42).unwrap();
        (sim, Patcher::new(process))
    }

    #[test]
    fn test_write_and_restore_round_trip() {
        let (sim, patcher) = patched_target();
        sim.poke(0x50_0010, &[0x11, 0x22, 0x33]);

        patcher
            .write(0x50_0010, &[0xAA, 0xBB, 0xCC], WriteOptions::SAVE_OLD)
            .unwrap();
        assert_eq!(sim.peek(0x50_0010, 3), vec![0xAA, 0xBB, 0xCC]);

        patcher.restore(0x50_0010, true).unwrap();
        assert_eq!(sim.peek(0x50_0010, 3), vec![0x11, 0x22, 0x33]);
    }

    #[test]
    fn test_restore_twice_reports_not_found() {
        let (_sim, patcher) = patched_target();
        patcher
            .write(0x50_0000, &[0x01], WriteOptions::SAVE_OLD)
            .unwrap();
        patcher.restore(0x50_0000, true).unwrap();
        assert!(matches!(
            patcher.restore(0x50_0000, true),
            Err(Error::NotFound { address: 0x50_0000 })
        ));
    }

    #[test]
    fn test_plain_write_keeps_no_record() {
        let (_sim, patcher) = patched_target();
        patcher
            .write(0x50_0000, &[0x01], WriteOptions::empty())
            .unwrap();
        assert_eq!(patcher.record_count(), 0);
    }

    #[test]
    fn test_second_write_keeps_pristine_old_bytes() {
        let (sim, patcher) = patched_target();
        sim.poke(0x50_0020, &[0x77]);

        patcher
            .write(0x50_0020, &[0x01], WriteOptions::SAVE_OLD)
            .unwrap();
        patcher
            .write(0x50_0020, &[0x02], WriteOptions::SAVE_OLD)
            .unwrap();
        patcher.restore(0x50_0020, true).unwrap();
        assert_eq!(sim.peek(0x50_0020, 1), vec![0x77]);
    }

    #[test]
    fn test_failed_old_read_aborts_write() {
        let (sim, patcher) = patched_target();
        // Straddles the end of the region, so the save-old read comes short.
        let result = patcher.write(0x50_0FFF, &[0x01, 0x02], WriteOptions::SAVE_OLD);
        assert!(matches!(result, Err(Error::PartialTransfer { .. })));
        assert_eq!(sim.peek(0x50_0FFF, 1), vec![0x00]);
    }

    #[test]
    fn test_nop_instruction_covers_exact_length() {
        let (sim, patcher) = patched_target();
        // sub esp, 0x10 is three bytes; the byte after must survive.
        sim.poke(0x50_0100, &[0x83, 0xEC, 0x10, 0x55]);
        patcher.nop_instruction(0x50_0100).unwrap();
        assert_eq!(sim.peek(0x50_0100, 4), vec![0x90, 0x90, 0x90, 0x55]);
    }

    #[test]
    fn test_write_struct_little_endian() {
        let (sim, patcher) = patched_target();
        patcher
            .write_struct::<u32>(0x50_0200, 0xDEAD_BEEF, WriteOptions::empty())
            .unwrap();
        assert_eq!(sim.peek(0x50_0200, 4), vec![0xEF, 0xBE, 0xAD, 0xDE]);
    }

    #[test]
    fn test_freeze_defeats_external_write() {
        let (sim, patcher) = patched_target();
        patcher.set_freeze_frequency(10);
        patcher.freeze(0x50_0000, &[0xAA]).unwrap();
        assert!(patcher.is_frozen(0x50_0000));

        sim.poke(0x50_0000, &[0xBB]);
        let deadline = Instant::now() + Duration::from_millis(500);
        loop {
            if sim.peek(0x50_0000, 1) == vec![0xAA] {
                break;
            }
            assert!(Instant::now() < deadline, "freeze never re-applied");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_unfreeze_restores_and_stops_enforcement() {
        let (sim, patcher) = patched_target();
        patcher.set_freeze_frequency(10);
        sim.poke(0x50_0000, &[0x55]);
        patcher.freeze(0x50_0000, &[0xAA]).unwrap();

        patcher.unfreeze(0x50_0000, true, true).unwrap();
        assert_eq!(sim.peek(0x50_0000, 1), vec![0x55]);
        assert_eq!(patcher.record_count(), 0);

        // With the registry drained the enforcer exits and external writes
        // stick.
        sim.poke(0x50_0000, &[0xBB]);
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(sim.peek(0x50_0000, 1), vec![0xBB]);
    }
}
