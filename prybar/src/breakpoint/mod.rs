//! Breakpoint engine.
//!
//! Software breakpoints replace one byte with INT3 and keep the original in
//! a registry. A hit is continued transparently: the original byte goes
//! back, the instruction pointer is rewound, the trap flag is set, and the
//! single-step exception that follows re-arms the INT3. Hardware
//! breakpoints program DR0-DR3/DR7 through the context gate.

pub mod hardware;

use crate::context::ContextEdit;
use crate::error::{Error, Result};
use crate::lock;
use crate::os::{ThreadContext, Tid};
use crate::process::Process;
use fnv::FnvHashMap;
use hardware::{Access, Dr7, Length, HARD_SLOTS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// INT3.
pub const TRAP_OPCODE: u8 = 0xCC;

pub struct BreakpointEngine {
    process: Arc<Process>,
    soft: Mutex<FnvHashMap<u64, u8>>,
    pending_rearm: Mutex<Option<u64>>,
    initial_hit: AtomicBool,
}

impl BreakpointEngine {
    pub fn new(process: Arc<Process>) -> Self {
        Self {
            process,
            soft: Mutex::new(FnvHashMap::default()),
            pending_rearm: Mutex::new(None),
            initial_hit: AtomicBool::new(false),
        }
    }

    /// Arms a software breakpoint. At most one record exists per address;
    /// re-arming an armed address keeps the first saved byte.
    pub fn set_soft(&self, address: u64) -> Result<()> {
        let mut soft = lock(&self.soft);
        if soft.contains_key(&address) {
            return Ok(());
        }
        let original = self.process.read_byte(address)?;
        self.process.write_raw(address, &[TRAP_OPCODE])?;
        soft.insert(address, original);
        log::debug!("Soft breakpoint set at {address:#x} (was {original:#04x})");
        Ok(())
    }

    pub fn unset_soft(&self, address: u64) -> Result<()> {
        let original = lock(&self.soft)
            .remove(&address)
            .ok_or(Error::NotFound { address })?;
        self.process.write_raw(address, &[original])?;
        log::debug!("Soft breakpoint cleared at {address:#x}");
        Ok(())
    }

    pub fn unset_all_soft(&self) {
        let drained: Vec<(u64, u8)> = lock(&self.soft).drain().collect();
        for (address, original) in drained {
            if let Err(err) = self.process.write_raw(address, &[original]) {
                log::warn!("Failed to restore breakpoint byte at {address:#x}: {err}");
            }
        }
    }

    pub fn has_soft(&self, address: u64) -> bool {
        lock(&self.soft).contains_key(&address)
    }

    pub fn soft_count(&self) -> usize {
        lock(&self.soft).len()
    }

    /// Marks the OS-injected attach breakpoint. Returns true exactly once,
    /// on the transition.
    pub(crate) fn note_initial(&self) -> bool {
        !self.initial_hit.swap(true, Ordering::SeqCst)
    }

    pub fn initial_breakpoint_hit(&self) -> bool {
        self.initial_hit.load(Ordering::SeqCst)
    }

    /// First half of the transparent restore-and-continue protocol. If
    /// `address` is ours: original byte back in place, instruction pointer
    /// rewound, trap flag set, and the re-arm noted for the single-step
    /// exception that follows. Returns false when the address has no record.
    pub(crate) fn begin_transparent_continue(
        &self,
        address: u64,
        context: &mut ThreadContext,
    ) -> Result<bool> {
        let original = match lock(&self.soft).get(&address) {
            Some(&byte) => byte,
            None => return Ok(false),
        };
        self.process.write_raw(address, &[original])?;
        context.ip = address;
        context.set_trap_flag(true);
        *lock(&self.pending_rearm) = Some(address);
        Ok(true)
    }

    /// Second half: re-writes INT3 after the restored instruction retired.
    /// Returns true when a re-arm was pending, whether or not the
    /// breakpoint still exists (it may have been unset while parked).
    pub(crate) fn complete_rearm(&self) -> Result<bool> {
        let Some(address) = lock(&self.pending_rearm).take() else {
            return Ok(false);
        };
        if lock(&self.soft).contains_key(&address) {
            self.process.write_raw(address, &[TRAP_OPCODE])?;
        }
        Ok(true)
    }

    pub(crate) fn rearm_pending(&self) -> bool {
        lock(&self.pending_rearm).is_some()
    }

    fn edit_context(&self, tid: Tid) -> Result<ContextEdit> {
        ContextEdit::begin(
            Arc::clone(self.process.platform()),
            tid,
            self.process.wow64()?,
        )
    }

    /// Programs one hardware slot on `tid`.
    pub fn set_hard(
        &self,
        tid: Tid,
        address: u64,
        slot: usize,
        length: Length,
        access: Access,
    ) -> Result<()> {
        if slot >= HARD_SLOTS {
            return Err(Error::Internal {
                reason: "hardware breakpoint slot out of range",
            });
        }
        let mut edit = self.edit_context(tid)?;
        edit.context.dr[slot] = address;
        let mut dr7 = Dr7(edit.context.dr7);
        dr7.arm_slot(slot, access, length);
        edit.context.dr7 = dr7.0;
        edit.commit()?;
        log::debug!("Hardware breakpoint {slot} set at {address:#x} on thread {tid}");
        Ok(())
    }

    /// Clears whichever slot watches `address`.
    pub fn unset_hard(&self, tid: Tid, address: u64) -> Result<()> {
        let mut edit = self.edit_context(tid)?;
        let mut dr7 = Dr7(edit.context.dr7);
        let slot = (0..HARD_SLOTS)
            .find(|&i| edit.context.dr[i] == address && dr7.slot_enabled(i))
            .ok_or(Error::NotFound { address })?;
        edit.context.dr[slot] = 0;
        dr7.clear_slot(slot);
        edit.context.dr7 = dr7.0;
        edit.commit()
    }

    pub fn unset_all_hard(&self, tid: Tid) -> Result<()> {
        let mut edit = self.edit_context(tid)?;
        edit.context.dr = [0; HARD_SLOTS];
        edit.context.dr7 = 0;
        edit.commit()
    }

    /// Clears every breakpoint of both kinds.
    pub fn unset_all(&self, tid: Tid) -> Result<()> {
        self.unset_all_soft();
        self.unset_all_hard(tid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::sim::SimPlatform;
    use crate::os::{Protection, RegionKind, ThreadContext};

    fn engine() -> (Arc<SimPlatform>, BreakpointEngine) {
        let sim = Arc::new(SimPlatform::new());
        sim.add_process(42, "target.exe");
        sim.add_region(
            0x40_1000,
            0x1000,
            Protection::READ | Protection::EXECUTE,
            RegionKind::Image,
        );
        sim.add_thread(1, ThreadContext::default());
        let process = Arc::new(Process::new(sim.clone()));
        process.open_by_pid(42).unwrap();
        (sim, BreakpointEngine::new(process))
    }

    #[test]
    fn test_soft_set_writes_trap_byte() {
        let (sim, engine) = engine();
        sim.poke(0x40_1000, &[0x55, 0x8B, 0xEC]);

        engine.set_soft(0x40_1000).unwrap();
        assert_eq!(sim.peek(0x40_1000, 1), vec![TRAP_OPCODE]);

        engine.unset_soft(0x40_1000).unwrap();
        assert_eq!(sim.peek(0x40_1000, 3), vec![0x55, 0x8B, 0xEC]);
    }

    #[test]
    fn test_soft_rearm_keeps_first_original() {
        let (sim, engine) = engine();
        sim.poke(0x40_1000, &[0x55]);
        engine.set_soft(0x40_1000).unwrap();
        // A second arm must not record the trap byte as the original.
        engine.set_soft(0x40_1000).unwrap();
        engine.unset_soft(0x40_1000).unwrap();
        assert_eq!(sim.peek(0x40_1000, 1), vec![0x55]);
    }

    #[test]
    fn test_unset_unknown_soft_reports_not_found() {
        let (_sim, engine) = engine();
        assert!(matches!(
            engine.unset_soft(0x40_1000),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_transparent_protocol_round_trip() {
        let (sim, engine) = engine();
        sim.poke(0x40_1000, &[0x55, 0x8B, 0xEC]);
        engine.set_soft(0x40_1000).unwrap();

        let mut context = ThreadContext {
            ip: 0x40_1001,
            ..ThreadContext::default()
        };
        assert!(engine
            .begin_transparent_continue(0x40_1000, &mut context)
            .unwrap());
        assert_eq!(sim.peek(0x40_1000, 1), vec![0x55]);
        assert_eq!(context.ip, 0x40_1000);
        assert!(context.trap_flag());
        assert!(engine.rearm_pending());

        assert!(engine.complete_rearm().unwrap());
        assert_eq!(sim.peek(0x40_1000, 1), vec![TRAP_OPCODE]);
        assert!(!engine.rearm_pending());
    }

    #[test]
    fn test_transparent_protocol_ignores_foreign_address() {
        let (_sim, engine) = engine();
        let mut context = ThreadContext::default();
        assert!(!engine
            .begin_transparent_continue(0x40_1500, &mut context)
            .unwrap());
        assert!(!context.trap_flag());
    }

    #[test]
    fn test_initial_breakpoint_transitions_once() {
        let (_sim, engine) = engine();
        assert!(!engine.initial_breakpoint_hit());
        assert!(engine.note_initial());
        assert!(!engine.note_initial());
        assert!(engine.initial_breakpoint_hit());
    }

    #[test]
    fn test_set_hard_programs_slot0() {
        let (sim, engine) = engine();
        engine
            .set_hard(1, 0x40_1100, 0, Length::Four, Access::Write)
            .unwrap();

        let context = sim.context_of(1);
        assert_eq!(context.dr[0], 0x40_1100);
        // L0 + G0 enabled, RW0 = write, LEN0 = four bytes.
        assert_eq!(context.dr7 & 0b11, 0b11);
        assert_eq!((context.dr7 >> 16) & 0b11, 0b01);
        assert_eq!((context.dr7 >> 18) & 0b11, 0b11);
    }

    #[test]
    fn test_unset_hard_clears_matching_slot() {
        let (sim, engine) = engine();
        engine
            .set_hard(1, 0x40_1100, 0, Length::Four, Access::Write)
            .unwrap();
        engine
            .set_hard(1, 0x40_2000, 2, Length::One, Access::Execute)
            .unwrap();

        engine.unset_hard(1, 0x40_1100).unwrap();
        let context = sim.context_of(1);
        assert_eq!(context.dr[0], 0);
        assert_eq!(context.dr7 & 0b11, 0);
        // Slot 2 survives.
        assert_eq!(context.dr[2], 0x40_2000);
        assert_ne!(context.dr7 & (0b11 << 4), 0);

        assert!(matches!(
            engine.unset_hard(1, 0x40_1100),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_unset_all_hard_zeroes_registers() {
        let (sim, engine) = engine();
        engine
            .set_hard(1, 0x40_1100, 1, Length::Two, Access::ReadWrite)
            .unwrap();
        engine.unset_all_hard(1).unwrap();

        let context = sim.context_of(1);
        assert_eq!(context.dr, [0; 4]);
        assert_eq!(context.dr7, 0);
    }

    #[test]
    fn test_slot_out_of_range() {
        let (_sim, engine) = engine();
        assert!(matches!(
            engine.set_hard(1, 0x40_1100, 4, Length::One, Access::Execute),
            Err(Error::Internal { .. })
        ));
    }
}
