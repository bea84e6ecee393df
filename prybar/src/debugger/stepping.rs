//! Step-into / step-over on a parked loop.

use super::Debugger;
use crate::disasm::{self, FlowType, Instruction};
use crate::error::{Error, Result};
use crate::lock;
use std::sync::atomic::Ordering;

impl Debugger {
    /// Runs exactly one instruction: sets the trap flag in the published
    /// context and releases the gate. The single-step exception parks the
    /// loop again.
    pub fn step_into(&self) -> Result<()> {
        {
            let mut state = lock(&self.shared.target_state);
            let state = state.as_mut().ok_or(Error::NotPaused)?;
            state.context.set_trap_flag(true);
        }
        self.shared.step_request.store(true, Ordering::SeqCst);
        self.resume()
    }

    /// Steps over the current instruction. A `call` is skipped with a soft
    /// breakpoint on its fall-through; anything else degrades to
    /// [`Debugger::step_into`].
    pub fn step_over(&self) -> Result<()> {
        let instruction = self.current_instruction()?;
        if instruction.flow != FlowType::Call {
            return self.step_into();
        }

        let landing = instruction.address + instruction.len as u64;
        self.shared.breakpoints.set_soft(landing)?;
        *lock(&self.shared.step_over_bp) = Some(landing);
        log::debug!(
            "Stepping over {} at {:#x}, landing at {landing:#x}",
            instruction.mnemonic,
            instruction.address
        );
        self.resume()
    }

    /// Decodes the instruction the paused thread is about to execute.
    pub fn current_instruction(&self) -> Result<Instruction> {
        let ip = self.context()?.ip;
        let mut buf = [0u8; 16];
        let available = self.shared.process.read_available(ip, &mut buf)?;
        disasm::decode_one(&buf[..available], ip, self.shared.process.bitness()?)
            .ok_or(Error::DecodeFailure { address: ip })
    }

    /// Disassembly listing from the paused instruction pointer.
    pub fn disassemble_current(&self, count: usize) -> Result<Vec<String>> {
        let ip = self.context()?.ip;
        let mut buf = [0u8; 128];
        let available = self.shared.process.read_available(ip, &mut buf)?;
        let instructions = disasm::decode(&buf[..available], ip, self.shared.process.bitness()?);
        if instructions.is_empty() {
            return Err(Error::DecodeFailure { address: ip });
        }
        Ok(instructions
            .into_iter()
            .take(count)
            .map(|i| format!("{:#014x}  {}", i.address, i.text))
            .collect())
    }
}
