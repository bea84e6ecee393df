//! Disassembler adapter.
//!
//! The engine consumes decoding as a pure function over bytes; iced-x86 does
//! the heavy lifting and this module reduces its output to the mnemonic,
//! length, flow class and branch target the rest of the crate cares about.

use iced_x86::{Decoder, DecoderOptions, FastFormatter, OpKind};

/// Control-flow class of a decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowType {
    None,
    Call,
    Return,
    SysCall,
    UnconditionalBranch,
    ConditionalBranch,
    Interrupt,
    CMovCC,
}

/// One decoded instruction.
#[derive(Debug, Clone)]
pub struct Instruction {
    pub address: u64,
    pub mnemonic: String,
    pub text: String,
    pub len: usize,
    pub flow: FlowType,
    pub branch_target: Option<u64>,
}

/// Maps a mnemonic onto its flow class.
///
/// `jmp` must be claimed before the generic `j`-prefix rule, and `sys`
/// before the `ret` substring rule so `sysret` lands in the syscall class.
pub fn classify(mnemonic: &str) -> FlowType {
    if mnemonic.starts_with("call") {
        FlowType::Call
    } else if mnemonic == "jmp" {
        FlowType::UnconditionalBranch
    } else if mnemonic.starts_with("cmov") {
        FlowType::CMovCC
    } else if mnemonic.starts_with('j') || mnemonic.starts_with("loop") {
        FlowType::ConditionalBranch
    } else if mnemonic.starts_with("sys") {
        FlowType::SysCall
    } else if mnemonic.starts_with("int") || mnemonic == "ud2" {
        FlowType::Interrupt
    } else if mnemonic.contains("ret") {
        FlowType::Return
    } else {
        FlowType::None
    }
}

/// Decodes `bytes` as they would execute at `address`. Decoding stops at the
/// first invalid instruction; the caller treats an empty result as a decode
/// failure.
pub fn decode(bytes: &[u8], address: u64, bitness: u32) -> Vec<Instruction> {
    let mut decoder = Decoder::with_ip(bitness, bytes, address, DecoderOptions::NONE);
    let mut formatter = FastFormatter::new();
    let mut instructions = Vec::new();

    for instr in &mut decoder {
        if instr.is_invalid() {
            break;
        }

        let mut text = String::new();
        formatter.format(&instr, &mut text);
        let mnemonic = text
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_string();
        let flow = classify(&mnemonic);

        let branch_target = match instr.op0_kind() {
            OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64
                if flow != FlowType::None =>
            {
                Some(instr.near_branch_target())
            }
            _ => None,
        };

        instructions.push(Instruction {
            address: instr.ip(),
            mnemonic,
            text,
            len: instr.len(),
            flow,
            branch_target,
        });
    }

    instructions
}

/// Decodes only the instruction at `address`.
pub fn decode_one(bytes: &[u8], address: u64, bitness: u32) -> Option<Instruction> {
    decode(bytes, address, bitness).into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_table() {
        assert_eq!(classify("call"), FlowType::Call);
        assert_eq!(classify("jmp"), FlowType::UnconditionalBranch);
        assert_eq!(classify("jne"), FlowType::ConditionalBranch);
        assert_eq!(classify("loopne"), FlowType::ConditionalBranch);
        assert_eq!(classify("cmovae"), FlowType::CMovCC);
        assert_eq!(classify("syscall"), FlowType::SysCall);
        assert_eq!(classify("sysret"), FlowType::SysCall);
        assert_eq!(classify("int3"), FlowType::Interrupt);
        assert_eq!(classify("ud2"), FlowType::Interrupt);
        assert_eq!(classify("ret"), FlowType::Return);
        assert_eq!(classify("iret"), FlowType::Return);
        assert_eq!(classify("mov"), FlowType::None);
    }

    #[test]
    fn test_decode_prologue_32bit() {
        // push ebp; mov ebp, esp; sub esp, 0x10
        let bytes = [0x55, 0x8B, 0xEC, 0x83, 0xEC, 0x10];
        let instructions = decode(&bytes, 0x0040_1000, 32);
        assert_eq!(instructions.len(), 3);
        assert_eq!(instructions[0].address, 0x0040_1000);
        assert_eq!(instructions[0].mnemonic, "push");
        assert_eq!(instructions[0].len, 1);
        assert_eq!(instructions[1].address, 0x0040_1001);
        assert_eq!(instructions[1].len, 2);
        assert!(instructions.iter().all(|i| i.flow == FlowType::None));
    }

    #[test]
    fn test_decode_call_target() {
        // call 0x00401500 encoded relative to 0x00401020
        let bytes = [0xE8, 0xDB, 0x04, 0x00, 0x00];
        let instr = decode_one(&bytes, 0x0040_1020, 32).unwrap();
        assert_eq!(instr.flow, FlowType::Call);
        assert_eq!(instr.len, 5);
        assert_eq!(instr.branch_target, Some(0x0040_1500));
    }

    #[test]
    fn test_decode_stops_on_garbage() {
        // One valid push, then bytes no decoder accepts.
        let bytes = [0x55, 0x06, 0x06];
        let instructions = decode(&bytes, 0x1000, 64);
        assert_eq!(instructions.len(), 1);
    }
}
