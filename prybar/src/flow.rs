//! Basic-block graph construction.
//!
//! Pages are read and disassembled on demand, once each. Blocks accumulate
//! instructions until the first control-flow instruction; calls get a stub
//! successor instead of expanding the callee. Block ids come from one
//! process-wide counter so renderings stay stable across graphs.

use crate::disasm::{self, FlowType, Instruction};
use crate::error::{Error, Result};
use crate::process::Process;
use fnv::FnvHashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub const PAGE_SIZE: usize = 0x1000;

static NEXT_BLOCK_ID: AtomicUsize = AtomicUsize::new(0);

/// A straight-line run of instructions ending at its only control-flow
/// instruction. `prev`/`next` are indices into the owning graph.
pub struct BasicBlock {
    pub id: usize,
    pub instructions: Vec<Instruction>,
    pub prev: Vec<usize>,
    pub next: Vec<usize>,
}

impl BasicBlock {
    pub fn entry(&self) -> u64 {
        self.instructions.first().map(|i| i.address).unwrap_or(0)
    }
}

pub struct FlowGraph {
    process: Arc<Process>,
    pages: FnvHashMap<u64, Vec<Instruction>>,
    blocks: Vec<BasicBlock>,
    by_entry: FnvHashMap<u64, usize>,
}

impl FlowGraph {
    pub fn new(process: Arc<Process>) -> Self {
        Self {
            process,
            pages: FnvHashMap::default(),
            blocks: Vec::new(),
            by_entry: FnvHashMap::default(),
        }
    }

    pub fn blocks(&self) -> &[BasicBlock] {
        &self.blocks
    }

    pub fn block_at(&self, entry: u64) -> Option<&BasicBlock> {
        self.by_entry.get(&entry).map(|&ix| &self.blocks[ix])
    }

    /// Builds (or returns) the block starting at `entry`, expanding branch
    /// targets up to `max_depth` levels deep.
    pub fn generate_block(&mut self, entry: u64, max_depth: u32) -> Result<usize> {
        self.generate(entry, 0, max_depth)
    }

    fn generate(&mut self, entry: u64, depth: u32, max_depth: u32) -> Result<usize> {
        if let Some(&existing) = self.by_entry.get(&entry) {
            return Ok(existing);
        }

        // The entry itself must decode before the block exists at all.
        let first = self.instruction_at(entry)?;

        let ix = self.blocks.len();
        self.blocks.push(BasicBlock {
            id: NEXT_BLOCK_ID.fetch_add(1, Ordering::SeqCst),
            instructions: Vec::new(),
            prev: Vec::new(),
            next: Vec::new(),
        });
        self.by_entry.insert(entry, ix);

        let mut current = first;
        let (flow, target, fall_through) = loop {
            let next_address = current.address + current.len as u64;
            let flow = current.flow;
            let target = current.branch_target;
            self.blocks[ix].instructions.push(current);

            if flow != FlowType::None {
                break (flow, target, next_address);
            }
            match self.instruction_at(next_address) {
                Ok(instruction) => current = instruction,
                Err(err) => {
                    // Ran off the decodable range; close the block here.
                    log::debug!("Block at {entry:#x} truncated: {err}");
                    return Ok(ix);
                }
            }
        };

        if depth >= max_depth {
            return Ok(ix);
        }

        match flow {
            FlowType::Return => {}
            FlowType::Call => {
                // The callee stays collapsed behind a stub.
                if let Some(target) = target {
                    let stub = self.stub_block(target);
                    self.link(ix, stub);
                }
                self.try_successor(ix, fall_through, depth, max_depth);
            }
            FlowType::ConditionalBranch => {
                if let Some(target) = target {
                    self.try_successor(ix, target, depth, max_depth);
                }
                self.try_successor(ix, fall_through, depth, max_depth);
            }
            FlowType::UnconditionalBranch => {
                if let Some(target) = target {
                    self.try_successor(ix, target, depth, max_depth);
                }
            }
            FlowType::SysCall | FlowType::Interrupt | FlowType::CMovCC => {
                self.try_successor(ix, fall_through, depth, max_depth);
            }
            FlowType::None => {}
        }

        Ok(ix)
    }

    fn try_successor(&mut self, from: usize, entry: u64, depth: u32, max_depth: u32) {
        match self.generate(entry, depth + 1, max_depth) {
            Ok(to) => self.link(from, to),
            Err(err) => log::debug!("Skipping successor {entry:#x}: {err}"),
        }
    }

    /// A collapsed callee: one placeholder instruction, no expansion.
    fn stub_block(&mut self, target: u64) -> usize {
        if let Some(&existing) = self.by_entry.get(&target) {
            return existing;
        }
        let ix = self.blocks.len();
        self.blocks.push(BasicBlock {
            id: NEXT_BLOCK_ID.fetch_add(1, Ordering::SeqCst),
            instructions: vec![Instruction {
                address: target,
                mnemonic: String::new(),
                text: format!("sub_{target:08x}"),
                len: 0,
                flow: FlowType::None,
                branch_target: None,
            }],
            prev: Vec::new(),
            next: Vec::new(),
        });
        self.by_entry.insert(target, ix);
        ix
    }

    fn link(&mut self, from: usize, to: usize) {
        if !self.blocks[from].next.contains(&to) {
            self.blocks[from].next.push(to);
        }
        if !self.blocks[to].prev.contains(&from) {
            self.blocks[to].prev.push(from);
        }
    }

    /// The instruction at exactly `address`, from the page cache.
    fn instruction_at(&mut self, address: u64) -> Result<Instruction> {
        let page_base = address & !(PAGE_SIZE as u64 - 1);
        if !self.pages.contains_key(&page_base) {
            let mut data = vec![0u8; PAGE_SIZE];
            let available = self.process.read_available(page_base, &mut data)?;
            data.truncate(available);
            let instructions = disasm::decode(&data, page_base, self.process.bitness()?);
            self.pages.insert(page_base, instructions);
        }
        self.pages[&page_base]
            .iter()
            .find(|i| i.address == address)
            .cloned()
            .ok_or(Error::DecodeFailure { address })
    }

    /// Repairs blocks whose tail ran into the head of another block: the
    /// overlap is truncated and the block flows into the block it reached.
    /// Afterwards every instruction address belongs to exactly one block.
    pub fn remove_duplicate_instructions(&mut self) {
        for ix in 0..self.blocks.len() {
            let cut = self.blocks[ix]
                .instructions
                .iter()
                .enumerate()
                .skip(1)
                .find(|(_, instruction)| {
                    self.by_entry
                        .get(&instruction.address)
                        .map_or(false, |&other| other != ix)
                })
                .map(|(position, instruction)| (position, instruction.address));

            let Some((position, reached)) = cut else {
                continue;
            };
            let reached_ix = self.by_entry[&reached];

            self.blocks[ix].instructions.truncate(position);
            let old_next = std::mem::take(&mut self.blocks[ix].next);
            for successor in old_next {
                self.blocks[successor].prev.retain(|&p| p != ix);
            }
            self.blocks[ix].next.push(reached_ix);
            if !self.blocks[reached_ix].prev.contains(&ix) {
                self.blocks[reached_ix].prev.push(ix);
            }
        }
    }

    /// Emits the graph in DOT notation, one node per block labeled with its
    /// entry address and instruction listing.
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph flow {\n    node [shape=box fontname=\"monospace\"];\n");
        for block in &self.blocks {
            let mut label = format!("{:#010x}\\l", block.entry());
            for instruction in &block.instructions {
                let _ = write!(label, "{}\\l", instruction.text);
            }
            let _ = writeln!(out, "    n{} [label=\"{label}\"];", block.id);
        }
        for block in &self.blocks {
            for &next in &block.next {
                let _ = writeln!(out, "    n{} -> n{};", block.id, self.blocks[next].id);
            }
        }
        out.push_str("}\n");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::sim::SimPlatform;
    use crate::os::{Protection, RegionKind};

    fn graph_over(code: &[(u64, &[u8])]) -> FlowGraph {
        let sim = Arc::new(SimPlatform::new());
        sim.add_process(42, "target.exe");
        sim.add_region(
            0x40_1000,
            PAGE_SIZE,
            Protection::READ | Protection::EXECUTE,
            RegionKind::Image,
        );
        for (address, bytes) in code {
            sim.poke(*address, bytes);
        }
        let process = Arc::new(Process::new(sim));
        process.open_by_pid(42).unwrap();
        FlowGraph::new(process)
    }

    #[test]
    fn test_block_ends_at_conditional_branch() {
        let mut graph = graph_over(&[
            // mov eax,1; add eax,1; jne 0x401280; mov ecx,eax; ret
            (
                0x40_1200,
                &[
                    0xB8, 0x01, 0x00, 0x00, 0x00, 0x83, 0xC0, 0x01, 0x75, 0x76, 0x8B, 0xC8, 0xC3,
                ][..],
            ),
            // NOP slide keeps the branch target on an instruction boundary.
            (0x40_120D, &[0x90; 0x73][..]),
            // ret
            (0x40_1280, &[0xC3][..]),
        ]);

        let ix = graph.generate_block(0x40_1200, 1).unwrap();
        let block = &graph.blocks()[ix];
        assert_eq!(block.instructions.last().unwrap().mnemonic, "jne");
        assert_eq!(block.next.len(), 2);

        let successors: Vec<u64> = block
            .next
            .iter()
            .map(|&n| graph.blocks()[n].entry())
            .collect();
        assert!(successors.contains(&0x40_1280));
        assert!(successors.contains(&0x40_120A));

        // No block repeats another block's head bytes.
        for block in graph.blocks() {
            for other in graph.blocks() {
                if block.id == other.id {
                    continue;
                }
                assert!(block
                    .instructions
                    .iter()
                    .skip(1)
                    .all(|i| i.address != other.entry()));
            }
        }
    }

    #[test]
    fn test_call_produces_stub_not_expansion() {
        let mut graph = graph_over(&[
            // call 0x401500; ret
            (0x40_1020, &[0xE8, 0xDB, 0x04, 0x00, 0x00, 0xC3][..]),
            // The callee would decode fine, but must stay collapsed.
            (0x40_1500, &[0x55, 0xC3][..]),
        ]);

        let ix = graph.generate_block(0x40_1020, 2).unwrap();
        let block = &graph.blocks()[ix];
        assert_eq!(block.instructions.len(), 1);
        assert_eq!(block.next.len(), 2);

        let stub = graph.block_at(0x40_1500).unwrap();
        assert_eq!(stub.instructions.len(), 1);
        assert_eq!(stub.instructions[0].len, 0);

        // Fall-through block exists at the return address.
        assert!(graph.block_at(0x40_1025).is_some());
    }

    #[test]
    fn test_generate_is_idempotent() {
        let mut graph = graph_over(&[(0x40_1200, &[0xC3][..])]);
        let first = graph.generate_block(0x40_1200, 1).unwrap();
        let second = graph.generate_block(0x40_1200, 1).unwrap();
        assert_eq!(first, second);
        assert_eq!(graph.blocks().len(), 1);
    }

    #[test]
    fn test_duplicate_tails_are_canonicalised() {
        let mut graph = graph_over(&[
            // mov eax,1; add eax,1; ret
            (0x40_1200, &[0xB8, 0x01, 0x00, 0x00, 0x00, 0x83, 0xC0, 0x01, 0xC3][..]),
        ]);

        // Two overlapping blocks: the second starts inside the first.
        let a = graph.generate_block(0x40_1200, 1).unwrap();
        let b = graph.generate_block(0x40_1205, 1).unwrap();
        graph.remove_duplicate_instructions();

        let block_a = &graph.blocks()[a];
        let block_b = &graph.blocks()[b];
        assert_eq!(block_a.instructions.len(), 1);
        assert_eq!(block_a.next, vec![b]);
        assert!(block_b.prev.contains(&a));

        // Every address in exactly one block.
        let mut seen = std::collections::HashSet::new();
        for block in graph.blocks() {
            for instruction in &block.instructions {
                assert!(seen.insert(instruction.address));
            }
        }
    }

    #[test]
    fn test_dot_rendering_names_blocks() {
        let mut graph = graph_over(&[(0x40_1200, &[0xC3][..])]);
        graph.generate_block(0x40_1200, 1).unwrap();
        let dot = graph.to_dot();
        assert!(dot.starts_with("digraph flow {"));
        assert!(dot.contains("0x00401200"));
        assert!(dot.ends_with("}\n"));
    }
}
