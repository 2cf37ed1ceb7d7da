// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `Codegen`: the external interface gluing the decoder, optimiser,
//! backend, and code cache together. Method names mirror the original
//! `codegen_*` entry points (kept as doc aliases) so the mapping stays
//! traceable; the callback-per-instruction shape of the original is
//! collapsed into a single [`Codegen::recompile_block`] call, since Rust
//! has no need for the instruction-dispatch-loop callback style C used.

use crate::backend::{self, interp};
use crate::cache::block::BlockFlags;
use crate::cache::CodeCache;
use crate::cpu_state::{CpuState, CpuStatus};
use crate::decoder::{Decoder, InstructionRecord};
use crate::error::{BlockExit, DynarecError};
use crate::ir::IrBuffer;
use crate::memory::{GuestMemory, InterpreterFallback};
use crate::optimizer;
use crate::regfile::RegFile;
use crate::smc;
use crate::timing::TimingProvider;

/// Longest an x86 instruction can be; bounds the lookahead window fed to
/// [`crate::decoder::Decoder::decode_one`] for each instruction.
const MAX_INSTRUCTION_BYTES: usize = 15;

/// Owns the code cache and the one shipped backend, and sequences every
/// operation an embedder needs to compile and run guest code through it.
pub struct Codegen {
    pub cache: CodeCache,
    backend: interp::InterpBackend,
}

impl Codegen {
    /// `codegen_init`.
    pub fn new() -> Self {
        Self { cache: CodeCache::new(), backend: interp::InterpBackend::default() }
    }

    /// `codegen_reset`.
    pub fn reset(&mut self) {
        self.cache.reset();
    }

    /// `codegen_block_init`: begins a block at `phys`/`pc`. `current` is
    /// the block presently executing, if any, excluded from random
    /// eviction.
    pub fn block_init(&mut self, phys: u32, pc: u32, status: CpuStatus, current: u16) -> Result<u16, DynarecError> {
        self.cache.block_init(phys, pc, status, current)
    }

    /// `codegen_block_start_recompile` + the `codegen_generate_call` loop:
    /// decodes guest instructions starting at `pc`, fetching each one's
    /// bytes through `mem`, until a per-block limit stops the decoder,
    /// then hands the accumulated IR to [`Self::finish_block`].
    pub fn recompile_block(
        &mut self,
        idx: u16,
        pc: u32,
        mem: &mut dyn GuestMemory,
        operand_32: bool,
        address_32: bool,
        timing: &mut dyn TimingProvider,
        interpreter: &dyn Fn(u8) -> Option<InterpreterFallback>,
    ) -> Result<(), DynarecError> {
        let mut decoder = Decoder::new(operand_32, address_32, interpreter);
        timing.start();
        timing.block_start();

        let mut cur_pc = pc;
        loop {
            let window = fetch_instruction_window(mem, cur_pc);
            match decoder.decode_one(&window, cur_pc, timing) {
                Ok(next_pc) => {
                    self.cache.mark_code_present(idx, cur_pc, next_pc - cur_pc);
                    self.cache.block_mut(idx).ins += 1;
                    cur_pc = next_pc;
                }
                Err(_reason) => break,
            }
        }

        timing.block_end();

        let Decoder { ir, regs, instructions, .. } = decoder;
        self.finish_block(idx, ir, regs, instructions)
    }

    /// `codegen_block_end_recompile`: unrolls a trailing backward branch
    /// if one is present, runs dead-code elimination, compiles the
    /// surviving micro-ops against the shipped backend, and only then
    /// links the block into the cache's hash, PC tree, and page lists —
    /// no partially built block is ever made reachable.
    fn finish_block(
        &mut self,
        idx: u16,
        mut ir: IrBuffer,
        mut regs: RegFile,
        instructions: Vec<InstructionRecord>,
    ) -> Result<(), DynarecError> {
        if let Some(jump_uop) = last_backward_jump(&ir) {
            let target = ir.get(jump_uop).jump_dest.expect("last_backward_jump guarantees a resolved target");
            if let Some(dest_pc) = instructions.iter().find(|r| r.first_uop == target).map(|r| r.guest_pc) {
                let current_top = instructions.last().map_or(0, |r| r.fpu_top);
                let max_version_refs = body_max_version_refs(&ir, &regs, target, jump_uop + 1);
                Self::try_unroll_loop(&mut ir, &mut regs, &instructions, jump_uop, dest_pc, current_top, max_version_refs);
            }
        }

        optimizer::eliminate_dead_code(&mut ir, &mut regs);
        backend::compile(&mut self.backend, &mut ir, &mut regs)?;

        let block = self.cache.block_mut(idx);
        block.compiled = Some(ir);
        block.flags |= BlockFlags::WAS_RECOMPILED;
        self.cache.link_into_pages(idx);
        Ok(())
    }

    /// `codegen_block_end`: the interpreter-only placeholder path for a
    /// block the decoder declined to recompile. The slot stays registered
    /// under its hash/PC entries (so future lookups find it and skip
    /// straight to the interpreter) but carries no compiled IR and is
    /// never linked into a page's invalidation list.
    pub fn block_end(&mut self, idx: u16) {
        self.cache.block_mut(idx).compiled = None;
    }

    /// `codegen_delete_block`.
    pub fn delete_block(&mut self, idx: u16) {
        self.cache.delete_block(idx);
    }

    /// `codegen_mark_code_present`.
    pub fn mark_code_present(&mut self, idx: u16, addr: u32, len: u32) {
        self.cache.mark_code_present(idx, addr, len);
    }

    /// Guest-memory write hook: computes the touched page's dirty mask
    /// and invalidates overlapping blocks. Not itself a `codegen_*` name
    /// in the original (there, every RAM-write call site inlined the
    /// dirty-mask update before calling `codegen_check_flush`); kept
    /// separate here so an embedder's plain byte write doesn't need to
    /// precompute a mask by hand.
    pub fn mark_write(&mut self, phys: u32, len: u32) {
        smc::mark_write(&mut self.cache, phys, len);
    }

    /// `codegen_check_flush`: invalidates every block on `phys_page` whose
    /// recorded footprint overlaps the already-known `mask`.
    pub fn check_flush(&mut self, phys_page: u32, mask: u64) {
        smc::check_flush(&mut self.cache, phys_page, mask);
    }

    /// Runs block `idx`'s compiled code (or, for a block with no compiled
    /// IR — see [`Self::block_end`] — does nothing and reports normal
    /// completion, leaving the embedder's own interpreter to run the
    /// guest instructions one at a time).
    pub fn execute(&self, idx: u16, cpu: &mut CpuState, mem: &mut dyn GuestMemory) -> BlockExit {
        match &self.cache.block(idx).compiled {
            Some(ir) => interp::execute_block(ir, cpu, mem),
            None => BlockExit::Normal,
        }
    }

    /// Unrolls a backward branch discovered at `jump_uop` (already linked
    /// to `instructions[..]`'s recorded `first_uop` for `dest_pc`) in
    /// place, the way `codegen_block_end_recompile`'s loop-unrolling pass
    /// does before dead-code elimination runs. Returns `false` (no
    /// change) if `dest_pc` is not a known instruction boundary at a
    /// matching FPU `top`, or if the natural unroll count is ≤ 1.
    pub fn try_unroll_loop(
        ir: &mut IrBuffer,
        regs: &mut RegFile,
        instructions: &[InstructionRecord],
        jump_uop: usize,
        dest_pc: u32,
        current_top: u8,
        max_version_refs: u32,
    ) -> bool {
        let Some(entry) = optimizer::find_unroll_entry(instructions, dest_pc, current_top) else {
            return false;
        };
        let start = entry.first_uop;
        let end = jump_uop + 1;
        if end <= start {
            return false;
        }
        let Some(count) = optimizer::choose_unroll_count(end - start, max_version_refs) else {
            return false;
        };
        optimizer::unroll(ir, regs, start, end, count);
        true
    }
}

impl Default for Codegen {
    fn default() -> Self {
        Self::new()
    }
}

/// The block's last micro-op, if it is a jump already resolved to an
/// earlier index in the same buffer — the shape [`crate::decoder::Decoder`]
/// produces for a backward `JZ`/`JNZ` landing on a prior instruction
/// boundary, and the only shape [`Codegen::try_unroll_loop`] is ever
/// worth attempting against.
fn last_backward_jump(ir: &IrBuffer) -> Option<usize> {
    let last = ir.len().checked_sub(1)?;
    let uop = ir.get(last);
    if uop.is_jump() && uop.jump_dest.is_some_and(|target| target <= last) {
        Some(last)
    } else {
        None
    }
}

/// Largest pending-read refcount among every register version the
/// candidate loop body references, the bound [`optimizer::choose_unroll_count`]
/// uses to cap how much duplicating the body would blow up refcounts.
fn body_max_version_refs(ir: &IrBuffer, regs: &RegFile, start: usize, end: usize) -> u32 {
    let mut max_refs = 0;
    for i in start..end {
        let uop = ir.get(i);
        if let Some(d) = uop.dest {
            max_refs = max_refs.max(regs.version_refcount(d.id, d.version));
        }
        for s in uop.src.iter().flatten() {
            max_refs = max_refs.max(regs.version_refcount(s.id, s.version));
        }
    }
    max_refs
}

fn fetch_instruction_window(mem: &mut dyn GuestMemory, pc: u32) -> [u8; MAX_INSTRUCTION_BYTES] {
    let mut buf = [0u8; MAX_INSTRUCTION_BYTES];
    for (i, b) in buf.iter_mut().enumerate() {
        *b = mem.fetch_u8(pc.wrapping_add(i as u32));
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::UopOp;
    use crate::limits::INVALID_BLOCK_INDEX;
    use crate::reg::RegId;
    use crate::timing::FlatTiming;

    struct FlatMemory {
        bytes: Vec<u8>,
    }

    impl GuestMemory for FlatMemory {
        fn read_u8(&mut self, phys: u32) -> Result<u8, u8> {
            Ok(self.bytes[phys as usize])
        }
        fn read_u16(&mut self, phys: u32) -> Result<u16, u8> {
            Ok(u16::from_le_bytes([self.bytes[phys as usize], self.bytes[phys as usize + 1]]))
        }
        fn write_u8(&mut self, phys: u32, value: u8) -> Result<(), u8> {
            self.bytes[phys as usize] = value;
            Ok(())
        }
        fn write_u16(&mut self, phys: u32, value: u16) -> Result<(), u8> {
            let b = value.to_le_bytes();
            self.bytes[phys as usize] = b[0];
            self.bytes[phys as usize + 1] = b[1];
            Ok(())
        }
        fn fetch_u8(&mut self, linear: u32) -> u8 {
            *self.bytes.get(linear as usize).unwrap_or(&0)
        }
    }

    fn no_fallback(_opcode: u8) -> Option<InterpreterFallback> {
        None
    }

    #[test]
    fn recompile_and_execute_a_mov_imm_block() {
        let mut codegen = Codegen::new();
        // MOV EAX, 0x2a; then NOPs (all zero-risk operand-free padding)
        // until the instruction-count cap ends the block.
        let mut bytes = vec![0xb8, 0x2a, 0x00, 0x00, 0x00];
        bytes.resize(256, 0x90);
        let mut mem = FlatMemory { bytes };

        let idx = codegen.block_init(0x1000, 0x1000, CpuStatus::empty(), INVALID_BLOCK_INDEX).unwrap();
        let mut timing = FlatTiming;
        codegen
            .recompile_block(idx, 0x1000, &mut mem, true, true, &mut timing, &no_fallback)
            .unwrap();

        assert!(codegen.cache.block(idx).compiled.is_some());
        assert!(codegen.cache.block(idx).ins >= 2);

        let mut cpu = CpuState::new();
        let exit = codegen.execute(idx, &mut cpu, &mut mem);
        assert_eq!(exit, BlockExit::Normal);
        assert_eq!(cpu.gpr[0], 0x2a);
    }

    #[test]
    fn block_end_leaves_no_compiled_code() {
        let mut codegen = Codegen::new();
        let idx = codegen.block_init(0x2000, 0x2000, CpuStatus::empty(), INVALID_BLOCK_INDEX).unwrap();
        codegen.block_end(idx);
        assert!(codegen.cache.block(idx).compiled.is_none());

        let mut mem = FlatMemory { bytes: vec![0; 16] };
        let mut cpu = CpuState::new();
        assert_eq!(codegen.execute(idx, &mut cpu, &mut mem), BlockExit::Normal);
    }

    #[test]
    fn mark_write_inside_compiled_footprint_deletes_the_block() {
        let mut codegen = Codegen::new();
        let mut bytes = vec![0xb8, 1, 0, 0, 0];
        bytes.resize(256, 0x90);
        let mut mem = FlatMemory { bytes };
        let idx = codegen.block_init(0x3000, 0x3000, CpuStatus::empty(), INVALID_BLOCK_INDEX).unwrap();
        let mut timing = FlatTiming;
        codegen
            .recompile_block(idx, 0x3000, &mut mem, true, true, &mut timing, &no_fallback)
            .unwrap();

        codegen.mark_write(0x3001, 1);

        assert_eq!(codegen.cache.hash_lookup(0x3000), None);
    }

    #[test]
    fn backward_branch_through_recompile_triggers_unrolling() {
        let mut codegen = Codegen::new();
        // MOV EAX, 1 (5 bytes) at 0x40, then JNZ back to 0x40 at 0x45. Kept
        // well inside the buffer (unlike the other tests in this module,
        // which rely on `fetch_u8`'s out-of-range default) so every fetch
        // here reads back exactly the bytes written.
        let mut bytes = vec![0xb8, 1, 0, 0, 0, 0x75, (-7i8) as u8];
        bytes.resize(128, 0x90);
        let mut mem = FlatMemory { bytes };

        let idx = codegen.block_init(0x40, 0x40, CpuStatus::empty(), INVALID_BLOCK_INDEX).unwrap();
        let mut timing = FlatTiming;
        codegen
            .recompile_block(idx, 0x40, &mut mem, true, true, &mut timing, &no_fallback)
            .unwrap();

        let compiled = codegen.cache.block(idx).compiled.as_ref().unwrap();
        // Three-uop loop body (MOV EAX,1; MOV scratch,0; CMP_JNZ_DEST),
        // unrolled to the 10-iteration cap: the original body plus nine
        // duplicated copies.
        assert_eq!(compiled.len(), 3 + 9 * 3);
    }

    #[test]
    fn try_unroll_loop_duplicates_the_body() {
        let mut ir = IrBuffer::new();
        let mut regs = RegFile::new();

        let mov_idx = ir.push(UopOp::MovImm, 0x100).unwrap();
        ir.get_mut(mov_idx).imm = 1;
        ir.get_mut(mov_idx).dest = Some(regs.write(RegId::Eax, mov_idx).unwrap());
        let instructions = vec![InstructionRecord { guest_pc: 0x100, first_uop: mov_idx, fpu_top: 0 }];

        let src = regs.read(RegId::Eax);
        let add_idx = ir.push(UopOp::AddImm, 0x103).unwrap();
        ir.get_mut(add_idx).src[0] = Some(src);
        ir.get_mut(add_idx).imm = 1;
        ir.get_mut(add_idx).dest = Some(regs.write(RegId::Eax, add_idx).unwrap());

        let before = ir.len();
        let unrolled = Codegen::try_unroll_loop(&mut ir, &mut regs, &instructions, add_idx, 0x100, 0, 1);
        assert!(unrolled);
        assert!(ir.len() > before);
    }
}
