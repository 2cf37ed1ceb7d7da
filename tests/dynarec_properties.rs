// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end checks against the public API, one per concrete behaviour
//! the rest of the crate's unit tests only exercise piecemeal.

use x86dynarec::backend::interp::execute_block;
use x86dynarec::backend::{compile, HostBackend, PatchPoint};
use x86dynarec::cpu_state::{CpuState, CpuStatus};
use x86dynarec::decoder::InstructionRecord;
use x86dynarec::dispatcher::Codegen;
use x86dynarec::error::DynarecError;
use x86dynarec::ir::{Barrier, IrBuffer, IrReg, UopOp};
use x86dynarec::limits::INVALID_BLOCK_INDEX;
use x86dynarec::reg::{Domain, RegId};
use x86dynarec::regfile::RegFile;
use x86dynarec::{BlockExit, GuestMemory};

struct FlatMemory {
    bytes: Vec<u8>,
}

impl FlatMemory {
    fn new(size: usize) -> Self {
        Self { bytes: vec![0u8; size] }
    }
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

/// Scenario 1: `MOV EAX, 1; ADD EAX, 2; MOV [0x1000], EAX` starting from
/// EAX = 0 leaves EAX = 3 and writes 3 to guest memory as a dword.
#[test]
fn mov_add_store_leaves_eax_and_memory_at_three() {
    let mut ir = IrBuffer::new();
    let mut regs = RegFile::new();

    let mov_idx = ir.push(UopOp::MovImm, 0).unwrap();
    ir.get_mut(mov_idx).imm = 1;
    ir.get_mut(mov_idx).dest = Some(regs.write(RegId::Eax, mov_idx).unwrap());

    let eax_v1 = regs.read(RegId::Eax);
    let add_idx = ir.push(UopOp::AddImm, 1).unwrap();
    ir.get_mut(add_idx).src[0] = Some(eax_v1);
    ir.get_mut(add_idx).imm = 2;
    ir.get_mut(add_idx).dest = Some(regs.write(RegId::Eax, add_idx).unwrap());

    let eax_v2 = regs.read(RegId::Eax);
    let store_idx = ir.push(UopOp::MemStoreAbs, 2).unwrap();
    ir.get_mut(store_idx).src[0] = Some(eax_v2);
    ir.get_mut(store_idx).ptr = 0x1000;

    let mut mem = FlatMemory::new(0x2000);
    let mut cpu = CpuState::new();
    let exit = execute_block(&ir, &mut cpu, &mut mem);

    assert_eq!(exit, BlockExit::Normal);
    assert_eq!(cpu.gpr[0], 3);
    assert_eq!(mem.read_u32(0x1000).unwrap(), 3);
}

/// Scenario 2: a backward conditional branch whose destination is a known
/// instruction boundary at a matching FPU `top` gets unrolled up to the
/// configured count, and every duplicated branch is repatched to its own
/// copy of the loop body rather than left pointing at the original.
#[test]
fn backward_branch_unrolls_and_repatches_each_copy() {
    let mut ir = IrBuffer::new();
    let mut regs = RegFile::new();

    // Loop entry: EAX -= 1. This is the instruction boundary the backward
    // branch targets.
    let eax0 = regs.read(RegId::Eax);
    let dec_idx = ir.push(UopOp::SubImm, 0x200).unwrap();
    ir.get_mut(dec_idx).src[0] = Some(eax0);
    ir.get_mut(dec_idx).imm = 1;
    ir.get_mut(dec_idx).dest = Some(regs.write(RegId::Eax, dec_idx).unwrap());

    let instructions = vec![InstructionRecord { guest_pc: 0x200, first_uop: dec_idx, fpu_top: 0 }];

    // Stand-in for the flag-result register the original's FLAGS_SUB8
    // comparison reads: zero once the decrement reaches zero.
    let flags_zero_idx = ir.push(UopOp::MovImm, 0x203).unwrap();
    ir.get_mut(flags_zero_idx).imm = 0;
    ir.get_mut(flags_zero_idx).dest = Some(regs.write(RegId::FlagsRes, flags_zero_idx).unwrap());
    let flags_zero = regs.read(RegId::FlagsRes);

    let eax_cmp = regs.read(RegId::Eax);
    let jnz_idx = ir.push(UopOp::CmpJnzDest, 0x203).unwrap();
    ir.get_mut(jnz_idx).src[0] = Some(eax_cmp);
    ir.get_mut(jnz_idx).src[1] = Some(flags_zero);
    ir.link_jump_to_target(jnz_idx, dec_idx);

    let body_len = jnz_idx + 1 - dec_idx;
    assert_eq!(body_len, 3);

    let before_len = ir.len();
    let unrolled = Codegen::try_unroll_loop(&mut ir, &mut regs, &instructions, jnz_idx, 0x200, 0, 1);
    assert!(unrolled);

    // uop_cap = 1000/3 = 333, ref_cap = 200/1 = 200, capped at 10: count = 10.
    let expected_count = 10;
    assert_eq!(ir.len(), before_len + body_len * (expected_count - 1));

    // The original branch still targets the original loop entry...
    assert_eq!(ir.get(jnz_idx).jump_dest, Some(dec_idx));

    // ...but every duplicated branch was repatched to its own copy's
    // entry, not left pointing at uop 0.
    for iter in 1..expected_count {
        let jnz_copy = body_len * iter + 2;
        let expected_target = body_len * iter;
        assert_eq!(ir.get(jnz_copy).jump_dest, Some(expected_target), "iteration {iter}");
    }
}

/// Scenario 3: a block whose final instruction straddles two guest
/// physical pages registers footprint in both pages' bookkeeping, ready
/// for either page's writes to find it (proven indirectly by scenario 4
/// and the `first_page_write_also_retires_it` case below, since the
/// page-list heads themselves are private to the cache).
#[test]
fn block_spanning_two_pages_registers_both_footprints() {
    let mut cache = x86dynarec::cache::CodeCache::new();

    // A 5-byte instruction living at offset 0xFFE of page 0: 2 bytes in
    // page 0, 3 bytes in page 1.
    let idx = cache.block_init(0x0000, 0x8000_0000, CpuStatus::empty(), INVALID_BLOCK_INDEX).unwrap();
    cache.mark_code_present(idx, 0x0FFE, 2);
    cache.mark_code_present(idx, 0x1000, 3);
    cache.link_into_pages(idx);

    assert_eq!(cache.block(idx).phys, 0x0000);
    assert_eq!(cache.block(idx).phys_2, 0x1000);
    assert_eq!(cache.block(idx).page_mask, 1u64 << 63);
    assert_eq!(cache.block(idx).page_mask2, 0b1);
    assert!(cache.block(idx).flags.contains(x86dynarec::cache::block::BlockFlags::HAS_SECOND_PAGE));
}

/// Scenario 4: a write landing on the first byte of the second page of
/// that same cross-page block invalidates it, proving it really was
/// linked into the second page's block list (not just carrying the
/// mask).
#[test]
fn smc_write_to_second_page_retires_the_cross_page_block() {
    let mut cache = x86dynarec::cache::CodeCache::new();
    let idx = cache.block_init(0x0000, 0x8000_0000, CpuStatus::empty(), INVALID_BLOCK_INDEX).unwrap();
    cache.mark_code_present(idx, 0x0FFE, 2);
    cache.mark_code_present(idx, 0x1000, 3);
    cache.link_into_pages(idx);

    x86dynarec::smc::mark_write(&mut cache, 0x1000, 1);

    assert_eq!(cache.hash_lookup(0x0000), None);
    assert!(cache.block(idx).compiled.is_none());
}

/// A write landing on the first page instead exercises the *first*
/// page's block list, completing scenario 3's "linked into both lists"
/// claim from the other side.
#[test]
fn smc_write_to_first_page_also_retires_the_cross_page_block() {
    let mut cache = x86dynarec::cache::CodeCache::new();
    let idx = cache.block_init(0x0000, 0x8000_0000, CpuStatus::empty(), INVALID_BLOCK_INDEX).unwrap();
    cache.mark_code_present(idx, 0x0FFE, 2);
    cache.mark_code_present(idx, 0x1000, 3);
    cache.link_into_pages(idx);

    x86dynarec::smc::mark_write(&mut cache, 0x0FFE, 1);

    assert_eq!(cache.hash_lookup(0x0000), None);
    assert!(cache.block(idx).compiled.is_none());
}

/// Scenario 5: once a register id has accumulated 250 SSA versions, the
/// next write is refused so the caller can end the block instead of
/// letting the version counter wrap.
#[test]
fn register_version_cap_forces_block_termination() {
    let mut regs = RegFile::new();
    let mut successful_writes = 0;
    loop {
        if regs.would_exceed_limits(RegId::Eax) {
            break;
        }
        regs.write(RegId::Eax, 0).unwrap();
        successful_writes += 1;
    }

    // One more write past the point `would_exceed_limits` starts
    // reporting true must still fail outright.
    assert!(matches!(
        regs.write(RegId::Eax, 0),
        Err(x86dynarec::error::BlockEndReason::RegisterLimit)
    ));
    assert_eq!(successful_writes, 249);
}

/// Records every uop the orchestrator hands it, so the peephole rename
/// can be observed from outside the crate.
#[derive(Default)]
struct RecordingBackend {
    emitted: Vec<UopOp>,
    next_patch_point: usize,
}

impl HostBackend for RecordingBackend {
    fn prologue(&mut self) {}
    fn epilogue(&mut self) {}
    fn flush(&mut self, _writebacks: &[(Domain, u8, IrReg)], _invalidate: bool) {}
    fn reserve_patch_point(&mut self) -> PatchPoint {
        self.next_patch_point += 1;
        self.next_patch_point
    }
    fn set_jump_dest(&mut self, _point: PatchPoint) {}
    fn emit(&mut self, ir: &IrBuffer, uop_idx: usize) -> Result<(), DynarecError> {
        self.emitted.push(ir.get(uop_idx).op);
        Ok(())
    }
}

/// Scenario 6: `MOV_IMM(temp0, 0x1234); MOV(EAX, temp0)` with `temp0`
/// unread anywhere else compiles with no move instruction reaching the
/// backend at all; the host register already holding the immediate is
/// renamed onto EAX instead.
#[test]
fn mov_with_a_single_reader_source_is_renamed_away() {
    let mut ir = IrBuffer::new();
    let mut regs = RegFile::new();

    let imm_idx = ir.push(UopOp::MovImm, 0).unwrap();
    ir.get_mut(imm_idx).imm = 0x1234;
    ir.get_mut(imm_idx).dest = Some(regs.write(RegId::Temp0, imm_idx).unwrap());
    let temp0 = regs.read(RegId::Temp0);

    let mov_idx = ir.push(UopOp::Mov, 1).unwrap();
    ir.get_mut(mov_idx).src[0] = Some(temp0);
    ir.get_mut(mov_idx).dest = Some(regs.write(RegId::Eax, mov_idx).unwrap());
    regs.mark_permanent_required(Barrier::Full);

    let mut backend = RecordingBackend::default();
    compile(&mut backend, &mut ir, &mut regs).unwrap();

    assert!(!backend.emitted.contains(&UopOp::Mov));
    assert!(backend.emitted.contains(&UopOp::MovImm));
}
