// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The single-pass optimiser: loop unrolling followed by dead-code
//! elimination, run once per block after decode finishes and before the
//! backend's compile loop.

use crate::decoder::InstructionRecord;
use crate::ir::{IrBuffer, IrReg, UopOp};
use crate::limits::{UNROLL_MAX_COUNT, UNROLL_MAX_REFS, UNROLL_MAX_UOPS};
use crate::regfile::RegFile;

/// Looks up the instruction table for a backward branch's destination
/// PC, per §4.4: the destination must be an instruction boundary already
/// compiled in this block, and its recorded FPU top must match the
/// current one (`current_top`) or unrolling is skipped.
pub fn find_unroll_entry(
    instructions: &[InstructionRecord],
    dest_pc: u32,
    current_top: u8,
) -> Option<&InstructionRecord> {
    instructions
        .iter()
        .find(|rec| rec.guest_pc == dest_pc)
        .filter(|rec| rec.fpu_top == current_top)
}

/// Computes how many times to duplicate `[start, end)` given the three
/// simultaneous caps. Returns `None` (no unrolling) if the natural count
/// would be ≤ 1.
pub fn choose_unroll_count(body_len: usize, max_version_refs: u32) -> Option<u32> {
    if body_len == 0 {
        return None;
    }
    let uop_cap = (UNROLL_MAX_UOPS / body_len) as u32;
    let ref_cap = if max_version_refs == 0 { UNROLL_MAX_COUNT } else { UNROLL_MAX_REFS / max_version_refs };
    let count = uop_cap.min(ref_cap).min(UNROLL_MAX_COUNT);
    if count <= 1 {
        None
    } else {
        Some(count)
    }
}

/// Duplicates `ir[start..end)` `count - 1` additional times (the
/// original pass already stands in for iteration 1), rewriting every
/// register reference in each copy to a fresh version via `regs` and
/// relinking any in-range jump destination by the per-iteration offset.
/// Out-of-range jump destinations (branches leaving the loop body) are
/// left pointing at the original target.
pub fn unroll(ir: &mut IrBuffer, regs: &mut RegFile, start: usize, end: usize, count: u32) {
    let body_len = end - start;
    for iter in 1..count {
        let offset = iter as usize * body_len;
        for i in start..end {
            let template = ir.get(i).clone();
            let new_idx = ir.push(template.op, template.pc).expect("unroll exceeded uop buffer");

            let dest = template.dest.map(|reg| regs.write(reg.id, new_idx).expect("unroll exceeded register limits"));
            let src = template.src.map(|s| s.map(|reg| regs.read(reg.id)));

            let copy = ir.get_mut(new_idx);
            copy.dest = dest;
            copy.src = src;
            copy.imm = template.imm;
            copy.ptr = template.ptr;

            if let Some(target) = template.jump_dest {
                let new_target = if target >= start && target < end { target + offset } else { target };
                ir.link_jump_to_target(new_idx, new_target);
            }
        }
    }
}

/// Drains the register file's dead-list to a fixed point, marking every
/// eliminated producer's `invalid` bit so the backend skips it. A
/// candidate whose producer is neither a barrier nor an order-barrier
/// (i.e. not `REQUIRED`) is invalidated; its sources are then
/// refcount-decremented and may themselves join the worklist.
pub fn eliminate_dead_code(ir: &mut IrBuffer, regs: &mut RegFile) {
    while let Some((id, version)) = regs.pop_dead() {
        if regs.version_required(id, version) || regs.version_is_dead(id, version) {
            continue;
        }
        let Some(producer_uop) = regs.version_producer(id, version) else { continue };

        regs.mark_version_dead(id, version);
        ir.get_mut(producer_uop).invalid = true;

        let sources: Vec<IrReg> = ir.get(producer_uop).src.iter().filter_map(|s| *s).collect();
        for src in sources {
            regs.release_source(src);
        }
    }
}

/// Peephole: renames the host register holding `src` onto `dst` instead
/// of emitting a `MOV`, when `src` has at most one remaining reader
/// (this move) and both are native-size. Returns `true` if the rename
/// fired, in which case the caller must skip the move's handler.
pub fn can_rename_mov(op: UopOp, src: Option<IrReg>, src_refcount: u32) -> bool {
    op == UopOp::Mov && src.is_some() && src_refcount <= 1
}
