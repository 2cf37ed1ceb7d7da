// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The abstract host-backend contract (§4.5) and the `compile()`
//! orchestrator that walks the optimised IR once, in order, applying
//! barrier flushes, peephole cases, and jump-chain resolution, then
//! register-allocating sources and the destination out of [`RegFile`]'s
//! host banks before handing each surviving micro-op to the backend's
//! handler table.
//!
//! Only one concrete backend ships with this crate
//! ([`interp::InterpBackend`]): cross-platform machine-code emission is
//! explicitly out of scope (see the "cross-platform host code
//! generation" non-goal), so rather than leave the trait unimplemented,
//! a portable backend that "emits" by interpreting the IR directly
//! stands in for a real one and gives every other module something
//! concrete to be exercised against.

pub mod interp;

use crate::cpu_state::CpuState;
use crate::error::{BlockExit, DynarecError};
use crate::ir::{Barrier, IrBuffer, UopFlags, UopOp};
use crate::memory::GuestMemory;
use crate::optimizer;
use crate::regfile::RegFile;

/// A host-code placeholder left behind by a jump handler, consumed once
/// the real target is known. Opaque to the orchestrator: only the
/// backend interprets it.
pub type PatchPoint = usize;

/// The primitive operations a host backend must provide. Every method
/// takes `&mut self` rather than being free functions, since a real
/// backend owns an in-progress host-code buffer as state.
pub trait HostBackend {
    /// Reserves the block's host-code buffer and emits the entry
    /// sequence, including making the scratch spill area (≥ 64 bytes)
    /// available at the fixed stack offsets §4.5 names.
    fn prologue(&mut self);

    /// Emits the return sequence, ending the compile loop.
    fn epilogue(&mut self);

    /// Flushes the caller's view of the host-register cache: writes back
    /// dirty entries and, if `invalidate`, clears bindings so later reads
    /// reload from process state.
    fn flush(&mut self, writebacks: &[(crate::reg::Domain, u8, crate::ir::IrReg)], invalidate: bool);

    /// Advertises whether `direct_write_imm` is implemented, enabling the
    /// peephole optimisation that writes an immediate straight to memory
    /// without allocating a host register first.
    fn supports_immediate_store(&self) -> bool {
        false
    }

    /// Allocates a patch point for a jump uop about to be emitted (its
    /// destination is not yet known).
    fn reserve_patch_point(&mut self) -> PatchPoint;

    /// Patches a previously reserved point to target the current
    /// host-code position.
    fn set_jump_dest(&mut self, point: PatchPoint);

    /// Emits the machine sequence for one micro-op. `uop_idx` indexes
    /// into `ir` so the handler can read the host-register assignments
    /// the orchestrator filled in.
    fn emit(&mut self, ir: &IrBuffer, uop_idx: usize) -> Result<(), DynarecError>;

    /// Peephole case (a): a `MOV_IMM` whose destination has no in-block
    /// reader writes its immediate directly without allocating a host
    /// register or going through the normal handler dispatch. Only
    /// called when [`Self::supports_immediate_store`] returns `true`;
    /// the default forwards to [`Self::emit`] for backends that never
    /// advertise support and so never see this path taken.
    fn direct_write_imm(&mut self, ir: &IrBuffer, uop_idx: usize) -> Result<(), DynarecError> {
        self.emit(ir, uop_idx)
    }
}

/// Runs the compile loop described in §4.5 over `ir`, in order:
/// resolves jump-target chains, skips invalidated micro-ops, applies
/// barrier flushes, and dispatches everything else to `backend.emit`.
pub fn compile<B: HostBackend>(backend: &mut B, ir: &mut IrBuffer, regs: &mut RegFile) -> Result<(), DynarecError> {
    backend.prologue();

    let mut patch_points: Vec<(usize, PatchPoint)> = Vec::new();

    for idx in 0..ir.len() {
        if ir.get(idx).is_jump_target {
            resolve_jump_chain(backend, ir, idx, &mut patch_points);
        }

        if ir.get(idx).invalid {
            continue;
        }

        regs.unlock_all_banks();

        let barrier = ir.get(idx).barrier();
        if barrier == Barrier::Full {
            let writebacks = regs.flush(true);
            backend.flush(&writebacks, true);
        }

        if ir.get(idx).is_jump() {
            let point = backend.reserve_patch_point();
            ir.get_mut(idx).patch_point = Some(point);
            if let Some(target) = ir.get(idx).jump_dest {
                if target <= idx && target < ir.len() {
                    // Backward jump: the target was already visited, so
                    // its chain was already resolved. Patch directly.
                    backend.set_jump_dest(point);
                } else {
                    patch_points.push((target, point));
                }
            }
        }

        let uop = ir.get(idx);
        let op = uop.op;
        let dest = uop.dest;
        let src0 = uop.src[0];

        // Peephole (a): an immediate write with no in-block reader skips
        // allocation and handler dispatch entirely.
        if op == UopOp::MovImm && backend.supports_immediate_store() {
            let dest_refcount = dest.map_or(0, |d| regs.version_refcount(d.id, d.version));
            if dest_refcount == 0 {
                backend.direct_write_imm(ir, idx)?;
                continue;
            }
        }

        // Peephole (b): a MOV whose source has no other reader renames
        // the source's host binding onto the destination instead of
        // emitting a move.
        let src_refcount = src0.map_or(0, |s| regs.version_refcount(s.id, s.version));
        if optimizer::can_rename_mov(op, src0, src_refcount) {
            regs.rename_binding(src0.expect("can_rename_mov requires a source"), dest.expect("MOV always writes a destination"));
            continue;
        }

        // Step 4: register-allocate sources, flush on an order barrier
        // between read- and write-allocation, then allocate the
        // destination before handing the uop to the backend.
        let flags = op.flags();
        if flags.contains(UopFlags::USES_REGS) {
            let srcs = ir.get(idx).src;
            for (i, src) in srcs.into_iter().enumerate() {
                let Some(src) = src else { continue };
                let (host, evicted) = regs.allocate_read(src)?;
                if let Some((domain, slot, spilled)) = evicted {
                    backend.flush(&[(domain, slot, spilled)], false);
                }
                ir.get_mut(idx).host_src[i] = Some(host);
            }
        }

        if barrier == Barrier::Order {
            let writebacks = regs.flush(false);
            backend.flush(&writebacks, false);
        }

        if flags.contains(UopFlags::USES_REGS) {
            if let Some(d) = dest {
                let (host, evicted) = regs.allocate_write(d)?;
                if let Some((domain, slot, spilled)) = evicted {
                    backend.flush(&[(domain, slot, spilled)], false);
                }
                ir.get_mut(idx).host_dest = Some(host);
            }
        }

        backend.emit(ir, idx)?;
    }

    let writebacks = regs.flush(true);
    backend.flush(&writebacks, true);

    for &jump_uop in &ir.end_of_block_jumps.clone() {
        if let Some(point) = ir.get(jump_uop).patch_point {
            backend.set_jump_dest(point);
        }
    }

    backend.epilogue();
    Ok(())
}

fn resolve_jump_chain<B: HostBackend>(
    backend: &mut B,
    ir: &IrBuffer,
    target: usize,
    pending: &mut Vec<(usize, PatchPoint)>,
) {
    pending.retain(|&(want, point)| {
        if want == target {
            backend.set_jump_dest(point);
            false
        } else {
            true
        }
    });

    let mut cursor = ir.get(target).jump_list_next;
    while let Some(jump_uop) = cursor {
        if let Some(point) = ir.get(jump_uop).patch_point {
            backend.set_jump_dest(point);
        }
        cursor = ir.get(jump_uop).jump_list_next;
    }
}

/// Entry point for a compiled block's execution, returned by the
/// concrete backend's invocation wrapper (not part of the `HostBackend`
/// trait itself: a real backend returns this from raw host code via a
/// tail-jump-to-stub, the interpreting backend returns it directly).
pub type BlockEntry = fn(&mut CpuState, &mut dyn GuestMemory) -> BlockExit;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::UopOp;
    use crate::reg::{Domain, RegId};
    use crate::regfile::RegFile;

    /// Records every uop it was asked to emit, standing in for a real
    /// backend's host-code buffer so the rename peephole can be observed
    /// without a concrete machine-code target.
    #[derive(Default)]
    struct SpyBackend {
        emitted: Vec<UopOp>,
        next_patch_point: usize,
        patched: Vec<PatchPoint>,
    }

    impl HostBackend for SpyBackend {
        fn prologue(&mut self) {}
        fn epilogue(&mut self) {}
        fn flush(&mut self, _writebacks: &[(Domain, u8, crate::ir::IrReg)], _invalidate: bool) {}
        fn reserve_patch_point(&mut self) -> PatchPoint {
            self.next_patch_point += 1;
            self.next_patch_point
        }
        fn set_jump_dest(&mut self, point: PatchPoint) {
            self.patched.push(point);
        }
        fn emit(&mut self, ir: &IrBuffer, uop_idx: usize) -> Result<(), DynarecError> {
            self.emitted.push(ir.get(uop_idx).op);
            Ok(())
        }
    }

    #[test]
    fn mov_rename_skips_emitting_the_move() {
        // MOV_IMM(temp0, 0x1234); MOV(EAX, temp0), temp0 has no other readers.
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

        let mut backend = SpyBackend::default();
        compile(&mut backend, &mut ir, &mut regs).unwrap();

        assert!(!backend.emitted.contains(&UopOp::Mov), "renamed move must not reach the backend");
        assert!(backend.emitted.contains(&UopOp::MovImm));
    }

    #[test]
    fn backward_jump_is_patched_immediately_without_a_pending_entry() {
        let mut ir = IrBuffer::new();
        let mut regs = RegFile::new();

        let target_idx = ir.push(UopOp::NopBarrier, 0).unwrap();

        let jmp_idx = ir.push(UopOp::JmpDest, 1).unwrap();
        ir.link_jump_to_target(jmp_idx, target_idx);

        let mut backend = SpyBackend::default();
        compile(&mut backend, &mut ir, &mut regs).unwrap();

        assert_eq!(backend.patched.len(), 1);
    }
}
