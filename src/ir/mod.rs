// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Micro-op IR: versioned register references, the micro-op catalogue,
//! and the per-block IR buffer.

pub mod op;

pub use op::UopOp;

use crate::limits::MAX_UOPS_PER_BLOCK;
use crate::reg::RegId;

/// A versioned reference to a virtual register: SSA form over [`RegId`].
///
/// Every IR read captures the current version of an id; every IR write
/// allocates a new one. `None` encodes the "invalid" / not-present slot
/// a `uop`'s unused source operands carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct IrReg {
    pub id: RegId,
    pub version: u16,
}

impl IrReg {
    pub const fn new(id: RegId, version: u16) -> Self {
        Self { id, version }
    }
}

/// How a micro-op interacts with the host-register cache.
///
/// Modeled as a 3-way enum rather than the original's two independent
/// bitflags (`BARRIER`, `ORDER_BARRIER`) because the two flags are
/// mutually exclusive in practice and a `match` gives the compiler an
/// exhaustiveness check the bitflag pair never could (see the "three
/// state barrier" design note).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Barrier {
    /// No barrier: the micro-op participates in normal register caching.
    None,
    /// All prior writes become visible and the host register cache is
    /// flushed *and* invalidated: subsequent reads must reload.
    Full,
    /// All prior writes become visible (flushed) but cached-for-read
    /// values remain valid. Used ahead of guest memory accesses.
    Order,
}

impl Barrier {
    #[inline]
    pub const fn is_barrier(self) -> bool {
        matches!(self, Barrier::Full)
    }

    #[inline]
    pub const fn flushes(self) -> bool {
        !matches!(self, Barrier::None)
    }
}

bitflags::bitflags! {
    /// Additional per-opcode flags that are independent of the barrier
    /// state: which operand slots are meaningful, and control-flow shape.
    pub struct UopFlags: u16 {
        const USES_REGS      = 0b0000_0001;
        const USES_POINTER   = 0b0000_0010;
        const USES_IMMEDIATE = 0b0000_0100;
        const IS_JUMP        = 0b0000_1000;
    }
}

/// Generic pointer payload carried by a micro-op: either a call target,
/// an absolute host address, or a guest-memory-fixed field address.
/// `usize` rather than a raw pointer so `Uop` stays `Send`/`Sync`-capable
/// and trivially copyable for the unroller's duplication pass.
pub type UopPtr = usize;

/// One micro-op: opcode tag, up to three sources, one destination, an
/// immediate, a generic pointer, and jump bookkeeping.
#[derive(Clone, Debug)]
pub struct Uop {
    pub op: UopOp,
    pub dest: Option<IrReg>,
    pub src: [Option<IrReg>; 3],
    pub imm: u32,
    pub ptr: UopPtr,

    /// Index of the micro-op this jump targets, if this is a `_DEST`
    /// jump variant. `None` until resolved (forward jumps start
    /// unresolved; see [`crate::ir::IrBuffer::set_jump_dest`]).
    pub jump_dest: Option<usize>,
    /// Singly linked list, rooted in the *target* uop, of every jump
    /// whose `jump_dest` equals this uop's own index. `None` = list end.
    pub jump_list_next: Option<usize>,
    /// Set by [`IrBuffer::link_jump_to_target`] on the uop that is the
    /// target of at least one jump. Unlike the catalogue's static
    /// per-opcode flags, this is a per-instance property: whether a
    /// given uop is a jump target depends on the block being compiled,
    /// not on its opcode.
    pub is_jump_target: bool,

    /// Source guest PC, kept for debugging and for the fault path.
    pub pc: u32,

    /// Set by the optimiser's dead-code pass; skipped by the backend.
    pub invalid: bool,
    /// Set when a barrier-marking pass determines an IR read of this
    /// uop's destination version must survive DCE (it feeds a barrier).
    pub required: bool,

    /// Filled in by the backend's register allocator during `compile`.
    pub host_dest: Option<u8>,
    pub host_src: [Option<u8>; 3],
    /// Patch point the backend left behind for a jump uop, consumed by
    /// `set_jump_dest` once the real target address is known.
    pub patch_point: Option<usize>,
}

impl Uop {
    fn new(op: UopOp, pc: u32) -> Self {
        Self {
            op,
            dest: None,
            src: [None, None, None],
            imm: 0,
            ptr: 0,
            jump_dest: None,
            jump_list_next: None,
            is_jump_target: false,
            pc,
            invalid: false,
            required: false,
            host_dest: None,
            host_src: [None, None, None],
            patch_point: None,
        }
    }

    #[inline]
    pub fn barrier(&self) -> Barrier {
        self.op.barrier()
    }

    #[inline]
    pub fn flags(&self) -> UopFlags {
        self.op.flags()
    }

    #[inline]
    pub fn is_jump(&self) -> bool {
        self.flags().contains(UopFlags::IS_JUMP)
    }
}

/// Append-only per-block buffer of micro-ops, capped at
/// [`MAX_UOPS_PER_BLOCK`]. One-to-one with the original's `ir_data_t`.
#[derive(Clone, Debug, Default)]
pub struct IrBuffer {
    uops: Vec<Uop>,
    /// Jumps whose target equals "the end of the buffer" (resolved once
    /// the backend knows where the epilogue begins) are collected here
    /// instead of into a target uop's `jump_list_next` chain.
    pub end_of_block_jumps: Vec<usize>,
}

impl IrBuffer {
    pub fn new() -> Self {
        Self { uops: Vec::with_capacity(256), end_of_block_jumps: Vec::new() }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.uops.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.uops.is_empty()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.uops.len() >= MAX_UOPS_PER_BLOCK
    }

    #[inline]
    pub fn get(&self, idx: usize) -> &Uop {
        &self.uops[idx]
    }

    #[inline]
    pub fn get_mut(&mut self, idx: usize) -> &mut Uop {
        &mut self.uops[idx]
    }

    #[inline]
    pub fn iter(&self) -> std::slice::Iter<'_, Uop> {
        self.uops.iter()
    }

    #[inline]
    pub fn as_slice(&self) -> &[Uop] {
        &self.uops
    }

    /// Allocates a new micro-op at the write cursor and returns its
    /// index. Fails (returns `None`) if the buffer is at capacity; the
    /// caller (the register-file-aware emit layer) is responsible for
    /// translating that into a `BlockEndReason::UopBufferFull`.
    #[must_use]
    pub fn push(&mut self, op: UopOp, pc: u32) -> Option<usize> {
        if self.is_full() {
            return None;
        }
        let idx = self.uops.len();
        self.uops.push(Uop::new(op, pc));
        Some(idx)
    }

    /// Resolves a previously emitted `_DEST` jump's target to the write
    /// cursor (the next uop to be pushed), chaining it onto the target's
    /// `jump_list_next` list and marking the target `IS_JUMP_TARGET`.
    ///
    /// Forward jumps call this once the destination instruction is
    /// reached; backward jumps already know the target index and never
    /// need it.
    pub fn set_jump_dest(&mut self, jump_uop: usize) {
        let target = self.uops.len();
        self.link_jump_to_target(jump_uop, target);
    }

    /// Links `jump_uop` to jump at a known target index (used for both
    /// forward resolution via [`Self::set_jump_dest`] and for backward
    /// jumps that already know their destination).
    pub fn link_jump_to_target(&mut self, jump_uop: usize, target: usize) {
        self.uops[jump_uop].jump_dest = Some(target);
        if target >= self.uops.len() {
            self.end_of_block_jumps.push(jump_uop);
        } else {
            // The chain of jumps targeting `target` is rooted in
            // `target`'s own `jump_list_next` field; prepend `jump_uop`.
            let head = self.uops[target].jump_list_next;
            self.uops[jump_uop].jump_list_next = head;
            self.uops[target].jump_list_next = Some(jump_uop);
            self.uops[target].is_jump_target = true;
        }
    }
}
