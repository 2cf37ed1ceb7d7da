// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The shared CPU-state struct: everything a compiled block reads and
//! writes outside of its own IR, plus the segment-descriptor cache and
//! the embedder-supplied routine table compiled calls target.

/// Identifies one of the six x86 segment registers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "ffi", repr(C))]
pub enum SegmentId {
    Es,
    Cs,
    Ss,
    Ds,
    Fs,
    Gs,
}

impl SegmentId {
    pub const ALL: [SegmentId; 6] =
        [SegmentId::Es, SegmentId::Cs, SegmentId::Ss, SegmentId::Ds, SegmentId::Fs, SegmentId::Gs];
}

/// Per-segment descriptor cache, mirroring the original's `x86seg`.
#[derive(Clone, Copy, Debug, Default)]
#[cfg_attr(feature = "ffi", repr(C))]
pub struct SegmentDescriptor {
    pub base: u32,
    pub limit: u32,
    pub selector: u16,
    /// `true` once a block has already emitted this segment's
    /// null-selector GPF check; cleared at block-compile start.
    pub checked: bool,
}

bitflags::bitflags! {
    /// Cached status bits that gate whether a block compiled under one
    /// set of assumptions (flat DS/SS) may be reused under the current
    /// one. A block is only dispatched when `status` matches exactly.
    #[derive(Default)]
    pub struct CpuStatus: u16 {
        const FLAT_DS     = 0b0000_0001;
        const FLAT_SS     = 0b0000_0010;
        const NOT_FLAT_DS = 0b0000_0100;
        const NOT_FLAT_SS = 0b0000_1000;
        const USE32       = 0b0001_0000;
        const STACK32     = 0b0010_0000;
        const PROTECTED   = 0b0100_0000;
    }
}

/// Addresses of embedder-supplied runtime routines a compiled block may
/// call out to. Captured once at `codegen_init` and treated as constant
/// for the process lifetime; the backend embeds them as call targets.
#[derive(Clone, Copy, Debug, Default)]
#[cfg_attr(feature = "ffi", repr(C))]
pub struct RuntimeRoutines {
    /// Raises a guest exception and returns control to the dispatcher;
    /// the target of `CMP_IMM_JZ(seg_base, -1, gpf_rout)`-style checks.
    pub gpf_routine: usize,
    /// Tail target a block jumps to when it must exit without a fault.
    pub exit_stub: usize,
    /// Rebuilds `eflags` from the lazy `(flags_op, op1, op2, res)` tuple.
    pub flag_rebuild_helper: usize,
    /// Packed MMX/SSE helper entry points, indexed by operation id.
    pub packed_op_helpers: [usize; 16],
    /// Validates and loads a segment selector; non-zero return faults.
    pub segment_load_helper: usize,
}

/// Shared CPU state visible to every compiled block and to the
/// interpreter fallback. Field layout is logical, not packed for a real
/// ABI: a concrete backend decides actual offsets when it lowers
/// [`crate::memory::GuestMemory`]'s `field_address` calls.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "ffi", repr(C))]
pub struct CpuState {
    pub gpr: [u32; 8],
    pub eip: u32,
    pub old_eip: u32,

    pub flags_op: u32,
    pub flags_res: u32,
    pub flags_op1: u32,
    pub flags_op2: u32,
    pub flags: u16,
    pub eflags: u32,

    pub segments: [SegmentDescriptor; 6],

    pub fpu_st: [f64; 8],
    pub fpu_tag: [u8; 8],
    pub fpu_top: u8,
    pub fpu_control_word: u16,
    pub fpu_status_word: u16,
    pub mm: [u64; 8],

    pub cycles: i64,
    pub status: CpuStatus,
    pub routines: RuntimeRoutines,
}

impl CpuState {
    pub fn new() -> Self {
        Self {
            gpr: [0; 8],
            eip: 0,
            old_eip: 0,
            flags_op: 0,
            flags_res: 0,
            flags_op1: 0,
            flags_op2: 0,
            flags: 0,
            eflags: 0,
            segments: [SegmentDescriptor::default(); 6],
            fpu_st: [0.0; 8],
            fpu_tag: [0; 8],
            fpu_top: 0,
            fpu_control_word: 0x37f,
            fpu_status_word: 0,
            mm: [0; 8],
            cycles: 0,
            status: CpuStatus::empty(),
            routines: RuntimeRoutines::default(),
        }
    }

    #[inline]
    pub fn segment(&self, id: SegmentId) -> &SegmentDescriptor {
        &self.segments[id as usize]
    }

    #[inline]
    pub fn segment_mut(&mut self, id: SegmentId) -> &mut SegmentDescriptor {
        &mut self.segments[id as usize]
    }

    /// `true` if `seg` is known to need no runtime null-selector check:
    /// real mode, or already checked, or the flat-DS fast path.
    pub fn segment_precheck_satisfied(&self, id: SegmentId) -> bool {
        if self.segment(id).checked {
            return true;
        }
        if id == SegmentId::Ds
            && self.status.contains(CpuStatus::FLAT_DS)
            && !self.status.contains(CpuStatus::NOT_FLAT_DS)
        {
            return true;
        }
        !self.status.contains(CpuStatus::PROTECTED)
    }
}

impl Default for CpuState {
    fn default() -> Self {
        Self::new()
    }
}
