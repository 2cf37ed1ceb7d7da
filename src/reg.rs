// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Virtual register identifiers and their static attributes.
//!
//! A [`RegId`] names a *slot*, not a value: the versioned value living in
//! that slot at a point in the IR is an [`crate::ir::IrReg`]. The
//! enumeration order here matches `codegen_reg.h`'s `IREG_*` layout in
//! the original source, so that `RegId as usize` stays a stable, densely
//! packed index usable for array-indexed per-id tables.

/// Native operand size of a virtual register.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "ffi", repr(C))]
pub enum RegSize {
    /// Low byte of a 32-bit register (e.g. AL).
    ByteLow,
    /// High byte of a 32-bit register (e.g. AH).
    ByteHigh,
    Word,
    Dword,
    Qword,
    Double,
}

impl RegSize {
    /// Size in bytes, used for spill-area offset arithmetic.
    pub const fn bytes(self) -> u32 {
        match self {
            RegSize::ByteLow | RegSize::ByteHigh => 1,
            RegSize::Word => 2,
            RegSize::Dword => 4,
            RegSize::Qword | RegSize::Double => 8,
        }
    }
}

/// Which host register bank a register's value lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "ffi", repr(C))]
pub enum Domain {
    Integer,
    Float,
}

/// Whether a register's live-out value is observable outside the block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "ffi", repr(C))]
pub enum LifetimeClass {
    /// Must be written back to the shared CPU-state struct on any
    /// ordering barrier; an external observer (the interpreter fallback,
    /// a fault handler, another block) may read it.
    Permanent,
    /// Scratch; safe to discard with no reader remaining in the block.
    Volatile,
}

macro_rules! reg_ids {
    ($( $(#[$meta:meta])* $name:ident ),+ $(,)?) => {
        /// Closed enumeration of every virtual register the translator
        /// models. Order mirrors `codegen_reg.h`'s `IREG_*` constants.
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(u16)]
        pub enum RegId {
            $( $(#[$meta])* $name, )+
            /// Not a real id; used to size tables. Always last.
            _Count,
        }

        impl RegId {
            pub const COUNT: usize = Self::_Count as usize;

            pub const ALL: [RegId; Self::COUNT] = [ $( RegId::$name, )+ ];
        }
    };
}

reg_ids! {
    Eax, Ecx, Edx, Ebx, Esp, Ebp, Esi, Edi,
    /// Flag-evaluation opcode kind (which ALU op last touched the flags).
    FlagsOp,
    FlagsRes,
    FlagsOp1,
    FlagsOp2,
    Pc,
    OldPc,
    EaAddr,
    EaSeg,
    Op32,
    SsegsOverride,
    RmModReg,
    CyclesAccumulator,
    Cycles,
    CsBase, DsBase, EsBase, FsBase, GsBase, SsBase,
    CsSel, DsSel, EsSel, FsSel, GsSel, SsSel,
    Temp0, Temp1, Temp2, Temp3,
    FpuTop,
    Temp0d, Temp1d,
    St0, St1, St2, St3, St4, St5, St6, St7,
    Tag0, Tag1, Tag2, Tag3, Tag4, Tag5, Tag6, Tag7,
    St0I64, St1I64, St2I64, St3I64, St4I64, St5I64, St6I64, St7I64,
    Mm0, Mm1, Mm2, Mm3, Mm4, Mm5, Mm6, Mm7,
    FpuControlWord,
    FpuStatusWord,
    Flags,
    Eflags,
    ScratchI0, ScratchI1, ScratchI2, ScratchI3,
    ScratchF0, ScratchF1,
}

/// Static attributes of a [`RegId`]: its native size, host register
/// domain, and whether it must be written back on a full barrier.
#[derive(Clone, Copy, Debug)]
pub struct RegAttrs {
    pub size: RegSize,
    pub domain: Domain,
    pub lifetime: LifetimeClass,
}

const fn attrs(size: RegSize, domain: Domain, lifetime: LifetimeClass) -> RegAttrs {
    RegAttrs { size, domain, lifetime }
}

use Domain::{Float, Integer};
use LifetimeClass::{Permanent, Volatile};
use RegSize::{ByteLow as BL, Double as D, Dword as DW, Qword as Q, Word as W};

/// Attribute table indexed by [`RegId`]; built once as a `const` array in
/// the same spirit as the teacher's `IsaEntry::ISA_ENTRY`.
pub const REG_ATTRS: [RegAttrs; RegId::COUNT] = build_attrs();

const fn build_attrs() -> [RegAttrs; RegId::COUNT] {
    let mut table = [attrs(DW, Integer, Volatile); RegId::COUNT];

    macro_rules! set {
        ($id:expr, $size:expr, $domain:expr, $life:expr) => {
            table[$id as usize] = attrs($size, $domain, $life);
        };
    }

    set!(RegId::Eax, DW, Integer, Permanent);
    set!(RegId::Ecx, DW, Integer, Permanent);
    set!(RegId::Edx, DW, Integer, Permanent);
    set!(RegId::Ebx, DW, Integer, Permanent);
    set!(RegId::Esp, DW, Integer, Permanent);
    set!(RegId::Ebp, DW, Integer, Permanent);
    set!(RegId::Esi, DW, Integer, Permanent);
    set!(RegId::Edi, DW, Integer, Permanent);

    set!(RegId::FlagsOp, DW, Integer, Permanent);
    set!(RegId::FlagsRes, DW, Integer, Permanent);
    set!(RegId::FlagsOp1, DW, Integer, Permanent);
    set!(RegId::FlagsOp2, DW, Integer, Permanent);

    set!(RegId::Pc, DW, Integer, Permanent);
    set!(RegId::OldPc, DW, Integer, Permanent);

    set!(RegId::EaAddr, DW, Integer, Volatile);
    set!(RegId::EaSeg, DW, Integer, Volatile);
    set!(RegId::Op32, DW, Integer, Permanent);
    set!(RegId::SsegsOverride, DW, Integer, Permanent);
    set!(RegId::RmModReg, DW, Integer, Volatile);

    set!(RegId::CyclesAccumulator, DW, Integer, Volatile);
    set!(RegId::Cycles, DW, Integer, Permanent);

    set!(RegId::CsBase, DW, Integer, Permanent);
    set!(RegId::DsBase, DW, Integer, Permanent);
    set!(RegId::EsBase, DW, Integer, Permanent);
    set!(RegId::FsBase, DW, Integer, Permanent);
    set!(RegId::GsBase, DW, Integer, Permanent);
    set!(RegId::SsBase, DW, Integer, Permanent);

    set!(RegId::CsSel, W, Integer, Permanent);
    set!(RegId::DsSel, W, Integer, Permanent);
    set!(RegId::EsSel, W, Integer, Permanent);
    set!(RegId::FsSel, W, Integer, Permanent);
    set!(RegId::GsSel, W, Integer, Permanent);
    set!(RegId::SsSel, W, Integer, Permanent);

    set!(RegId::Temp0, DW, Integer, Volatile);
    set!(RegId::Temp1, DW, Integer, Volatile);
    set!(RegId::Temp2, DW, Integer, Volatile);
    set!(RegId::Temp3, DW, Integer, Volatile);

    set!(RegId::FpuTop, BL, Integer, Permanent);

    set!(RegId::Temp0d, DW, Integer, Volatile);
    set!(RegId::Temp1d, DW, Integer, Volatile);

    set!(RegId::St0, D, Float, Permanent);
    set!(RegId::St1, D, Float, Permanent);
    set!(RegId::St2, D, Float, Permanent);
    set!(RegId::St3, D, Float, Permanent);
    set!(RegId::St4, D, Float, Permanent);
    set!(RegId::St5, D, Float, Permanent);
    set!(RegId::St6, D, Float, Permanent);
    set!(RegId::St7, D, Float, Permanent);

    set!(RegId::Tag0, BL, Integer, Permanent);
    set!(RegId::Tag1, BL, Integer, Permanent);
    set!(RegId::Tag2, BL, Integer, Permanent);
    set!(RegId::Tag3, BL, Integer, Permanent);
    set!(RegId::Tag4, BL, Integer, Permanent);
    set!(RegId::Tag5, BL, Integer, Permanent);
    set!(RegId::Tag6, BL, Integer, Permanent);
    set!(RegId::Tag7, BL, Integer, Permanent);

    set!(RegId::St0I64, Q, Integer, Permanent);
    set!(RegId::St1I64, Q, Integer, Permanent);
    set!(RegId::St2I64, Q, Integer, Permanent);
    set!(RegId::St3I64, Q, Integer, Permanent);
    set!(RegId::St4I64, Q, Integer, Permanent);
    set!(RegId::St5I64, Q, Integer, Permanent);
    set!(RegId::St6I64, Q, Integer, Permanent);
    set!(RegId::St7I64, Q, Integer, Permanent);

    set!(RegId::Mm0, Q, Integer, Permanent);
    set!(RegId::Mm1, Q, Integer, Permanent);
    set!(RegId::Mm2, Q, Integer, Permanent);
    set!(RegId::Mm3, Q, Integer, Permanent);
    set!(RegId::Mm4, Q, Integer, Permanent);
    set!(RegId::Mm5, Q, Integer, Permanent);
    set!(RegId::Mm6, Q, Integer, Permanent);
    set!(RegId::Mm7, Q, Integer, Permanent);

    set!(RegId::FpuControlWord, W, Integer, Permanent);
    set!(RegId::FpuStatusWord, W, Integer, Permanent);
    set!(RegId::Flags, W, Integer, Permanent);
    set!(RegId::Eflags, DW, Integer, Permanent);

    set!(RegId::ScratchI0, DW, Integer, Volatile);
    set!(RegId::ScratchI1, DW, Integer, Volatile);
    set!(RegId::ScratchI2, DW, Integer, Volatile);
    set!(RegId::ScratchI3, DW, Integer, Volatile);
    set!(RegId::ScratchF0, D, Float, Volatile);
    set!(RegId::ScratchF1, D, Float, Volatile);

    // `_Count` keeps its zeroed placeholder; never indexed through RegId.
    table
}

impl RegId {
    #[inline]
    pub const fn attrs(self) -> RegAttrs {
        REG_ATTRS[self as usize]
    }

    #[inline]
    pub const fn domain(self) -> Domain {
        self.attrs().domain
    }

    #[inline]
    pub const fn lifetime(self) -> LifetimeClass {
        self.attrs().lifetime
    }

    #[inline]
    pub const fn is_permanent(self) -> bool {
        matches!(self.lifetime(), LifetimeClass::Permanent)
    }
}
