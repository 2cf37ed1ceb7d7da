// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The micro-op opcode catalogue.
//!
//! Laid out the same way the teacher lays out `Isa`/`IsaEntry`: one flat
//! enum plus a `const` attribute table indexed by the enum discriminant,
//! so dispatch is a match/array lookup rather than a allocated vtable.

use super::{Barrier, UopFlags};

macro_rules! uop_ops {
    ($( $(#[$meta:meta])* $name:ident ),+ $(,)?) => {
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub enum UopOp {
            $( $(#[$meta])* $name, )+
            _Count,
        }

        impl UopOp {
            pub const COUNT: usize = Self::_Count as usize;
            pub const ALL: [UopOp; Self::COUNT] = [ $( UopOp::$name, )+ ];
        }
    };
}

uop_ops! {
    // Data movement
    Mov, MovImm, MovPtr, MovRegPtr, MovzxRegPtr8, MovzxRegPtr16, Movzx, Movsx,
    MovDoubleInt, MovIntDouble, MovIntDouble64,

    // Arithmetic / logic
    Add, AddImm, AddLshift, And, AndImm, Or, OrImm, Sub, SubImm, Xor, XorImm, Andn,

    // Shift / rotate
    Sar, SarImm, Shl, ShlImm, Shr, ShrImm, Rol, RolImm, Ror, RorImm,

    // Memory
    MemLoadAbs, MemLoadReg, MemLoadSingle, MemLoadDouble,
    MemStoreAbs, MemStoreReg, MemStoreImm8, MemStoreImm16, MemStoreImm32,
    MemStoreSingle, MemStoreDouble,

    // Control flow: each comparison kind has a pointer (out-of-block) and
    // a _Dest (in-block) variant.
    CmpJzPtr, CmpJzDest, CmpJnzPtr, CmpJnzDest,
    CmpJbPtr, CmpJbDest, CmpJnbPtr, CmpJnbDest,
    CmpJlPtr, CmpJlDest, CmpJnlPtr, CmpJnlDest,
    CmpJbePtr, CmpJbeDest, CmpJnbePtr, CmpJnbeDest,
    CmpJlePtr, CmpJleDest, CmpJnlePtr, CmpJnleDest,
    CmpJoPtr, CmpJoDest, CmpJnoPtr, CmpJnoDest,
    TestJsPtr, TestJsDest, TestJnsPtr, TestJnsDest,
    Jmp, JmpDest, NopBarrier, CmpImmJzAbs,

    // Function call
    LoadFuncArg0, LoadFuncArg1, LoadFuncArg2, LoadFuncArg3,
    LoadFuncArg0Imm, LoadFuncArg1Imm, LoadFuncArg2Imm, LoadFuncArg3Imm,
    CallFunc, CallFuncResult, CallInstructionFunc,

    // FPU
    FpEnter, Fadd, Fsub, Fmul, Fdiv, Fcom, Fabs, Fchs, Ftst, Fsqrt,

    // MMX / 3DNow
    MmxEnter, PaddB, PaddW, PaddD, PsubB, PsubW, PsubD,
    PcmpEqB, PcmpEqW, PcmpEqD, PcmpGtB, PcmpGtW, PcmpGtD,
    PsllW, PsllD, PsrlW, PsrlD, PsraW, PsraD,
    PunpcklBw, PunpcklWd, PunpcklDq, PunpckhBw, PunpckhWd, PunpckhDq,
    Packsswb, Packssdw, PmullW, PmulhW,
    Pfadd, Pfsub, Pfmul, Pfmin, Pfmax, PfcmpEq, PfcmpGt, PfcmpGe,
    Pf2id, Pi2fd, Pfrcp, Pfrsqrt,

    // Special
    StorePImm, StorePImm8, LoadSeg,
}

#[derive(Clone, Copy)]
struct OpAttrs {
    barrier: Barrier,
    flags: UopFlags,
}

const fn attrs(barrier: Barrier, flags: UopFlags) -> OpAttrs {
    OpAttrs { barrier, flags }
}

const NONE: Barrier = Barrier::None;
const FULL: Barrier = Barrier::Full;
const ORDER: Barrier = Barrier::Order;

const REGS: UopFlags = UopFlags::USES_REGS;
const IMM: UopFlags = UopFlags::USES_IMMEDIATE;
const PTR: UopFlags = UopFlags::USES_POINTER;
const JUMP: UopFlags = UopFlags::IS_JUMP;

const fn or(a: UopFlags, b: UopFlags) -> UopFlags {
    UopFlags::from_bits_truncate(a.bits() | b.bits())
}

/// Attribute table indexed by [`UopOp`] discriminant.
pub static UOP_ATTRS: [OpAttrs; UopOp::COUNT] = build_attrs();

const fn build_attrs() -> [OpAttrs; UopOp::COUNT] {
    let mut table = [attrs(NONE, REGS); UopOp::COUNT];

    macro_rules! set {
        ($op:expr, $barrier:expr, $flags:expr) => {
            table[$op as usize] = attrs($barrier, $flags);
        };
    }

    set!(UopOp::Mov, NONE, REGS);
    set!(UopOp::MovImm, NONE, or(REGS, IMM));
    set!(UopOp::MovPtr, NONE, or(REGS, PTR));
    set!(UopOp::MovRegPtr, NONE, or(REGS, PTR));
    set!(UopOp::MovzxRegPtr8, NONE, or(REGS, PTR));
    set!(UopOp::MovzxRegPtr16, NONE, or(REGS, PTR));
    set!(UopOp::Movzx, NONE, REGS);
    set!(UopOp::Movsx, NONE, REGS);
    set!(UopOp::MovDoubleInt, NONE, REGS);
    set!(UopOp::MovIntDouble, NONE, REGS);
    set!(UopOp::MovIntDouble64, NONE, REGS);

    set!(UopOp::Add, NONE, REGS);
    set!(UopOp::AddImm, NONE, or(REGS, IMM));
    set!(UopOp::AddLshift, NONE, or(REGS, IMM));
    set!(UopOp::And, NONE, REGS);
    set!(UopOp::AndImm, NONE, or(REGS, IMM));
    set!(UopOp::Or, NONE, REGS);
    set!(UopOp::OrImm, NONE, or(REGS, IMM));
    set!(UopOp::Sub, NONE, REGS);
    set!(UopOp::SubImm, NONE, or(REGS, IMM));
    set!(UopOp::Xor, NONE, REGS);
    set!(UopOp::XorImm, NONE, or(REGS, IMM));
    set!(UopOp::Andn, NONE, REGS);

    set!(UopOp::Sar, NONE, REGS);
    set!(UopOp::SarImm, NONE, or(REGS, IMM));
    set!(UopOp::Shl, NONE, REGS);
    set!(UopOp::ShlImm, NONE, or(REGS, IMM));
    set!(UopOp::Shr, NONE, REGS);
    set!(UopOp::ShrImm, NONE, or(REGS, IMM));
    set!(UopOp::Rol, NONE, REGS);
    set!(UopOp::RolImm, NONE, or(REGS, IMM));
    set!(UopOp::Ror, NONE, REGS);
    set!(UopOp::RorImm, NONE, or(REGS, IMM));

    set!(UopOp::MemLoadAbs, ORDER, or(REGS, PTR));
    set!(UopOp::MemLoadReg, ORDER, REGS);
    set!(UopOp::MemLoadSingle, ORDER, REGS);
    set!(UopOp::MemLoadDouble, ORDER, REGS);
    set!(UopOp::MemStoreAbs, ORDER, or(REGS, PTR));
    set!(UopOp::MemStoreReg, ORDER, REGS);
    set!(UopOp::MemStoreImm8, ORDER, or(REGS, IMM));
    set!(UopOp::MemStoreImm16, ORDER, or(REGS, IMM));
    set!(UopOp::MemStoreImm32, ORDER, or(REGS, IMM));
    set!(UopOp::MemStoreSingle, ORDER, REGS);
    set!(UopOp::MemStoreDouble, ORDER, REGS);

    macro_rules! set_branch_pair {
        ($ptr:expr, $dest:expr) => {
            set!($ptr, NONE, or(REGS, or(PTR, JUMP)));
            set!($dest, NONE, or(REGS, JUMP));
        };
    }

    set_branch_pair!(UopOp::CmpJzPtr, UopOp::CmpJzDest);
    set_branch_pair!(UopOp::CmpJnzPtr, UopOp::CmpJnzDest);
    set_branch_pair!(UopOp::CmpJbPtr, UopOp::CmpJbDest);
    set_branch_pair!(UopOp::CmpJnbPtr, UopOp::CmpJnbDest);
    set_branch_pair!(UopOp::CmpJlPtr, UopOp::CmpJlDest);
    set_branch_pair!(UopOp::CmpJnlPtr, UopOp::CmpJnlDest);
    set_branch_pair!(UopOp::CmpJbePtr, UopOp::CmpJbeDest);
    set_branch_pair!(UopOp::CmpJnbePtr, UopOp::CmpJnbeDest);
    set_branch_pair!(UopOp::CmpJlePtr, UopOp::CmpJleDest);
    set_branch_pair!(UopOp::CmpJnlePtr, UopOp::CmpJnleDest);
    set_branch_pair!(UopOp::CmpJoPtr, UopOp::CmpJoDest);
    set_branch_pair!(UopOp::CmpJnoPtr, UopOp::CmpJnoDest);
    set_branch_pair!(UopOp::TestJsPtr, UopOp::TestJsDest);
    set_branch_pair!(UopOp::TestJnsPtr, UopOp::TestJnsDest);

    set!(UopOp::Jmp, FULL, or(PTR, JUMP));
    set!(UopOp::JmpDest, FULL, JUMP);
    set!(UopOp::NopBarrier, FULL, UopFlags::empty());
    set!(UopOp::CmpImmJzAbs, NONE, or(REGS, or(IMM, or(PTR, JUMP))));

    set!(UopOp::LoadFuncArg0, NONE, REGS);
    set!(UopOp::LoadFuncArg1, NONE, REGS);
    set!(UopOp::LoadFuncArg2, NONE, REGS);
    set!(UopOp::LoadFuncArg3, NONE, REGS);
    set!(UopOp::LoadFuncArg0Imm, NONE, IMM);
    set!(UopOp::LoadFuncArg1Imm, NONE, IMM);
    set!(UopOp::LoadFuncArg2Imm, NONE, IMM);
    set!(UopOp::LoadFuncArg3Imm, NONE, IMM);
    set!(UopOp::CallFunc, FULL, PTR);
    set!(UopOp::CallFuncResult, FULL, or(REGS, PTR));
    set!(UopOp::CallInstructionFunc, FULL, PTR);

    set!(UopOp::FpEnter, FULL, UopFlags::empty());
    set!(UopOp::Fadd, NONE, REGS);
    set!(UopOp::Fsub, NONE, REGS);
    set!(UopOp::Fmul, NONE, REGS);
    set!(UopOp::Fdiv, NONE, REGS);
    set!(UopOp::Fcom, NONE, REGS);
    set!(UopOp::Fabs, NONE, REGS);
    set!(UopOp::Fchs, NONE, REGS);
    set!(UopOp::Ftst, NONE, REGS);
    set!(UopOp::Fsqrt, NONE, REGS);

    set!(UopOp::MmxEnter, FULL, UopFlags::empty());
    set!(UopOp::PaddB, NONE, REGS);
    set!(UopOp::PaddW, NONE, REGS);
    set!(UopOp::PaddD, NONE, REGS);
    set!(UopOp::PsubB, NONE, REGS);
    set!(UopOp::PsubW, NONE, REGS);
    set!(UopOp::PsubD, NONE, REGS);
    set!(UopOp::PcmpEqB, NONE, REGS);
    set!(UopOp::PcmpEqW, NONE, REGS);
    set!(UopOp::PcmpEqD, NONE, REGS);
    set!(UopOp::PcmpGtB, NONE, REGS);
    set!(UopOp::PcmpGtW, NONE, REGS);
    set!(UopOp::PcmpGtD, NONE, REGS);
    set!(UopOp::PsllW, NONE, REGS);
    set!(UopOp::PsllD, NONE, REGS);
    set!(UopOp::PsrlW, NONE, REGS);
    set!(UopOp::PsrlD, NONE, REGS);
    set!(UopOp::PsraW, NONE, REGS);
    set!(UopOp::PsraD, NONE, REGS);
    set!(UopOp::PunpcklBw, NONE, REGS);
    set!(UopOp::PunpcklWd, NONE, REGS);
    set!(UopOp::PunpcklDq, NONE, REGS);
    set!(UopOp::PunpckhBw, NONE, REGS);
    set!(UopOp::PunpckhWd, NONE, REGS);
    set!(UopOp::PunpckhDq, NONE, REGS);
    set!(UopOp::Packsswb, NONE, REGS);
    set!(UopOp::Packssdw, NONE, REGS);
    set!(UopOp::PmullW, NONE, REGS);
    set!(UopOp::PmulhW, NONE, REGS);
    set!(UopOp::Pfadd, NONE, REGS);
    set!(UopOp::Pfsub, NONE, REGS);
    set!(UopOp::Pfmul, NONE, REGS);
    set!(UopOp::Pfmin, NONE, REGS);
    set!(UopOp::Pfmax, NONE, REGS);
    set!(UopOp::PfcmpEq, NONE, REGS);
    set!(UopOp::PfcmpGt, NONE, REGS);
    set!(UopOp::PfcmpGe, NONE, REGS);
    set!(UopOp::Pf2id, NONE, REGS);
    set!(UopOp::Pi2fd, NONE, REGS);
    set!(UopOp::Pfrcp, NONE, REGS);
    set!(UopOp::Pfrsqrt, NONE, REGS);

    set!(UopOp::StorePImm, NONE, or(PTR, IMM));
    set!(UopOp::StorePImm8, NONE, or(PTR, IMM));
    set!(UopOp::LoadSeg, FULL, or(REGS, PTR));

    table
}

impl UopOp {
    #[inline]
    pub fn barrier(self) -> Barrier {
        UOP_ATTRS[self as usize].barrier
    }

    #[inline]
    pub fn flags(self) -> UopFlags {
        UOP_ATTRS[self as usize].flags
    }

    #[inline]
    pub fn is_jump(self) -> bool {
        self.flags().contains(UopFlags::IS_JUMP)
    }
}
