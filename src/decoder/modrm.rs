// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! ModR/M + SIB decode and effective-address micro-op emission.
//!
//! Register-direct (`mod == 11`) forms never reach here; the caller
//! checks that first and reads/writes the named GPR directly.

use crate::cpu_state::SegmentId;
use crate::ir::IrReg;
use crate::reg::RegId;

/// Decoded `mod`/`reg`/`rm` fields of one ModR/M byte.
#[derive(Clone, Copy, Debug)]
pub struct ModRm {
    pub md: u8,
    pub reg: u8,
    pub rm: u8,
}

impl ModRm {
    pub fn decode(byte: u8) -> Self {
        Self { md: (byte >> 6) & 3, reg: (byte >> 3) & 7, rm: byte & 7 }
    }

    pub fn is_register_direct(self) -> bool {
        self.md == 3
    }
}

/// A rolled-up effective-address computation result: which micro-ops to
/// emit (via the passed-in emit closures) and how many displacement/SIB
/// bytes were consumed, plus which segment governs the access.
pub struct EaResult {
    pub extra_bytes: u32,
    pub segment: SegmentId,
}

/// The 16-bit `rm`-to-base-register table from the 16-bit addressing
/// modes (`BX+SI`, `BX+DI`, `BP+SI`, `BP+DI`, `SI`, `DI`, `BP`/disp16,
/// `BX`), indexed by `rm`.
const RM16_BASE: [RegId; 8] = [
    RegId::Ebx,
    RegId::Ebx,
    RegId::Ebp,
    RegId::Ebp,
    RegId::Esi,
    RegId::Edi,
    RegId::Ebp,
    RegId::Ebx,
];

fn rm16_has_index(rm: u8) -> Option<RegId> {
    match rm & 7 {
        0 | 2 => Some(RegId::Esi),
        1 | 3 => Some(RegId::Edi),
        _ => None,
    }
}

/// Emits the IR for a 16-bit-addressed effective address into
/// `RegId::EaAddr`, given the already-decoded ModR/M and the two bytes
/// following it (used for `disp8`/`disp16`). `read`/`write_imm`/`add`/
/// `add_imm`/`and_imm` are injected so this module stays independent of
/// the concrete IR-buffer/register-file types it's called with.
pub fn emit_ea_16(
    modrm: ModRm,
    disp_lo: u8,
    disp_hi: u8,
    has_segment_override: bool,
    mut mov_imm: impl FnMut(u32),
    mut mov_reg: impl FnMut(RegId),
    mut add_reg: impl FnMut(RegId),
    mut add_imm: impl FnMut(i32),
    mut and_imm: impl FnMut(u32),
) -> EaResult {
    if modrm.md == 0 && modrm.rm == 6 {
        let addr = u16::from_le_bytes([disp_lo, disp_hi]) as u32;
        mov_imm(addr);
        return EaResult { extra_bytes: 2, segment: SegmentId::Ds };
    }

    mov_reg(RM16_BASE[modrm.rm as usize]);
    if let Some(index) = rm16_has_index(modrm.rm) {
        add_reg(index);
    }

    let mut extra_bytes = 0;
    match modrm.md {
        1 => {
            add_imm(disp_lo as i8 as i32);
            extra_bytes = 1;
        }
        2 => {
            add_imm(u16::from_le_bytes([disp_lo, disp_hi]) as i32);
            extra_bytes = 2;
        }
        _ => {}
    }
    and_imm(0xffff);

    let bp_relative = matches!(modrm.rm, 2 | 3 | 6) && modrm.md != 0;
    let segment = if bp_relative && !has_segment_override { SegmentId::Ss } else { SegmentId::Ds };
    EaResult { extra_bytes, segment }
}

/// Decoded SIB byte.
#[derive(Clone, Copy, Debug)]
pub struct Sib {
    pub scale: u8,
    pub index: u8,
    pub base: u8,
}

impl Sib {
    pub fn decode(byte: u8) -> Self {
        Self { scale: (byte >> 6) & 3, index: (byte >> 3) & 7, base: byte & 7 }
    }
}

const GPR32: [RegId; 8] =
    [RegId::Eax, RegId::Ecx, RegId::Edx, RegId::Ebx, RegId::Esp, RegId::Ebp, RegId::Esi, RegId::Edi];

/// Emits the IR for a 32-bit-addressed effective address. `disp32` is
/// read lazily by the caller through `read_disp32` only when the
/// encoding actually carries one, matching the source's avoidance of
/// reading four bytes that aren't there.
pub fn emit_ea_32(
    modrm: ModRm,
    sib_byte: Option<u8>,
    disp8: i8,
    mut read_disp32: impl FnMut() -> i32,
    has_segment_override: bool,
    mut mov_imm: impl FnMut(u32),
    mut mov_reg: impl FnMut(RegId),
    mut add_reg: impl FnMut(RegId),
    mut add_reg_lshift: impl FnMut(RegId, u8),
    mut add_imm: impl FnMut(i32),
) -> EaResult {
    let mut extra_bytes;
    let mut segment = SegmentId::Ds;

    if modrm.rm == 4 {
        let sib = Sib::decode(sib_byte.expect("rm==4 implies a SIB byte"));
        match modrm.md {
            0 if sib.base == 5 => {
                mov_imm(read_disp32() as u32);
                extra_bytes = 4;
            }
            0 => {
                mov_reg(GPR32[sib.base as usize]);
                extra_bytes = 0;
            }
            1 => {
                mov_imm(disp8 as i32 as u32);
                add_reg(GPR32[sib.base as usize]);
                extra_bytes = 1;
            }
            _ => {
                mov_imm(read_disp32() as u32);
                add_reg(GPR32[sib.base as usize]);
                extra_bytes = 4;
            }
        }

        if (sib.base == 4 || (modrm.md != 0 && sib.base == 5)) && !has_segment_override {
            segment = SegmentId::Ss;
        }
        if sib.index != 4 {
            match sib.scale {
                0 => add_reg(GPR32[sib.index as usize]),
                n => add_reg_lshift(GPR32[sib.index as usize], n),
            }
        }
    } else if modrm.md == 0 && modrm.rm == 5 {
        mov_imm(read_disp32() as u32);
        extra_bytes = 4;
    } else {
        mov_reg(GPR32[modrm.rm as usize]);
        extra_bytes = 0;
        if modrm.md != 0 {
            if modrm.rm == 5 && !has_segment_override {
                segment = SegmentId::Ss;
            }
            if modrm.md == 1 {
                add_imm(disp8 as i32);
                extra_bytes = 1;
            } else {
                add_imm(read_disp32());
                extra_bytes = 4;
            }
        }
    }

    EaResult { extra_bytes, segment }
}

/// The register backing an effective address once computed, used by
/// callers that need to fold the result into a load/store micro-op.
pub const EA_REG: RegId = RegId::EaAddr;

pub fn ea_ir_reg(version: u16) -> IrReg {
    IrReg::new(EA_REG, version)
}
