// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Legacy x86 prefix walking, as a loop over single bytes the same way
//! the source's `codegen_generate_call` switch does it, rather than a
//! lookahead table: prefixes are rare enough in practice that re-reading
//! one byte at a time costs nothing and keeps the FPU-escape and
//! segment-override cases readable.

use crate::cpu_state::SegmentId;

/// Which opcode map a chain of prefixes selects.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpcodeMap {
    OneByte,
    TwoByte,
    /// An x87 escape (`0xd8`..`0xdf`), carrying the escape byte so the
    /// decoder can select the right one of the eight FPU sub-tables.
    FpuEscape(u8),
}

/// Accumulated prefix state for one instruction, mirroring the local
/// variables `codegen_generate_call` threads through its prefix loop.
#[derive(Clone, Copy, Debug)]
pub struct Prefixes {
    pub map: OpcodeMap,
    pub segment_override: Option<SegmentId>,
    /// `true` once any segment-override prefix was seen (`op_ssegs`):
    /// the effective-address emitter must not assume the default
    /// DS-relative segment check state.
    pub has_segment_override: bool,
    /// Operand-size bit: `true` = 32-bit operands given current mode.
    pub operand_32: bool,
    /// Address-size bit: `true` = 32-bit addressing given current mode.
    pub address_32: bool,
    pub repne: bool,
    pub repe: bool,
    pub lock: bool,
    /// Number of prefix bytes consumed before the opcode byte itself.
    pub bytes_consumed: u32,
}

impl Prefixes {
    fn new(default_operand_32: bool, default_address_32: bool) -> Self {
        Self {
            map: OpcodeMap::OneByte,
            segment_override: None,
            has_segment_override: false,
            operand_32: default_operand_32,
            address_32: default_address_32,
            repne: false,
            repe: false,
            lock: false,
            bytes_consumed: 0,
        }
    }
}

/// Walks prefix bytes starting at `bytes[0]`, returning the parsed
/// [`Prefixes`] and the opcode byte that terminated the chain (already
/// consumed out of `bytes_consumed`).
///
/// `default_operand_32`/`default_address_32` are the block's `use32`-derived
/// defaults (flat 32-bit code segment vs. 16-bit).
pub fn walk(bytes: &[u8], default_operand_32: bool, default_address_32: bool) -> (Prefixes, u8) {
    let mut prefixes = Prefixes::new(default_operand_32, default_address_32);
    let mut i = 0usize;

    loop {
        let b = bytes[i];
        i += 1;
        match b {
            0x0f => {
                prefixes.map = OpcodeMap::TwoByte;
                prefixes.bytes_consumed = i as u32;
                return (prefixes, bytes[i]);
            }
            0x26 => sreg(&mut prefixes, SegmentId::Es),
            0x2e => sreg(&mut prefixes, SegmentId::Cs),
            0x36 => sreg(&mut prefixes, SegmentId::Ss),
            0x3e => sreg(&mut prefixes, SegmentId::Ds),
            0x64 => sreg(&mut prefixes, SegmentId::Fs),
            0x65 => sreg(&mut prefixes, SegmentId::Gs),
            0x66 => prefixes.operand_32 = !default_operand_32,
            0x67 => prefixes.address_32 = !default_address_32,
            0xd8..=0xdf => {
                prefixes.map = OpcodeMap::FpuEscape(b);
                prefixes.bytes_consumed = i as u32;
                return (prefixes, bytes[i]);
            }
            0xf0 => prefixes.lock = true,
            0xf2 => prefixes.repne = true,
            0xf3 => prefixes.repe = true,
            _ => {
                prefixes.bytes_consumed = (i - 1) as u32;
                return (prefixes, b);
            }
        }
    }
}

fn sreg(prefixes: &mut Prefixes, seg: SegmentId) {
    prefixes.segment_override = Some(seg);
    prefixes.has_segment_override = true;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_prefix_returns_opcode_directly() {
        let (p, op) = walk(&[0x90], false, false);
        assert_eq!(op, 0x90);
        assert_eq!(p.bytes_consumed, 0);
        assert_eq!(p.map, OpcodeMap::OneByte);
    }

    #[test]
    fn two_byte_escape() {
        let (p, op) = walk(&[0x0f, 0xaf], false, false);
        assert_eq!(p.map, OpcodeMap::TwoByte);
        assert_eq!(op, 0xaf);
        assert_eq!(p.bytes_consumed, 1);
    }

    #[test]
    fn segment_override_then_opcode() {
        let (p, op) = walk(&[0x64, 0x8b], false, false);
        assert_eq!(p.segment_override, Some(SegmentId::Fs));
        assert!(p.has_segment_override);
        assert_eq!(op, 0x8b);
    }

    #[test]
    fn operand_size_toggle() {
        let (p, _) = walk(&[0x66, 0x90], false, false);
        assert!(p.operand_32);
    }

    #[test]
    fn fpu_escape_records_byte() {
        let (p, op) = walk(&[0xd9, 0xc0], false, false);
        assert_eq!(p.map, OpcodeMap::FpuEscape(0xd9));
        assert_eq!(op, 0xc0);
    }
}
