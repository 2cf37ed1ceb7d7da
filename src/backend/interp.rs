// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The one concrete [`HostBackend`]: rather than emit real machine code
//! for a specific target (explicitly out of scope, see the
//! "cross-platform host code generation" non-goal), this backend treats
//! the optimised [`IrBuffer`] itself as the "compiled" artifact and
//! interprets it directly at block-execution time.
//!
//! `compile()`'s walk over the IR still runs in full: [`InterpBackend`]
//! uses it only to check that every surviving micro-op has a handler
//! (the real backend's equivalent of "emit an instruction for it"),
//! raising [`DynarecError::MissingHandler`] the same way an
//! unimplementable opcode would in a real backend. The actual execution
//! happens later, in [`execute_block`], against a live [`CpuState`] and
//! [`GuestMemory`].

use std::collections::HashMap;
use std::mem::transmute;

use super::{HostBackend, PatchPoint};
use crate::cpu_state::CpuState;
use crate::error::{BlockExit, DynarecError};
use crate::ir::{IrBuffer, IrReg, Uop, UopOp};
use crate::memory::{GuestMemory, InterpreterFallback};
use crate::reg::{Domain, RegId};

/// Stateless: this backend never buffers host bytes, so `prologue`,
/// `epilogue`, `flush`, and jump patching are no-ops for it. It exists
/// to satisfy the trait and to gate unimplementable opcodes at compile
/// time rather than only discovering them at execution time.
#[derive(Default)]
pub struct InterpBackend {
    next_patch_point: usize,
}

impl HostBackend for InterpBackend {
    fn prologue(&mut self) {}
    fn epilogue(&mut self) {}

    fn flush(&mut self, _writebacks: &[(Domain, u8, IrReg)], _invalidate: bool) {}

    fn supports_immediate_store(&self) -> bool {
        true
    }

    fn reserve_patch_point(&mut self) -> PatchPoint {
        self.next_patch_point += 1;
        self.next_patch_point
    }

    fn set_jump_dest(&mut self, _point: PatchPoint) {}

    fn emit(&mut self, ir: &IrBuffer, uop_idx: usize) -> Result<(), DynarecError> {
        let op = ir.get(uop_idx).op;
        if HANDLED.contains(&op) {
            Ok(())
        } else {
            Err(DynarecError::MissingHandler(op))
        }
    }
}

/// Every [`UopOp`] this backend's [`execute_block`] knows how to
/// interpret. Anything outside this set fails `compile()` up front
/// rather than at execution time.
const HANDLED: &[UopOp] = &[
    UopOp::Mov,
    UopOp::MovImm,
    UopOp::Movzx,
    UopOp::Movsx,
    UopOp::Add,
    UopOp::AddImm,
    UopOp::AddLshift,
    UopOp::And,
    UopOp::AndImm,
    UopOp::Or,
    UopOp::OrImm,
    UopOp::Sub,
    UopOp::SubImm,
    UopOp::Xor,
    UopOp::XorImm,
    UopOp::Sar,
    UopOp::SarImm,
    UopOp::Shl,
    UopOp::ShlImm,
    UopOp::Shr,
    UopOp::ShrImm,
    UopOp::MemLoadAbs,
    UopOp::MemStoreAbs,
    UopOp::MemStoreImm8,
    UopOp::MemStoreImm16,
    UopOp::MemStoreImm32,
    UopOp::Jmp,
    UopOp::JmpDest,
    UopOp::NopBarrier,
    UopOp::CmpImmJzAbs,
    UopOp::CmpJzDest,
    UopOp::CmpJnzDest,
    UopOp::CallInstructionFunc,
];

/// Per-version value store for one execution: every `IrReg` a live uop
/// references maps to its 64-bit value (narrowed/widened by the uop's
/// handler as appropriate for the destination's native size).
type ValueMap = HashMap<IrReg, u64>;

fn read_src(values: &ValueMap, uop: &Uop, i: usize) -> u64 {
    uop.src[i].map(|r| values.get(&r).copied().unwrap_or(0)).unwrap_or(0)
}

/// Bit width of `uop`'s first source, for `MOVZX`/`MOVSX`'s width-aware
/// extension. A source-less uop never reaches these ops, so 32 is just a
/// harmless default.
fn src_bits(uop: &Uop) -> u32 {
    uop.src[0].map_or(32, |s| s.id.attrs().size.bytes() * 8)
}

fn mask_for(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

fn record(values: &mut ValueMap, latest: &mut HashMap<RegId, IrReg>, dest: Option<IrReg>, value: u64) {
    if let Some(reg) = dest {
        values.insert(reg, value);
        latest.insert(reg.id, reg);
    }
}

/// Writes every permanent register's last-known value back into `cpu`'s
/// visible fields. Volatile registers (temporaries, the EA scratch pair)
/// never leave the block and are dropped along with `values`.
fn write_back_permanent(values: &ValueMap, latest: &HashMap<RegId, IrReg>, cpu: &mut CpuState) {
    for (&id, &reg) in latest {
        if !id.is_permanent() {
            continue;
        }
        let value = values.get(&reg).copied().unwrap_or(0);
        match id {
            RegId::Eax => cpu.gpr[0] = value as u32,
            RegId::Ecx => cpu.gpr[1] = value as u32,
            RegId::Edx => cpu.gpr[2] = value as u32,
            RegId::Ebx => cpu.gpr[3] = value as u32,
            RegId::Esp => cpu.gpr[4] = value as u32,
            RegId::Ebp => cpu.gpr[5] = value as u32,
            RegId::Esi => cpu.gpr[6] = value as u32,
            RegId::Edi => cpu.gpr[7] = value as u32,
            RegId::Pc => cpu.eip = value as u32,
            RegId::Eflags => cpu.eflags = value as u32,
            _ => {}
        }
    }
}

/// Interprets `ir` (already optimised: dead micro-ops carry
/// `invalid = true` and are skipped) against `cpu`/`mem`, starting at
/// micro-op 0 and following in-block jumps by index. Permanent
/// registers are written back to `cpu` once, on exit, rather than after
/// every barrier: nothing outside this function observes the block
/// mid-flight.
pub fn execute_block(ir: &IrBuffer, cpu: &mut CpuState, mem: &mut dyn GuestMemory) -> BlockExit {
    let mut values = ValueMap::new();
    let mut latest: HashMap<RegId, IrReg> = HashMap::new();
    let mut ip = 0usize;

    let exit = 'run: loop {
        if ip >= ir.len() {
            break 'run BlockExit::Normal;
        }

        let uop = ir.get(ip);
        if uop.invalid {
            ip += 1;
            continue;
        }

        match uop.op {
            UopOp::Mov => {
                let v = read_src(&values, uop, 0);
                record(&mut values, &mut latest, uop.dest, v);
            }
            UopOp::Movzx => {
                let bits = src_bits(uop);
                let v = read_src(&values, uop, 0) & mask_for(bits);
                record(&mut values, &mut latest, uop.dest, v);
            }
            UopOp::Movsx => {
                let bits = src_bits(uop);
                let shift = 64 - bits;
                let v = (((read_src(&values, uop, 0) << shift) as i64) >> shift) as u64;
                record(&mut values, &mut latest, uop.dest, v);
            }
            UopOp::MovImm => record(&mut values, &mut latest, uop.dest, uop.imm as u64),
            UopOp::Add => {
                let v = read_src(&values, uop, 0).wrapping_add(read_src(&values, uop, 1));
                record(&mut values, &mut latest, uop.dest, v);
            }
            UopOp::AddImm => {
                let v = read_src(&values, uop, 0).wrapping_add(uop.imm as u64);
                record(&mut values, &mut latest, uop.dest, v);
            }
            UopOp::AddLshift => {
                let v = read_src(&values, uop, 0).wrapping_add(read_src(&values, uop, 1) << uop.imm);
                record(&mut values, &mut latest, uop.dest, v);
            }
            UopOp::And => {
                let v = read_src(&values, uop, 0) & read_src(&values, uop, 1);
                record(&mut values, &mut latest, uop.dest, v);
            }
            UopOp::AndImm => {
                let v = read_src(&values, uop, 0) & uop.imm as u64;
                record(&mut values, &mut latest, uop.dest, v);
            }
            UopOp::Or => {
                let v = read_src(&values, uop, 0) | read_src(&values, uop, 1);
                record(&mut values, &mut latest, uop.dest, v);
            }
            UopOp::OrImm => {
                let v = read_src(&values, uop, 0) | uop.imm as u64;
                record(&mut values, &mut latest, uop.dest, v);
            }
            UopOp::Sub => {
                let v = read_src(&values, uop, 0).wrapping_sub(read_src(&values, uop, 1));
                record(&mut values, &mut latest, uop.dest, v);
            }
            UopOp::SubImm => {
                let v = read_src(&values, uop, 0).wrapping_sub(uop.imm as u64);
                record(&mut values, &mut latest, uop.dest, v);
            }
            UopOp::Xor => {
                let v = read_src(&values, uop, 0) ^ read_src(&values, uop, 1);
                record(&mut values, &mut latest, uop.dest, v);
            }
            UopOp::XorImm => {
                let v = read_src(&values, uop, 0) ^ uop.imm as u64;
                record(&mut values, &mut latest, uop.dest, v);
            }
            UopOp::Sar => {
                let v = ((read_src(&values, uop, 0) as i64) >> read_src(&values, uop, 1)) as u64;
                record(&mut values, &mut latest, uop.dest, v);
            }
            UopOp::SarImm => {
                let v = ((read_src(&values, uop, 0) as i64) >> uop.imm) as u64;
                record(&mut values, &mut latest, uop.dest, v);
            }
            UopOp::Shl => {
                let v = read_src(&values, uop, 0) << read_src(&values, uop, 1);
                record(&mut values, &mut latest, uop.dest, v);
            }
            UopOp::ShlImm => {
                let v = read_src(&values, uop, 0) << uop.imm;
                record(&mut values, &mut latest, uop.dest, v);
            }
            UopOp::Shr => {
                let v = read_src(&values, uop, 0) >> read_src(&values, uop, 1);
                record(&mut values, &mut latest, uop.dest, v);
            }
            UopOp::ShrImm => {
                let v = read_src(&values, uop, 0) >> uop.imm;
                record(&mut values, &mut latest, uop.dest, v);
            }

            UopOp::MemLoadAbs => match mem.read_u32(uop.ptr as u32) {
                Ok(v) => record(&mut values, &mut latest, uop.dest, v as u64),
                Err(vector) => break 'run BlockExit::Fault(vector),
            },
            UopOp::MemStoreAbs => {
                let v = read_src(&values, uop, 0) as u32;
                if let Err(vector) = mem.write_u32(uop.ptr as u32, v) {
                    break 'run BlockExit::Fault(vector);
                }
            }
            UopOp::MemStoreImm8 => {
                if let Err(vector) = mem.write_u8(uop.ptr as u32, uop.imm as u8) {
                    break 'run BlockExit::Fault(vector);
                }
            }
            UopOp::MemStoreImm16 => {
                if let Err(vector) = mem.write_u16(uop.ptr as u32, uop.imm as u16) {
                    break 'run BlockExit::Fault(vector);
                }
            }
            UopOp::MemStoreImm32 => {
                if let Err(vector) = mem.write_u32(uop.ptr as u32, uop.imm) {
                    break 'run BlockExit::Fault(vector);
                }
            }

            UopOp::Jmp => break 'run BlockExit::Normal,
            UopOp::JmpDest => {
                ip = uop.jump_dest.expect("JMP_DEST must be resolved before execution");
                continue 'run;
            }
            UopOp::NopBarrier => {}
            UopOp::CmpImmJzAbs => {
                if read_src(&values, uop, 0) == uop.imm as u64 {
                    break 'run BlockExit::Fault(uop.ptr as u8);
                }
            }
            UopOp::CmpJzDest | UopOp::CmpJnzDest => {
                let equal = read_src(&values, uop, 0) == read_src(&values, uop, 1);
                let taken = if uop.op == UopOp::CmpJzDest { equal } else { !equal };
                if taken {
                    ip = uop.jump_dest.expect("*_DEST jump must be resolved before execution");
                    continue 'run;
                }
            }
            UopOp::CallInstructionFunc => {
                if uop.ptr == 0 {
                    break 'run BlockExit::UnhandledOpcode(uop.imm as u8);
                }
                // SAFETY: `ptr` is only ever nonzero here because the
                // decoder stored it by casting a real `InterpreterFallback`
                // fn pointer; the zero sentinel above is the only other
                // value it ever writes.
                let f: InterpreterFallback = unsafe { transmute(uop.ptr) };
                let status = f(cpu, mem);
                if status != 0 {
                    break 'run BlockExit::InterpreterRequestedExit(status);
                }
            }
            _ => unreachable!("compile() rejects any op outside HANDLED"),
        }

        ip += 1;
    };

    write_back_permanent(&values, &latest, cpu);
    exit
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regfile::RegFile;

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
            self.bytes[linear as usize]
        }
    }

    fn flat_memory(size: usize) -> FlatMemory {
        FlatMemory { bytes: vec![0u8; size] }
    }

    #[test]
    fn mov_add_store_scenario() {
        // MOV EAX, 1; ADD EAX, 2; MOV [0x1000], EAX
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

        let mut mem = flat_memory(0x2000);
        let mut cpu = CpuState::new();
        let exit = execute_block(&ir, &mut cpu, &mut mem);
        assert_eq!(exit, BlockExit::Normal);
        assert_eq!(mem.read_u32(0x1000).unwrap(), 3);
        assert_eq!(cpu.gpr[0], 3);
    }

    /// Builds `MOV TEMP0, 0; MOV EAX, eax_init; CMP_JZ_DEST(EAX, TEMP0) ->
    /// end; ADD EAX, 10`, i.e. "skip the increment if EAX started at 0".
    fn build_conditional_skip(eax_init: u32) -> (IrBuffer, RegFile) {
        let mut ir = IrBuffer::new();
        let mut regs = RegFile::new();

        let zero_idx = ir.push(UopOp::MovImm, 0).unwrap();
        ir.get_mut(zero_idx).imm = 0;
        ir.get_mut(zero_idx).dest = Some(regs.write(RegId::Temp0, zero_idx).unwrap());
        let zero_reg = regs.read(RegId::Temp0);

        let mov_idx = ir.push(UopOp::MovImm, 0).unwrap();
        ir.get_mut(mov_idx).imm = eax_init;
        ir.get_mut(mov_idx).dest = Some(regs.write(RegId::Eax, mov_idx).unwrap());
        let eax_reg = regs.read(RegId::Eax);

        let cmp_idx = ir.push(UopOp::CmpJzDest, 1).unwrap();
        ir.get_mut(cmp_idx).src[0] = Some(eax_reg);
        ir.get_mut(cmp_idx).src[1] = Some(zero_reg);

        let eax_for_add = regs.read(RegId::Eax);
        let add_idx = ir.push(UopOp::AddImm, 2).unwrap();
        ir.get_mut(add_idx).src[0] = Some(eax_for_add);
        ir.get_mut(add_idx).imm = 10;
        ir.get_mut(add_idx).dest = Some(regs.write(RegId::Eax, add_idx).unwrap());

        // The buffer ends right after the ADD: linking to its length
        // (4) marks this an end-of-block jump, which `execute_block`
        // treats identically to any other index past the last uop.
        ir.link_jump_to_target(cmp_idx, ir.len());

        (ir, regs)
    }

    #[test]
    fn conditional_skip_not_taken_runs_the_increment() {
        let (ir, _regs) = build_conditional_skip(5);
        let mut mem = flat_memory(16);
        let mut cpu = CpuState::new();
        let exit = execute_block(&ir, &mut cpu, &mut mem);
        assert_eq!(exit, BlockExit::Normal);
        assert_eq!(cpu.gpr[0], 15);
    }

    #[test]
    fn conditional_skip_taken_bypasses_the_increment() {
        let (ir, _regs) = build_conditional_skip(0);
        let mut mem = flat_memory(16);
        let mut cpu = CpuState::new();
        let exit = execute_block(&ir, &mut cpu, &mut mem);
        assert_eq!(exit, BlockExit::Normal);
        assert_eq!(cpu.gpr[0], 0);
    }

    #[test]
    fn call_instruction_func_propagates_nonzero_status() {
        fn fallback(cpu: &mut CpuState, _mem: &mut dyn GuestMemory) -> u32 {
            cpu.eip += 1;
            1
        }

        let mut ir = IrBuffer::new();
        let idx = ir.push(UopOp::CallInstructionFunc, 0).unwrap();
        ir.get_mut(idx).ptr = fallback as usize;

        let mut mem = flat_memory(1);
        let mut cpu = CpuState::new();
        let exit = execute_block(&ir, &mut cpu, &mut mem);
        assert_eq!(exit, BlockExit::InterpreterRequestedExit(1));
        assert_eq!(cpu.eip, 1);
    }

    #[test]
    fn call_instruction_func_with_no_fallback_reports_the_opcode_instead_of_crashing() {
        let mut ir = IrBuffer::new();
        let idx = ir.push(UopOp::CallInstructionFunc, 0).unwrap();
        ir.get_mut(idx).ptr = 0;
        ir.get_mut(idx).imm = 0xf4;

        let mut mem = flat_memory(1);
        let mut cpu = CpuState::new();
        let exit = execute_block(&ir, &mut cpu, &mut mem);
        assert_eq!(exit, BlockExit::UnhandledOpcode(0xf4));
    }

    #[test]
    fn movzx_byte_clears_the_upper_bits() {
        let mut ir = IrBuffer::new();
        let mut regs = RegFile::new();

        // TAG0 is the crate's only modelled byte-sized (ByteLow) register;
        // it stands in for AL here purely for its size attribute.
        let src_idx = ir.push(UopOp::MovImm, 0).unwrap();
        ir.get_mut(src_idx).imm = 0xff;
        ir.get_mut(src_idx).dest = Some(regs.write(RegId::Tag0, src_idx).unwrap());
        let byte_reg = regs.read(RegId::Tag0);

        let movzx_idx = ir.push(UopOp::Movzx, 1).unwrap();
        ir.get_mut(movzx_idx).src[0] = Some(byte_reg);
        ir.get_mut(movzx_idx).dest = Some(regs.write(RegId::Eax, movzx_idx).unwrap());

        let mut mem = flat_memory(1);
        let mut cpu = CpuState::new();
        execute_block(&ir, &mut cpu, &mut mem);
        assert_eq!(cpu.gpr[0], 0xff);
    }

    #[test]
    fn movsx_byte_sign_extends_a_negative_value() {
        let mut ir = IrBuffer::new();
        let mut regs = RegFile::new();

        let src_idx = ir.push(UopOp::MovImm, 0).unwrap();
        ir.get_mut(src_idx).imm = 0xff;
        ir.get_mut(src_idx).dest = Some(regs.write(RegId::Tag0, src_idx).unwrap());
        let byte_reg = regs.read(RegId::Tag0);

        let movsx_idx = ir.push(UopOp::Movsx, 1).unwrap();
        ir.get_mut(movsx_idx).src[0] = Some(byte_reg);
        ir.get_mut(movsx_idx).dest = Some(regs.write(RegId::Eax, movsx_idx).unwrap());

        let mut mem = flat_memory(1);
        let mut cpu = CpuState::new();
        execute_block(&ir, &mut cpu, &mut mem);
        assert_eq!(cpu.gpr[0], 0xffff_ffff);
    }
}
