// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Benchmark for the `compile()` orchestrator and the interpreting
//! backend's execution of the result.
//!
//! Make sure the result of the benchmarked function is used,
//! whether by sending it to black_box, or to return it from the closure.

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};

use x86dynarec::backend::interp::{execute_block, InterpBackend};
use x86dynarec::backend::compile;
use x86dynarec::cpu_state::CpuState;
use x86dynarec::ir::{IrBuffer, UopOp};
use x86dynarec::memory::GuestMemory;
use x86dynarec::reg::RegId;
use x86dynarec::regfile::RegFile;

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
        *self.bytes.get(linear as usize).unwrap_or(&0)
    }
}

/// `MOV EAX, 1; ADD EAX, 2; MOV [0x1000], EAX`, built by hand the same way
/// a decoded block would arrive at the orchestrator.
fn build_mov_add_store() -> (IrBuffer, RegFile) {
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

    (ir, regs)
}

pub fn criterion_benchmark(c: &mut Criterion) {
    c.bench_function("compile", |b| {
        b.iter_batched(
            build_mov_add_store,
            |(mut ir, mut regs)| {
                let mut backend = InterpBackend::default();
                black_box(compile(&mut backend, &mut ir, &mut regs).unwrap());
            },
            criterion::BatchSize::SmallInput,
        )
    });

    c.bench_function("execute_block", |b| {
        let (ir, _regs) = build_mov_add_store();
        let setup = || (CpuState::new(), FlatMemory { bytes: vec![0u8; 0x2000] });
        b.iter_batched_ref(
            setup,
            |(cpu, mem)| {
                black_box(execute_block(black_box(&ir), cpu, mem));
            },
            criterion::BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
