// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The guest-memory trait implemented by the embedding emulator, and the
//! interpreter-fallback function pointer type.

use crate::cpu_state::CpuState;

/// Result of a guest memory access that may page-fault. `Err(vector)`
/// triggers the fault path the same way a failed segment check does:
/// the caller is expected to route it into `BlockExit::Fault`.
pub type MemResult<T> = Result<T, u8>;

/// The trait implemented by the embedding emulator's memory system.
///
/// Little-endian, unlike the teacher's big-endian 68000 bus, since x86 is
/// little-endian throughout; otherwise the shape (per-width get/set with
/// a default multi-byte composition) mirrors [the teacher's
/// `MemoryAccess`](../../m68000/src/memory_access.rs) directly.
pub trait GuestMemory {
    fn read_u8(&mut self, phys: u32) -> MemResult<u8>;
    fn read_u16(&mut self, phys: u32) -> MemResult<u16>;
    fn read_u32(&mut self, phys: u32) -> MemResult<u32> {
        let lo = self.read_u16(phys)? as u32;
        let hi = self.read_u16(phys.wrapping_add(2))? as u32;
        Ok(lo | (hi << 16))
    }
    fn read_u64(&mut self, phys: u32) -> MemResult<u64> {
        let lo = self.read_u32(phys)? as u64;
        let hi = self.read_u32(phys.wrapping_add(4))? as u64;
        Ok(lo | (hi << 32))
    }

    fn write_u8(&mut self, phys: u32, value: u8) -> MemResult<()>;
    fn write_u16(&mut self, phys: u32, value: u16) -> MemResult<()>;
    fn write_u32(&mut self, phys: u32, value: u32) -> MemResult<()> {
        self.write_u16(phys, value as u16)?;
        self.write_u16(phys.wrapping_add(2), (value >> 16) as u16)
    }
    fn write_u64(&mut self, phys: u32, value: u64) -> MemResult<()> {
        self.write_u32(phys, value as u32)?;
        self.write_u32(phys.wrapping_add(4), (value >> 32) as u32)
    }

    /// Reads a raw instruction byte straight from the guest's code
    /// segment during decode, without going through the SMC dirty-mask
    /// path (decode is a read, not a write).
    fn fetch_u8(&mut self, linear: u32) -> u8;

    fn fetch_u32(&mut self, linear: u32) -> u32 {
        u32::from_le_bytes([
            self.fetch_u8(linear),
            self.fetch_u8(linear.wrapping_add(1)),
            self.fetch_u8(linear.wrapping_add(2)),
            self.fetch_u8(linear.wrapping_add(3)),
        ])
    }
}

/// An interpreted-instruction handler: decodes and executes exactly one
/// guest instruction starting at `cpu.eip`, advancing it, and returning
/// the same exit-shaped status `CALL_INSTRUCTION_FUNC` expects: zero to
/// continue, non-zero to end the block.
///
/// Every opcode the recompiler does not emit IR for falls back to this;
/// per the non-goal "full x86 ISA semantics in the recompiler", this is
/// the normal path, never an error path.
pub type InterpreterFallback = fn(cpu: &mut CpuState, mem: &mut dyn GuestMemory) -> u32;
