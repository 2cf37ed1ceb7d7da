// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The timing provider plug-in: a small trait standing in for the
//! original's five-function table, invoked during decode so cycle
//! accounting stays a pluggable concern separate from IR emission.
//!
//! Grounded the same way the teacher parameterises per-model timing
//! through its `CpuDetails` trait with associated constants for cycle
//! counts rather than runtime branches.

/// Supplies per-opcode and per-block cycle costs during decode.
pub trait TimingProvider {
    /// Called once before the first instruction of a block is decoded.
    fn start(&mut self);

    /// Called after a prefix byte is consumed, before the final opcode.
    fn prefix(&mut self, prefix: u8, fetchdat: u32);

    /// Called once the full opcode (and its ModR/M, if any) is known.
    fn opcode(&mut self, opcode: u8, fetchdat: u32, op_32: bool, pc: u32);

    /// Called once at the start of block compilation.
    fn block_start(&mut self);

    /// Called once after the last instruction of a block is decoded.
    fn block_end(&mut self);

    /// Cycle cost charged for a taken jump, added to the block's cycle
    /// accumulator immediately before an unconditional flush.
    fn jump_cycles(&mut self) -> i32;
}

/// A `TimingProvider` that charges one cycle per opcode and nothing
/// else: adequate for tests and for embedders that don't model timing.
#[derive(Default)]
pub struct FlatTiming;

impl TimingProvider for FlatTiming {
    fn start(&mut self) {}
    fn prefix(&mut self, _prefix: u8, _fetchdat: u32) {}
    fn opcode(&mut self, _opcode: u8, _fetchdat: u32, _op_32: bool, _pc: u32) {}
    fn block_start(&mut self) {}
    fn block_end(&mut self) {}
    fn jump_cycles(&mut self) -> i32 {
        1
    }
}
