// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error and outcome types.
//!
//! The dynarec has three distinct error kinds (see the crate-level
//! documentation): a guest fault is not an error at all from the
//! embedder's point of view, a compile-time limit is handled internally
//! and never escapes `Codegen`, and an implementation invariant
//! violation is fatal. Only the last of the three is represented here
//! as a [`DynarecError`]; the other two have their own result types
//! ([`BlockExit`] and [`BlockEndReason`]).

use thiserror::Error;

/// Fatal implementation-invariant violations.
///
/// These indicate a bug in the dynarec itself, not in the guest program
/// being translated. An embedding emulator should treat these as
/// unrecoverable; in debug builds they are additionally checked by
/// `debug_assert!` at the point of the violation so the panic message
/// below is a last-resort backstop, not the primary detection path.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DynarecError {
    #[error("register version refcount underflow for {0:?}")]
    RefcountUnderflow(crate::reg::RegId),

    #[error("unknown native size for register {0:?}")]
    UnknownNativeSize(crate::reg::RegId),

    #[error("host register bank exhausted allocating for {0:?}")]
    HostRegisterExhausted(crate::reg::RegId),

    #[error("no backend handler registered for micro-op {0:?}")]
    MissingHandler(crate::ir::UopOp),

    #[error("jump target uop index {0} is out of range for the IR buffer")]
    InvalidJumpTarget(usize),

    #[error("code cache exhausted: no free, dirty, purgable, or evictable block slot")]
    CacheExhausted,
}

/// Raised internally when a compile-time limit is hit while building a
/// block. Never escapes [`crate::dispatcher::Codegen`]: the decoder loop
/// catches it, stops appending instructions, and finalises the block
/// normally. No partial block is ever installed in the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "ffi", repr(C))]
pub enum BlockEndReason {
    /// The per-block instruction count cap was reached.
    InstructionCountCap,
    /// The IR buffer ran out of micro-op slots.
    UopBufferFull,
    /// A register id's version counter or a version's refcount is about
    /// to exceed its cap; emitting the next write would risk wraparound
    /// of the narrow fields that store them.
    RegisterLimit,
    /// An IR emitter decided the instruction must end the block (e.g. an
    /// unconditional jump, or a call into the interpreter whose return
    /// value must be checked before continuing).
    EmitterRequested,
}

/// The reason a compiled block's execution returned control to the
/// dispatcher.
///
/// This is the Rust-native replacement for the original's `longjmp` out
/// of compiled code: the backend's entry point returns this discriminant
/// instead of jumping out of the stack frame (see the "Exception control
/// flow" design note).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "ffi", repr(C, u8))]
pub enum BlockExit {
    /// The block ran to completion and exited through its normal tail
    /// jump to the dispatcher loop. Guest PC and all shared CPU state are
    /// up to date.
    Normal,
    /// A guest exception was raised (`CMP_IMM_JZ` into a shared fault
    /// routine, a failed segment check, a page fault signalled by the
    /// embedder's memory trait). Carries the exception vector.
    Fault(u8),
    /// An interpreted-instruction call returned a non-zero status, which
    /// must terminate the block per `CALL_INSTRUCTION_FUNC`'s contract.
    InterpreterRequestedExit(u32),
    /// The per-block cycle budget was exhausted; the dispatcher should
    /// schedule other work before re-entering.
    CyclesExhausted,
    /// A `CALL_INSTRUCTION_FUNC` uop was emitted for an opcode with no
    /// registered interpreter fallback. Carries the opcode byte that had
    /// no handler.
    UnhandledOpcode(u8),
}
