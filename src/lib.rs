// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A dynamic binary translator core for a recompiling x86 emulator.
//!
//! Pipeline, front to back:
//!
//! 1. [`decoder`] walks guest bytes into an SSA micro-op [`ir::IrBuffer`],
//!    tracking register lifetime through [`regfile::RegFile`].
//! 2. [`optimizer`] unrolls bounded backward branches and eliminates dead
//!    micro-ops.
//! 3. [`backend`] exposes the abstract [`backend::HostBackend`] contract
//!    a real machine-code emitter would implement; [`backend::interp`]
//!    is the one concrete backend this crate ships.
//! 4. [`cache`] owns the fixed-size pool of compiled blocks, indexed by
//!    physical address and guest PC, with [`smc`] invalidating entries
//!    when guest code is overwritten.
//! 5. [`dispatcher::Codegen`] is the embedder-facing façade tying all of
//!    the above together.
//!
//! Three distinct error conditions run through the crate, each with its
//! own type rather than overloading one: a guest fault
//! ([`error::BlockExit::Fault`]), a compile-time limit that silently
//! ends a block early ([`error::BlockEndReason`]), and an implementation
//! invariant violation ([`error::DynarecError`]), the only one of the
//! three an embedder should ever treat as a bug in this crate.
//!
//! ## FFI
//!
//! By enabling the `ffi` feature, [`reg::RegSize`], [`reg::Domain`],
//! [`reg::LifetimeClass`], [`cpu_state::SegmentId`],
//! [`cpu_state::SegmentDescriptor`], [`cpu_state::RuntimeRoutines`],
//! [`cpu_state::CpuState`], [`error::BlockEndReason`] and
//! [`error::BlockExit`] are made `repr(C)`, and [`ffi`] is compiled in:
//! a small C interface an embedding emulator written in C can link
//! against directly, the way the original C emulator this core replaces
//! would.

pub mod backend;
pub mod cache;
pub mod cpu_state;
pub mod decoder;
pub mod dispatcher;
pub mod error;
#[cfg(feature = "ffi")]
pub mod ffi;
pub mod ir;
pub mod limits;
pub mod memory;
pub mod optimizer;
pub mod reg;
pub mod regfile;
pub mod smc;
pub mod timing;

pub use cpu_state::CpuState;
pub use dispatcher::Codegen;
pub use error::{BlockEndReason, BlockExit, DynarecError};
pub use memory::{GuestMemory, InterpreterFallback, MemResult};
