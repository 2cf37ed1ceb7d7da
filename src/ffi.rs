// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! C interface, enabled by the `ffi` feature.
//!
//! The functions and structures defined here should not be used from a
//! Rust program; reach for [`crate::Codegen`] and [`crate::CpuState`]
//! directly instead. This module exists so a C emulator core can drive
//! the translator without linking against its Rust types: allocate a
//! core with [`x86dynarec_new`], drive guest memory through a
//! [`x86dynarec_callbacks_t`] filled in with your own read/write
//! functions, and execute compiled blocks with [`x86dynarec_execute`].
//!
//! Recompilation itself is not exposed here: [`crate::decoder::Decoder`]
//! takes a Rust closure for the interpreter-fallback lookup and a
//! [`crate::timing::TimingProvider`] trait object, neither of which has
//! a natural C representation. A C embedder is expected to drive
//! recompilation from a small Rust shim linked into the same binary,
//! the same way the original `codegen_generate_call` callback loop was
//! always compiled together with the core it served.

use std::ffi::c_void;
use std::os::raw::c_char;

use crate::cpu_state::CpuStatus;
use crate::dispatcher::Codegen;
use crate::error::BlockExit;
use crate::limits::INVALID_BLOCK_INDEX;
use crate::memory::{GuestMemory, MemResult};
use crate::CpuState;

/// Memory callbacks handed to [`x86dynarec_execute`]. `user_data` is
/// passed back unchanged to every callback; an embedder typically points
/// it at its own guest-memory state.
#[allow(non_camel_case_types)]
#[repr(C)]
pub struct x86dynarec_callbacks_t {
    pub read_u8: extern "C" fn(phys: u32, user_data: *mut c_void) -> u8,
    pub read_u16: extern "C" fn(phys: u32, user_data: *mut c_void) -> u16,
    pub write_u8: extern "C" fn(phys: u32, value: u8, user_data: *mut c_void),
    pub write_u16: extern "C" fn(phys: u32, value: u16, user_data: *mut c_void),
    pub fetch_u8: extern "C" fn(linear: u32, user_data: *mut c_void) -> u8,
    pub user_data: *mut c_void,
}

impl GuestMemory for x86dynarec_callbacks_t {
    fn read_u8(&mut self, phys: u32) -> MemResult<u8> {
        Ok((self.read_u8)(phys, self.user_data))
    }

    fn read_u16(&mut self, phys: u32) -> MemResult<u16> {
        Ok((self.read_u16)(phys, self.user_data))
    }

    fn write_u8(&mut self, phys: u32, value: u8) -> MemResult<()> {
        (self.write_u8)(phys, value, self.user_data);
        Ok(())
    }

    fn write_u16(&mut self, phys: u32, value: u16) -> MemResult<()> {
        (self.write_u16)(phys, value, self.user_data);
        Ok(())
    }

    fn fetch_u8(&mut self, linear: u32) -> u8 {
        (self.fetch_u8)(linear, self.user_data)
    }
}

/// Allocates a new translator core. Free it with [`x86dynarec_delete`].
#[no_mangle]
pub extern "C" fn x86dynarec_new() -> *mut Codegen {
    Box::into_raw(Box::new(Codegen::new()))
}

/// # Safety
/// `core` must be a pointer returned by [`x86dynarec_new`] and not yet
/// freed.
#[no_mangle]
pub unsafe extern "C" fn x86dynarec_delete(core: *mut Codegen) {
    if !core.is_null() {
        drop(Box::from_raw(core));
    }
}

/// Drops every cached block and per-page bookkeeping, as if the guest
/// had just reset.
///
/// # Safety
/// `core` must be a valid, non-null pointer from [`x86dynarec_new`].
#[no_mangle]
pub unsafe extern "C" fn x86dynarec_reset(core: *mut Codegen) {
    (*core).reset();
}

/// Allocates a zeroed [`CpuState`]. Free it with [`x86dynarec_cpu_delete`].
#[no_mangle]
pub extern "C" fn x86dynarec_cpu_new() -> *mut CpuState {
    Box::into_raw(Box::new(CpuState::new()))
}

/// # Safety
/// `cpu` must be a pointer returned by [`x86dynarec_cpu_new`] and not
/// yet freed.
#[no_mangle]
pub unsafe extern "C" fn x86dynarec_cpu_delete(cpu: *mut CpuState) {
    if !cpu.is_null() {
        drop(Box::from_raw(cpu));
    }
}

/// Looks up (or lazily allocates, passing `current = u16::MAX` if none
/// of the caller's own slots must be protected from eviction) a block
/// slot for `phys`/`pc`/`status`. Returns `u16::MAX` on allocation
/// failure ([`crate::error::DynarecError::CacheExhausted`]).
///
/// # Safety
/// `core` must be a valid, non-null pointer from [`x86dynarec_new`].
#[no_mangle]
pub unsafe extern "C" fn x86dynarec_block_init(
    core: *mut Codegen,
    phys: u32,
    pc: u32,
    status_bits: u16,
    current: u16,
) -> u16 {
    let status = CpuStatus::from_bits_truncate(status_bits);
    (*core).block_init(phys, pc, status, current).unwrap_or(INVALID_BLOCK_INDEX)
}

/// Executes the compiled block at slot `idx` and returns its exit
/// reason, encoded as a small tagged struct since `enum BlockExit` is
/// not itself `repr(C)`-friendly for fields carrying payloads across an
/// FFI boundary without one.
#[allow(non_camel_case_types)]
#[repr(C)]
pub struct x86dynarec_exit_t {
    /// 0 = Normal, 1 = Fault, 2 = InterpreterRequestedExit, 3 =
    /// CyclesExhausted, 4 = UnhandledOpcode.
    pub tag: u8,
    /// Fault vector for tag 1, interpreter status for tag 2, the
    /// unhandled opcode byte for tag 4, unused otherwise.
    pub value: u32,
}

impl From<BlockExit> for x86dynarec_exit_t {
    fn from(exit: BlockExit) -> Self {
        match exit {
            BlockExit::Normal => x86dynarec_exit_t { tag: 0, value: 0 },
            BlockExit::Fault(vector) => x86dynarec_exit_t { tag: 1, value: vector as u32 },
            BlockExit::InterpreterRequestedExit(status) => x86dynarec_exit_t { tag: 2, value: status },
            BlockExit::CyclesExhausted => x86dynarec_exit_t { tag: 3, value: 0 },
            BlockExit::UnhandledOpcode(opcode) => x86dynarec_exit_t { tag: 4, value: opcode as u32 },
        }
    }
}

/// # Safety
/// `core` and `cpu` must be valid, non-null pointers from
/// [`x86dynarec_new`] and [`x86dynarec_cpu_new`] respectively; `mem`
/// must have every function pointer populated.
#[no_mangle]
pub unsafe extern "C" fn x86dynarec_execute(
    core: *const Codegen,
    idx: u16,
    cpu: *mut CpuState,
    mem: *mut x86dynarec_callbacks_t,
) -> x86dynarec_exit_t {
    (*core).execute(idx, &mut *cpu, &mut *mem).into()
}

/// Guest-memory write hook: call on every write that might alias
/// compiled code, so self-modified blocks are retired before their next
/// execution.
///
/// # Safety
/// `core` must be a valid, non-null pointer from [`x86dynarec_new`].
#[no_mangle]
pub unsafe extern "C" fn x86dynarec_mark_write(core: *mut Codegen, phys: u32, len: u32) {
    (*core).mark_write(phys, len);
}

/// Returns the crate version as a NUL-terminated string, owned by the
/// caller; free it with [`x86dynarec_string_free`].
#[no_mangle]
pub extern "C" fn x86dynarec_version() -> *mut c_char {
    std::ffi::CString::new(env!("CARGO_PKG_VERSION")).unwrap().into_raw()
}

/// # Safety
/// `s` must be a pointer returned by [`x86dynarec_version`] and not yet
/// freed.
#[no_mangle]
pub unsafe extern "C" fn x86dynarec_string_free(s: *mut c_char) {
    if !s.is_null() {
        drop(std::ffi::CString::from_raw(s));
    }
}
