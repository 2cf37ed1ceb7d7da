// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Named numeric caps used throughout the dynarec.
//!
//! Keeping these in one place avoids the magic numbers scattered through
//! the original C sources (`codegen.h`, `codegen_reg.h`) and gives the
//! tests a single place to shrink caps for faster exhaustive coverage.

/// Maximum number of micro-ops in one block's IR buffer.
pub const MAX_UOPS_PER_BLOCK: usize = 4096;

/// Maximum number of guest instructions compiled into a single block.
pub const MAX_INSTRUCTIONS_PER_BLOCK: usize = 50;

/// Maximum number of SSA versions a single register id may accumulate
/// within one block before `CPU_BLOCK_END()` is forced.
pub const REG_VERSION_MAX: u16 = 250;

/// Maximum number of pending reads (refcount) a single register version
/// may accumulate before `CPU_BLOCK_END()` is forced.
pub const REG_REFCOUNT_MAX: u32 = 250;

/// Unroller: the unrolled body must fit within this many micro-ops.
pub const UNROLL_MAX_UOPS: usize = 1000;

/// Unroller: no single register version may be referenced more than this
/// many times across the unrolled body.
pub const UNROLL_MAX_REFS: u32 = 200;

/// Unroller: never unroll more than this many iterations.
pub const UNROLL_MAX_COUNT: u32 = 10;

/// Number of compiled-block slots in the fixed-capacity code cache.
pub const BLOCK_POOL_SIZE: usize = 16384;

/// Bound on the dirty-list (recently invalidated blocks retained for
/// lookup continuity).
pub const DIRTY_LIST_MAX: usize = 64;

/// Mask applied to the physical address to index the direct-mapped hash.
/// `HASH(phys) = (phys >> 2) & HASH_MASK`.
pub const HASH_MASK: u32 = (BLOCK_POOL_SIZE as u32) - 1;

/// Size in bytes of one guest physical page.
pub const PAGE_SIZE: u32 = 4096;

/// Number of 64-byte sub-ranges a page mask covers (`PAGE_SIZE / 64`).
pub const PAGE_MASK_GRANULARITY: u32 = 64;

/// Size in bytes of the backend's scratch spill area (temp0..temp3,
/// temp0d, temp1d) reserved by `prologue`.
pub const SCRATCH_AREA_BYTES: usize = 64;

/// Sentinel `pc` value marking a free block slot.
pub const BLOCK_PC_INVALID: u32 = u32::MAX;

/// Sentinel index meaning "no block"/"end of list" in the index-based
/// intrusive linked lists (`next`/`prev`/hash chain heads).
pub const INVALID_BLOCK_INDEX: u16 = 0;

/// Capacity of the decoder's per-instruction table used for loop
/// unrolling lookups (indexed by instruction count within the block).
pub const MAX_INSTRUCTION_TABLE: usize = MAX_INSTRUCTIONS_PER_BLOCK;
