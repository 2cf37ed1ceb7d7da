// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! One compiled-block slot. Fixed-size, index-addressed, and linked into
//! up to four intrusive lists at once (free/dirty, and the two
//! per-page "blocks touching this page" lists) via plain `u16` indices
//! rather than an external intrusive-list crate.

use crate::cpu_state::CpuStatus;
use crate::ir::IrBuffer;
use crate::limits::{BLOCK_PC_INVALID, INVALID_BLOCK_INDEX};

bitflags::bitflags! {
    #[derive(Default)]
    pub struct BlockFlags: u16 {
        /// This block's SMC tracking uses the byte-granularity bitmaps
        /// rather than the coarse 64-byte-region mask.
        const BYTE_MASK_MODE        = 0b0000_0001;
        const HAS_FPU               = 0b0000_0010;
        /// `TOP` was known at compile time; cleared once an FPU push/pop
        /// inside the block makes it runtime-only.
        const STATIC_TOP            = 0b0000_0100;
        const WAS_RECOMPILED        = 0b0000_1000;
        const IN_FREE_LIST          = 0b0001_0000;
        const IN_DIRTY_LIST         = 0b0010_0000;
        const HAS_SECOND_PAGE       = 0b0100_0000;
        /// Suppresses inlining constants read from guest RAM: set when
        /// the block's code lives in writable memory, so a later SMC
        /// write changing an operand must not be masked by a cached
        /// immediate baked into the compiled block.
        const NO_IMMEDIATES_FROM_CODE = 0b1000_0000;
    }
}

/// One compiled block. Slot 0 of the pool is never issued to a caller
/// (see [`crate::limits::INVALID_BLOCK_INDEX`]) so that `next`/`prev` of
/// 0 unambiguously means "end of list".
pub struct CodeBlock {
    pub pc: u32,
    pub phys: u32,
    pub phys_2: u32,

    /// Which 64-byte regions of the first/second page hold bytes of this
    /// block (coarse mode) or which individual bytes do (byte mode, see
    /// [`BlockFlags::BYTE_MASK_MODE`]).
    pub page_mask: u64,
    pub page_mask2: u64,

    pub flags: BlockFlags,
    pub ins: u32,
    pub status: CpuStatus,
    pub top: u8,

    /// The "host code" for this block: in the absence of a real
    /// machine-code backend, the optimised IR itself, ready for
    /// [`crate::backend::interp::execute_block`]. `None` for a slot that
    /// has only been `block_init`ed, not yet recompiled.
    pub compiled: Option<IrBuffer>,

    pub next: u16,
    pub prev: u16,
    pub next_2: u16,
    pub prev_2: u16,
}

impl CodeBlock {
    pub const fn empty() -> Self {
        Self {
            pc: BLOCK_PC_INVALID,
            phys: 0,
            phys_2: 0,
            page_mask: 0,
            page_mask2: 0,
            flags: BlockFlags::empty(),
            ins: 0,
            status: CpuStatus::empty(),
            top: 0,
            compiled: None,
            next: INVALID_BLOCK_INDEX,
            prev: INVALID_BLOCK_INDEX,
            next_2: INVALID_BLOCK_INDEX,
            prev_2: INVALID_BLOCK_INDEX,
        }
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        self.pc == BLOCK_PC_INVALID
    }

    #[inline]
    pub fn phys_page(&self) -> u32 {
        self.phys >> 12
    }

    #[inline]
    pub fn phys_page2(&self) -> u32 {
        self.phys_2 >> 12
    }

    /// Resets every field a fresh allocation (`block_init`) must not
    /// inherit from whichever block previously occupied this slot.
    pub fn reset_for_init(&mut self, pc: u32, phys: u32, status: CpuStatus) {
        self.pc = pc;
        self.phys = phys;
        self.phys_2 = 0;
        self.page_mask = 0;
        self.page_mask2 = 0;
        self.flags = BlockFlags::empty();
        self.ins = 0;
        self.status = status;
        self.top = 0;
        self.compiled = None;
        self.next = INVALID_BLOCK_INDEX;
        self.prev = INVALID_BLOCK_INDEX;
        self.next_2 = INVALID_BLOCK_INDEX;
        self.prev_2 = INVALID_BLOCK_INDEX;
    }
}

impl Default for CodeBlock {
    fn default() -> Self {
        Self::empty()
    }
}
