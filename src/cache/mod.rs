// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The code cache: a fixed-size pool of [`block::CodeBlock`] slots
//! addressed by index, a direct-mapped physical-address hash, a guest-PC
//! tree for dispatch lookup, and per-page metadata. Allocation follows
//! the free-list → dirty-list → purgable-page → random cascade; deletion
//! and SMC invalidation both route through [`Self::retire_block`].

pub mod block;
pub mod page;

use std::collections::BTreeMap;
use std::collections::HashMap;

use rand::Rng;

use crate::cpu_state::CpuStatus;
use crate::error::DynarecError;
use crate::limits::{BLOCK_POOL_SIZE, DIRTY_LIST_MAX, HASH_MASK, INVALID_BLOCK_INDEX, PAGE_SIZE};
use block::{BlockFlags, CodeBlock};
use page::PageMetadata;

#[inline]
fn hash_of(phys: u32) -> usize {
    ((phys >> 2) & HASH_MASK) as usize
}

/// Owns the block pool, the hash/tree indices, and every page's SMC
/// metadata. Single-threaded: see the crate-level concurrency note.
pub struct CodeCache {
    blocks: Vec<CodeBlock>,
    free_head: u16,
    dirty_head: u16,
    dirty_tail: u16,
    dirty_len: usize,
    hash: Vec<u16>,
    pc_tree: BTreeMap<u32, u16>,
    pages: HashMap<u32, PageMetadata>,
    rng: rand::rngs::StdRng,
}

impl CodeCache {
    pub fn new() -> Self {
        use rand::SeedableRng;
        let mut blocks = Vec::with_capacity(BLOCK_POOL_SIZE);
        for _ in 0..BLOCK_POOL_SIZE {
            blocks.push(CodeBlock::empty());
        }
        let mut cache = Self {
            blocks,
            free_head: INVALID_BLOCK_INDEX,
            dirty_head: INVALID_BLOCK_INDEX,
            dirty_tail: INVALID_BLOCK_INDEX,
            dirty_len: 0,
            hash: vec![INVALID_BLOCK_INDEX; HASH_MASK as usize + 1],
            pc_tree: BTreeMap::new(),
            pages: HashMap::new(),
            rng: rand::rngs::StdRng::from_entropy(),
        };
        cache.rebuild_free_list();
        cache
    }

    fn rebuild_free_list(&mut self) {
        self.free_head = INVALID_BLOCK_INDEX;
        // Slot 0 is the permanent "invalid" sentinel and is never linked.
        for idx in (1..self.blocks.len() as u16).rev() {
            self.blocks[idx as usize] = CodeBlock::empty();
            self.blocks[idx as usize].flags |= BlockFlags::IN_FREE_LIST;
            self.blocks[idx as usize].next = self.free_head;
            self.free_head = idx;
        }
    }

    /// `codegen_reset`: wipes the cache and every page's metadata.
    pub fn reset(&mut self) {
        log::debug!("code cache reset");
        self.hash.iter_mut().for_each(|h| *h = INVALID_BLOCK_INDEX);
        self.pc_tree.clear();
        self.pages.clear();
        self.dirty_head = INVALID_BLOCK_INDEX;
        self.dirty_tail = INVALID_BLOCK_INDEX;
        self.dirty_len = 0;
        self.rebuild_free_list();
    }

    #[inline]
    pub fn block(&self, idx: u16) -> &CodeBlock {
        &self.blocks[idx as usize]
    }

    #[inline]
    pub fn block_mut(&mut self, idx: u16) -> &mut CodeBlock {
        &mut self.blocks[idx as usize]
    }

    pub fn hash_lookup(&self, phys: u32) -> Option<u16> {
        let idx = self.hash[hash_of(phys)];
        (idx != INVALID_BLOCK_INDEX).then_some(idx)
    }

    pub fn pc_lookup(&self, pc: u32) -> Option<u16> {
        self.pc_tree.get(&pc).copied()
    }

    /// `codegen_block_init`: begins a block at `phys`/`pc`, invoking the
    /// eviction cascade if the free list is empty. `current` is excluded
    /// from random eviction (the block presently executing, if any).
    pub fn block_init(&mut self, phys: u32, pc: u32, status: CpuStatus, current: u16) -> Result<u16, DynarecError> {
        let idx = self.allocate_slot(current)?;
        self.blocks[idx as usize].reset_for_init(pc, phys, status);

        let old = self.hash[hash_of(phys)];
        if old != INVALID_BLOCK_INDEX && old != idx {
            log::debug!("hash collision at {:#x}: slot {} replaces {}", phys, idx, old);
        }
        self.hash[hash_of(phys)] = idx;
        self.pc_tree.insert(pc, idx);
        Ok(idx)
    }

    fn allocate_slot(&mut self, current: u16) -> Result<u16, DynarecError> {
        if self.free_head != INVALID_BLOCK_INDEX {
            let idx = self.free_head;
            self.free_head = self.blocks[idx as usize].next;
            self.blocks[idx as usize].flags.remove(BlockFlags::IN_FREE_LIST);
            return Ok(idx);
        }

        if self.dirty_tail != INVALID_BLOCK_INDEX {
            let idx = self.dirty_tail;
            self.unlink_dirty(idx);
            log::debug!("reusing dirty-list tail slot {} for new block", idx);
            return Ok(idx);
        }

        if let Some(page_no) = self.pages.iter().find(|(_, p)| p.is_purgable()).map(|(&k, _)| k) {
            log::debug!("purging page {:#x} to free a block slot", page_no);
            crate::smc::flush_page(self, page_no, u64::MAX);
            if self.free_head != INVALID_BLOCK_INDEX {
                return self.allocate_slot(current);
            }
        }

        let total = self.blocks.len() as u16;
        let start = self.rng.gen_range(1..total);
        for step in 0..total {
            let idx = 1 + (start + step - 1) % (total - 1);
            if idx != current && !self.blocks[idx as usize].is_free() {
                log::warn!("code cache exhausted: evicting random slot {}", idx);
                self.retire_block(idx);
                return Ok(idx);
            }
        }

        Err(DynarecError::CacheExhausted)
    }

    fn push_free(&mut self, idx: u16) {
        let slot = &mut self.blocks[idx as usize];
        slot.compiled = None;
        slot.flags |= BlockFlags::IN_FREE_LIST;
        slot.next = self.free_head;
        self.free_head = idx;
    }

    fn push_dirty(&mut self, idx: u16) {
        {
            let slot = &mut self.blocks[idx as usize];
            slot.flags |= BlockFlags::IN_DIRTY_LIST;
            slot.prev = INVALID_BLOCK_INDEX;
            slot.next = self.dirty_head;
        }
        if self.dirty_head != INVALID_BLOCK_INDEX {
            self.blocks[self.dirty_head as usize].prev = idx;
        }
        self.dirty_head = idx;
        if self.dirty_tail == INVALID_BLOCK_INDEX {
            self.dirty_tail = idx;
        }
        self.dirty_len += 1;

        if self.dirty_len > DIRTY_LIST_MAX {
            let evict = self.dirty_tail;
            self.unlink_dirty(evict);
            self.push_free(evict);
        }
    }

    fn unlink_dirty(&mut self, idx: u16) {
        let (prev, next) = {
            let slot = &mut self.blocks[idx as usize];
            slot.flags.remove(BlockFlags::IN_DIRTY_LIST);
            (slot.prev, slot.next)
        };
        if prev != INVALID_BLOCK_INDEX {
            self.blocks[prev as usize].next = next;
        } else {
            self.dirty_head = next;
        }
        if next != INVALID_BLOCK_INDEX {
            self.blocks[next as usize].prev = prev;
        } else {
            self.dirty_tail = prev;
        }
        self.dirty_len = self.dirty_len.saturating_sub(1);
    }

    /// `codegen_delete_block`: explicit removal. Unlinks from hash, tree,
    /// and both page lists; releases the compiled IR; returns the slot to
    /// the free list.
    pub fn delete_block(&mut self, idx: u16) {
        self.unlink_from_pages(idx);
        let pc = self.blocks[idx as usize].pc;
        let phys = self.blocks[idx as usize].phys;
        self.pc_tree.remove(&pc);
        if self.hash[hash_of(phys)] == idx {
            self.hash[hash_of(phys)] = INVALID_BLOCK_INDEX;
        }
        self.push_free(idx);
    }

    /// SMC invalidation path: unlink from page lists and hash/tree like
    /// [`Self::delete_block`], but move to the dirty-list rather than the
    /// free list, so a lookup already in flight this instruction still
    /// resolves the slot (with its compiled code already released).
    pub fn retire_block(&mut self, idx: u16) {
        self.unlink_from_pages(idx);
        let phys = self.blocks[idx as usize].phys;
        if self.hash[hash_of(phys)] == idx {
            self.hash[hash_of(phys)] = INVALID_BLOCK_INDEX;
        }
        self.blocks[idx as usize].compiled = None;
        self.push_dirty(idx);
    }

    fn unlink_from_pages(&mut self, idx: u16) {
        let (phys_page, phys_page2, has_second) = {
            let b = &self.blocks[idx as usize];
            (b.phys_page(), b.phys_page2(), b.flags.contains(BlockFlags::HAS_SECOND_PAGE))
        };
        self.unlink_from_page_list(idx, phys_page, false);
        if has_second {
            self.unlink_from_page_list(idx, phys_page2, true);
        }
    }

    fn unlink_from_page_list(&mut self, idx: u16, page_no: u32, second: bool) {
        let (prev, next) = {
            let b = &self.blocks[idx as usize];
            if second { (b.prev_2, b.next_2) } else { (b.prev, b.next) }
        };
        if prev != INVALID_BLOCK_INDEX {
            let p = &mut self.blocks[prev as usize];
            if second {
                p.next_2 = next;
            } else {
                p.next = next;
            }
        } else if let Some(page) = self.pages.get_mut(&page_no) {
            if second {
                page.block2_head = next;
            } else {
                page.block_head = next;
            }
        }
        if next != INVALID_BLOCK_INDEX {
            let n = &mut self.blocks[next as usize];
            if second {
                n.prev_2 = prev;
            } else {
                n.prev = prev;
            }
        }
        self.recompute_purgable(page_no);
    }

    fn page_mut(&mut self, page_no: u32) -> &mut PageMetadata {
        self.pages.entry(page_no).or_insert_with(PageMetadata::new)
    }

    /// `codegen_mark_code_present`: decoder hook recording that `block`
    /// read `len` bytes starting at `addr` (a guest physical address);
    /// ORs the touched region into the owning page's `code_present_mask`
    /// and the block's own `page_mask`/`page_mask2`.
    pub fn mark_code_present(&mut self, idx: u16, addr: u32, len: u32) {
        let page_no = addr >> 12;
        let offset = addr & (PAGE_SIZE - 1);
        let mask = page::range_mask(offset, len);
        let byte_mode = self.blocks[idx as usize].flags.contains(BlockFlags::BYTE_MASK_MODE);

        let first_page = self.blocks[idx as usize].phys_page();
        let on_first_page = page_no == first_page;

        {
            let page = self.page_mut(page_no);
            page.code_present_mask |= mask;
            if byte_mode {
                page::set_byte_range(&mut page.byte_code_present, offset, len);
            }
        }
        self.recompute_purgable(page_no);

        let b = &mut self.blocks[idx as usize];
        if on_first_page {
            b.page_mask |= mask;
        } else {
            b.phys_2 = addr;
            b.page_mask2 |= mask;
            b.flags |= BlockFlags::HAS_SECOND_PAGE;
        }
    }

    /// `block_end_recompile`'s page-list registration step: links the
    /// finalised block into its first (and, if
    /// [`BlockFlags::HAS_SECOND_PAGE`] is set, second) page's block list.
    pub fn link_into_pages(&mut self, idx: u16) {
        let first_page = self.blocks[idx as usize].phys_page();
        self.link_into_page_list(idx, first_page, false);

        if self.blocks[idx as usize].flags.contains(BlockFlags::HAS_SECOND_PAGE) {
            let second_page = self.blocks[idx as usize].phys_page2();
            self.link_into_page_list(idx, second_page, true);
        }
    }

    fn link_into_page_list(&mut self, idx: u16, page_no: u32, second: bool) {
        let head = {
            let page = self.page_mut(page_no);
            if second { page.block2_head } else { page.block_head }
        };
        {
            let b = &mut self.blocks[idx as usize];
            if second {
                b.prev_2 = INVALID_BLOCK_INDEX;
                b.next_2 = head;
            } else {
                b.prev = INVALID_BLOCK_INDEX;
                b.next = head;
            }
        }
        if head != INVALID_BLOCK_INDEX {
            let h = &mut self.blocks[head as usize];
            if second {
                h.prev_2 = idx;
            } else {
                h.prev = idx;
            }
        }
        let page = self.page_mut(page_no);
        if second {
            page.block2_head = idx;
        } else {
            page.block_head = idx;
        }
    }

    fn recompute_purgable(&mut self, page_no: u32) {
        // `is_purgable` is recomputed on demand from the two masks
        // directly (see `allocate_slot`); nothing to cache here, but
        // dropping an empty page keeps the map from growing unbounded.
        if let Some(page) = self.pages.get(&page_no) {
            if page.is_empty_of_blocks() && page.code_present_mask == 0 && page.dirty_mask == 0 {
                self.pages.remove(&page_no);
            }
        }
    }

    pub(crate) fn page(&self, page_no: u32) -> Option<&PageMetadata> {
        self.pages.get(&page_no)
    }

    pub(crate) fn page_mut_pub(&mut self, page_no: u32) -> &mut PageMetadata {
        self.page_mut(page_no)
    }

    pub(crate) fn blocks_on_page(&self, page_no: u32) -> (u16, u16) {
        self.pages.get(&page_no).map_or((INVALID_BLOCK_INDEX, INVALID_BLOCK_INDEX), |p| (p.block_head, p.block2_head))
    }
}

impl Default for CodeCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu_state::CpuStatus;

    #[test]
    fn block_init_populates_hash_and_tree() {
        let mut cache = CodeCache::new();
        let idx = cache.block_init(0x1000, 0xc000_1000, CpuStatus::empty(), INVALID_BLOCK_INDEX).unwrap();
        assert_eq!(cache.hash_lookup(0x1000), Some(idx));
        assert_eq!(cache.pc_lookup(0xc000_1000), Some(idx));
    }

    #[test]
    fn free_list_is_exhausted_then_reused_from_dirty() {
        let mut cache = CodeCache::new();
        let mut issued = Vec::new();
        for i in 0..BLOCK_POOL_SIZE as u32 - 1 {
            issued.push(cache.block_init(i * 0x1000, i, CpuStatus::empty(), INVALID_BLOCK_INDEX).unwrap());
        }
        // Retire one so the dirty list has an entry the next allocation
        // can reuse once the free list is fully drained.
        cache.retire_block(issued[0]);
        let reused = cache.block_init(0xffff_f000, 0xffff_ffff, CpuStatus::empty(), INVALID_BLOCK_INDEX).unwrap();
        assert_eq!(reused, issued[0]);
    }

    #[test]
    fn delete_block_frees_the_slot_for_reuse() {
        let mut cache = CodeCache::new();
        let idx = cache.block_init(0x2000, 1, CpuStatus::empty(), INVALID_BLOCK_INDEX).unwrap();
        cache.delete_block(idx);
        assert_eq!(cache.hash_lookup(0x2000), None);
        let reissued = cache.block_init(0x3000, 2, CpuStatus::empty(), INVALID_BLOCK_INDEX).unwrap();
        assert_eq!(reissued, idx);
    }

    #[test]
    fn mark_code_present_updates_page_and_block_masks() {
        let mut cache = CodeCache::new();
        let idx = cache.block_init(0x4000, 3, CpuStatus::empty(), INVALID_BLOCK_INDEX).unwrap();
        cache.mark_code_present(idx, 0x4000, 4);
        assert_eq!(cache.block(idx).page_mask, 0b1);
        assert_eq!(cache.page(4).unwrap().code_present_mask, 0b1);
    }
}
