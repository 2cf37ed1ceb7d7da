// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The virtual register file: SSA-style versioning over [`RegId`], the
//! version dead-list, and the two symbolic host-register banks.

use crate::error::{BlockEndReason, DynarecError};
use crate::ir::{Barrier, IrReg};
use crate::limits::{REG_REFCOUNT_MAX, REG_VERSION_MAX};
use crate::reg::{Domain, LifetimeClass, RegId};

bitflags::bitflags! {
    pub struct VersionFlags: u8 {
        /// A barrier or order-barrier forced this version to be
        /// considered live regardless of refcount; the optimiser must
        /// never eliminate its producer.
        const REQUIRED = 0b01;
        /// Marked by dead-code elimination; the producing uop is invalid.
        const DEAD     = 0b10;
    }
}

/// Per-(id, version) bookkeeping. Indexed by `version` within a
/// per-id `Vec`, so index 0 is the id's initial (block-entry) version.
#[derive(Clone, Copy, Debug)]
struct VersionEntry {
    refcount: u32,
    flags: VersionFlags,
    /// IR buffer index of the micro-op that produced this version. `None`
    /// for version 0, the implicit block-entry value.
    producer: Option<usize>,
}

impl VersionEntry {
    const fn entry_version() -> Self {
        Self { refcount: 0, flags: VersionFlags::REQUIRED, producer: None }
    }

    const fn produced(producer: usize) -> Self {
        Self { refcount: 0, flags: VersionFlags::empty(), producer: Some(producer) }
    }
}

#[derive(Clone, Debug)]
struct IdState {
    versions: Vec<VersionEntry>,
}

impl IdState {
    fn new() -> Self {
        Self { versions: vec![VersionEntry::entry_version()] }
    }

    #[inline]
    fn latest(&self) -> u16 {
        (self.versions.len() - 1) as u16
    }
}

/// One physical host register slot in a [`HostBank`].
#[derive(Clone, Copy, Debug, Default)]
struct HostSlot {
    holds: Option<IrReg>,
    dirty: bool,
    locked: bool,
}

/// A symbolic bank of host registers (integer or float), modelled as a
/// fixed-size array rather than a target-specific register set: the
/// concrete backend maps slot indices onto real machine registers.
#[derive(Clone, Debug)]
pub struct HostBank {
    slots: Vec<HostSlot>,
}

impl HostBank {
    pub fn new(count: usize) -> Self {
        Self { slots: vec![HostSlot::default(); count] }
    }

    pub fn unlock_all(&mut self) {
        for slot in &mut self.slots {
            slot.locked = false;
        }
    }

    pub fn find_holder(&self, reg: IrReg) -> Option<u8> {
        self.slots
            .iter()
            .position(|slot| slot.holds == Some(reg))
            .map(|i| i as u8)
    }

    /// Marks `reg`'s holder (if resident) evicted without writeback,
    /// e.g. because a write just renamed the version.
    pub fn drop_binding(&mut self, reg: IrReg) {
        if let Some(slot) = self.slots.iter_mut().find(|s| s.holds == Some(reg)) {
            slot.holds = None;
            slot.dirty = false;
        }
    }

    pub fn bind(&mut self, host: u8, reg: IrReg, dirty: bool) {
        let slot = &mut self.slots[host as usize];
        slot.holds = Some(reg);
        slot.dirty = dirty;
        slot.locked = true;
    }

    pub fn lock(&mut self, host: u8) {
        self.slots[host as usize].locked = true;
    }

    /// Selects a slot to bind a fresh value into, in the order the spec
    /// describes: last-writer-wins LRU among unlocked refcount-0 slots,
    /// then any unlocked slot (evicting a dirty holder's value is the
    /// caller's job via [`Self::take_eviction`]), then fatal exhaustion.
    pub fn select_victim(&self, refcount_zero: impl Fn(IrReg) -> bool) -> Option<u8> {
        if let Some(i) = self
            .slots
            .iter()
            .position(|s| !s.locked && s.holds.map_or(true, &refcount_zero))
        {
            return Some(i as u8);
        }
        self.slots.iter().position(|s| !s.locked).map(|i| i as u8)
    }

    /// If the slot about to be reused holds a dirty value, returns it so
    /// the caller can spill it before rebinding.
    pub fn take_eviction(&mut self, host: u8) -> Option<IrReg> {
        let slot = &mut self.slots[host as usize];
        if slot.dirty {
            slot.holds
        } else {
            None
        }
    }

    pub fn invalidate_all(&mut self) {
        for slot in &mut self.slots {
            slot.holds = None;
            slot.dirty = false;
        }
    }

    /// Collects every currently bound, dirty register: the caller must
    /// write each back to guest/process state before clearing them.
    pub fn dirty_bindings(&self) -> Vec<(u8, IrReg)> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.dirty)
            .filter_map(|(i, s)| s.holds.map(|r| (i as u8, r)))
            .collect()
    }
}

/// Reads a version's pending-read refcount straight out of the id table,
/// for use inside [`RegFile::allocate_read`]/[`RegFile::allocate_write`]
/// where a bank is already borrowed mutably: a free function keeps the
/// two borrows (the id table, one bank) disjoint at the field level.
fn version_refcount_raw(ids: &[IdState], id: RegId, version: u16) -> u32 {
    ids[id as usize].versions[version as usize].refcount
}

/// The register file for one block under compilation: per-id version
/// tables, the dead-list, and the two host-register banks.
///
/// One-to-one with the globals the original threads through file-scope
/// tables (`reg_last_version`, `reg_version[id][version]`); here they are
/// owned by a value threaded through the emitters, per the "global
/// mutable state" design note.
#[derive(Clone, Debug)]
pub struct RegFile {
    ids: Vec<IdState>,
    dead_list: Vec<(RegId, u16)>,
    pub integer_bank: HostBank,
    pub float_bank: HostBank,
}

/// Number of symbolic slots modelled in each bank. Arbitrary but generous
/// relative to the guest GPR count; a concrete backend narrows this to
/// its real register count when lowering.
const INTEGER_BANK_SLOTS: usize = 14;
const FLOAT_BANK_SLOTS: usize = 8;

impl RegFile {
    pub fn new() -> Self {
        Self {
            ids: (0..RegId::COUNT).map(|_| IdState::new()).collect(),
            dead_list: Vec::new(),
            integer_bank: HostBank::new(INTEGER_BANK_SLOTS),
            float_bank: HostBank::new(FLOAT_BANK_SLOTS),
        }
    }

    #[inline]
    fn state(&self, id: RegId) -> &IdState {
        &self.ids[id as usize]
    }

    #[inline]
    fn state_mut(&mut self, id: RegId) -> &mut IdState {
        &mut self.ids[id as usize]
    }

    /// Reads the current version of `id`, incrementing its refcount.
    pub fn read(&mut self, id: RegId) -> IrReg {
        let version = self.state(id).latest();
        let entry = &mut self.state_mut(id).versions[version as usize];
        entry.refcount += 1;
        IrReg::new(id, version)
    }

    /// Allocates a new version of `id` produced by `producer_uop`. If the
    /// predecessor version ends up with refcount 0 and is not `REQUIRED`,
    /// it is pushed onto the dead-list. Returns `Err` if either cap in
    /// [`crate::limits`] would be exceeded; the caller must end the block
    /// without emitting this write.
    pub fn write(&mut self, id: RegId, producer_uop: usize) -> Result<IrReg, BlockEndReason> {
        let new_version = self.state(id).latest() + 1;
        if new_version >= REG_VERSION_MAX {
            return Err(BlockEndReason::RegisterLimit);
        }

        let prev_version = self.state(id).latest();
        let prev_dead = {
            let prev = &self.state(id).versions[prev_version as usize];
            prev.refcount == 0 && !prev.flags.contains(VersionFlags::REQUIRED)
        };
        if prev_dead {
            self.dead_list.push((id, prev_version));
        }

        self.integer_bank.drop_binding(IrReg::new(id, prev_version));
        self.float_bank.drop_binding(IrReg::new(id, prev_version));

        self.state_mut(id).versions.push(VersionEntry::produced(producer_uop));
        Ok(IrReg::new(id, new_version))
    }

    /// Guards a write before it happens: `true` if either cap would be
    /// exceeded by allocating one more version or one more reference.
    pub fn would_exceed_limits(&self, id: RegId) -> bool {
        let state = self.state(id);
        if state.latest() + 1 >= REG_VERSION_MAX {
            return true;
        }
        let current = &state.versions[state.latest() as usize];
        current.refcount + 1 >= REG_REFCOUNT_MAX
    }

    /// Marks every permanent register's current version `REQUIRED`,
    /// called at emission time for any barrier or order-barrier micro-op
    /// per the catalogue invariant.
    pub fn mark_permanent_required(&mut self, barrier: Barrier) {
        if !barrier.flushes() {
            return;
        }
        for id in RegId::ALL {
            if id.lifetime() == LifetimeClass::Permanent {
                let latest = self.state(id).latest();
                self.state_mut(id).versions[latest as usize].flags |= VersionFlags::REQUIRED;
            }
        }
    }

    /// Flushes (writes back) every dirty host binding; if `invalidate` is
    /// set (a full barrier) the banks are also cleared so later reads
    /// must reload from process state.
    pub fn flush(&mut self, invalidate: bool) -> Vec<(Domain, u8, IrReg)> {
        let mut writebacks = Vec::new();
        for (host, reg) in self.integer_bank.dirty_bindings() {
            writebacks.push((Domain::Integer, host, reg));
        }
        for (host, reg) in self.float_bank.dirty_bindings() {
            writebacks.push((Domain::Float, host, reg));
        }
        if invalidate {
            self.integer_bank.invalidate_all();
            self.float_bank.invalidate_all();
        }
        writebacks
    }

    /// Pops one candidate off the dead-list, for the optimiser's
    /// worklist loop. Popping does not itself invalidate anything: the
    /// caller must still check [`Self::version_required`] and
    /// [`Self::version_is_dead`].
    pub fn pop_dead(&mut self) -> Option<(RegId, u16)> {
        self.dead_list.pop()
    }

    pub fn version_required(&self, id: RegId, version: u16) -> bool {
        self.state(id).versions[version as usize].flags.contains(VersionFlags::REQUIRED)
    }

    pub fn version_is_dead(&self, id: RegId, version: u16) -> bool {
        self.state(id).versions[version as usize].flags.contains(VersionFlags::DEAD)
    }

    pub fn version_producer(&self, id: RegId, version: u16) -> Option<usize> {
        self.state(id).versions[version as usize].producer
    }

    /// Current pending-read count for `(id, version)`, used by the
    /// peephole MOV-rename check: a source with at most one remaining
    /// reader (the move itself) can be renamed instead of copied.
    pub fn version_refcount(&self, id: RegId, version: u16) -> u32 {
        self.state(id).versions[version as usize].refcount
    }

    /// Marks a version `DEAD`: its producer is being invalidated by the
    /// optimiser and must never be revisited.
    pub fn mark_version_dead(&mut self, id: RegId, version: u16) {
        self.state_mut(id).versions[version as usize].flags |= VersionFlags::DEAD;
    }

    /// Binds a source to a host slot for this uop, implementing §4.3's
    /// selection order: reuse the slot already holding it, else
    /// last-writer-wins LRU among unlocked refcount-0 slots, else any
    /// unlocked slot (returning its dirty value for the caller to spill
    /// first). The returned host is locked so a later allocation in the
    /// same uop cannot steal it back out from under an earlier operand.
    pub fn allocate_read(&mut self, reg: IrReg) -> Result<(u8, Option<(Domain, u8, IrReg)>), DynarecError> {
        let domain = reg.id.domain();
        let ids = &self.ids;
        let bank = match domain {
            Domain::Integer => &mut self.integer_bank,
            Domain::Float => &mut self.float_bank,
        };

        if let Some(host) = bank.find_holder(reg) {
            bank.lock(host);
            self.release_source(reg);
            return Ok((host, None));
        }

        let host = bank
            .select_victim(|r| version_refcount_raw(ids, r.id, r.version) == 0)
            .ok_or(DynarecError::HostRegisterExhausted(reg.id))?;
        let evicted = bank.take_eviction(host).map(|r| (domain, host, r));
        bank.bind(host, reg, false);
        self.release_source(reg);
        Ok((host, evicted))
    }

    /// Binds a fresh destination to a host slot, always marking it dirty:
    /// a write is only observable once flushed back to process state.
    /// Selection follows the same order as [`Self::allocate_read`].
    pub fn allocate_write(&mut self, reg: IrReg) -> Result<(u8, Option<(Domain, u8, IrReg)>), DynarecError> {
        let domain = reg.id.domain();
        let ids = &self.ids;
        let bank = match domain {
            Domain::Integer => &mut self.integer_bank,
            Domain::Float => &mut self.float_bank,
        };

        let host = bank
            .select_victim(|r| version_refcount_raw(ids, r.id, r.version) == 0)
            .ok_or(DynarecError::HostRegisterExhausted(reg.id))?;
        let evicted = bank.take_eviction(host).map(|r| (domain, host, r));
        bank.bind(host, reg, true);
        Ok((host, evicted))
    }

    /// Peephole MOV-rename support: hands `src`'s host slot over to
    /// `dest` without a move, marking it dirty. A no-op on the bank side
    /// if `src` was never resident (e.g. it was flushed in the meantime);
    /// `src`'s pending read is always released either way.
    pub fn rename_binding(&mut self, src: IrReg, dest: IrReg) {
        let domain = src.id.domain();
        let bank = match domain {
            Domain::Integer => &mut self.integer_bank,
            Domain::Float => &mut self.float_bank,
        };
        if let Some(host) = bank.find_holder(src) {
            bank.drop_binding(src);
            bank.bind(host, dest, true);
        }
        self.release_source(src);
    }

    /// Clears both banks' per-uop locks, called once at the start of
    /// processing each surviving micro-op.
    pub fn unlock_all_banks(&mut self) {
        self.integer_bank.unlock_all();
        self.float_bank.unlock_all();
    }

    /// Decrements a source's refcount outside of dead-list draining (the
    /// normal path after a read is consumed by register allocation).
    pub fn release_source(&mut self, reg: IrReg) {
        let entry = &mut self.state_mut(reg.id).versions[reg.version as usize];
        debug_assert!(entry.refcount > 0, "refcount underflow for {:?}", reg.id);
        if entry.refcount > 0 {
            entry.refcount -= 1;
            if entry.refcount == 0 && !entry.flags.contains(VersionFlags::REQUIRED) {
                self.dead_list.push((reg.id, reg.version));
            }
        }
    }
}

impl Default for RegFile {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_then_write_bumps_version() {
        let mut rf = RegFile::new();
        let r0 = rf.read(RegId::Eax);
        assert_eq!(r0.version, 0);
        let r1 = rf.write(RegId::Eax, 0).unwrap();
        assert_eq!(r1.version, 1);
        assert!(r1.version > r0.version);
    }

    #[test]
    fn version_cap_ends_block() {
        let mut rf = RegFile::new();
        for _ in 0..(REG_VERSION_MAX - 1) {
            rf.write(RegId::Eax, 0).unwrap();
        }
        assert!(matches!(rf.write(RegId::Eax, 0), Err(BlockEndReason::RegisterLimit)));
    }

    #[test]
    fn volatile_zero_refcount_goes_dead() {
        let mut rf = RegFile::new();
        rf.read(RegId::Temp0);
        rf.release_source(IrReg::new(RegId::Temp0, 0));
        assert_eq!(rf.dead_list.last(), Some(&(RegId::Temp0, 0)));
    }

    #[test]
    fn permanent_register_marked_required_on_barrier() {
        let mut rf = RegFile::new();
        rf.mark_permanent_required(Barrier::Full);
        let entry = &rf.state(RegId::Eax).versions[0];
        assert!(entry.flags.contains(VersionFlags::REQUIRED));
    }
}
