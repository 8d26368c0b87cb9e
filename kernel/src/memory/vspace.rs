//! Address-space manager.
//!
//! Installs, updates, and tears down virtual-to-physical mappings in a
//! two-level page table held in simulated RAM. The refcount discipline
//! lives here: `page_insert` bumps the frame's count *before* removing any
//! old mapping at the address, so re-inserting the same frame at the same
//! address is idempotent; `page_remove` drops the count, which returns the
//! frame to the free list at zero. Any mutation of the active space
//! invalidates the affected TLB page.

use crate::config::{NPDENTRIES, ULIM, UTOP};
use crate::error::KernelError;
use crate::machine::mmu::{self, Pte};
use crate::memory::address::{Pfn, PhysAddr, VirtAddr};
use crate::objects::env::EnvId;
use crate::Kernel;

impl Kernel {
    /// Take a frame from the allocator, optionally zeroing its contents.
    /// The frame comes back with refcount zero.
    pub(crate) fn page_alloc_frame(&mut self, zero: bool) -> Result<Pfn, KernelError> {
        let pfn = self.frames.alloc().ok_or(KernelError::NoMem)?;
        if zero {
            self.machine.ram.zero_frame(pfn);
        }
        Ok(pfn)
    }

    /// Find the leaf slot for `va`, creating the second-level table on
    /// demand when `create` is set. Returns `None` when the table is absent
    /// and `create` is not set.
    pub(crate) fn pgdir_walk(
        &mut self,
        pgdir: Pfn,
        va: VirtAddr,
        create: bool,
    ) -> Result<Option<PhysAddr>, KernelError> {
        let pde_pa = pgdir.phys_addr().add(4 * va.pdx() as u32);
        let pde = self.machine.ram.read_u32(pde_pa);
        let table = if mmu::entry_flags(pde).contains(Pte::P) {
            mmu::entry_addr(pde)
        } else {
            if !create {
                return Ok(None);
            }
            let table = self.page_alloc_frame(true)?;
            self.frames.incref(table);
            // Directory-level permissions are permissive; the leaf entry is
            // what actually gates access.
            self.machine
                .ram
                .write_u32(pde_pa, mmu::make_entry(table.phys_addr(), Pte::P | Pte::W | Pte::U));
            table.phys_addr()
        };
        Ok(Some(table.add(4 * va.ptx() as u32)))
    }

    /// Map `pfn` at `va` with `perm | P`, replacing any previous mapping.
    pub(crate) fn page_insert(
        &mut self,
        pgdir: Pfn,
        pfn: Pfn,
        va: VirtAddr,
        perm: Pte,
    ) -> Result<(), KernelError> {
        let slot = self
            .pgdir_walk(pgdir, va, true)?
            .expect("walk with create cannot be absent");

        // Bump before removing: inserting the frame over itself must not
        // drop the count to zero in between.
        self.frames.incref(pfn);

        let old = self.machine.ram.read_u32(slot);
        if mmu::entry_flags(old).contains(Pte::P) {
            self.frames.decref(mmu::entry_addr(old).pfn());
        }
        self.machine
            .ram
            .write_u32(slot, mmu::make_entry(pfn.phys_addr(), perm | Pte::P));
        self.tlb_invalidate(pgdir, va);
        Ok(())
    }

    /// Current mapping of `va`, if present.
    pub(crate) fn page_lookup(&self, pgdir: Pfn, va: VirtAddr) -> Option<(Pfn, Pte)> {
        let t = mmu::probe(&self.machine.ram, pgdir.phys_addr(), va)?;
        let flags = mmu::entry_flags(t.pte);
        if !flags.contains(Pte::P) {
            return None;
        }
        Some((mmu::entry_addr(t.pte).pfn(), flags))
    }

    /// Remove the mapping at `va`, if any. Silent when nothing is mapped.
    pub(crate) fn page_remove(&mut self, pgdir: Pfn, va: VirtAddr) {
        let Some(t) = mmu::probe(&self.machine.ram, pgdir.phys_addr(), va) else {
            return;
        };
        if !mmu::entry_flags(t.pte).contains(Pte::P) {
            return;
        }
        self.frames.decref(mmu::entry_addr(t.pte).pfn());
        self.machine.ram.write_u32(t.pte_pa, 0);
        self.tlb_invalidate(pgdir, va);
    }

    /// Drop the cached translation if the mutation hit the active space.
    pub(crate) fn tlb_invalidate(&mut self, pgdir: Pfn, va: VirtAddr) {
        if self.cr3 == Some(pgdir) {
            self.machine.tlb.invlpg(va);
        }
    }

    /// Check that `[va, va+len)` is readable by `env` with permissions
    /// `perm` (in addition to present). Returns the first failing address.
    pub(crate) fn user_mem_check(
        &self,
        slot: usize,
        va: VirtAddr,
        len: u32,
        perm: Pte,
    ) -> Result<(), VirtAddr> {
        if len == 0 {
            return Ok(());
        }
        let pgdir = self.envs[slot].pgdir;
        let end = va.as_u32().checked_add(len).ok_or(va)?;
        let mut page = va.page_base();
        loop {
            let fail_at = if page.as_u32() < va.as_u32() { va } else { page };
            if page.as_u32() >= ULIM {
                return Err(fail_at);
            }
            match self.page_lookup(pgdir, page) {
                Some((_, flags)) if flags.contains(perm | Pte::P) => {}
                _ => return Err(fail_at),
            }
            let Some(next) = page.as_u32().checked_add(crate::config::PGSIZE) else {
                break;
            };
            if next >= end {
                break;
            }
            page = VirtAddr::new(next);
        }
        Ok(())
    }

    /// Like `user_mem_check`, but a failure destroys the environment - the
    /// kernel never dereferences a bad user pointer on an env's behalf.
    pub(crate) fn user_mem_assert(
        &mut self,
        slot: usize,
        va: VirtAddr,
        len: u32,
        perm: Pte,
    ) -> Result<(), KernelError> {
        if let Err(bad) = self.user_mem_check(slot, va, len, perm) {
            log::warn!(
                "env {} bad memory access at {} (checking {} + {:#x})",
                self.envs[slot].id,
                bad,
                va,
                len
            );
            self.env_destroy(slot);
            return Err(KernelError::Unspecified);
        }
        Ok(())
    }

    /// Debug view of a mapping in an environment's space.
    pub fn va_mapping(&self, id: EnvId, va: VirtAddr) -> Option<(Pfn, Pte)> {
        let slot = if id == EnvId::CURRENT {
            self.curenv?
        } else {
            id.slot()
        };
        if self.envs[slot].status == crate::objects::env::EnvStatus::Free {
            return None;
        }
        self.page_lookup(self.envs[slot].pgdir, va)
    }

    /// Frame reference count, for invariant checks.
    pub fn frame_refcount(&self, pfn: Pfn) -> u16 {
        self.frames.refcount(pfn)
    }

    /// Number of free physical frames.
    pub fn free_frame_count(&self) -> usize {
        self.frames.free_count()
    }

    /// Walk every environment's user half and count references to `pfn`
    /// from leaf entries and from page-directory slots. Used by the
    /// refcount-soundness property test.
    pub fn count_user_references(&self, pfn: Pfn) -> usize {
        let mut count = 0;
        for env in &self.envs {
            if matches!(env.status, crate::objects::env::EnvStatus::Free) {
                continue;
            }
            let pa = env.pgdir.phys_addr();
            if env.pgdir == pfn {
                count += 1; // pinned at creation
            }
            for pdx in 0..VirtAddr::new(UTOP).pdx() {
                let pde = self.machine.ram.read_u32(pa.add(4 * pdx as u32));
                if !mmu::entry_flags(pde).contains(Pte::P) {
                    continue;
                }
                if mmu::entry_addr(pde).pfn() == pfn {
                    count += 1;
                }
                let table = mmu::entry_addr(pde);
                for ptx in 0..NPDENTRIES as usize {
                    let pte = self.machine.ram.read_u32(table.add(4 * ptx as u32));
                    if mmu::entry_flags(pte).contains(Pte::P) && mmu::entry_addr(pte).pfn() == pfn
                    {
                        count += 1;
                    }
                }
            }
        }
        count
    }
}
